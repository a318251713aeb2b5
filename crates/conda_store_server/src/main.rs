use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};

use conda_store_server::worker::{self, reaper, Worker};
use conda_store_server::{CondaStore, Settings};

/// How often the reaper sweeps for stuck builds.
const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// The conda-store server CLI.
#[derive(Parser)]
#[command(version, about = "multi-tenant conda environment build service", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a build worker: dispatches queued builds and reaps stuck ones.
    Worker,

    /// Cancel a build, reaping it from the queue or from a dead worker.
    Cancel {
        /// The id of the build to cancel.
        #[arg(long)]
        build_id: i64,
    },

    /// Print the effective configuration and the registered plugins.
    Config,
}

fn load_settings(config: Option<&PathBuf>) -> anyhow::Result<Settings> {
    match config {
        Some(path) => Ok(Settings::from_file(path)?),
        None => Ok(Settings::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(cli.verbose.tracing_level_filter())
        .init();

    let settings = load_settings(cli.config.as_ref())?;

    match cli.command {
        Commands::Worker => {
            let db = conda_store_db::connect(&settings.database_url).await?;
            // The worker's task inventory doubles as the broker view the
            // reaper consumes.
            let active = Arc::new(worker::ActiveTasks::default());
            let store = Arc::new(CondaStore::new(settings, active.clone()).await?);
            let (worker, queue) = Worker::new(store.clone(), db.clone(), active);

            tracing::info!("starting conda-store worker");
            let dispatcher = tokio::spawn(worker::run_dispatcher(db.clone(), queue));
            let reaper_task = tokio::spawn(worker::run_reaper(
                db.clone(),
                store.clone(),
                REAPER_INTERVAL,
            ));
            worker.run().await;
            dispatcher.abort();
            reaper_task.abort();
            Ok(())
        }
        Commands::Cancel { build_id } => {
            let db = conda_store_db::connect(&settings.database_url).await?;
            let active = Arc::new(worker::ActiveTasks::default());
            let store = Arc::new(CondaStore::new(settings, active).await?);
            reaper::build_cleanup(&db, &store, Some(vec![build_id]), None, true).await?;
            tracing::info!(build_id, "cancel sweep finished");
            Ok(())
        }
        Commands::Config => {
            let active = Arc::new(worker::ActiveTasks::default());
            let store = Arc::new(CondaStore::new(settings, active).await?);
            println!("{}", toml::to_string_pretty(&store.settings)?);
            println!("# storage plugins: {:?}", store.registry.storage_names());
            for description in store.registry.config_descriptions() {
                println!("\n# [{}] {}", description.name, description.synopsis);
                for field in &description.fields {
                    println!("#   {} = {}  ({})", field.name, field.default, field.help);
                }
            }
            Ok(())
        }
    }
}
