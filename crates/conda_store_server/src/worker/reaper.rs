//! The stuck-build reaper: reconciles `BUILDING` rows against the broker's
//! live task inventory.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use conda_store_db::api::{self, BuildFilter};
use conda_store_db::entities::{Build, BuildStatus};
use conda_store_db::DbPool;

use crate::error::CondaStoreError;
use crate::store::CondaStore;
use crate::worker::build::append_to_logs;

/// Builds younger than this are left alone; the worker may simply not have
/// registered the task yet.
const SETTLE_WINDOW_SECONDS: i64 = 5;

/// Parses build ids out of broker task names (`build-<id>-<stage>`).
static BUILD_TASK_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^build-(\d+)-(.*)$").expect("valid regex"));

/// Walks builds stuck in `BUILDING` with no live task behind them and
/// transitions them to `FAILED`, or `CANCELED` when invoked as a cancel.
///
/// Builds get stuck when a worker dies out from under them: out of memory
/// kills, container eviction, crashes. With `build_ids` given the sweep is
/// restricted to those builds; otherwise every `BUILDING` row is examined.
pub async fn build_cleanup(
    db: &DbPool,
    store: &CondaStore,
    build_ids: Option<Vec<i64>>,
    reason: Option<String>,
    is_canceled: bool,
) -> Result<(), CondaStoreError> {
    let status = if is_canceled { "CANCELED" } else { "FAILED" };
    let reason = reason.unwrap_or_else(|| {
        format!(
            "\nBuild marked as {status} on cleanup due to being stuck in BUILDING state \
             and not present on workers. This happens for several reasons: build is \
             canceled, a worker crash from out of memory errors, worker was killed, \
             or error in conda-store\n"
        )
    });

    let Some(active_tasks) = store.broker().active_tasks().await else {
        tracing::warn!("build cleanup failed: task broker does not support inspection");
        return Ok(());
    };

    let active_build_ids: HashSet<i64> = active_tasks
        .iter()
        .filter_map(|task| {
            BUILD_TASK_REGEX
                .captures(task)
                .and_then(|captures| captures[1].parse::<i64>().ok())
        })
        .collect();

    let builds: Vec<Build> = match build_ids {
        Some(build_ids) => {
            let mut builds = Vec::new();
            for build_id in build_ids {
                if let Some(build) = api::get_build(db, build_id).await? {
                    builds.push(build);
                }
            }
            builds
        }
        None => {
            api::list_builds(
                db,
                &BuildFilter {
                    status: Some(BuildStatus::Building),
                    ..Default::default()
                },
            )
            .await?
        }
    };

    let settled_before = Utc::now() - Duration::seconds(SETTLE_WINDOW_SECONDS);
    for build in builds {
        let settled = build
            .started_on
            .map_or(true, |started_on| started_on < settled_before);
        if build.status != BuildStatus::Building
            || active_build_ids.contains(&build.id)
            || !settled
        {
            continue;
        }

        tracing::warn!(
            build_id = build.id,
            "marking build as {status} since stuck in BUILDING state and not present on workers"
        );
        if let Some(specification) =
            api::get_specification_by_id(db, build.specification_id).await?
        {
            let _ = append_to_logs(db, store, &build, &specification, &reason).await;
        }
        if is_canceled {
            api::mark_build_canceled(db, build.id, None).await?;
        } else {
            api::mark_build_failed(db, build.id, None).await?;
        }
    }
    Ok(())
}
