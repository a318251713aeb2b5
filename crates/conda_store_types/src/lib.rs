//! Typed environment specifications for conda-store.
//!
//! A [`Specification`] is the validated, canonicalized description of an
//! environment a user asked for. Its identity is the SHA-256 of its canonical
//! JSON form, which is what deduplicates identical submissions. The crate also
//! contains the validation pipeline that every submission passes through
//! before it is persisted: structural validation, channel policy, conda
//! package policy and pip package policy.

use once_cell::sync::Lazy;
use regex::Regex;

mod channel;
mod error;
mod platform;
mod policy;
mod specification;

pub use channel::normalize_channel_name;
pub use error::SpecificationError;
pub use platform::current_platform;
pub use policy::{
    apply_channel_policy, apply_conda_package_policy, apply_pip_package_policy,
    conda_package_name, pip_package_name, ChannelPolicy, PackagePolicy,
};
pub use specification::{
    canonical_json, discover_environments, is_environment_file, CondaSpecification, Dependency,
    LockfileSpecification, PipDependencies, Specification,
};

/// The characters allowed in namespace and environment names, as a regex
/// character-class fragment (other classes append wildcards after it, hence
/// the escaped dash).
pub const ALLOWED_CHARACTERS: &str = r"A-Za-z0-9_.\-";

/// Matches a valid namespace or environment name.
pub static NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!("^[{ALLOWED_CHARACTERS}]+$")).expect("valid regex"));

/// Returns `true` when `name` is a valid namespace or environment name.
pub fn is_valid_name(name: &str) -> bool {
    NAME_REGEX.is_match(name)
}
