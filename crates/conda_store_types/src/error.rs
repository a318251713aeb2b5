use thiserror::Error;

/// Errors produced while validating a user submitted specification. All of
/// these are safe to surface to the submitting user.
#[derive(Debug, Error)]
pub enum SpecificationError {
    /// The submitted document does not match the expected schema.
    #[error("invalid specification: {reason}")]
    InvalidSpecification { reason: String },

    /// A name does not match the allowed character set.
    #[error("name '{name}' is not valid, must match [{}]+", crate::ALLOWED_CHARACTERS)]
    InvalidName { name: String },

    /// Channels outside of the configured allowed set were requested.
    #[error("conda channels {channels:?} not allowed in specification")]
    ChannelNotAllowed { channels: Vec<String> },

    /// Packages declared as required by policy are missing.
    #[error("packages {packages:?} required and missing from specification")]
    PackageRequired { packages: Vec<String> },
}
