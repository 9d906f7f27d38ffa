use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The TOML file or environment overrides could not be merged/extracted.
    #[error("Configuration error: {0}")]
    Load(String),

    /// The merged configuration is well-formed but semantically invalid.
    #[error("Invalid configuration: {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;
