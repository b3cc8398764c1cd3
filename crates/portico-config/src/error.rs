use std::path::PathBuf;

use portico_common::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl From<&ConfigError> for ErrorCode {
    fn from(e: &ConfigError) -> Self {
        match e {
            ConfigError::Io { .. } => ErrorCode::IoError,
            ConfigError::Parse { .. } | ConfigError::Invalid { .. } => ErrorCode::InvalidPayload,
        }
    }
}
