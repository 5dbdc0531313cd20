use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
