use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AtariError {
    #[error("log file not found: {0}")]
    LogNotFound(PathBuf),

    #[error("log file is empty: {0}")]
    LogEmpty(PathBuf),

    #[error("assistant slot is busy (held by {0})")]
    Busy(String),

    #[error("broker acquire timed out after {0:?}")]
    BrokerTimeout(Duration),

    #[error("query timed out after {0:?}")]
    QueryTimeout(Duration),

    #[error("no drain activity to answer questions about")]
    NoContext,

    #[error("cancelled")]
    Cancelled,

    #[error("required binary not found on PATH: {0}")]
    BinaryNotFound(String),

    #[error("issue tracker command failed: {0}")]
    Tracker(String),

    #[error(transparent)]
    Driver(#[from] claude_driver::DriverError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, AtariError>;
