use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse stream-json line: {source}\n  line: {line}")]
    Parse {
        /// Offending line, truncated to [`crate::wire::PARSE_PREFIX_LEN`].
        line: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process exited with {0}")]
    Exit(std::process::ExitStatus),

    #[error("process error: {0}")]
    Process(String),
}

impl DriverError {
    /// `true` for parse failures, which callers skip rather than abort on.
    pub fn is_parse(&self) -> bool {
        matches!(self, DriverError::Parse { .. })
    }
}
