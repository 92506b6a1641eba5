//! `claude-driver`: subprocess protocol layer for the `claude` CLI.
//!
//! Implements the `--output-format stream-json` wire protocol as a small
//! library: typed frames, a line parser with forward-compatible skipping,
//! an argument builder, and a process-runner abstraction so everything above
//! it can be tested against mock subprocesses.
//!
//! # Architecture
//!
//! ```text
//! ClaudeCommand    ← builds `[--resume <id>,] -p <prompt> --verbose …`
//!     │
//!     ▼
//! ProcessRunner    ← trait; TokioRunner spawns the real binary
//!     │
//!     ▼
//! ChildHandle      ← raw stdout lines + graceful wait/kill
//!     │
//!     ▼
//! wire::parse_line ← frame typing; unknown types skipped
//!     │
//!     ▼
//! MessageStream    ← futures::Stream of frames, terminal on `result`
//! ```
//!
//! Session semantics (turn tracking, timeouts, event emission) live one
//! layer up, in `atari-core`.

pub mod error;
pub mod process;
pub mod stream;
pub mod wire;

pub use error::DriverError;
pub use process::{ChildHandle, ClaudeCommand, ProcessRunner, TokioRunner};
pub use stream::MessageStream;
pub use wire::{
    AssistantFrame, ContentBlock, ResultFrame, StreamMessage, SystemFrame, UserBlock, UserFrame,
};

/// Convenience `Result` alias for this crate.
pub type Result<T> = std::result::Result<T, DriverError>;
