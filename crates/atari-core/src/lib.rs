//! `atari-core`: the event-driven drain supervisor.
//!
//! atari drains a queue of issues ("beads") by repeatedly spawning a coding
//! assistant subprocess, parsing its stream-json output into typed events,
//! fanning those events out to durable sinks, and recording per-bead
//! progress so a crashed drain resumes where it left off. An observer
//! subsystem answers ad-hoc questions about live activity from the same
//! event log.
//!
//! ```text
//! DrainController ──spawns──▶ claude subprocess
//!        │                          │ stdout (stream-json)
//!        │                          ▼
//!        │                    SessionDriver ──events──▶ EventRouter
//!        │                                                 │
//!        └──drain.* events────────────────────────────────▶│
//!                             ┌────────────┬───────────────┤
//!                             ▼            ▼               ▼
//!                          LogSink     StateSink      (TUI, tests)
//!                             │            │
//!                        atari.log    state.json
//!                             │
//!                         LogReader ──▶ Observer ──spawns──▶ claude
//! ```

pub mod beads;
pub mod broker;
pub mod config;
pub mod drain;
pub mod error;
pub mod event;
pub mod io;
pub mod log_reader;
pub mod log_sink;
pub mod observer;
pub mod paths;
pub mod router;
pub mod session;
pub mod state;
pub mod state_sink;
pub mod supervisor;

pub use error::{AtariError, Result};
