use std::time::{Duration, Instant};

use claude_driver::wire::{self, ContentBlock, StreamMessage, UserBlock};
use claude_driver::ChildHandle;
use tokio_util::sync::CancellationToken;

use crate::event::{Event, EventPayload, Source};
use crate::router::EventRouter;

/// Grace period between a session leaving RUNNING and force-killing the
/// subprocess.
pub const EXIT_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// How a session left the RUNNING state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The terminal result frame arrived.
    Ended,
    /// The inactivity watcher fired.
    TimedOut,
    Cancelled,
    /// Read error, or EOF before any result frame.
    Failed,
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub end: SessionEnd,
    pub session_id: Option<String>,
    pub num_turns: u32,
    pub total_cost_usd: f64,
    pub duration_ms: u64,
    /// The result frame reported an error subtype.
    pub result_error: bool,
    /// The assistant ran the bead-closing tracker command.
    pub closed_bead: bool,
    pub error: Option<String>,
}

impl SessionOutcome {
    fn new() -> Self {
        Self {
            end: SessionEnd::Failed,
            session_id: None,
            num_turns: 0,
            total_cost_usd: 0.0,
            duration_ms: 0,
            result_error: false,
            closed_bead: false,
            error: None,
        }
    }

    /// An iteration succeeds only when the session ended cleanly AND the
    /// assistant actually closed the bead in the tracker.
    pub fn succeeded(&self) -> bool {
        self.end == SessionEnd::Ended && !self.result_error && self.closed_bead
    }
}

// ---------------------------------------------------------------------------
// TurnTracker
// ---------------------------------------------------------------------------

/// A completed turn: all outstanding tool uses returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedTurn {
    pub number: u32,
    pub tool_count: u32,
    pub elapsed: Duration,
}

/// Tracks outstanding tool_ids within a session to detect turn boundaries.
///
/// A turn opens when the first tool use lands on an empty set and closes
/// when the set drains back to empty; `tool_count` is the number of results
/// resolved within the turn.
#[derive(Debug, Default)]
pub struct TurnTracker {
    outstanding: Vec<String>,
    earliest: Option<Instant>,
    turn: u32,
    resolved_in_turn: u32,
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_tool_use(&mut self, tool_id: String) {
        if self.outstanding.is_empty() {
            self.earliest = Some(Instant::now());
            self.resolved_in_turn = 0;
        }
        self.outstanding.push(tool_id);
    }

    /// Returns the completed turn when this result empties the set.
    pub fn on_tool_result(&mut self, tool_id: &str) -> Option<CompletedTurn> {
        let Some(pos) = self.outstanding.iter().position(|id| id == tool_id) else {
            // Result without a matching use; the parser never emitted the
            // use, so it cannot close a turn either.
            return None;
        };
        self.outstanding.remove(pos);
        self.resolved_in_turn += 1;

        if self.outstanding.is_empty() {
            self.turn += 1;
            let elapsed = self
                .earliest
                .take()
                .map(|at| at.elapsed())
                .unwrap_or_default();
            return Some(CompletedTurn {
                number: self.turn,
                tool_count: self.resolved_in_turn,
                elapsed,
            });
        }
        None
    }
}

// ---------------------------------------------------------------------------
// SessionDriver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub bead_id: String,
    pub title: String,
    pub idle_timeout: Duration,
}

/// Reads a subprocess's stream-json stdout, emits typed events through the
/// router, and reports how the session ended.
///
/// ```text
/// IDLE ──run──▶ RUNNING ──result frame──▶ ENDED
///                  │
///                  ├─ idle timeout ──▶ TIMED_OUT
///                  ├─ cancel ───────▶ CANCELLED
///                  └─ read err/EOF ─▶ FAILED
/// ```
///
/// Whatever the exit path, the subprocess is reaped exactly once with a
/// bounded grace period, and at most one of `session.end` /
/// `session.timeout` is emitted.
pub struct SessionDriver<'r> {
    router: &'r EventRouter,
    config: SessionConfig,
}

impl<'r> SessionDriver<'r> {
    pub fn new(router: &'r EventRouter, config: SessionConfig) -> Self {
        Self { router, config }
    }

    pub async fn run(&self, mut child: ChildHandle, cancel: &CancellationToken) -> SessionOutcome {
        let started = Instant::now();
        let mut tracker = TurnTracker::new();
        let mut outcome = SessionOutcome::new();
        let mut reaped = false;

        let end = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    outcome.error = Some("cancelled".into());
                    break SessionEnd::Cancelled;
                }
                _ = tokio::time::sleep(self.config.idle_timeout) => {
                    self.emit(Source::Atari, EventPayload::SessionTimeout {
                        duration_ms: self.config.idle_timeout.as_millis() as u64,
                    });
                    outcome.error = Some(format!(
                        "no output for {}s",
                        self.config.idle_timeout.as_secs()
                    ));
                    break SessionEnd::TimedOut;
                }
                line = child.next_line() => match line {
                    Err(e) => {
                        let message = format!("stream read failed: {e}");
                        self.emit(Source::Atari, EventPayload::Error { message: message.clone() });
                        outcome.error = Some(message);
                        break SessionEnd::Failed;
                    }
                    Ok(None) => {
                        // EOF before the result frame: surface the exit status.
                        let message = match child.wait_graceful(EXIT_GRACE).await {
                            Ok(status) if status.success() => {
                                "stream ended without a result frame".to_owned()
                            }
                            Ok(status) => format!("subprocess exited with {status}"),
                            Err(e) => format!("subprocess wait failed: {e}"),
                        };
                        reaped = true;
                        self.emit(Source::Atari, EventPayload::Error { message: message.clone() });
                        outcome.error = Some(message);
                        break SessionEnd::Failed;
                    }
                    Ok(Some(line)) => match wire::parse_line(&line) {
                        Err(_) => {
                            self.emit(Source::Atari, EventPayload::ParseError {
                                line: wire::truncate_line(line.trim()),
                            });
                        }
                        Ok(None) => {}
                        Ok(Some(msg)) => {
                            if self.handle_frame(msg, &mut tracker, &mut outcome) {
                                break SessionEnd::Ended;
                            }
                        }
                    }
                }
            }
        };

        // Exit discipline: one kill (where the child may still be running)
        // and exactly one reap.
        if !reaped {
            if end != SessionEnd::Ended {
                child.kill().await;
            }
            let _ = child.wait_graceful(EXIT_GRACE).await;
        }

        outcome.end = end;
        if outcome.duration_ms == 0 {
            outcome.duration_ms = started.elapsed().as_millis() as u64;
        }
        outcome
    }

    /// Map one frame to events; returns `true` on the terminal result frame.
    fn handle_frame(
        &self,
        msg: StreamMessage,
        tracker: &mut TurnTracker,
        outcome: &mut SessionOutcome,
    ) -> bool {
        match msg {
            StreamMessage::System(sys) => {
                if sys.is_init() {
                    if !sys.session_id.is_empty() {
                        outcome.session_id = Some(sys.session_id);
                    }
                    self.emit(
                        Source::Claude,
                        EventPayload::SessionStart {
                            bead_id: self.config.bead_id.clone(),
                            title: self.config.title.clone(),
                        },
                    );
                }
            }
            StreamMessage::Assistant(frame) => {
                for block in frame.message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            self.emit(Source::Claude, EventPayload::ClaudeText { text });
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            if invoked_bead_close(&name, &input, &self.config.bead_id) {
                                outcome.closed_bead = true;
                            }
                            tracker.on_tool_use(id.clone());
                            self.emit(
                                Source::Claude,
                                EventPayload::ToolUse {
                                    tool_id: id,
                                    tool_name: name,
                                    input,
                                },
                            );
                        }
                        ContentBlock::Thinking { .. } => {}
                    }
                }
            }
            StreamMessage::User(frame) => {
                for block in frame.message.content {
                    if let UserBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } = block
                    {
                        self.emit(
                            Source::Claude,
                            EventPayload::ToolResult {
                                tool_id: tool_use_id.clone(),
                                content: wire::tool_result_text(&content),
                                is_error: is_error.unwrap_or(false),
                            },
                        );
                        if let Some(turn) = tracker.on_tool_result(&tool_use_id) {
                            self.emit(
                                Source::Atari,
                                EventPayload::TurnComplete {
                                    turn_number: turn.number,
                                    tool_count: turn.tool_count,
                                    tool_elapsed_ms: turn.elapsed.as_millis() as u64,
                                },
                            );
                        }
                    }
                }
            }
            StreamMessage::Result(frame) => {
                if !frame.session_id.is_empty() {
                    outcome.session_id = Some(frame.session_id.clone());
                }
                outcome.num_turns = frame.num_turns;
                outcome.total_cost_usd = frame.total_cost_usd;
                outcome.duration_ms = frame.duration_ms;
                outcome.result_error = frame.ended_in_error();
                self.emit(
                    Source::Claude,
                    EventPayload::SessionEnd {
                        session_id: frame.session_id,
                        num_turns: frame.num_turns,
                        duration_ms: frame.duration_ms,
                        total_cost_usd: frame.total_cost_usd,
                        result: frame.result.unwrap_or_default(),
                    },
                );
                return true;
            }
        }
        false
    }

    fn emit(&self, source: Source, payload: EventPayload) {
        self.router.emit(Event::now(source, payload));
    }
}

/// Did this tool use run the tracker's close command for our bead?
fn invoked_bead_close(tool_name: &str, input: &serde_json::Value, bead_id: &str) -> bool {
    if tool_name != "Bash" {
        return false;
    }
    let Some(command) = input.get("command").and_then(|v| v.as_str()) else {
        return false;
    };
    command.contains("bd close") && command.contains(bead_id)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
