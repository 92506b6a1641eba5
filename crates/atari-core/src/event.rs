use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Where an event originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// The assistant subprocess stream.
    Claude,
    /// The issue tracker.
    Bd,
    /// The supervisor itself.
    Atari,
}

/// One event on the wire: a common envelope plus a typed payload.
///
/// Serializes to a single JSON object whose `type` field carries the dotted
/// payload discriminator, e.g.
/// `{"timestamp":"…","source":"claude","type":"claude.text","text":"…"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub source: Source,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn now(source: Source, payload: EventPayload) -> Self {
        Self {
            timestamp: Utc::now(),
            source,
            payload,
        }
    }

    /// The dotted discriminator, e.g. `"turn.complete"`.
    pub fn type_name(&self) -> &'static str {
        self.payload.type_name()
    }

    /// The bead this event concerns, or `""` for variants without one.
    pub fn bead_id(&self) -> &str {
        match &self.payload {
            EventPayload::SessionStart { bead_id, .. }
            | EventPayload::IterationStart { bead_id, .. }
            | EventPayload::IterationEnd { bead_id, .. }
            | EventPayload::BeadAbandoned { bead_id, .. } => bead_id,
            _ => "",
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Closed set of event payloads, grouped by discriminator prefix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    /// A subprocess emitted its init frame.
    #[serde(rename = "session.start")]
    SessionStart { bead_id: String, title: String },

    /// A subprocess emitted its terminal result frame.
    #[serde(rename = "session.end")]
    SessionEnd {
        session_id: String,
        num_turns: u32,
        duration_ms: u64,
        total_cost_usd: f64,
        result: String,
    },

    /// The inactivity watcher fired.
    #[serde(rename = "session.timeout")]
    SessionTimeout { duration_ms: u64 },

    /// Assistant text chunk.
    #[serde(rename = "claude.text")]
    ClaudeText { text: String },

    /// Assistant requested a tool; `input` is an opaque key→value map.
    #[serde(rename = "claude.tool_use")]
    ToolUse {
        tool_id: String,
        tool_name: String,
        #[serde(default)]
        input: serde_json::Value,
    },

    /// Matches a prior tool_use by `tool_id`.
    #[serde(rename = "claude.tool_result")]
    ToolResult {
        tool_id: String,
        content: String,
        is_error: bool,
    },

    /// All outstanding tool uses of a turn have returned.
    #[serde(rename = "turn.complete")]
    TurnComplete {
        turn_number: u32,
        tool_count: u32,
        tool_elapsed_ms: u64,
    },

    #[serde(rename = "iteration.start")]
    IterationStart {
        bead_id: String,
        title: String,
        priority: i64,
        attempt: u32,
    },

    #[serde(rename = "iteration.end")]
    IterationEnd {
        bead_id: String,
        attempt: u32,
        success: bool,
        num_turns: u32,
        total_cost_usd: f64,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    #[serde(rename = "drain.start")]
    DrainStart,

    #[serde(rename = "drain.stop")]
    DrainStop,

    #[serde(rename = "drain.state_changed")]
    DrainStateChanged { from: String, to: String },

    /// A bead exceeded its failure budget.
    #[serde(rename = "bead.abandoned")]
    BeadAbandoned {
        bead_id: String,
        attempts: u32,
        error: String,
    },

    #[serde(rename = "error")]
    Error { message: String },

    /// A stream line that failed to parse; `line` is truncated.
    #[serde(rename = "error.parse")]
    ParseError { line: String },
}

impl EventPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::SessionStart { .. } => "session.start",
            EventPayload::SessionEnd { .. } => "session.end",
            EventPayload::SessionTimeout { .. } => "session.timeout",
            EventPayload::ClaudeText { .. } => "claude.text",
            EventPayload::ToolUse { .. } => "claude.tool_use",
            EventPayload::ToolResult { .. } => "claude.tool_result",
            EventPayload::TurnComplete { .. } => "turn.complete",
            EventPayload::IterationStart { .. } => "iteration.start",
            EventPayload::IterationEnd { .. } => "iteration.end",
            EventPayload::DrainStart => "drain.start",
            EventPayload::DrainStop => "drain.stop",
            EventPayload::DrainStateChanged { .. } => "drain.state_changed",
            EventPayload::BeadAbandoned { .. } => "bead.abandoned",
            EventPayload::Error { .. } => "error",
            EventPayload::ParseError { .. } => "error.parse",
        }
    }

    fn is_known(tag: &str) -> bool {
        KNOWN_TYPES.contains(&tag)
    }
}

const KNOWN_TYPES: &[&str] = &[
    "session.start",
    "session.end",
    "session.timeout",
    "claude.text",
    "claude.tool_use",
    "claude.tool_result",
    "turn.complete",
    "iteration.start",
    "iteration.end",
    "drain.start",
    "drain.stop",
    "drain.state_changed",
    "bead.abandoned",
    "error",
    "error.parse",
];

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Outcome of decoding one log line.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(Event),
    /// A well-formed object with an unrecognized `type`; skipped silently.
    Unknown,
}

/// Encode an event as a single JSON line (no trailing newline).
pub fn encode_line(event: &Event) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

/// Decode one line. Two-pass read: extract `type` first, then decode the
/// full variant. Unknown `type` values yield [`Decoded::Unknown`] rather
/// than an error so newer writers don't break older readers.
pub fn decode_line(line: &str) -> Result<Decoded> {
    #[derive(Deserialize)]
    struct TypeProbe {
        #[serde(rename = "type")]
        kind: String,
    }

    let probe: TypeProbe = serde_json::from_str(line)?;
    if !EventPayload::is_known(&probe.kind) {
        return Ok(Decoded::Unknown);
    }
    let event: Event = serde_json::from_str(line)?;
    Ok(Decoded::Event(event))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_events() -> Vec<Event> {
        vec![
            Event::now(
                Source::Claude,
                EventPayload::SessionStart {
                    bead_id: "bd-001".into(),
                    title: "Fix login".into(),
                },
            ),
            Event::now(
                Source::Claude,
                EventPayload::SessionEnd {
                    session_id: "abc123-def".into(),
                    num_turns: 4,
                    duration_ms: 1234,
                    total_cost_usd: 0.42,
                    result: "done".into(),
                },
            ),
            Event::now(
                Source::Atari,
                EventPayload::SessionTimeout { duration_ms: 300_000 },
            ),
            Event::now(
                Source::Claude,
                EventPayload::ClaudeText {
                    text: "thinking…".into(),
                },
            ),
            Event::now(
                Source::Claude,
                EventPayload::ToolUse {
                    tool_id: "tu_1".into(),
                    tool_name: "Bash".into(),
                    input: serde_json::json!({"command": "ls"}),
                },
            ),
            Event::now(
                Source::Claude,
                EventPayload::ToolResult {
                    tool_id: "tu_1".into(),
                    content: "ok".into(),
                    is_error: false,
                },
            ),
            Event::now(
                Source::Atari,
                EventPayload::TurnComplete {
                    turn_number: 1,
                    tool_count: 2,
                    tool_elapsed_ms: 17,
                },
            ),
            Event::now(
                Source::Atari,
                EventPayload::IterationStart {
                    bead_id: "bd-001".into(),
                    title: "Fix login".into(),
                    priority: 1,
                    attempt: 2,
                },
            ),
            Event::now(
                Source::Atari,
                EventPayload::IterationEnd {
                    bead_id: "bd-001".into(),
                    attempt: 2,
                    success: true,
                    num_turns: 4,
                    total_cost_usd: 0.42,
                    duration_ms: 9000,
                    error: None,
                    session_id: Some("abc123-def".into()),
                },
            ),
            Event::now(Source::Atari, EventPayload::DrainStart),
            Event::now(Source::Atari, EventPayload::DrainStop),
            Event::now(
                Source::Atari,
                EventPayload::DrainStateChanged {
                    from: "idle".into(),
                    to: "selecting".into(),
                },
            ),
            Event::now(
                Source::Atari,
                EventPayload::BeadAbandoned {
                    bead_id: "bd-002".into(),
                    attempts: 3,
                    error: "exit status 1".into(),
                },
            ),
            Event::now(
                Source::Atari,
                EventPayload::Error {
                    message: "spawn failed".into(),
                },
            ),
            Event::now(
                Source::Atari,
                EventPayload::ParseError {
                    line: "{bad".into(),
                },
            ),
        ]
    }

    #[test]
    fn round_trip_every_variant() {
        for event in sample_events() {
            let line = encode_line(&event).unwrap();
            assert!(!line.contains('\n'), "single line: {line}");
            match decode_line(&line).unwrap() {
                Decoded::Event(back) => assert_eq!(back, event, "variant {}", event.type_name()),
                Decoded::Unknown => panic!("variant {} decoded as unknown", event.type_name()),
            }
        }
    }

    #[test]
    fn type_name_matches_wire_tag() {
        for event in sample_events() {
            let line = encode_line(&event).unwrap();
            let value: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(value["type"], event.type_name());
        }
    }

    #[test]
    fn unknown_type_is_skipped() {
        let line = r#"{"timestamp":"2026-01-01T00:00:00Z","source":"atari","type":"drain.v2_fancy"}"#;
        assert_eq!(decode_line(line).unwrap(), Decoded::Unknown);
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(decode_line("{nope").is_err());
    }

    #[test]
    fn bead_id_extraction() {
        let with = Event::now(
            Source::Atari,
            EventPayload::IterationStart {
                bead_id: "bd-9".into(),
                title: "t".into(),
                priority: 0,
                attempt: 1,
            },
        );
        let without = Event::now(
            Source::Claude,
            EventPayload::ClaudeText { text: "x".into() },
        );
        assert_eq!(with.bead_id(), "bd-9");
        assert_eq!(without.bead_id(), "");
    }

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let event = Event::now(
            Source::Atari,
            EventPayload::IterationEnd {
                bead_id: "bd-1".into(),
                attempt: 1,
                success: false,
                num_turns: 0,
                total_cost_usd: 0.0,
                duration_ms: 10,
                error: Some("boom".into()),
                session_id: None,
            },
        );
        let line = encode_line(&event).unwrap();
        assert!(line.contains("\"error\":\"boom\""));
        assert!(!line.contains("session_id"));
    }
}
