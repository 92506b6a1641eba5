use serde::{Deserialize, Serialize};

use crate::{DriverError, Result};

// ─── Stream-json frames ───────────────────────────────────────────────────

/// Maximum prefix of an unparseable line carried inside a parse error.
pub const PARSE_PREFIX_LEN: usize = 200;

/// A frame emitted by `claude --output-format stream-json`, one JSON object
/// per stdout line, discriminated by the `"type"` field.
///
/// Only the four frame kinds the supervisor reacts to are typed here; any
/// other `type` value is skipped by [`parse_line`] for forward compatibility.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    System(SystemFrame),
    Assistant(AssistantFrame),
    User(UserFrame),
    Result(ResultFrame),
}

/// `type = "system"`, further distinguished by `subtype`. Only `init`
/// matters to the session driver; other subtypes pass through untouched.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemFrame {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl SystemFrame {
    pub fn is_init(&self) -> bool {
        self.subtype == "init"
    }
}

/// `type = "assistant"`: the model's response, including content blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantFrame {
    pub message: AssistantBody,
    #[serde(default)]
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantBody {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

/// Content blocks within an assistant message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        /// Tool inputs are schema-polymorphic (varies per tool), so Value is
        /// correct here.
        #[serde(default)]
        input: serde_json::Value,
    },
    Thinking {
        thinking: String,
    },
}

/// `type = "user"`: tool results fed back to the model.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserFrame {
    pub message: UserBody,
    #[serde(default)]
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserBody {
    #[serde(default)]
    pub content: Vec<UserBlock>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserBlock {
    Text {
        text: String,
    },
    ToolResult {
        tool_use_id: String,
        /// String or `[{type:"text",text:...}]` depending on the tool;
        /// flatten with [`tool_result_text`].
        #[serde(default)]
        content: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// `type = "result"`: the terminal frame of every session.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultFrame {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub num_turns: u32,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl ResultFrame {
    /// `true` when the session ended on any error subtype.
    pub fn ended_in_error(&self) -> bool {
        self.is_error || (!self.subtype.is_empty() && self.subtype != "success")
    }
}

// ─── Line parsing ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct TypeProbe {
    #[serde(rename = "type")]
    kind: String,
}

/// Parse one stdout line into a [`StreamMessage`].
///
/// Two-pass read: first extract `type`, then decode the full frame. Returns
/// `Ok(None)` for blank lines and for unknown `type` values; future frame
/// kinds must not fail the stream. Malformed JSON returns
/// [`DriverError::Parse`] with the line truncated to [`PARSE_PREFIX_LEN`].
pub fn parse_line(line: &str) -> Result<Option<StreamMessage>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let probe: TypeProbe =
        serde_json::from_str(trimmed).map_err(|e| parse_error(trimmed, e))?;

    match probe.kind.as_str() {
        "system" | "assistant" | "user" | "result" => serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| parse_error(trimmed, e)),
        _ => Ok(None),
    }
}

fn parse_error(line: &str, source: serde_json::Error) -> DriverError {
    DriverError::Parse {
        line: truncate_line(line),
        source,
    }
}

/// Truncate `line` to [`PARSE_PREFIX_LEN`] on a char boundary.
pub fn truncate_line(line: &str) -> String {
    if line.len() <= PARSE_PREFIX_LEN {
        return line.to_owned();
    }
    let mut end = PARSE_PREFIX_LEN;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    line[..end].to_owned()
}

/// Flatten a tool-result `content` value to plain text.
///
/// Handles the two shapes the CLI produces: a bare string, or an array of
/// `{type:"text",text}` blocks. Anything else is rendered as compact JSON.
pub fn tool_result_text(content: &serde_json::Value) -> String {
    match content {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
