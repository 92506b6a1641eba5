use std::fmt::Write as _;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use claude_driver::{ClaudeCommand, MessageStream, ProcessRunner, StreamMessage};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::broker::SessionBroker;
use crate::config::AtariConfig;
use crate::error::{AtariError, Result};
use crate::event::{Event, EventPayload};
use crate::log_reader::LogReader;
use crate::state::{BeadStatus, DrainState};
use crate::state_sink::DrainStateProvider;

/// Answers are capped at 100 KiB; anything longer gets the marker appended.
pub const ANSWER_CAP_BYTES: usize = 100 * 1024;
pub const ANSWER_TRUNCATION_MARKER: &str = "\n...[answer truncated]";

/// Session ids shorter than this are treated as garbage and not saved.
const MIN_SESSION_ID_LEN: usize = 8;

/// How long `ask` will wait for the assistant slot before reporting busy.
const BROKER_WAIT: Duration = Duration::from_secs(2);

const HISTORY_TABLE_ROWS: usize = 5;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ObserverOptions {
    pub model: String,
    pub claude_binary: String,
    pub query_timeout: Duration,
    /// Recent events of the current bead included in the prompt.
    pub context_events: usize,
}

impl ObserverOptions {
    pub fn from_config(config: &AtariConfig) -> Self {
        Self {
            model: config.observer.model.clone(),
            claude_binary: config.claude_binary.clone(),
            query_timeout: config.query_timeout(),
            context_events: config.observer.context_events,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QaExchange {
    pub question: String,
    pub answer: String,
}

// ---------------------------------------------------------------------------
// Observer
// ---------------------------------------------------------------------------

/// Ad-hoc Q&A over live drain activity.
///
/// Each question spawns an independent assistant subprocess whose prompt is
/// assembled from the drain state snapshot, the event log, and the
/// observer's own conversation history. A successful query's session id is
/// kept so the next question resumes the same conversation; a failed resume
/// is retried once with a fresh session.
pub struct Observer {
    opts: ObserverOptions,
    runner: Arc<dyn ProcessRunner>,
    reader: Arc<LogReader>,
    provider: Arc<dyn DrainStateProvider>,
    broker: Option<Arc<SessionBroker>>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    session_id: Option<String>,
    history: Vec<QaExchange>,
    inflight: Option<CancellationToken>,
}

impl Observer {
    pub fn new(
        opts: ObserverOptions,
        runner: Arc<dyn ProcessRunner>,
        reader: Arc<LogReader>,
        provider: Arc<dyn DrainStateProvider>,
        broker: Option<Arc<SessionBroker>>,
    ) -> Self {
        Self {
            opts,
            runner,
            reader,
            provider,
            broker,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answer one question about drain activity.
    pub async fn ask(&self, question: &str) -> Result<String> {
        let state = self.provider.snapshot();
        let prompt = self.build_prompt(question, &state)?;

        let token = CancellationToken::new();
        {
            let mut inner = self.lock();
            inner.inflight = Some(token.clone());
        }

        // The drain holds the slot for whole sessions, so don't queue behind
        // it; report busy without spawning anything.
        if let Some(broker) = &self.broker {
            if let Err(e) = broker.acquire("observer", BROKER_WAIT, &token).await {
                self.lock().inflight = None;
                return Err(match e {
                    AtariError::BrokerTimeout(_) => {
                        AtariError::Busy(broker.holder().unwrap_or_default())
                    }
                    other => other,
                });
            }
        }

        let resume = self.lock().session_id.clone();
        let mut result = self.query(&prompt, resume.clone(), &token).await;

        // A stale resume token makes the subprocess fail fast; drop the
        // token and retry once from scratch.
        if result.is_err() && resume.is_some() {
            if let Err(e) = &result {
                if !matches!(e, AtariError::Cancelled) {
                    tracing::warn!(error = %e, "resumed observer query failed, retrying fresh");
                    self.lock().session_id = None;
                    result = self.query(&prompt, None, &token).await;
                }
            }
        }

        if let Some(broker) = &self.broker {
            broker.release();
        }

        let mut inner = self.lock();
        inner.inflight = None;
        match result {
            Ok((answer, session_id)) => {
                if let Some(id) = session_id {
                    if id.len() >= MIN_SESSION_ID_LEN {
                        inner.session_id = Some(id);
                    }
                }
                inner.history.push(QaExchange {
                    question: question.to_owned(),
                    answer: answer.clone(),
                });
                Ok(answer)
            }
            Err(e) => Err(e),
        }
    }

    /// Forget the resume session and conversation history. Idempotent.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.session_id = None;
        inner.history.clear();
    }

    /// Cancel the in-flight query, if any.
    pub fn cancel(&self) {
        if let Some(token) = &self.lock().inflight {
            token.cancel();
        }
    }

    pub fn history(&self) -> Vec<QaExchange> {
        self.lock().history.clone()
    }

    // ---------------------------------------------------------------------------
    // Query execution
    // ---------------------------------------------------------------------------

    async fn query(
        &self,
        prompt: &str,
        resume: Option<String>,
        token: &CancellationToken,
    ) -> Result<(String, Option<String>)> {
        let mut command =
            ClaudeCommand::new(&self.opts.claude_binary, &self.opts.model, prompt);
        if let Some(session_id) = resume {
            command = command.resume(session_id);
        }

        let child = command.start(self.runner.as_ref())?;
        let mut stream = MessageStream::spawn(child);

        let collect = async move {
            let mut answer = String::new();
            while let Some(msg) = stream.next().await {
                match msg? {
                    StreamMessage::Assistant(frame) => {
                        for block in frame.message.content {
                            if let claude_driver::ContentBlock::Text { text } = block {
                                if !answer.is_empty() {
                                    answer.push('\n');
                                }
                                answer.push_str(&text);
                            }
                        }
                    }
                    StreamMessage::Result(frame) => {
                        if answer.is_empty() {
                            answer = frame.result.unwrap_or_default();
                        }
                        let session_id =
                            (!frame.session_id.is_empty()).then_some(frame.session_id);
                        return Ok((truncate_answer(answer), session_id));
                    }
                    _ => {}
                }
            }
            Err(AtariError::Driver(claude_driver::DriverError::Process(
                "query stream ended without a result frame".into(),
            )))
        };

        tokio::select! {
            _ = token.cancelled() => Err(AtariError::Cancelled),
            out = tokio::time::timeout(self.opts.query_timeout, collect) => {
                out.map_err(|_| AtariError::QueryTimeout(self.opts.query_timeout))?
            }
        }
    }

    // ---------------------------------------------------------------------------
    // Prompt assembly
    // ---------------------------------------------------------------------------

    fn build_prompt(&self, question: &str, state: &DrainState) -> Result<String> {
        let bead_events = match &state.current_bead {
            Some(bead_id) => self.reader.by_bead(bead_id).unwrap_or_default(),
            None => Vec::new(),
        };
        let has_log = self.reader.read_events().map(|e| !e.is_empty()).unwrap_or(false);

        if !has_log && state.iteration == 0 && state.history.is_empty() {
            return Err(AtariError::NoContext);
        }

        let mut prompt = String::new();
        prompt.push_str(
            "You are the observer for atari, an autonomous supervisor that works \
             issues (\"beads\") by running a coding assistant. Answer the \
             operator's question about current drain activity, concisely and \
             concretely.\n\n",
        );

        let uptime = Utc::now() - self.provider.started_at();
        let _ = writeln!(prompt, "## Drain status");
        let _ = writeln!(prompt, "- state: {}", state.status);
        let _ = writeln!(prompt, "- uptime: {}m", uptime.num_minutes().max(0));
        let _ = writeln!(prompt, "- iterations: {}", state.iteration);
        let _ = writeln!(
            prompt,
            "- total cost: ${:.2} over {} turns",
            state.total_cost, state.total_turns
        );
        if let Some(bead) = &state.current_bead {
            let title = state.active_top_level_title.as_deref().unwrap_or("");
            let _ = writeln!(prompt, "- currently working: {bead} {title}");
        }
        prompt.push('\n');

        let mut finished: Vec<_> = state
            .history
            .values()
            .filter(|h| h.status != BeadStatus::Working && h.status != BeadStatus::Pending)
            .collect();
        finished.sort_by_key(|h| std::cmp::Reverse(h.last_attempt));
        if !finished.is_empty() {
            let _ = writeln!(prompt, "## Recent beads");
            for record in finished.iter().take(HISTORY_TABLE_ROWS) {
                let _ = writeln!(
                    prompt,
                    "- {} {:?} after {} attempt(s){}",
                    record.id,
                    record.status,
                    record.attempts,
                    record
                        .last_error
                        .as_deref()
                        .map(|e| format!(", last error: {e}"))
                        .unwrap_or_default()
                );
            }
            prompt.push('\n');
        }

        if let Some(bead_id) = &state.current_bead {
            let _ = writeln!(prompt, "## Latest activity on {bead_id}");
            let tail_start = bead_events.len().saturating_sub(self.opts.context_events);
            for event in &bead_events[tail_start..] {
                let _ = writeln!(prompt, "{}", render_event(event));
            }
            prompt.push('\n');
        }

        let _ = writeln!(prompt, "## Tips");
        let _ = writeln!(
            prompt,
            "- the full event log is at {} (JSON lines, grep by \"type\")",
            self.reader.path().display()
        );
        let _ = writeln!(prompt, "- `bd show <bead-id>` prints one issue in full");
        prompt.push('\n');

        let history = self.lock().history.clone();
        if !history.is_empty() {
            let _ = writeln!(prompt, "## Conversation so far");
            for exchange in &history {
                let _ = writeln!(prompt, "Q: {}", exchange.question);
                let _ = writeln!(prompt, "A: {}", exchange.answer);
            }
            prompt.push('\n');
        }

        let _ = writeln!(prompt, "## Question");
        prompt.push_str(question);
        Ok(prompt)
    }
}

fn truncate_answer(mut answer: String) -> String {
    if answer.len() <= ANSWER_CAP_BYTES {
        return answer;
    }
    let mut end = ANSWER_CAP_BYTES;
    while !answer.is_char_boundary(end) {
        end -= 1;
    }
    answer.truncate(end);
    answer.push_str(ANSWER_TRUNCATION_MARKER);
    answer
}

/// One prompt line per event: timestamp, type, and a short payload summary.
fn render_event(event: &Event) -> String {
    let summary = match &event.payload {
        EventPayload::ClaudeText { text } => clip(text, 120),
        EventPayload::ToolUse { tool_name, .. } => tool_name.clone(),
        EventPayload::ToolResult {
            tool_id, is_error, ..
        } => format!("{tool_id}{}", if *is_error { " (error)" } else { "" }),
        EventPayload::SessionEnd {
            total_cost_usd,
            num_turns,
            ..
        } => format!("{num_turns} turns, ${total_cost_usd:.2}"),
        EventPayload::IterationStart { attempt, .. } => format!("attempt {attempt}"),
        EventPayload::IterationEnd { success, .. } => format!("success={success}"),
        _ => String::new(),
    };
    format!(
        "{} {} {}",
        event.timestamp.format("%H:%M:%S"),
        event.type_name(),
        summary
    )
    .trim_end()
    .to_owned()
}

fn clip(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_owned();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
