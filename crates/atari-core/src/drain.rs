use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use claude_driver::{ClaudeCommand, ProcessRunner};
use tokio_util::sync::CancellationToken;

use crate::beads::{Bead, WorkQueue};
use crate::broker::SessionBroker;
use crate::config::AtariConfig;
use crate::error::Result;
use crate::event::{Event, EventPayload, Source};
use crate::router::EventRouter;
use crate::session::{SessionConfig, SessionDriver, SessionEnd, SessionOutcome};
use crate::state_sink::{DrainStateProvider, StateSink};

/// How long the drain will wait for the assistant slot before the iteration
/// fails. Generous because observer queries are short.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(600);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// DrainStatus
// ---------------------------------------------------------------------------

/// Observable controller states, announced via `drain.state_changed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    Idle,
    Selecting,
    Working,
    Paused,
    DrainingOut,
    Stopped,
}

impl DrainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainStatus::Idle => "idle",
            DrainStatus::Selecting => "selecting",
            DrainStatus::Working => "working",
            DrainStatus::Paused => "paused",
            DrainStatus::DrainingOut => "draining-out",
            DrainStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for DrainStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// DrainOptions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DrainOptions {
    pub model: String,
    pub claude_binary: String,
    pub max_failures: u32,
    pub idle_timeout: Duration,
    pub selection_backoff_max: Duration,
    /// Process a single bead, then stop.
    pub once: bool,
}

impl DrainOptions {
    pub fn from_config(config: &AtariConfig) -> Self {
        Self {
            model: config.model.clone(),
            claude_binary: config.claude_binary.clone(),
            max_failures: config.max_failures,
            idle_timeout: config.idle_timeout(),
            selection_backoff_max: config.selection_backoff_max(),
            once: false,
        }
    }
}

// ---------------------------------------------------------------------------
// DrainController
// ---------------------------------------------------------------------------

/// Orchestrates the drain: select a bead, spawn the assistant, drive the
/// session, account the iteration, retry or abandon. The controller
/// subscribes to nothing; it only produces events.
pub struct DrainController {
    router: Arc<EventRouter>,
    queue: Arc<dyn WorkQueue>,
    runner: Arc<dyn ProcessRunner>,
    broker: Option<Arc<SessionBroker>>,
    sink: Arc<StateSink>,
    opts: DrainOptions,
    status: Mutex<DrainStatus>,
}

impl DrainController {
    pub fn new(
        router: Arc<EventRouter>,
        queue: Arc<dyn WorkQueue>,
        runner: Arc<dyn ProcessRunner>,
        broker: Option<Arc<SessionBroker>>,
        sink: Arc<StateSink>,
        opts: DrainOptions,
    ) -> Self {
        Self {
            router,
            queue,
            runner,
            broker,
            sink,
            opts,
            status: Mutex::new(DrainStatus::Idle),
        }
    }

    fn status_lock(&self) -> MutexGuard<'_, DrainStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> DrainStatus {
        *self.status_lock()
    }

    fn set_status(&self, to: DrainStatus) {
        let mut current = self.status_lock();
        if *current == to {
            return;
        }
        let from = *current;
        *current = to;
        drop(current);
        self.emit(EventPayload::DrainStateChanged {
            from: from.as_str().into(),
            to: to.as_str().into(),
        });
    }

    fn emit(&self, payload: EventPayload) {
        self.router.emit(Event::now(Source::Atari, payload));
    }

    /// Run until cancelled (or after one bead with `once`).
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.emit(EventPayload::DrainStart);

        loop {
            if cancel.is_cancelled() {
                break;
            }
            self.set_status(DrainStatus::Selecting);
            let Some(bead) = self.select(&cancel).await else {
                break;
            };

            self.set_status(DrainStatus::Working);
            self.work_bead(&bead, &cancel).await;

            if self.opts.once {
                break;
            }
        }

        self.set_status(DrainStatus::Stopped);
        self.emit(EventPayload::DrainStop);
        Ok(())
    }

    /// Poll the workqueue, sleeping with doubling backoff while it is empty.
    /// Returns `None` when cancelled.
    async fn select(&self, cancel: &CancellationToken) -> Option<Bead> {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            let skip: HashSet<String> = {
                let state = self.sink.snapshot();
                state
                    .history
                    .values()
                    .filter(|h| state.is_abandoned(&h.id))
                    .map(|h| h.id.clone())
                    .collect()
            };
            match self.queue.next_bead(&skip) {
                Ok(Some(bead)) => return Some(bead),
                Ok(None) => {}
                Err(e) => self.emit(EventPayload::Error {
                    message: format!("workqueue error: {e}"),
                }),
            }

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.opts.selection_backoff_max);
        }
    }

    /// Work one bead through retries until it completes, is abandoned, or
    /// the drain is cancelled.
    async fn work_bead(&self, bead: &Bead, cancel: &CancellationToken) {
        let starting_state = self.sink.snapshot();
        let mut attempt = starting_state.attempts(&bead.id) + 1;
        let mut resume = starting_state
            .last_session_id(&bead.id)
            .map(str::to_owned);

        loop {
            self.emit(EventPayload::IterationStart {
                bead_id: bead.id.clone(),
                title: bead.title.clone(),
                priority: bead.priority,
                attempt,
            });

            let started = Instant::now();
            let outcome = self.run_iteration(bead, resume.take(), cancel).await;

            let (success, error, cancelled) = match outcome {
                Ok(outcome) => {
                    resume = outcome.session_id.clone();
                    let success = outcome.succeeded();
                    self.emit(EventPayload::IterationEnd {
                        bead_id: bead.id.clone(),
                        attempt,
                        success,
                        num_turns: outcome.num_turns,
                        total_cost_usd: outcome.total_cost_usd,
                        duration_ms: outcome.duration_ms,
                        error: failure_reason(&outcome),
                        session_id: outcome.session_id.clone(),
                    });
                    (
                        success,
                        failure_reason(&outcome),
                        outcome.end == SessionEnd::Cancelled,
                    )
                }
                Err(e) => {
                    let message = e.to_string();
                    self.emit(EventPayload::Error {
                        message: message.clone(),
                    });
                    self.emit(EventPayload::IterationEnd {
                        bead_id: bead.id.clone(),
                        attempt,
                        success: false,
                        num_turns: 0,
                        total_cost_usd: 0.0,
                        duration_ms: started.elapsed().as_millis() as u64,
                        error: Some(message.clone()),
                        session_id: None,
                    });
                    (false, Some(message), cancel.is_cancelled())
                }
            };

            if success {
                return;
            }
            if cancelled || cancel.is_cancelled() {
                self.set_status(DrainStatus::DrainingOut);
                return;
            }
            if attempt >= self.opts.max_failures {
                self.emit(EventPayload::BeadAbandoned {
                    bead_id: bead.id.clone(),
                    attempts: attempt,
                    error: error.unwrap_or_else(|| "failure budget exhausted".into()),
                });
                return;
            }
            attempt += 1;
        }
    }

    /// One attempt: hold the broker (if configured) around spawn and drive.
    async fn run_iteration(
        &self,
        bead: &Bead,
        resume: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<SessionOutcome> {
        if let Some(broker) = &self.broker {
            broker.acquire("drain", ACQUIRE_TIMEOUT, cancel).await?;
        }
        let result = self.drive_session(bead, resume, cancel).await;
        if let Some(broker) = &self.broker {
            broker.release();
        }
        result
    }

    async fn drive_session(
        &self,
        bead: &Bead,
        resume: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<SessionOutcome> {
        let mut command = ClaudeCommand::new(
            &self.opts.claude_binary,
            &self.opts.model,
            build_prompt(bead),
        );
        if let Some(session_id) = resume {
            command = command.resume(session_id);
        }

        let child = command.start(self.runner.as_ref())?;
        let driver = SessionDriver::new(
            &self.router,
            SessionConfig {
                bead_id: bead.id.clone(),
                title: bead.title.clone(),
                idle_timeout: self.opts.idle_timeout,
            },
        );
        Ok(driver.run(child, cancel).await)
    }
}

/// Human-readable reason an attempt did not succeed, `None` on success.
fn failure_reason(outcome: &SessionOutcome) -> Option<String> {
    if outcome.succeeded() {
        return None;
    }
    if let Some(error) = &outcome.error {
        return Some(error.clone());
    }
    if outcome.result_error {
        return Some("session ended with an error result".into());
    }
    Some("bead was not closed".into())
}

/// The working prompt handed to the assistant for one bead.
fn build_prompt(bead: &Bead) -> String {
    let mut prompt = format!(
        "Work the issue {id}: {title}\n\n{description}\n\n\
         When the work is complete and verified, close the issue by running \
         `bd close {id}` with a short resolution note. If you cannot finish, \
         leave the issue open and explain what is blocking.",
        id = bead.id,
        title = bead.title,
        description = bead.description,
    );
    if bead.description.is_empty() {
        prompt = prompt.replace("\n\n\n\n", "\n\n");
    }
    prompt
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Subscription;
    use claude_driver::ChildHandle;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::process::Stdio;
    use tempfile::{NamedTempFile, TempDir};

    const INIT: &str = r#"{"type":"system","subtype":"init","session_id":"sess-good-1","model":"m"}"#;
    const CLOSE_TOOL: &str = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","id":"C","name":"Bash","input":{"command":"bd close bd-001 -r fixed"}}]},"session_id":"sess-good-1"}"#;
    const CLOSE_RESULT: &str = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"C","content":"closed","is_error":false}]},"session_id":"sess-good-1"}"#;
    const RESULT: &str = r#"{"type":"result","subtype":"success","session_id":"sess-good-1","num_turns":2,"duration_ms":900,"total_cost_usd":0.10,"is_error":false,"result":"done"}"#;

    /// Runner that serves one scripted stdout per spawn and records the
    /// argument vector of every start call.
    struct ScriptRunner {
        scripts: Mutex<VecDeque<Vec<String>>>,
        calls: Mutex<Vec<Vec<String>>>,
        files: Mutex<Vec<NamedTempFile>>,
    }

    impl ScriptRunner {
        fn new(scripts: Vec<Vec<&str>>) -> Self {
            Self {
                scripts: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|lines| lines.into_iter().map(str::to_owned).collect())
                        .collect(),
                ),
                calls: Mutex::new(Vec::new()),
                files: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ProcessRunner for ScriptRunner {
        fn start(&self, _program: &str, args: &[String]) -> claude_driver::Result<ChildHandle> {
            self.calls.lock().unwrap().push(args.to_vec());
            let lines = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_default();

            let mut f = NamedTempFile::new().unwrap();
            for line in &lines {
                writeln!(f, "{line}").unwrap();
            }
            let mut cmd = tokio::process::Command::new("cat");
            cmd.arg(f.path()).stdin(Stdio::null()).stderr(Stdio::null());
            let child = ChildHandle::spawn(cmd, "cat")?;
            self.files.lock().unwrap().push(f);
            Ok(child)
        }
    }

    /// Queue that serves a fixed list once, then reports empty.
    struct FixedQueue {
        beads: Mutex<VecDeque<Bead>>,
    }

    impl FixedQueue {
        fn new(ids: &[&str]) -> Self {
            Self {
                beads: Mutex::new(
                    ids.iter()
                        .map(|id| Bead {
                            id: (*id).into(),
                            title: format!("title of {id}"),
                            description: "desc".into(),
                            status: "ready".into(),
                            priority: 1,
                            issue_type: "bug".into(),
                            created_at: None,
                            created_by: None,
                        })
                        .collect(),
                ),
            }
        }
    }

    impl WorkQueue for FixedQueue {
        fn next_bead(&self, skip: &HashSet<String>) -> Result<Option<Bead>> {
            let mut beads = self.beads.lock().unwrap();
            while let Some(bead) = beads.pop_front() {
                if !skip.contains(&bead.id) {
                    return Ok(Some(bead));
                }
            }
            Ok(None)
        }
    }

    struct Fixture {
        controller: DrainController,
        sub: Subscription,
        runner: Arc<ScriptRunner>,
        _dir: TempDir,
    }

    fn fixture(scripts: Vec<Vec<&str>>, queue_ids: &[&str], max_failures: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let router = Arc::new(EventRouter::new());
        let sub = router.subscribe_with_capacity(1000);
        let sink = Arc::new(
            StateSink::open(&dir.path().join("state.json"), Duration::ZERO).unwrap(),
        );
        let runner = Arc::new(ScriptRunner::new(scripts));
        let controller = DrainController::new(
            Arc::clone(&router),
            Arc::new(FixedQueue::new(queue_ids)),
            Arc::clone(&runner) as Arc<dyn ProcessRunner>,
            None,
            sink,
            DrainOptions {
                model: "m".into(),
                claude_binary: "claude".into(),
                max_failures,
                idle_timeout: Duration::from_secs(5),
                selection_backoff_max: Duration::from_secs(1),
                once: true,
            },
        );
        Fixture {
            controller,
            sub,
            runner,
            _dir: dir,
        }
    }

    fn drain_payloads(sub: &mut Subscription) -> Vec<EventPayload> {
        let mut payloads = Vec::new();
        while let Some(event) = sub.try_recv() {
            payloads.push(event.payload);
        }
        payloads
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn successful_iteration_closes_out() {
        let mut fx = fixture(
            vec![vec![INIT, CLOSE_TOOL, CLOSE_RESULT, RESULT]],
            &["bd-001"],
            3,
        );
        fx.controller.run(CancellationToken::new()).await.unwrap();

        let payloads = drain_payloads(&mut fx.sub);
        assert!(matches!(payloads.first(), Some(EventPayload::DrainStart)));
        assert!(matches!(payloads.last(), Some(EventPayload::DrainStop)));

        let ends: Vec<_> = payloads
            .iter()
            .filter_map(|p| match p {
                EventPayload::IterationEnd {
                    success, attempt, ..
                } => Some((*success, *attempt)),
                _ => None,
            })
            .collect();
        assert_eq!(ends, vec![(true, 1)]);
        assert_eq!(fx.controller.status(), DrainStatus::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failures_retry_then_abandon() {
        // Two attempts allowed; both sessions end without closing the bead.
        let mut fx = fixture(
            vec![vec![INIT, RESULT], vec![INIT, RESULT]],
            &["bd-001"],
            2,
        );
        fx.controller.run(CancellationToken::new()).await.unwrap();

        let payloads = drain_payloads(&mut fx.sub);
        let attempts: Vec<_> = payloads
            .iter()
            .filter_map(|p| match p {
                EventPayload::IterationStart { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(attempts, vec![1, 2]);

        assert!(payloads.iter().any(|p| matches!(
            p,
            EventPayload::BeadAbandoned { bead_id, attempts: 2, .. } if bead_id == "bd-001"
        )));

        // Retry resumed the first session.
        let calls = fx.runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(&calls[1][..2], &["--resume", "sess-good-1"]);
        assert!(!calls[0].iter().any(|a| a == "--resume"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spawn_failure_counts_as_attempt() {
        struct FailingRunner;
        impl ProcessRunner for FailingRunner {
            fn start(&self, program: &str, _args: &[String]) -> claude_driver::Result<ChildHandle> {
                Err(claude_driver::DriverError::Spawn {
                    program: program.into(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
                })
            }
        }

        let dir = TempDir::new().unwrap();
        let router = Arc::new(EventRouter::new());
        let mut sub = router.subscribe_with_capacity(1000);
        let sink = Arc::new(
            StateSink::open(&dir.path().join("state.json"), Duration::ZERO).unwrap(),
        );
        let controller = DrainController::new(
            Arc::clone(&router),
            Arc::new(FixedQueue::new(&["bd-404"])),
            Arc::new(FailingRunner),
            None,
            sink,
            DrainOptions {
                model: "m".into(),
                claude_binary: "claude".into(),
                max_failures: 1,
                idle_timeout: Duration::from_secs(5),
                selection_backoff_max: Duration::from_secs(1),
                once: true,
            },
        );
        controller.run(CancellationToken::new()).await.unwrap();

        let payloads = drain_payloads(&mut sub);
        assert!(payloads.iter().any(|p| matches!(
            p,
            EventPayload::IterationEnd { success: false, .. }
        )));
        assert!(payloads
            .iter()
            .any(|p| matches!(p, EventPayload::BeadAbandoned { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn broker_is_released_after_iteration() {
        let dir = TempDir::new().unwrap();
        let router = Arc::new(EventRouter::new());
        let sink = Arc::new(
            StateSink::open(&dir.path().join("state.json"), Duration::ZERO).unwrap(),
        );
        let broker = Arc::new(SessionBroker::new());
        let runner = Arc::new(ScriptRunner::new(vec![vec![
            INIT,
            CLOSE_TOOL,
            CLOSE_RESULT,
            RESULT,
        ]]));
        let controller = DrainController::new(
            router,
            Arc::new(FixedQueue::new(&["bd-001"])),
            runner,
            Some(Arc::clone(&broker)),
            sink,
            DrainOptions {
                model: "m".into(),
                claude_binary: "claude".into(),
                max_failures: 3,
                idle_timeout: Duration::from_secs(5),
                selection_backoff_max: Duration::from_secs(1),
                once: true,
            },
        );
        controller.run(CancellationToken::new()).await.unwrap();
        assert_eq!(broker.holder(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_during_selection_stops_cleanly() {
        let mut fx = fixture(vec![], &[], 3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        fx.controller.run(cancel).await.unwrap();

        let payloads = drain_payloads(&mut fx.sub);
        assert!(matches!(payloads.last(), Some(EventPayload::DrainStop)));
        assert_eq!(fx.controller.status(), DrainStatus::Stopped);
    }

    #[test]
    fn prompt_names_the_bead_and_close_protocol() {
        let bead = Bead {
            id: "bd-42".into(),
            title: "Fix it".into(),
            description: "details".into(),
            status: "ready".into(),
            priority: 1,
            issue_type: "bug".into(),
            created_at: None,
            created_by: None,
        };
        let prompt = build_prompt(&bead);
        assert!(prompt.contains("bd-42"));
        assert!(prompt.contains("Fix it"));
        assert!(prompt.contains("bd close bd-42"));
    }

    #[test]
    fn status_strings_are_dotted_names() {
        assert_eq!(DrainStatus::DrainingOut.as_str(), "draining-out");
        assert_eq!(DrainStatus::Stopped.to_string(), "stopped");
    }
}
