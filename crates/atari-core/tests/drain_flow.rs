//! End-to-end drain flow: a scripted assistant subprocess drives the full
//! pipeline (controller → session driver → router → sinks), then the
//! observer answers a question over the log the run produced.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::Write;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::{NamedTempFile, TempDir};
use tokio_util::sync::CancellationToken;

use atari_core::beads::{Bead, WorkQueue};
use atari_core::drain::{DrainController, DrainOptions};
use atari_core::event::{Decoded, EventPayload};
use atari_core::log_reader::LogReader;
use atari_core::log_sink::LogSink;
use atari_core::observer::{Observer, ObserverOptions};
use atari_core::router::EventRouter;
use atari_core::state::{BeadStatus, DrainState, CURRENT_VERSION};
use atari_core::state_sink::{DrainStateProvider, StateSink};
use claude_driver::{ChildHandle, ProcessRunner};

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Serves one scripted stdout per spawn via `cat`.
struct ScriptRunner {
    scripts: Mutex<VecDeque<Vec<String>>>,
    files: Mutex<Vec<NamedTempFile>>,
}

impl ScriptRunner {
    fn new(scripts: Vec<Vec<String>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            files: Mutex::new(Vec::new()),
        }
    }
}

impl ProcessRunner for ScriptRunner {
    fn start(&self, _program: &str, _args: &[String]) -> claude_driver::Result<ChildHandle> {
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

struct FixedQueue {
    beads: Mutex<VecDeque<Bead>>,
}

impl WorkQueue for FixedQueue {
    fn next_bead(&self, skip: &HashSet<String>) -> atari_core::Result<Option<Bead>> {
        let mut beads = self.beads.lock().unwrap();
        while let Some(bead) = beads.pop_front() {
            if !skip.contains(&bead.id) {
                return Ok(Some(bead));
            }
        }
        Ok(None)
    }
}

fn bead(id: &str) -> Bead {
    Bead {
        id: id.into(),
        title: format!("title of {id}"),
        description: "do the thing".into(),
        status: "ready".into(),
        priority: 1,
        issue_type: "bug".into(),
        created_at: None,
        created_by: None,
    }
}

fn session_script(session_id: &str, bead_id: &str, cost: f64, turns: u32) -> Vec<String> {
    vec![
        format!(r#"{{"type":"system","subtype":"init","session_id":"{session_id}","model":"m"}}"#),
        format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"on it"}},{{"type":"tool_use","id":"t1","name":"Read","input":{{"file_path":"src/lib.rs"}}}},{{"type":"tool_use","id":"t2","name":"Bash","input":{{"command":"cargo test"}}}}]}},"session_id":"{session_id}"}}"#
        ),
        format!(
            r#"{{"type":"user","message":{{"content":[{{"type":"tool_result","tool_use_id":"t1","content":"source","is_error":false}}]}},"session_id":"{session_id}"}}"#
        ),
        format!(
            r#"{{"type":"user","message":{{"content":[{{"type":"tool_result","tool_use_id":"t2","content":"ok","is_error":false}}]}},"session_id":"{session_id}"}}"#
        ),
        format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"tool_use","id":"t3","name":"Bash","input":{{"command":"bd close {bead_id} -r done"}}}}]}},"session_id":"{session_id}"}}"#
        ),
        format!(
            r#"{{"type":"user","message":{{"content":[{{"type":"tool_result","tool_use_id":"t3","content":"closed","is_error":false}}]}},"session_id":"{session_id}"}}"#
        ),
        format!(
            r#"{{"type":"result","subtype":"success","session_id":"{session_id}","num_turns":{turns},"duration_ms":1200,"total_cost_usd":{cost},"is_error":false,"result":"done"}}"#
        ),
    ]
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn full_drain_run_produces_consistent_log_and_state() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join(".atari/atari.log");
    let state_path = dir.path().join(".atari/state.json");

    let router = Arc::new(EventRouter::new());
    let log_sink = LogSink::open(&log_path).unwrap();
    let state_sink = Arc::new(StateSink::open(&state_path, Duration::ZERO).unwrap());

    let log_sub = router.subscribe();
    let state_sub = router.subscribe_with_capacity(1000);
    let log_task = tokio::spawn(log_sink.run(log_sub, CancellationToken::new()));
    let state_task = {
        let sink = Arc::clone(&state_sink);
        tokio::spawn(async move { sink.run(state_sub, CancellationToken::new()).await })
    };

    let runner = Arc::new(ScriptRunner::new(vec![
        session_script("sess-aaaa-1111", "bd-001", 0.25, 3),
        session_script("sess-bbbb-2222", "bd-002", 0.15, 2),
    ]));
    let queue = Arc::new(FixedQueue {
        beads: Mutex::new([bead("bd-001"), bead("bd-002")].into()),
    });

    let controller = DrainController::new(
        Arc::clone(&router),
        queue,
        runner,
        None,
        Arc::clone(&state_sink),
        DrainOptions {
            model: "m".into(),
            claude_binary: "claude".into(),
            max_failures: 3,
            idle_timeout: Duration::from_secs(5),
            selection_backoff_max: Duration::from_millis(100),
            once: false,
        },
    );

    // Stop the drain shortly after the queue runs dry.
    let cancel = CancellationToken::new();
    let stopper = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            cancel.cancel();
        })
    };
    controller.run(cancel).await.unwrap();
    stopper.await.unwrap();

    router.close();
    log_task.await.unwrap();
    state_task.await.unwrap();

    // Persisted state: both beads completed, totals summed exactly once.
    let state = DrainState::load(&state_path).unwrap();
    assert_eq!(state.version, CURRENT_VERSION);
    assert_eq!(state.status, "stopped");
    assert_eq!(state.iteration, 2);
    assert!((state.total_cost - 0.40).abs() < 1e-9);
    assert_eq!(state.total_turns, 5);
    assert_eq!(state.history["bd-001"].status, BeadStatus::Completed);
    assert_eq!(state.history["bd-002"].status, BeadStatus::Completed);
    assert_eq!(
        state.history["bd-001"].last_session_id.as_deref(),
        Some("sess-aaaa-1111")
    );

    // Log file: every line decodes (or is a known-unknown), and the
    // session-level invariants hold across the whole run.
    let data = std::fs::read_to_string(&log_path).unwrap();
    let mut events = Vec::new();
    for line in data.lines() {
        match atari_core::event::decode_line(line).unwrap() {
            Decoded::Event(event) => events.push(event),
            Decoded::Unknown => {}
        }
    }

    // Every tool_result is preceded by a matching tool_use.
    let mut seen_uses = HashSet::new();
    for event in &events {
        match &event.payload {
            EventPayload::ToolUse { tool_id, .. } => {
                seen_uses.insert(tool_id.clone());
            }
            EventPayload::ToolResult { tool_id, .. } => {
                assert!(seen_uses.contains(tool_id), "orphan tool_result {tool_id}");
            }
            _ => {}
        }
    }

    // Turn numbers increase from 1 within each session.
    let mut turns_per_session: HashMap<String, u32> = HashMap::new();
    let mut current_session = String::new();
    for event in &events {
        match &event.payload {
            EventPayload::SessionStart { bead_id, .. } => {
                current_session = bead_id.clone();
            }
            EventPayload::TurnComplete { turn_number, .. } => {
                let last = turns_per_session
                    .entry(current_session.clone())
                    .or_insert(0);
                assert_eq!(*turn_number, *last + 1);
                *last = *turn_number;
            }
            _ => {}
        }
    }
    assert_eq!(turns_per_session.len(), 2);

    // The drain lifecycle brackets the run.
    assert!(matches!(events.first().map(|e| &e.payload), Some(EventPayload::DrainStart)));
    assert!(matches!(events.last().map(|e| &e.payload), Some(EventPayload::DrainStop)));
}

#[tokio::test(flavor = "multi_thread")]
async fn observer_answers_over_the_drained_log() {
    let dir = TempDir::new().unwrap();
    let log_path = dir.path().join(".atari/atari.log");
    let state_path = dir.path().join(".atari/state.json");

    // Produce a log with one completed bead.
    {
        let router = Arc::new(EventRouter::new());
        let log_sink = LogSink::open(&log_path).unwrap();
        let state_sink = Arc::new(StateSink::open(&state_path, Duration::ZERO).unwrap());
        let log_sub = router.subscribe();
        let state_sub = router.subscribe_with_capacity(1000);
        let log_task = tokio::spawn(log_sink.run(log_sub, CancellationToken::new()));
        let state_task = {
            let sink = Arc::clone(&state_sink);
            tokio::spawn(async move { sink.run(state_sub, CancellationToken::new()).await })
        };

        let controller = DrainController::new(
            Arc::clone(&router),
            Arc::new(FixedQueue {
                beads: Mutex::new([bead("bd-001")].into()),
            }),
            Arc::new(ScriptRunner::new(vec![session_script(
                "sess-aaaa-1111",
                "bd-001",
                0.25,
                3,
            )])),
            None,
            Arc::clone(&state_sink),
            DrainOptions {
                model: "m".into(),
                claude_binary: "claude".into(),
                max_failures: 3,
                idle_timeout: Duration::from_secs(5),
                selection_backoff_max: Duration::from_millis(100),
                once: true,
            },
        );
        controller.run(CancellationToken::new()).await.unwrap();
        router.close();
        log_task.await.unwrap();
        state_task.await.unwrap();
    }

    struct FileProvider(DrainState);
    impl DrainStateProvider for FileProvider {
        fn snapshot(&self) -> DrainState {
            self.0.clone()
        }
        fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
            self.0.updated_at
        }
    }

    let state = DrainState::load(&state_path).unwrap();
    let answer_script = vec![
        r#"{"type":"system","subtype":"init","session_id":"obs-1234-5678","model":"m"}"#.to_owned(),
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"bd-001 completed in one attempt."}]},"session_id":"obs-1234-5678"}"#.to_owned(),
        r#"{"type":"result","subtype":"success","session_id":"obs-1234-5678","num_turns":1,"duration_ms":50,"total_cost_usd":0.01,"is_error":false,"result":"bd-001 completed in one attempt."}"#.to_owned(),
    ];

    let observer = Observer::new(
        ObserverOptions {
            model: "m".into(),
            claude_binary: "claude".into(),
            query_timeout: Duration::from_secs(10),
            context_events: 20,
        },
        Arc::new(ScriptRunner::new(vec![answer_script])),
        Arc::new(LogReader::new(&log_path)),
        Arc::new(FileProvider(state)),
        None,
    );

    let answer = observer.ask("what happened to bd-001?").await.unwrap();
    assert_eq!(answer, "bd-001 completed in one attempt.");
    assert_eq!(observer.history().len(), 1);
}
