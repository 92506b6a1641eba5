use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::event::{Event, EventPayload};
use crate::router::Subscription;
use crate::state::{BeadHistory, BeadStatus, DrainState};

/// Default debounce between snapshots. Tests pass `Duration::ZERO`.
pub const MIN_SAVE_DELAY: Duration = Duration::from_secs(5);

/// Read-only view of drain state for collaborators (the observer).
pub trait DrainStateProvider: Send + Sync {
    fn snapshot(&self) -> DrainState;
    /// When this supervisor process started, for uptime reporting.
    fn started_at(&self) -> DateTime<Utc>;
}

// ---------------------------------------------------------------------------
// StateSink
// ---------------------------------------------------------------------------

/// Debounced, crash-safe snapshot of drain state and per-bead history.
///
/// All mutations are guarded by one mutex; the snapshot write happens under
/// it too, which is acceptable because every producer reaches this sink
/// through a non-blocking queue. Cost accounting is de-duplicated per
/// `(bead_id, attempt)`: whichever of `session.end` / `iteration.end`
/// arrives first contributes the totals, the other is a no-op, and each
/// retry of a bead contributes again.
pub struct StateSink {
    path: PathBuf,
    min_save_delay: Duration,
    started_at: DateTime<Utc>,
    inner: Mutex<Inner>,
}

struct Inner {
    state: DrainState,
    dirty: bool,
    last_save: Option<Instant>,
    counted: HashSet<(String, u32)>,
    /// `(bead_id, attempt)` of the in-flight iteration, for attributing a
    /// `session.end` that arrives before its `iteration.end`.
    current_attempt: Option<(String, u32)>,
}

impl StateSink {
    /// Load (or initialize) the snapshot at `path` and wrap it in a sink.
    pub fn open(path: &Path, min_save_delay: Duration) -> Result<Self> {
        let mut state = DrainState::load(path)?;
        state.normalize_for_resume();
        Ok(Self {
            path: path.to_owned(),
            min_save_delay,
            started_at: Utc::now(),
            inner: Mutex::new(Inner {
                state,
                dirty: false,
                last_save: None,
                counted: HashSet::new(),
                current_attempt: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// React to one event, saving if due (or forced by `drain.stop`).
    pub fn apply(&self, event: &Event) {
        let mut inner = self.lock();
        let force = Self::react(&mut inner, event);
        if inner.dirty {
            let due = inner
                .last_save
                .is_none_or(|at| at.elapsed() >= self.min_save_delay);
            if force || due {
                self.save_locked(&mut inner);
            }
        }
    }

    /// Mutate state for `event`; returns `true` when an immediate save is
    /// required regardless of the debounce window.
    fn react(inner: &mut Inner, event: &Event) -> bool {
        match &event.payload {
            EventPayload::DrainStart => {
                inner.state.status = "running".into();
                inner.dirty = true;
            }
            EventPayload::DrainStateChanged { to, .. } => {
                inner.state.status = to.clone();
                inner.dirty = true;
            }
            EventPayload::DrainStop => {
                inner.state.status = "stopped".into();
                inner.dirty = true;
                return true;
            }
            EventPayload::IterationStart {
                bead_id,
                title,
                attempt,
                ..
            } => {
                inner.state.iteration += 1;
                inner.state.current_bead = Some(bead_id.clone());
                inner.state.active_top_level = Some(bead_id.clone());
                inner.state.active_top_level_title = Some(title.clone());
                inner.current_attempt = Some((bead_id.clone(), *attempt));
                let record = inner
                    .state
                    .history
                    .entry(bead_id.clone())
                    .or_insert_with(|| BeadHistory {
                        id: bead_id.clone(),
                        status: BeadStatus::Pending,
                        attempts: 0,
                        last_attempt: event.timestamp,
                        last_error: None,
                        last_session_id: None,
                    });
                record.status = BeadStatus::Working;
                record.attempts = *attempt;
                record.last_attempt = event.timestamp;
                inner.dirty = true;
            }
            EventPayload::IterationEnd {
                bead_id,
                attempt,
                success,
                num_turns,
                total_cost_usd,
                error,
                session_id,
                ..
            } => {
                inner.state.current_bead = None;
                inner.state.active_top_level = None;
                inner.state.active_top_level_title = None;
                inner.current_attempt = None;

                let key = (bead_id.clone(), *attempt);
                if inner.counted.insert(key) {
                    inner.state.total_cost += total_cost_usd;
                    inner.state.total_turns += u64::from(*num_turns);
                }

                if let Some(record) = inner.state.history.get_mut(bead_id) {
                    record.status = if *success {
                        BeadStatus::Completed
                    } else {
                        BeadStatus::Failed
                    };
                    if let Some(error) = error {
                        record.last_error = Some(error.clone());
                    }
                    if let Some(session_id) = session_id {
                        record.last_session_id = Some(session_id.clone());
                    }
                }
                inner.dirty = true;
            }
            // Fallback for sessions whose iteration.end never arrives.
            EventPayload::SessionEnd {
                num_turns,
                total_cost_usd,
                ..
            } => {
                if let Some(key) = inner.current_attempt.clone() {
                    if inner.counted.insert(key) {
                        inner.state.total_cost += total_cost_usd;
                        inner.state.total_turns += u64::from(*num_turns);
                        inner.dirty = true;
                    }
                }
            }
            EventPayload::BeadAbandoned { bead_id, error, .. } => {
                if let Some(record) = inner.state.history.get_mut(bead_id) {
                    record.status = BeadStatus::Abandoned;
                    record.last_error = Some(error.clone());
                }
                inner.dirty = true;
            }
            _ => {}
        }
        false
    }

    fn save_locked(&self, inner: &mut Inner) {
        inner.state.updated_at = Utc::now();
        match inner.state.save(&self.path) {
            Ok(()) => {
                inner.dirty = false;
                inner.last_save = Some(Instant::now());
            }
            Err(e) => {
                // Keep the dirty flag so the next event retries.
                eprintln!(
                    "warning: failed to save state to {}: {e}",
                    self.path.display()
                );
            }
        }
    }

    /// Save now if anything is unsaved. Called on shutdown.
    pub fn flush(&self) {
        let mut inner = self.lock();
        if inner.dirty {
            self.save_locked(&mut inner);
        }
    }

    /// Consume the subscription until close or cancellation, then flush.
    pub async fn run(&self, mut sub: Subscription, cancel: CancellationToken) {
        loop {
            tokio::select! {
                event = sub.recv() => match event {
                    Some(event) => self.apply(&event),
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        while let Some(event) = sub.try_recv() {
            self.apply(&event);
        }
        self.flush();
    }
}

impl DrainStateProvider for StateSink {
    fn snapshot(&self) -> DrainState {
        self.lock().state.clone()
    }

    fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
