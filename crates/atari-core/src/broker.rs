use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{AtariError, Result};

// ---------------------------------------------------------------------------
// SessionBroker
// ---------------------------------------------------------------------------

/// Single-slot semaphore coordinating the at-most-one-assistant policy.
///
/// Exactly one holder at a time; holder transitions (drain → observer →
/// drain) are just release-then-acquire. `release` is idempotent so a
/// defensive double-release can never deadlock a waiter.
pub struct SessionBroker {
    slot: Mutex<Option<String>>,
    freed: Notify,
}

impl Default for SessionBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionBroker {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            freed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the slot is free, the timeout expires
    /// ([`AtariError::BrokerTimeout`]), or `cancel` fires
    /// ([`AtariError::Cancelled`]).
    pub async fn acquire(
        &self,
        holder: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let wait = async {
            loop {
                let notified = self.freed.notified();
                if self.try_acquire(holder).is_ok() {
                    return;
                }
                notified.await;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(AtariError::Cancelled),
            outcome = tokio::time::timeout(timeout, wait) => {
                outcome.map_err(|_| AtariError::BrokerTimeout(timeout))
            }
        }
    }

    /// Non-blocking acquire; [`AtariError::Busy`] carries the current holder.
    pub fn try_acquire(&self, holder: &str) -> Result<()> {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some(current) => Err(AtariError::Busy(current.clone())),
            None => {
                *slot = Some(holder.to_owned());
                Ok(())
            }
        }
    }

    /// Free the slot. A release while unheld is a no-op.
    pub fn release(&self) {
        let mut slot = self.lock();
        if slot.take().is_some() {
            self.freed.notify_one();
        }
    }

    /// The current holder name, if any.
    pub fn holder(&self) -> Option<String> {
        self.lock().clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
