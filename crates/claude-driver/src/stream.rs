use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;

use crate::process::ChildHandle;
use crate::wire::{self, StreamMessage};
use crate::Result;

/// Grace period for reaping the child after its terminal frame or EOF.
const REAP_GRACE: Duration = Duration::from_secs(5);

// ─── MessageStream ────────────────────────────────────────────────────────

/// An async stream of parsed [`StreamMessage`]s from a subprocess.
///
/// A background task owns the [`ChildHandle`], parses each stdout line, and
/// forwards frames until the terminal `result` frame or EOF. Malformed lines
/// are logged and skipped; a stray diagnostic on stdout must not abort a
/// query. Dropping the stream closes the receiver; the pump task then exits
/// on its next send and reaps the child (`kill_on_drop` backstops the rest).
pub struct MessageStream {
    rx: mpsc::Receiver<Result<StreamMessage>>,
}

impl MessageStream {
    pub fn spawn(mut child: ChildHandle) -> Self {
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            loop {
                match child.next_line().await {
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                    Ok(None) => break, // EOF, process exited
                    Ok(Some(line)) => match wire::parse_line(&line) {
                        Err(e) => {
                            tracing::warn!(error = %e, "skipping unparseable stream line");
                        }
                        Ok(None) => {} // blank or unknown frame type
                        Ok(Some(msg)) => {
                            let terminal = matches!(msg, StreamMessage::Result(_));
                            if tx.send(Ok(msg)).await.is_err() {
                                break; // receiver dropped
                            }
                            if terminal {
                                break;
                            }
                        }
                    },
                }
            }
            let _ = child.wait_graceful(REAP_GRACE).await;
        });

        Self { rx }
    }

    /// Test-only constructor: wrap a raw mpsc receiver as a stream.
    #[cfg(test)]
    pub(crate) fn from_channel(rx: mpsc::Receiver<Result<StreamMessage>>) -> Self {
        Self { rx }
    }
}

impl Stream for MessageStream {
    type Item = Result<StreamMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
