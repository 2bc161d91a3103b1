//! Cross-surface completion notifier.
//!
//! One instance per process, created at startup and passed by `Arc` —
//! an explicit, injectable object rather than an ambient global, so it
//! can be unit-tested in isolation.
//!
//! Two delivery paths:
//! - **Live**: a broadcast channel every mounted view subscribes to.
//! - **Degraded**: a pending-change registry that a view checks on
//!   activation, for changes published while it was not mounted.
//!   At-least-once with consumer-side dedup: each surface id consumes
//!   a given change exactly once.
//!
//! A detail view opened from a list additionally gets a one-shot
//! return channel so the parent reconciles immediately on return,
//! without waiting for its next poll.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

/// A completion state change, as seen by sibling views.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionEvent {
    pub instance_id: String,
    pub completed: bool,
    /// RFC 3339.
    pub at: String,
}

struct PendingChange {
    completed: bool,
    at: String,
    consumed_by: HashSet<String>,
}

pub struct SurfaceNotifier {
    tx: broadcast::Sender<CompletionEvent>,
    pending: Mutex<HashMap<String, PendingChange>>,
}

impl SurfaceNotifier {
    pub fn new() -> Self {
        // Slow subscribers lag rather than block the publisher; a
        // lagged view falls back to take_pending on its next activation.
        let (tx, _) = broadcast::channel(64);
        Self {
            tx,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a state change to all mounted views and record it for
    /// views that are not. Overwrite-per-instance, last write wins —
    /// the payload is a boolean with a timestamp, not an accumulator.
    pub fn publish(&self, event: CompletionEvent) {
        {
            let mut pending = self.pending.lock().unwrap();
            pending.insert(
                event.instance_id.clone(),
                PendingChange {
                    completed: event.completed,
                    at: event.at.clone(),
                    consumed_by: HashSet::new(),
                },
            );
        }
        // No receivers mounted is fine; the registry covers them.
        let _ = self.tx.send(event);
    }

    /// Subscribe a mounted view to live events.
    pub fn subscribe(&self) -> broadcast::Receiver<CompletionEvent> {
        self.tx.subscribe()
    }

    /// Changes this surface has not consumed yet. Called on view
    /// activation; marks everything returned as consumed by
    /// `surface_id` so a re-activation does not replay it.
    pub fn take_pending(&self, surface_id: &str) -> Vec<CompletionEvent> {
        let mut pending = self.pending.lock().unwrap();
        let mut out = Vec::new();
        for (instance_id, change) in pending.iter_mut() {
            if change.consumed_by.insert(surface_id.to_string()) {
                out.push(CompletionEvent {
                    instance_id: instance_id.clone(),
                    completed: change.completed,
                    at: change.at.clone(),
                });
            }
        }
        if !out.is_empty() {
            debug!("surface {} caught up on {} pending changes", surface_id, out.len());
        }
        out
    }

    /// One-shot parent→child return channel. The child sends at most
    /// one event when it is left; the parent awaits it on return.
    pub fn return_channel() -> (ReturnSender, ReturnReceiver) {
        let (tx, rx) = oneshot::channel();
        (ReturnSender { tx: Some(tx) }, ReturnReceiver { rx })
    }
}

impl Default for SurfaceNotifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Child half of the return channel. Fire-and-forget: sending when the
/// parent is gone is a no-op.
pub struct ReturnSender {
    tx: Option<oneshot::Sender<CompletionEvent>>,
}

impl ReturnSender {
    pub fn send(&mut self, event: CompletionEvent) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(event);
        }
    }
}

/// Parent half of the return channel.
pub struct ReturnReceiver {
    rx: oneshot::Receiver<CompletionEvent>,
}

impl ReturnReceiver {
    /// The event the child sent, if any. Resolves to None when the
    /// child was torn down without sending.
    pub async fn recv(self) -> Option<CompletionEvent> {
        self.rx.await.ok()
    }
}
