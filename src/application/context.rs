//! Per-request cancellation and deadlines.
//!
//! A `RequestContext` is the caller's side of a cancellable call. It is only
//! consulted while a request waits in a queue; once a request has been
//! dispatched its execution always runs to completion.

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Cancellation signal and optional deadline for one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Disconnects when the context is cancelled; nothing is ever sent
    done: Receiver<()>,
    deadline: Option<Instant>,
}

/// Cancels the paired context. Dropping the handle also cancels it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Mutex<Option<Sender<()>>>,
}

impl CancelHandle {
    /// Cancel the context. Idempotent.
    pub fn cancel(&self) {
        self.tx.lock().take();
    }
}

impl RequestContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            done: crossbeam_channel::never(),
            deadline: None,
        }
    }

    /// A cancellable context and its handle.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = crossbeam_channel::bounded(0);
        (
            Self {
                done: rx,
                deadline: None,
            },
            CancelHandle {
                tx: Mutex::new(Some(tx)),
            },
        )
    }

    /// Add a deadline. An earlier existing deadline is kept.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Add a deadline `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// The deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether the context has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.done.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub(crate) fn done(&self) -> &Receiver<()> {
        &self.done
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}
