//! Lifecycle of one tunnel.
//!
//! A [`Session`] is shared by reference between the pipelines of a tunnel. Each
//! pipeline owns one half of a transport and closes it when it observes termination,
//! so every socket is closed exactly once, by its owner, after the first
//! [`Session::terminate`] call.

use std::sync::{
    OnceLock,
    atomic::{AtomicBool, Ordering},
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

/// Why a session ended. Only the first cause is retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Cause {
    #[error("client closed the WebSocket")]
    ClientClosed,
    #[error("client transport failed")]
    ClientError,
    #[error("sending to the client failed")]
    ClientSendFailed,
    #[error("target closed the connection")]
    TargetClosed,
    #[error("reading from the target failed")]
    TargetReadFailed,
    #[error("writing to the target failed")]
    TargetWriteFailed,
    #[error("uplink queue overflowed")]
    UplinkOverflow,
}

#[derive(Debug)]
pub struct Session {
    terminated: AtomicBool,
    cause: OnceLock<Cause>,
    signal: watch::Sender<bool>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    #[must_use]
    pub fn new() -> Self {
        Self {
            terminated: AtomicBool::new(false),
            cause: OnceLock::new(),
            signal: watch::Sender::new(false),
        }
    }

    /// Marks the session terminated and wakes every pipeline. Idempotent.
    pub fn terminate(&self, cause: Cause) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.cause.set(cause);
        debug!(cause = %cause, "Session terminating");
        self.signal.send_replace(true);
    }

    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn cause(&self) -> Option<Cause> {
        self.cause.get().copied()
    }

    /// Resolves once the session is terminated; immediately if it already is
    pub async fn terminated(&self) {
        let mut receiver = self.signal.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = receiver.wait_for(|done| *done).await;
    }
}
