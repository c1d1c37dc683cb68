//! Bounded-time connection setup.
//!
//! The connect attempt runs on a dedicated thread and races the caller's
//! timer. The loser is abandoned: a late result is dropped together with the
//! channel, which releases whatever the attempt produced.

use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

/// Outcome of a connection attempt. Exactly one of the three.
#[derive(Debug)]
pub enum ConnectOutcome<T> {
    Connected(T),
    TimedOut(Duration),
    Failed(anyhow::Error),
}

impl<T> ConnectOutcome<T> {
    /// Map an immediate (unbounded) open into an outcome.
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::Connected(value),
            Err(err) => Self::Failed(err),
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> ConnectOutcome<U> {
        match self {
            Self::Connected(value) => ConnectOutcome::Connected(f(value)),
            Self::TimedOut(after) => ConnectOutcome::TimedOut(after),
            Self::Failed(err) => ConnectOutcome::Failed(err),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

/// Run `connect` on its own thread and wait at most `timeout` for it.
///
/// The caller never blocks past `timeout` (plus scheduling jitter). A worker
/// that finishes after the deadline finds the receiver gone and drops its
/// result.
pub fn connect_bounded<T, F>(label: &str, timeout: Duration, connect: F) -> ConnectOutcome<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel::<Result<T>>(1);
    let spawned = std::thread::Builder::new()
        .name(format!("connect:{}", label))
        .spawn(move || {
            let _ = tx.send(connect());
        });
    if let Err(err) = spawned {
        return ConnectOutcome::Failed(anyhow!("failed to spawn connect worker: {}", err));
    }

    match rx.recv_timeout(timeout) {
        Ok(Ok(value)) => ConnectOutcome::Connected(value),
        Ok(Err(err)) => ConnectOutcome::Failed(err),
        Err(RecvTimeoutError::Timeout) => ConnectOutcome::TimedOut(timeout),
        Err(RecvTimeoutError::Disconnected) => {
            ConnectOutcome::Failed(anyhow!("connect worker exited without a result"))
        }
    }
}
