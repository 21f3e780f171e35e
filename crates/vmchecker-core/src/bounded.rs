//! Timeout-bounded execution of blocking guest operations.
//!
//! Guest primitives cannot be cancelled once issued. [`run_bounded`] runs the
//! operation on a dedicated thread and waits for it up to a deadline. When the
//! deadline passes the thread is abandoned: it keeps running against the guest
//! until the underlying call returns on its own, and its result is discarded.

use std::fmt::Display;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// How a bounded operation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bounded {
    /// Finished successfully within the deadline.
    Completed,
    /// Finished within the deadline but returned an error or panicked.
    Failed(String),
    /// Still running when the deadline passed; the thread was abandoned.
    TimedOut,
}

impl Bounded {
    pub fn completed(&self) -> bool {
        matches!(self, Bounded::Completed)
    }
}

/// Run `op` on a helper thread and wait at most `limit` for it.
///
/// Returns `true` only if `op` returned `Ok` in time. Errors and panics inside
/// `op` count as non-completion and never propagate to the caller.
pub async fn run_bounded<F, E>(label: &str, limit: Duration, op: F) -> bool
where
    F: FnOnce() -> Result<(), E> + Send + 'static,
    E: Display,
{
    run_bounded_detailed(label, limit, op).await.completed()
}

/// Like [`run_bounded`] but reports why the operation did not complete.
pub async fn run_bounded_detailed<F, E>(label: &str, limit: Duration, op: F) -> Bounded
where
    F: FnOnce() -> Result<(), E> + Send + 'static,
    E: Display,
{
    let (tx, rx) = oneshot::channel::<Result<(), String>>();
    let start = Instant::now();

    let spawned = thread::Builder::new()
        .name(format!("bounded-{label}"))
        .spawn(move || {
            let result = op().map_err(|e| e.to_string());
            // The receiver is gone once the caller has given up.
            let _ = tx.send(result);
        });
    if let Err(e) = spawned {
        warn!(op = %label, error = %e, "cannot spawn helper thread");
        return Bounded::Failed(e.to_string());
    }

    let outcome = match tokio::time::timeout(limit, rx).await {
        Ok(Ok(Ok(()))) => Bounded::Completed,
        Ok(Ok(Err(e))) => Bounded::Failed(e),
        // sender dropped without a value: the operation panicked
        Ok(Err(_)) => Bounded::Failed("operation panicked".to_string()),
        Err(_) => Bounded::TimedOut,
    };

    let elapsed_ms = start.elapsed().as_millis() as u64;
    match &outcome {
        Bounded::Completed => debug!(op = %label, elapsed_ms, "bounded operation completed"),
        Bounded::Failed(e) => {
            warn!(op = %label, elapsed_ms, error = %e, "bounded operation failed")
        }
        Bounded::TimedOut => warn!(
            op = %label,
            limit_ms = limit.as_millis() as u64,
            "bounded operation timed out; abandoning helper thread"
        ),
    }
    outcome
}
