//! Retry policy with exponential backoff for reconcile errors
//!
//! Errors are classified as transient or permanent. Transient errors are
//! retried with jittered exponential backoff; the per-session attempt count
//! lives in a [`RetryTracker`] and drives the transient retry budget.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use kube::runtime::controller::Action;
use rand::Rng;
use tracing::{debug, warn};

/// Base delay for exponential backoff (seconds)
const BASE_DELAY_SECS: u64 = 2;

/// Maximum delay between retries (5 minutes)
const MAX_DELAY_SECS: u64 = 300;

#[derive(Debug, Default)]
struct Attempts {
    count: u32,
    last_error: Option<String>,
}

/// Tracks consecutive failed reconciles per session
///
/// Guarded by a std `Mutex` so `error_policy` can record attempts
/// synchronously; the lock is never held across an await point.
#[derive(Debug, Default)]
pub struct RetryTracker {
    /// Map of session UID to attempt state
    attempts: Mutex<HashMap<String, Attempts>>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut HashMap<String, Attempts>) -> T) -> T {
        // A poisoned lock only means another reconcile panicked mid-update
        let mut guard = self
            .attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    /// Record a failure and return the new attempt count
    pub fn increment(&self, uid: &str, error: &str) -> u32 {
        self.with(|attempts| {
            let entry = attempts.entry(uid.to_string()).or_default();
            entry.count += 1;
            entry.last_error = Some(error.to_string());
            entry.count
        })
    }

    /// Forget a session's failures (call on successful reconciliation)
    pub fn reset(&self, uid: &str) {
        self.with(|attempts| {
            attempts.remove(uid);
        });
    }

    pub fn get(&self, uid: &str) -> u32 {
        self.with(|attempts| attempts.get(uid).map(|a| a.count).unwrap_or(0))
    }

    /// Message of the most recent failure
    pub fn last_error(&self, uid: &str) -> Option<String> {
        self.with(|attempts| attempts.get(uid).and_then(|a| a.last_error.clone()))
    }

    /// Drop entries for sessions that no longer exist
    pub fn cleanup(&self, active_uids: &[String]) -> usize {
        self.with(|attempts| {
            let before = attempts.len();
            attempts.retain(|uid, _| active_uids.contains(uid));
            before - attempts.len()
        })
    }

    pub fn len(&self) -> usize {
        self.with(|attempts| attempts.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Error classification for retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network issues, API server unavailability, rate limiting, write conflicts
    Transient,
    /// Invalid specs and ownership conflicts; nothing changes until the object does
    Permanent,
}

/// Jittered exponential delay for the given attempt (1-based)
///
/// 2s, 4s, 8s, ... capped at 5 minutes, then scaled by a random 0.5x-1.5x.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay_secs = (BASE_DELAY_SECS << exponent).min(MAX_DELAY_SECS);
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay_secs as f64 * jitter)
}

/// Minimum time a `Failed` session stays failed before retry number `retry_count + 1`
///
/// Unjittered so repeated reconciles of the same status agree on the deadline.
pub fn session_retry_delay(retry_count: u32) -> Duration {
    Duration::from_secs((BASE_DELAY_SECS << retry_count.min(16)).min(MAX_DELAY_SECS))
}

/// Determine the controller action for a failed reconcile
pub fn compute_backoff(attempt: u32, kind: ErrorKind) -> Action {
    match kind {
        ErrorKind::Transient => {
            let delay = backoff_delay(attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling retry with exponential backoff"
            );
            Action::requeue(delay)
        }
        ErrorKind::Permanent => {
            warn!("Permanent error, waiting for resource change");
            Action::await_change()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_tracker_increment() {
        let tracker = RetryTracker::new();

        assert_eq!(tracker.get("uid-1"), 0);
        assert_eq!(tracker.increment("uid-1", "boom"), 1);
        assert_eq!(tracker.increment("uid-1", "bang"), 2);
        assert_eq!(tracker.get("uid-1"), 2);
        assert_eq!(tracker.last_error("uid-1").as_deref(), Some("bang"));
    }

    #[test]
    fn test_retry_tracker_reset() {
        let tracker = RetryTracker::new();

        tracker.increment("uid-1", "boom");
        tracker.increment("uid-1", "boom");
        tracker.reset("uid-1");

        assert_eq!(tracker.get("uid-1"), 0);
        assert!(tracker.last_error("uid-1").is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_retry_tracker_cleanup() {
        let tracker = RetryTracker::new();

        tracker.increment("uid-1", "e");
        tracker.increment("uid-2", "e");
        tracker.increment("uid-3", "e");

        let removed = tracker.cleanup(&["uid-1".to_string(), "uid-3".to_string()]);

        assert_eq!(removed, 1);
        assert_eq!(tracker.get("uid-1"), 1);
        assert_eq!(tracker.get("uid-2"), 0);
        assert_eq!(tracker.get("uid-3"), 1);
    }

    #[test]
    fn test_backoff_delay_bounds() {
        for _ in 0..50 {
            let first = backoff_delay(1);
            assert!(first >= Duration::from_secs(1) && first <= Duration::from_secs(3));

            let capped = backoff_delay(30);
            assert!(capped >= Duration::from_secs(150) && capped <= Duration::from_secs(450));
        }
    }

    #[test]
    fn test_session_retry_delay() {
        assert_eq!(session_retry_delay(0), Duration::from_secs(2));
        assert_eq!(session_retry_delay(1), Duration::from_secs(4));
        assert_eq!(session_retry_delay(2), Duration::from_secs(8));
        assert_eq!(session_retry_delay(20), Duration::from_secs(300));
    }

    #[test]
    fn test_compute_backoff_transient() {
        let action = compute_backoff(1, ErrorKind::Transient);
        let debug = format!("{:?}", action);
        assert!(
            debug.contains("Some"),
            "Expected requeue (Some duration): {debug}"
        );
    }

    #[test]
    fn test_compute_backoff_permanent() {
        let action = compute_backoff(1, ErrorKind::Permanent);
        assert_eq!(action, Action::await_change());
    }
}
