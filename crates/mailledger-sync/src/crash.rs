//! Crash history for sync workers.
//!
//! A worker that keeps crashing is not restarted forever. Each account keeps
//! a short history of crash times; once too many fall into the window the
//! account is flagged until [`CrashTracker::forget`] is called.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use tracing::warn;

/// Number of crash timestamps kept per account.
pub const MAX_CRASH_HISTORY: usize = 10;

/// Crashes within [`CRASH_WINDOW`] that flag an account.
pub const MAX_CRASHES_IN_WINDOW: usize = 5;

/// Window for [`MAX_CRASHES_IN_WINDOW`].
pub const CRASH_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Markers of an authentication failure in a worker error.
const AUTH_FAILURE_MARKERS: [&str; 3] = [
    "Response Code: 401",
    "Response Code: 403",
    "ErrorAuthentication",
];

/// Per-account crash history.
#[derive(Debug, Default)]
pub struct CrashTracker {
    history: HashMap<String, VecDeque<Instant>>,
    failing: HashSet<String>,
}

impl CrashTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a crash now. Returns `true` if the account is now flagged.
    pub fn record_crash(&mut self, key: &str) -> bool {
        self.record_crash_at(key, Instant::now())
    }

    /// Records a crash at `at`. Returns `true` if the account is now flagged.
    pub fn record_crash_at(&mut self, key: &str, at: Instant) -> bool {
        let history = self.history.entry(key.to_string()).or_default();
        history.push_back(at);
        while history.len() > MAX_CRASH_HISTORY {
            history.pop_front();
        }

        let recent = history
            .iter()
            .filter(|t| at.saturating_duration_since(**t) < CRASH_WINDOW)
            .count();
        if recent >= MAX_CRASHES_IN_WINDOW && self.failing.insert(key.to_string()) {
            warn!(account = key, crashes = recent, "sync worker is crashing repeatedly");
        }
        self.failing.contains(key)
    }

    /// Whether the account has been flagged.
    #[must_use]
    pub fn too_many_failures(&self, key: &str) -> bool {
        self.failing.contains(key)
    }

    /// Number of crashes remembered for the account.
    #[must_use]
    pub fn crash_count(&self, key: &str) -> usize {
        self.history.get(key).map_or(0, VecDeque::len)
    }

    /// Clears the history and the flag, e.g. after the user edited settings.
    pub fn forget(&mut self, key: &str) {
        self.history.remove(key);
        self.failing.remove(key);
    }
}

/// Whether a worker error text indicates rejected credentials.
#[must_use]
pub fn is_auth_failure(text: &str) -> bool {
    AUTH_FAILURE_MARKERS.iter().any(|m| text.contains(m))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_five_quick_crashes_flag_account() {
        let mut tracker = CrashTracker::new();
        let start = Instant::now();
        for i in 0..4 {
            assert!(!tracker.record_crash_at("a", start + Duration::from_secs(i * 10)));
        }
        assert!(tracker.record_crash_at("a", start + Duration::from_secs(40)));
        assert!(tracker.too_many_failures("a"));
        assert!(!tracker.too_many_failures("b"));
    }

    #[test]
    fn test_spread_out_crashes_do_not_flag() {
        let mut tracker = CrashTracker::new();
        let start = Instant::now();
        for i in 0..12 {
            assert!(!tracker.record_crash_at("a", start + Duration::from_secs(i * 120)));
        }
        assert_eq!(tracker.crash_count("a"), MAX_CRASH_HISTORY);
    }

    #[test]
    fn test_forget_clears_flag() {
        let mut tracker = CrashTracker::new();
        let now = Instant::now();
        for _ in 0..5 {
            tracker.record_crash_at("a", now);
        }
        assert!(tracker.too_many_failures("a"));

        tracker.forget("a");
        assert!(!tracker.too_many_failures("a"));
        assert_eq!(tracker.crash_count("a"), 0);
    }

    #[test]
    fn test_auth_failure_markers() {
        assert!(is_auth_failure("IMAP: Response Code: 401 Unauthorized"));
        assert!(is_auth_failure("Response Code: 403"));
        assert!(is_auth_failure("ErrorAuthentication"));
        assert!(!is_auth_failure("ErrorConnection"));
    }
}
