//! Progress hints surfaced while a migration runs.

/// A long-running step announced by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressHint {
    /// The database schema is being migrated.
    Migration,
    /// The database is being vacuumed.
    Vacuum,
}

impl ProgressHint {
    /// Looks for a hint marker in one output chunk, ignoring case.
    #[must_use]
    pub fn detect(chunk: &[u8]) -> Option<Self> {
        let text = String::from_utf8_lossy(chunk).to_lowercase();
        if text.contains("running migration") {
            Some(Self::Migration)
        } else if text.contains("running vacuum") {
            Some(Self::Vacuum)
        } else {
            None
        }
    }
}

/// Status window shown to the user during a migration.
///
/// The window itself lives outside this crate. `show` is called at most once
/// per run; `close` is called exactly once when the run ends.
pub trait StatusIndicator: Send {
    /// Shows the window for `hint`.
    fn show(&mut self, hint: ProgressHint);

    /// Closes the window if it was shown.
    fn close(&mut self);
}

/// Indicator that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIndicator;

impl StatusIndicator for NoIndicator {
    fn show(&mut self, _hint: ProgressHint) {}

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect() {
        assert_eq!(
            ProgressHint::detect(b"Running Migration 12 of 14"),
            Some(ProgressHint::Migration)
        );
        assert_eq!(
            ProgressHint::detect(b"running vacuum...\n"),
            Some(ProgressHint::Vacuum)
        );
        assert_eq!(ProgressHint::detect(b"{\"result\":true}\n"), None);
        assert_eq!(ProgressHint::detect(b""), None);
    }
}
