//! Worker execution modes.

use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Mode the worker binary is launched in (`--mode <mode>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Long-running sync; streams deltas until it exits.
    Sync,
    /// Run database migrations and exit.
    Migrate,
    /// Verify account settings and exit.
    Test,
    /// Drop the local cache for an account and exit.
    Reset,
}

impl Mode {
    /// Wire name passed on the command line.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Migrate => "migrate",
            Self::Test => "test",
            Self::Reset => "reset",
        }
    }

    /// Whether this mode streams deltas instead of producing one result.
    #[must_use]
    pub const fn is_streaming(self) -> bool {
        matches!(self, Self::Sync)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Self::Sync),
            "migrate" => Ok(Self::Migrate),
            "test" => Ok(Self::Test),
            "reset" => Ok(Self::Reset),
            other => Err(Error::Config(format!("unknown worker mode: {other}"))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        for mode in [Mode::Sync, Mode::Migrate, Mode::Test, Mode::Reset] {
            assert_eq!(mode.as_str().parse::<Mode>().unwrap(), mode);
            assert_eq!(mode.to_string(), mode.as_str());
        }
        assert!("Sync".parse::<Mode>().is_err());
    }

    #[test]
    fn test_only_sync_streams() {
        assert!(Mode::Sync.is_streaming());
        assert!(!Mode::Migrate.is_streaming());
        assert!(!Mode::Test.is_streaming());
        assert!(!Mode::Reset.is_streaming());
    }
}
