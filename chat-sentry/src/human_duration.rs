//! Display wrapper for formatting millisecond durations in human form

use std::{
    fmt::{self, Display},
    time::Duration,
};

/// A display wrapper that formats a millisecond count as a compact duration
/// (e.g. "1m30s"), with coarse precision (truncated to whole seconds, and to
/// whole minutes for durations > 1 hour).
///
/// Negative inputs clamp to zero, so an already-elapsed deadline reads "0s".
#[derive(Clone, Copy, Debug)]
pub struct HumanMillis(pub i64);

impl Display for HumanMillis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0.max(0) as u64;
        let mut secs = ms / 1000;

        if secs == 0 && ms > 0 {
            return write!(f, "<1s");
        }

        // Reduce precision to minutes for durations > 1 hour
        if secs > 3600 {
            secs -= secs % 60;
        }

        // Remove spaces for compact format (e.g., "1m30s" not "1m 30s")
        let formatted = humantime::format_duration(Duration::new(secs, 0))
            .to_string()
            .replace(' ', "");
        write!(f, "{formatted}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_human_millis() {
        assert_eq!(HumanMillis(30_000).to_string(), "30s");
        assert_eq!(HumanMillis(90_000).to_string(), "1m30s");
        assert_eq!(HumanMillis(3_600_000).to_string(), "1h");
        // > 1 hour: truncate to minutes
        assert_eq!(HumanMillis(3_700_000).to_string(), "1h1m");
    }

    #[test]
    fn test_human_millis_edges() {
        assert_eq!(HumanMillis(0).to_string(), "0s");
        assert_eq!(HumanMillis(999).to_string(), "<1s");
        assert_eq!(HumanMillis(-5_000).to_string(), "0s");
    }
}
