use chrono::{DateTime, Duration, DurationRound, Utc};

/// A lookback window over which per-outcome probability deltas are computed.
///
/// The same set drives the delta engine, the outcome classifier, the alerter
/// thresholds, and the read API sort windows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    /// Short name used in query params and alert signatures, e.g. "1m".
    pub name: &'static str,
    /// Lookback length in minutes.
    pub minutes: i64,
    /// Column holding this window's delta in the deltas table.
    pub column: &'static str,
    /// Absolute move (percentage points) that triggers an alert.
    pub alert_threshold_pp: f64,
}

/// The canonical window set. Ordered shortest to longest.
pub const WINDOWS: [Window; 8] = [
    Window { name: "1m", minutes: 1, column: "delta_1m", alert_threshold_pp: 6.0 },
    Window { name: "5m", minutes: 5, column: "delta_5m", alert_threshold_pp: 8.0 },
    Window { name: "10m", minutes: 10, column: "delta_10m", alert_threshold_pp: 10.0 },
    Window { name: "30m", minutes: 30, column: "delta_30m", alert_threshold_pp: 14.0 },
    Window { name: "1h", minutes: 60, column: "delta_1h", alert_threshold_pp: 18.0 },
    Window { name: "6h", minutes: 360, column: "delta_6h", alert_threshold_pp: 24.0 },
    Window { name: "12h", minutes: 720, column: "delta_12h", alert_threshold_pp: 30.0 },
    Window { name: "24h", minutes: 1440, column: "delta_24h", alert_threshold_pp: 38.0 },
];

pub const WINDOW_COUNT: usize = WINDOWS.len();

/// Index of the 1-minute window, used by several classifier rules.
pub const IDX_1M: usize = 0;

impl Window {
    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes)
    }
}

/// Position of a window within the canonical set.
pub fn index_of(name: &str) -> Option<usize> {
    WINDOWS.iter().position(|w| w.name == name)
}

/// Truncate a timestamp to its minute boundary (UTC). Every pipeline tick
/// and every stored row uses this quantization so temporal joins line up.
pub fn truncate_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    // duration_trunc cannot fail for a one-minute granule
    ts.duration_trunc(Duration::minutes(1)).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn windows_are_ordered_and_unique() {
        for pair in WINDOWS.windows(2) {
            assert!(pair[0].minutes < pair[1].minutes);
        }
    }

    #[test]
    fn known_window_resolves() {
        let w = &WINDOWS[index_of("30m").unwrap()];
        assert_eq!(w.minutes, 30);
        assert_eq!(w.column, "delta_30m");
    }

    #[test]
    fn legacy_windows_are_gone() {
        assert!(index_of("3m").is_none());
        assert!(index_of("9m").is_none());
        assert!(index_of("3h").is_none());
    }

    #[test]
    fn truncate_strips_seconds() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 1, 12, 34, 56).unwrap();
        let truncated = truncate_minute(ts);
        assert_eq!(
            truncated,
            Utc.with_ymd_and_hms(2025, 3, 1, 12, 34, 0).unwrap()
        );
    }
}
