//! Archiver timing statistics

use std::fmt;
use std::time::Duration;

/// Per-store timings of one kind of archiver operation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperationStats {
    /// Stores processed
    pub count: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub total_ms: u64,
}

impl OperationStats {
    /// Record the time spent on one store
    pub fn record(&mut self, elapsed: Duration) {
        let ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.min_ms = if self.count == 0 { ms } else { self.min_ms.min(ms) };
        self.max_ms = self.max_ms.max(ms);
        self.total_ms = self.total_ms.saturating_add(ms);
        self.count += 1;
    }

    /// Average milliseconds per store, 0 when nothing was recorded
    #[must_use]
    pub fn average_ms(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.total_ms as f64 / self.count as f64
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for OperationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stores={} min={}ms max={}ms total={}ms avg={:.1}ms",
            self.count,
            self.min_ms,
            self.max_ms,
            self.total_ms,
            self.average_ms()
        )
    }
}

/// Timings of the most recent archive and retrieve operations
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArchiverStatistics {
    pub archive: OperationStats,
    pub retrieve: OperationStats,
}

impl fmt::Display for ArchiverStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "archive:  {}", self.archive)?;
        write!(f, "retrieve: {}", self.retrieve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_reset() {
        let mut stats = OperationStats::default();
        assert!(stats.average_ms().abs() < f64::EPSILON);

        stats.record(Duration::from_millis(30));
        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(20));
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min_ms, 10);
        assert_eq!(stats.max_ms, 30);
        assert_eq!(stats.total_ms, 60);
        assert!((stats.average_ms() - 20.0).abs() < f64::EPSILON);

        stats.reset();
        assert_eq!(stats, OperationStats::default());
    }
}
