// =============================================================================
// TIME RANGE MODULE
// =============================================================================
// Half-open time intervals `[start, end)` and the overlap primitive every
// conflict check in the service is built on.
//
// NOTES:
// - Touching ranges (`a.end == b.start`) do NOT overlap
// - Nothing else in the crate compares interval bounds by hand; it calls
//   `overlaps` or `contains` so booking semantics stay in one place
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// A half-open interval `[start, end)` with `start < end`.
///
/// Construct through [`TimeRange::new`]; deserialized ranges are validated
/// the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TryFrom<RawRange> for TimeRange {
    type Error = AppError;

    fn try_from(raw: RawRange) -> Result<Self, Self::Error> {
        TimeRange::new(raw.start, raw.end)
    }
}

impl TimeRange {
    /// Build a range, rejecting `end <= start` with a validation error.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> AppResult<Self> {
        if end <= start {
            return Err(AppError::Validation(format!(
                "range end ({}) must be after start ({})",
                end.to_rfc3339(),
                start.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    /// Range that begins at `start` and has no practical end.
    ///
    /// Used for active sessions without a planned exit.
    pub fn open_ended(start: DateTime<Utc>) -> Self {
        Self {
            start,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    /// True when the instant lies inside `[start, end)`.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    pub fn duration(&self) -> Duration {
        duration(self)
    }
}

/// Half-open overlap: `a.start < b.end AND b.start < a.end`.
pub fn overlaps(a: &TimeRange, b: &TimeRange) -> bool {
    a.start < b.end && b.start < a.end
}

/// Length of the range. Always positive for a constructed range.
pub fn duration(range: &TimeRange) -> Duration {
    range.end - range.start
}

// =============================================================================
// TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    fn range(start: (u32, u32), end: (u32, u32)) -> TimeRange {
        TimeRange::new(at(start.0, start.1), at(end.0, end.1)).unwrap()
    }

    #[test]
    fn test_overlapping_ranges() {
        let a = range((10, 0), (12, 0));
        let b = range((11, 0), (13, 0));
        assert!(overlaps(&a, &b));
        assert!(overlaps(&b, &a));
    }

    #[test]
    fn test_touching_ranges_do_not_overlap() {
        let a = range((10, 0), (12, 0));
        let b = range((12, 0), (14, 0));
        assert!(!overlaps(&a, &b));
        assert!(!overlaps(&b, &a));
    }

    #[test]
    fn test_nested_range_overlaps() {
        let outer = range((8, 0), (18, 0));
        let inner = range((10, 30), (11, 30));
        assert!(overlaps(&outer, &inner));
        assert!(overlaps(&inner, &outer));
    }

    #[test]
    fn test_end_before_start_is_rejected() {
        let err = TimeRange::new(at(12, 0), at(10, 0)).unwrap_err();
        assert_eq!(err.kind(), "VALIDATION_ERROR");

        let err = TimeRange::new(at(12, 0), at(12, 0)).unwrap_err();
        assert_eq!(err.kind(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_duration_and_contains() {
        let r = range((10, 0), (12, 30));
        assert_eq!(duration(&r), Duration::minutes(150));
        assert!(r.contains(at(10, 0)));
        assert!(r.contains(at(12, 29)));
        assert!(!r.contains(at(12, 30)));
    }

    #[test]
    fn test_open_ended_overlaps_everything_after_start() {
        let session = TimeRange::open_ended(at(9, 0));
        assert!(overlaps(&session, &range((20, 0), (21, 0))));
        assert!(!overlaps(&session, &range((7, 0), (9, 0))));
    }

    #[test]
    fn test_deserialize_rejects_inverted_range() {
        let json = r#"{"start":"2026-03-02T12:00:00Z","end":"2026-03-02T10:00:00Z"}"#;
        assert!(serde_json::from_str::<TimeRange>(json).is_err());

        let json = r#"{"start":"2026-03-02T10:00:00+02:00","end":"2026-03-02T12:00:00+02:00"}"#;
        let r: TimeRange = serde_json::from_str(json).unwrap();
        assert_eq!(r.start, at(8, 0));
    }
}
