use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Inclusive `[min, max]` range, serialized as a two-element array.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "(T, T)", into = "(T, T)")]
pub struct Range<T: Copy> {
    pub min: T,
    pub max: T,
}

impl<T: Copy> From<(T, T)> for Range<T> {
    fn from((min, max): (T, T)) -> Self {
        Range { min, max }
    }
}

impl<T: Copy> From<Range<T>> for (T, T) {
    fn from(range: Range<T>) -> Self {
        (range.min, range.max)
    }
}

impl<T: Copy + PartialOrd> Range<T> {
    pub fn new(min: T, max: T) -> Self {
        Range { min, max }
    }

    pub fn contains(&self, value: T) -> bool {
        self.min <= value && value <= self.max
    }

    fn is_ordered(&self) -> bool {
        self.min <= self.max
    }
}

/// Advanced filters, AND-composed with a notice's base targeting.
/// Absent fields never exclude anyone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentationCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days_since_last_access: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_rate_range: Option<Range<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solved_count_range: Option<Range<i64>>,
}

impl SegmentationCriteria {
    pub fn is_empty(&self) -> bool {
        self.days_since_last_access.is_none()
            && self.accuracy_rate_range.is_none()
            && self.solved_count_range.is_none()
    }

    /// Reject malformed criteria. Nothing is clamped.
    pub fn validate(&self) -> AppResult<()> {
        if let Some(days) = self.days_since_last_access {
            if days < 0 {
                return Err(AppError::invalid_criteria(format!(
                    "daysSinceLastAccess must be >= 0, got {}",
                    days
                )));
            }
        }

        if let Some(range) = self.accuracy_rate_range {
            if range.min.is_nan() || range.max.is_nan() {
                return Err(AppError::invalid_criteria(
                    "accuracyRateRange bounds must be numbers",
                ));
            }
            if !range.is_ordered() {
                return Err(AppError::invalid_criteria(format!(
                    "accuracyRateRange min ({}) > max ({})",
                    range.min, range.max
                )));
            }
        }

        if let Some(range) = self.solved_count_range {
            if !range.is_ordered() {
                return Err(AppError::invalid_criteria(format!(
                    "solvedCountRange min ({}) > max ({})",
                    range.min, range.max
                )));
            }
        }

        Ok(())
    }

    /// Build criteria from the nullable column pairs stored on `notices`.
    /// A range is only present when both of its bounds are.
    pub fn from_columns(
        days_since_last_access: Option<i64>,
        accuracy: (Option<f64>, Option<f64>),
        solved: (Option<i64>, Option<i64>),
    ) -> Self {
        SegmentationCriteria {
            days_since_last_access,
            accuracy_rate_range: match accuracy {
                (Some(min), Some(max)) => Some(Range::new(min, max)),
                _ => None,
            },
            solved_count_range: match solved {
                (Some(min), Some(max)) => Some(Range::new(min, max)),
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_is_inclusive() {
        let r = Range::new(0.0, 50.0);
        assert!(r.contains(0.0));
        assert!(r.contains(50.0));
        assert!(!r.contains(50.1));
    }

    #[test]
    fn deserializes_ranges_from_arrays() {
        let c: SegmentationCriteria =
            serde_json::from_str(r#"{"accuracyRateRange":[0,50],"solvedCountRange":[10,20]}"#)
                .unwrap();
        assert_eq!(c.accuracy_rate_range, Some(Range::new(0.0, 50.0)));
        assert_eq!(c.solved_count_range, Some(Range::new(10, 20)));
        assert_eq!(c.days_since_last_access, None);
    }

    #[test]
    fn inverted_range_fails_fast() {
        let c = SegmentationCriteria {
            accuracy_rate_range: Some(Range::new(60.0, 50.0)),
            ..Default::default()
        };
        let err = c.validate().unwrap_err();
        assert!(matches!(err, AppError::Validation(ref m) if m.contains("accuracyRateRange")));

        let c = SegmentationCriteria {
            solved_count_range: Some(Range::new(5, 4)),
            ..Default::default()
        };
        assert!(matches!(c.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn empty_criteria_is_valid() {
        let c = SegmentationCriteria::default();
        assert!(c.is_empty());
        assert!(c.validate().is_ok());
    }

    #[test]
    fn half_open_columns_are_ignored() {
        let c = SegmentationCriteria::from_columns(Some(7), (Some(10.0), None), (None, None));
        assert_eq!(c.days_since_last_access, Some(7));
        assert!(c.accuracy_rate_range.is_none());
    }
}
