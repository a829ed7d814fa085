pub mod actors;
pub mod config;
pub mod dispatch;
pub mod evaluator;
pub mod query;
pub mod store;
pub mod tracker;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single timestamped observation from the metrics backend.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// One labeled numeric series returned by a query.
///
/// Labels are kept sorted so series identity is stable across polls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    pub samples: Vec<Sample>,
}

impl Series {
    /// The most recent sample at or before `now`, if any.
    pub fn latest_at_or_before(&self, now: DateTime<Utc>) -> Option<Sample> {
        self.samples
            .iter()
            .filter(|s| s.timestamp <= now)
            .max_by_key(|s| s.timestamp)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn latest_sample_ignores_future_points() {
        let series = Series {
            labels: BTreeMap::new(),
            samples: vec![
                Sample { timestamp: ts(10), value: 1.0 },
                Sample { timestamp: ts(20), value: 2.0 },
                Sample { timestamp: ts(30), value: 3.0 },
            ],
        };

        let latest = series.latest_at_or_before(ts(25)).unwrap();
        assert_eq!(latest.value, 2.0);
    }

    #[test]
    fn latest_sample_empty_series_is_none() {
        let series = Series { labels: BTreeMap::new(), samples: vec![] };
        assert!(series.latest_at_or_before(ts(0)).is_none());
    }
}
