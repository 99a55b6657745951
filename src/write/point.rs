//! Point model for the write path
//!
//! A point is a measurement name, a tag set, a field set, and a nanosecond
//! timestamp. The series key (measurement plus canonical tag set) determines
//! shard placement within a group via a stable hash.

use crate::meta::Timestamp;
use fxhash::FxHasher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::Hasher;

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Float(f64),
    Integer(i64),
    Boolean(bool),
    String(String),
}

/// A timestamped sample belonging to one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub measurement: String,
    /// Tag set; `BTreeMap` keeps the series key canonical.
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub time: Timestamp,
}

impl Point {
    pub fn new(
        measurement: impl Into<String>,
        tags: BTreeMap<String, String>,
        fields: BTreeMap<String, FieldValue>,
        time: Timestamp,
    ) -> Self {
        Self {
            measurement: measurement.into(),
            tags,
            fields,
            time,
        }
    }

    /// The series key: measurement plus the sorted tag set.
    pub fn series_key(&self) -> String {
        let mut key = self.measurement.clone();
        for (k, v) in &self.tags {
            key.push(',');
            key.push_str(k);
            key.push('=');
            key.push_str(v);
        }
        key
    }

    /// Stable placement hash over the series key. Points of one series
    /// always land in the same shard of a group.
    pub fn hash_id(&self) -> u64 {
        let mut hasher = FxHasher::default();
        hasher.write(self.series_key().as_bytes());
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(measurement: &str, tags: &[(&str, &str)], time: Timestamp) -> Point {
        let tags = tags
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Point::new(measurement, tags, BTreeMap::new(), time)
    }

    #[test]
    fn series_key_is_canonical() {
        let a = point("cpu", &[("host", "a"), ("region", "eu")], 1);
        let b = point("cpu", &[("region", "eu"), ("host", "a")], 2);
        assert_eq!(a.series_key(), "cpu,host=a,region=eu");
        assert_eq!(a.series_key(), b.series_key());
    }

    #[test]
    fn hash_id_is_stable_per_series() {
        let a = point("cpu", &[("host", "a")], 1);
        let b = point("cpu", &[("host", "a")], 999);
        let c = point("cpu", &[("host", "b")], 1);
        assert_eq!(a.hash_id(), b.hash_id());
        assert_ne!(a.hash_id(), c.hash_id());
    }
}
