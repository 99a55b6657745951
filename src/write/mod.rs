//! Write-path shard dispatch
//!
//! Maps incoming points to shards (creating shard groups on demand through
//! the meta client), fans each shard's points out to every owner replica in
//! parallel, enforces a consistency level, falls back to the hinted-handoff
//! queue on remote failure, and publishes a copy of each request to
//! subscriber channels. All of it under a single write timeout.

mod mapper;
mod point;
mod points_writer;
mod stats;

pub use mapper::{SgList, ShardMapping};
pub use point::{FieldValue, Point};
pub use points_writer::{
    HintedHandoff, MetaClient, PointsWriter, PointsWriterConfig, ShardWriteContext, ShardWriter,
    TsdbStore, DEFAULT_WRITE_TIMEOUT,
};
pub use stats::{Statistic, WriteStatistics};

use crate::meta::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Minimum number of owner acknowledgments required for a shard write to be
/// considered successful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConsistencyLevel {
    /// A hinted-handoff enqueue counts as success.
    Any,
    /// One owner must acknowledge.
    #[default]
    One,
    /// A majority of owners must acknowledge.
    Quorum,
    /// Every owner must acknowledge.
    All,
}

impl ConsistencyLevel {
    /// Number of acknowledgments required for a shard with `owner_count`
    /// replicas.
    pub fn required_acks(&self, owner_count: usize) -> usize {
        match self {
            ConsistencyLevel::Any | ConsistencyLevel::One => 1,
            ConsistencyLevel::Quorum => owner_count / 2 + 1,
            ConsistencyLevel::All => owner_count,
        }
    }
}

impl std::str::FromStr for ConsistencyLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "any" => Ok(ConsistencyLevel::Any),
            "one" => Ok(ConsistencyLevel::One),
            "quorum" => Ok(ConsistencyLevel::Quorum),
            "all" => Ok(ConsistencyLevel::All),
            other => Err(crate::Error::Config(format!(
                "invalid consistency level '{other}', expected one of [any, one, quorum, all]"
            ))),
        }
    }
}

/// A request to write point data to the cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WritePointsRequest {
    pub database: String,
    pub retention_policy: String,
    pub points: Vec<Point>,
}

impl WritePointsRequest {
    /// Appends a single-field point with field key `value`.
    pub fn add_point(
        &mut self,
        name: &str,
        value: f64,
        timestamp: Timestamp,
        tags: BTreeMap<String, String>,
    ) {
        let mut fields = BTreeMap::new();
        fields.insert("value".to_string(), FieldValue::Float(value));
        self.points.push(Point::new(name, tags, fields, timestamp));
    }
}
