//! Cluster metadata for chronoshard
//!
//! The metadata tree (nodes, databases, retention policies, shard groups,
//! shards, owners, subscriptions, continuous queries, users) is owned by a
//! single [`Data`] value. A consensus layer totally orders mutations and
//! applies them through the mutators on [`Data`]; readers receive immutable
//! snapshots and never mutate in place.

pub mod codec;
mod data;
mod leases;
mod types;

pub use data::{Data, MAX_NANO_TIME, MIN_NANO_TIME};
pub use leases::{Lease, Leases};
pub use types::{
    default_retention_policy_info, normalised_shard_duration, shard_group_duration, Announcement,
    Announcements, ClusterInfo, ClusterShardInfo, ContinuousQueryInfo, DataNodeInfo,
    DataNodeStatus, DatabaseInfo, MetaNodeInfo, MetaNodeStatus, NodeInfo, Privilege,
    RetentionPolicyInfo, RetentionPolicySpec, RetentionPolicyUpdate, ShardGroupInfo, ShardInfo,
    ShardOwner, ShardOwnerInfo, SubscriptionInfo, UserInfo,
};

pub(crate) use types::{duration_nanos, sort_shard_groups};

use std::time::Duration;

/// Nanoseconds since the Unix epoch, UTC.
pub type Timestamp = i64;

/// Default replication factor for new retention policies.
pub const DEFAULT_RETENTION_POLICY_REPLICA_N: usize = 1;

/// Maximum replication factor applied to auto-created retention policies.
pub const MAX_AUTO_CREATED_RETENTION_POLICY_REPLICA_N: usize = 3;

/// Default retention duration (zero means keep data forever).
pub const DEFAULT_RETENTION_POLICY_DURATION: Duration = Duration::ZERO;

/// Default name for auto-created retention policies.
pub const DEFAULT_RETENTION_POLICY_NAME: &str = "autogen";

/// Minimum duration for a retention policy.
pub const MIN_RETENTION_POLICY_DURATION: Duration = Duration::from_secs(60 * 60);

/// Maximum length of a database or retention policy name. The name becomes
/// a directory name on disk.
pub const MAX_NAME_LEN: usize = 255;

/// Database reserved for self-monitoring; excluded from bulk import.
pub const INTERNAL_DATABASE: &str = "_internal";

/// How long a tombstoned shard group is retained before pruning removes it.
pub const SHARD_GROUP_DELETED_EXPIRATION: Duration = Duration::from_secs(24 * 60 * 60);

pub const NODE_TYPE_DATA: &str = "data";
pub const NODE_TYPE_META: &str = "meta";

pub const NODE_STATUS_JOINED: &str = "joined";
pub const NODE_STATUS_DISJOINED: &str = "disjoined";

/// Converts an optional timestamp to its wire value. The zero-time sentinel
/// is encoded as 0.
pub fn marshal_time(t: Option<Timestamp>) -> i64 {
    t.unwrap_or(0)
}

/// Converts a wire value back to an optional timestamp. 0 decodes to the
/// zero-time sentinel.
pub fn unmarshal_time(v: i64) -> Option<Timestamp> {
    if v == 0 {
        None
    } else {
        Some(v)
    }
}

/// Reports whether `name` is acceptable as a database or retention policy
/// name: printable, non-empty, not a relative path component, and free of
/// path separators.
pub fn valid_name(name: &str) -> bool {
    name.chars().all(|c| !c.is_control())
        && !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}

/// Current wall-clock time in nanoseconds since the epoch.
pub(crate) fn now_nanos() -> Timestamp {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}
