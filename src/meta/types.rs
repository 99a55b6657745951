//! Entity records for the metadata tree
//!
//! Plain value types with deep `Clone`. Ownership of every record lives with
//! [`Data`](super::Data); shards refer to their owners by node id, never by
//! reference.

use super::{
    Timestamp, DEFAULT_RETENTION_POLICY_DURATION, DEFAULT_RETENTION_POLICY_NAME,
    DEFAULT_RETENTION_POLICY_REPLICA_N, MIN_RETENTION_POLICY_DURATION,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub(crate) fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Information about a single node in the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: u64,
    /// HTTP API address.
    pub addr: String,
    /// Inter-node TCP address.
    pub tcp_addr: String,
}

/// Information about a database.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    pub default_retention_policy: String,
    pub retention_policies: Vec<RetentionPolicyInfo>,
    pub continuous_queries: Vec<ContinuousQueryInfo>,
}

impl DatabaseInfo {
    /// Returns a retention policy by name. An empty name resolves to the
    /// database default, if one is set.
    pub fn retention_policy(&self, name: &str) -> Option<&RetentionPolicyInfo> {
        let name = if name.is_empty() {
            if self.default_retention_policy.is_empty() {
                return None;
            }
            self.default_retention_policy.as_str()
        } else {
            name
        };
        self.retention_policies.iter().find(|rp| rp.name == name)
    }

    pub(crate) fn retention_policy_mut(&mut self, name: &str) -> Option<&mut RetentionPolicyInfo> {
        self.retention_policies.iter_mut().find(|rp| rp.name == name)
    }

    /// Returns every shard of every live shard group, de-duplicated by
    /// shard id and sorted by id.
    pub fn shard_infos(&self) -> Vec<ShardInfo> {
        let mut shards: HashMap<u64, &ShardInfo> = HashMap::new();
        for rp in &self.retention_policies {
            for sg in &rp.shard_groups {
                if sg.deleted() {
                    continue;
                }
                for s in &sg.shards {
                    shards.insert(s.id, s);
                }
            }
        }

        let mut infos: Vec<ShardInfo> = shards.into_values().cloned().collect();
        infos.sort_by_key(|s| s.id);
        infos
    }
}

/// Metadata about a retention policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicyInfo {
    pub name: String,
    pub replica_n: usize,
    /// Total retention duration. Zero keeps data forever.
    pub duration: Duration,
    /// Width of each shard group's time window.
    pub shard_group_duration: Duration,
    pub shard_groups: Vec<ShardGroupInfo>,
    pub subscriptions: Vec<SubscriptionInfo>,
}

impl RetentionPolicyInfo {
    /// Returns a new policy with default replication and duration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replica_n: DEFAULT_RETENTION_POLICY_REPLICA_N,
            duration: DEFAULT_RETENTION_POLICY_DURATION,
            shard_group_duration: Duration::ZERO,
            shard_groups: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Applies a specification on top of this policy's values, normalizing
    /// the shard group duration against the resulting retention duration.
    pub fn apply(&self, spec: &RetentionPolicySpec) -> RetentionPolicyInfo {
        let mut rp = RetentionPolicyInfo {
            name: self.name.clone(),
            replica_n: self.replica_n,
            duration: self.duration,
            shard_group_duration: self.shard_group_duration,
            shard_groups: Vec::new(),
            subscriptions: Vec::new(),
        };
        if let Some(name) = &spec.name {
            rp.name = name.clone();
        }
        if let Some(replica_n) = spec.replica_n {
            rp.replica_n = replica_n;
        }
        if let Some(duration) = spec.duration {
            rp.duration = duration;
        }
        rp.shard_group_duration =
            normalised_shard_duration(spec.shard_group_duration, rp.duration);
        rp
    }

    /// Returns the shard group that accepts writes at `timestamp`, or `None`
    /// if no live group covers it.
    pub fn shard_group_by_timestamp(&self, timestamp: Timestamp) -> Option<&ShardGroupInfo> {
        self.shard_groups.iter().find(|sg| {
            sg.contains(timestamp)
                && !sg.deleted()
                && sg.truncated_at.map_or(true, |t| timestamp < t)
        })
    }

    /// Returns the live shard groups whose data has aged out entirely at `t`.
    pub fn expired_shard_groups(&self, t: Timestamp) -> Vec<&ShardGroupInfo> {
        if self.duration.is_zero() {
            return Vec::new();
        }
        let d = duration_nanos(self.duration);
        self.shard_groups
            .iter()
            .filter(|sg| !sg.deleted() && sg.end_time.saturating_add(d) < t)
            .collect()
    }

    /// Returns the shard groups marked as deleted.
    pub fn deleted_shard_groups(&self) -> Vec<&ShardGroupInfo> {
        self.shard_groups.iter().filter(|sg| sg.deleted()).collect()
    }
}

/// Returns a new policy with default name, replication, and duration.
pub fn default_retention_policy_info() -> RetentionPolicyInfo {
    RetentionPolicyInfo::new(DEFAULT_RETENTION_POLICY_NAME)
}

/// Specification for a new retention policy; unset fields fall back to
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicySpec {
    pub name: Option<String>,
    pub replica_n: Option<usize>,
    pub duration: Option<Duration>,
    /// Zero means unspecified; derived from `duration` on apply.
    pub shard_group_duration: Duration,
}

impl RetentionPolicySpec {
    /// Builds a concrete policy from this spec over the defaults.
    pub fn new_retention_policy_info(&self) -> RetentionPolicyInfo {
        default_retention_policy_info().apply(self)
    }

    /// Reports whether this spec describes `rpi`.
    pub fn matches(&self, rpi: &RetentionPolicyInfo) -> bool {
        if let Some(name) = &self.name {
            if *name != rpi.name {
                return false;
            }
        }
        if let Some(duration) = self.duration {
            if duration != rpi.duration {
                return false;
            }
        }
        if let Some(replica_n) = self.replica_n {
            if replica_n != rpi.replica_n {
                return false;
            }
        }

        // Normalize against the stored policy's duration; the two should
        // agree when the spec was derived from the same inputs.
        normalised_shard_duration(self.shard_group_duration, rpi.duration)
            == rpi.shard_group_duration
    }
}

/// Retention policy fields to be updated; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicyUpdate {
    pub name: Option<String>,
    pub duration: Option<Duration>,
    pub replica_n: Option<usize>,
    pub shard_group_duration: Option<Duration>,
}

/// Returns the default shard group width for a retention duration.
pub fn shard_group_duration(d: Duration) -> Duration {
    const HOUR: Duration = Duration::from_secs(60 * 60);
    const DAY: Duration = Duration::from_secs(24 * 60 * 60);
    const WEEK: Duration = Duration::from_secs(7 * 24 * 60 * 60);
    const SIX_MONTHS: Duration = Duration::from_secs(180 * 24 * 60 * 60);

    if d >= SIX_MONTHS || d.is_zero() {
        WEEK
    } else if d >= Duration::from_secs(2 * 24 * 60 * 60) {
        DAY
    } else {
        HOUR
    }
}

/// Normalizes a shard group duration against the policy duration. Zero means
/// the caller left it unspecified; below-minimum values fall back to the
/// 1h-bucket rule.
pub fn normalised_shard_duration(sgd: Duration, d: Duration) -> Duration {
    if sgd.is_zero() {
        return shard_group_duration(d);
    }
    if sgd < MIN_RETENTION_POLICY_DURATION {
        return shard_group_duration(MIN_RETENTION_POLICY_DURATION);
    }
    sgd
}

/// Metadata about a shard group: a time-bucketed container of shards
/// covering `[start_time, end_time)`.
///
/// `deleted_at` distinguishes a tombstoned group from a missing one, so the
/// system can safely delete the associated shards. `truncated_at` closes the
/// group to new points at or after that instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardGroupInfo {
    pub id: u64,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub deleted_at: Option<Timestamp>,
    pub truncated_at: Option<Timestamp>,
    pub shards: Vec<ShardInfo>,
}

impl ShardGroupInfo {
    /// Returns true iff `start_time <= t < end_time`.
    pub fn contains(&self, t: Timestamp) -> bool {
        self.start_time <= t && t < self.end_time
    }

    /// Returns whether the group contains data for `[min, max]`.
    pub fn overlaps(&self, min: Timestamp, max: Timestamp) -> bool {
        self.start_time <= max && self.end_time > min
    }

    pub fn deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn truncated(&self) -> bool {
        self.truncated_at.is_some()
    }

    /// End of the group's writable window: `truncated_at` once truncated,
    /// `end_time` otherwise. Ordering between groups uses this value.
    pub fn effective_end(&self) -> Timestamp {
        self.truncated_at.unwrap_or(self.end_time)
    }

    /// Returns the shard a point with the given placement hash lands in.
    pub fn shard_for(&self, hash_id: u64) -> &ShardInfo {
        if self.shards.len() == 1 {
            return &self.shards[0];
        }
        &self.shards[(hash_id % self.shards.len() as u64) as usize]
    }
}

/// Stable-sorts shard groups by `(effective_end, start_time)` ascending.
/// Other parts of the system assume this ordering.
pub(crate) fn sort_shard_groups(groups: &mut [ShardGroupInfo]) {
    groups.sort_by_key(|sg| (sg.effective_end(), sg.start_time));
}

/// Metadata about a shard: a horizontal slice of a shard group's points,
/// owned by one or more data nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub id: u64,
    pub owners: Vec<ShardOwner>,
}

impl ShardInfo {
    /// Reports whether `node_id` is among the shard's owners.
    pub fn owned_by(&self, node_id: u64) -> bool {
        self.owners.iter().any(|o| o.node_id == node_id)
    }
}

/// A data node responsible for a shard replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardOwner {
    pub node_id: u64,
}

/// A fire-and-forget copy stream of incoming writes to external endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub name: String,
    pub mode: String,
    pub destinations: Vec<String>,
}

/// A named scheduled query attached to a database. The query text is opaque
/// to the metadata layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuousQueryInfo {
    pub name: String,
    pub query: String,
}

/// Access level granted to a user on one database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Privilege {
    #[default]
    NoPrivileges,
    Read,
    Write,
    All,
}

/// Metadata about a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    /// Hashed password.
    pub hash: String,
    /// Whether the user is an admin, i.e. allowed to do everything.
    pub admin: bool,
    /// Map of database name to granted privilege.
    pub privileges: HashMap<String, Privilege>,
}

impl UserInfo {
    /// Returns true if the user is authorized for `privilege` on `database`.
    pub fn authorize_database(&self, privilege: Privilege, database: &str) -> bool {
        if self.admin || privilege == Privilege::NoPrivileges {
            return true;
        }
        match self.privileges.get(database) {
            Some(p) => *p == privilege || *p == Privilege::All,
            None => false,
        }
    }
}

/// Self-announcement a node publishes into the cluster directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    pub tcp_addr: String,
    pub http_addr: String,
    pub http_scheme: String,
    pub time: DateTime<Utc>,
    pub node_type: String,
    pub status: String,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    pub version: String,
}

/// Node announcements keyed by address.
pub type Announcements = HashMap<String, Announcement>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataNodeStatus {
    pub node_type: String,
    pub hostname: String,
    pub tcp_bind: String,
    pub tcp_addr: String,
    pub http_addr: String,
    pub node_status: String,
    pub meta_addrs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaNodeStatus {
    pub node_type: String,
    pub leader: String,
    pub http_addr: String,
    pub raft_addr: String,
    pub peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataNodeInfo {
    pub id: u64,
    pub tcp_addr: String,
    pub http_addr: String,
    pub http_scheme: String,
    pub status: String,
    pub version: String,
}

impl DataNodeInfo {
    pub fn from_node(n: &NodeInfo) -> Self {
        Self {
            id: n.id,
            tcp_addr: n.tcp_addr.clone(),
            http_addr: n.addr.clone(),
            http_scheme: String::new(),
            status: String::new(),
            version: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaNodeInfo {
    pub id: u64,
    pub addr: String,
    pub http_scheme: String,
    pub tcp_addr: String,
    pub version: String,
}

impl MetaNodeInfo {
    pub fn from_node(n: &NodeInfo) -> Self {
        Self {
            id: n.id,
            addr: n.addr.clone(),
            http_scheme: String::new(),
            tcp_addr: n.tcp_addr.clone(),
            version: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub data: Vec<DataNodeInfo>,
    pub meta: Vec<MetaNodeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterShardInfo {
    pub id: u64,
    pub database: String,
    #[serde(rename = "retention-policy")]
    pub retention_policy: String,
    #[serde(rename = "replica-n")]
    pub replica_n: usize,
    #[serde(rename = "shard-group-id")]
    pub shard_group_id: u64,
    #[serde(rename = "start-time")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "end-time")]
    pub end_time: DateTime<Utc>,
    #[serde(rename = "expire-time")]
    pub expire_time: DateTime<Utc>,
    #[serde(rename = "truncated-at")]
    pub truncated_at: Option<DateTime<Utc>>,
    pub owners: Vec<ShardOwnerInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardOwnerInfo {
    pub id: u64,
    #[serde(rename = "tcpAddr")]
    pub tcp_addr: String,
    pub state: String,
    #[serde(rename = "last-modified")]
    pub last_modified: Option<DateTime<Utc>>,
    pub size: i64,
    pub err: String,
}
