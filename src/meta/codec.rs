//! Length-prefixed binary codec for metadata snapshots
//!
//! The serialized form is a single framed record: a fixed header carrying a
//! magic marker, format version, payload length, and CRC32, followed by the
//! snapshot payload. Snapshots travel as consensus log payloads and on-disk
//! backups, so the frame is validated before any field is trusted.
//!
//! Timestamps are encoded as signed 64-bit nanoseconds with 0 meaning "zero
//! time". Two legacy layouts are still accepted on decode: the pre-split
//! flat `nodes` list (loaded as data nodes) and per-shard `owner_ids`
//! (upgraded to owner records).

use super::{
    marshal_time, unmarshal_time, ContinuousQueryInfo, Data, DatabaseInfo, NodeInfo, Privilege,
    RetentionPolicyInfo, ShardGroupInfo, ShardInfo, ShardOwner, SubscriptionInfo, UserInfo,
};
use crate::{Error, Result};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

const MAGIC: &[u8; 4] = b"CSMD";
const VERSION: u8 = 1;
const HEADER_LEN: usize = 14;

#[derive(Debug, Default, Serialize, Deserialize)]
struct DataSnapshot {
    term: u64,
    index: u64,
    cluster_id: u64,
    max_node_id: u64,
    max_shard_group_id: u64,
    max_shard_id: u64,
    data_nodes: Vec<NodeInfo>,
    meta_nodes: Vec<NodeInfo>,
    /// Pre-split layout: a single node list. Empty in current snapshots.
    nodes: Vec<NodeInfo>,
    databases: Vec<DatabaseSnapshot>,
    users: Vec<UserSnapshot>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DatabaseSnapshot {
    name: String,
    default_retention_policy: String,
    retention_policies: Vec<RetentionPolicySnapshot>,
    continuous_queries: Vec<ContinuousQueryInfo>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RetentionPolicySnapshot {
    name: String,
    replica_n: u32,
    duration: i64,
    shard_group_duration: i64,
    shard_groups: Vec<ShardGroupSnapshot>,
    subscriptions: Vec<SubscriptionInfo>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ShardGroupSnapshot {
    id: u64,
    start_time: i64,
    end_time: i64,
    deleted_at: i64,
    truncated_at: i64,
    shards: Vec<ShardSnapshot>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ShardSnapshot {
    id: u64,
    owners: Vec<ShardOwner>,
    /// Deprecated bare node-id layout. Empty in current snapshots.
    owner_ids: Vec<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserSnapshot {
    name: String,
    hash: String,
    admin: bool,
    privileges: HashMap<String, Privilege>,
}

/// Encodes the metadata tree to its framed binary form.
pub fn marshal(data: &Data) -> Result<Vec<u8>> {
    let snapshot = to_snapshot(data);
    let payload = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
        .map_err(|e| Error::Serialization(e.to_string()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(MAGIC);
    out.push(VERSION);
    out.push(0); // flags
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decodes a framed binary snapshot back into a metadata tree.
pub fn unmarshal(buf: &[u8]) -> Result<Data> {
    if buf.len() < HEADER_LEN {
        return Err(Error::Serialization("snapshot too short".to_string()));
    }
    if &buf[0..4] != MAGIC {
        return Err(Error::Serialization("invalid snapshot magic".to_string()));
    }
    if buf[4] != VERSION {
        return Err(Error::Serialization(format!(
            "unsupported snapshot version {}",
            buf[4]
        )));
    }
    if buf[5] != 0 {
        return Err(Error::Serialization("unsupported snapshot flags".to_string()));
    }

    let len = u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]) as usize;
    let expected_crc = u32::from_le_bytes([buf[10], buf[11], buf[12], buf[13]]);
    let payload = &buf[HEADER_LEN..];
    if payload.len() != len {
        return Err(Error::Serialization(format!(
            "snapshot length mismatch: header says {len}, have {}",
            payload.len()
        )));
    }

    let mut hasher = Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != expected_crc {
        return Err(Error::Serialization("snapshot crc mismatch".to_string()));
    }

    let (snapshot, _): (DataSnapshot, usize) =
        bincode::serde::decode_from_slice(payload, bincode::config::standard())
            .map_err(|e| Error::Serialization(e.to_string()))?;

    from_snapshot(snapshot)
}

impl Data {
    /// Encodes the metadata to its binary format.
    pub fn marshal_binary(&self) -> Result<Vec<u8>> {
        marshal(self)
    }

    /// Decodes a metadata tree from its binary format.
    pub fn from_binary(buf: &[u8]) -> Result<Data> {
        unmarshal(buf)
    }
}

fn to_snapshot(data: &Data) -> DataSnapshot {
    DataSnapshot {
        term: data.term,
        index: data.index,
        cluster_id: data.cluster_id,
        max_node_id: data.max_node_id,
        max_shard_group_id: data.max_shard_group_id,
        max_shard_id: data.max_shard_id,
        data_nodes: data.data_nodes.clone(),
        meta_nodes: data.meta_nodes.clone(),
        nodes: Vec::new(),
        databases: data.databases.iter().map(database_to_snapshot).collect(),
        users: data
            .users
            .iter()
            .map(|u| UserSnapshot {
                name: u.name.clone(),
                hash: u.hash.clone(),
                admin: u.admin,
                privileges: u.privileges.clone(),
            })
            .collect(),
    }
}

fn database_to_snapshot(di: &DatabaseInfo) -> DatabaseSnapshot {
    DatabaseSnapshot {
        name: di.name.clone(),
        default_retention_policy: di.default_retention_policy.clone(),
        retention_policies: di
            .retention_policies
            .iter()
            .map(|rp| RetentionPolicySnapshot {
                name: rp.name.clone(),
                replica_n: rp.replica_n as u32,
                duration: duration_to_nanos(rp.duration),
                shard_group_duration: duration_to_nanos(rp.shard_group_duration),
                shard_groups: rp
                    .shard_groups
                    .iter()
                    .map(|sg| ShardGroupSnapshot {
                        id: sg.id,
                        start_time: sg.start_time,
                        end_time: sg.end_time,
                        deleted_at: marshal_time(sg.deleted_at),
                        truncated_at: marshal_time(sg.truncated_at),
                        shards: sg
                            .shards
                            .iter()
                            .map(|s| ShardSnapshot {
                                id: s.id,
                                owners: s.owners.clone(),
                                owner_ids: Vec::new(),
                            })
                            .collect(),
                    })
                    .collect(),
                subscriptions: rp.subscriptions.clone(),
            })
            .collect(),
        continuous_queries: di.continuous_queries.clone(),
    }
}

fn from_snapshot(snapshot: DataSnapshot) -> Result<Data> {
    let mut data = Data {
        term: snapshot.term,
        index: snapshot.index,
        cluster_id: snapshot.cluster_id,
        max_node_id: snapshot.max_node_id,
        max_shard_group_id: snapshot.max_shard_group_id,
        max_shard_id: snapshot.max_shard_id,
        meta_nodes: snapshot.meta_nodes,
        ..Default::default()
    };

    if !snapshot.nodes.is_empty() && snapshot.data_nodes.is_empty() {
        // Pre-split snapshot: the flat node list holds the data nodes.
        for n in &snapshot.nodes {
            data.set_data_node(n.id, &n.addr, &n.tcp_addr)?;
        }
    } else {
        data.data_nodes = snapshot.data_nodes;
    }

    data.databases = snapshot
        .databases
        .into_iter()
        .map(database_from_snapshot)
        .collect();

    data.users = snapshot
        .users
        .into_iter()
        .map(|u| UserInfo {
            name: u.name,
            hash: u.hash,
            admin: u.admin,
            privileges: u.privileges,
        })
        .collect();

    // The admin cache is not part of the serialized form.
    data.rebuild_admin_cache();
    Ok(data)
}

fn database_from_snapshot(db: DatabaseSnapshot) -> DatabaseInfo {
    DatabaseInfo {
        name: db.name,
        default_retention_policy: db.default_retention_policy,
        retention_policies: db
            .retention_policies
            .into_iter()
            .map(|rp| RetentionPolicyInfo {
                name: rp.name,
                replica_n: rp.replica_n as usize,
                duration: nanos_to_duration(rp.duration),
                shard_group_duration: nanos_to_duration(rp.shard_group_duration),
                shard_groups: rp
                    .shard_groups
                    .into_iter()
                    .map(|sg| ShardGroupInfo {
                        id: sg.id,
                        start_time: sg.start_time,
                        end_time: sg.end_time,
                        deleted_at: unmarshal_time(sg.deleted_at),
                        truncated_at: unmarshal_time(sg.truncated_at),
                        shards: sg.shards.into_iter().map(shard_from_snapshot).collect(),
                    })
                    .collect(),
                subscriptions: rp.subscriptions,
            })
            .collect(),
        continuous_queries: db.continuous_queries,
    }
}

fn shard_from_snapshot(s: ShardSnapshot) -> ShardInfo {
    let owners = if s.owners.is_empty() && !s.owner_ids.is_empty() {
        // Deprecated layout: bare node ids become owner records.
        s.owner_ids
            .into_iter()
            .map(|node_id| ShardOwner { node_id })
            .collect()
    } else {
        s.owners
    };
    ShardInfo { id: s.id, owners }
}

fn duration_to_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

fn nanos_to_duration(v: i64) -> Duration {
    Duration::from_nanos(v.max(0) as u64)
}
