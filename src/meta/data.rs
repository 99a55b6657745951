//! The top-level metadata collection and its mutators
//!
//! Every mutator is a deterministic pure function of the current state: it
//! either mutates `self` in place and returns `Ok`, or rejects with a typed
//! error and leaves the state untouched at the granularity callers observe.
//! The consensus layer applies mutations in index order on a clone and
//! publishes the result as the next immutable snapshot; nothing here takes a
//! lock.

use super::types::{duration_nanos, sort_shard_groups};
use super::{
    now_nanos, valid_name, ContinuousQueryInfo, DatabaseInfo, NodeInfo, Privilege,
    RetentionPolicyInfo, RetentionPolicyUpdate, ShardGroupInfo, ShardInfo, ShardOwner,
    SubscriptionInfo, Timestamp, UserInfo, INTERNAL_DATABASE, MAX_NAME_LEN,
    MIN_RETENTION_POLICY_DURATION, SHARD_GROUP_DELETED_EXPIRATION,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};
use url::Url;

/// Smallest representable point timestamp in nanoseconds.
pub const MIN_NANO_TIME: Timestamp = i64::MIN + 2;

/// Largest representable point timestamp in nanoseconds. Shard group windows
/// are clamped to `MAX_NANO_TIME + 1` so a point at the maximum still fits in
/// a `[start, end)` interval.
pub const MAX_NANO_TIME: Timestamp = i64::MAX - 1;

/// The top level collection of all metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Data {
    /// Consensus term this snapshot was produced under.
    pub term: u64,
    /// Consensus log index this snapshot was produced under.
    pub index: u64,
    pub cluster_id: u64,
    pub meta_nodes: Vec<NodeInfo>,
    pub data_nodes: Vec<NodeInfo>,
    pub databases: Vec<DatabaseInfo>,
    pub users: Vec<UserInfo>,

    /// Constant-time answer for "is there at least one admin user".
    /// Recomputed on load and on every admin-flag mutation.
    #[serde(skip)]
    pub(crate) admin_user_exists: bool,

    pub max_node_id: u64,
    pub max_shard_group_id: u64,
    pub max_shard_id: u64,
}

impl Data {
    /// Returns a data node by id.
    pub fn data_node(&self, id: u64) -> Option<&NodeInfo> {
        self.data_nodes.iter().find(|n| n.id == id)
    }

    /// Adds a data node to the metadata.
    pub fn create_data_node(&mut self, addr: &str, tcp_addr: &str) -> Result<()> {
        if self.data_nodes.iter().any(|n| n.tcp_addr == tcp_addr) {
            return Err(Error::NodeExists);
        }

        // A meta node with the same TCP address is the same physical node,
        // so re-use its id.
        let existing_id = self
            .meta_nodes
            .iter()
            .find(|n| n.tcp_addr == tcp_addr)
            .map(|n| n.id);

        let id = match existing_id {
            Some(id) => id,
            None => {
                self.max_node_id += 1;
                self.max_node_id
            }
        };

        self.data_nodes.push(NodeInfo {
            id,
            addr: addr.to_string(),
            tcp_addr: tcp_addr.to_string(),
        });
        self.data_nodes.sort_by_key(|n| n.id);
        Ok(())
    }

    /// Adds a data node with a pre-assigned id. Only the legacy snapshot
    /// load path uses this.
    pub(crate) fn set_data_node(&mut self, node_id: u64, addr: &str, tcp_addr: &str) -> Result<()> {
        if self.data_nodes.iter().any(|n| n.addr == addr) {
            return Err(Error::NodeExists);
        }
        self.data_nodes.push(NodeInfo {
            id: node_id,
            addr: addr.to_string(),
            tcp_addr: tcp_addr.to_string(),
        });
        Ok(())
    }

    /// Removes a data node and reassigns ownership of any shards that would
    /// otherwise be orphaned by the removal.
    pub fn delete_data_node(&mut self, id: u64) -> Result<()> {
        let before = self.data_nodes.len();
        self.data_nodes.retain(|n| n.id != id);
        if self.data_nodes.len() == before {
            return Err(Error::NodeNotFound);
        }

        let now = now_nanos();
        for db in &mut self.databases {
            for rp in &mut db.retention_policies {
                for sg in &mut rp.shard_groups {
                    // Per-group shard counts for every owning node, plus the
                    // shards that lose their last owner.
                    let mut node_owner_freqs: BTreeMap<u64, usize> = BTreeMap::new();
                    let mut orphaned: Vec<u64> = Vec::new();

                    for shard in &mut sg.shards {
                        for owner in &shard.owners {
                            *node_owner_freqs.entry(owner.node_id).or_insert(0) += 1;
                        }
                        shard.owners.retain(|o| o.node_id != id);
                        if shard.owners.is_empty() {
                            orphaned.push(shard.id);
                        }
                    }

                    // A group with no shards, or only orphaned shards, is
                    // tombstoned rather than rebalanced.
                    if sg.shards.is_empty() || orphaned.len() == sg.shards.len() {
                        sg.deleted_at = Some(now);
                        continue;
                    }

                    node_owner_freqs.remove(&id);
                    for orphan_id in orphaned {
                        let new_owner = new_shard_owner(orphan_id, &mut node_owner_freqs)?;
                        debug!(
                            shard_id = orphan_id,
                            node_id = new_owner,
                            "reassigned orphaned shard"
                        );
                        if let Some(shard) = sg.shards.iter_mut().find(|s| s.id == orphan_id) {
                            shard.owners.push(ShardOwner { node_id: new_owner });
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns a meta node by id.
    pub fn meta_node(&self, id: u64) -> Option<&NodeInfo> {
        self.meta_nodes.iter().find(|n| n.id == id)
    }

    /// Adds a meta node to the metadata.
    pub fn create_meta_node(&mut self, http_addr: &str, tcp_addr: &str) -> Result<()> {
        if self.meta_nodes.iter().any(|n| n.addr == http_addr) {
            return Err(Error::NodeExists);
        }

        // A data node with the same TCP address is the same physical node.
        let existing_id = self
            .data_nodes
            .iter()
            .find(|n| n.tcp_addr == tcp_addr)
            .map(|n| n.id);

        let id = match existing_id {
            Some(id) => id,
            None => {
                self.max_node_id += 1;
                self.max_node_id
            }
        };

        self.meta_nodes.push(NodeInfo {
            id,
            addr: http_addr.to_string(),
            tcp_addr: tcp_addr.to_string(),
        });
        self.meta_nodes.sort_by_key(|n| n.id);
        Ok(())
    }

    /// Updates the single meta node's addresses, creating it if absent.
    /// Valid only for single-node clusters.
    pub fn set_meta_node(&mut self, http_addr: &str, tcp_addr: &str) -> Result<()> {
        if self.meta_nodes.len() > 1 {
            return Err(Error::TooManyMetaNodes);
        }
        if self.meta_nodes.is_empty() {
            return self.create_meta_node(http_addr, tcp_addr);
        }
        self.meta_nodes[0].addr = http_addr.to_string();
        self.meta_nodes[0].tcp_addr = tcp_addr.to_string();
        Ok(())
    }

    /// Removes a meta node from the metadata.
    pub fn delete_meta_node(&mut self, id: u64) -> Result<()> {
        if id == 0 {
            return Err(Error::NodeIdRequired);
        }
        let before = self.meta_nodes.len();
        self.meta_nodes.retain(|n| n.id != id);
        if self.meta_nodes.len() == before {
            return Err(Error::NodeNotFound);
        }
        Ok(())
    }

    /// Returns a database by name.
    pub fn database(&self, name: &str) -> Option<&DatabaseInfo> {
        self.databases.iter().find(|db| db.name == name)
    }

    fn database_mut(&mut self, name: &str) -> Option<&mut DatabaseInfo> {
        self.databases.iter_mut().find(|db| db.name == name)
    }

    /// Returns a deep copy of the database infos.
    pub fn clone_databases(&self) -> Vec<DatabaseInfo> {
        self.databases.clone()
    }

    /// Creates a new database. Succeeds silently if a database with the
    /// same name already exists.
    pub fn create_database(&mut self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::DatabaseNameRequired);
        } else if name.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong);
        } else if !valid_name(name) {
            return Err(Error::InvalidName(name.to_string()));
        } else if self.database(name).is_some() {
            return Ok(());
        }

        self.databases.push(DatabaseInfo {
            name: name.to_string(),
            ..Default::default()
        });
        Ok(())
    }

    /// Removes a database by name, along with every user privilege granted
    /// on it. Succeeds silently if the database cannot be found.
    pub fn drop_database(&mut self, name: &str) -> Result<()> {
        let before = self.databases.len();
        self.databases.retain(|db| db.name != name);
        if self.databases.len() < before {
            for user in &mut self.users {
                user.privileges.remove(name);
            }
        }
        Ok(())
    }

    /// Returns a retention policy for a database by name. Errors when the
    /// database does not exist; an unknown policy returns `None`.
    pub fn retention_policy(
        &self,
        database: &str,
        name: &str,
    ) -> Result<Option<&RetentionPolicyInfo>> {
        let di = self
            .database(database)
            .ok_or_else(|| Error::DatabaseNotFound(database.to_string()))?;
        Ok(di.retention_policies.iter().find(|rp| rp.name == name))
    }

    /// Creates a new retention policy on a database.
    ///
    /// An existing policy with the same name is an idempotent success iff
    /// its replication factor and durations all match the request.
    pub fn create_retention_policy(
        &mut self,
        database: &str,
        rpi: &RetentionPolicyInfo,
        make_default: bool,
    ) -> Result<()> {
        if rpi.name.is_empty() {
            return Err(Error::RetentionPolicyNameRequired);
        } else if rpi.name.len() > MAX_NAME_LEN {
            return Err(Error::NameTooLong);
        } else if !valid_name(&rpi.name) {
            return Err(Error::InvalidName(rpi.name.clone()));
        } else if rpi.replica_n < 1 {
            return Err(Error::ReplicationFactorTooLow);
        }

        // Normalize the shard group duration before comparing to any
        // existing policy. The client is supposed to do this; verify input.
        let mut rpi = rpi.clone();
        rpi.shard_group_duration =
            super::normalised_shard_duration(rpi.shard_group_duration, rpi.duration);

        if !rpi.duration.is_zero() && rpi.duration < rpi.shard_group_duration {
            return Err(Error::IncompatibleDurations);
        }

        let di = self
            .database_mut(database)
            .ok_or_else(|| Error::DatabaseNotFound(database.to_string()))?;

        if let Some(existing) = di.retention_policies.iter().find(|rp| rp.name == rpi.name) {
            if existing.replica_n != rpi.replica_n
                || existing.duration != rpi.duration
                || existing.shard_group_duration != rpi.shard_group_duration
            {
                return Err(Error::RetentionPolicyExists);
            }
            // Asking to make a non-default policy the default is not an
            // identical command, so it conflicts.
            if make_default && di.default_retention_policy != rpi.name {
                return Err(Error::RetentionPolicyConflict);
            }
            return Ok(());
        }

        let name = rpi.name.clone();
        di.retention_policies.push(rpi);
        if make_default {
            di.default_retention_policy = name;
        }
        Ok(())
    }

    /// Removes a retention policy from a database by name. Succeeds silently
    /// if the database or policy cannot be found.
    pub fn drop_retention_policy(&mut self, database: &str, name: &str) -> Result<()> {
        if let Some(di) = self.database_mut(database) {
            di.retention_policies.retain(|rp| rp.name != name);
        }
        Ok(())
    }

    /// Updates an existing retention policy.
    pub fn update_retention_policy(
        &mut self,
        database: &str,
        name: &str,
        rpu: &RetentionPolicyUpdate,
        make_default: bool,
    ) -> Result<()> {
        let di = self
            .database_mut(database)
            .ok_or_else(|| Error::DatabaseNotFound(database.to_string()))?;

        if let Some(new_name) = &rpu.name {
            if new_name != name && di.retention_policies.iter().any(|rp| rp.name == *new_name) {
                return Err(Error::RetentionPolicyNameExists);
            }
        }

        if let Some(d) = rpu.duration {
            if d < MIN_RETENTION_POLICY_DURATION && !d.is_zero() {
                return Err(Error::RetentionPolicyDurationTooLow);
            }
        }

        let rpi = di
            .retention_policy_mut(name)
            .ok_or_else(|| Error::RetentionPolicyNotFound(name.to_string()))?;

        // The effective duration must remain at least the effective shard
        // group duration, whichever of the two the update touches.
        let incompatible = match (rpu.duration, rpu.shard_group_duration) {
            (Some(d), Some(sgd)) => !d.is_zero() && d < sgd,
            (Some(d), None) => !d.is_zero() && d < rpi.shard_group_duration,
            (None, Some(sgd)) => !rpi.duration.is_zero() && rpi.duration < sgd,
            (None, None) => false,
        };
        if incompatible {
            return Err(Error::IncompatibleDurations);
        }

        if let Some(new_name) = &rpu.name {
            rpi.name = new_name.clone();
        }
        if let Some(d) = rpu.duration {
            rpi.duration = d;
        }
        if let Some(n) = rpu.replica_n {
            rpi.replica_n = n;
        }
        if let Some(sgd) = rpu.shard_group_duration {
            rpi.shard_group_duration = super::normalised_shard_duration(sgd, rpi.duration);
        }

        let rpi_name = rpi.name.clone();
        if make_default && di.default_retention_policy != rpi_name {
            di.default_retention_policy = rpi_name;
        }
        Ok(())
    }

    fn shard_groups_mut(&mut self) -> impl Iterator<Item = &mut ShardGroupInfo> {
        self.databases
            .iter_mut()
            .flat_map(|db| db.retention_policies.iter_mut())
            .flat_map(|rp| rp.shard_groups.iter_mut())
    }

    /// Removes a shard by id from whichever group holds it. Succeeds
    /// silently when the shard can't be found so the command can be re-run
    /// after a partial failure.
    pub fn drop_shard(&mut self, id: u64) {
        let now = now_nanos();
        for sg in self.shard_groups_mut() {
            if let Some(idx) = sg.shards.iter().position(|s| s.id == id) {
                sg.shards.remove(idx);
                if sg.shards.is_empty() {
                    sg.deleted_at = Some(now);
                }
                return;
            }
        }
    }

    /// Adds `node_id` to a shard's owner set, keeping the set free of
    /// duplicates and inserting in ascending node-id position.
    pub fn copy_shard_owner(&mut self, id: u64, node_id: u64) {
        for sg in self.shard_groups_mut() {
            if let Some(shard) = sg.shards.iter_mut().find(|s| s.id == id) {
                if shard.owned_by(node_id) {
                    return;
                }
                match shard.owners.iter().position(|o| o.node_id > node_id) {
                    Some(idx) => shard.owners.insert(idx, ShardOwner { node_id }),
                    None => shard.owners.push(ShardOwner { node_id }),
                }
                return;
            }
        }
    }

    /// Removes `node_id` from a shard's owner set. A shard left with no
    /// owners is deleted, tombstoning the group if it was the last shard.
    pub fn remove_shard_owner(&mut self, id: u64, node_id: u64) {
        let now = now_nanos();
        for sg in self.shard_groups_mut() {
            if let Some(idx) = sg.shards.iter().position(|s| s.id == id) {
                sg.shards[idx].owners.retain(|o| o.node_id != node_id);
                if sg.shards[idx].owners.is_empty() {
                    sg.shards.remove(idx);
                    if sg.shards.is_empty() {
                        sg.deleted_at = Some(now);
                    }
                }
                return;
            }
        }
    }

    /// Returns the non-deleted shard groups on a database and policy.
    pub fn shard_groups(&self, database: &str, policy: &str) -> Result<Vec<ShardGroupInfo>> {
        let rpi = self
            .retention_policy(database, policy)?
            .ok_or_else(|| Error::RetentionPolicyNotFound(policy.to_string()))?;
        Ok(rpi
            .shard_groups
            .iter()
            .filter(|sg| !sg.deleted())
            .cloned()
            .collect())
    }

    /// Returns the non-deleted shard groups that may contain data in
    /// `[min, max]`, in stored (sorted) order.
    pub fn shard_groups_by_time_range(
        &self,
        database: &str,
        policy: &str,
        min: Timestamp,
        max: Timestamp,
    ) -> Result<Vec<ShardGroupInfo>> {
        let rpi = self
            .retention_policy(database, policy)?
            .ok_or_else(|| Error::RetentionPolicyNotFound(policy.to_string()))?;
        Ok(rpi
            .shard_groups
            .iter()
            .filter(|sg| !sg.deleted() && sg.overlaps(min, max))
            .cloned()
            .collect())
    }

    /// Returns the shard group on a database and policy accepting writes at
    /// the given timestamp.
    pub fn shard_group_by_timestamp(
        &self,
        database: &str,
        policy: &str,
        timestamp: Timestamp,
    ) -> Result<Option<&ShardGroupInfo>> {
        let rpi = self
            .retention_policy(database, policy)?
            .ok_or_else(|| Error::RetentionPolicyNotFound(policy.to_string()))?;
        Ok(rpi.shard_group_by_timestamp(timestamp))
    }

    /// Creates a shard group on a database and policy for the given
    /// timestamp. A no-op when no data nodes exist or a live group already
    /// covers the timestamp.
    pub fn create_shard_group(
        &mut self,
        database: &str,
        policy: &str,
        timestamp: Timestamp,
    ) -> Result<()> {
        if self.data_nodes.is_empty() {
            return Ok(());
        }

        let node_ids: Vec<u64> = self.data_nodes.iter().map(|n| n.id).collect();
        let node_count = node_ids.len();
        let index = self.index;

        let rpi = self
            .retention_policy(database, policy)?
            .ok_or_else(|| Error::RetentionPolicyNotFound(policy.to_string()))?;

        if rpi.shard_group_by_timestamp(timestamp).is_some() {
            return Ok(());
        }

        // At least one replica, but never more replicas than nodes.
        let replica_n = rpi.replica_n.clamp(1, node_count);

        // Smallest shard count such that shard_n * replica_n is a multiple
        // of the node count, so replicas land on every node evenly. The
        // bound is node_count (the LCM case); the extra guard keeps the loop
        // finite even if the arithmetic assumptions are ever violated.
        let mut shard_n = 1usize;
        while (shard_n * replica_n) % node_count != 0 && shard_n < node_count {
            shard_n += 1;
        }

        let sgd = duration_nanos(rpi.shard_group_duration);
        let mut start_time = timestamp.div_euclid(sgd) * sgd;
        let mut end_time = start_time.saturating_add(sgd).min(MAX_NANO_TIME + 1);

        // Shrink the candidate window so it does not intersect any existing
        // live group, preserving start_time <= timestamp < end_time. A
        // truncated group's effective end is its truncation point.
        for sg in &rpi.shard_groups {
            if sg.deleted() {
                continue;
            }
            let start_i = sg.start_time;
            let end_i = sg.effective_end();

            if end_i <= timestamp && end_i > start_time {
                // start_time < end_i <= timestamp
                start_time = end_i;
            }
            if start_i > timestamp && start_i < end_time {
                // timestamp < start_i < end_time
                end_time = start_i;
            }
        }

        self.max_shard_group_id += 1;
        let mut sgi = ShardGroupInfo {
            id: self.max_shard_group_id,
            start_time,
            end_time,
            ..Default::default()
        };

        sgi.shards = Vec::with_capacity(shard_n);
        for _ in 0..shard_n {
            self.max_shard_id += 1;
            sgi.shards.push(ShardInfo {
                id: self.max_shard_id,
                owners: Vec::new(),
            });
        }

        // Assign data nodes to shards round-robin, starting from a
        // repeatably "random" place derived from the consensus index.
        let mut node_index = (index % node_count as u64) as usize;
        for shard in &mut sgi.shards {
            for _ in 0..replica_n {
                shard.owners.push(ShardOwner {
                    node_id: node_ids[node_index % node_count],
                });
                node_index += 1;
            }
        }

        info!(
            database,
            policy,
            shard_group_id = sgi.id,
            shards = shard_n,
            replica_n,
            "created shard group"
        );

        // Shard groups must be stored in sorted order; other parts of the
        // system assume this.
        let di = self
            .database_mut(database)
            .ok_or_else(|| Error::DatabaseNotFound(database.to_string()))?;
        let rpi = di
            .retention_policy_mut(policy)
            .ok_or_else(|| Error::RetentionPolicyNotFound(policy.to_string()))?;
        rpi.shard_groups.push(sgi);
        sort_shard_groups(&mut rpi.shard_groups);

        Ok(())
    }

    /// Tombstones a shard group by id.
    pub fn delete_shard_group(&mut self, database: &str, policy: &str, id: u64) -> Result<()> {
        let now = now_nanos();
        let di = self
            .database_mut(database)
            .ok_or_else(|| Error::DatabaseNotFound(database.to_string()))?;
        let rpi = di
            .retention_policy_mut(policy)
            .ok_or_else(|| Error::RetentionPolicyNotFound(policy.to_string()))?;

        match rpi.shard_groups.iter_mut().find(|sg| sg.id == id) {
            Some(sg) => {
                sg.deleted_at = Some(now);
                Ok(())
            }
            None => Err(Error::ShardGroupNotFound),
        }
    }

    /// Closes every live shard group that could accept timestamps at or
    /// beyond `t`. A group entirely in the future is truncated at its own
    /// start so it never accepts a write.
    pub fn truncate_shard_groups(&mut self, t: Timestamp) {
        for sg in self.shard_groups_mut() {
            if t >= sg.end_time || sg.deleted() || sg.truncated_at.is_some_and(|tr| tr < t) {
                continue;
            }
            if t <= sg.start_time {
                sg.truncated_at = Some(sg.start_time);
            } else {
                sg.truncated_at = Some(t);
            }
        }
    }

    /// Physically removes tombstoned shard groups whose deletion has aged
    /// past the expiration window.
    pub fn prune_shard_groups(&mut self) {
        let cutoff = now_nanos() - duration_nanos(SHARD_GROUP_DELETED_EXPIRATION);
        for db in &mut self.databases {
            for rp in &mut db.retention_policies {
                rp.shard_groups
                    .retain(|sg| sg.deleted_at.map_or(true, |d| d >= cutoff));
            }
        }
    }

    /// Adds a named continuous query to a database. Re-registering the same
    /// query text is an idempotent success; a different text under the same
    /// name conflicts.
    pub fn create_continuous_query(&mut self, database: &str, name: &str, query: &str) -> Result<()> {
        let di = self
            .database_mut(database)
            .ok_or_else(|| Error::DatabaseNotFound(database.to_string()))?;

        if let Some(cq) = di.continuous_queries.iter().find(|cq| cq.name == name) {
            if cq.query.eq_ignore_ascii_case(query) {
                return Ok(());
            }
            return Err(Error::ContinuousQueryExists);
        }

        di.continuous_queries.push(ContinuousQueryInfo {
            name: name.to_string(),
            query: query.to_string(),
        });
        Ok(())
    }

    /// Removes a continuous query. Succeeds silently when the database or
    /// query cannot be found.
    pub fn drop_continuous_query(&mut self, database: &str, name: &str) -> Result<()> {
        if let Some(di) = self.database_mut(database) {
            di.continuous_queries.retain(|cq| cq.name != name);
        }
        Ok(())
    }

    /// Adds a named subscription to a database and retention policy.
    pub fn create_subscription(
        &mut self,
        database: &str,
        rp: &str,
        name: &str,
        mode: &str,
        destinations: &[String],
    ) -> Result<()> {
        for d in destinations {
            validate_subscription_url(d)?;
        }

        let di = self
            .database_mut(database)
            .ok_or_else(|| Error::DatabaseNotFound(database.to_string()))?;
        let rpi = di
            .retention_policy_mut(rp)
            .ok_or_else(|| Error::RetentionPolicyNotFound(rp.to_string()))?;

        if rpi.subscriptions.iter().any(|s| s.name == name) {
            return Err(Error::SubscriptionExists);
        }

        rpi.subscriptions.push(SubscriptionInfo {
            name: name.to_string(),
            mode: mode.to_string(),
            destinations: destinations.to_vec(),
        });
        Ok(())
    }

    /// Removes a subscription.
    pub fn drop_subscription(&mut self, database: &str, rp: &str, name: &str) -> Result<()> {
        let di = self
            .database_mut(database)
            .ok_or_else(|| Error::DatabaseNotFound(database.to_string()))?;
        let rpi = di
            .retention_policy_mut(rp)
            .ok_or_else(|| Error::RetentionPolicyNotFound(rp.to_string()))?;

        let before = rpi.subscriptions.len();
        rpi.subscriptions.retain(|s| s.name != name);
        if rpi.subscriptions.len() == before {
            return Err(Error::SubscriptionNotFound);
        }
        Ok(())
    }

    /// Returns a user by name.
    pub fn user(&self, name: &str) -> Option<&UserInfo> {
        self.users.iter().find(|u| u.name == name)
    }

    fn user_mut(&mut self, name: &str) -> Option<&mut UserInfo> {
        self.users.iter_mut().find(|u| u.name == name)
    }

    /// Returns a deep copy of the user infos.
    pub fn clone_users(&self) -> Vec<UserInfo> {
        self.users.clone()
    }

    /// Creates a new user.
    pub fn create_user(&mut self, name: &str, hash: &str, admin: bool) -> Result<()> {
        if name.is_empty() {
            return Err(Error::UsernameRequired);
        } else if self.user(name).is_some() {
            return Err(Error::UserExists);
        }

        self.users.push(UserInfo {
            name: name.to_string(),
            hash: hash.to_string(),
            admin,
            privileges: HashMap::new(),
        });

        if admin {
            self.admin_user_exists = true;
        }
        Ok(())
    }

    /// Removes an existing user by name.
    pub fn drop_user(&mut self, name: &str) -> Result<()> {
        let Some(idx) = self.users.iter().position(|u| u.name == name) else {
            return Err(Error::UserNotFound);
        };
        let was_admin = self.users[idx].admin;
        self.users.remove(idx);

        // Maybe we dropped the only admin user?
        if was_admin {
            self.admin_user_exists = self.has_admin_user();
        }
        Ok(())
    }

    /// Updates the password hash of an existing user.
    pub fn update_user(&mut self, name: &str, hash: &str) -> Result<()> {
        match self.user_mut(name) {
            Some(u) => {
                u.hash = hash.to_string();
                Ok(())
            }
            None => Err(Error::UserNotFound),
        }
    }

    /// Sets a privilege for a user on a database. Both must exist.
    pub fn set_privilege(&mut self, name: &str, database: &str, p: Privilege) -> Result<()> {
        if self.user(name).is_none() {
            return Err(Error::UserNotFound);
        }
        if self.database(database).is_none() {
            return Err(Error::DatabaseNotFound(database.to_string()));
        }
        if let Some(u) = self.user_mut(name) {
            u.privileges.insert(database.to_string(), p);
        }
        Ok(())
    }

    /// Sets the admin flag for a user and recomputes the admin cache.
    pub fn set_admin_privilege(&mut self, name: &str, admin: bool) -> Result<()> {
        match self.user_mut(name) {
            Some(u) => u.admin = admin,
            None => return Err(Error::UserNotFound),
        }

        // We could have promoted or revoked the only admin; rescan.
        self.admin_user_exists = self.has_admin_user();
        Ok(())
    }

    /// Returns true if at least one admin user exists.
    pub fn admin_user_exists(&self) -> bool {
        self.admin_user_exists
    }

    /// Returns the privileges for a user.
    pub fn user_privileges(&self, name: &str) -> Result<&HashMap<String, Privilege>> {
        self.user(name)
            .map(|u| &u.privileges)
            .ok_or(Error::UserNotFound)
    }

    /// Returns the privilege for a user on a database, defaulting to
    /// no privileges.
    pub fn user_privilege(&self, name: &str, database: &str) -> Result<Privilege> {
        let u = self.user(name).ok_or(Error::UserNotFound)?;
        Ok(u.privileges
            .get(database)
            .copied()
            .unwrap_or(Privilege::NoPrivileges))
    }

    fn has_admin_user(&self) -> bool {
        self.users.iter().any(|u| u.admin)
    }

    /// Recompute the admin cache; the serialized form does not carry it.
    pub(crate) fn rebuild_admin_cache(&mut self) {
        self.admin_user_exists = self.has_admin_user();
    }

    /// Imports selected databases from another metadata tree.
    ///
    /// When `backup_db` is non-empty only that database is imported (renamed
    /// to `restore_db` if given, likewise `backup_rp`/`restore_rp` for a
    /// single policy); otherwise every database except the internal one is
    /// imported unchanged. Every imported shard group and shard is
    /// renumbered from this tree's counters. Returns the old→new shard id
    /// mapping and the names of the created databases, which the restore
    /// path uses to relocate shard data.
    pub fn import_data(
        &mut self,
        other: &Data,
        backup_db: &str,
        restore_db: &str,
        backup_rp: &str,
        restore_rp: &str,
    ) -> Result<(HashMap<u64, u64>, Vec<String>)> {
        let mut shard_id_map = HashMap::new();
        if !backup_db.is_empty() {
            let db_name =
                self.import_one_db(other, backup_db, restore_db, backup_rp, restore_rp, &mut shard_id_map)?;
            return Ok((shard_id_map, vec![db_name]));
        }

        // No database selected: import them all, failing the whole
        // operation if any one of them fails.
        let mut new_dbs = Vec::new();
        for dbi in &other.databases {
            if dbi.name == INTERNAL_DATABASE {
                continue;
            }
            let db_name = self.import_one_db(other, &dbi.name, "", "", "", &mut shard_id_map)?;
            new_dbs.push(db_name);
        }
        Ok((shard_id_map, new_dbs))
    }

    fn import_one_db(
        &mut self,
        other: &Data,
        backup_db: &str,
        restore_db: &str,
        backup_rp: &str,
        restore_rp: &str,
        shard_id_map: &mut HashMap<u64, u64>,
    ) -> Result<String> {
        let db_ptr = other
            .database(backup_db)
            .ok_or_else(|| Error::ImportDatabaseMissing(backup_db.to_string()))?;

        let restore_db = if restore_db.is_empty() {
            backup_db
        } else {
            restore_db
        };

        if self.database(restore_db).is_some() {
            return Err(Error::DatabaseExists);
        }

        self.create_database(restore_db)?;

        let mut policies: Vec<RetentionPolicyInfo>;
        let default_policy: String;
        if !backup_rp.is_empty() {
            let rp_ptr = db_ptr
                .retention_policies
                .iter()
                .find(|rp| rp.name == backup_rp)
                .ok_or_else(|| {
                    Error::RetentionPolicyNotFound(format!("{backup_db}.{backup_rp}"))
                })?;

            let mut rp_import = rp_ptr.clone();
            let restore_rp = if restore_rp.is_empty() {
                backup_rp
            } else {
                restore_rp
            };
            rp_import.name = restore_rp.to_string();
            default_policy = restore_rp.to_string();
            policies = vec![rp_import];
        } else {
            // Import all policies without renaming.
            default_policy = db_ptr.default_retention_policy.clone();
            policies = db_ptr.retention_policies.clone();
        }

        // Renumber shard groups and shards from this tree's counters, and
        // clear owner sets: node ids from the source cluster are meaningless
        // here.
        for rp_import in &mut policies {
            for sg in &mut rp_import.shard_groups {
                self.max_shard_group_id += 1;
                sg.id = self.max_shard_group_id;
                for shard in &mut sg.shards {
                    self.max_shard_id += 1;
                    shard_id_map.insert(shard.id, self.max_shard_id);
                    shard.id = self.max_shard_id;
                    shard.owners = Vec::new();
                }
            }
        }

        let db_import = self
            .database_mut(restore_db)
            .ok_or_else(|| Error::DatabaseNotFound(restore_db.to_string()))?;
        db_import.default_retention_policy = default_policy;
        db_import.retention_policies = policies;

        Ok(restore_db.to_string())
    }
}

/// Picks the new owner for an orphaned shard: the data node that currently
/// owns the fewest shards in the group, lowest node id breaking ties. The
/// running count is updated so successive orphans spread out.
fn new_shard_owner(shard_id: u64, owner_freqs: &mut BTreeMap<u64, usize>) -> Result<u64> {
    let mut min: Option<(u64, usize)> = None;
    for (&node_id, &freq) in owner_freqs.iter() {
        match min {
            Some((_, min_freq)) if freq >= min_freq => {}
            _ => min = Some((node_id, freq)),
        }
    }

    let Some((node_id, _)) = min else {
        return Err(Error::ShardReassignFailed(shard_id));
    };

    owner_freqs.entry(node_id).and_modify(|f| *f += 1);
    Ok(node_id)
}

fn validate_subscription_url(input: &str) -> Result<()> {
    let invalid = || Error::InvalidSubscriptionUrl(input.to_string());
    let u = Url::parse(input).map_err(|_| invalid())?;

    if !matches!(u.scheme(), "udp" | "http" | "https") {
        return Err(invalid());
    }
    if u.host_str().is_none() || u.port().is_none() {
        return Err(invalid());
    }
    Ok(())
}
