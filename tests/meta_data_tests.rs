//! Integration tests for the metadata core
//!
//! Exercises shard-group placement, node-deletion rebalancing, truncation,
//! pruning, and import/renumbering against the invariants the rest of the
//! system assumes.

use chronoshard::meta::{
    Data, DatabaseInfo, RetentionPolicyInfo, RetentionPolicySpec, RetentionPolicyUpdate,
    ShardGroupInfo, ShardInfo, ShardOwner, MAX_NANO_TIME,
};
use chronoshard::Error;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

const HOUR: i64 = 3_600_000_000_000;
const DAY: i64 = 24 * HOUR;

fn cluster(nodes: usize) -> Data {
    let mut data = Data::default();
    for i in 1..=nodes {
        data.create_data_node(&format!("h{i}:8086"), &format!("h{i}:8088"))
            .unwrap();
    }
    data
}

fn add_policy(data: &mut Data, db: &str, rp: &str, replica_n: usize, duration_secs: u64) {
    data.create_database(db).unwrap();
    let spec = RetentionPolicySpec {
        name: Some(rp.to_string()),
        replica_n: Some(replica_n),
        duration: Some(Duration::from_secs(duration_secs)),
        shard_group_duration: Duration::ZERO,
    };
    data.create_retention_policy(db, &spec.new_retention_policy_info(), true)
        .unwrap();
}

fn group<'a>(data: &'a Data, db: &str, rp: &str) -> &'a [ShardGroupInfo] {
    &data
        .database(db)
        .unwrap()
        .retention_policy(rp)
        .unwrap()
        .shard_groups
}

#[test]
fn placement_distributes_shards_evenly() {
    // 4 nodes, replica factor 2: 2 shards cover the nodes exactly once.
    let mut data = cluster(4);
    add_policy(&mut data, "db0", "rp0", 2, 0);
    data.create_shard_group("db0", "rp0", 0).unwrap();

    let groups = group(&data, "db0", "rp0");
    assert_eq!(groups.len(), 1);
    let sg = &groups[0];
    assert_eq!(sg.shards.len(), 2);

    let mut pairs = HashSet::new();
    for shard in &sg.shards {
        assert_eq!(shard.owners.len(), 2);
        for owner in &shard.owners {
            assert!(pairs.insert((shard.id, owner.node_id)), "duplicate owner");
        }
    }
    assert_eq!(pairs.len(), 4);

    let owners_per_node = owner_counts(sg);
    assert_eq!(owners_per_node.len(), 4);
    assert!(owners_per_node.values().all(|&c| c == 1));
}

#[test]
fn placement_with_replica_three_of_four_nodes() {
    // 4 nodes, replica factor 3: the smallest even fan-out is 4 shards.
    let mut data = cluster(4);
    add_policy(&mut data, "db0", "rp0", 3, 0);
    data.create_shard_group("db0", "rp0", 0).unwrap();

    let sg = &group(&data, "db0", "rp0")[0];
    assert_eq!(sg.shards.len(), 4);
    assert!(sg.shards.iter().all(|s| s.owners.len() == 3));

    let owners_per_node = owner_counts(sg);
    assert!(owners_per_node.values().all(|&c| c == 3));
}

#[test]
fn placement_clamps_replica_factor_to_node_count() {
    let mut data = cluster(2);
    add_policy(&mut data, "db0", "rp0", 3, 0);
    data.create_shard_group("db0", "rp0", 0).unwrap();

    let sg = &group(&data, "db0", "rp0")[0];
    assert!(sg.shards.iter().all(|s| s.owners.len() == 2));
}

#[test]
fn placement_is_idempotent_per_timestamp() {
    let mut data = cluster(2);
    add_policy(&mut data, "db0", "rp0", 1, 0);
    data.create_shard_group("db0", "rp0", 5 * HOUR).unwrap();
    data.create_shard_group("db0", "rp0", 5 * HOUR).unwrap();
    assert_eq!(group(&data, "db0", "rp0").len(), 1);
}

#[test]
fn placement_without_nodes_is_a_noop() {
    let mut data = Data::default();
    add_policy(&mut data, "db0", "rp0", 1, 0);
    data.create_shard_group("db0", "rp0", 0).unwrap();
    assert!(group(&data, "db0", "rp0").is_empty());
}

#[test]
fn placement_clamps_end_time_at_max_nano_time() {
    let mut data = cluster(1);
    add_policy(&mut data, "db0", "rp0", 1, 0);
    data.create_shard_group("db0", "rp0", MAX_NANO_TIME).unwrap();

    let sg = &group(&data, "db0", "rp0")[0];
    assert_eq!(sg.end_time, MAX_NANO_TIME + 1);
    assert!(sg.contains(MAX_NANO_TIME));
}

#[test]
fn groups_never_overlap_even_after_truncation() {
    let mut data = cluster(2);
    add_policy(&mut data, "db0", "rp0", 1, 0);

    // [0, 7d) exists, is truncated at 12h, and a later write lands at 13h.
    data.create_shard_group("db0", "rp0", 0).unwrap();
    data.truncate_shard_groups(12 * HOUR);
    data.create_shard_group("db0", "rp0", 13 * HOUR).unwrap();

    let groups = group(&data, "db0", "rp0");
    assert_eq!(groups.len(), 2);

    // The new group starts where the truncated one effectively ends.
    let new = groups.iter().find(|sg| !sg.truncated()).unwrap();
    assert_eq!(new.start_time, 12 * HOUR);
    assert!(new.contains(13 * HOUR));

    // For any instant, at most one group accepts writes.
    for t in [0, 6 * HOUR, 12 * HOUR, 13 * HOUR, 3 * DAY] {
        let writable = data
            .shard_group_by_timestamp("db0", "rp0", t)
            .unwrap()
            .into_iter()
            .count();
        assert!(writable <= 1, "time {t} covered by more than one group");
    }
}

#[test]
fn shard_ids_are_strictly_increasing() {
    let mut data = cluster(3);
    add_policy(&mut data, "db0", "rp0", 2, 0);
    for week in 0..4 {
        data.create_shard_group("db0", "rp0", week * 7 * DAY).unwrap();
    }

    let mut ids = Vec::new();
    for sg in group(&data, "db0", "rp0") {
        for shard in &sg.shards {
            ids.push(shard.id);
            assert!(data.max_shard_id >= shard.id);
        }
    }
    let mut sorted = ids.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), ids.len(), "shard ids must be unique");
}

#[test]
fn delete_data_node_strips_ownership() {
    // Replicated layout: S1{1,2}, S2{2,3}, S3{1,3}. No shard loses its
    // last owner, so ownership is only stripped.
    let mut data = cluster(3);
    let ids: Vec<u64> = data.data_nodes.iter().map(|n| n.id).collect();
    let (n1, n2, n3) = (ids[0], ids[1], ids[2]);

    data.create_database("db0").unwrap();
    data.create_retention_policy("db0", &RetentionPolicyInfo::new("rp0"), true)
        .unwrap();
    let shards = vec![
        shard(1, &[n1, n2]),
        shard(2, &[n2, n3]),
        shard(3, &[n1, n3]),
    ];
    push_group(&mut data, "db0", "rp0", 1, 0, 7 * DAY, shards);
    data.max_shard_group_id = 1;
    data.max_shard_id = 3;

    data.delete_data_node(n2).unwrap();

    let sg = &group(&data, "db0", "rp0")[0];
    assert!(!sg.deleted(), "group must survive the deletion");

    for s in &sg.shards {
        assert!(!s.owned_by(n2), "deleted node still owns shard {}", s.id);
        assert!(!s.owners.is_empty(), "shard {} orphaned", s.id);
    }

    let counts = owner_counts(sg);
    assert_eq!(counts.get(&n1), Some(&2));
    assert_eq!(counts.get(&n3), Some(&2));
}

#[test]
fn delete_data_node_rebalances_orphans() {
    // Single-owner layout: two shards owned only by the doomed node must be
    // reassigned to the least-loaded survivors.
    let mut data = cluster(3);
    let ids: Vec<u64> = data.data_nodes.iter().map(|n| n.id).collect();
    let (n1, n2, n3) = (ids[0], ids[1], ids[2]);

    data.create_database("db0").unwrap();
    data.create_retention_policy("db0", &RetentionPolicyInfo::new("rp0"), true)
        .unwrap();
    let shards = vec![
        shard(1, &[n2]),
        shard(2, &[n2]),
        shard(3, &[n1]),
        shard(4, &[n3]),
    ];
    push_group(&mut data, "db0", "rp0", 1, 0, 7 * DAY, shards);
    data.max_shard_group_id = 1;
    data.max_shard_id = 4;

    data.delete_data_node(n2).unwrap();

    let sg = &group(&data, "db0", "rp0")[0];
    assert!(!sg.deleted(), "group must survive a rebalance");
    for s in &sg.shards {
        assert!(!s.owned_by(n2), "deleted node still owns shard {}", s.id);
        assert!(!s.owners.is_empty(), "shard {} left orphaned", s.id);
    }

    // The running count spreads successive orphans across survivors.
    let counts = owner_counts(sg);
    let c1 = counts.get(&n1).copied().unwrap_or(0);
    let c3 = counts.get(&n3).copied().unwrap_or(0);
    assert_eq!(c1 + c3, 4);
    assert!(c1.abs_diff(c3) <= 1, "unbalanced: n1={c1} n3={c3}");
}

#[test]
fn delete_last_data_node_tombstones_groups() {
    let mut data = cluster(1);
    let n1 = data.data_nodes[0].id;
    add_policy(&mut data, "db0", "rp0", 1, 0);
    data.create_shard_group("db0", "rp0", 0).unwrap();

    data.delete_data_node(n1).unwrap();
    assert!(group(&data, "db0", "rp0").iter().all(|sg| sg.deleted()));

    assert!(matches!(data.delete_data_node(n1), Err(Error::NodeNotFound)));
}

#[test]
fn truncate_future_group_disables_it() {
    let mut data = cluster(1);
    add_policy(&mut data, "db0", "rp0", 1, 0);
    data.create_shard_group("db0", "rp0", 10 * DAY).unwrap();

    let start = group(&data, "db0", "rp0")[0].start_time;
    data.truncate_shard_groups(start - HOUR);

    let sg = &group(&data, "db0", "rp0")[0];
    assert_eq!(sg.truncated_at, Some(sg.start_time));
    assert!(
        data.shard_group_by_timestamp("db0", "rp0", start + HOUR)
            .unwrap()
            .is_none(),
        "future group must not accept writes"
    );
}

#[test]
fn prune_respects_deletion_expiration() {
    let now = chrono::Utc::now().timestamp_nanos_opt().unwrap();
    let mut data = cluster(1);
    data.create_database("db0").unwrap();
    data.create_retention_policy("db0", &RetentionPolicyInfo::new("rp0"), true)
        .unwrap();
    push_group(&mut data, "db0", "rp0", 1, 0, DAY, vec![shard(1, &[1])]);
    push_group(&mut data, "db0", "rp0", 2, DAY, 2 * DAY, vec![shard(2, &[1])]);

    // One tombstone is long past expiration, the other is fresh.
    {
        let db = data.databases.iter_mut().find(|d| d.name == "db0").unwrap();
        let rp = &mut db.retention_policies[0];
        rp.shard_groups[0].deleted_at = Some(now - 3 * DAY);
        rp.shard_groups[1].deleted_at = Some(now - HOUR);
    }

    data.prune_shard_groups();
    let groups = group(&data, "db0", "rp0");
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].id, 2);
}

#[test]
fn drop_shard_and_owner_operations() {
    let mut data = cluster(2);
    data.create_database("db0").unwrap();
    data.create_retention_policy("db0", &RetentionPolicyInfo::new("rp0"), true)
        .unwrap();
    push_group(
        &mut data,
        "db0",
        "rp0",
        1,
        0,
        DAY,
        vec![shard(1, &[1, 2]), shard(2, &[2])],
    );

    // Owner copy inserts in ascending node-id position and is idempotent.
    data.copy_shard_owner(2, 1);
    data.copy_shard_owner(2, 1);
    let sg = &group(&data, "db0", "rp0")[0];
    assert_eq!(
        sg.shards[1].owners,
        vec![ShardOwner { node_id: 1 }, ShardOwner { node_id: 2 }]
    );

    // Removing the last owner of a shard deletes the shard.
    data.remove_shard_owner(2, 1);
    data.remove_shard_owner(2, 2);
    let sg = &group(&data, "db0", "rp0")[0];
    assert_eq!(sg.shards.len(), 1);
    assert!(!sg.deleted());

    // Dropping the last shard tombstones the group.
    data.drop_shard(1);
    let sg = &group(&data, "db0", "rp0")[0];
    assert!(sg.shards.is_empty());
    assert!(sg.deleted());
}

#[test]
fn retention_policy_create_is_idempotent_only_on_match() {
    let mut data = cluster(1);
    add_policy(&mut data, "db0", "rp0", 1, 0);

    let stored = data
        .retention_policy("db0", "rp0")
        .unwrap()
        .unwrap()
        .clone();

    // Identical request: no-op.
    data.create_retention_policy("db0", &stored, true).unwrap();

    // Same name, different replication: conflict.
    let mut diverged = stored.clone();
    diverged.replica_n = 2;
    assert!(matches!(
        data.create_retention_policy("db0", &diverged, false),
        Err(Error::RetentionPolicyExists)
    ));

    // Same settings but asking to flip the default: conflict.
    let mut other = stored.clone();
    other.name = "rp1".to_string();
    data.create_retention_policy("db0", &other, false).unwrap();
    assert!(matches!(
        data.create_retention_policy("db0", &other, true),
        Err(Error::RetentionPolicyConflict)
    ));

    // Retention shorter than the shard group width is rejected.
    let mut short = RetentionPolicyInfo::new("rp2");
    short.duration = Duration::from_secs(3600);
    short.shard_group_duration = Duration::from_secs(2 * 3600);
    assert!(matches!(
        data.create_retention_policy("db0", &short, false),
        Err(Error::IncompatibleDurations)
    ));
}

#[test]
fn update_retention_policy_validates_durations_and_names() {
    let mut data = cluster(1);
    add_policy(&mut data, "db0", "rp0", 1, 30 * 24 * 3600);
    add_policy(&mut data, "db0", "rp1", 1, 0);

    // Renaming over an existing policy is rejected.
    let rename = RetentionPolicyUpdate {
        name: Some("rp1".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        data.update_retention_policy("db0", "rp0", &rename, false),
        Err(Error::RetentionPolicyNameExists)
    ));

    // Sub-minimum durations are rejected; zero (infinite) is allowed.
    let too_low = RetentionPolicyUpdate {
        duration: Some(Duration::from_secs(60)),
        ..Default::default()
    };
    assert!(matches!(
        data.update_retention_policy("db0", "rp0", &too_low, false),
        Err(Error::RetentionPolicyDurationTooLow)
    ));

    let infinite = RetentionPolicyUpdate {
        duration: Some(Duration::ZERO),
        ..Default::default()
    };
    data.update_retention_policy("db0", "rp0", &infinite, false)
        .unwrap();

    // Duration below the current shard group width is rejected.
    let incompatible = RetentionPolicyUpdate {
        duration: Some(Duration::from_secs(3600)),
        ..Default::default()
    };
    assert!(matches!(
        data.update_retention_policy("db0", "rp0", &incompatible, false),
        Err(Error::IncompatibleDurations)
    ));
}

#[test]
fn import_renumbers_ids_and_clears_owners() {
    let mut source = cluster(3);
    add_policy(&mut source, "db0", "rp0", 2, 0);
    add_policy(&mut source, "db1", "rp1", 1, 0);
    source.create_database("_internal").unwrap();
    for week in 0..3 {
        source.create_shard_group("db0", "rp0", week * 7 * DAY).unwrap();
        source.create_shard_group("db1", "rp1", week * 7 * DAY).unwrap();
    }

    let mut target = Data::default();
    target.max_shard_id = 1000;
    target.max_shard_group_id = 500;
    let (id_map, new_dbs) = target.import_data(&source, "", "", "", "").unwrap();

    // The internal database is excluded from a bulk import.
    assert_eq!(new_dbs, vec!["db0".to_string(), "db1".to_string()]);
    assert!(target.database("_internal").is_none());

    let mut old_ids = HashSet::new();
    for db in ["db0", "db1"] {
        for sg in group(&source, db, if db == "db0" { "rp0" } else { "rp1" }) {
            for s in &sg.shards {
                old_ids.insert(s.id);
            }
        }
    }
    // Every source shard is mapped to a fresh id past the target's counter.
    assert_eq!(id_map.len(), old_ids.len());
    assert!(id_map.keys().all(|id| old_ids.contains(id)));
    assert!(id_map.values().all(|&id| id > 1000));

    for db in ["db0", "db1"] {
        for sg in group(&target, db, if db == "db0" { "rp0" } else { "rp1" }) {
            assert!(sg.id > 500);
            for s in &sg.shards {
                assert!(s.owners.is_empty(), "imported owners must be cleared");
            }
        }
    }

    // Importing over an existing database is rejected.
    let mut occupied = Data::default();
    occupied.create_database("db0").unwrap();
    assert!(matches!(
        occupied.import_data(&source, "db0", "", "", ""),
        Err(Error::DatabaseExists)
    ));
}

#[test]
fn import_renames_database_and_policy() {
    let mut source = cluster(1);
    add_policy(&mut source, "db0", "rp0", 1, 0);
    source.create_shard_group("db0", "rp0", 0).unwrap();

    let mut target = Data::default();
    let (_, new_dbs) = target
        .import_data(&source, "db0", "restored", "rp0", "weekly")
        .unwrap();
    assert_eq!(new_dbs, vec!["restored".to_string()]);

    let di = target.database("restored").unwrap();
    assert_eq!(di.default_retention_policy, "weekly");
    assert_eq!(di.retention_policies.len(), 1);
    assert_eq!(di.retention_policies[0].name, "weekly");

    assert!(matches!(
        target.import_data(&source, "missing", "", "", ""),
        Err(Error::ImportDatabaseMissing(_))
    ));
}

#[test]
fn snapshot_round_trip_after_mutation_history() {
    let mut data = cluster(3);
    add_policy(&mut data, "db0", "rp0", 2, 14 * 24 * 3600);
    for day in 0..5 {
        data.create_shard_group("db0", "rp0", day * DAY).unwrap();
    }
    data.truncate_shard_groups(2 * DAY + HOUR);
    data.create_user("root", "h0", true).unwrap();
    let n3 = data.data_nodes[2].id;
    data.delete_data_node(n3).unwrap();

    let buf = data.marshal_binary().unwrap();
    let decoded = Data::from_binary(&buf).unwrap();
    assert_eq!(decoded, data);
    assert_eq!(decoded.admin_user_exists(), data.admin_user_exists());
}

#[test]
fn database_shard_infos_deduplicates_live_shards() {
    let mut data = cluster(2);
    add_policy(&mut data, "db0", "rp0", 2, 0);
    data.create_shard_group("db0", "rp0", 0).unwrap();
    data.create_shard_group("db0", "rp0", 10 * DAY).unwrap();

    let di: &DatabaseInfo = data.database("db0").unwrap();
    let shards: Vec<ShardInfo> = di.shard_infos();
    let unique: HashSet<u64> = shards.iter().map(|s| s.id).collect();
    assert_eq!(unique.len(), shards.len());
    assert!(!shards.is_empty());
}

fn shard(id: u64, owners: &[u64]) -> ShardInfo {
    ShardInfo {
        id,
        owners: owners.iter().map(|&node_id| ShardOwner { node_id }).collect(),
    }
}

fn push_group(
    data: &mut Data,
    db: &str,
    rp: &str,
    id: u64,
    start: i64,
    end: i64,
    shards: Vec<ShardInfo>,
) {
    let dbi = data.databases.iter_mut().find(|d| d.name == db).unwrap();
    let rpi = dbi
        .retention_policies
        .iter_mut()
        .find(|r| r.name == rp)
        .unwrap();
    rpi.shard_groups.push(ShardGroupInfo {
        id,
        start_time: start,
        end_time: end,
        shards,
        ..Default::default()
    });
}

fn owner_counts(sg: &ShardGroupInfo) -> HashMap<u64, usize> {
    let mut counts = HashMap::new();
    for s in &sg.shards {
        for o in &s.owners {
            *counts.entry(o.node_id).or_insert(0) += 1;
        }
    }
    counts
}
