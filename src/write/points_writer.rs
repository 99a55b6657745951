//! Points writer: replicated shard fan-out under a consistency level
//!
//! Handles writes across local and remote data nodes. Each request is
//! mapped to shards, each shard spawns one task per owner replica, and the
//! collected acknowledgments are weighed against the requested consistency
//! level. Remote failures that the hinted-handoff layer classifies as
//! retryable are queued there instead of failing the write.

use super::mapper::{SgList, ShardMapping};
use super::stats::WriteStatistics;
use super::{ConsistencyLevel, Point, Statistic, WritePointsRequest};
use crate::meta::{
    duration_nanos, DatabaseInfo, RetentionPolicyInfo, ShardGroupInfo, ShardInfo, ShardOwner,
    Timestamp, MIN_NANO_TIME,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, warn};

/// Default overall write timeout.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Read access to the cluster metadata snapshot, plus on-demand shard group
/// creation through the consensus layer.
#[async_trait]
pub trait MetaClient: Send + Sync {
    /// The local node's id.
    fn node_id(&self) -> u64;
    fn database(&self, name: &str) -> Option<DatabaseInfo>;
    fn retention_policy(&self, database: &str, policy: &str)
        -> Result<Option<RetentionPolicyInfo>>;
    async fn create_shard_group(
        &self,
        database: &str,
        policy: &str,
        timestamp: Timestamp,
    ) -> Result<Option<ShardGroupInfo>>;
}

/// Per-write accumulator a storage engine may fill in when it supports the
/// context-aware write capability.
#[derive(Debug, Default)]
pub struct ShardWriteContext {
    pub points_written: AtomicI64,
    pub values_written: AtomicI64,
}

/// The local storage engine.
#[async_trait]
pub trait TsdbStore: Send + Sync {
    async fn create_shard(
        &self,
        database: &str,
        retention_policy: &str,
        shard_id: u64,
        enabled: bool,
    ) -> Result<()>;

    async fn write_to_shard(&self, shard_id: u64, points: &[Point]) -> Result<()>;

    /// Optional capability: a context-aware write that reports per-shard
    /// totals. Stores that don't implement it fall back to the plain call.
    async fn write_to_shard_with_context(
        &self,
        _ctx: &ShardWriteContext,
        shard_id: u64,
        points: &[Point],
    ) -> Result<()> {
        self.write_to_shard(shard_id, points).await
    }
}

/// The inter-node write transport.
#[async_trait]
pub trait ShardWriter: Send + Sync {
    async fn write_shard(&self, shard_id: u64, owner_id: u64, points: &[Point]) -> Result<()>;
}

/// The durable per-owner queue that absorbs writes for unreachable nodes.
#[async_trait]
pub trait HintedHandoff: Send + Sync {
    async fn write_shard(&self, shard_id: u64, owner_id: u64, points: &[Point]) -> Result<()>;
    /// Whether the queue for `(shard, owner)` has pending data.
    fn empty(&self, shard_id: u64, owner_id: u64) -> bool;
    /// Whether a remote write error is worth queueing for replay.
    fn is_retryable(&self, err: &Error) -> bool;
}

/// Configuration for a [`PointsWriter`].
#[derive(Debug, Clone)]
pub struct PointsWriterConfig {
    /// When false, a non-empty handoff queue for an owner suppresses direct
    /// writes to that owner so queued points are delivered first.
    pub allow_out_of_order_writes: bool,
    pub write_timeout: Duration,
}

impl Default for PointsWriterConfig {
    fn default() -> Self {
        Self {
            allow_out_of_order_writes: false,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// Handles writes across multiple local and remote data nodes.
pub struct PointsWriter {
    core: Arc<Core>,
    state: RwLock<WriterState>,
}

struct WriterState {
    closing: watch::Sender<bool>,
    sub_points: Vec<mpsc::Sender<Arc<WritePointsRequest>>>,
}

struct Core {
    allow_out_of_order_writes: bool,
    write_timeout: Duration,
    meta_client: Arc<dyn MetaClient>,
    tsdb_store: Arc<dyn TsdbStore>,
    shard_writer: Arc<dyn ShardWriter>,
    hinted_handoff: Arc<dyn HintedHandoff>,
    stats: WriteStatistics,
}

struct AsyncWriteResult {
    owner: ShardOwner,
    err: Option<Error>,
}

impl PointsWriter {
    /// Returns a new points writer wired to its collaborators.
    pub fn new(
        config: PointsWriterConfig,
        meta_client: Arc<dyn MetaClient>,
        tsdb_store: Arc<dyn TsdbStore>,
        shard_writer: Arc<dyn ShardWriter>,
        hinted_handoff: Arc<dyn HintedHandoff>,
    ) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            core: Arc::new(Core {
                allow_out_of_order_writes: config.allow_out_of_order_writes,
                write_timeout: config.write_timeout,
                meta_client,
                tsdb_store,
                shard_writer,
                hinted_handoff,
                stats: WriteStatistics::default(),
            }),
            state: RwLock::new(WriterState {
                closing,
                sub_points: Vec::new(),
            }),
        }
    }

    /// Opens the writer, arming the closing signal. Idempotent.
    pub fn open(&self) -> Result<()> {
        let mut state = self.state.write();
        if *state.closing.borrow() {
            let (closing, _) = watch::channel(false);
            state.closing = closing;
        }
        Ok(())
    }

    /// Closes the writer. In-flight writes observe the closing signal and
    /// fail; future subscriber broadcasts drop on an empty list. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        state.closing.send_replace(true);
        state.sub_points.clear();
        Ok(())
    }

    /// Registers a subscriber channel that receives a copy of every write
    /// request. Sends never block; a full channel drops the copy.
    pub fn add_write_subscriber(&self, ch: mpsc::Sender<Arc<WritePointsRequest>>) {
        self.state.write().sub_points.push(ch);
    }

    /// Returns statistics for periodic monitoring.
    pub fn statistics(&self, tags: BTreeMap<String, String>) -> Vec<Statistic> {
        vec![self.core.stats.statistic(tags)]
    }

    /// Maps the points contained in `wp` to a [`ShardMapping`]. If a point
    /// maps to a shard group that does not currently exist, it is created
    /// before returning the mapping.
    pub async fn map_shards(&self, wp: &WritePointsRequest) -> Result<ShardMapping> {
        let rp = self
            .core
            .meta_client
            .retention_policy(&wp.database, &wp.retention_policy)?
            .ok_or_else(|| Error::RetentionPolicyNotFound(wp.retention_policy.clone()))?;

        // Points before the retention window are out of scope.
        let min = if rp.duration.is_zero() {
            MIN_NANO_TIME
        } else {
            crate::meta::now_nanos() - duration_nanos(rp.duration)
        };

        let mut list = SgList::default();
        for p in &wp.points {
            // Either the point is outside the scope of the RP, or we
            // already have a suitable shard group for it.
            if p.time < min || list.covers(p.time) {
                continue;
            }

            let sg = self
                .core
                .meta_client
                .create_shard_group(&wp.database, &wp.retention_policy, p.time)
                .await?
                .ok_or(Error::ShardGroupUnavailable)?;
            list.add(sg);
        }

        let mut mapping = ShardMapping::new(wp.points.len());
        for p in &wp.points {
            match list.shard_group_at(p.time) {
                None => {
                    // No group was created because the point predates the
                    // retention window.
                    mapping.dropped.push(p.clone());
                    WriteStatistics::add(&self.core.stats.write_dropped, 1);
                }
                Some(sg) => {
                    let shard = sg.shard_for(p.hash_id()).clone();
                    mapping.map_point(&shard, p.clone());
                }
            }
        }
        Ok(mapping)
    }

    /// Writes `points` to the shards covering them, meeting `consistency`
    /// on every shard, with a fresh (discarded) shard-write context.
    pub async fn write_points(
        &self,
        database: &str,
        retention_policy: &str,
        consistency: ConsistencyLevel,
        points: Vec<Point>,
    ) -> Result<()> {
        self.write_points_with_context(
            Arc::new(ShardWriteContext::default()),
            database,
            retention_policy,
            consistency,
            points,
        )
        .await
    }

    /// Writes `points`, accumulating per-shard storage totals into `ctx`
    /// when the store supports the context-aware capability.
    pub async fn write_points_with_context(
        &self,
        ctx: Arc<ShardWriteContext>,
        database: &str,
        retention_policy: &str,
        consistency: ConsistencyLevel,
        points: Vec<Point>,
    ) -> Result<()> {
        WriteStatistics::add(&self.core.stats.write_req, 1);
        WriteStatistics::add(&self.core.stats.point_write_req, points.len() as i64);

        let retention_policy = if retention_policy.is_empty() {
            let db = self
                .core
                .meta_client
                .database(database)
                .ok_or_else(|| Error::DatabaseNotFound(database.to_string()))?;
            db.default_retention_policy
        } else {
            retention_policy.to_string()
        };

        let request = Arc::new(WritePointsRequest {
            database: database.to_string(),
            retention_policy,
            points,
        });
        let mapping = self.map_shards(&request).await?;

        // Write each shard in its own task and fail as soon as one does.
        let shard_count = mapping.points.len();
        let (tx, mut rx) = mpsc::channel::<Result<()>>(shard_count.max(1));
        let closing = self.state.read().closing.subscribe();
        for (shard_id, shard_points) in mapping.points {
            let Some(shard) = mapping.shards.get(&shard_id).cloned() else {
                continue;
            };
            let core = Arc::clone(&self.core);
            let ctx = Arc::clone(&ctx);
            let database = request.database.clone();
            let retention_policy = request.retention_policy.clone();
            let closing = closing.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = core
                    .write_to_shard(
                        &ctx,
                        &shard,
                        &database,
                        &retention_policy,
                        consistency,
                        Arc::new(shard_points),
                        closing,
                    )
                    .await;
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        // Send a copy to subscriptions if possible. The read lock pairs
        // with `close` nulling the list.
        let (mut sub_ok, mut sub_dropped) = (0i64, 0i64);
        {
            let state = self.state.read();
            for ch in &state.sub_points {
                match ch.try_send(Arc::clone(&request)) {
                    Ok(()) => sub_ok += 1,
                    Err(_) => sub_dropped += 1,
                }
            }
        }
        if sub_ok > 0 {
            WriteStatistics::add(&self.core.stats.sub_write_ok, sub_ok);
        }
        if sub_dropped > 0 {
            WriteStatistics::add(&self.core.stats.sub_write_drop, sub_dropped);
        }

        // Points the mapper dropped surface as a partial write, but only if
        // every shard write succeeds; a failing shard wins.
        let partial = if mapping.dropped.is_empty() {
            None
        } else {
            Some(Error::PartialWriteDropped {
                reason: "points beyond retention policy".to_string(),
                dropped: mapping.dropped.len(),
            })
        };

        let mut closing = self.state.read().closing.subscribe();
        let timeout = tokio::time::sleep(self.core.write_timeout);
        tokio::pin!(timeout);
        for _ in 0..shard_count {
            tokio::select! {
                _ = closing.wait_for(|closed| *closed) => {
                    return Err(Error::WriteFailed);
                }
                _ = &mut timeout => {
                    WriteStatistics::add(&self.core.stats.write_timeout, 1);
                    return Err(Error::Timeout);
                }
                result = rx.recv() => {
                    match result {
                        Some(Ok(())) => {}
                        Some(Err(e)) => return Err(e),
                        None => return Err(Error::WriteFailed),
                    }
                }
            }
        }

        match partial {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Core {
    /// Writes points to every owner of one shard and tallies the results
    /// against the consistency level.
    #[allow(clippy::too_many_arguments)]
    async fn write_to_shard(
        self: &Arc<Self>,
        ctx: &Arc<ShardWriteContext>,
        shard: &ShardInfo,
        database: &str,
        retention_policy: &str,
        consistency: ConsistencyLevel,
        points: Arc<Vec<Point>>,
        mut closing: watch::Receiver<bool>,
    ) -> Result<()> {
        let required = consistency.required_acks(shard.owners.len());

        let (tx, mut rx) = mpsc::channel::<AsyncWriteResult>(shard.owners.len().max(1));
        for owner in shard.owners.iter().copied() {
            let core = Arc::clone(self);
            let ctx = Arc::clone(ctx);
            let points = Arc::clone(&points);
            let database = database.to_string();
            let retention_policy = retention_policy.to_string();
            let shard_id = shard.id;
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = core
                    .write_to_owner(&ctx, shard_id, owner, &database, &retention_policy, consistency, &points)
                    .await;
                let _ = tx
                    .send(AsyncWriteResult {
                        owner,
                        err: result.err(),
                    })
                    .await;
            });
        }
        drop(tx);

        let mut wrote = 0usize;
        let mut write_error: Option<Error> = None;
        let timeout = tokio::time::sleep(self.write_timeout);
        tokio::pin!(timeout);
        for _ in 0..shard.owners.len() {
            tokio::select! {
                _ = closing.wait_for(|closed| *closed) => {
                    return Err(Error::WriteFailed);
                }
                _ = &mut timeout => {
                    WriteStatistics::add(&self.stats.write_timeout, 1);
                    return Err(Error::Timeout);
                }
                result = rx.recv() => {
                    let Some(result) = result else { break };
                    match result.err {
                        Some(err) => {
                            WriteStatistics::add(&self.stats.write_err, 1);
                            error!(
                                node_id = result.owner.node_id,
                                shard_id = shard.id,
                                error = %err,
                                "write failed"
                            );

                            // The queue-not-empty suppression sentinel is
                            // neither a success nor a reportable failure.
                            if matches!(err, Error::QueueBlocked) {
                                continue;
                            }

                            // Keep the first error to hand back to the client.
                            if write_error.is_none() {
                                write_error = Some(err);
                            }
                        }
                        None => {
                            wrote += 1;
                            // Consistency met; stragglers are fire-and-forget.
                            if wrote >= required {
                                WriteStatistics::add(&self.stats.write_ok, 1);
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }

        if wrote > 0 {
            WriteStatistics::add(&self.stats.write_partial, 1);
            return Err(Error::PartialWrite);
        }

        match write_error {
            // A typed partial-write keeps its dropped count intact.
            Some(e @ Error::PartialWriteDropped { .. }) => Err(e),
            Some(e) => Err(Error::WriteFailedCause(e.to_string())),
            None => Err(Error::WriteFailed),
        }
    }

    /// Routes one owner's share of a shard write: local store, handoff
    /// suppression, or direct remote with handoff fallback.
    async fn write_to_owner(
        &self,
        ctx: &ShardWriteContext,
        shard_id: u64,
        owner: ShardOwner,
        database: &str,
        retention_policy: &str,
        consistency: ConsistencyLevel,
        points: &[Point],
    ) -> Result<()> {
        let n = points.len() as i64;

        if self.meta_client.node_id() == owner.node_id {
            WriteStatistics::add(&self.stats.point_write_req_local, n);
            let mut result = self
                .tsdb_store
                .write_to_shard_with_context(ctx, shard_id, points)
                .await;
            if matches!(result, Err(Error::ShardNotFound(_))) {
                // The shard should exist on this node but the store hasn't
                // created it yet; create it and retry the write once.
                self.tsdb_store
                    .create_shard(database, retention_policy, shard_id, true)
                    .await?;
                result = self
                    .tsdb_store
                    .write_to_shard_with_context(ctx, shard_id, points)
                    .await;
            }
            if matches!(result, Err(Error::ShardDeletion)) {
                result = Err(Error::PartialWriteDropped {
                    reason: format!("shard {shard_id} is pending deletion"),
                    dropped: points.len(),
                });
            }
            return result;
        }

        if !self.allow_out_of_order_writes && !self.hinted_handoff.empty(shard_id, owner.node_id) {
            // Queued points must reach the owner before newer ones, so the
            // direct write is suppressed and this batch joins the queue.
            WriteStatistics::add(&self.stats.point_write_req_hh, n);
            return match self
                .hinted_handoff
                .write_shard(shard_id, owner.node_id, points)
                .await
            {
                Ok(()) => Err(Error::HintedHandoffQueueNotEmpty),
                Err(hherr) => {
                    error!(
                        node_id = owner.node_id,
                        shard_id,
                        error = %hherr,
                        "write shard failed with hinted handoff"
                    );
                    Err(hherr)
                }
            };
        }

        WriteStatistics::add(&self.stats.point_write_req_remote, n);
        match self
            .shard_writer
            .write_shard(shard_id, owner.node_id, points)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) if self.hinted_handoff.is_retryable(&err) => {
                // The remote write failed, so queue it via hinted handoff.
                WriteStatistics::add(&self.stats.point_write_req_hh, n);
                match self
                    .hinted_handoff
                    .write_shard(shard_id, owner.node_id, points)
                    .await
                {
                    Err(hherr) => {
                        error!(
                            node_id = owner.node_id,
                            shard_id,
                            error = %err,
                            "write shard failed with both shard writer and hinted handoff"
                        );
                        Err(hherr)
                    }
                    Ok(()) if consistency == ConsistencyLevel::Any => {
                        // Under consistency ANY a successful enqueue counts
                        // as a successful write.
                        warn!(
                            node_id = owner.node_id,
                            shard_id,
                            error = %err,
                            "write shard failed, hinted handoff succeeded under consistency any"
                        );
                        Ok(())
                    }
                    Ok(()) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }
}
