//! Write-path statistics
//!
//! One atomic counter struct per writer; no process-wide singletons. A
//! snapshot is exposed as a named [`Statistic`] for the monitoring endpoint.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

// The keys for statistics generated by the "write" module.
const STAT_WRITE_REQ: &str = "req";
const STAT_POINT_WRITE_REQ: &str = "pointReq";
const STAT_POINT_WRITE_REQ_LOCAL: &str = "pointReqLocal";
const STAT_POINT_WRITE_REQ_REMOTE: &str = "pointReqRemote";
const STAT_POINT_WRITE_REQ_HH: &str = "pointReqHH";
const STAT_WRITE_OK: &str = "writeOk";
const STAT_WRITE_PARTIAL: &str = "writePartial";
const STAT_WRITE_DROP: &str = "writeDrop";
const STAT_WRITE_TIMEOUT: &str = "writeTimeout";
const STAT_WRITE_ERR: &str = "writeError";
const STAT_SUB_WRITE_OK: &str = "subWriteOk";
const STAT_SUB_WRITE_DROP: &str = "subWriteDrop";

/// A named group of counter values for periodic monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statistic {
    pub name: String,
    pub tags: BTreeMap<String, String>,
    pub values: BTreeMap<String, i64>,
}

/// Counters kept by the points writer.
#[derive(Debug, Default)]
pub struct WriteStatistics {
    pub(crate) write_req: AtomicI64,
    pub(crate) point_write_req: AtomicI64,
    pub(crate) point_write_req_local: AtomicI64,
    pub(crate) point_write_req_remote: AtomicI64,
    pub(crate) point_write_req_hh: AtomicI64,
    pub(crate) write_ok: AtomicI64,
    pub(crate) write_partial: AtomicI64,
    pub(crate) write_dropped: AtomicI64,
    pub(crate) write_timeout: AtomicI64,
    pub(crate) write_err: AtomicI64,
    pub(crate) sub_write_ok: AtomicI64,
    pub(crate) sub_write_drop: AtomicI64,
}

impl WriteStatistics {
    pub(crate) fn add(counter: &AtomicI64, delta: i64) {
        counter.fetch_add(delta, Ordering::Relaxed);
    }

    /// Snapshot of every counter under the "write" statistic name.
    pub fn statistic(&self, tags: BTreeMap<String, String>) -> Statistic {
        let load = |c: &AtomicI64| c.load(Ordering::Relaxed);
        let mut values = BTreeMap::new();
        values.insert(STAT_WRITE_REQ.to_string(), load(&self.write_req));
        values.insert(STAT_POINT_WRITE_REQ.to_string(), load(&self.point_write_req));
        values.insert(
            STAT_POINT_WRITE_REQ_LOCAL.to_string(),
            load(&self.point_write_req_local),
        );
        values.insert(
            STAT_POINT_WRITE_REQ_REMOTE.to_string(),
            load(&self.point_write_req_remote),
        );
        values.insert(
            STAT_POINT_WRITE_REQ_HH.to_string(),
            load(&self.point_write_req_hh),
        );
        values.insert(STAT_WRITE_OK.to_string(), load(&self.write_ok));
        values.insert(STAT_WRITE_PARTIAL.to_string(), load(&self.write_partial));
        values.insert(STAT_WRITE_DROP.to_string(), load(&self.write_dropped));
        values.insert(STAT_WRITE_TIMEOUT.to_string(), load(&self.write_timeout));
        values.insert(STAT_WRITE_ERR.to_string(), load(&self.write_err));
        values.insert(STAT_SUB_WRITE_OK.to_string(), load(&self.sub_write_ok));
        values.insert(STAT_SUB_WRITE_DROP.to_string(), load(&self.sub_write_drop));

        Statistic {
            name: "write".to_string(),
            tags,
            values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistic_snapshot_carries_all_keys() {
        let stats = WriteStatistics::default();
        WriteStatistics::add(&stats.write_req, 2);
        WriteStatistics::add(&stats.point_write_req, 10);
        WriteStatistics::add(&stats.sub_write_drop, 1);

        let stat = stats.statistic(BTreeMap::new());
        assert_eq!(stat.name, "write");
        assert_eq!(stat.values.len(), 12);
        assert_eq!(stat.values["req"], 2);
        assert_eq!(stat.values["pointReq"], 10);
        assert_eq!(stat.values["subWriteDrop"], 1);
        assert_eq!(stat.values["writeOk"], 0);
    }
}
