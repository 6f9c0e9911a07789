//! Quality-of-service records: limits, live usage, precedence.
//!
//! A QoS is a named bundle of limits independent of the account tree. Jobs
//! and partitions may each reference one; the precedence resolver orders the
//! two into a primary/secondary pair that every check walks first-to-last
//! with first-claim semantics (the first QoS supplying a finite value for a
//! slot owns that slot).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{QosId, UserId};

/// QoS behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QosFlags {
    /// This QoS overrides the partition QoS when attached to a job.
    pub part_qos: bool,
    /// Violations reject at submission instead of holding the job.
    pub deny_limit: bool,
}

/// Declarative QoS limits; `None` disables a slot.
///
/// Also used as the first-claim accumulator during checks: slots start
/// `None` (unclaimed) and the first QoS to supply a finite value writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QosLimits {
    // Group totals across every job in the QoS.
    pub grp_cpu_mins: Option<u64>,
    pub grp_cpu_run_mins: Option<u64>,
    pub grp_cpus: Option<u32>,
    pub grp_jobs: Option<u32>,
    pub grp_mem: Option<u64>,
    pub grp_nodes: Option<u32>,
    pub grp_submit_jobs: Option<u32>,
    /// Group wall-clock cap in minutes.
    pub grp_wall: Option<u32>,

    // Per-job caps.
    pub max_cpu_mins_pj: Option<u64>,
    pub max_cpus_pj: Option<u32>,
    pub min_cpus_pj: Option<u32>,
    pub max_nodes_pj: Option<u32>,
    /// Per-job wall-clock cap in minutes.
    pub max_wall_pj: Option<u32>,

    // Per-user caps.
    pub max_cpus_pu: Option<u32>,
    pub max_jobs_pu: Option<u32>,
    pub max_nodes_pu: Option<u32>,
    pub max_submit_jobs_pu: Option<u32>,
}

/// Live per-user usage inside one QoS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UserUsage {
    pub jobs: u32,
    pub submit_jobs: u32,
    pub cpus: u32,
    pub nodes: u32,
}

impl UserUsage {
    pub fn is_empty(&self) -> bool {
        self.jobs == 0 && self.submit_jobs == 0 && self.cpus == 0 && self.nodes == 0
    }
}

/// Live usage counters for one QoS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QosUsage {
    pub grp_used_jobs: u32,
    pub grp_used_submit_jobs: u32,
    pub grp_used_cpus: u32,
    pub grp_used_mem: u64,
    pub grp_used_nodes: u32,
    /// Wall-clock seconds consumed across the QoS (fed by the rollup).
    pub grp_used_wall: f64,
    /// CPU-seconds committed by running jobs (cpus × time limit).
    pub grp_used_cpu_run_secs: u64,
    /// CPU-seconds consumed across history (fed by the rollup).
    pub usage_raw: f64,
    /// Per-user sub-accounting, created on first use.
    pub user_usage: HashMap<UserId, UserUsage>,
}

impl QosUsage {
    /// Per-user entry, created on first use.
    pub fn user_entry(&mut self, user_id: UserId) -> &mut UserUsage {
        self.user_usage.entry(user_id).or_default()
    }

    pub fn user(&self, user_id: UserId) -> Option<&UserUsage> {
        self.user_usage.get(&user_id)
    }

    /// Drop per-user entries with no live submissions left.
    pub(crate) fn prune_user(&mut self, user_id: UserId) {
        if self.user_usage.get(&user_id).is_some_and(|u| u.is_empty()) {
            self.user_usage.remove(&user_id);
        }
    }
}

/// A named QoS with its limits and live usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QosRecord {
    pub id: QosId,
    pub name: String,
    pub flags: QosFlags,
    pub limits: QosLimits,
    pub usage: QosUsage,
}

impl QosRecord {
    pub fn new(id: QosId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            flags: QosFlags::default(),
            limits: QosLimits::default(),
            usage: QosUsage::default(),
        }
    }
}

/// Registry of QoS records.
#[derive(Debug, Default)]
pub struct QosTable {
    records: HashMap<QosId, QosRecord>,
}

impl QosTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: QosRecord) {
        self.records.insert(record.id, record);
    }

    pub fn get(&self, id: QosId) -> Option<&QosRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: QosId) -> Option<&mut QosRecord> {
        self.records.get_mut(&id)
    }

    /// Order the job and partition QoS into a `(primary, secondary)` pair.
    ///
    /// The partition QoS governs unless the job's QoS carries the
    /// partition-override flag. A pair that collapses to the same record
    /// drops the secondary.
    pub fn resolve_pair(
        &self,
        job_qos: Option<QosId>,
        part_qos: Option<QosId>,
    ) -> (Option<QosId>, Option<QosId>) {
        match (job_qos, part_qos) {
            (None, None) => (None, None),
            (None, Some(p)) => (Some(p), None),
            (Some(j), None) => (Some(j), None),
            (Some(j), Some(p)) => {
                let job_overrides = self.get(j).is_some_and(|q| q.flags.part_qos);
                let (first, second) = if job_overrides { (j, p) } else { (p, j) };
                if first == second {
                    (Some(first), None)
                } else {
                    (Some(first), Some(second))
                }
            }
        }
    }
}

/// `min` over optional caps, treating `None` as unlimited.
pub(crate) fn opt_min<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

/// `a < b` over optional caps, treating `None` as unlimited.
pub(crate) fn opt_lt<T: Ord>(a: Option<T>, b: Option<T>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a < b,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(flags: QosFlags) -> (QosTable, QosId, QosId) {
        let mut table = QosTable::new();
        let job_qos = QosId::new(1);
        let part_qos = QosId::new(2);
        let mut rec = QosRecord::new(job_qos, "job-qos");
        rec.flags = flags;
        table.insert(rec);
        table.insert(QosRecord::new(part_qos, "part-qos"));
        (table, job_qos, part_qos)
    }

    #[test]
    fn test_resolve_pair_none() {
        let table = QosTable::new();
        assert_eq!(table.resolve_pair(None, None), (None, None));
    }

    #[test]
    fn test_resolve_pair_single() {
        let (table, job_qos, part_qos) = table_with(QosFlags::default());
        assert_eq!(table.resolve_pair(Some(job_qos), None), (Some(job_qos), None));
        assert_eq!(table.resolve_pair(None, Some(part_qos)), (Some(part_qos), None));
    }

    #[test]
    fn test_resolve_pair_partition_governs_by_default() {
        let (table, job_qos, part_qos) = table_with(QosFlags::default());
        assert_eq!(
            table.resolve_pair(Some(job_qos), Some(part_qos)),
            (Some(part_qos), Some(job_qos))
        );
    }

    #[test]
    fn test_resolve_pair_part_qos_flag_overrides() {
        let (table, job_qos, part_qos) = table_with(QosFlags {
            part_qos: true,
            deny_limit: false,
        });
        assert_eq!(
            table.resolve_pair(Some(job_qos), Some(part_qos)),
            (Some(job_qos), Some(part_qos))
        );
    }

    #[test]
    fn test_resolve_pair_collapses_duplicate() {
        let (table, job_qos, _) = table_with(QosFlags::default());
        assert_eq!(
            table.resolve_pair(Some(job_qos), Some(job_qos)),
            (Some(job_qos), None)
        );
    }

    #[test]
    fn test_user_entry_created_on_first_use() {
        let mut usage = QosUsage::default();
        let uid = UserId::new(500);
        assert!(usage.user(uid).is_none());
        usage.user_entry(uid).submit_jobs += 1;
        assert_eq!(usage.user(uid).unwrap().submit_jobs, 1);
    }

    #[test]
    fn test_prune_user_removes_empty_entries() {
        let mut usage = QosUsage::default();
        let uid = UserId::new(500);
        usage.user_entry(uid).submit_jobs = 1;
        usage.prune_user(uid);
        assert!(usage.user(uid).is_some());

        usage.user_entry(uid).submit_jobs = 0;
        usage.prune_user(uid);
        assert!(usage.user(uid).is_none());
    }

    #[test]
    fn test_opt_helpers() {
        assert_eq!(opt_min(Some(3u32), Some(5)), Some(3));
        assert_eq!(opt_min(None, Some(5u32)), Some(5));
        assert_eq!(opt_min::<u32>(None, None), None);
        assert!(opt_lt(Some(3u32), None));
        assert!(!opt_lt::<u32>(None, Some(3)));
        assert!(opt_lt(Some(2u32), Some(3)));
    }
}
