//! Association records: the account hierarchy and its limits.
//!
//! Associations form a tree rooted at a distinguished root record; leaf
//! associations bind a user to an account (and optionally a partition).
//! Limits walk from leaf to root, with per-job caps pre-propagated down the
//! tree into controller-effective (`ctld`) projections so that ancestors only
//! ever enforce group caps.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tres::TresCounts;
use crate::types::{AssocId, Error, Result, UserId};

/// Declarative association limits; `None` disables a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AssocLimits {
    // Resource-indexed group and per-job vectors.
    pub grp_tres: TresCounts,
    pub grp_tres_mins: TresCounts,
    pub grp_tres_run_mins: TresCounts,
    pub max_tres_pj: TresCounts,
    pub max_tres_mins_pj: TresCounts,

    // Scalar group caps.
    pub grp_jobs: Option<u32>,
    pub grp_mem: Option<u64>,
    pub grp_nodes: Option<u32>,
    pub grp_submit_jobs: Option<u32>,
    /// Group wall-clock cap in minutes.
    pub grp_wall: Option<u32>,

    // Scalar per-job / per-association caps (leaf-enforced).
    pub max_jobs: Option<u32>,
    pub max_nodes_pj: Option<u32>,
    pub max_submit_jobs: Option<u32>,
    /// Per-job wall-clock cap in minutes.
    pub max_wall_pj: Option<u32>,
}

/// Live usage counters for one association.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct AssocUsage {
    pub used_jobs: u32,
    pub used_submit_jobs: u32,
    pub grp_used_cpus: u32,
    pub grp_used_mem: u64,
    pub grp_used_nodes: u32,
    /// Wall-clock seconds consumed across the association (fed by the rollup).
    pub grp_used_wall: f64,
    /// CPU-seconds committed by running jobs (cpus × time limit).
    pub grp_used_cpu_run_secs: u64,
    /// CPU-seconds consumed across history (fed by the rollup).
    pub usage_raw: f64,
}

/// A node in the account hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssocRecord {
    pub id: AssocId,
    pub acct: String,
    /// Partition this leaf is scoped to, if any.
    pub partition: Option<String>,
    /// Owning user for leaf-user associations.
    pub user: Option<UserId>,
    pub parent: Option<AssocId>,
    pub limits: AssocLimits,
    /// Controller-effective limits, recomputed after tree propagation.
    pub ctld: AssocLimits,
    pub usage: AssocUsage,
}

impl AssocRecord {
    pub fn new(id: AssocId, acct: impl Into<String>, parent: Option<AssocId>) -> Self {
        Self {
            id,
            acct: acct.into(),
            partition: None,
            user: None,
            parent,
            limits: AssocLimits::default(),
            ctld: AssocLimits::default(),
            usage: AssocUsage::default(),
        }
    }
}

type LeafKey = (String, Option<String>, UserId);

/// Registry of associations: the tree, plus a leaf index for re-binding by
/// `(account, partition, user)`.
#[derive(Debug)]
pub struct AssocTable {
    records: HashMap<AssocId, AssocRecord>,
    root: AssocId,
    leaf_index: HashMap<LeafKey, AssocId>,
}

impl AssocTable {
    /// Root association id used by `new()`.
    pub const ROOT: AssocId = AssocId::new(1);

    /// Create a table holding only the root association.
    pub fn new() -> Self {
        let root = AssocRecord::new(Self::ROOT, "root", None);
        let mut records = HashMap::new();
        records.insert(Self::ROOT, root);
        Self {
            records,
            root: Self::ROOT,
            leaf_index: HashMap::new(),
        }
    }

    pub fn root(&self) -> AssocId {
        self.root
    }

    pub fn get(&self, id: AssocId) -> Option<&AssocRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: AssocId) -> Option<&mut AssocRecord> {
        self.records.get_mut(&id)
    }

    /// Insert a record under an existing parent and recompute the
    /// controller-effective projections.
    pub fn insert(&mut self, record: AssocRecord) -> Result<()> {
        let parent = record
            .parent
            .ok_or_else(|| Error::validation(format!("assoc {} has no parent", record.id)))?;
        if !self.records.contains_key(&parent) {
            return Err(Error::not_found(format!(
                "parent assoc {} for assoc {}",
                parent, record.id
            )));
        }
        if self.records.contains_key(&record.id) {
            return Err(Error::validation(format!("duplicate assoc id {}", record.id)));
        }
        if let Some(user) = record.user {
            self.leaf_index.insert(
                (record.acct.clone(), record.partition.clone(), user),
                record.id,
            );
        }
        self.records.insert(record.id, record);
        self.propagate();
        Ok(())
    }

    /// Replace an association's limits and recompute projections.
    pub fn update_limits(&mut self, id: AssocId, limits: AssocLimits) -> Result<()> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::not_found(format!("assoc {}", id)))?;
        record.limits = limits;
        self.propagate();
        Ok(())
    }

    /// Find the leaf association for `(account, partition, user)`, falling
    /// back to the partition-independent leaf.
    pub fn find_leaf(
        &self,
        acct: &str,
        partition: Option<&str>,
        user: UserId,
    ) -> Option<AssocId> {
        if let Some(part) = partition {
            let key = (acct.to_string(), Some(part.to_string()), user);
            if let Some(id) = self.leaf_index.get(&key) {
                return Some(*id);
            }
        }
        self.leaf_index.get(&(acct.to_string(), None, user)).copied()
    }

    /// Recompute `ctld` projections for the whole tree.
    ///
    /// Per-job caps inherit the parent's controller-effective value when
    /// unset; group caps never inherit (each level enforces its own). The
    /// root's per-job caps stay disabled: only group limits apply there.
    fn propagate(&mut self) {
        let mut order = vec![self.root];
        let mut i = 0;
        while i < order.len() {
            let parent_id = order[i];
            i += 1;
            let children: Vec<AssocId> = self
                .records
                .values()
                .filter(|r| r.parent == Some(parent_id))
                .map(|r| r.id)
                .collect();
            order.extend(children);
        }

        for id in order {
            let parent_ctld = self
                .records
                .get(&id)
                .and_then(|r| r.parent)
                .and_then(|p| self.records.get(&p))
                .map(|p| p.ctld);
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            let mut ctld = record.limits;
            if id == self.root {
                ctld.max_tres_pj = TresCounts::new();
                ctld.max_tres_mins_pj = TresCounts::new();
                ctld.max_jobs = None;
                ctld.max_nodes_pj = None;
                ctld.max_submit_jobs = None;
                ctld.max_wall_pj = None;
            } else if let Some(parent) = parent_ctld {
                for tres in crate::tres::TresId::ALL {
                    if ctld.max_tres_pj.get(tres).is_none() {
                        ctld.max_tres_pj.set(tres, parent.max_tres_pj.get(tres));
                    }
                    if ctld.max_tres_mins_pj.get(tres).is_none() {
                        ctld.max_tres_mins_pj
                            .set(tres, parent.max_tres_mins_pj.get(tres));
                    }
                }
                ctld.max_jobs = ctld.max_jobs.or(parent.max_jobs);
                ctld.max_nodes_pj = ctld.max_nodes_pj.or(parent.max_nodes_pj);
                ctld.max_submit_jobs = ctld.max_submit_jobs.or(parent.max_submit_jobs);
                ctld.max_wall_pj = ctld.max_wall_pj.or(parent.max_wall_pj);
            }
            record.ctld = ctld;
        }
    }
}

impl Default for AssocTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate a job's association reference, re-binding it from the leaf index
/// when stale. Returns false when no usable association exists.
pub(crate) fn valid_job_assoc(
    table: &AssocTable,
    job: &mut crate::policy::JobRecord,
) -> bool {
    let bound = job.assoc_id.and_then(|id| table.get(id));
    let stale = match bound {
        Some(rec) => rec.user != Some(job.user_id),
        None => true,
    };
    if !stale {
        return true;
    }

    debug!("invalid assoc reference for job {}", job.id);
    let partition = job.partition.as_ref().map(|p| p.name.as_str());
    match table.find_leaf(&job.account, partition, job.user_id) {
        Some(id) => {
            job.assoc_id = Some(id);
            true
        }
        None => {
            debug!(
                "invalid account or partition for uid={} job={}",
                job.user_id, job.id
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tres::TresId;

    fn dept_tree() -> (AssocTable, AssocId, AssocId) {
        let mut table = AssocTable::new();
        let dept = AssocId::new(10);
        let leaf = AssocId::new(11);
        let mut dept_rec = AssocRecord::new(dept, "dept", Some(AssocTable::ROOT));
        dept_rec.limits.max_nodes_pj = Some(16);
        dept_rec.limits.grp_jobs = Some(4);
        table.insert(dept_rec).unwrap();
        let mut leaf_rec = AssocRecord::new(leaf, "dept", Some(dept));
        leaf_rec.user = Some(UserId::new(100));
        table.insert(leaf_rec).unwrap();
        (table, dept, leaf)
    }

    #[test]
    fn test_insert_requires_parent() {
        let mut table = AssocTable::new();
        let orphan = AssocRecord::new(AssocId::new(5), "acct", None);
        assert!(table.insert(orphan).is_err());

        let dangling = AssocRecord::new(AssocId::new(5), "acct", Some(AssocId::new(99)));
        assert!(table.insert(dangling).is_err());
    }

    #[test]
    fn test_per_job_limits_propagate_to_children() {
        let (table, dept, leaf) = dept_tree();
        // Child inherits the parent's per-job cap.
        assert_eq!(table.get(leaf).unwrap().ctld.max_nodes_pj, Some(16));
        // Group caps never inherit.
        assert_eq!(table.get(dept).unwrap().ctld.grp_jobs, Some(4));
        assert_eq!(table.get(leaf).unwrap().ctld.grp_jobs, None);
    }

    #[test]
    fn test_child_override_beats_inheritance() {
        let (mut table, dept, leaf) = dept_tree();
        let mut limits = table.get(leaf).unwrap().limits;
        limits.max_nodes_pj = Some(2);
        table.update_limits(leaf, limits).unwrap();
        assert_eq!(table.get(leaf).unwrap().ctld.max_nodes_pj, Some(2));
        assert_eq!(table.get(dept).unwrap().ctld.max_nodes_pj, Some(16));
    }

    #[test]
    fn test_root_per_job_limits_disabled() {
        let mut table = AssocTable::new();
        let mut limits = AssocLimits::default();
        limits.max_nodes_pj = Some(4);
        limits.max_tres_pj = TresCounts::new().with(TresId::Cpu, 8);
        limits.grp_jobs = Some(10);
        table.update_limits(AssocTable::ROOT, limits).unwrap();

        let root = table.get(AssocTable::ROOT).unwrap();
        assert_eq!(root.ctld.max_nodes_pj, None);
        assert_eq!(root.ctld.max_tres_pj.get(TresId::Cpu), None);
        assert_eq!(root.ctld.grp_jobs, Some(10));
    }

    #[test]
    fn test_find_leaf_partition_fallback() {
        let mut table = AssocTable::new();
        let leaf = AssocId::new(20);
        let mut rec = AssocRecord::new(leaf, "acct", Some(AssocTable::ROOT));
        rec.user = Some(UserId::new(7));
        table.insert(rec).unwrap();

        assert_eq!(
            table.find_leaf("acct", Some("batch"), UserId::new(7)),
            Some(leaf)
        );
        assert_eq!(table.find_leaf("acct", None, UserId::new(7)), Some(leaf));
        assert_eq!(table.find_leaf("acct", None, UserId::new(8)), None);
    }

    #[test]
    fn test_valid_job_assoc_rebinds() {
        use crate::policy::JobRecord;
        use crate::types::JobId;

        let (table, _dept, leaf) = dept_tree();
        let mut job = JobRecord::new(JobId::new(1), UserId::new(100), "dept");
        assert!(valid_job_assoc(&table, &mut job));
        assert_eq!(job.assoc_id, Some(leaf));

        // Unknown user cannot bind.
        let mut stranger = JobRecord::new(JobId::new(2), UserId::new(999), "dept");
        assert!(!valid_job_assoc(&table, &mut stranger));
        assert!(stranger.assoc_id.is_none());
    }
}
