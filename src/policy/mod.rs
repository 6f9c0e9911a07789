//! The accounting-policy enforcement engine.
//!
//! [`PolicyEngine`] owns the shared tables (associations, QoS, users, TRES)
//! behind a four-slot reader/writer lock bundle and exposes the job
//! lifecycle operations: submit/finish bookkeeping, admission validation,
//! runnability checks, timeout evaluation, and the max-nodes query.
//!
//! Subsystems are plain modules called with the engine handle; all mutable
//! state lives in the tables. Job records are owned by the caller and passed
//! in by reference.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use tracing::debug;

// Subsystem modules
pub mod assoc;
pub mod max_nodes;
pub mod qos;
pub mod runnable;
pub mod timeout;
pub mod types;
pub mod usage;
pub mod validate;

// Re-export key types
pub use assoc::{AssocLimits, AssocRecord, AssocTable, AssocUsage};
pub use max_nodes::MaxNodes;
pub use qos::{QosFlags, QosLimits, QosRecord, QosUsage, UserUsage};
pub use types::{
    JobDesc, JobDetails, JobRecord, JobState, LimitSet, LimitSetLevel, MemoryRequest, Partition,
    StateReason,
};

use crate::hooks::{AccountingStorage, NoopAccountingStorage, NoopPriorityHook, PriorityHook};
use crate::tres::{TresCounts, TresDictionary, TresId};
use crate::types::{AssocId, EnforceConfig, QosId, Result, UserId};
use usage::AdjustKind;

/// User names, read for diagnostics during validation.
#[derive(Debug, Default)]
pub struct UserTable {
    names: HashMap<UserId, String>,
}

impl UserTable {
    pub fn insert(&mut self, id: UserId, name: impl Into<String>) {
        self.names.insert(id, name.into());
    }

    pub fn name_of(&self, id: UserId) -> String {
        self.names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("uid.{}", id))
    }
}

/// The policy engine handle.
///
/// The four sub-locks are always acquired in declaration order (assocs,
/// qos, users, tres), which gives a total order and keeps bundles
/// deadlock-free. External reference updates (registry methods) take the
/// same locks in WRITE mode, so readers observe whole-table states only.
pub struct PolicyEngine {
    pub(crate) config: EnforceConfig,

    pub(crate) assocs: RwLock<AssocTable>,
    pub(crate) qos: RwLock<qos::QosTable>,
    pub(crate) users: RwLock<UserTable>,
    pub(crate) tres: RwLock<TresDictionary>,

    pub(crate) priority: Box<dyn PriorityHook>,
    pub(crate) storage: Box<dyn AccountingStorage>,

    /// Unix timestamp of the last observable job-field mutation.
    last_job_update: AtomicI64,
}

impl fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("config", &self.config)
            .field("last_job_update", &self.last_job_update)
            .finish_non_exhaustive()
    }
}

impl PolicyEngine {
    pub fn new(config: EnforceConfig) -> Self {
        Self {
            config,
            assocs: RwLock::new(AssocTable::new()),
            qos: RwLock::new(qos::QosTable::new()),
            users: RwLock::new(UserTable::default()),
            tres: RwLock::new(TresDictionary::default()),
            priority: Box::new(NoopPriorityHook),
            storage: Box::new(NoopAccountingStorage),
            last_job_update: AtomicI64::new(0),
        }
    }

    /// Attach a priority subsystem hook.
    pub fn with_priority_hook(mut self, hook: Box<dyn PriorityHook>) -> Self {
        self.priority = hook;
        self
    }

    /// Attach an accounting-storage hook.
    pub fn with_storage_hook(mut self, hook: Box<dyn AccountingStorage>) -> Self {
        self.storage = hook;
        self
    }

    pub fn config(&self) -> EnforceConfig {
        self.config
    }

    // =========================================================================
    // Registry management (external reference updates, WRITE bundle)
    // =========================================================================

    pub fn add_user(&self, id: UserId, name: impl Into<String>) {
        self.users.write().insert(id, name);
    }

    pub fn add_qos(&self, record: QosRecord) {
        self.qos.write().insert(record);
    }

    pub fn add_association(&self, record: AssocRecord) -> Result<()> {
        self.assocs.write().insert(record)
    }

    pub fn root_assoc(&self) -> AssocId {
        self.assocs.read().root()
    }

    pub fn update_qos_limits(&self, id: QosId, limits: QosLimits) -> Result<()> {
        let mut table = self.qos.write();
        let record = table
            .get_mut(id)
            .ok_or_else(|| crate::types::Error::not_found(format!("qos {}", id)))?;
        record.limits = limits;
        Ok(())
    }

    pub fn update_assoc_limits(&self, id: AssocId, limits: AssocLimits) -> Result<()> {
        self.assocs.write().update_limits(id, limits)
    }

    /// Register a numeric TRES id used by the string-encoded vectors.
    pub fn register_tres(&self, numeric: u32, id: TresId) {
        self.tres.write().register(numeric, id);
    }

    /// Parse a string-encoded resource vector (`"1=200,2=50"`) against the
    /// registered TRES dictionary.
    pub fn parse_tres_counts(&self, encoded: &str) -> Result<TresCounts> {
        let dict = self.tres.read();
        TresCounts::parse(encoded, &dict)
    }

    /// Historical-usage feed for a QoS (accounting rollup collaborator):
    /// CPU-seconds consumed across history and group wall-clock seconds.
    pub fn set_qos_historical(
        &self,
        id: QosId,
        usage_raw_secs: f64,
        wall_secs: f64,
    ) -> Result<()> {
        let mut table = self.qos.write();
        let record = table
            .get_mut(id)
            .ok_or_else(|| crate::types::Error::not_found(format!("qos {}", id)))?;
        record.usage.usage_raw = usage_raw_secs;
        record.usage.grp_used_wall = wall_secs;
        Ok(())
    }

    /// Historical-usage feed for an association (accounting rollup
    /// collaborator).
    pub fn set_assoc_historical(
        &self,
        id: AssocId,
        usage_raw_secs: f64,
        wall_secs: f64,
    ) -> Result<()> {
        let mut table = self.assocs.write();
        let record = table
            .get_mut(id)
            .ok_or_else(|| crate::types::Error::not_found(format!("assoc {}", id)))?;
        record.usage.usage_raw = usage_raw_secs;
        record.usage.grp_used_wall = wall_secs;
        Ok(())
    }

    /// Snapshot of a QoS's live usage.
    pub fn qos_usage(&self, id: QosId) -> Option<QosUsage> {
        self.qos.read().get(id).map(|q| q.usage.clone())
    }

    /// Snapshot of an association's live usage.
    pub fn assoc_usage(&self, id: AssocId) -> Option<AssocUsage> {
        self.assocs.read().get(id).map(|a| a.usage)
    }

    /// Unix timestamp of the last observable job-field mutation by the core.
    pub fn last_job_update(&self) -> i64 {
        self.last_job_update.load(Ordering::Relaxed)
    }

    pub(crate) fn touch_last_job_update(&self) {
        self.last_job_update
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    // =========================================================================
    // Job lifecycle operations
    // =========================================================================

    /// Note that a job has been submitted: submit counters increment on the
    /// QoS pair and on every association up the tree.
    pub fn add_job_submit(&self, job: &mut JobRecord) {
        usage::adjust_limit_usage(self, AdjustKind::AddSubmit, job);
    }

    /// Note that a submitted job has left the system without running (or
    /// after finishing): the submit counters decrement again.
    pub fn remove_job_submit(&self, job: &mut JobRecord) {
        usage::adjust_limit_usage(self, AdjustKind::RemSubmit, job);
    }

    /// Note that a job is starting: running counters increment from the
    /// job's resolved allocation, and the expected end time is stamped so a
    /// later finish subtracts exactly once.
    pub fn job_begin(&self, job: &mut JobRecord) {
        usage::adjust_limit_usage(self, AdjustKind::Begin, job);
        let start = job.start_time.unwrap_or_else(Utc::now);
        let minutes = i64::from(job.time_limit.unwrap_or(0));
        job.end_time_exp = Some(start + Duration::minutes(minutes));
    }

    /// Note that a job is completing: every delta added at begin is
    /// subtracted, from the job's own snapshot. Repeated calls are no-ops.
    pub fn job_fini(&self, job: &mut JobRecord) {
        if job.end_time_exp.is_some() {
            usage::adjust_limit_usage(self, AdjustKind::Fini, job);
            job.end_time_exp = None;
        } else {
            debug!("finish bookkeeping already ran for job {}", job.id);
        }
    }

    /// Rewrite a running job's cpu-run-minutes contribution for a new time
    /// limit. Limits are not re-validated; the timeout path is the safety
    /// net.
    pub fn alter_job(&self, job: &mut JobRecord, new_time_limit: u32) {
        usage::alter_job(self, job, new_time_limit);
    }

    /// Validate a job request against the QoS pair and association chain.
    ///
    /// On success the request may come back with a derived `time_limit`
    /// (with `limit_set.time` marked policy-set). On failure the reason
    /// slot, when given, names the violated limit. Passing a reason slot
    /// also turns on synchronous enforcement, as does a deny-on-limit QoS.
    #[allow(clippy::too_many_arguments)]
    pub fn validate(
        &self,
        desc: &mut JobDesc,
        part: &Partition,
        assoc_id: AssocId,
        qos_id: Option<QosId>,
        reason: Option<&mut StateReason>,
        limit_set: &mut LimitSet,
        update_call: bool,
    ) -> bool {
        validate::validate(
            self, desc, part, assoc_id, qos_id, reason, limit_set, update_call,
        )
    }

    /// Whether the job's current state reason leaves it runnable (not parked
    /// on an accounting limit). Does not re-validate job state.
    pub fn job_runnable_state(&self, job: &JobRecord) -> bool {
        runnable::job_runnable_state(job)
    }

    /// Configuration-only runnability check for a pending job, before node
    /// selection. Returns false to hold the job, writing its state reason.
    pub fn job_runnable_pre_select(&self, job: &mut JobRecord) -> bool {
        runnable::job_runnable_pre_select(self, job)
    }

    /// Runnability check after node selection, against the chosen node and
    /// CPU counts. Returns false to hold the job, writing its state reason.
    pub fn job_runnable_post_select(
        &self,
        job: &mut JobRecord,
        node_cnt: u32,
        cpu_cnt: u32,
        pn_min_mem: Option<MemoryRequest>,
    ) -> bool {
        runnable::job_runnable_post_select(self, job, node_cnt, cpu_cnt, pn_min_mem)
    }

    /// Whether a running job has exhausted a time-based limit. The caller is
    /// responsible for actually killing the job.
    pub fn job_time_out(&self, job: &mut JobRecord) -> bool {
        timeout::job_time_out(self, job)
    }

    /// Tightest node-count cap applicable to the job, with the limit that
    /// produced it.
    pub fn max_nodes(&self, job: &JobRecord) -> MaxNodes {
        max_nodes::max_nodes(self, job)
    }

    /// Re-check a pending job's limits after a QoS or association update,
    /// refreshing the derived time limit.
    pub fn update_pending_job(&self, job: &mut JobRecord) -> Result<()> {
        validate::update_pending_job(self, job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobId;

    fn engine_with_tree() -> (PolicyEngine, QosId, AssocId) {
        let engine = PolicyEngine::new(EnforceConfig::limits());
        let qos_id = QosId::new(1);
        engine.add_qos(QosRecord::new(qos_id, "normal"));

        let dept = AssocId::new(10);
        let leaf = AssocId::new(11);
        let root = engine.root_assoc();
        engine
            .add_association(AssocRecord::new(dept, "dept", Some(root)))
            .unwrap();
        let mut leaf_rec = AssocRecord::new(leaf, "dept", Some(dept));
        leaf_rec.user = Some(UserId::new(100));
        engine.add_association(leaf_rec).unwrap();
        engine.add_user(UserId::new(100), "alice");

        (engine, qos_id, leaf)
    }

    fn test_job(qos_id: QosId) -> JobRecord {
        let mut job = JobRecord::new(JobId::new(1), UserId::new(100), "dept");
        job.qos = Some(qos_id);
        job.details = Some(JobDetails {
            min_cpus: Some(4),
            min_nodes: Some(1),
            max_nodes: None,
            pn_min_mem: Some(MemoryRequest::PerNode(1024)),
        });
        job.time_limit = Some(30);
        job.total_cpus = 4;
        job.node_cnt = 1;
        job
    }

    #[test]
    fn test_submit_begin_fini_symmetry() {
        let (engine, qos_id, leaf) = engine_with_tree();
        let root = engine.root_assoc();
        let mut job = test_job(qos_id);

        engine.add_job_submit(&mut job);
        engine.job_begin(&mut job);

        let usage = engine.qos_usage(qos_id).unwrap();
        assert_eq!(usage.grp_used_submit_jobs, 1);
        assert_eq!(usage.grp_used_jobs, 1);
        assert_eq!(usage.grp_used_cpus, 4);
        assert_eq!(usage.grp_used_mem, 1024);
        assert_eq!(usage.grp_used_cpu_run_secs, 4 * 30 * 60);
        let user = usage.user(UserId::new(100)).unwrap();
        assert_eq!(user.jobs, 1);
        assert_eq!(user.cpus, 4);

        engine.job_fini(&mut job);
        engine.remove_job_submit(&mut job);

        let usage = engine.qos_usage(qos_id).unwrap();
        assert_eq!(usage.grp_used_submit_jobs, 0);
        assert_eq!(usage.grp_used_jobs, 0);
        assert_eq!(usage.grp_used_cpus, 0);
        assert_eq!(usage.grp_used_mem, 0);
        assert_eq!(usage.grp_used_cpu_run_secs, 0);
        assert!(usage.user(UserId::new(100)).is_none());

        for assoc in [leaf, root] {
            let usage = engine.assoc_usage(assoc).unwrap();
            assert_eq!(usage.used_submit_jobs, 0);
            assert_eq!(usage.used_jobs, 0);
            assert_eq!(usage.grp_used_cpus, 0);
            assert_eq!(usage.grp_used_cpu_run_secs, 0);
        }
    }

    #[test]
    fn test_submit_reaches_every_ancestor() {
        let (engine, qos_id, leaf) = engine_with_tree();
        let root = engine.root_assoc();
        let mut job = test_job(qos_id);

        engine.add_job_submit(&mut job);
        assert_eq!(job.assoc_id, Some(leaf));
        for assoc in [leaf, AssocId::new(10), root] {
            assert_eq!(engine.assoc_usage(assoc).unwrap().used_submit_jobs, 1);
        }

        engine.remove_job_submit(&mut job);
        for assoc in [leaf, AssocId::new(10), root] {
            assert_eq!(engine.assoc_usage(assoc).unwrap().used_submit_jobs, 0);
        }
    }

    #[test]
    fn test_decrement_saturates_with_diagnostic() {
        let (engine, qos_id, _leaf) = engine_with_tree();
        let mut job = test_job(qos_id);

        // Remove without a matching add: everything clamps at zero.
        engine.remove_job_submit(&mut job);
        let usage = engine.qos_usage(qos_id).unwrap();
        assert_eq!(usage.grp_used_submit_jobs, 0);
        assert_eq!(engine.assoc_usage(engine.root_assoc()).unwrap().used_submit_jobs, 0);
    }

    #[test]
    fn test_fini_is_idempotent() {
        let (engine, qos_id, _leaf) = engine_with_tree();
        let mut job = test_job(qos_id);

        engine.job_begin(&mut job);
        engine.job_fini(&mut job);
        engine.job_fini(&mut job);

        let usage = engine.qos_usage(qos_id).unwrap();
        assert_eq!(usage.grp_used_jobs, 0);
        assert_eq!(usage.grp_used_cpus, 0);
    }

    #[test]
    fn test_alter_rewrites_cpu_run_secs() {
        let (engine, qos_id, _leaf) = engine_with_tree();
        let mut job = test_job(qos_id);
        job.state = JobState::Running;

        engine.job_begin(&mut job);
        let before = engine.qos_usage(qos_id).unwrap().grp_used_cpu_run_secs;
        assert_eq!(before, 4 * 30 * 60);

        engine.alter_job(&mut job, 60);
        let after = engine.qos_usage(qos_id).unwrap().grp_used_cpu_run_secs;
        assert_eq!(after - before, 4 * 30 * 60);
        assert_eq!(job.time_limit, Some(60));

        // The finish subtracts the altered amount, back to zero.
        engine.job_fini(&mut job);
        assert_eq!(engine.qos_usage(qos_id).unwrap().grp_used_cpu_run_secs, 0);
    }

    #[test]
    fn test_mutations_disabled_without_limit_enforcement() {
        let engine = PolicyEngine::new(EnforceConfig::default());
        let qos_id = QosId::new(1);
        engine.add_qos(QosRecord::new(qos_id, "normal"));
        let mut job = test_job(qos_id);

        engine.add_job_submit(&mut job);
        assert_eq!(engine.qos_usage(qos_id).unwrap().grp_used_submit_jobs, 0);
    }
}
