//! Policy types: JobState, JobRecord, reason codes, limit-set markers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tres::{TresCounts, TresId, TRES_COUNT};
use crate::types::{AssocId, JobId, QosId, UserId};

/// Job lifecycle state as seen by the policy core.
///
/// The scheduler owns the full state machine; the core only needs to know
/// whether a job is pending, running, or done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Completed,
    Cancelled,
}

impl JobState {
    pub fn is_pending(self) -> bool {
        self == JobState::Pending
    }

    pub fn is_running(self) -> bool {
        self == JobState::Running
    }
}

/// Why a job is held, waiting, or failed.
///
/// The `WAIT_*` families mirror the limit namespaces: QoS limits and
/// association limits, each in group / per-job / per-user flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateReason {
    WaitNoReason,
    FailAccount,
    FailTimeout,

    // QoS limits
    WaitQosGrpCpu,
    WaitQosGrpCpuMin,
    WaitQosGrpCpuRunMin,
    WaitQosGrpJob,
    WaitQosGrpMemory,
    WaitQosGrpNodes,
    WaitQosGrpSubJob,
    WaitQosGrpWall,
    WaitQosMaxCpuMinsPerJob,
    WaitQosMaxCpusPerJob,
    WaitQosMaxCpuPerUser,
    WaitQosMaxJobPerUser,
    WaitQosMaxNodePerJob,
    WaitQosMaxNodePerUser,
    WaitQosMaxSubJob,
    WaitQosMaxWallPerJob,
    WaitQosMinCpus,
    WaitQosJobLimit,
    WaitQosTimeLimit,

    // Association limits
    WaitAssocGrpCpu,
    WaitAssocGrpCpuMin,
    WaitAssocGrpCpuRunMin,
    WaitAssocGrpJob,
    WaitAssocGrpMemory,
    WaitAssocGrpNodes,
    WaitAssocGrpSubJob,
    WaitAssocGrpWall,
    WaitAssocMaxCpuMinsPerJob,
    WaitAssocMaxCpusPerJob,
    WaitAssocMaxJobs,
    WaitAssocMaxNodePerJob,
    WaitAssocMaxSubJob,
    WaitAssocMaxWallPerJob,
    WaitAssocResourceLimit,
    WaitAssocJobLimit,
    WaitAssocTimeLimit,
}

impl Default for StateReason {
    fn default() -> Self {
        StateReason::WaitNoReason
    }
}

impl StateReason {
    /// True for reasons in the limit-wait band: a job held by an accounting
    /// limit that may clear as usage drains.
    pub fn is_limit_wait(self) -> bool {
        !matches!(
            self,
            StateReason::WaitNoReason | StateReason::FailAccount | StateReason::FailTimeout
        )
    }
}

/// Requested memory, per selected node or per allocated CPU (MB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemoryRequest {
    PerNode(u64),
    PerCpu(u64),
}

impl MemoryRequest {
    /// Total memory footprint for the given allocation shape.
    pub fn total(self, cpu_cnt: u32, node_cnt: u32) -> u64 {
        match self {
            MemoryRequest::PerCpu(mb) => mb * cpu_cnt as u64,
            MemoryRequest::PerNode(mb) => mb * node_cnt as u64,
        }
    }
}

/// Who set a limit slot on a job.
///
/// An `Admin`-pinned slot is exempt from policy validation and must never be
/// overridden by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitSetLevel {
    #[default]
    Unset,
    Policy,
    Admin,
}

impl LimitSetLevel {
    pub fn is_admin(self) -> bool {
        self == LimitSetLevel::Admin
    }

    pub fn is_unset(self) -> bool {
        self == LimitSetLevel::Unset
    }
}

/// Per-resource record of which job limits were admin- or policy-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LimitSet {
    pub time: LimitSetLevel,
    pub max_nodes: LimitSetLevel,
    pub min_nodes: LimitSetLevel,
    pub max_tres: [LimitSetLevel; TRES_COUNT],
    pub min_tres: [LimitSetLevel; TRES_COUNT],
}

impl LimitSet {
    pub fn max_tres(&self, id: TresId) -> LimitSetLevel {
        self.max_tres[id.index()]
    }

    pub fn min_tres(&self, id: TresId) -> LimitSetLevel {
        self.min_tres[id.index()]
    }

    pub fn set_max_tres(&mut self, id: TresId, level: LimitSetLevel) {
        self.max_tres[id.index()] = level;
    }

    pub fn set_min_tres(&mut self, id: TresId, level: LimitSetLevel) {
        self.min_tres[id.index()] = level;
    }
}

/// Partition snapshot: the pieces the policy core reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Partition {
    pub name: String,
    /// Maximum wall time in minutes; `None` means unlimited.
    pub max_time: Option<u32>,
    /// Default QoS pinned by the partition.
    pub qos: Option<QosId>,
}

impl Partition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_time: None,
            qos: None,
        }
    }
}

/// Resource request block of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobDetails {
    pub min_cpus: Option<u32>,
    pub min_nodes: Option<u32>,
    pub max_nodes: Option<u32>,
    pub pn_min_mem: Option<MemoryRequest>,
}

/// Submit-time request snapshot fed to the admission validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDesc {
    pub user_id: UserId,
    pub min_cpus: Option<u32>,
    pub min_nodes: Option<u32>,
    pub max_nodes: Option<u32>,
    pub pn_min_mem: Option<MemoryRequest>,
    /// Requested wall time in minutes; `None` lets policy derive one.
    pub time_limit: Option<u32>,
    /// Number of tasks in this submission (array submissions count each).
    pub job_cnt: u32,
}

impl JobDesc {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            min_cpus: None,
            min_nodes: None,
            max_nodes: None,
            pn_min_mem: None,
            time_limit: None,
            job_cnt: 1,
        }
    }

    /// Memory footprint estimate before node selection: per-CPU requests
    /// scale by the requested CPUs, per-node by the requested nodes.
    pub fn memory_estimate(&self) -> u64 {
        match self.pn_min_mem {
            Some(mem) => mem.total(self.min_cpus.unwrap_or(0), self.min_nodes.unwrap_or(0)),
            None => 0,
        }
    }

    /// Requested counts as a TRES vector, for the association array checks.
    pub fn tres_req(&self) -> TresCounts {
        let mut req = TresCounts::new();
        req.set(TresId::Cpu, self.min_cpus.map(u64::from));
        req.set(TresId::Node, self.min_nodes.map(u64::from));
        let mem = self.memory_estimate();
        if mem > 0 {
            req.set(TresId::Mem, Some(mem));
        }
        req
    }
}

/// Job record: input to every policy operation, owned by the scheduler.
///
/// The core reads the request fields and mutates only `time_limit`,
/// `limit_set.time`, `state_reason`/`state_desc`, `assoc_id` (re-binding),
/// and `end_time_exp` (fini bookkeeping guard).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub user_id: UserId,
    pub account: String,
    pub partition: Option<Partition>,
    pub qos: Option<QosId>,
    pub assoc_id: Option<AssocId>,
    pub state: JobState,
    pub details: Option<JobDetails>,

    /// Effective wall time limit in minutes.
    pub time_limit: Option<u32>,
    pub limit_set: LimitSet,

    pub state_reason: StateReason,
    pub state_desc: Option<String>,

    // Resolved at begin/finish time.
    pub total_cpus: u32,
    pub node_cnt: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub suspended_secs: i64,
    pub end_time_exp: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: JobId, user_id: UserId, account: impl Into<String>) -> Self {
        Self {
            id,
            user_id,
            account: account.into(),
            partition: None,
            qos: None,
            assoc_id: None,
            state: JobState::Pending,
            details: None,
            time_limit: None,
            limit_set: LimitSet::default(),
            state_reason: StateReason::WaitNoReason,
            state_desc: None,
            total_cpus: 0,
            node_cnt: 0,
            start_time: None,
            suspended_secs: 0,
            end_time_exp: None,
        }
    }

    /// QoS pinned by the job's partition, if any.
    pub fn partition_qos(&self) -> Option<QosId> {
        self.partition.as_ref().and_then(|p| p.qos)
    }

    /// Set the state reason; the description always clears with it so the
    /// two observable fields stay consistent.
    pub fn set_state_reason(&mut self, reason: StateReason) {
        self.state_desc = None;
        self.state_reason = reason;
    }

    /// Memory footprint of the resolved allocation.
    pub fn allocated_memory(&self) -> u64 {
        match self.details.as_ref().and_then(|d| d.pn_min_mem) {
            Some(mem) => mem.total(self.total_cpus, self.node_cnt),
            None => 0,
        }
    }
}
