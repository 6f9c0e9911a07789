//! Start-time runnability checks.
//!
//! Pre-select considers only limits independent of the chosen allocation
//! (job counts and wall caps); post-select re-checks with the selected node
//! and CPU counts. Both hold the READ bundle, mutate nothing but the job's
//! state-reason slot, and honor the first-claim rule across the QoS pair.

use tracing::{debug, info};

use crate::policy::assoc::valid_job_assoc;
use crate::policy::qos::{QosLimits, QosRecord, UserUsage};
use crate::policy::types::{JobRecord, MemoryRequest, StateReason};
use crate::policy::PolicyEngine;
use crate::tres::TresId;

/// Whether the job's current state reason leaves it runnable, i.e. it is not
/// parked on an accounting limit.
pub(crate) fn job_runnable_state(job: &JobRecord) -> bool {
    !job.state_reason.is_limit_wait()
}

fn clear_stale_reason(job: &mut JobRecord) {
    if !job_runnable_state(job) {
        job.set_state_reason(StateReason::WaitNoReason);
    }
}

fn qos_runnable_pre_select(
    job: &mut JobRecord,
    qos: &QosRecord,
    claimed: &mut QosLimits,
) -> bool {
    let wall_mins = (qos.usage.grp_used_wall / 60.0) as u64;
    let user = qos
        .usage
        .user(job.user_id)
        .copied()
        .unwrap_or_else(UserUsage::default);

    // grp_cpu_mins, grp_cpus, grp_mem need the selected counts, not here.

    if claimed.grp_jobs.is_none() {
        if let Some(cap) = qos.limits.grp_jobs {
            claimed.grp_jobs = Some(cap);
            if qos.usage.grp_used_jobs >= cap {
                job.set_state_reason(StateReason::WaitQosGrpJob);
                debug!(
                    "job {} being held, at or exceeds group max jobs limit {} \
                     with {} for qos {}",
                    job.id, cap, qos.usage.grp_used_jobs, qos.name
                );
                return false;
            }
        }
    }

    if claimed.grp_wall.is_none() {
        if let Some(cap) = qos.limits.grp_wall {
            claimed.grp_wall = Some(cap);
            if wall_mins >= u64::from(cap) {
                job.set_state_reason(StateReason::WaitQosGrpWall);
                debug!(
                    "job {} being held, at or exceeds group wall limit {} \
                     with {} for qos {}",
                    job.id, cap, wall_mins, qos.name
                );
                return false;
            }
        }
    }

    if claimed.max_jobs_pu.is_none() {
        if let Some(cap) = qos.limits.max_jobs_pu {
            claimed.max_jobs_pu = Some(cap);
            if user.jobs >= cap {
                job.set_state_reason(StateReason::WaitQosMaxJobPerUser);
                debug!(
                    "job {} being held, at or exceeds max jobs per-user limit {} \
                     with {} for qos {}",
                    job.id, cap, user.jobs, qos.name
                );
                return false;
            }
        }
    }

    // A wall cap lowered after submission can now exclude the job.
    if !job.limit_set.time.is_admin() && claimed.max_wall_pj.is_none() {
        if let Some(cap) = qos.limits.max_wall_pj {
            claimed.max_wall_pj = Some(cap);
            if job.time_limit.is_some_and(|t| t > cap) {
                job.set_state_reason(StateReason::WaitQosMaxWallPerJob);
                debug!(
                    "job {} being held, time limit {} exceeds qos max wall pj {}",
                    job.id,
                    job.time_limit.unwrap_or(0),
                    cap
                );
                return false;
            }
        }
    }

    true
}

pub(crate) fn job_runnable_pre_select(engine: &PolicyEngine, job: &mut JobRecord) -> bool {
    if !engine.config.any() {
        return true;
    }

    // Lock bundle: assocs READ, qos READ.
    let assocs = engine.assocs.read();
    let qos_tbl = engine.qos.read();

    if !valid_job_assoc(&assocs, job) {
        job.set_state_reason(StateReason::FailAccount);
        return false;
    }

    if !engine.config.limits {
        return true;
    }

    clear_stale_reason(job);

    let (q1, q2) = qos_tbl.resolve_pair(job.qos, job.partition_qos());
    let mut claimed = QosLimits::default();
    for qid in [q1, q2].into_iter().flatten() {
        if let Some(qos) = qos_tbl.get(qid) {
            if !qos_runnable_pre_select(job, qos, &mut claimed) {
                return false;
            }
        }
    }

    let mut cur = job.assoc_id;
    let mut parent = false;
    while let Some(aid) = cur {
        let Some(assoc) = assocs.get(aid) else {
            break;
        };
        let wall_mins = (assoc.usage.grp_used_wall / 60.0) as u64;

        if claimed.grp_jobs.is_none() {
            if let Some(cap) = assoc.ctld.grp_jobs {
                if assoc.usage.used_jobs >= cap {
                    job.set_state_reason(StateReason::WaitAssocGrpJob);
                    debug!(
                        "job {} being held, assoc {} is at or exceeds group max \
                         jobs limit {} with {} for account {}",
                        job.id, assoc.id, cap, assoc.usage.used_jobs, assoc.acct
                    );
                    return false;
                }
            }
        }

        if claimed.grp_wall.is_none() {
            if let Some(cap) = assoc.ctld.grp_wall {
                if wall_mins >= u64::from(cap) {
                    job.set_state_reason(StateReason::WaitAssocGrpWall);
                    debug!(
                        "job {} being held, assoc {} is at or exceeds group wall \
                         limit {} with {} for account {}",
                        job.id, assoc.id, cap, wall_mins, assoc.acct
                    );
                    return false;
                }
            }
        }

        // Per-job limits are pre-propagated, only the leaf enforces them.
        if parent {
            cur = assoc.parent;
            continue;
        }

        if claimed.max_jobs_pu.is_none() {
            if let Some(cap) = assoc.ctld.max_jobs {
                if assoc.usage.used_jobs >= cap {
                    job.set_state_reason(StateReason::WaitAssocMaxJobs);
                    debug!(
                        "job {} being held, assoc {} is at or exceeds max jobs \
                         limit {} with {} for account {}",
                        job.id, assoc.id, cap, assoc.usage.used_jobs, assoc.acct
                    );
                    return false;
                }
            }
        }

        // An association wall cap lowered after submission can now exclude
        // the job.
        if !job.limit_set.time.is_admin() && claimed.max_wall_pj.is_none() {
            if let Some(cap) = assoc.ctld.max_wall_pj {
                if job.time_limit.is_some_and(|t| t > cap) {
                    job.set_state_reason(StateReason::WaitAssocMaxWallPerJob);
                    debug!(
                        "job {} being held, time limit {} exceeds account max {}",
                        job.id,
                        job.time_limit.unwrap_or(0),
                        cap
                    );
                    return false;
                }
            }
        }

        cur = assoc.parent;
        parent = true;
    }

    true
}

#[allow(clippy::too_many_arguments)]
fn qos_runnable_post_select(
    job: &mut JobRecord,
    qos: &QosRecord,
    claimed: &mut QosLimits,
    node_cnt: u32,
    cpu_cnt: u32,
    job_memory: u64,
    job_cpu_time_limit: u64,
    admin_set_memory_limit: bool,
    safe_limits: bool,
) -> bool {
    let usage_mins = (qos.usage.usage_raw / 60.0) as u64;
    let cpu_run_mins = qos.usage.grp_used_cpu_run_secs / 60;
    let user = qos
        .usage
        .user(job.user_id)
        .copied()
        .unwrap_or_else(UserUsage::default);

    // Historical cpu-minutes; safe mode additionally requires that the job
    // can run to completion without being killed.
    if claimed.grp_cpu_mins.is_none() {
        if let Some(cap) = qos.limits.grp_cpu_mins {
            claimed.grp_cpu_mins = Some(cap);
            if usage_mins >= cap {
                job.set_state_reason(StateReason::WaitQosGrpCpuMin);
                debug!(
                    "job {} being held, at or exceeds qos {} group max cpu \
                     minutes of {} with {}",
                    job.id, qos.name, cap, usage_mins
                );
                return false;
            } else if safe_limits && job_cpu_time_limit + cpu_run_mins > cap - usage_mins {
                job.set_state_reason(StateReason::WaitQosGrpCpuMin);
                debug!(
                    "job {} being held, qos {} group max cpu minutes {} has {} \
                     available but request is for {} ({} already used) cpu \
                     minutes ({} cpus)",
                    job.id,
                    qos.name,
                    cap,
                    cap - usage_mins,
                    job_cpu_time_limit + cpu_run_mins,
                    cpu_run_mins,
                    cpu_cnt
                );
                return false;
            }
        }
    }

    if !job.limit_set.min_tres(TresId::Cpu).is_admin() && claimed.grp_cpus.is_none() {
        if let Some(cap) = qos.limits.grp_cpus {
            claimed.grp_cpus = Some(cap);
            if cpu_cnt > cap {
                job.set_state_reason(StateReason::WaitQosGrpCpu);
                debug!(
                    "job {} being held, min cpu request {} exceeds group max \
                     cpu limit {} for qos '{}'",
                    job.id, cpu_cnt, cap, qos.name
                );
                return false;
            }
            if qos.usage.grp_used_cpus + cpu_cnt > cap {
                job.set_state_reason(StateReason::WaitQosGrpCpu);
                debug!(
                    "job {} being held, at or exceeds group max cpu limit {} \
                     with already used {} + requested {} for qos {}",
                    job.id, cap, qos.usage.grp_used_cpus, cpu_cnt, qos.name
                );
                return false;
            }
        }
    }

    if !admin_set_memory_limit && claimed.grp_mem.is_none() {
        if let Some(cap) = qos.limits.grp_mem {
            claimed.grp_mem = Some(cap);
            if job_memory > cap {
                job.set_state_reason(StateReason::WaitQosGrpMemory);
                info!(
                    "job {} being held, memory request {} exceeds group max \
                     memory limit {} for qos '{}'",
                    job.id, job_memory, cap, qos.name
                );
                return false;
            }
            if qos.usage.grp_used_mem + job_memory > cap {
                job.set_state_reason(StateReason::WaitQosGrpMemory);
                debug!(
                    "job {} being held, at or exceeds group memory limit {} \
                     with already used {} + requested {} for qos {}",
                    job.id, cap, qos.usage.grp_used_mem, job_memory, qos.name
                );
                return false;
            }
        }
    }

    // grp_jobs was handled before node selection.

    if claimed.grp_cpu_run_mins.is_none() {
        if let Some(cap) = qos.limits.grp_cpu_run_mins {
            claimed.grp_cpu_run_mins = Some(cap);
            if cpu_run_mins + job_cpu_time_limit > cap {
                job.set_state_reason(StateReason::WaitQosGrpCpuRunMin);
                debug!(
                    "job {} being held, qos {} at or exceeds group max running \
                     cpu minutes limit {} with already used {} + requested {}",
                    job.id, qos.name, cap, cpu_run_mins, job_cpu_time_limit
                );
                return false;
            }
        }
    }

    if !job.limit_set.min_nodes.is_admin() && claimed.grp_nodes.is_none() {
        if let Some(cap) = qos.limits.grp_nodes {
            claimed.grp_nodes = Some(cap);
            if node_cnt > cap {
                job.set_state_reason(StateReason::WaitQosGrpNodes);
                debug!(
                    "job {} being held, min node request {} exceeds group max \
                     node limit {} for qos '{}'",
                    job.id, node_cnt, cap, qos.name
                );
                return false;
            }
            if qos.usage.grp_used_nodes + node_cnt > cap {
                job.set_state_reason(StateReason::WaitQosGrpNodes);
                debug!(
                    "job {} being held, at or exceeds group max node limit {} \
                     with already used {} + requested {} for qos {}",
                    job.id, cap, qos.usage.grp_used_nodes, node_cnt, qos.name
                );
                return false;
            }
        }
    }

    // submit_jobs and grp_wall were handled before node selection.

    if claimed.max_cpu_mins_pj.is_none() {
        if let Some(cap) = qos.limits.max_cpu_mins_pj {
            claimed.max_cpu_mins_pj = Some(cap);
            if job.time_limit.is_some() && job_cpu_time_limit > cap {
                job.set_state_reason(StateReason::WaitQosMaxCpuMinsPerJob);
                debug!(
                    "job {} being held, cpu time limit {} exceeds qos {} max \
                     per-job {}",
                    job.id, job_cpu_time_limit, qos.name, cap
                );
                return false;
            }
        }
    }

    if !job.limit_set.min_tres(TresId::Cpu).is_admin() && claimed.max_cpus_pj.is_none() {
        if let Some(cap) = qos.limits.max_cpus_pj {
            claimed.max_cpus_pj = Some(cap);
            if cpu_cnt > cap {
                job.set_state_reason(StateReason::WaitQosMaxCpusPerJob);
                debug!(
                    "job {} being held, min cpu limit {} exceeds qos {} \
                     per-job max {}",
                    job.id, cpu_cnt, qos.name, cap
                );
                return false;
            }
        }
    }

    if !job.limit_set.min_tres(TresId::Cpu).is_admin() && claimed.min_cpus_pj.is_none() {
        if let Some(floor) = qos.limits.min_cpus_pj {
            claimed.min_cpus_pj = Some(floor);
            if cpu_cnt > 0 && cpu_cnt < floor {
                job.set_state_reason(StateReason::WaitQosMinCpus);
                debug!(
                    "job {} being held, min cpu limit {} below qos {} \
                     per-job min {}",
                    job.id, cpu_cnt, qos.name, floor
                );
                return false;
            }
        }
    }

    if !job.limit_set.min_tres(TresId::Cpu).is_admin() && claimed.max_cpus_pu.is_none() {
        if let Some(cap) = qos.limits.max_cpus_pu {
            claimed.max_cpus_pu = Some(cap);
            // Held if the request alone exceeds the per-user cap.
            if cpu_cnt > cap {
                job.set_state_reason(StateReason::WaitQosMaxCpuPerUser);
                debug!(
                    "job {} being held, min cpu limit {} exceeds qos {} \
                     per-user max {}",
                    job.id, cpu_cnt, qos.name, cap
                );
                return false;
            }
            // Held if the user's current usage plus the request exceeds it.
            if user.cpus + cpu_cnt > cap {
                job.set_state_reason(StateReason::WaitQosMaxCpuPerUser);
                debug!(
                    "job {} being held, the user is at or would exceed max cpus \
                     per-user limit {} with {}(+{}) for qos {}",
                    job.id, cap, user.cpus, cpu_cnt, qos.name
                );
                return false;
            }
        }
    }

    // max_jobs_pu was handled before node selection.

    if !job.limit_set.min_nodes.is_admin() && claimed.max_nodes_pj.is_none() {
        if let Some(cap) = qos.limits.max_nodes_pj {
            claimed.max_nodes_pj = Some(cap);
            if node_cnt > cap {
                job.set_state_reason(StateReason::WaitQosMaxNodePerJob);
                debug!(
                    "job {} being held, min node limit {} exceeds qos {} max {}",
                    job.id, node_cnt, qos.name, cap
                );
                return false;
            }
        }
    }

    if !job.limit_set.min_nodes.is_admin() && claimed.max_nodes_pu.is_none() {
        if let Some(cap) = qos.limits.max_nodes_pu {
            claimed.max_nodes_pu = Some(cap);
            if node_cnt > cap {
                job.set_state_reason(StateReason::WaitQosMaxNodePerUser);
                debug!(
                    "job {} being held, min node per-user limit {} exceeds qos \
                     {} max {}",
                    job.id, node_cnt, qos.name, cap
                );
                return false;
            }
            if user.nodes + node_cnt > cap {
                job.set_state_reason(StateReason::WaitQosMaxNodePerUser);
                debug!(
                    "job {} being held, the user is at or would exceed max nodes \
                     per-user limit {} with {}(+{}) for qos {}",
                    job.id, cap, user.nodes, node_cnt, qos.name
                );
                return false;
            }
        }
    }

    true
}

pub(crate) fn job_runnable_post_select(
    engine: &PolicyEngine,
    job: &mut JobRecord,
    node_cnt: u32,
    cpu_cnt: u32,
    pn_min_mem: Option<MemoryRequest>,
) -> bool {
    if !engine.config.any() {
        return true;
    }
    if !engine.config.limits {
        return true;
    }
    let safe_limits = engine.config.safe;

    clear_stale_reason(job);

    let job_cpu_time_limit = u64::from(job.time_limit.unwrap_or(0)) * u64::from(cpu_cnt);

    let (job_memory, admin_set_memory_limit) = match pn_min_mem {
        Some(mem) => (
            mem.total(cpu_cnt, node_cnt),
            job.limit_set.max_tres(TresId::Mem).is_admin()
                || job.limit_set.min_tres(TresId::Cpu).is_admin(),
        ),
        None => (0, false),
    };

    // Lock bundle: assocs READ, qos READ.
    let assocs = engine.assocs.read();
    let qos_tbl = engine.qos.read();

    let (q1, q2) = qos_tbl.resolve_pair(job.qos, job.partition_qos());
    let mut claimed = QosLimits::default();
    for qid in [q1, q2].into_iter().flatten() {
        if let Some(qos) = qos_tbl.get(qid) {
            if !qos_runnable_post_select(
                job,
                qos,
                &mut claimed,
                node_cnt,
                cpu_cnt,
                job_memory,
                job_cpu_time_limit,
                admin_set_memory_limit,
                safe_limits,
            ) {
                return false;
            }
        }
    }

    let mut cur = job.assoc_id;
    let mut parent = false;
    while let Some(aid) = cur {
        let Some(assoc) = assocs.get(aid) else {
            break;
        };
        let usage_mins = (assoc.usage.usage_raw / 60.0) as u64;
        let cpu_run_mins = assoc.usage.grp_used_cpu_run_secs / 60;

        if claimed.grp_cpu_mins.is_none() {
            if let Some(cap) = assoc.ctld.grp_tres_mins.get(TresId::Cpu) {
                if usage_mins >= cap {
                    job.set_state_reason(StateReason::WaitAssocGrpCpuMin);
                    debug!(
                        "job {} being held, assoc {} is at or exceeds group max \
                         cpu minutes limit {} with {} for account {}",
                        job.id, assoc.id, cap, usage_mins, assoc.acct
                    );
                    return false;
                } else if safe_limits && job_cpu_time_limit + cpu_run_mins > cap - usage_mins {
                    job.set_state_reason(StateReason::WaitAssocGrpCpuMin);
                    debug!(
                        "job {} being held, assoc {} group max cpu minutes {} \
                         has {} available but request is for {} cpu minutes \
                         ({} cpus) for account {}",
                        job.id,
                        assoc.id,
                        cap,
                        cap - usage_mins,
                        job_cpu_time_limit + cpu_run_mins,
                        cpu_cnt,
                        assoc.acct
                    );
                    return false;
                }
            }
        }

        if !job.limit_set.min_tres(TresId::Cpu).is_admin() && claimed.grp_cpus.is_none() {
            if let Some(cap) = assoc.ctld.grp_tres.get(TresId::Cpu) {
                if u64::from(cpu_cnt) > cap {
                    job.set_state_reason(StateReason::WaitAssocGrpCpu);
                    debug!(
                        "job {} being held, min cpu request {} exceeds group max \
                         cpu limit {} for account {}",
                        job.id, cpu_cnt, cap, assoc.acct
                    );
                    return false;
                }
                if u64::from(assoc.usage.grp_used_cpus + cpu_cnt) > cap {
                    job.set_state_reason(StateReason::WaitAssocGrpCpu);
                    debug!(
                        "job {} being held, assoc {} is at or exceeds group max \
                         cpu limit {} with already used {} + requested {} for \
                         account {}",
                        job.id, assoc.id, cap, assoc.usage.grp_used_cpus, cpu_cnt, assoc.acct
                    );
                    return false;
                }
            }
        }

        if !admin_set_memory_limit && claimed.grp_mem.is_none() {
            if let Some(cap) = assoc.ctld.grp_mem {
                if job_memory > cap {
                    job.set_state_reason(StateReason::WaitAssocGrpMemory);
                    info!(
                        "job {} being held, memory request {} exceeds group \
                         memory limit {} for account {}",
                        job.id, job_memory, cap, assoc.acct
                    );
                    return false;
                }
                if assoc.usage.grp_used_mem + job_memory > cap {
                    job.set_state_reason(StateReason::WaitAssocGrpMemory);
                    debug!(
                        "job {} being held, assoc {} is at or exceeds group \
                         memory limit {} with already used {} + requested {} \
                         for account {}",
                        job.id, assoc.id, cap, assoc.usage.grp_used_mem, job_memory, assoc.acct
                    );
                    return false;
                }
            }
        }

        // grp_jobs was handled before node selection.

        if claimed.grp_cpu_run_mins.is_none() {
            if let Some(cap) = assoc.ctld.grp_tres_run_mins.get(TresId::Cpu) {
                if cpu_run_mins + job_cpu_time_limit > cap {
                    job.set_state_reason(StateReason::WaitAssocGrpCpuRunMin);
                    debug!(
                        "job {} being held, assoc {} is at or exceeds group max \
                         running cpu minutes limit {} with already used {} + \
                         requested {} for account {}",
                        job.id, assoc.id, cap, cpu_run_mins, job_cpu_time_limit, assoc.acct
                    );
                    return false;
                }
            }
        }

        if !job.limit_set.min_nodes.is_admin() && claimed.grp_nodes.is_none() {
            if let Some(cap) = assoc.ctld.grp_nodes {
                if node_cnt > cap {
                    job.set_state_reason(StateReason::WaitAssocGrpNodes);
                    debug!(
                        "job {} being held, min node request {} exceeds group \
                         max node limit {} for account {}",
                        job.id, node_cnt, cap, assoc.acct
                    );
                    return false;
                }
                if assoc.usage.grp_used_nodes + node_cnt > cap {
                    job.set_state_reason(StateReason::WaitAssocGrpNodes);
                    debug!(
                        "job {} being held, assoc {} is at or exceeds group max \
                         node limit {} with already used {} + requested {} for \
                         account {}",
                        job.id, assoc.id, cap, assoc.usage.grp_used_nodes, node_cnt, assoc.acct
                    );
                    return false;
                }
            }
        }

        // submit_jobs and grp_wall were handled before node selection.

        // Per-job limits are pre-propagated, only the leaf enforces them.
        if parent {
            cur = assoc.parent;
            continue;
        }

        if claimed.max_cpu_mins_pj.is_none() {
            if let Some(cap) = assoc.ctld.max_tres_mins_pj.get(TresId::Cpu) {
                if job.time_limit.is_some() && job_cpu_time_limit > cap {
                    job.set_state_reason(StateReason::WaitAssocMaxCpuMinsPerJob);
                    debug!(
                        "job {} being held, cpu time limit {} exceeds assoc max \
                         per job {}",
                        job.id, job_cpu_time_limit, cap
                    );
                    return false;
                }
            }
        }

        if claimed.max_cpus_pj.is_none() {
            if let Some(cap) = assoc.ctld.max_tres_pj.get(TresId::Cpu) {
                if u64::from(cpu_cnt) > cap {
                    job.set_state_reason(StateReason::WaitAssocMaxCpusPerJob);
                    debug!(
                        "job {} being held, min cpu limit {} exceeds account max {}",
                        job.id, cpu_cnt, cap
                    );
                    return false;
                }
            }
        }

        // max_jobs was handled before node selection.

        if claimed.max_nodes_pj.is_none() {
            if let Some(cap) = assoc.ctld.max_nodes_pj {
                if node_cnt > cap {
                    job.set_state_reason(StateReason::WaitAssocMaxNodePerJob);
                    debug!(
                        "job {} being held, min node limit {} exceeds account max {}",
                        job.id, node_cnt, cap
                    );
                    return false;
                }
            }
        }

        // submit_jobs and max_wall_pj were handled before node selection.

        cur = assoc.parent;
        parent = true;
    }

    true
}
