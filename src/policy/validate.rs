//! Admission validation.
//!
//! Submit-time check of a job request against the QoS pair and the
//! association chain. Limits are enforced synchronously only when the caller
//! asked for a reason or the governing QoS denies on limit; otherwise the
//! derived values are still computed (notably the effective time limit) but
//! violations do not fail admission.

use tracing::{debug, error, info};

use crate::policy::assoc::AssocLimits;
use crate::policy::qos::{opt_min, QosLimits, QosRecord};
use crate::policy::types::{
    JobDesc, JobRecord, LimitSet, LimitSetLevel, Partition, StateReason,
};
use crate::policy::PolicyEngine;
use crate::tres::{TresCounts, TresId};
use crate::types::{AssocId, Error, Result};

fn put_reason(reason: &mut Option<&mut StateReason>, value: StateReason) {
    if let Some(slot) = reason.as_deref_mut() {
        *slot = value;
    }
}

fn assoc_grp_reason(tres: TresId) -> StateReason {
    match tres {
        TresId::Cpu => StateReason::WaitAssocGrpCpu,
        TresId::Mem => StateReason::WaitAssocGrpMemory,
        TresId::Node => StateReason::WaitAssocGrpNodes,
        TresId::Energy => StateReason::WaitAssocResourceLimit,
    }
}

fn assoc_max_pj_reason(tres: TresId) -> StateReason {
    match tres {
        TresId::Cpu => StateReason::WaitAssocMaxCpusPerJob,
        TresId::Node => StateReason::WaitAssocMaxNodePerJob,
        TresId::Mem | TresId::Energy => StateReason::WaitAssocResourceLimit,
    }
}

/// Check requested counts against an association limit vector, skipping any
/// slot an admin pinned or a QoS already claimed. Returns the first violated
/// axis.
fn validate_tres_limits(
    job_req: &TresCounts,
    assoc_limits: &TresCounts,
    qos_claimed: &TresCounts,
    admin_set: &[LimitSetLevel; crate::tres::TRES_COUNT],
    strict_checking: bool,
    update_call: bool,
) -> Option<TresId> {
    if !strict_checking {
        return None;
    }

    for tres in TresId::ALL {
        if admin_set[tres.index()].is_admin() {
            continue;
        }
        if qos_claimed.get(tres).is_some() {
            continue;
        }
        let Some(limit) = assoc_limits.get(tres) else {
            continue;
        };
        let Some(requested) = job_req.get(tres) else {
            continue;
        };
        if (requested > 0 || !update_call) && requested > limit {
            return Some(tres);
        }
    }
    None
}

/// One QoS pass of the admission validator. Finite slots not yet claimed in
/// `claimed` are checked and claimed; the per-pass derived wall cap is
/// installed into the request at the end.
#[allow(clippy::too_many_arguments)]
fn qos_policy_validate(
    qos: &QosRecord,
    claimed: &mut QosLimits,
    desc: &mut JobDesc,
    part: &Partition,
    limit_set: &mut LimitSet,
    update_call: bool,
    user_name: &str,
    job_memory: u64,
    strict_checking: bool,
    mut reason: Option<&mut StateReason>,
) -> bool {
    let limits = &qos.limits;

    // CPU: per-user cap first, then the group total.
    let qos_max_cpus_limit = opt_min(limits.grp_cpus, limits.max_cpus_pu);
    let out_max_cpus_limit = opt_min(claimed.grp_cpus, claimed.max_cpus_pu);
    if limit_set.max_tres(TresId::Cpu).is_admin()
        || out_max_cpus_limit.is_some()
        || qos_max_cpus_limit.is_none()
        || (update_call && desc.min_cpus.is_none())
    {
        // no need to check/set
    } else if strict_checking {
        if let Some(requested) = desc.min_cpus {
            if claimed.max_cpus_pu.is_none() {
                claimed.max_cpus_pu = limits.max_cpus_pu;
            }
            if claimed.grp_cpus.is_none() {
                claimed.grp_cpus = limits.grp_cpus;
            }

            if limits.max_cpus_pu.is_some_and(|cap| requested > cap) {
                put_reason(&mut reason, StateReason::WaitQosMaxCpuPerUser);
                debug!(
                    "job submit for user {}({}): min cpu request {} exceeds \
                     per-user max cpu limit {} for qos '{}'",
                    user_name,
                    desc.user_id,
                    requested,
                    limits.max_cpus_pu.unwrap_or(0),
                    qos.name
                );
                return false;
            } else if limits.grp_cpus.is_some_and(|cap| requested > cap) {
                put_reason(&mut reason, StateReason::WaitQosGrpCpu);
                debug!(
                    "job submit for user {}({}): min cpu request {} exceeds \
                     group max cpu limit {} for qos '{}'",
                    user_name,
                    desc.user_id,
                    requested,
                    limits.grp_cpus.unwrap_or(0),
                    qos.name
                );
                return false;
            }
        }
    }

    // Group memory.
    if limit_set.max_tres(TresId::Mem).is_unset()
        && strict_checking
        && claimed.grp_mem.is_none()
    {
        if let Some(cap) = limits.grp_mem {
            claimed.grp_mem = Some(cap);
            if job_memory > cap {
                put_reason(&mut reason, StateReason::WaitQosGrpMemory);
                debug!(
                    "job submit for user {}({}): min memory request {} exceeds \
                     group max memory limit {} for qos '{}'",
                    user_name, desc.user_id, job_memory, cap, qos.name
                );
                return false;
            }
        }
    }

    // Nodes: per-user cap first, then the group total.
    let qos_max_nodes_limit = opt_min(limits.grp_nodes, limits.max_nodes_pu);
    let out_max_nodes_limit = opt_min(claimed.grp_nodes, claimed.max_nodes_pu);
    if limit_set.max_nodes.is_admin()
        || out_max_nodes_limit.is_some()
        || qos_max_nodes_limit.is_none()
        || (update_call && desc.max_nodes.is_none())
    {
        // no need to check/set
    } else if strict_checking {
        if let Some(requested) = desc.min_nodes {
            if claimed.max_nodes_pu.is_none() {
                claimed.max_nodes_pu = limits.max_nodes_pu;
            }
            if claimed.grp_nodes.is_none() {
                claimed.grp_nodes = limits.grp_nodes;
            }

            if limits.max_nodes_pu.is_some_and(|cap| requested > cap) {
                put_reason(&mut reason, StateReason::WaitQosMaxNodePerUser);
                debug!(
                    "job submit for user {}({}): min node request {} exceeds \
                     per-user max node limit {} for qos '{}'",
                    user_name,
                    desc.user_id,
                    requested,
                    limits.max_nodes_pu.unwrap_or(0),
                    qos.name
                );
                return false;
            } else if limits.grp_nodes.is_some_and(|cap| requested > cap) {
                put_reason(&mut reason, StateReason::WaitQosGrpNodes);
                debug!(
                    "job submit for user {}({}): min node request {} exceeds \
                     group max node limit {} for qos '{}'",
                    user_name,
                    desc.user_id,
                    requested,
                    limits.grp_nodes.unwrap_or(0),
                    qos.name
                );
                return false;
            }
        }
    }

    // Group submit jobs counts live submissions plus this request.
    if claimed.grp_submit_jobs.is_none() {
        if let Some(cap) = limits.grp_submit_jobs {
            claimed.grp_submit_jobs = Some(cap);
            if qos.usage.grp_used_submit_jobs + desc.job_cnt > cap {
                put_reason(&mut reason, StateReason::WaitQosGrpSubJob);
                debug!(
                    "job submit for user {}({}): group max submit job limit \
                     exceeded {} for qos '{}'",
                    user_name, desc.user_id, cap, qos.name
                );
                return false;
            }
        }
    }

    // grp_wall is checked while the job is running, not here.

    // A max-cpu-minutes-per-job cap turns into a wall cap for the effective
    // cpu count; denial-on-limit configurations need it validated now.
    let mut qos_time_limit: Option<u32> = None;
    if (desc.min_cpus.is_some() || desc.min_nodes.is_some())
        && claimed.max_cpu_mins_pj.is_none()
    {
        if let Some(cap) = limits.max_cpu_mins_pj {
            claimed.max_cpu_mins_pj = Some(cap);
            let cpu_cnt = match (desc.min_cpus, desc.min_nodes) {
                (Some(cpus), Some(nodes)) => cpus.max(nodes),
                (Some(cpus), None) => cpus,
                (None, Some(nodes)) => nodes,
                (None, None) => 0,
            };
            if cpu_cnt > 0 {
                let minutes = cap / u64::from(cpu_cnt);
                qos_time_limit = Some(u32::try_from(minutes).unwrap_or(u32::MAX));
            }
        }
    }

    // Per-job CPU cap.
    if limit_set.max_tres(TresId::Cpu).is_admin()
        || claimed.max_cpus_pj.is_some()
        || limits.max_cpus_pj.is_none()
        || (update_call && desc.min_cpus.is_none())
    {
        // no need to check/set
    } else if strict_checking {
        if let Some(requested) = desc.min_cpus {
            claimed.max_cpus_pj = limits.max_cpus_pj;
            if limits.max_cpus_pj.is_some_and(|cap| requested > cap) {
                put_reason(&mut reason, StateReason::WaitQosMaxCpusPerJob);
                debug!(
                    "job submit for user {}({}): min cpu limit {} exceeds qos max {}",
                    user_name,
                    desc.user_id,
                    requested,
                    limits.max_cpus_pj.unwrap_or(0)
                );
                return false;
            }
        }
    }

    // max_jobs is checked while the job is running, not here.

    // Per-job node cap.
    if limit_set.max_nodes.is_admin()
        || claimed.max_nodes_pj.is_some()
        || limits.max_nodes_pj.is_none()
        || (update_call && desc.max_nodes.is_none())
    {
        // no need to check/set
    } else if strict_checking {
        if let Some(requested) = desc.min_nodes {
            claimed.max_nodes_pj = limits.max_nodes_pj;
            if limits.max_nodes_pj.is_some_and(|cap| requested > cap) {
                put_reason(&mut reason, StateReason::WaitQosMaxNodePerJob);
                debug!(
                    "job submit for user {}({}): min node limit {} exceeds qos max {}",
                    user_name,
                    desc.user_id,
                    requested,
                    limits.max_nodes_pj.unwrap_or(0)
                );
                return false;
            }
        }
    }

    // Per-user submit cap counts this user's live submissions.
    if claimed.max_submit_jobs_pu.is_none() {
        if let Some(cap) = limits.max_submit_jobs_pu {
            claimed.max_submit_jobs_pu = Some(cap);
            let user_usage = qos.usage.user(desc.user_id);
            let over = match user_usage {
                None => cap == 0,
                Some(usage) => usage.submit_jobs + desc.job_cnt > cap,
            };
            if over {
                put_reason(&mut reason, StateReason::WaitQosMaxSubJob);
                debug!(
                    "job submit for user {}({}): qos max submit job limit exceeded {}",
                    user_name, desc.user_id, cap
                );
                return false;
            }
        }
    }

    // Per-job wall cap folds into the derived limit.
    if limit_set.time.is_admin()
        || claimed.max_wall_pj.is_some()
        || limits.max_wall_pj.is_none()
        || (update_call && desc.time_limit.is_none())
    {
        // no need to check/set
    } else {
        claimed.max_wall_pj = limits.max_wall_pj;
        qos_time_limit = opt_min(qos_time_limit, limits.max_wall_pj);
    }

    if let Some(cap) = qos_time_limit {
        match desc.time_limit {
            None => {
                desc.time_limit = Some(match part.max_time {
                    None => cap,
                    Some(part_max) => cap.min(part_max),
                });
                limit_set.time = LimitSetLevel::Policy;
            }
            Some(requested) if limit_set.time == LimitSetLevel::Policy && requested > cap => {
                desc.time_limit = Some(cap);
            }
            Some(requested) if strict_checking && requested > cap => {
                put_reason(&mut reason, StateReason::WaitQosMaxWallPerJob);
                debug!(
                    "job submit for user {}({}): time limit {} exceeds qos max {}",
                    user_name, desc.user_id, requested, cap
                );
                return false;
            }
            Some(_) => {}
        }
    }

    // Per-job CPU floor.
    if strict_checking && claimed.min_cpus_pj.is_none() {
        if let Some(floor) = limits.min_cpus_pj {
            claimed.min_cpus_pj = Some(floor);
            if desc.min_cpus.is_some_and(|requested| requested < floor) {
                put_reason(&mut reason, StateReason::WaitQosMinCpus);
                debug!(
                    "job submit for user {}({}): min cpus {} below qos min {}",
                    user_name,
                    desc.user_id,
                    desc.min_cpus.unwrap_or(0),
                    floor
                );
                return false;
            }
        }
    }

    true
}

pub(crate) fn validate(
    engine: &PolicyEngine,
    desc: &mut JobDesc,
    part: &Partition,
    assoc_id: AssocId,
    qos_id: Option<crate::types::QosId>,
    mut reason: Option<&mut StateReason>,
    limit_set: &mut LimitSet,
    update_call: bool,
) -> bool {
    // Lock bundle: assocs READ, qos READ, users READ, in declaration order.
    let assocs = engine.assocs.read();
    let qos_tbl = engine.qos.read();
    let users = engine.users.read();

    if assocs.get(assoc_id).is_none() {
        error!("validate: no association {} given for job", assoc_id);
        return false;
    }
    let user_name = users.name_of(desc.user_id);
    let job_memory = desc.memory_estimate();

    let (q1, q2) = qos_tbl.resolve_pair(qos_id, part.qos);

    let strict_checking = match q1 {
        Some(first) => {
            let mut strict = reason.is_some()
                || qos_tbl.get(first).is_some_and(|q| q.flags.deny_limit);
            if !strict {
                if let Some(second) = q2 {
                    strict = qos_tbl.get(second).is_some_and(|q| q.flags.deny_limit);
                }
            }
            strict
        }
        None => reason.is_some(),
    };

    // A policy-derived time limit only survives re-validation while some
    // wall cap still produces it: downgrade the marker here and let the
    // install paths below re-claim it. Skipped for time-less update calls,
    // which leave the time slot untouched entirely.
    if limit_set.time == LimitSetLevel::Policy && !(update_call && desc.time_limit.is_none()) {
        limit_set.time = LimitSetLevel::Unset;
    }

    let mut claimed = QosLimits::default();
    for qid in [q1, q2].into_iter().flatten() {
        let Some(qos) = qos_tbl.get(qid) else {
            continue;
        };
        if !qos_policy_validate(
            qos,
            &mut claimed,
            desc,
            part,
            limit_set,
            update_call,
            &user_name,
            job_memory,
            strict_checking,
            reason.as_deref_mut(),
        ) {
            return false;
        }
    }

    let job_req = desc.tres_req();
    let mut cur = Some(assoc_id);
    let mut parent = false;
    while let Some(aid) = cur {
        let Some(assoc) = assocs.get(aid) else {
            break;
        };
        let ctld: &AssocLimits = &assoc.ctld;

        // grp_tres_mins is not validated at admission.

        // Group resource vector; the QoS claims shadow the matching axes.
        let mut qos_grp_claimed = TresCounts::new();
        qos_grp_claimed.set(TresId::Cpu, claimed.grp_cpus.map(u64::from));
        qos_grp_claimed.set(TresId::Mem, claimed.grp_mem);
        if let Some(tres) = validate_tres_limits(
            &job_req,
            &ctld.grp_tres,
            &qos_grp_claimed,
            &limit_set.max_tres,
            strict_checking,
            update_call,
        ) {
            put_reason(&mut reason, assoc_grp_reason(tres));
            debug!(
                "job submit for user {}({}): min {} request {} exceeds \
                 group max {} limit {} for account {}",
                user_name,
                desc.user_id,
                tres.label(),
                job_req.get(tres).unwrap_or(0),
                tres.label(),
                ctld.grp_tres.get(tres).unwrap_or(0),
                assoc.acct
            );
            return false;
        }

        // grp_jobs is checked while the job is running, not here.

        if limit_set.max_nodes.is_admin()
            || claimed.grp_nodes.is_some()
            || ctld.grp_nodes.is_none()
            || (update_call && desc.max_nodes.is_none())
        {
            // no need to check/set
        } else if strict_checking
            && desc
                .min_nodes
                .is_some_and(|requested| requested > ctld.grp_nodes.unwrap_or(u32::MAX))
        {
            put_reason(&mut reason, StateReason::WaitAssocGrpNodes);
            debug!(
                "job submit for user {}({}): min node request {} exceeds \
                 group max node limit {} for account {}",
                user_name,
                desc.user_id,
                desc.min_nodes.unwrap_or(0),
                ctld.grp_nodes.unwrap_or(0),
                assoc.acct
            );
            return false;
        }

        if claimed.grp_submit_jobs.is_none() {
            if let Some(cap) = ctld.grp_submit_jobs {
                if assoc.usage.used_submit_jobs + desc.job_cnt > cap {
                    put_reason(&mut reason, StateReason::WaitAssocGrpSubJob);
                    debug!(
                        "job submit for user {}({}): group max submit job limit \
                         exceeded {} for account '{}'",
                        user_name, desc.user_id, cap, assoc.acct
                    );
                    return false;
                }
            }
        }

        // grp_wall is checked while the job is running, not here.

        // Per-job limits are pre-propagated, only the leaf enforces them.
        if parent {
            cur = assoc.parent;
            continue;
        }

        // max_tres_mins_pj is not validated at admission.

        let mut qos_pj_claimed = TresCounts::new();
        qos_pj_claimed.set(TresId::Cpu, claimed.max_cpus_pj.map(u64::from));
        if let Some(tres) = validate_tres_limits(
            &job_req,
            &ctld.max_tres_pj,
            &qos_pj_claimed,
            &limit_set.max_tres,
            strict_checking,
            update_call,
        ) {
            put_reason(&mut reason, assoc_max_pj_reason(tres));
            debug!(
                "job submit for user {}({}): min {} request {} exceeds \
                 max {} limit {} for account {}",
                user_name,
                desc.user_id,
                tres.label(),
                job_req.get(tres).unwrap_or(0),
                tres.label(),
                ctld.max_tres_pj.get(tres).unwrap_or(0),
                assoc.acct
            );
            return false;
        }

        // max_jobs is checked while the job is running, not here.

        if limit_set.max_nodes.is_admin()
            || claimed.max_nodes_pj.is_some()
            || ctld.max_nodes_pj.is_none()
            || (update_call && desc.max_nodes.is_none())
        {
            // no need to check/set
        } else if strict_checking
            && desc
                .min_nodes
                .is_some_and(|requested| requested > ctld.max_nodes_pj.unwrap_or(u32::MAX))
        {
            put_reason(&mut reason, StateReason::WaitAssocMaxNodePerJob);
            debug!(
                "job submit for user {}({}): min node limit {} exceeds account max {}",
                user_name,
                desc.user_id,
                desc.min_nodes.unwrap_or(0),
                ctld.max_nodes_pj.unwrap_or(0)
            );
            return false;
        }

        if claimed.max_submit_jobs_pu.is_none() {
            if let Some(cap) = ctld.max_submit_jobs {
                if assoc.usage.used_submit_jobs + desc.job_cnt > cap {
                    put_reason(&mut reason, StateReason::WaitAssocMaxSubJob);
                    debug!(
                        "job submit for user {}({}): account max submit job limit exceeded {}",
                        user_name, desc.user_id, cap
                    );
                    return false;
                }
            }
        }

        if limit_set.time.is_admin()
            || claimed.max_wall_pj.is_some()
            || ctld.max_wall_pj.is_none()
            || (update_call && desc.time_limit.is_none())
        {
            // no need to check/set
        } else {
            let cap = ctld.max_wall_pj.unwrap_or(u32::MAX);
            match desc.time_limit {
                None => {
                    desc.time_limit = Some(match part.max_time {
                        None => cap,
                        Some(part_max) => cap.min(part_max),
                    });
                    limit_set.time = LimitSetLevel::Policy;
                }
                Some(requested)
                    if limit_set.time == LimitSetLevel::Policy && requested > cap =>
                {
                    desc.time_limit = Some(cap);
                }
                Some(requested) if strict_checking && requested > cap => {
                    put_reason(&mut reason, StateReason::WaitAssocMaxWallPerJob);
                    debug!(
                        "job submit for user {}({}): time limit {} exceeds account max {}",
                        user_name, desc.user_id, requested, cap
                    );
                    return false;
                }
                Some(_) => {}
            }
        }

        cur = assoc.parent;
        parent = true;
    }

    true
}

/// Re-check a pending job after a QoS or association update, refreshing the
/// derived time limit. A policy-derived limit that no longer applies is
/// cleared; a changed one is reinstalled and pushed to accounting storage.
pub(crate) fn update_pending_job(engine: &PolicyEngine, job: &mut JobRecord) -> Result<()> {
    if !engine.config.any() || !job.state.is_pending() || !engine.config.limits {
        return Ok(());
    }

    let details = job
        .details
        .ok_or_else(|| Error::missing_details(format!("job {}", job.id)))?;

    let assoc_id = job
        .assoc_id
        .ok_or_else(|| Error::missing_association(format!("job {}", job.id)))?;

    let mut desc = JobDesc::new(job.user_id);
    desc.min_cpus = details.min_cpus;
    desc.min_nodes = details.min_nodes;
    desc.max_nodes = details.max_nodes;
    desc.pn_min_mem = details.pn_min_mem;

    // Only a user-requested time limit is carried into re-validation;
    // policy-derived limits are recomputed from scratch and admin-pinned
    // ones stay untouched.
    let mut limit_set = job.limit_set;
    if !job.limit_set.time.is_admin() && job.limit_set.time.is_unset() {
        desc.time_limit = job.time_limit;
    }

    let part = job.partition.clone().unwrap_or_default();

    let mut reason = job.state_reason;
    let ok = validate(
        engine,
        &mut desc,
        &part,
        assoc_id,
        job.qos,
        Some(&mut reason),
        &mut limit_set,
        false,
    );
    if reason != job.state_reason {
        job.set_state_reason(reason);
    }
    if !ok {
        info!(
            "update_pending_job: job {} exceeds an association/qos cpu, node, \
             memory or time limit",
            job.id
        );
        return Err(Error::limit_violation(format!("job {}", job.id)));
    }

    let mut update_accounting = false;
    if limit_set.time.is_unset() && job.limit_set.time == LimitSetLevel::Policy {
        // The cap that produced the derived limit is gone.
        job.time_limit = None;
        job.limit_set.time = LimitSetLevel::Unset;
        update_accounting = true;
    } else if !limit_set.time.is_admin() {
        if job.time_limit != desc.time_limit {
            job.time_limit = desc.time_limit;
            update_accounting = true;
        }
        job.limit_set.time = limit_set.time;
    }

    if update_accounting {
        engine.touch_last_job_update();
        debug!("limits changed for job {}: updating accounting", job.id);
        engine.storage.job_start_direct(job);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::qos::QosFlags;
    use crate::policy::{AssocRecord, PolicyEngine, QosRecord};
    use crate::types::{EnforceConfig, QosId, UserId};

    fn engine_with_leaf() -> (PolicyEngine, crate::types::AssocId) {
        let engine = PolicyEngine::new(EnforceConfig::limits());
        let leaf = crate::types::AssocId::new(11);
        let mut rec = AssocRecord::new(leaf, "physics", Some(engine.root_assoc()));
        rec.user = Some(UserId::new(100));
        engine.add_association(rec).unwrap();
        engine.add_user(UserId::new(100), "alice");
        (engine, leaf)
    }

    fn run_validate(
        engine: &PolicyEngine,
        leaf: crate::types::AssocId,
        qos_id: Option<QosId>,
        desc: &mut JobDesc,
        part: &Partition,
        limit_set: &mut LimitSet,
    ) -> (bool, StateReason) {
        let mut reason = StateReason::WaitNoReason;
        let ok = engine.validate(desc, part, leaf, qos_id, Some(&mut reason), limit_set, false);
        (ok, reason)
    }

    #[test]
    fn test_per_user_cpu_cap_rejects_oversized_request() {
        let (engine, leaf) = engine_with_leaf();
        let qos_id = QosId::new(1);
        let mut qos = QosRecord::new(qos_id, "limited");
        qos.limits.max_cpus_pu = Some(8);
        engine.add_qos(qos);

        let part = Partition::new("batch");
        let mut desc = JobDesc::new(UserId::new(100));
        desc.min_cpus = Some(16);
        let mut limit_set = LimitSet::default();
        let (ok, reason) =
            run_validate(&engine, leaf, Some(qos_id), &mut desc, &part, &mut limit_set);
        assert!(!ok);
        assert_eq!(reason, StateReason::WaitQosMaxCpuPerUser);

        desc.min_cpus = Some(4);
        let (ok, _) = run_validate(&engine, leaf, Some(qos_id), &mut desc, &part, &mut limit_set);
        assert!(ok);
    }

    #[test]
    fn test_admin_set_time_is_exempt() {
        let (engine, leaf) = engine_with_leaf();
        let qos_id = QosId::new(1);
        let mut qos = QosRecord::new(qos_id, "short");
        qos.limits.max_wall_pj = Some(60);
        engine.add_qos(qos);

        let part = Partition::new("batch");
        let mut desc = JobDesc::new(UserId::new(100));
        desc.time_limit = Some(1440);
        let mut limit_set = LimitSet::default();
        limit_set.time = LimitSetLevel::Admin;

        let (ok, _) = run_validate(&engine, leaf, Some(qos_id), &mut desc, &part, &mut limit_set);
        assert!(ok);
        // The admin-pinned request is never touched.
        assert_eq!(desc.time_limit, Some(1440));
        assert_eq!(limit_set.time, LimitSetLevel::Admin);
    }

    #[test]
    fn test_derived_time_limit_clips_to_partition() {
        let (engine, leaf) = engine_with_leaf();
        let qos_id = QosId::new(1);
        let mut qos = QosRecord::new(qos_id, "short");
        qos.limits.max_wall_pj = Some(120);
        engine.add_qos(qos);

        let mut part = Partition::new("batch");
        part.max_time = Some(90);
        let mut desc = JobDesc::new(UserId::new(100));
        let mut limit_set = LimitSet::default();

        let (ok, _) = run_validate(&engine, leaf, Some(qos_id), &mut desc, &part, &mut limit_set);
        assert!(ok);
        assert_eq!(desc.time_limit, Some(90));
        assert_eq!(limit_set.time, LimitSetLevel::Policy);
    }

    #[test]
    fn test_derived_time_limit_from_association_cap() {
        let (engine, leaf) = engine_with_leaf();
        let mut limits = crate::policy::AssocLimits::default();
        limits.max_wall_pj = Some(45);
        engine.update_assoc_limits(leaf, limits).unwrap();

        let part = Partition::new("batch");
        let mut desc = JobDesc::new(UserId::new(100));
        let mut limit_set = LimitSet::default();

        let (ok, _) = run_validate(&engine, leaf, None, &mut desc, &part, &mut limit_set);
        assert!(ok);
        assert_eq!(desc.time_limit, Some(45));
        assert_eq!(limit_set.time, LimitSetLevel::Policy);
    }

    #[test]
    fn test_first_qos_claims_the_slot() {
        let (engine, leaf) = engine_with_leaf();
        let part_qos = QosId::new(1);
        let job_qos = QosId::new(2);

        // The partition QoS governs; it allows the request, while the job
        // QoS alone would reject it. The second value must never be
        // observed.
        let mut generous = QosRecord::new(part_qos, "generous");
        generous.limits.max_cpus_pj = Some(32);
        engine.add_qos(generous);
        let mut stingy = QosRecord::new(job_qos, "stingy");
        stingy.limits.max_cpus_pj = Some(2);
        engine.add_qos(stingy);

        let mut part = Partition::new("batch");
        part.qos = Some(part_qos);
        let mut desc = JobDesc::new(UserId::new(100));
        desc.min_cpus = Some(16);
        let mut limit_set = LimitSet::default();

        let (ok, _) =
            run_validate(&engine, leaf, Some(job_qos), &mut desc, &part, &mut limit_set);
        assert!(ok);
    }

    #[test]
    fn test_deny_limit_forces_strict_checking() {
        let (engine, leaf) = engine_with_leaf();
        let qos_id = QosId::new(1);
        let mut qos = QosRecord::new(qos_id, "deny");
        qos.flags = QosFlags {
            part_qos: false,
            deny_limit: true,
        };
        qos.limits.max_cpus_pj = Some(4);
        engine.add_qos(qos);

        let part = Partition::new("batch");
        let mut desc = JobDesc::new(UserId::new(100));
        desc.min_cpus = Some(8);
        let mut limit_set = LimitSet::default();

        // No reason slot: enforcement normally stays lazy, but deny-limit
        // turns it on.
        let ok = engine.validate(&mut desc, &part, leaf, Some(qos_id), None, &mut limit_set, false);
        assert!(!ok);
    }

    #[test]
    fn test_without_reason_violations_do_not_fail() {
        let (engine, leaf) = engine_with_leaf();
        let qos_id = QosId::new(1);
        let mut qos = QosRecord::new(qos_id, "soft");
        qos.limits.max_cpus_pj = Some(4);
        engine.add_qos(qos);

        let part = Partition::new("batch");
        let mut desc = JobDesc::new(UserId::new(100));
        desc.min_cpus = Some(8);
        let mut limit_set = LimitSet::default();

        let ok = engine.validate(&mut desc, &part, leaf, Some(qos_id), None, &mut limit_set, false);
        assert!(ok);
    }

    #[test]
    fn test_assoc_group_submit_jobs_counts_whole_array() {
        let (engine, leaf) = engine_with_leaf();
        let mut limits = crate::policy::AssocLimits::default();
        limits.grp_submit_jobs = Some(10);
        engine.update_assoc_limits(leaf, limits).unwrap();

        let part = Partition::new("batch");
        let mut desc = JobDesc::new(UserId::new(100));
        desc.job_cnt = 16;
        let mut limit_set = LimitSet::default();
        let (ok, reason) = run_validate(&engine, leaf, None, &mut desc, &part, &mut limit_set);
        assert!(!ok);
        assert_eq!(reason, StateReason::WaitAssocGrpSubJob);
    }

    #[test]
    fn test_assoc_grp_tres_cpu_cap() {
        let (engine, leaf) = engine_with_leaf();
        let mut limits = crate::policy::AssocLimits::default();
        limits.grp_tres = engine.parse_tres_counts("1=8").unwrap();
        engine.update_assoc_limits(leaf, limits).unwrap();

        let part = Partition::new("batch");
        let mut desc = JobDesc::new(UserId::new(100));
        desc.min_cpus = Some(16);
        let mut limit_set = LimitSet::default();
        let (ok, reason) = run_validate(&engine, leaf, None, &mut desc, &part, &mut limit_set);
        assert!(!ok);
        assert_eq!(reason, StateReason::WaitAssocGrpCpu);
    }

    #[test]
    fn test_update_pending_job_rederives_time_limit() {
        let (engine, leaf) = engine_with_leaf();
        let qos_id = QosId::new(1);
        let mut qos = QosRecord::new(qos_id, "short");
        qos.limits.max_wall_pj = Some(120);
        engine.add_qos(qos);

        let mut job = JobRecord::new(crate::types::JobId::new(7), UserId::new(100), "physics");
        job.qos = Some(qos_id);
        job.assoc_id = Some(leaf);
        job.details = Some(crate::policy::JobDetails::default());
        job.time_limit = Some(120);
        job.limit_set.time = LimitSetLevel::Policy;

        // The cap drops; re-deriving installs the new limit.
        let mut limits = QosLimits::default();
        limits.max_wall_pj = Some(60);
        engine.update_qos_limits(qos_id, limits).unwrap();

        engine.update_pending_job(&mut job).unwrap();
        assert_eq!(job.time_limit, Some(60));
        assert_eq!(job.limit_set.time, LimitSetLevel::Policy);
        assert!(engine.last_job_update() > 0);

        // The cap disappears entirely; the derived limit and its marker
        // clear together.
        engine.update_qos_limits(qos_id, QosLimits::default()).unwrap();
        engine.update_pending_job(&mut job).unwrap();
        assert_eq!(job.time_limit, None);
        assert_eq!(job.limit_set.time, LimitSetLevel::Unset);

        // With the marker cleared, a user-requested time is carried through
        // re-validation untouched.
        job.time_limit = Some(30);
        engine.update_pending_job(&mut job).unwrap();
        assert_eq!(job.time_limit, Some(30));
        assert_eq!(job.limit_set.time, LimitSetLevel::Unset);
    }

    #[test]
    fn test_update_pending_job_requires_details() {
        let (engine, leaf) = engine_with_leaf();
        let mut job = JobRecord::new(crate::types::JobId::new(7), UserId::new(100), "physics");
        job.assoc_id = Some(leaf);
        assert!(engine.update_pending_job(&mut job).is_err());
    }
}
