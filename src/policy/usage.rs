//! Usage mutation: applying lifecycle deltas to the live counters.
//!
//! Every mutation validates the job's association reference (re-binding it if
//! stale), then walks the resolved QoS pair and the association chain up to
//! the root under the WRITE bundle. Decrements saturate at zero with an
//! underflow diagnostic; a finish subtracts exactly what begin added, using
//! the job's own snapshot rather than current configuration.

use tracing::debug;

use crate::policy::assoc::valid_job_assoc;
use crate::policy::qos::QosRecord;
use crate::policy::{JobRecord, PolicyEngine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AdjustKind {
    AddSubmit,
    RemSubmit,
    Begin,
    Fini,
}

/// Decrement with zero clamping; emits the underflow diagnostic.
fn dec_u32(counter: &mut u32, amount: u32, what: &str, scope: &str) {
    if let Some(next) = counter.checked_sub(amount) {
        *counter = next;
    } else {
        *counter = 0;
        debug!("{} underflow for {}", what, scope);
    }
}

/// Decrement with zero clamping; emits the underflow diagnostic.
fn dec_u64(counter: &mut u64, amount: u64, what: &str, scope: &str) {
    if let Some(next) = counter.checked_sub(amount) {
        *counter = next;
    } else {
        *counter = 0;
        debug!("{} underflow for {}", what, scope);
    }
}

fn qos_adjust_limit_usage(
    kind: AdjustKind,
    job: &JobRecord,
    qos: &mut QosRecord,
    node_cnt: u32,
    used_cpu_run_secs: u64,
    job_memory: u64,
) {
    let scope = format!("qos {}", qos.name);
    let user_scope = format!("qos {} user {}", qos.name, job.user_id);

    match kind {
        AdjustKind::AddSubmit => {
            qos.usage.grp_used_submit_jobs += 1;
            qos.usage.user_entry(job.user_id).submit_jobs += 1;
        }
        AdjustKind::RemSubmit => {
            dec_u32(
                &mut qos.usage.grp_used_submit_jobs,
                1,
                "grp_used_submit_jobs",
                &scope,
            );
            dec_u32(
                &mut qos.usage.user_entry(job.user_id).submit_jobs,
                1,
                "submit_jobs",
                &user_scope,
            );
            qos.usage.prune_user(job.user_id);
        }
        AdjustKind::Begin => {
            qos.usage.grp_used_jobs += 1;
            qos.usage.grp_used_cpus += job.total_cpus;
            qos.usage.grp_used_mem += job_memory;
            qos.usage.grp_used_nodes += node_cnt;
            qos.usage.grp_used_cpu_run_secs += used_cpu_run_secs;
            let user = qos.usage.user_entry(job.user_id);
            user.jobs += 1;
            user.cpus += job.total_cpus;
            user.nodes += node_cnt;
        }
        AdjustKind::Fini => {
            dec_u32(&mut qos.usage.grp_used_jobs, 1, "grp_used_jobs", &scope);
            dec_u32(
                &mut qos.usage.grp_used_cpus,
                job.total_cpus,
                "grp_used_cpus",
                &scope,
            );
            dec_u64(&mut qos.usage.grp_used_mem, job_memory, "grp_used_mem", &scope);
            dec_u32(
                &mut qos.usage.grp_used_nodes,
                node_cnt,
                "grp_used_nodes",
                &scope,
            );
            dec_u64(
                &mut qos.usage.grp_used_cpu_run_secs,
                used_cpu_run_secs,
                "grp_used_cpu_run_secs",
                &scope,
            );
            let user = qos.usage.user_entry(job.user_id);
            dec_u32(&mut user.jobs, 1, "jobs", &user_scope);
            dec_u32(&mut user.cpus, job.total_cpus, "cpus", &user_scope);
            dec_u32(&mut user.nodes, node_cnt, "nodes", &user_scope);
            qos.usage.prune_user(job.user_id);
        }
    }
}

pub(crate) fn adjust_limit_usage(engine: &PolicyEngine, kind: AdjustKind, job: &mut JobRecord) {
    if !engine.config.limits {
        return;
    }

    // The priority subsystem sees the finish before the counters move, and
    // outside the write bundle.
    if kind == AdjustKind::Fini {
        engine.priority.job_end(job);
    }

    let used_cpu_run_secs = match kind {
        AdjustKind::Begin | AdjustKind::Fini => {
            u64::from(job.total_cpus) * u64::from(job.time_limit.unwrap_or(0)) * 60
        }
        _ => 0,
    };
    let node_cnt = job.node_cnt;
    let job_memory = job.allocated_memory();

    // Lock bundle: assocs WRITE, qos WRITE, in declaration order.
    let mut assocs = engine.assocs.write();
    let mut qos_tbl = engine.qos.write();

    if !valid_job_assoc(&assocs, job) {
        return;
    }

    let (q1, q2) = qos_tbl.resolve_pair(job.qos, job.partition_qos());
    for qid in [q1, q2].into_iter().flatten() {
        if let Some(qos) = qos_tbl.get_mut(qid) {
            qos_adjust_limit_usage(kind, job, qos, node_cnt, used_cpu_run_secs, job_memory);
        }
    }

    let mut cur = job.assoc_id;
    while let Some(aid) = cur {
        let Some(assoc) = assocs.get_mut(aid) else {
            break;
        };
        let scope = format!("account {}", assoc.acct);
        match kind {
            AdjustKind::AddSubmit => assoc.usage.used_submit_jobs += 1,
            AdjustKind::RemSubmit => dec_u32(
                &mut assoc.usage.used_submit_jobs,
                1,
                "used_submit_jobs",
                &scope,
            ),
            AdjustKind::Begin => {
                assoc.usage.used_jobs += 1;
                assoc.usage.grp_used_cpus += job.total_cpus;
                assoc.usage.grp_used_mem += job_memory;
                assoc.usage.grp_used_nodes += node_cnt;
                assoc.usage.grp_used_cpu_run_secs += used_cpu_run_secs;
                debug!(
                    "job {} began, account {} grp_used_cpu_run_secs is {}",
                    job.id, assoc.acct, assoc.usage.grp_used_cpu_run_secs
                );
            }
            AdjustKind::Fini => {
                dec_u32(&mut assoc.usage.used_jobs, 1, "used_jobs", &scope);
                dec_u32(
                    &mut assoc.usage.grp_used_cpus,
                    job.total_cpus,
                    "grp_used_cpus",
                    &scope,
                );
                dec_u64(
                    &mut assoc.usage.grp_used_mem,
                    job_memory,
                    "grp_used_mem",
                    &scope,
                );
                dec_u32(
                    &mut assoc.usage.grp_used_nodes,
                    node_cnt,
                    "grp_used_nodes",
                    &scope,
                );
                dec_u64(
                    &mut assoc.usage.grp_used_cpu_run_secs,
                    used_cpu_run_secs,
                    "grp_used_cpu_run_secs",
                    &scope,
                );
            }
        }
        cur = assoc.parent;
    }
}

/// Rewrite the cpu-run-seconds contribution of a running job whose time
/// limit changes. No limits are re-validated here: an alter that would now
/// violate a running cap is still applied, the timeout path is the safety
/// net.
pub(crate) fn alter_job(engine: &PolicyEngine, job: &mut JobRecord, new_time_limit: u32) {
    if !job.state.is_running() || job.time_limit == Some(new_time_limit) {
        return;
    }
    if !engine.config.limits {
        return;
    }

    let used_cpu_run_secs =
        u64::from(job.total_cpus) * u64::from(job.time_limit.unwrap_or(0)) * 60;
    let new_used_cpu_run_secs = u64::from(job.total_cpus) * u64::from(new_time_limit) * 60;

    {
        let mut assocs = engine.assocs.write();
        let mut qos_tbl = engine.qos.write();

        if !valid_job_assoc(&assocs, job) {
            return;
        }

        let (q1, q2) = qos_tbl.resolve_pair(job.qos, job.partition_qos());
        for qid in [q1, q2].into_iter().flatten() {
            if let Some(qos) = qos_tbl.get_mut(qid) {
                let scope = format!("qos {}", qos.name);
                dec_u64(
                    &mut qos.usage.grp_used_cpu_run_secs,
                    used_cpu_run_secs,
                    "grp_used_cpu_run_secs",
                    &scope,
                );
                qos.usage.grp_used_cpu_run_secs += new_used_cpu_run_secs;
                debug!(
                    "altering job {}: qos {} now has {} cpu-run-secs ({} removed, {} added)",
                    job.id,
                    qos.name,
                    qos.usage.grp_used_cpu_run_secs,
                    used_cpu_run_secs,
                    new_used_cpu_run_secs
                );
            }
        }

        let mut cur = job.assoc_id;
        while let Some(aid) = cur {
            let Some(assoc) = assocs.get_mut(aid) else {
                break;
            };
            let scope = format!("account {}", assoc.acct);
            dec_u64(
                &mut assoc.usage.grp_used_cpu_run_secs,
                used_cpu_run_secs,
                "grp_used_cpu_run_secs",
                &scope,
            );
            assoc.usage.grp_used_cpu_run_secs += new_used_cpu_run_secs;
            debug!(
                "altering job {}: account {} now has {} cpu-run-secs ({} removed, {} added)",
                job.id,
                assoc.acct,
                assoc.usage.grp_used_cpu_run_secs,
                used_cpu_run_secs,
                new_used_cpu_run_secs
            );
            cur = assoc.parent;
        }
    }

    // The later finish subtracts from the job snapshot, so the record must
    // reflect what the counters now carry.
    job.time_limit = Some(new_time_limit);
    engine.touch_last_job_update();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dec_saturates_at_zero() {
        let mut counter = 2u32;
        dec_u32(&mut counter, 5, "test_counter", "test scope");
        assert_eq!(counter, 0);
        dec_u32(&mut counter, 1, "test_counter", "test scope");
        assert_eq!(counter, 0);

        let mut wide = 10u64;
        dec_u64(&mut wide, 4, "test_counter", "test scope");
        assert_eq!(wide, 6);
        dec_u64(&mut wide, 100, "test_counter", "test scope");
        assert_eq!(wide, 0);
    }
}
