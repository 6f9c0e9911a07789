//! Timeout evaluation for running jobs.
//!
//! A read-only periodic scan: a running job times out once a time-based
//! group or per-job cap is exhausted. Under safe mode this never fires,
//! since safe mode already refused any job that could not finish within the
//! remaining budget. A QoS cap trumps the association's: an association wall
//! of 10 minutes under a QoS wall of 20 lets an 11-minute job keep running.

use chrono::Utc;
use tracing::info;

use crate::policy::qos::{QosLimits, QosRecord};
use crate::policy::types::{JobRecord, StateReason};
use crate::policy::PolicyEngine;
use crate::tres::TresId;

fn qos_job_time_out(
    job: &mut JobRecord,
    qos: &QosRecord,
    claimed: &mut QosLimits,
    job_cpu_usage_mins: u64,
) -> bool {
    let usage_mins = (qos.usage.usage_raw / 60.0) as u64;
    let wall_mins = (qos.usage.grp_used_wall / 60.0) as u64;

    if claimed.grp_cpu_mins.is_none() {
        if let Some(cap) = qos.limits.grp_cpu_mins {
            claimed.grp_cpu_mins = Some(cap);
            if usage_mins >= cap {
                info!(
                    "job {} timed out, at or exceeds qos {} group max cpu \
                     minutes of {} with {}",
                    job.id, qos.name, cap, usage_mins
                );
                job.set_state_reason(StateReason::FailTimeout);
                return false;
            }
        }
    }

    if claimed.grp_wall.is_none() {
        if let Some(cap) = qos.limits.grp_wall {
            claimed.grp_wall = Some(cap);
            if wall_mins >= u64::from(cap) {
                info!(
                    "job {} timed out, at or exceeds qos {} group wall limit \
                     of {} with {}",
                    job.id, qos.name, cap, wall_mins
                );
                job.set_state_reason(StateReason::FailTimeout);
                return false;
            }
        }
    }

    if claimed.max_cpu_mins_pj.is_none() {
        if let Some(cap) = qos.limits.max_cpu_mins_pj {
            claimed.max_cpu_mins_pj = Some(cap);
            if job_cpu_usage_mins >= cap {
                info!(
                    "job {} timed out, at or exceeds qos {} max cpu minutes \
                     of {} with {}",
                    job.id, qos.name, cap, job_cpu_usage_mins
                );
                job.set_state_reason(StateReason::FailTimeout);
                return false;
            }
        }
    }

    true
}

pub(crate) fn job_time_out(engine: &PolicyEngine, job: &mut JobRecord) -> bool {
    // Safe mode refuses unfinishable jobs at start, so there is nothing to
    // kill at runtime.
    if !engine.config.limits || engine.config.safe {
        return false;
    }

    let Some(start_time) = job.start_time else {
        return false;
    };

    // Lock bundle: assocs READ, qos READ.
    let assocs = engine.assocs.read();
    let qos_tbl = engine.qos.read();

    let now = Utc::now();
    let run_secs = ((now - start_time).num_seconds() - job.suspended_secs).max(0);
    let job_cpu_usage_mins = (run_secs / 60) as u64 * u64::from(job.total_cpus);

    let (q1, q2) = qos_tbl.resolve_pair(job.qos, job.partition_qos());
    let mut claimed = QosLimits::default();
    let mut timed_out = false;

    for qid in [q1, q2].into_iter().flatten() {
        if let Some(qos) = qos_tbl.get(qid) {
            if !qos_job_time_out(job, qos, &mut claimed, job_cpu_usage_mins) {
                timed_out = true;
                break;
            }
        }
    }

    if !timed_out {
        let root = assocs.root();
        let mut cur = job.assoc_id;
        while let Some(aid) = cur {
            let Some(assoc) = assocs.get(aid) else {
                break;
            };
            let usage_mins = (assoc.usage.usage_raw / 60.0) as u64;
            let wall_mins = (assoc.usage.grp_used_wall / 60.0) as u64;

            if claimed.grp_cpu_mins.is_none() {
                if let Some(cap) = assoc.ctld.grp_tres_mins.get(TresId::Cpu) {
                    if usage_mins >= cap {
                        info!(
                            "job {} timed out, assoc {} is at or exceeds group \
                             max cpu minutes limit {} with {} for account {}",
                            job.id, assoc.id, cap, usage_mins, assoc.acct
                        );
                        job.set_state_reason(StateReason::FailTimeout);
                        timed_out = true;
                        break;
                    }
                }
            }

            if claimed.grp_wall.is_none() {
                if let Some(cap) = assoc.ctld.grp_wall {
                    if wall_mins >= u64::from(cap) {
                        info!(
                            "job {} timed out, assoc {} is at or exceeds group \
                             wall limit {} with {} for account {}",
                            job.id, assoc.id, cap, wall_mins, assoc.acct
                        );
                        job.set_state_reason(StateReason::FailTimeout);
                        timed_out = true;
                        break;
                    }
                }
            }

            if claimed.max_cpu_mins_pj.is_none() {
                if let Some(cap) = assoc.ctld.max_tres_mins_pj.get(TresId::Cpu) {
                    if job_cpu_usage_mins >= cap {
                        info!(
                            "job {} timed out, assoc {} is at or exceeds max \
                             cpu minutes limit {} with {} for account {}",
                            job.id, assoc.id, cap, job_cpu_usage_mins, assoc.acct
                        );
                        job.set_state_reason(StateReason::FailTimeout);
                        timed_out = true;
                        break;
                    }
                }
            }

            cur = assoc.parent;
            // These limits never apply to the root association.
            if cur == Some(root) {
                break;
            }
        }
    }

    if timed_out {
        engine.touch_last_job_update();
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AssocRecord, JobDetails, PolicyEngine, QosRecord};
    use crate::types::{AssocId, EnforceConfig, JobId, QosId, UserId};
    use chrono::Duration;

    fn engine_with_qos(config: EnforceConfig) -> (PolicyEngine, QosId, AssocId) {
        let engine = PolicyEngine::new(config);
        let qos_id = QosId::new(1);
        engine.add_qos(QosRecord::new(qos_id, "normal"));

        let leaf = AssocId::new(11);
        let mut rec = AssocRecord::new(leaf, "physics", Some(engine.root_assoc()));
        rec.user = Some(UserId::new(100));
        engine.add_association(rec).unwrap();

        (engine, qos_id, leaf)
    }

    fn long_running_job(qos_id: QosId, leaf: AssocId, cpus: u32, run_mins: i64) -> JobRecord {
        let mut job = JobRecord::new(JobId::new(1), UserId::new(100), "physics");
        job.qos = Some(qos_id);
        job.assoc_id = Some(leaf);
        job.state = crate::policy::JobState::Running;
        job.details = Some(JobDetails::default());
        job.total_cpus = cpus;
        job.node_cnt = 1;
        job.start_time = Some(Utc::now() - Duration::minutes(run_mins));
        job
    }

    #[test]
    fn test_timeout_on_qos_grp_cpu_mins() {
        let (engine, qos_id, leaf) = engine_with_qos(EnforceConfig::limits());
        let mut limits = crate::policy::QosLimits::default();
        limits.grp_cpu_mins = Some(100);
        engine.update_qos_limits(qos_id, limits).unwrap();
        engine.set_qos_historical(qos_id, 101.0 * 60.0, 0.0).unwrap();

        let mut job = long_running_job(qos_id, leaf, 2, 5);
        assert!(engine.job_time_out(&mut job));
        assert_eq!(job.state_reason, StateReason::FailTimeout);
        assert!(engine.last_job_update() > 0);
    }

    #[test]
    fn test_timeout_on_per_job_cpu_mins() {
        let (engine, qos_id, leaf) = engine_with_qos(EnforceConfig::limits());
        let mut limits = crate::policy::QosLimits::default();
        limits.max_cpu_mins_pj = Some(100);
        engine.update_qos_limits(qos_id, limits).unwrap();

        // 4 cpus running for 30 minutes = 120 cpu-minutes consumed.
        let mut job = long_running_job(qos_id, leaf, 4, 30);
        assert!(engine.job_time_out(&mut job));
        assert_eq!(job.state_reason, StateReason::FailTimeout);

        // Suspended time does not count against the job.
        let mut suspended = long_running_job(qos_id, leaf, 4, 30);
        suspended.suspended_secs = 20 * 60;
        assert!(!engine.job_time_out(&mut suspended));
    }

    #[test]
    fn test_safe_mode_suppresses_timeout() {
        let (engine, qos_id, leaf) = engine_with_qos(EnforceConfig::safe());
        let mut limits = crate::policy::QosLimits::default();
        limits.grp_cpu_mins = Some(100);
        engine.update_qos_limits(qos_id, limits).unwrap();
        engine.set_qos_historical(qos_id, 500.0 * 60.0, 0.0).unwrap();

        let mut job = long_running_job(qos_id, leaf, 2, 5);
        assert!(!engine.job_time_out(&mut job));
        assert_eq!(job.state_reason, StateReason::WaitNoReason);
    }

    #[test]
    fn test_qos_cap_trumps_assoc_cap() {
        // The association wall budget is spent, but the governing QoS still
        // has headroom; the job keeps running.
        let (engine, qos_id, leaf) = engine_with_qos(EnforceConfig::limits());
        let mut qos_limits = crate::policy::QosLimits::default();
        qos_limits.grp_wall = Some(20);
        engine.update_qos_limits(qos_id, qos_limits).unwrap();
        engine.set_qos_historical(qos_id, 0.0, 11.0 * 60.0).unwrap();

        let mut assoc_limits = crate::policy::AssocLimits::default();
        assoc_limits.grp_wall = Some(10);
        engine.update_assoc_limits(leaf, assoc_limits).unwrap();
        engine.set_assoc_historical(leaf, 0.0, 11.0 * 60.0).unwrap();

        let mut job = long_running_job(qos_id, leaf, 1, 11);
        assert!(!engine.job_time_out(&mut job));

        // Without the QoS claim, the association wall cap fires.
        let mut unqualified = long_running_job(qos_id, leaf, 1, 11);
        unqualified.qos = None;
        assert!(engine.job_time_out(&mut unqualified));
        assert_eq!(unqualified.state_reason, StateReason::FailTimeout);
    }

    #[test]
    fn test_root_assoc_excluded_from_timeout() {
        let (engine, qos_id, leaf) = engine_with_qos(EnforceConfig::limits());
        let root = engine.root_assoc();
        let mut root_limits = crate::policy::AssocLimits::default();
        root_limits.grp_wall = Some(1);
        engine.update_assoc_limits(root, root_limits).unwrap();
        engine.set_assoc_historical(root, 0.0, 600.0 * 60.0).unwrap();

        let mut job = long_running_job(qos_id, leaf, 1, 30);
        assert!(!engine.job_time_out(&mut job));
    }
}
