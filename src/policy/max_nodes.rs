//! Tightest node-count cap query.
//!
//! Merges the QoS pair (primary fields win, secondary fills gaps), then
//! walks the association chain for caps the QoS left unconstrained. The
//! answer carries the reason code identifying which limit won.

use crate::policy::qos::opt_lt;
use crate::policy::types::{JobRecord, StateReason};
use crate::policy::PolicyEngine;

/// Result of [`PolicyEngine::max_nodes`]: the tightest applicable cap, and
/// the limit that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxNodes {
    /// `None` means no cap applies.
    pub limit: Option<u32>,
    pub reason: Option<StateReason>,
}

impl MaxNodes {
    const UNLIMITED: MaxNodes = MaxNodes {
        limit: None,
        reason: None,
    };
}

pub(crate) fn max_nodes(engine: &PolicyEngine, job: &JobRecord) -> MaxNodes {
    if !engine.config.limits {
        return MaxNodes::UNLIMITED;
    }

    // Lock bundle: assocs READ, qos READ.
    let assocs = engine.assocs.read();
    let qos_tbl = engine.qos.read();

    let (q1, q2) = qos_tbl.resolve_pair(job.qos, job.partition_qos());

    let mut limit: Option<u32> = None;
    let mut reason: Option<StateReason> = None;
    let mut qos_max_per_limit: Option<u32> = None;
    let mut qos_grp_nodes: Option<u32> = None;

    if let Some(first) = q1.and_then(|id| qos_tbl.get(id)) {
        let mut max_nodes_pj = first.limits.max_nodes_pj;
        let mut max_nodes_pu = first.limits.max_nodes_pu;
        let mut grp_nodes = first.limits.grp_nodes;
        if let Some(second) = q2.and_then(|id| qos_tbl.get(id)) {
            max_nodes_pj = max_nodes_pj.or(second.limits.max_nodes_pj);
            max_nodes_pu = max_nodes_pu.or(second.limits.max_nodes_pu);
            grp_nodes = grp_nodes.or(second.limits.grp_nodes);
        }

        if opt_lt(max_nodes_pj, max_nodes_pu) {
            limit = max_nodes_pj;
            reason = Some(StateReason::WaitQosMaxNodePerJob);
        } else if max_nodes_pu.is_some() {
            limit = max_nodes_pu;
            reason = Some(StateReason::WaitQosMaxNodePerUser);
        }
        qos_max_per_limit = limit;

        if opt_lt(grp_nodes, limit) {
            limit = grp_nodes;
            reason = Some(StateReason::WaitQosGrpNodes);
        }
        qos_grp_nodes = grp_nodes;
    }

    // Every association must be traversed: the QoS might not override a
    // particular limit.
    let mut cur = job.assoc_id;
    let mut parent = false;
    let mut grp_set = false;
    while let Some(aid) = cur {
        let Some(assoc) = assocs.get(aid) else {
            break;
        };

        if (q1.is_none() || qos_grp_nodes.is_none())
            && assoc.ctld.grp_nodes.is_some()
            && opt_lt(assoc.ctld.grp_nodes, limit)
        {
            limit = assoc.ctld.grp_nodes;
            reason = Some(StateReason::WaitAssocGrpNodes);
            grp_set = true;
        }

        if !parent
            && qos_max_per_limit.is_none()
            && assoc.ctld.max_nodes_pj.is_some()
            && opt_lt(assoc.ctld.max_nodes_pj, limit)
        {
            limit = assoc.ctld.max_nodes_pj;
            reason = Some(StateReason::WaitAssocMaxNodePerJob);
        }

        // The first group cap hit in the walk wins, stop there.
        if grp_set {
            break;
        }

        cur = assoc.parent;
        parent = true;
    }

    MaxNodes { limit, reason }
}
