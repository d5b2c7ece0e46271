#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use staffing_kernel_contracts::position::{AllocatedFlag, PositionId, PositionRecord};
use staffing_kernel_contracts::reconcile::{
    DefectCategory, ReconcileChange, ReconcilePlan, ReconcileSnapshot, RepairAction,
    SnapshotAllocation,
};
use staffing_kernel_contracts::{ContractViolation, ReasonCodeId, Validate};

pub mod reason_codes {
    use staffing_kernel_contracts::ReasonCodeId;

    // Reconcile reason-code namespace ("RC").
    pub const RECONCILE_MISMATCHED_PROJECT: ReasonCodeId = ReasonCodeId(0x5243_0001);
    pub const RECONCILE_DUPLICATE_ALLOCATION: ReasonCodeId = ReasonCodeId(0x5243_0002);
    pub const RECONCILE_DUPLICATE_FLAG_RESET: ReasonCodeId = ReasonCodeId(0x5243_0003);
    pub const RECONCILE_ORPHANED_REFERENCE: ReasonCodeId = ReasonCodeId(0x5243_0004);
    pub const RECONCILE_FLAG_SET_YES: ReasonCodeId = ReasonCodeId(0x5243_0005);
    pub const RECONCILE_FLAG_SET_NO: ReasonCodeId = ReasonCodeId(0x5243_0006);

    pub const RECONCILE_SNAPSHOT_BUDGET_EXCEEDED: ReasonCodeId = ReasonCodeId(0x5243_00F1);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileCheckConfig {
    /// Positions plus allocations a single run may classify.
    pub max_snapshot_rows: u32,
}

impl ReconcileCheckConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_snapshot_rows: 1_000_000,
        }
    }
}

/// Pure invariant checker. Given a closed snapshot it returns the repair
/// actions that restore I1, in category order, with one change record per
/// action.
#[derive(Debug, Clone)]
pub struct ReconcileCheckRuntime {
    config: ReconcileCheckConfig,
}

impl ReconcileCheckRuntime {
    pub fn new(config: ReconcileCheckConfig) -> Self {
        Self { config }
    }

    pub fn check(&self, snapshot: &ReconcileSnapshot) -> Result<ReconcilePlan, ContractViolation> {
        let rows = snapshot.positions.len() + snapshot.allocations.len();
        if rows > self.config.max_snapshot_rows as usize {
            return Err(ContractViolation::InvalidRange {
                field: "reconcile_snapshot.rows",
                min: 0.0,
                max: f64::from(self.config.max_snapshot_rows),
                got: rows as f64,
            });
        }

        let positions: BTreeMap<&PositionId, &PositionRecord> = snapshot
            .positions
            .iter()
            .map(|p| (&p.position_id, p))
            .collect();
        let mut allocations: Vec<&SnapshotAllocation> = snapshot.allocations.iter().collect();
        allocations.sort_by(|a, b| a.allocation.allocation_id.cmp(&b.allocation.allocation_id));

        let mut plan = ReconcilePlan::default();

        // Mismatched: the referenced position exists under another project.
        let mut orphans = Vec::new();
        let mut survivors: BTreeMap<&PositionId, Vec<&SnapshotAllocation>> = BTreeMap::new();
        for a in allocations {
            let position_project = positions
                .get(&a.allocation.position_id)
                .map(|p| &p.project_id)
                .or(a.position_project_id.as_ref());
            match position_project {
                None => orphans.push(a),
                Some(project) if *project != a.allocation.project_id => {
                    let detail = format!(
                        "allocation {} belongs to project {} but position {} belongs to project {}",
                        a.allocation.allocation_id,
                        a.allocation.project_id,
                        a.allocation.position_id,
                        project
                    );
                    push_delete(
                        &mut plan,
                        &positions,
                        a,
                        DefectCategory::Mismatched,
                        reason_codes::RECONCILE_MISMATCHED_PROJECT,
                        detail,
                    );
                }
                Some(_) => survivors
                    .entry(&a.allocation.position_id)
                    .or_default()
                    .push(a),
            }
        }

        // Duplicate: every surviving link of an over-linked position goes.
        let mut reset: BTreeSet<&PositionId> = BTreeSet::new();
        for (position_id, links) in survivors.iter().filter(|(_, v)| v.len() > 1) {
            for a in links {
                let detail = format!(
                    "position {} is referenced by {} allocations; deleting {}",
                    position_id,
                    links.len(),
                    a.allocation.allocation_id
                );
                push_delete(
                    &mut plan,
                    &positions,
                    a,
                    DefectCategory::Duplicate,
                    reason_codes::RECONCILE_DUPLICATE_ALLOCATION,
                    detail,
                );
            }
            reset.insert(*position_id);
            if let Some(p) = positions.get(position_id) {
                if p.allocated != AllocatedFlag::No {
                    push_flag(
                        &mut plan,
                        p,
                        DefectCategory::Duplicate,
                        0,
                        AllocatedFlag::No,
                        reason_codes::RECONCILE_DUPLICATE_FLAG_RESET,
                    );
                }
            }
        }

        // Orphaned reference: no such position anywhere in the store.
        for a in orphans {
            let detail = format!(
                "allocation {} references missing position {}",
                a.allocation.allocation_id, a.allocation.position_id
            );
            push_delete(
                &mut plan,
                &positions,
                a,
                DefectCategory::OrphanedReference,
                reason_codes::RECONCILE_ORPHANED_REFERENCE,
                detail,
            );
        }

        // Flag out of sync, against what survives the deletions above.
        for (position_id, p) in &positions {
            if reset.contains(position_id) {
                continue;
            }
            let links = survivors.get(position_id).map_or(0, Vec::len);
            let want = AllocatedFlag::for_link_count(links);
            if p.allocated != want {
                let reason_code = match want {
                    AllocatedFlag::Yes => reason_codes::RECONCILE_FLAG_SET_YES,
                    AllocatedFlag::No => reason_codes::RECONCILE_FLAG_SET_NO,
                };
                push_flag(
                    &mut plan,
                    p,
                    DefectCategory::FlagOutOfSync,
                    links as u32,
                    want,
                    reason_code,
                );
            }
        }

        plan.validate()?;
        Ok(plan)
    }
}

fn push_delete(
    plan: &mut ReconcilePlan,
    positions: &BTreeMap<&PositionId, &PositionRecord>,
    a: &SnapshotAllocation,
    category: DefectCategory,
    reason_code: ReasonCodeId,
    detail: String,
) {
    let position_id = a.allocation.position_id.clone();
    plan.push(
        RepairAction::DeleteAllocation {
            category,
            allocation_id: a.allocation.allocation_id.clone(),
            position_id: position_id.clone(),
        },
        ReconcileChange {
            category,
            position_name: positions.get(&position_id).map(|p| p.name.clone()),
            position_id,
            allocation_id: Some(a.allocation.allocation_id.clone()),
            detail,
            reason_code,
        },
    );
}

fn push_flag(
    plan: &mut ReconcilePlan,
    p: &PositionRecord,
    category: DefectCategory,
    expected_links: u32,
    new_flag: AllocatedFlag,
    reason_code: ReasonCodeId,
) {
    let detail = match category {
        DefectCategory::Duplicate => format!(
            "position {} had duplicate allocations; Allocated {} -> {}",
            p.position_id, p.allocated, new_flag
        ),
        _ => format!(
            "position {} has {} valid allocation(s); Allocated {} -> {}",
            p.position_id, expected_links, p.allocated, new_flag
        ),
    };
    plan.push(
        RepairAction::SetAllocatedFlag {
            category,
            position_id: p.position_id.clone(),
            expected_flag: p.allocated,
            expected_links,
            new_flag,
        },
        ReconcileChange {
            category,
            position_id: p.position_id.clone(),
            position_name: Some(p.name.clone()),
            allocation_id: None,
            detail,
            reason_code,
        },
    );
}
