#![forbid(unsafe_code)]

use staffing_kernel_contracts::allocation::AllocationId;
use staffing_kernel_contracts::position::PositionId;
use staffing_kernel_contracts::reconcile::{DefectCategory, ReconcilePlan, RepairAction};
use staffing_storage::repo::ReconcileTxRepo;
use staffing_storage::store::StorageError;
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RepairOutcome {
    pub allocations_deleted: usize,
    pub flags_updated: usize,
}

/// A repair write that failed, tagged with the category being repaired.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{} repair failed: {source}", .category.as_str())]
pub struct RepairFailure {
    pub category: DefectCategory,
    #[source]
    pub source: StorageError,
}

impl RepairFailure {
    pub fn is_stale_row(&self) -> bool {
        matches!(self.source, StorageError::StaleRow { .. })
    }
}

/// Applies a checked plan inside the caller's open transaction: deletions
/// first, one batch per category, then flag updates. Every write is
/// re-validated by the store against the pre-state captured in the action.
#[derive(Debug, Default, Clone)]
pub struct RepairExecutor;

impl RepairExecutor {
    pub fn apply<R: ReconcileTxRepo + ?Sized>(
        &self,
        repo: &mut R,
        plan: &ReconcilePlan,
    ) -> Result<RepairOutcome, RepairFailure> {
        let mut outcome = RepairOutcome::default();

        for category in DefectCategory::ALL {
            let batch: Vec<(AllocationId, PositionId)> = plan
                .actions
                .iter()
                .filter_map(|a| match a {
                    RepairAction::DeleteAllocation {
                        category: c,
                        allocation_id,
                        position_id,
                    } if *c == category => Some((allocation_id.clone(), position_id.clone())),
                    _ => None,
                })
                .collect();
            if batch.is_empty() {
                continue;
            }
            let n = repo
                .reconcile_delete_allocation_rows(&batch)
                .map_err(|source| RepairFailure { category, source })?;
            debug!(category = category.as_str(), deleted = n, "repair delete batch applied");
            outcome.allocations_deleted += n;
        }

        for action in &plan.actions {
            if let RepairAction::SetAllocatedFlag {
                category,
                position_id,
                expected_flag,
                expected_links,
                new_flag,
            } = action
            {
                repo.reconcile_set_allocated_flag_row(
                    position_id,
                    *expected_flag,
                    *expected_links,
                    *new_flag,
                )
                .map_err(|source| RepairFailure {
                    category: *category,
                    source,
                })?;
                outcome.flags_updated += 1;
            }
        }
        if outcome.flags_updated > 0 {
            debug!(updated = outcome.flags_updated, "repair flag updates applied");
        }

        Ok(outcome)
    }
}
