#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use crate::allocation::{AllocationId, AllocationRecord};
use crate::position::{AllocatedFlag, MonthYear, PositionId, PositionRecord, ProjectId};
use crate::{
    ContractViolation, CorrelationId, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate,
};

pub const RECONCILE_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

/// Upper bound on a caller-supplied reconcile timeout (10 minutes).
pub const RECONCILE_MAX_TIMEOUT_MS: u32 = 600_000;

/// Month scope of a reconciliation run. Unbounded runs are an explicit choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonthFilter {
    Months(BTreeSet<MonthYear>),
    AllMonths,
}

impl MonthFilter {
    pub fn months(months: impl IntoIterator<Item = MonthYear>) -> Result<Self, ContractViolation> {
        let set: BTreeSet<MonthYear> = months.into_iter().collect();
        let filter = MonthFilter::Months(set);
        filter.validate()?;
        Ok(filter)
    }

    /// Parses caller month strings; any malformed entry rejects the whole filter.
    pub fn parse_months<S: AsRef<str>>(values: &[S]) -> Result<Self, ContractViolation> {
        let months = values
            .iter()
            .map(|v| MonthYear::parse(v.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::months(months)
    }

    pub fn contains(&self, month: MonthYear) -> bool {
        match self {
            MonthFilter::Months(set) => set.contains(&month),
            MonthFilter::AllMonths => true,
        }
    }

    pub fn is_unbounded(&self) -> bool {
        matches!(self, MonthFilter::AllMonths)
    }
}

impl Validate for MonthFilter {
    fn validate(&self) -> Result<(), ContractViolation> {
        match self {
            MonthFilter::Months(set) if set.is_empty() => Err(ContractViolation::InvalidValue {
                field: "month_filter.months",
                reason: "must not be empty; use AllMonths for an unbounded run",
            }),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Display for MonthFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonthFilter::AllMonths => f.write_str("all"),
            MonthFilter::Months(set) => {
                let joined = set
                    .iter()
                    .map(MonthYear::to_string)
                    .collect::<Vec<_>>()
                    .join(",");
                f.write_str(&joined)
            }
        }
    }
}

/// Defect categories, in evaluation order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum DefectCategory {
    Mismatched,
    Duplicate,
    OrphanedReference,
    FlagOutOfSync,
}

impl DefectCategory {
    pub const ALL: [DefectCategory; 4] = [
        DefectCategory::Mismatched,
        DefectCategory::Duplicate,
        DefectCategory::OrphanedReference,
        DefectCategory::FlagOutOfSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DefectCategory::Mismatched => "mismatched",
            DefectCategory::Duplicate => "duplicate",
            DefectCategory::OrphanedReference => "orphaned_reference",
            DefectCategory::FlagOutOfSync => "flag_out_of_sync",
        }
    }
}

/// An allocation row as seen by the checker, joined with the project of the
/// position it references. `None` means no such position exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotAllocation {
    pub allocation: AllocationRecord,
    pub position_project_id: Option<ProjectId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSnapshot {
    pub positions: Vec<PositionRecord>,
    pub allocations: Vec<SnapshotAllocation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairAction {
    DeleteAllocation {
        category: DefectCategory,
        allocation_id: AllocationId,
        /// Position the row referenced when the snapshot was taken.
        position_id: PositionId,
    },
    SetAllocatedFlag {
        category: DefectCategory,
        position_id: PositionId,
        expected_flag: AllocatedFlag,
        /// Live project-matching links expected once deletions are applied.
        expected_links: u32,
        new_flag: AllocatedFlag,
    },
}

impl RepairAction {
    pub fn category(&self) -> DefectCategory {
        match self {
            RepairAction::DeleteAllocation { category, .. }
            | RepairAction::SetAllocatedFlag { category, .. } => *category,
        }
    }

    pub fn position_id(&self) -> &PositionId {
        match self {
            RepairAction::DeleteAllocation { position_id, .. }
            | RepairAction::SetAllocatedFlag { position_id, .. } => position_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileChange {
    pub category: DefectCategory,
    pub position_id: PositionId,
    pub position_name: Option<String>,
    pub allocation_id: Option<AllocationId>,
    pub detail: String,
    pub reason_code: ReasonCodeId,
}

/// Checker output: `actions[i]` is described by `changes[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub actions: Vec<RepairAction>,
    pub changes: Vec<ReconcileChange>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn push(&mut self, action: RepairAction, change: ReconcileChange) {
        self.actions.push(action);
        self.changes.push(change);
    }
}

impl Validate for ReconcilePlan {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.actions.len() != self.changes.len() {
            return Err(ContractViolation::InvalidValue {
                field: "reconcile_plan.changes",
                reason: "must be parallel to actions",
            });
        }
        for (action, change) in self.actions.iter().zip(&self.changes) {
            if action.category() != change.category || action.position_id() != &change.position_id
            {
                return Err(ContractViolation::InvalidValue {
                    field: "reconcile_plan.changes",
                    reason: "change must describe its action",
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileRequest {
    pub schema_version: SchemaVersion,
    pub correlation_id: CorrelationId,
    pub now: MonotonicTimeNs,
    pub month_filter: MonthFilter,
    pub dry_run: bool,
    pub timeout_ms: Option<u32>,
}

impl ReconcileRequest {
    pub fn v1(
        correlation_id: CorrelationId,
        now: MonotonicTimeNs,
        month_filter: MonthFilter,
        dry_run: bool,
        timeout_ms: Option<u32>,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: RECONCILE_CONTRACT_VERSION,
            correlation_id,
            now,
            month_filter,
            dry_run,
            timeout_ms,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for ReconcileRequest {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != RECONCILE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "reconcile_request.schema_version",
                reason: "must match RECONCILE_CONTRACT_VERSION",
            });
        }
        self.month_filter.validate()?;
        if let Some(ms) = self.timeout_ms {
            if ms == 0 || ms > RECONCILE_MAX_TIMEOUT_MS {
                return Err(ContractViolation::InvalidRange {
                    field: "reconcile_request.timeout_ms",
                    min: 1.0,
                    max: RECONCILE_MAX_TIMEOUT_MS as f64,
                    got: ms as f64,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub schema_version: SchemaVersion,
    pub correlation_id: CorrelationId,
    pub total_positions: u32,
    pub total_allocations: u32,
    pub changes_count: u32,
    pub changes: Vec<ReconcileChange>,
    /// False for dry runs and for runs with nothing to repair.
    pub applied: bool,
    pub snapshot_digest: String,
}

impl ReconciliationReport {
    pub fn count_for(&self, category: DefectCategory) -> usize {
        self.changes
            .iter()
            .filter(|c| c.category == category)
            .count()
    }
}

impl Validate for ReconciliationReport {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != RECONCILE_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "reconciliation_report.schema_version",
                reason: "must match RECONCILE_CONTRACT_VERSION",
            });
        }
        if self.changes_count as usize != self.changes.len() {
            return Err(ContractViolation::InvalidValue {
                field: "reconciliation_report.changes_count",
                reason: "must equal number of changes",
            });
        }
        if self.applied && self.changes.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "reconciliation_report.applied",
                reason: "an empty run applies nothing",
            });
        }
        if self.snapshot_digest.len() != 64
            || !self.snapshot_digest.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(ContractViolation::InvalidValue {
                field: "reconciliation_report.snapshot_digest",
                reason: "must be 64 hex chars",
            });
        }
        Ok(())
    }
}
