#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use staffing_engines::reconcile_check::{reason_codes, ReconcileCheckConfig, ReconcileCheckRuntime};
use staffing_engines::reconcile_report::ReconcileReportBuilder;
use staffing_kernel_contracts::reconcile::{
    DefectCategory, ReconcileRequest, ReconciliationReport, RECONCILE_MAX_TIMEOUT_MS,
};
use staffing_kernel_contracts::{ContractViolation, CorrelationId, Validate};
use staffing_storage::repo::ReconcileTxRepo;
use staffing_storage::store::StorageError;
use tracing::{debug, info, warn};

use crate::repair::{RepairExecutor, RepairFailure};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("invalid argument: {0}")]
    InvalidArgument(ContractViolation),
    #[error("store unavailable: {source}")]
    StoreUnavailable {
        #[source]
        source: StorageError,
    },
    #[error("{} repair failed, run rolled back: {source}", .category.map_or("commit", |c| c.as_str()))]
    PartialFailure {
        /// `None` when the commit itself failed.
        category: Option<DefectCategory>,
        #[source]
        source: StorageError,
    },
    #[error("row changed during {} repair, run rolled back: {source}", .category.as_str())]
    ConcurrentModification {
        category: DefectCategory,
        #[source]
        source: StorageError,
    },
    #[error("reconcile exceeded {timeout_ms} ms after {phase} phase, run rolled back")]
    Timeout {
        phase: &'static str,
        timeout_ms: u32,
    },
}

impl ReconcileError {
    pub fn kind(&self) -> &'static str {
        match self {
            ReconcileError::InvalidArgument(_) => "invalid_argument",
            ReconcileError::StoreUnavailable { .. } => "store_unavailable",
            ReconcileError::PartialFailure { .. } => "partial_failure",
            ReconcileError::ConcurrentModification { .. } => "concurrent_modification",
            ReconcileError::Timeout { .. } => "timeout",
        }
    }

    /// Every failure except a bad request leaves the store as it was, so the
    /// caller may simply run again.
    pub fn retryable(&self) -> bool {
        !matches!(self, ReconcileError::InvalidArgument(_))
    }
}

impl From<RepairFailure> for ReconcileError {
    fn from(f: RepairFailure) -> Self {
        if f.is_stale_row() {
            ReconcileError::ConcurrentModification {
                category: f.category,
                source: f.source,
            }
        } else {
            ReconcileError::PartialFailure {
                category: Some(f.category),
                source: f.source,
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileRuntimeConfig {
    /// Deadline applied when the request carries none.
    pub default_timeout_ms: u32,
    pub check: ReconcileCheckConfig,
}

impl ReconcileRuntimeConfig {
    pub fn mvp_v1() -> Self {
        Self {
            default_timeout_ms: 30_000,
            check: ReconcileCheckConfig::mvp_v1(),
        }
    }
}

/// Reconciler: begin -> snapshot -> check -> repair -> report -> commit, all
/// inside one store transaction. Any failure rolls the whole run back.
#[derive(Debug, Clone)]
pub struct ReconcileRuntime {
    config: ReconcileRuntimeConfig,
    checker: ReconcileCheckRuntime,
    reporter: ReconcileReportBuilder,
    executor: RepairExecutor,
}

struct Deadline {
    started: Instant,
    limit: Duration,
    timeout_ms: u32,
}

impl Deadline {
    fn check(&self, phase: &'static str) -> Result<(), ReconcileError> {
        if self.started.elapsed() > self.limit {
            return Err(ReconcileError::Timeout {
                phase,
                timeout_ms: self.timeout_ms,
            });
        }
        Ok(())
    }
}

impl ReconcileRuntime {
    pub fn new(config: ReconcileRuntimeConfig) -> Self {
        Self {
            checker: ReconcileCheckRuntime::new(config.check),
            reporter: ReconcileReportBuilder::new(),
            executor: RepairExecutor,
            config,
        }
    }

    pub fn run<R: ReconcileTxRepo + ?Sized>(
        &self,
        repo: &mut R,
        req: &ReconcileRequest,
    ) -> Result<ReconciliationReport, ReconcileError> {
        req.validate().map_err(ReconcileError::InvalidArgument)?;

        let timeout_ms = req
            .timeout_ms
            .unwrap_or(self.config.default_timeout_ms)
            .clamp(1, RECONCILE_MAX_TIMEOUT_MS);
        let deadline = Deadline {
            started: Instant::now(),
            limit: Duration::from_millis(u64::from(timeout_ms)),
            timeout_ms,
        };

        info!(
            correlation_id = req.correlation_id.0,
            months = %req.month_filter,
            dry_run = req.dry_run,
            timeout_ms,
            "reconcile started"
        );

        repo.reconcile_begin_row()
            .map_err(|source| ReconcileError::StoreUnavailable { source })?;

        match self.run_in_transaction(repo, req, &deadline) {
            Ok(report) => {
                let finish = if report.applied {
                    repo.reconcile_commit_row()
                } else {
                    repo.reconcile_rollback_row()
                };
                if let Err(source) = finish {
                    self.rollback(repo, req.correlation_id);
                    warn!(
                        correlation_id = req.correlation_id.0,
                        error = %source,
                        "reconcile commit failed"
                    );
                    return Err(ReconcileError::PartialFailure {
                        category: None,
                        source,
                    });
                }
                info!(
                    correlation_id = req.correlation_id.0,
                    total_positions = report.total_positions,
                    total_allocations = report.total_allocations,
                    changes = report.changes_count,
                    applied = report.applied,
                    snapshot_digest = %report.snapshot_digest,
                    "reconcile finished"
                );
                Ok(report)
            }
            Err(err) => {
                self.rollback(repo, req.correlation_id);
                warn!(
                    correlation_id = req.correlation_id.0,
                    kind = err.kind(),
                    error = %err,
                    "reconcile rolled back"
                );
                Err(err)
            }
        }
    }

    fn run_in_transaction<R: ReconcileTxRepo + ?Sized>(
        &self,
        repo: &mut R,
        req: &ReconcileRequest,
        deadline: &Deadline,
    ) -> Result<ReconciliationReport, ReconcileError> {
        deadline.check("begin")?;

        let snapshot = repo
            .reconcile_snapshot_rows(&req.month_filter)
            .map_err(|source| ReconcileError::StoreUnavailable { source })?;
        debug!(
            correlation_id = req.correlation_id.0,
            positions = snapshot.positions.len(),
            allocations = snapshot.allocations.len(),
            "reconcile snapshot loaded"
        );
        deadline.check("snapshot")?;

        let plan = self.checker.check(&snapshot).map_err(|v| {
            warn!(
                correlation_id = req.correlation_id.0,
                reason_code = reason_codes::RECONCILE_SNAPSHOT_BUDGET_EXCEEDED.0,
                "reconcile check refused snapshot"
            );
            ReconcileError::InvalidArgument(v)
        })?;
        for category in DefectCategory::ALL {
            let n = plan
                .actions
                .iter()
                .filter(|a| a.category() == category)
                .count();
            if n > 0 {
                info!(
                    correlation_id = req.correlation_id.0,
                    category = category.as_str(),
                    actions = n,
                    "reconcile defects found"
                );
            }
        }
        deadline.check("check")?;

        let apply = !req.dry_run && !plan.is_empty();
        if apply {
            let outcome = self.executor.apply(repo, &plan)?;
            info!(
                correlation_id = req.correlation_id.0,
                allocations_deleted = outcome.allocations_deleted,
                flags_updated = outcome.flags_updated,
                "reconcile repairs applied"
            );
            deadline.check("repair")?;
        }

        let report = self
            .reporter
            .build(req.correlation_id, &snapshot, &plan, apply)
            .map_err(ReconcileError::InvalidArgument)?;
        deadline.check("report")?;
        Ok(report)
    }

    fn rollback<R: ReconcileTxRepo + ?Sized>(&self, repo: &mut R, correlation_id: CorrelationId) {
        if let Err(e) = repo.reconcile_rollback_row() {
            warn!(correlation_id = correlation_id.0, error = %e, "reconcile rollback failed");
        }
    }
}
