#![forbid(unsafe_code)]

use sha2::{Digest, Sha256};
use staffing_kernel_contracts::reconcile::{
    ReconcilePlan, ReconcileSnapshot, ReconciliationReport, RECONCILE_CONTRACT_VERSION,
};
use staffing_kernel_contracts::{ContractViolation, CorrelationId, Validate};

const SNAPSHOT_DIGEST_DOMAIN: &[u8] = b"staffing.reconcile.snapshot.v1";

/// Side-effect-free projection of a checked snapshot into the caller report.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReportBuilder;

impl ReconcileReportBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(
        &self,
        correlation_id: CorrelationId,
        snapshot: &ReconcileSnapshot,
        plan: &ReconcilePlan,
        applied: bool,
    ) -> Result<ReconciliationReport, ContractViolation> {
        let report = ReconciliationReport {
            schema_version: RECONCILE_CONTRACT_VERSION,
            correlation_id,
            total_positions: count_u32(
                "reconciliation_report.total_positions",
                snapshot.positions.len(),
            )?,
            total_allocations: count_u32(
                "reconciliation_report.total_allocations",
                snapshot.allocations.len(),
            )?,
            changes_count: count_u32("reconciliation_report.changes_count", plan.changes.len())?,
            changes: plan.changes.clone(),
            applied: applied && !plan.is_empty(),
            snapshot_digest: snapshot_digest_hex(snapshot),
        };
        report.validate()?;
        Ok(report)
    }
}

fn count_u32(field: &'static str, n: usize) -> Result<u32, ContractViolation> {
    u32::try_from(n).map_err(|_| ContractViolation::InvalidValue {
        field,
        reason: "count exceeds u32",
    })
}

/// SHA-256 over the snapshot rows in ID order, so the digest depends only on
/// row content and not on load order. Every field is length-prefixed.
pub fn snapshot_digest_hex(snapshot: &ReconcileSnapshot) -> String {
    let mut positions: Vec<_> = snapshot.positions.iter().collect();
    positions.sort_by(|a, b| a.position_id.cmp(&b.position_id));
    let mut allocations: Vec<_> = snapshot.allocations.iter().collect();
    allocations.sort_by(|a, b| a.allocation.allocation_id.cmp(&b.allocation.allocation_id));

    let mut hasher = Sha256::new();
    hasher.update(SNAPSHOT_DIGEST_DOMAIN);
    hasher.update((positions.len() as u64).to_le_bytes());
    for p in positions {
        for field in [
            p.position_id.as_str(),
            p.project_id.as_str(),
            p.task_ref.as_str(),
            p.name.as_str(),
            p.month_year.to_string().as_str(),
            p.allocation_mode.as_str(),
            p.loe.normalize().to_string().as_str(),
            p.allocated.as_str(),
        ] {
            update_field(&mut hasher, field);
        }
    }
    hasher.update((allocations.len() as u64).to_le_bytes());
    for a in allocations {
        let r = &a.allocation;
        for field in [
            r.allocation_id.as_str(),
            r.project_id.as_str(),
            r.resource_id.as_str(),
            r.position_id.as_str(),
            r.month_year.to_string().as_str(),
            r.allocation_mode.as_str(),
            r.loe.normalize().to_string().as_str(),
            a.position_project_id.as_ref().map_or("", |p| p.as_str()),
        ] {
            update_field(&mut hasher, field);
        }
    }
    hex_lower(&hasher.finalize())
}

fn update_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
