#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use staffing_kernel_contracts::allocation::{AllocationId, AllocationRecord};
use staffing_kernel_contracts::position::{AllocatedFlag, PositionId, PositionRecord};
use staffing_kernel_contracts::reconcile::{MonthFilter, ReconcileSnapshot, SnapshotAllocation};
use staffing_kernel_contracts::{ContractViolation, Validate};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("foreign key violation on {table}: {key}")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("duplicate key on {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    /// A row no longer matches what the caller read earlier in the transaction.
    #[error("stale row {key} in {table}: {reason}")]
    StaleRow {
        table: &'static str,
        key: String,
        reason: &'static str,
    },
    #[error("transaction state: {reason}")]
    TransactionState { reason: &'static str },
    #[error("store unavailable: {detail}")]
    Unavailable { detail: String },
    #[error("store backend error: {detail}")]
    Backend { detail: String },
    #[error("corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },
    #[error("contract violation: {0}")]
    ContractViolation(ContractViolation),
}

impl From<ContractViolation> for StorageError {
    fn from(v: ContractViolation) -> Self {
        StorageError::ContractViolation(v)
    }
}

impl StorageError {
    /// Failures that say nothing about the data itself; safe to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. })
    }
}

#[derive(Debug, Clone, Default)]
struct Tables {
    positions: BTreeMap<PositionId, PositionRecord>,
    allocations: BTreeMap<AllocationId, AllocationRecord>,
}

/// In-memory position/allocation tables with single-writer transactions.
///
/// A transaction keeps an undo image of both tables; rollback restores it.
/// Callers serialize access (the adapter holds the store behind a `Mutex`),
/// so one open transaction is exclusive by construction.
#[derive(Debug, Default)]
pub struct StaffingStore {
    tables: Tables,
    undo: Option<Tables>,
}

impl StaffingStore {
    pub fn new_in_memory() -> Self {
        Self::default()
    }

    pub fn in_transaction(&self) -> bool {
        self.undo.is_some()
    }

    // ------------------------
    // Positions
    // ------------------------

    pub fn insert_position(&mut self, record: PositionRecord) -> Result<(), StorageError> {
        record.validate()?;
        if self.tables.positions.contains_key(&record.position_id) {
            return Err(StorageError::DuplicateKey {
                table: "positions.id",
                key: record.position_id.as_str().to_string(),
            });
        }
        self.tables
            .positions
            .insert(record.position_id.clone(), record);
        Ok(())
    }

    pub fn position_get(&self, position_id: &PositionId) -> Option<&PositionRecord> {
        self.tables.positions.get(position_id)
    }

    pub fn positions(&self) -> impl Iterator<Item = &PositionRecord> {
        self.tables.positions.values()
    }

    /// Removes the position only. Allocations referencing it are left behind.
    pub fn delete_position(&mut self, position_id: &PositionId) -> Result<(), StorageError> {
        self.tables
            .positions
            .remove(position_id)
            .map(|_| ())
            .ok_or(StorageError::ForeignKeyViolation {
                table: "positions.id",
                key: position_id.as_str().to_string(),
            })
    }

    /// Writes the flag without looking at allocations (manual edit path).
    pub fn set_position_allocated_raw(
        &mut self,
        position_id: &PositionId,
        flag: AllocatedFlag,
    ) -> Result<(), StorageError> {
        let rec = self.tables.positions.get_mut(position_id).ok_or(
            StorageError::ForeignKeyViolation {
                table: "positions.id",
                key: position_id.as_str().to_string(),
            },
        )?;
        rec.allocated = flag;
        Ok(())
    }

    // ------------------------
    // Allocations
    // ------------------------

    /// Bulk-import path: inserts the row as given, with no position check and
    /// no flag side effect.
    pub fn import_allocation(&mut self, record: AllocationRecord) -> Result<(), StorageError> {
        record.validate()?;
        if self.tables.allocations.contains_key(&record.allocation_id) {
            return Err(StorageError::DuplicateKey {
                table: "allocations.id",
                key: record.allocation_id.as_str().to_string(),
            });
        }
        self.tables
            .allocations
            .insert(record.allocation_id.clone(), record);
        Ok(())
    }

    /// Ordinary allocation-create: the position must exist in the same project
    /// and carry no live link; its flag becomes `Yes`.
    pub fn allocation_create(&mut self, record: AllocationRecord) -> Result<(), StorageError> {
        record.validate()?;
        let position = self.tables.positions.get(&record.position_id).ok_or(
            StorageError::ForeignKeyViolation {
                table: "allocations.position_id",
                key: record.position_id.as_str().to_string(),
            },
        )?;
        if position.project_id != record.project_id {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "allocation_create.project_id",
                    reason: "must match the position's project",
                },
            ));
        }
        if self.live_link_count(&record.position_id) > 0 {
            return Err(StorageError::DuplicateKey {
                table: "allocations(position_id)",
                key: record.position_id.as_str().to_string(),
            });
        }
        if self.tables.allocations.contains_key(&record.allocation_id) {
            return Err(StorageError::DuplicateKey {
                table: "allocations.id",
                key: record.allocation_id.as_str().to_string(),
            });
        }
        let position_id = record.position_id.clone();
        self.tables
            .allocations
            .insert(record.allocation_id.clone(), record);
        self.set_position_allocated_raw(&position_id, AllocatedFlag::Yes)
    }

    /// Ordinary allocation-delete: removes the row and resets the referenced
    /// position (when it still exists) to `No`.
    pub fn allocation_delete(&mut self, allocation_id: &AllocationId) -> Result<(), StorageError> {
        let removed = self.tables.allocations.remove(allocation_id).ok_or(
            StorageError::ForeignKeyViolation {
                table: "allocations.id",
                key: allocation_id.as_str().to_string(),
            },
        )?;
        if let Some(position) = self.tables.positions.get_mut(&removed.position_id) {
            position.allocated = AllocatedFlag::No;
        }
        Ok(())
    }

    pub fn allocation_get(&self, allocation_id: &AllocationId) -> Option<&AllocationRecord> {
        self.tables.allocations.get(allocation_id)
    }

    pub fn allocations(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.tables.allocations.values()
    }

    /// Allocations referencing the position whose project matches the position's.
    pub fn live_link_count(&self, position_id: &PositionId) -> usize {
        let Some(position) = self.tables.positions.get(position_id) else {
            return 0;
        };
        self.tables
            .allocations
            .values()
            .filter(|a| &a.position_id == position_id && a.project_id == position.project_id)
            .count()
    }

    // ------------------------
    // Reconciliation transaction
    // ------------------------

    pub fn reconcile_begin(&mut self) -> Result<(), StorageError> {
        if self.undo.is_some() {
            return Err(StorageError::TransactionState {
                reason: "transaction already open",
            });
        }
        self.undo = Some(self.tables.clone());
        Ok(())
    }

    pub fn reconcile_commit(&mut self) -> Result<(), StorageError> {
        self.undo
            .take()
            .map(|_| ())
            .ok_or(StorageError::TransactionState {
                reason: "no open transaction to commit",
            })
    }

    pub fn reconcile_rollback(&mut self) -> Result<(), StorageError> {
        let undo = self.undo.take().ok_or(StorageError::TransactionState {
            reason: "no open transaction to roll back",
        })?;
        self.tables = undo;
        Ok(())
    }

    /// Loads the closed scope for `filter`: in-range positions, allocations in
    /// range or pointing at them, every existing position those allocations
    /// reference, and every allocation of any loaded position.
    pub fn reconcile_snapshot(&self, filter: &MonthFilter) -> Result<ReconcileSnapshot, StorageError> {
        filter.validate()?;
        let positions = &self.tables.positions;
        let allocations = &self.tables.allocations;

        let mut position_ids: BTreeSet<&PositionId> = positions
            .values()
            .filter(|p| filter.contains(p.month_year))
            .map(|p| &p.position_id)
            .collect();
        for a in allocations.values() {
            if filter.contains(a.month_year) && positions.contains_key(&a.position_id) {
                position_ids.insert(&a.position_id);
            }
        }

        let snapshot_allocations = allocations
            .values()
            .filter(|a| filter.contains(a.month_year) || position_ids.contains(&a.position_id))
            .map(|a| SnapshotAllocation {
                allocation: a.clone(),
                position_project_id: positions.get(&a.position_id).map(|p| p.project_id.clone()),
            })
            .collect();

        Ok(ReconcileSnapshot {
            positions: position_ids
                .into_iter()
                .filter_map(|id| positions.get(id).cloned())
                .collect(),
            allocations: snapshot_allocations,
        })
    }

    /// Deletes allocations, each only if it still references the expected position.
    pub fn reconcile_delete_allocations(
        &mut self,
        deletes: &[(AllocationId, PositionId)],
    ) -> Result<usize, StorageError> {
        self.require_transaction()?;
        for (allocation_id, position_id) in deletes {
            match self.tables.allocations.get(allocation_id) {
                None => {
                    return Err(StorageError::StaleRow {
                        table: "allocations",
                        key: allocation_id.as_str().to_string(),
                        reason: "row no longer exists",
                    })
                }
                Some(a) if &a.position_id != position_id => {
                    return Err(StorageError::StaleRow {
                        table: "allocations",
                        key: allocation_id.as_str().to_string(),
                        reason: "row now references a different position",
                    })
                }
                Some(_) => {
                    self.tables.allocations.remove(allocation_id);
                }
            }
        }
        Ok(deletes.len())
    }

    /// Sets the flag only if the position still carries `expected_flag` and has
    /// exactly `expected_links` live links.
    pub fn reconcile_set_allocated_flag(
        &mut self,
        position_id: &PositionId,
        expected_flag: AllocatedFlag,
        expected_links: u32,
        new_flag: AllocatedFlag,
    ) -> Result<(), StorageError> {
        self.require_transaction()?;
        let links = self.live_link_count(position_id);
        let position = self.tables.positions.get_mut(position_id).ok_or(
            StorageError::StaleRow {
                table: "positions",
                key: position_id.as_str().to_string(),
                reason: "row no longer exists",
            },
        )?;
        if position.allocated != expected_flag {
            return Err(StorageError::StaleRow {
                table: "positions",
                key: position_id.as_str().to_string(),
                reason: "allocated flag changed",
            });
        }
        if links != expected_links as usize {
            return Err(StorageError::StaleRow {
                table: "positions",
                key: position_id.as_str().to_string(),
                reason: "live allocation count changed",
            });
        }
        position.allocated = new_flag;
        Ok(())
    }

    fn require_transaction(&self) -> Result<(), StorageError> {
        if self.undo.is_none() {
            return Err(StorageError::TransactionState {
                reason: "repair writes require an open transaction",
            });
        }
        Ok(())
    }
}
