#![forbid(unsafe_code)]

use staffing_kernel_contracts::allocation::{AllocationId, AllocationRecord};
use staffing_kernel_contracts::position::{AllocatedFlag, PositionId, PositionRecord};
use staffing_kernel_contracts::reconcile::{MonthFilter, ReconcileSnapshot};

use crate::sqlite::SqliteStaffingStore;
use crate::store::{StaffingStore, StorageError};

/// Typed repository interface for the position and allocation tables
/// (ordinary write paths plus row reads).
pub trait StaffingTablesRepo {
    fn insert_position_row(&mut self, record: PositionRecord) -> Result<(), StorageError>;
    fn position_row(&self, position_id: &PositionId)
        -> Result<Option<PositionRecord>, StorageError>;
    fn position_rows(&self) -> Result<Vec<PositionRecord>, StorageError>;
    fn delete_position_row(&mut self, position_id: &PositionId) -> Result<(), StorageError>;
    fn set_position_allocated_raw_row(
        &mut self,
        position_id: &PositionId,
        flag: AllocatedFlag,
    ) -> Result<(), StorageError>;

    fn import_allocation_row(&mut self, record: AllocationRecord) -> Result<(), StorageError>;
    fn allocation_create_row(&mut self, record: AllocationRecord) -> Result<(), StorageError>;
    fn allocation_delete_row(&mut self, allocation_id: &AllocationId) -> Result<(), StorageError>;
    fn allocation_row(
        &self,
        allocation_id: &AllocationId,
    ) -> Result<Option<AllocationRecord>, StorageError>;
    fn allocation_rows(&self) -> Result<Vec<AllocationRecord>, StorageError>;

    fn store_health_row(&self) -> Result<(), StorageError>;
}

/// Typed repository interface for one reconciliation transaction.
pub trait ReconcileTxRepo {
    fn reconcile_begin_row(&mut self) -> Result<(), StorageError>;
    fn reconcile_snapshot_rows(
        &self,
        filter: &MonthFilter,
    ) -> Result<ReconcileSnapshot, StorageError>;
    fn reconcile_delete_allocation_rows(
        &mut self,
        deletes: &[(AllocationId, PositionId)],
    ) -> Result<usize, StorageError>;
    fn reconcile_set_allocated_flag_row(
        &mut self,
        position_id: &PositionId,
        expected_flag: AllocatedFlag,
        expected_links: u32,
        new_flag: AllocatedFlag,
    ) -> Result<(), StorageError>;
    fn reconcile_commit_row(&mut self) -> Result<(), StorageError>;
    fn reconcile_rollback_row(&mut self) -> Result<(), StorageError>;
}

/// Everything the runtime needs from a backing store.
pub trait StaffingRepo: StaffingTablesRepo + ReconcileTxRepo + Send {}

impl<T: StaffingTablesRepo + ReconcileTxRepo + Send> StaffingRepo for T {}

impl StaffingTablesRepo for StaffingStore {
    fn insert_position_row(&mut self, record: PositionRecord) -> Result<(), StorageError> {
        self.insert_position(record)
    }

    fn position_row(
        &self,
        position_id: &PositionId,
    ) -> Result<Option<PositionRecord>, StorageError> {
        Ok(self.position_get(position_id).cloned())
    }

    fn position_rows(&self) -> Result<Vec<PositionRecord>, StorageError> {
        Ok(self.positions().cloned().collect())
    }

    fn delete_position_row(&mut self, position_id: &PositionId) -> Result<(), StorageError> {
        self.delete_position(position_id)
    }

    fn set_position_allocated_raw_row(
        &mut self,
        position_id: &PositionId,
        flag: AllocatedFlag,
    ) -> Result<(), StorageError> {
        self.set_position_allocated_raw(position_id, flag)
    }

    fn import_allocation_row(&mut self, record: AllocationRecord) -> Result<(), StorageError> {
        self.import_allocation(record)
    }

    fn allocation_create_row(&mut self, record: AllocationRecord) -> Result<(), StorageError> {
        self.allocation_create(record)
    }

    fn allocation_delete_row(&mut self, allocation_id: &AllocationId) -> Result<(), StorageError> {
        self.allocation_delete(allocation_id)
    }

    fn allocation_row(
        &self,
        allocation_id: &AllocationId,
    ) -> Result<Option<AllocationRecord>, StorageError> {
        Ok(self.allocation_get(allocation_id).cloned())
    }

    fn allocation_rows(&self) -> Result<Vec<AllocationRecord>, StorageError> {
        Ok(self.allocations().cloned().collect())
    }

    fn store_health_row(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

impl ReconcileTxRepo for StaffingStore {
    fn reconcile_begin_row(&mut self) -> Result<(), StorageError> {
        self.reconcile_begin()
    }

    fn reconcile_snapshot_rows(
        &self,
        filter: &MonthFilter,
    ) -> Result<ReconcileSnapshot, StorageError> {
        self.reconcile_snapshot(filter)
    }

    fn reconcile_delete_allocation_rows(
        &mut self,
        deletes: &[(AllocationId, PositionId)],
    ) -> Result<usize, StorageError> {
        self.reconcile_delete_allocations(deletes)
    }

    fn reconcile_set_allocated_flag_row(
        &mut self,
        position_id: &PositionId,
        expected_flag: AllocatedFlag,
        expected_links: u32,
        new_flag: AllocatedFlag,
    ) -> Result<(), StorageError> {
        self.reconcile_set_allocated_flag(position_id, expected_flag, expected_links, new_flag)
    }

    fn reconcile_commit_row(&mut self) -> Result<(), StorageError> {
        self.reconcile_commit()
    }

    fn reconcile_rollback_row(&mut self) -> Result<(), StorageError> {
        self.reconcile_rollback()
    }
}

impl StaffingTablesRepo for SqliteStaffingStore {
    fn insert_position_row(&mut self, record: PositionRecord) -> Result<(), StorageError> {
        self.insert_position(&record)
    }

    fn position_row(
        &self,
        position_id: &PositionId,
    ) -> Result<Option<PositionRecord>, StorageError> {
        self.position_get(position_id)
    }

    fn position_rows(&self) -> Result<Vec<PositionRecord>, StorageError> {
        self.positions()
    }

    fn delete_position_row(&mut self, position_id: &PositionId) -> Result<(), StorageError> {
        self.delete_position(position_id)
    }

    fn set_position_allocated_raw_row(
        &mut self,
        position_id: &PositionId,
        flag: AllocatedFlag,
    ) -> Result<(), StorageError> {
        self.set_position_allocated_raw(position_id, flag)
    }

    fn import_allocation_row(&mut self, record: AllocationRecord) -> Result<(), StorageError> {
        self.import_allocation(&record)
    }

    fn allocation_create_row(&mut self, record: AllocationRecord) -> Result<(), StorageError> {
        self.allocation_create(&record)
    }

    fn allocation_delete_row(&mut self, allocation_id: &AllocationId) -> Result<(), StorageError> {
        self.allocation_delete(allocation_id)
    }

    fn allocation_row(
        &self,
        allocation_id: &AllocationId,
    ) -> Result<Option<AllocationRecord>, StorageError> {
        self.allocation_get(allocation_id)
    }

    fn allocation_rows(&self) -> Result<Vec<AllocationRecord>, StorageError> {
        self.allocations()
    }

    fn store_health_row(&self) -> Result<(), StorageError> {
        self.ping()
    }
}

impl ReconcileTxRepo for SqliteStaffingStore {
    fn reconcile_begin_row(&mut self) -> Result<(), StorageError> {
        self.reconcile_begin()
    }

    fn reconcile_snapshot_rows(
        &self,
        filter: &MonthFilter,
    ) -> Result<ReconcileSnapshot, StorageError> {
        self.reconcile_snapshot(filter)
    }

    fn reconcile_delete_allocation_rows(
        &mut self,
        deletes: &[(AllocationId, PositionId)],
    ) -> Result<usize, StorageError> {
        self.reconcile_delete_allocations(deletes)
    }

    fn reconcile_set_allocated_flag_row(
        &mut self,
        position_id: &PositionId,
        expected_flag: AllocatedFlag,
        expected_links: u32,
        new_flag: AllocatedFlag,
    ) -> Result<(), StorageError> {
        self.reconcile_set_allocated_flag(position_id, expected_flag, expected_links, new_flag)
    }

    fn reconcile_commit_row(&mut self) -> Result<(), StorageError> {
        self.reconcile_commit()
    }

    fn reconcile_rollback_row(&mut self) -> Result<(), StorageError> {
        self.reconcile_rollback()
    }
}
