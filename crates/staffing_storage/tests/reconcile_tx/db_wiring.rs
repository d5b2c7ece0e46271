#![forbid(unsafe_code)]

use rust_decimal::Decimal;
use staffing_kernel_contracts::allocation::{AllocationId, AllocationRecord, ResourceId};
use staffing_kernel_contracts::position::{
    AllocatedFlag, AllocationMode, MonthYear, PositionId, PositionRecord, ProjectId,
};
use staffing_kernel_contracts::reconcile::MonthFilter;
use staffing_storage::repo::{ReconcileTxRepo, StaffingTablesRepo};
use staffing_storage::store::{StaffingStore, StorageError};

fn month(s: &str) -> MonthYear {
    MonthYear::parse(s).unwrap()
}

fn position(id: &str, project: &str, m: &str, flag: AllocatedFlag) -> PositionRecord {
    PositionRecord::v1(
        PositionId::new(id).unwrap(),
        ProjectId::new(project).unwrap(),
        format!("task_{id}"),
        format!("Role {id}"),
        month(m),
        AllocationMode::Days,
        Decimal::new(10, 0),
        flag,
    )
    .unwrap()
}

fn allocation(id: &str, project: &str, position_id: &str, m: &str) -> AllocationRecord {
    AllocationRecord::v1(
        AllocationId::new(id).unwrap(),
        ProjectId::new(project).unwrap(),
        ResourceId::new("res_1").unwrap(),
        PositionId::new(position_id).unwrap(),
        month(m),
        AllocationMode::Days,
        Decimal::new(10, 0),
    )
    .unwrap()
}

fn pid(id: &str) -> PositionId {
    PositionId::new(id).unwrap()
}

fn aid(id: &str) -> AllocationId {
    AllocationId::new(id).unwrap()
}

fn jan() -> MonthFilter {
    MonthFilter::parse_months(&["2024-01-01"]).unwrap()
}

#[test]
fn at_reconcile_db_01_snapshot_pulls_in_out_of_range_rows_linked_to_scope() {
    let mut s = StaffingStore::new_in_memory();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::Yes))
        .unwrap();
    s.insert_position_row(position("P2", "X", "2024-02", AllocatedFlag::No))
        .unwrap();
    s.insert_position_row(position("P3", "X", "2024-03", AllocatedFlag::No))
        .unwrap();
    // out-of-range allocation on an in-range position
    s.import_allocation_row(allocation("A1", "X", "P1", "2024-02"))
        .unwrap();
    // in-range allocation on an out-of-range position
    s.import_allocation_row(allocation("A2", "X", "P2", "2024-01"))
        .unwrap();
    // unrelated
    s.import_allocation_row(allocation("A3", "X", "P3", "2024-03"))
        .unwrap();
    // in-range orphan
    s.import_allocation_row(allocation("A4", "X", "P404", "2024-01"))
        .unwrap();

    let snap = s.reconcile_snapshot_rows(&jan()).unwrap();

    let positions: Vec<&str> = snap.positions.iter().map(|p| p.position_id.as_str()).collect();
    assert_eq!(positions, vec!["P1", "P2"]);
    let allocations: Vec<&str> = snap
        .allocations
        .iter()
        .map(|a| a.allocation.allocation_id.as_str())
        .collect();
    assert_eq!(allocations, vec!["A1", "A2", "A4"]);
    let orphan = snap
        .allocations
        .iter()
        .find(|a| a.allocation.allocation_id == aid("A4"))
        .unwrap();
    assert!(orphan.position_project_id.is_none());
}

#[test]
fn at_reconcile_db_02_all_months_snapshot_loads_everything() {
    let mut s = StaffingStore::new_in_memory();
    s.insert_position_row(position("P1", "X", "2023-06", AllocatedFlag::No))
        .unwrap();
    s.insert_position_row(position("P2", "X", "2025-06", AllocatedFlag::No))
        .unwrap();
    s.import_allocation_row(allocation("A1", "X", "P9", "2019-01"))
        .unwrap();

    let snap = s.reconcile_snapshot_rows(&MonthFilter::AllMonths).unwrap();
    assert_eq!(snap.positions.len(), 2);
    assert_eq!(snap.allocations.len(), 1);
}

#[test]
fn at_reconcile_db_03_rollback_restores_tables() {
    let mut s = StaffingStore::new_in_memory();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::Yes))
        .unwrap();
    s.import_allocation_row(allocation("A1", "X", "P1", "2024-01"))
        .unwrap();
    s.import_allocation_row(allocation("A2", "X", "P1", "2024-01"))
        .unwrap();

    s.reconcile_begin_row().unwrap();
    assert!(s.in_transaction());
    s.reconcile_delete_allocation_rows(&[(aid("A1"), pid("P1")), (aid("A2"), pid("P1"))])
        .unwrap();
    s.reconcile_set_allocated_flag_row(&pid("P1"), AllocatedFlag::Yes, 0, AllocatedFlag::No)
        .unwrap();
    s.reconcile_rollback_row().unwrap();

    assert!(!s.in_transaction());
    assert_eq!(s.allocation_rows().unwrap().len(), 2);
    let p = s.position_row(&pid("P1")).unwrap().unwrap();
    assert_eq!(p.allocated, AllocatedFlag::Yes);
}

#[test]
fn at_reconcile_db_04_commit_keeps_writes() {
    let mut s = StaffingStore::new_in_memory();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::No))
        .unwrap();
    s.import_allocation_row(allocation("A1", "X", "P1", "2024-01"))
        .unwrap();

    s.reconcile_begin_row().unwrap();
    s.reconcile_set_allocated_flag_row(&pid("P1"), AllocatedFlag::No, 1, AllocatedFlag::Yes)
        .unwrap();
    s.reconcile_commit_row().unwrap();

    let p = s.position_row(&pid("P1")).unwrap().unwrap();
    assert_eq!(p.allocated, AllocatedFlag::Yes);
}

#[test]
fn at_reconcile_db_05_repair_writes_require_open_transaction() {
    let mut s = StaffingStore::new_in_memory();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::No))
        .unwrap();

    let err = s
        .reconcile_set_allocated_flag_row(&pid("P1"), AllocatedFlag::No, 0, AllocatedFlag::Yes)
        .unwrap_err();
    assert!(matches!(err, StorageError::TransactionState { .. }));
    assert!(matches!(
        s.reconcile_commit_row(),
        Err(StorageError::TransactionState { .. })
    ));
    assert!(matches!(
        s.reconcile_rollback_row(),
        Err(StorageError::TransactionState { .. })
    ));

    s.reconcile_begin_row().unwrap();
    assert!(matches!(
        s.reconcile_begin_row(),
        Err(StorageError::TransactionState { .. })
    ));
}

#[test]
fn at_reconcile_db_06_stale_rows_are_refused() {
    let mut s = StaffingStore::new_in_memory();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::No))
        .unwrap();
    s.insert_position_row(position("P2", "X", "2024-01", AllocatedFlag::No))
        .unwrap();
    s.import_allocation_row(allocation("A1", "X", "P2", "2024-01"))
        .unwrap();

    s.reconcile_begin_row().unwrap();

    let err = s
        .reconcile_delete_allocation_rows(&[(aid("A404"), pid("P1"))])
        .unwrap_err();
    assert!(matches!(err, StorageError::StaleRow { .. }));

    let err = s
        .reconcile_delete_allocation_rows(&[(aid("A1"), pid("P1"))])
        .unwrap_err();
    assert!(matches!(err, StorageError::StaleRow { .. }));

    let err = s
        .reconcile_set_allocated_flag_row(&pid("P1"), AllocatedFlag::Yes, 0, AllocatedFlag::No)
        .unwrap_err();
    assert!(matches!(err, StorageError::StaleRow { .. }));

    let err = s
        .reconcile_set_allocated_flag_row(&pid("P2"), AllocatedFlag::No, 0, AllocatedFlag::No)
        .unwrap_err();
    assert!(matches!(err, StorageError::StaleRow { .. }));

    let err = s
        .reconcile_set_allocated_flag_row(&pid("P404"), AllocatedFlag::No, 0, AllocatedFlag::No)
        .unwrap_err();
    assert!(matches!(err, StorageError::StaleRow { .. }));

    s.reconcile_rollback_row().unwrap();
}
