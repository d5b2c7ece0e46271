#![forbid(unsafe_code)]

use rust_decimal::Decimal;
use staffing_kernel_contracts::allocation::{AllocationId, AllocationRecord, ResourceId};
use staffing_kernel_contracts::position::{
    AllocatedFlag, AllocationMode, MonthYear, PositionId, PositionRecord, ProjectId,
};
use staffing_storage::repo::StaffingTablesRepo;
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
        AllocationMode::Percentage,
        Decimal::new(50, 0),
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
        AllocationMode::Percentage,
        Decimal::new(50, 0),
    )
    .unwrap()
}

fn pid(id: &str) -> PositionId {
    PositionId::new(id).unwrap()
}

fn aid(id: &str) -> AllocationId {
    AllocationId::new(id).unwrap()
}

#[test]
fn at_staffing_db_01_allocation_create_sets_flag_yes() {
    let mut s = StaffingStore::new_in_memory();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::No))
        .unwrap();

    s.allocation_create_row(allocation("A1", "X", "P1", "2024-01"))
        .unwrap();

    let p = s.position_row(&pid("P1")).unwrap().unwrap();
    assert_eq!(p.allocated, AllocatedFlag::Yes);
    assert_eq!(s.live_link_count(&pid("P1")), 1);
}

#[test]
fn at_staffing_db_02_allocation_create_refuses_second_live_link() {
    let mut s = StaffingStore::new_in_memory();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::No))
        .unwrap();
    s.allocation_create_row(allocation("A1", "X", "P1", "2024-01"))
        .unwrap();

    let err = s
        .allocation_create_row(allocation("A2", "X", "P1", "2024-01"))
        .unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey { .. }));
    assert_eq!(s.allocation_rows().unwrap().len(), 1);
}

#[test]
fn at_staffing_db_03_allocation_create_requires_matching_project() {
    let mut s = StaffingStore::new_in_memory();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::No))
        .unwrap();

    let err = s
        .allocation_create_row(allocation("A1", "Y", "P1", "2024-01"))
        .unwrap_err();
    assert!(matches!(err, StorageError::ContractViolation(_)));

    let err = s
        .allocation_create_row(allocation("A2", "X", "P404", "2024-01"))
        .unwrap_err();
    assert!(matches!(err, StorageError::ForeignKeyViolation { .. }));
    assert!(s.allocation_rows().unwrap().is_empty());
}

#[test]
fn at_staffing_db_04_allocation_delete_resets_flag() {
    let mut s = StaffingStore::new_in_memory();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::No))
        .unwrap();
    s.allocation_create_row(allocation("A1", "X", "P1", "2024-01"))
        .unwrap();

    s.allocation_delete_row(&aid("A1")).unwrap();

    assert!(s.allocation_row(&aid("A1")).unwrap().is_none());
    let p = s.position_row(&pid("P1")).unwrap().unwrap();
    assert_eq!(p.allocated, AllocatedFlag::No);
}

#[test]
fn at_staffing_db_05_position_delete_leaves_allocations_behind() {
    let mut s = StaffingStore::new_in_memory();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::No))
        .unwrap();
    s.allocation_create_row(allocation("A1", "X", "P1", "2024-01"))
        .unwrap();

    s.delete_position_row(&pid("P1")).unwrap();

    assert!(s.position_row(&pid("P1")).unwrap().is_none());
    assert!(s.allocation_row(&aid("A1")).unwrap().is_some());
    assert_eq!(s.live_link_count(&pid("P1")), 0);
}

#[test]
fn at_staffing_db_06_import_skips_checks_and_side_effects() {
    let mut s = StaffingStore::new_in_memory();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::No))
        .unwrap();

    s.import_allocation_row(allocation("A1", "Y", "P1", "2024-01"))
        .unwrap();
    s.import_allocation_row(allocation("A2", "X", "P404", "2024-01"))
        .unwrap();

    let p = s.position_row(&pid("P1")).unwrap().unwrap();
    assert_eq!(p.allocated, AllocatedFlag::No);
    assert_eq!(s.allocation_rows().unwrap().len(), 2);

    let err = s
        .import_allocation_row(allocation("A1", "X", "P1", "2024-01"))
        .unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey { .. }));
}

#[test]
fn at_staffing_db_07_raw_flag_edit_ignores_allocations() {
    let mut s = StaffingStore::new_in_memory();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::No))
        .unwrap();

    s.set_position_allocated_raw_row(&pid("P1"), AllocatedFlag::Yes)
        .unwrap();

    let p = s.position_row(&pid("P1")).unwrap().unwrap();
    assert_eq!(p.allocated, AllocatedFlag::Yes);
    assert_eq!(s.live_link_count(&pid("P1")), 0);
    assert!(s
        .set_position_allocated_raw_row(&pid("P404"), AllocatedFlag::No)
        .is_err());
}

#[test]
fn at_staffing_db_08_duplicate_position_id_rejected() {
    let mut s = StaffingStore::new_in_memory();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::No))
        .unwrap();
    let err = s
        .insert_position_row(position("P1", "X", "2024-02", AllocatedFlag::No))
        .unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey { .. }));
    assert_eq!(s.position_rows().unwrap().len(), 1);
    assert!(s.store_health_row().is_ok());
}
