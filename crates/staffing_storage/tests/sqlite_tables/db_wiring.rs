#![forbid(unsafe_code)]

use std::time::Duration;

use rust_decimal::Decimal;
use staffing_kernel_contracts::allocation::{AllocationId, AllocationRecord, ResourceId};
use staffing_kernel_contracts::position::{
    AllocatedFlag, AllocationMode, MonthYear, PositionId, PositionRecord, ProjectId,
};
use staffing_kernel_contracts::reconcile::MonthFilter;
use staffing_storage::repo::{ReconcileTxRepo, StaffingTablesRepo};
use staffing_storage::sqlite::SqliteStaffingStore;
use staffing_storage::store::StorageError;

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
        Decimal::new(125, 1),
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
        Decimal::new(125, 1),
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
fn at_sqlite_db_01_rows_round_trip_through_columns() {
    let mut s = SqliteStaffingStore::open_in_memory().unwrap();
    let p = position("P1", "X", "2024-03-15", AllocatedFlag::No);
    s.insert_position_row(p.clone()).unwrap();
    let a = allocation("A1", "X", "P1", "2024-03");
    s.allocation_create_row(a.clone()).unwrap();

    let mut expected = p;
    expected.allocated = AllocatedFlag::Yes;
    assert_eq!(s.position_row(&pid("P1")).unwrap(), Some(expected));
    assert_eq!(s.allocation_row(&aid("A1")).unwrap(), Some(a));
    assert!(s.store_health_row().is_ok());
}

#[test]
fn at_sqlite_db_02_ordinary_writes_match_in_memory_rules() {
    let mut s = SqliteStaffingStore::open_in_memory().unwrap();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::No))
        .unwrap();
    s.allocation_create_row(allocation("A1", "X", "P1", "2024-01"))
        .unwrap();

    assert!(matches!(
        s.allocation_create_row(allocation("A2", "X", "P1", "2024-01")),
        Err(StorageError::DuplicateKey { .. })
    ));
    assert!(matches!(
        s.allocation_create_row(allocation("A3", "Y", "P1", "2024-01")),
        Err(StorageError::ContractViolation(_))
    ));
    assert!(matches!(
        s.allocation_create_row(allocation("A4", "X", "P404", "2024-01")),
        Err(StorageError::ForeignKeyViolation { .. })
    ));
    assert!(matches!(
        s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::No)),
        Err(StorageError::DuplicateKey { .. })
    ));

    s.allocation_delete_row(&aid("A1")).unwrap();
    let p = s.position_row(&pid("P1")).unwrap().unwrap();
    assert_eq!(p.allocated, AllocatedFlag::No);
    assert!(s.allocation_rows().unwrap().is_empty());
}

#[test]
fn at_sqlite_db_03_snapshot_closure_matches_in_memory_store() {
    let mut s = SqliteStaffingStore::open_in_memory().unwrap();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::Yes))
        .unwrap();
    s.insert_position_row(position("P2", "X", "2024-02", AllocatedFlag::No))
        .unwrap();
    s.insert_position_row(position("P3", "X", "2024-03", AllocatedFlag::No))
        .unwrap();
    s.import_allocation_row(allocation("A1", "X", "P1", "2024-02"))
        .unwrap();
    s.import_allocation_row(allocation("A2", "Y", "P2", "2024-01"))
        .unwrap();
    s.import_allocation_row(allocation("A3", "X", "P3", "2024-03"))
        .unwrap();
    s.import_allocation_row(allocation("A4", "X", "P404", "2024-01"))
        .unwrap();

    let filter = MonthFilter::parse_months(&["2024-01"]).unwrap();
    let snap = s.reconcile_snapshot_rows(&filter).unwrap();

    let positions: Vec<&str> = snap.positions.iter().map(|p| p.position_id.as_str()).collect();
    assert_eq!(positions, vec!["P1", "P2"]);
    let allocations: Vec<(&str, Option<&str>)> = snap
        .allocations
        .iter()
        .map(|a| {
            (
                a.allocation.allocation_id.as_str(),
                a.position_project_id.as_ref().map(|p| p.as_str()),
            )
        })
        .collect();
    assert_eq!(
        allocations,
        vec![("A1", Some("X")), ("A2", Some("X")), ("A4", None)]
    );

    let all = s.reconcile_snapshot_rows(&MonthFilter::AllMonths).unwrap();
    assert_eq!(all.positions.len(), 3);
    assert_eq!(all.allocations.len(), 4);
}

#[test]
fn at_sqlite_db_04_rollback_discards_repairs() {
    let mut s = SqliteStaffingStore::open_in_memory().unwrap();
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
    assert_eq!(
        s.position_row(&pid("P1")).unwrap().unwrap().allocated,
        AllocatedFlag::Yes
    );
}

#[test]
fn at_sqlite_db_05_stale_rows_are_refused() {
    let mut s = SqliteStaffingStore::open_in_memory().unwrap();
    s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::No))
        .unwrap();
    s.import_allocation_row(allocation("A1", "X", "P1", "2024-01"))
        .unwrap();

    assert!(matches!(
        s.reconcile_delete_allocation_rows(&[(aid("A1"), pid("P1"))]),
        Err(StorageError::TransactionState { .. })
    ));

    s.reconcile_begin_row().unwrap();
    assert!(matches!(
        s.reconcile_delete_allocation_rows(&[(aid("A1"), pid("P2"))]),
        Err(StorageError::StaleRow { .. })
    ));
    assert!(matches!(
        s.reconcile_set_allocated_flag_row(&pid("P1"), AllocatedFlag::No, 0, AllocatedFlag::No),
        Err(StorageError::StaleRow { .. })
    ));
    s.reconcile_set_allocated_flag_row(&pid("P1"), AllocatedFlag::No, 1, AllocatedFlag::Yes)
        .unwrap();
    s.reconcile_commit_row().unwrap();

    assert_eq!(
        s.position_row(&pid("P1")).unwrap().unwrap().allocated,
        AllocatedFlag::Yes
    );
}

#[test]
fn at_sqlite_db_06_file_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("staffing.db");
    {
        let mut s = SqliteStaffingStore::open(&path, Duration::from_millis(100)).unwrap();
        s.insert_position_row(position("P1", "X", "2024-01", AllocatedFlag::No))
            .unwrap();
        s.allocation_create_row(allocation("A1", "X", "P1", "2024-01"))
            .unwrap();
    }
    let s = SqliteStaffingStore::open(&path, Duration::from_millis(100)).unwrap();
    assert_eq!(s.position_rows().unwrap().len(), 1);
    assert_eq!(s.allocation_rows().unwrap().len(), 1);
}

#[test]
fn at_sqlite_db_07_second_writer_waits_then_reports_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("staffing.db");
    let mut first = SqliteStaffingStore::open(&path, Duration::from_millis(50)).unwrap();
    let mut second = SqliteStaffingStore::open(&path, Duration::from_millis(50)).unwrap();

    first.reconcile_begin_row().unwrap();
    let err = second.reconcile_begin_row().unwrap_err();
    assert!(err.is_transient(), "got {err:?}");
    first.reconcile_commit_row().unwrap();

    second.reconcile_begin_row().unwrap();
    second.reconcile_rollback_row().unwrap();
}

fn seed_raw(path: &std::path::Path, sql: &str) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(sql).unwrap();
}

#[test]
fn at_sqlite_db_08_rows_from_other_writers_decode_as_stored() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("staffing.db");
    let s = SqliteStaffingStore::open(&path, Duration::from_millis(100)).unwrap();
    seed_raw(
        &path,
        "INSERT INTO positions VALUES ('P1', 'X', '', ' ', '2024-01-01', 'percentage', '120', 'No');
         INSERT INTO positions VALUES ('Pé', 'X', 't', 'n', '2024-01-01', 'days', '3', 'Yes');
         INSERT INTO allocations VALUES ('A1', 'X', '', 'Pé', '2024-01-01', 'percentage', '150');",
    );

    let filter = MonthFilter::parse_months(&["2024-01"]).unwrap();
    let snap = s.reconcile_snapshot_rows(&filter).unwrap();

    let positions: Vec<(&str, Decimal)> = snap
        .positions
        .iter()
        .map(|p| (p.position_id.as_str(), p.loe))
        .collect();
    assert_eq!(
        positions,
        vec![("P1", Decimal::new(120, 0)), ("Pé", Decimal::new(3, 0))]
    );
    assert_eq!(snap.allocations.len(), 1);
    assert_eq!(snap.allocations[0].allocation.resource_id.as_str(), "");
    assert_eq!(
        snap.allocations[0].position_project_id.as_ref().map(|p| p.as_str()),
        Some("X")
    );
}

#[test]
fn at_sqlite_db_09_undecodable_columns_are_corrupt_rows() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("staffing.db");
    let s = SqliteStaffingStore::open(&path, Duration::from_millis(100)).unwrap();
    seed_raw(
        &path,
        "INSERT INTO positions VALUES ('P1', 'X', 't', 'n', '2024-01-01', 'hours', '1', 'No');",
    );

    let err = s
        .reconcile_snapshot_rows(&MonthFilter::AllMonths)
        .unwrap_err();
    assert!(matches!(err, StorageError::CorruptRow { .. }), "got {err:?}");
}

#[test]
fn at_sqlite_db_10_mid_month_dates_fall_in_their_month() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("staffing.db");
    let mut s = SqliteStaffingStore::open(&path, Duration::from_millis(100)).unwrap();
    let mut mem = staffing_storage::store::StaffingStore::new_in_memory();
    seed_raw(
        &path,
        "INSERT INTO positions VALUES ('P4', 'X', 't', 'n', '2024-01-15', 'days', '1', 'Yes');
         INSERT INTO allocations VALUES ('A9', 'X', 'r', 'P404', '2024-02-20T09:00:00', 'days', '1');",
    );
    for p in s.position_rows().unwrap() {
        mem.insert_position_row(p).unwrap();
    }
    for a in s.allocation_rows().unwrap() {
        mem.import_allocation_row(a).unwrap();
    }

    let jan = MonthFilter::parse_months(&["2024-01"]).unwrap();
    let snap = s.reconcile_snapshot_rows(&jan).unwrap();
    assert_eq!(snap.positions.len(), 1);
    assert_eq!(snap.positions[0].month_year, month("2024-01"));
    assert!(snap.allocations.is_empty());
    assert_eq!(snap, mem.reconcile_snapshot_rows(&jan).unwrap());

    let feb = MonthFilter::parse_months(&["2024-02"]).unwrap();
    let snap = s.reconcile_snapshot_rows(&feb).unwrap();
    assert!(snap.positions.is_empty());
    assert_eq!(snap.allocations.len(), 1);
    assert_eq!(snap, mem.reconcile_snapshot_rows(&feb).unwrap());

    s.insert_position_row(position("P5", "X", "2024-03", AllocatedFlag::No))
        .unwrap();
    let mar = MonthFilter::parse_months(&["2024-03"]).unwrap();
    assert_eq!(s.reconcile_snapshot_rows(&mar).unwrap().positions.len(), 1);
}
