//! `SQLite`-backed position/allocation tables.
//!
//! Reconciliation runs inside `BEGIN IMMEDIATE`, which takes the database
//! write lock up front so other writers queue behind the run (bounded by the
//! connection's busy timeout) instead of interleaving with it.

// SQLite returns i64 for counts, but they're always non-negative.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use rust_decimal::Decimal;
use staffing_kernel_contracts::allocation::{AllocationId, AllocationRecord, ResourceId};
use staffing_kernel_contracts::position::{
    AllocatedFlag, AllocationMode, MonthYear, PositionId, PositionRecord, ProjectId,
};
use staffing_kernel_contracts::reconcile::{MonthFilter, ReconcileSnapshot, SnapshotAllocation};
use staffing_kernel_contracts::Validate;

use crate::store::StorageError;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

const POSITION_COLUMNS: &str =
    "id, project_id, task_ref, name, month_year, allocation_mode, loe, allocated";

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(
                ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::NotADatabase,
            ) => StorageError::Unavailable {
                detail: err.to_string(),
            },
            _ => StorageError::Backend {
                detail: err.to_string(),
            },
        }
    }
}

fn constraint_or(err: rusqlite::Error, table: &'static str, key: &str) -> StorageError {
    if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
        StorageError::DuplicateKey {
            table,
            key: key.to_string(),
        }
    } else {
        err.into()
    }
}

pub struct SqliteStaffingStore {
    conn: Connection,
}

impl std::fmt::Debug for SqliteStaffingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStaffingStore")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl SqliteStaffingStore {
    /// Opens (creating if needed) the database at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::init(conn, busy_timeout)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?, Duration::from_millis(0))
    }

    fn init(conn: Connection, busy_timeout: Duration) -> Result<Self, StorageError> {
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    pub fn ping(&self) -> Result<(), StorageError> {
        self.conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    // ------------------------
    // Positions
    // ------------------------

    pub fn insert_position(&mut self, record: &PositionRecord) -> Result<(), StorageError> {
        record.validate()?;
        self.conn
            .execute(
                "INSERT INTO positions (id, project_id, task_ref, name, month_year, allocation_mode, loe, allocated)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.position_id.as_str(),
                    record.project_id.as_str(),
                    record.task_ref,
                    record.name,
                    record.month_year.first_of_month(),
                    record.allocation_mode.as_str(),
                    record.loe.to_string(),
                    record.allocated.as_str(),
                ],
            )
            .map_err(|e| constraint_or(e, "positions.id", record.position_id.as_str()))?;
        Ok(())
    }

    pub fn position_get(
        &self,
        position_id: &PositionId,
    ) -> Result<Option<PositionRecord>, StorageError> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {POSITION_COLUMNS} FROM positions WHERE id = ?1"),
                params![position_id.as_str()],
                RawPosition::from_row,
            )
            .optional()?;
        raw.map(RawPosition::into_record).transpose()
    }

    pub fn positions(&self) -> Result<Vec<PositionRecord>, StorageError> {
        self.query_positions(
            &format!("SELECT {POSITION_COLUMNS} FROM positions ORDER BY id"),
            &[],
        )
    }

    pub fn delete_position(&mut self, position_id: &PositionId) -> Result<(), StorageError> {
        let n = self.conn.execute(
            "DELETE FROM positions WHERE id = ?1",
            params![position_id.as_str()],
        )?;
        if n == 0 {
            return Err(StorageError::ForeignKeyViolation {
                table: "positions.id",
                key: position_id.as_str().to_string(),
            });
        }
        Ok(())
    }

    pub fn set_position_allocated_raw(
        &mut self,
        position_id: &PositionId,
        flag: AllocatedFlag,
    ) -> Result<(), StorageError> {
        let n = self.conn.execute(
            "UPDATE positions SET allocated = ?2 WHERE id = ?1",
            params![position_id.as_str(), flag.as_str()],
        )?;
        if n == 0 {
            return Err(StorageError::ForeignKeyViolation {
                table: "positions.id",
                key: position_id.as_str().to_string(),
            });
        }
        Ok(())
    }

    // ------------------------
    // Allocations
    // ------------------------

    pub fn import_allocation(&mut self, record: &AllocationRecord) -> Result<(), StorageError> {
        record.validate()?;
        insert_allocation(&self.conn, record)
    }

    pub fn allocation_create(&mut self, record: &AllocationRecord) -> Result<(), StorageError> {
        record.validate()?;
        let sp = self.conn.savepoint()?;
        let position_project: Option<String> = sp
            .query_row(
                "SELECT project_id FROM positions WHERE id = ?1",
                params![record.position_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(position_project) = position_project else {
            return Err(StorageError::ForeignKeyViolation {
                table: "allocations.position_id",
                key: record.position_id.as_str().to_string(),
            });
        };
        if position_project != record.project_id.as_str() {
            return Err(StorageError::ContractViolation(
                staffing_kernel_contracts::ContractViolation::InvalidValue {
                    field: "allocation_create.project_id",
                    reason: "must match the position's project",
                },
            ));
        }
        if live_link_count(&sp, &record.position_id)? > 0 {
            return Err(StorageError::DuplicateKey {
                table: "allocations(position_id)",
                key: record.position_id.as_str().to_string(),
            });
        }
        insert_allocation(&sp, record)?;
        sp.execute(
            "UPDATE positions SET allocated = 'Yes' WHERE id = ?1",
            params![record.position_id.as_str()],
        )?;
        sp.commit()?;
        Ok(())
    }

    pub fn allocation_delete(&mut self, allocation_id: &AllocationId) -> Result<(), StorageError> {
        let sp = self.conn.savepoint()?;
        let position_id: Option<String> = sp
            .query_row(
                "SELECT position_id FROM allocations WHERE id = ?1",
                params![allocation_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(position_id) = position_id else {
            return Err(StorageError::ForeignKeyViolation {
                table: "allocations.id",
                key: allocation_id.as_str().to_string(),
            });
        };
        sp.execute(
            "DELETE FROM allocations WHERE id = ?1",
            params![allocation_id.as_str()],
        )?;
        sp.execute(
            "UPDATE positions SET allocated = 'No' WHERE id = ?1",
            params![position_id],
        )?;
        sp.commit()?;
        Ok(())
    }

    pub fn allocation_get(
        &self,
        allocation_id: &AllocationId,
    ) -> Result<Option<AllocationRecord>, StorageError> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, project_id, resource_id, position_id, month_year, allocation_mode, loe, NULL
                 FROM allocations WHERE id = ?1",
                params![allocation_id.as_str()],
                RawAllocation::from_row,
            )
            .optional()?;
        raw.map(|r| r.into_snapshot().map(|s| s.allocation))
            .transpose()
    }

    pub fn allocations(&self) -> Result<Vec<AllocationRecord>, StorageError> {
        let rows = self.query_allocations(
            "SELECT id, project_id, resource_id, position_id, month_year, allocation_mode, loe, NULL
             FROM allocations ORDER BY id",
            &[],
        )?;
        Ok(rows.into_iter().map(|s| s.allocation).collect())
    }

    // ------------------------
    // Reconciliation transaction
    // ------------------------

    pub fn reconcile_begin(&mut self) -> Result<(), StorageError> {
        if self.in_transaction() {
            return Err(StorageError::TransactionState {
                reason: "transaction already open",
            });
        }
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    pub fn reconcile_commit(&mut self) -> Result<(), StorageError> {
        if !self.in_transaction() {
            return Err(StorageError::TransactionState {
                reason: "no open transaction to commit",
            });
        }
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn reconcile_rollback(&mut self) -> Result<(), StorageError> {
        if !self.in_transaction() {
            return Err(StorageError::TransactionState {
                reason: "no open transaction to roll back",
            });
        }
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Same closed scope as the in-memory store: in-range positions, positions
    /// referenced by in-range allocations, and every allocation that is in
    /// range or references one of those positions.
    ///
    /// Months match on the `YYYY-MM` prefix, so rows another writer stored
    /// with a day other than the first still fall in their month.
    pub fn reconcile_snapshot(&self, filter: &MonthFilter) -> Result<ReconcileSnapshot, StorageError> {
        filter.validate()?;
        let months: Vec<String> = match filter {
            MonthFilter::Months(set) => set.iter().map(MonthYear::to_string).collect(),
            MonthFilter::AllMonths => Vec::new(),
        };
        let in_range = |column: &str| -> String {
            if months.is_empty() {
                return "1".to_string();
            }
            let placeholders = (1..=months.len())
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            format!("substr({column}, 1, 7) IN ({placeholders})")
        };

        let scope_positions = format!(
            "SELECT id FROM positions WHERE {}
             UNION
             SELECT a2.position_id FROM allocations a2
             JOIN positions p2 ON p2.id = a2.position_id
             WHERE {}",
            in_range("month_year"),
            in_range("a2.month_year"),
        );

        let positions = self.query_positions(
            &format!(
                "SELECT {POSITION_COLUMNS} FROM positions
                 WHERE id IN ({scope_positions})
                 ORDER BY id"
            ),
            &months,
        )?;

        let allocations = self.query_allocations(
            &format!(
                "SELECT a.id, a.project_id, a.resource_id, a.position_id, a.month_year,
                        a.allocation_mode, a.loe, p.project_id
                 FROM allocations a
                 LEFT JOIN positions p ON p.id = a.position_id
                 WHERE {} OR a.position_id IN ({scope_positions})
                 ORDER BY a.id",
                in_range("a.month_year"),
            ),
            &months,
        )?;

        Ok(ReconcileSnapshot {
            positions,
            allocations,
        })
    }

    pub fn reconcile_delete_allocations(
        &mut self,
        deletes: &[(AllocationId, PositionId)],
    ) -> Result<usize, StorageError> {
        self.require_transaction()?;
        let mut stmt = self
            .conn
            .prepare_cached("DELETE FROM allocations WHERE id = ?1 AND position_id = ?2")?;
        for (allocation_id, position_id) in deletes {
            let n = stmt.execute(params![allocation_id.as_str(), position_id.as_str()])?;
            if n != 1 {
                return Err(StorageError::StaleRow {
                    table: "allocations",
                    key: allocation_id.as_str().to_string(),
                    reason: "row no longer exists or references a different position",
                });
            }
        }
        Ok(deletes.len())
    }

    pub fn reconcile_set_allocated_flag(
        &mut self,
        position_id: &PositionId,
        expected_flag: AllocatedFlag,
        expected_links: u32,
        new_flag: AllocatedFlag,
    ) -> Result<(), StorageError> {
        self.require_transaction()?;
        let current: Option<String> = self
            .conn
            .query_row(
                "SELECT allocated FROM positions WHERE id = ?1",
                params![position_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(StorageError::StaleRow {
                table: "positions",
                key: position_id.as_str().to_string(),
                reason: "row no longer exists",
            });
        };
        if current != expected_flag.as_str() {
            return Err(StorageError::StaleRow {
                table: "positions",
                key: position_id.as_str().to_string(),
                reason: "allocated flag changed",
            });
        }
        if live_link_count(&self.conn, position_id)? != expected_links as usize {
            return Err(StorageError::StaleRow {
                table: "positions",
                key: position_id.as_str().to_string(),
                reason: "live allocation count changed",
            });
        }
        self.conn.execute(
            "UPDATE positions SET allocated = ?2 WHERE id = ?1",
            params![position_id.as_str(), new_flag.as_str()],
        )?;
        Ok(())
    }

    fn require_transaction(&self) -> Result<(), StorageError> {
        if !self.in_transaction() {
            return Err(StorageError::TransactionState {
                reason: "repair writes require an open transaction",
            });
        }
        Ok(())
    }

    fn query_positions(
        &self,
        sql: &str,
        args: &[String],
    ) -> Result<Vec<PositionRecord>, StorageError> {
        let mut stmt = self.conn.prepare(sql)?;
        let raws = stmt
            .query_map(params_from_iter(args.iter()), RawPosition::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawPosition::into_record).collect()
    }

    fn query_allocations(
        &self,
        sql: &str,
        args: &[String],
    ) -> Result<Vec<SnapshotAllocation>, StorageError> {
        let mut stmt = self.conn.prepare(sql)?;
        let raws = stmt
            .query_map(params_from_iter(args.iter()), RawAllocation::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawAllocation::into_snapshot).collect()
    }
}

fn insert_allocation(conn: &Connection, record: &AllocationRecord) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO allocations (id, project_id, resource_id, position_id, month_year, allocation_mode, loe)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.allocation_id.as_str(),
            record.project_id.as_str(),
            record.resource_id.as_str(),
            record.position_id.as_str(),
            record.month_year.first_of_month(),
            record.allocation_mode.as_str(),
            record.loe.to_string(),
        ],
    )
    .map_err(|e| constraint_or(e, "allocations.id", record.allocation_id.as_str()))?;
    Ok(())
}

fn live_link_count(conn: &Connection, position_id: &PositionId) -> Result<usize, StorageError> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM allocations a
         JOIN positions p ON p.id = a.position_id
         WHERE a.position_id = ?1 AND a.project_id = p.project_id",
        params![position_id.as_str()],
        |row| row.get(0),
    )?;
    Ok(n as usize)
}

struct RawPosition {
    id: String,
    project_id: String,
    task_ref: String,
    name: String,
    month_year: String,
    allocation_mode: String,
    loe: String,
    allocated: String,
}

impl RawPosition {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            task_ref: row.get(2)?,
            name: row.get(3)?,
            month_year: row.get(4)?,
            allocation_mode: row.get(5)?,
            loe: row.get(6)?,
            allocated: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<PositionRecord, StorageError> {
        let table = "positions";
        let allocated = AllocatedFlag::parse(&self.allocated).ok_or_else(|| corrupt(
            table,
            &self.id,
            "allocated must be Yes or No",
        ))?;
        Ok(PositionRecord::from_stored(
            PositionId::from_stored(self.id.clone()),
            ProjectId::from_stored(self.project_id),
            self.task_ref,
            self.name,
            decode_month(table, &self.id, &self.month_year)?,
            decode_mode(table, &self.id, &self.allocation_mode)?,
            decode_loe(table, &self.id, &self.loe)?,
            allocated,
        ))
    }
}

struct RawAllocation {
    id: String,
    project_id: String,
    resource_id: String,
    position_id: String,
    month_year: String,
    allocation_mode: String,
    loe: String,
    position_project_id: Option<String>,
}

impl RawAllocation {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            resource_id: row.get(2)?,
            position_id: row.get(3)?,
            month_year: row.get(4)?,
            allocation_mode: row.get(5)?,
            loe: row.get(6)?,
            position_project_id: row.get(7)?,
        })
    }

    fn into_snapshot(self) -> Result<SnapshotAllocation, StorageError> {
        let table = "allocations";
        let allocation = AllocationRecord::from_stored(
            AllocationId::from_stored(self.id.clone()),
            ProjectId::from_stored(self.project_id),
            ResourceId::from_stored(self.resource_id),
            PositionId::from_stored(self.position_id),
            decode_month(table, &self.id, &self.month_year)?,
            decode_mode(table, &self.id, &self.allocation_mode)?,
            decode_loe(table, &self.id, &self.loe)?,
        );
        let position_project_id = self.position_project_id.map(ProjectId::from_stored);
        Ok(SnapshotAllocation {
            allocation,
            position_project_id,
        })
    }
}

fn corrupt(table: &'static str, id: &str, detail: &str) -> StorageError {
    StorageError::CorruptRow {
        table,
        detail: format!("{id}: {detail}"),
    }
}

fn decode_month(table: &'static str, id: &str, s: &str) -> Result<MonthYear, StorageError> {
    MonthYear::parse(s).map_err(|_| corrupt(table, id, "month_year is not a date"))
}

fn decode_mode(table: &'static str, id: &str, s: &str) -> Result<AllocationMode, StorageError> {
    AllocationMode::parse(s).ok_or_else(|| corrupt(table, id, "unknown allocation_mode"))
}

fn decode_loe(table: &'static str, id: &str, s: &str) -> Result<Decimal, StorageError> {
    Decimal::from_str(s).map_err(|_| corrupt(table, id, "loe is not a decimal"))
}
