#![forbid(unsafe_code)]

use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::common::{string_id, validate_text};
use crate::{ContractViolation, SchemaVersion, Validate};

pub const POSITION_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

string_id!(
    /// Owning project of positions and allocations.
    ProjectId,
    "project_id"
);
string_id!(PositionId, "position_id");

/// Calendar month at first-of-month granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MonthYear {
    year: u16,
    month: u8,
}

impl MonthYear {
    pub fn new(year: u16, month: u8) -> Result<Self, ContractViolation> {
        if !(1..=12).contains(&month) {
            return Err(ContractViolation::InvalidRange {
                field: "month_year.month",
                min: 1.0,
                max: 12.0,
                got: month as f64,
            });
        }
        if !(1900..=9999).contains(&year) {
            return Err(ContractViolation::InvalidRange {
                field: "month_year.year",
                min: 1900.0,
                max: 9999.0,
                got: year as f64,
            });
        }
        Ok(Self { year, month })
    }

    /// Accepts `YYYY-MM`, `YYYY-MM-DD`, or an ISO timestamp. Only the
    /// year-month portion is kept; a supplied day must exist in that month.
    pub fn parse(s: &str) -> Result<Self, ContractViolation> {
        let s = s.trim();
        let date_part = s.split(['T', ' ']).next().unwrap_or(s);
        match date_part.len() {
            7 => {
                let date = NaiveDate::parse_from_str(&format!("{date_part}-01"), "%Y-%m-%d")
                    .map_err(|_| ContractViolation::InvalidValue {
                        field: "month_year",
                        reason: "must be YYYY-MM",
                    })?;
                Self::from_date(date)
            }
            10 => {
                let date = NaiveDate::parse_from_str(date_part, "%Y-%m-%d").map_err(|_| {
                    ContractViolation::InvalidValue {
                        field: "month_year",
                        reason: "must be a calendar date YYYY-MM-DD",
                    }
                })?;
                Self::from_date(date)
            }
            _ => Err(ContractViolation::InvalidValue {
                field: "month_year",
                reason: "must be YYYY-MM or YYYY-MM-DD",
            }),
        }
    }

    pub fn from_date(date: NaiveDate) -> Result<Self, ContractViolation> {
        use chrono::Datelike;
        let year = u16::try_from(date.year()).map_err(|_| ContractViolation::InvalidValue {
            field: "month_year.year",
            reason: "must be a positive year",
        })?;
        Self::new(year, date.month() as u8)
    }

    pub fn year(&self) -> u16 {
        self.year
    }

    pub fn month(&self) -> u8 {
        self.month
    }

    /// Storage form, `YYYY-MM-01`.
    pub fn first_of_month(&self) -> String {
        format!("{:04}-{:02}-01", self.year, self.month)
    }
}

impl fmt::Display for MonthYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationMode {
    Percentage,
    Days,
}

impl AllocationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationMode::Percentage => "percentage",
            AllocationMode::Days => "days",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "percentage" | "percent" | "%" => Some(AllocationMode::Percentage),
            "days" | "day" => Some(AllocationMode::Days),
            _ => None,
        }
    }
}

/// Stored `Allocated` flag on a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AllocatedFlag {
    Yes,
    No,
}

impl AllocatedFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocatedFlag::Yes => "Yes",
            AllocatedFlag::No => "No",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Yes" => Some(AllocatedFlag::Yes),
            "No" => Some(AllocatedFlag::No),
            _ => None,
        }
    }

    /// Flag value demanded by I1 for the given number of live, project-matching links.
    pub fn for_link_count(links: usize) -> Self {
        if links == 1 {
            AllocatedFlag::Yes
        } else {
            AllocatedFlag::No
        }
    }
}

impl fmt::Display for AllocatedFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionRecord {
    pub schema_version: SchemaVersion,
    pub position_id: PositionId,
    pub project_id: ProjectId,
    pub task_ref: String,
    pub name: String,
    pub month_year: MonthYear,
    pub allocation_mode: AllocationMode,
    pub loe: Decimal,
    pub allocated: AllocatedFlag,
}

impl PositionRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        position_id: PositionId,
        project_id: ProjectId,
        task_ref: String,
        name: String,
        month_year: MonthYear,
        allocation_mode: AllocationMode,
        loe: Decimal,
        allocated: AllocatedFlag,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: POSITION_CONTRACT_VERSION,
            position_id,
            project_id,
            task_ref,
            name,
            month_year,
            allocation_mode,
            loe,
            allocated,
        };
        r.validate()?;
        Ok(r)
    }

    /// Row loaded from a store. Reconciliation has to see every row another
    /// writer left behind, so the write-side field rules are not applied.
    #[allow(clippy::too_many_arguments)]
    pub fn from_stored(
        position_id: PositionId,
        project_id: ProjectId,
        task_ref: String,
        name: String,
        month_year: MonthYear,
        allocation_mode: AllocationMode,
        loe: Decimal,
        allocated: AllocatedFlag,
    ) -> Self {
        Self {
            schema_version: POSITION_CONTRACT_VERSION,
            position_id,
            project_id,
            task_ref,
            name,
            month_year,
            allocation_mode,
            loe,
            allocated,
        }
    }
}

impl Validate for PositionRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != POSITION_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "position_record.schema_version",
                reason: "must match POSITION_CONTRACT_VERSION",
            });
        }
        self.position_id.validate()?;
        self.project_id.validate()?;
        validate_text("position_record.task_ref", &self.task_ref, 256)?;
        validate_text("position_record.name", &self.name, 256)?;
        validate_loe("position_record.loe", self.allocation_mode, self.loe)
    }
}

pub(crate) fn validate_loe(
    field: &'static str,
    mode: AllocationMode,
    loe: Decimal,
) -> Result<(), ContractViolation> {
    if loe < Decimal::ZERO {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be >= 0",
        });
    }
    if mode == AllocationMode::Percentage && loe > Decimal::ONE_HUNDRED {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "percentage must be <= 100",
        });
    }
    Ok(())
}
