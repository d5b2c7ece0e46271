#![forbid(unsafe_code)]

use rust_decimal::Decimal;

use crate::common::string_id;
use crate::position::{validate_loe, AllocationMode, MonthYear, PositionId, ProjectId};
use crate::{ContractViolation, SchemaVersion, Validate};

pub const ALLOCATION_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

string_id!(AllocationId, "allocation_id");
string_id!(
    /// Person or contractor that can be allocated.
    ResourceId,
    "resource_id"
);

/// One resource assigned to one position for one month. The position is
/// referenced, not owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub schema_version: SchemaVersion,
    pub allocation_id: AllocationId,
    pub project_id: ProjectId,
    pub resource_id: ResourceId,
    pub position_id: PositionId,
    pub month_year: MonthYear,
    pub allocation_mode: AllocationMode,
    pub loe: Decimal,
}

impl AllocationRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        allocation_id: AllocationId,
        project_id: ProjectId,
        resource_id: ResourceId,
        position_id: PositionId,
        month_year: MonthYear,
        allocation_mode: AllocationMode,
        loe: Decimal,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: ALLOCATION_CONTRACT_VERSION,
            allocation_id,
            project_id,
            resource_id,
            position_id,
            month_year,
            allocation_mode,
            loe,
        };
        r.validate()?;
        Ok(r)
    }

    /// Row loaded from a store, without the write-side field rules.
    #[allow(clippy::too_many_arguments)]
    pub fn from_stored(
        allocation_id: AllocationId,
        project_id: ProjectId,
        resource_id: ResourceId,
        position_id: PositionId,
        month_year: MonthYear,
        allocation_mode: AllocationMode,
        loe: Decimal,
    ) -> Self {
        Self {
            schema_version: ALLOCATION_CONTRACT_VERSION,
            allocation_id,
            project_id,
            resource_id,
            position_id,
            month_year,
            allocation_mode,
            loe,
        }
    }
}

impl Validate for AllocationRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != ALLOCATION_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "allocation_record.schema_version",
                reason: "must match ALLOCATION_CONTRACT_VERSION",
            });
        }
        self.allocation_id.validate()?;
        self.project_id.validate()?;
        self.resource_id.validate()?;
        self.position_id.validate()?;
        validate_loe("allocation_record.loe", self.allocation_mode, self.loe)
    }
}
