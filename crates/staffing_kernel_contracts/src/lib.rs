#![forbid(unsafe_code)]

pub mod allocation;
pub mod common;
pub mod position;
pub mod reconcile;

pub use common::{
    ContractViolation, CorrelationId, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate,
};
