#![forbid(unsafe_code)]

pub mod reconcile_check;
pub mod reconcile_report;
