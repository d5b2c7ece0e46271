#![forbid(unsafe_code)]

pub mod reconcile;
pub mod repair;
