#![forbid(unsafe_code)]

pub mod repo;
pub mod sqlite;
pub mod store;
