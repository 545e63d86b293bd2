#![forbid(unsafe_code)]

pub mod common;
pub mod ph1vis;

pub use common::{ContractViolation, MonotonicTimeNs, ReasonCodeId, SchemaVersion, Validate};
