#![forbid(unsafe_code)]

pub mod ph1vis;
pub mod policy_store;
pub mod vis_events;
