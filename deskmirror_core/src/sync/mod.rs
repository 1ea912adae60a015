//! Sync orchestration: walks the remote API per entity type and reconciles
//! every record into the local mirror.
//!
//! - `models`: run modes and the per-type report
//! - `paging`: page/per_page pagination over list endpoints
//! - `engine`: the ordered, failure-isolated sync run

pub mod engine;
pub mod models;
pub mod paging;
