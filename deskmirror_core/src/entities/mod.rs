//! Mirrored entity model and the per-type field mapping tables.

pub mod models;
pub mod tables;
