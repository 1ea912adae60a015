//! Local mirror storage.

pub mod sqlite;
pub mod traits;

pub use sqlite::SqliteStore;
pub use traits::{AttachmentWrite, EntityWrite, ListFilter, ListQuery, LocalStore, SqlParam};
