//! deskmirror core library: a local SQLite mirror of a remote helpdesk.
//!
//! Sync, id translation, staleness-gated reads and merge replay live here;
//! the HTTP transport is plugged in through `RemoteApi`.

pub mod config;
pub mod entities;
pub mod error;
pub mod merge;
pub mod mirror;
pub mod o11y;
pub mod reconcile;
pub mod refresh;
pub mod remote;
pub mod store;
pub mod sync;
pub mod translate;
pub mod writes;

#[cfg(test)]
mod test_support;

pub use config::MirrorConfig;
pub use entities::models::{
    AttachmentRecord, EntityType, IdParseError, LocalEntity, LocalId, RemoteId,
};
pub use error::{Error, Result};
pub use merge::{MergeNote, MergeOutcome, TicketMergeOptions};
pub use mirror::MirrorEngine;
pub use reconcile::Reconciler;
pub use refresh::TicketReader;
pub use remote::error::{FieldError, RemoteError, RemoteResult};
pub use remote::traits::{RemoteApi, UploadFile};
pub use store::{ListFilter, ListQuery, LocalStore, SqliteStore};
pub use sync::engine::SyncOrchestrator;
pub use sync::models::{SyncMode, SyncOutcome, SyncReport};
pub use translate::{LocalPayload, RemotePayload, translate_inbound, translate_outbound};
