use crate::entities::models::{EntityType, LocalEntity, LocalId, RemoteId};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A bound value for a scalar column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Null,
    I64(i64),
    F64(f64),
    String(String),
}

/// An attachment as described by the remote payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentWrite {
    pub remote_id: RemoteId,
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub size: Option<i64>,
    pub attachment_url: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// One reconciled row ready to be written.
///
/// `scalars` lists the columns to write; on conflict only those columns are
/// overwritten. Each `Some` child collection replaces the stored one
/// wholesale; `None` leaves it untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityWrite {
    pub remote_id: RemoteId,
    pub scalars: Vec<(&'static str, SqlParam)>,
    pub values: Vec<(&'static str, Vec<String>)>,
    pub custom_fields: Option<Map<String, Value>>,
    pub attachments: Option<Vec<AttachmentWrite>>,
}

impl EntityWrite {
    pub fn new(remote_id: RemoteId) -> Self {
        Self {
            remote_id,
            scalars: Vec::new(),
            values: Vec::new(),
            custom_fields: None,
            attachments: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListFilter {
    pub column: String,
    /// `null` matches `IS NULL`.
    pub value: Value,
}

/// Ordered, paginated, filtered listing of one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub filters: Vec<ListFilter>,
    /// Only rows carrying this value in their `tags` collection.
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub order_by: Option<String>,
    #[serde(default)]
    pub descending: bool,
    #[serde(default)]
    pub include_deleted: bool,
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            tag: None,
            order_by: None,
            descending: false,
            include_deleted: false,
            limit: 100,
            offset: 0,
        }
    }
}

impl ListQuery {
    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(ListFilter {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

/// The local mirror.
///
/// All lookups by remote id go through this trait; the engine keeps no id
/// cache of its own.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, entity_type: EntityType, local_id: LocalId) -> Result<Option<LocalEntity>>;

    async fn find_by_remote_id(
        &self,
        entity_type: EntityType,
        remote_id: RemoteId,
    ) -> Result<Option<LocalEntity>>;

    async fn local_id_for(
        &self,
        entity_type: EntityType,
        remote_id: RemoteId,
    ) -> Result<Option<LocalId>>;

    async fn remote_id_for(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
    ) -> Result<Option<RemoteId>>;

    /// Number of rows, soft-deleted ones included.
    async fn count(&self, entity_type: EntityType) -> Result<u64>;

    async fn max_updated_at(&self, entity_type: EntityType) -> Result<Option<DateTime<Utc>>>;

    /// Insert-or-update keyed by the type's identity columns, replacing the
    /// given child collections in the same transaction.
    async fn write_entity(&self, entity_type: EntityType, write: &EntityWrite)
    -> Result<LocalEntity>;

    /// Upsert attachments by remote id under one parent without touching
    /// attachments absent from `attachments` or local-only metadata.
    async fn merge_attachments(
        &self,
        parent_type: EntityType,
        parent_id: LocalId,
        attachments: &[AttachmentWrite],
    ) -> Result<u64>;

    async fn mark_fetched(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn soft_delete(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Remove the row and its child rows.
    async fn hard_delete(&self, entity_type: EntityType, local_id: LocalId) -> Result<()>;

    /// Repoint `owner.column` from any of `from` to `to`; returns rows changed.
    async fn reassign_references(
        &self,
        owner: EntityType,
        column: &str,
        from: &[LocalId],
        to: LocalId,
    ) -> Result<u64>;

    async fn replace_group_members(&self, group_id: LocalId, agent_ids: &[LocalId]) -> Result<()>;

    async fn group_members(&self, group_id: LocalId) -> Result<Vec<LocalId>>;

    async fn list(&self, entity_type: EntityType, query: &ListQuery) -> Result<Vec<LocalEntity>>;
}
