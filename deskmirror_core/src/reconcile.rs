//! Entity reconciler: find-or-create by remote id, overwrite scalars, replace
//! child collections.

use crate::entities::models::{
    EntityType, LocalEntity, LocalId, RemoteId, format_timestamp, id_from_value, parse_timestamp,
};
use crate::entities::tables::{ChildKind, EntitySpec, FieldKind, FieldSpec, spec};
use crate::store::traits::{AttachmentWrite, EntityWrite, LocalStore, SqlParam};
use crate::translate::{LocalPayload, RemotePayload, translate_inbound};
use crate::{Error, Result};
use serde_json::{Map, Value};
use std::sync::Arc;

/// How much of the stored row a payload describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// The payload is the whole record: absent keys become `NULL`, every child
    /// collection is rebuilt.
    Full,
    /// Only keys present in the payload are written.
    Partial,
}

/// Follow a dotted path (`contact.email`) through nested objects.
fn lookup<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn to_param(field: &FieldSpec, value: Option<&Value>) -> SqlParam {
    let value = match value {
        None | Some(Value::Null) => {
            return match field.kind {
                FieldKind::Flag => SqlParam::I64(0),
                _ => SqlParam::Null,
            };
        }
        Some(v) => v,
    };

    match field.kind {
        FieldKind::Text => match value {
            Value::String(s) => SqlParam::String(s.clone()),
            other => SqlParam::String(other.to_string()),
        },
        FieldKind::Integer => match value {
            Value::Bool(b) => SqlParam::I64(i64::from(*b)),
            Value::Number(n) if n.is_f64() => n
                .as_f64()
                .map(|f| SqlParam::I64(f as i64))
                .unwrap_or(SqlParam::Null),
            other => id_from_value(other)
                .map(SqlParam::I64)
                .unwrap_or(SqlParam::Null),
        },
        FieldKind::Bool | FieldKind::Flag => match value {
            Value::Bool(b) => SqlParam::I64(i64::from(*b)),
            Value::Number(n) => SqlParam::I64(i64::from(n.as_f64().is_some_and(|f| f != 0.0))),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => SqlParam::I64(1),
                "false" | "0" | "no" => SqlParam::I64(0),
                _ => SqlParam::Null,
            },
            _ => SqlParam::Null,
        },
        FieldKind::Timestamp => {
            match value.as_str().and_then(parse_timestamp) {
                Some(dt) => SqlParam::String(format_timestamp(dt)),
                None => {
                    tracing::warn!(column = field.column, value = %value, "unparseable timestamp stored as null");
                    SqlParam::Null
                }
            }
        }
        FieldKind::Json => SqlParam::String(value.to_string()),
    }
}

fn string_values(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter(|v| !v.is_null())
            .map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn text_of(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Attachment descriptors out of a payload's `attachments` array. Entries
/// without an id are skipped.
pub fn attachment_writes(value: Option<&Value>) -> Vec<AttachmentWrite> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(Value::as_object)
        .filter_map(|obj| {
            let remote_id = obj.get("id").and_then(id_from_value)?;
            Some(AttachmentWrite {
                remote_id: RemoteId(remote_id),
                name: text_of(obj, "name"),
                content_type: text_of(obj, "content_type"),
                size: obj.get("size").and_then(id_from_value),
                attachment_url: text_of(obj, "attachment_url"),
                created_at: text_of(obj, "created_at"),
                updated_at: text_of(obj, "updated_at"),
            })
        })
        .collect()
}

/// Map a translated payload onto a storage write.
pub fn build_write(spec: &EntitySpec, payload: &LocalPayload, mode: WriteMode) -> Result<EntityWrite> {
    let remote_id = payload.id().ok_or_else(|| {
        Error::InvalidInput(format!("{} payload has no remote id", spec.entity_type))
    })?;
    let map = payload.as_map();
    let mut write = EntityWrite::new(RemoteId(remote_id));

    for field in spec.fields {
        if mode == WriteMode::Partial && !map.contains_key(field.root_key()) {
            continue;
        }
        write
            .scalars
            .push((field.column, to_param(field, lookup(map, field.path))));
    }

    for child in spec.children {
        let value = map.get(child.path);
        if mode == WriteMode::Partial && value.is_none() {
            continue;
        }
        match child.kind {
            ChildKind::Values => write.values.push((child.collection, string_values(value))),
            ChildKind::CustomFields => {
                write.custom_fields = Some(
                    value
                        .and_then(Value::as_object)
                        .cloned()
                        .unwrap_or_default(),
                );
            }
            ChildKind::Attachments => write.attachments = Some(attachment_writes(value)),
        }
    }

    Ok(write)
}

/// Writes translated payloads into the local store.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn LocalStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn LocalStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    /// Insert or fully overwrite the row for `payload.id`.
    #[tracing::instrument(level = "debug", skip(self, payload), fields(remote_id = ?payload.id()))]
    pub async fn upsert(&self, entity_type: EntityType, payload: &LocalPayload) -> Result<LocalEntity> {
        self.write(entity_type, payload, WriteMode::Full).await
    }

    /// Write only the keys present in `payload`.
    #[tracing::instrument(level = "debug", skip(self, payload), fields(remote_id = ?payload.id()))]
    pub async fn upsert_partial(
        &self,
        entity_type: EntityType,
        payload: &LocalPayload,
    ) -> Result<LocalEntity> {
        self.write(entity_type, payload, WriteMode::Partial).await
    }

    /// Translate a remote payload inbound, then `upsert` it.
    pub async fn upsert_remote(
        &self,
        entity_type: EntityType,
        payload: RemotePayload,
    ) -> Result<LocalEntity> {
        let local = translate_inbound(self.store.as_ref(), entity_type, payload).await?;
        self.upsert(entity_type, &local).await
    }

    async fn write(
        &self,
        entity_type: EntityType,
        payload: &LocalPayload,
        mode: WriteMode,
    ) -> Result<LocalEntity> {
        let write = build_write(spec(entity_type), payload, mode)?;
        let entity = self.store.write_entity(entity_type, &write).await?;

        if entity_type == EntityType::Group {
            let members = payload.get("agent_ids");
            if members.is_some() || mode == WriteMode::Full {
                let ids: Vec<LocalId> = match members {
                    Some(Value::Array(items)) => {
                        items.iter().filter_map(id_from_value).map(LocalId).collect()
                    }
                    _ => Vec::new(),
                };
                self.store
                    .replace_group_members(entity.local_id, &ids)
                    .await?;
            }
        }

        Ok(entity)
    }
}
