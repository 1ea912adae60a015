//! Foreign-key translation between local surrogate ids and remote ids.
//!
//! Payloads carry their direction in the type: `LocalPayload` holds local ids,
//! `RemotePayload` holds remote ids, and only the two functions below convert
//! between them.

use crate::entities::models::{EntityType, LocalId, RemoteId, id_from_value};
use crate::entities::tables::{ForeignKey, spec};
use crate::store::traits::LocalStore;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

macro_rules! payload_type {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Map<String, Value>);

        impl $name {
            pub fn new(map: Map<String, Value>) -> Self {
                Self(map)
            }

            /// Wrap a JSON object; anything else is rejected.
            pub fn from_value(value: Value) -> Result<Self> {
                match value {
                    Value::Object(map) => Ok(Self(map)),
                    other => Err(Error::InvalidInput(format!(
                        "expected a JSON object payload, got {other}"
                    ))),
                }
            }

            pub fn get(&self, key: &str) -> Option<&Value> {
                self.0.get(key)
            }

            pub fn contains_key(&self, key: &str) -> bool {
                self.0.contains_key(key)
            }

            pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
                self.0.insert(key.into(), value.into());
            }

            /// The `id` key read as an integer.
            pub fn id(&self) -> Option<i64> {
                self.get("id").and_then(id_from_value)
            }

            pub fn as_map(&self) -> &Map<String, Value> {
                &self.0
            }

            pub fn into_inner(self) -> Map<String, Value> {
                self.0
            }

            pub fn into_value(self) -> Value {
                Value::Object(self.0)
            }
        }

        impl From<Map<String, Value>> for $name {
            fn from(map: Map<String, Value>) -> Self {
                Self(map)
            }
        }
    };
}

payload_type!(
    LocalPayload,
    "A payload whose foreign-key fields hold local ids."
);
payload_type!(
    RemotePayload,
    "A payload whose foreign-key fields hold remote ids, as sent to or received from the helpdesk."
);

#[derive(Debug, Clone, Copy)]
enum Direction {
    Outbound,
    Inbound,
}

async fn map_id(
    store: &dyn LocalStore,
    direction: Direction,
    target: EntityType,
    id: i64,
) -> Result<Option<i64>> {
    Ok(match direction {
        Direction::Outbound => store.remote_id_for(target, LocalId(id)).await?.map(|r| r.0),
        Direction::Inbound => store.local_id_for(target, RemoteId(id)).await?.map(|l| l.0),
    })
}

async fn translate_value(
    store: &dyn LocalStore,
    direction: Direction,
    fk: &ForeignKey,
    target: EntityType,
    value: &Value,
) -> Result<Value> {
    if fk.many {
        let Value::Array(items) = value else {
            return Ok(Value::Null);
        };
        let mut out = Vec::with_capacity(items.len());
        for id in items.iter().filter_map(id_from_value) {
            if let Some(mapped) = map_id(store, direction, target, id).await? {
                out.push(Value::from(mapped));
            }
        }
        return Ok(Value::Array(out));
    }

    match id_from_value(value) {
        Some(id) => Ok(map_id(store, direction, target, id)
            .await?
            .map(Value::from)
            .unwrap_or(Value::Null)),
        None => Ok(Value::Null),
    }
}

#[tracing::instrument(level = "debug", skip(store, map))]
async fn rewrite(
    store: &dyn LocalStore,
    entity_type: EntityType,
    direction: Direction,
    mut map: Map<String, Value>,
) -> Result<Map<String, Value>> {
    for fk in spec(entity_type).foreign_keys {
        let target = fk.target_for(&map);
        let Some(value) = map.get(fk.field) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        let translated = translate_value(store, direction, fk, target, value).await?;
        map.insert(fk.field.to_string(), translated);
    }
    Ok(map)
}

/// Replace every local id in a foreign-key field with the referenced row's
/// remote id. Ids with no local row become `null` (or drop out of id arrays).
pub async fn translate_outbound(
    store: &dyn LocalStore,
    entity_type: EntityType,
    payload: LocalPayload,
) -> Result<RemotePayload> {
    rewrite(store, entity_type, Direction::Outbound, payload.0)
        .await
        .map(RemotePayload)
}

/// Replace every remote id in a foreign-key field with the local id of the
/// row mirroring it. Unknown remote ids become `null`.
pub async fn translate_inbound(
    store: &dyn LocalStore,
    entity_type: EntityType,
    payload: RemotePayload,
) -> Result<LocalPayload> {
    rewrite(store, entity_type, Direction::Inbound, payload.0)
        .await
        .map(LocalPayload)
}
