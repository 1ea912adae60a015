use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("invalid id: {0}")]
    InvalidId(String),

    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),
}

/// Locally generated surrogate key of a mirrored row.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalId(pub i64);

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for LocalId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl FromStr for LocalId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = s
            .trim()
            .parse::<i64>()
            .map_err(|_| IdParseError::InvalidId(s.to_string()))?;
        Ok(Self(id))
    }
}

/// Identifier assigned by the remote helpdesk.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(pub i64);

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i64> for RemoteId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Reads an integer id out of a JSON value. Numeric strings are accepted
/// because some remote endpoints echo ids as strings.
pub fn id_from_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// Every kind of row the mirror keeps.
///
/// Declaration order is the canonical sync order; `Conversation` comes last
/// because conversations are only ever pulled through their tickets.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Company,
    Contact,
    Agent,
    Group,
    Ticket,
    CannedResponse,
    Conversation,
}

impl EntityType {
    /// Companies and people first so ticket foreign keys resolve.
    pub const SYNC_ORDER: [EntityType; 6] = [
        EntityType::Company,
        EntityType::Contact,
        EntityType::Agent,
        EntityType::Group,
        EntityType::Ticket,
        EntityType::CannedResponse,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Company => "company",
            EntityType::Contact => "contact",
            EntityType::Agent => "agent",
            EntityType::Group => "group",
            EntityType::Ticket => "ticket",
            EntityType::CannedResponse => "canned_response",
            EntityType::Conversation => "conversation",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        let ty = match normalized.trim_end_matches('s') {
            "company" | "companie" => EntityType::Company,
            "contact" => EntityType::Contact,
            "agent" => EntityType::Agent,
            "group" => EntityType::Group,
            "ticket" => EntityType::Ticket,
            "canned_response" => EntityType::CannedResponse,
            "conversation" => EntityType::Conversation,
            _ => return Err(IdParseError::UnknownEntityType(s.to_string())),
        };
        Ok(ty)
    }
}

/// An attachment row. `local_path` is local-only metadata (e.g. a cached
/// download) and is never overwritten by remote data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub size: Option<i64>,
    pub attachment_url: Option<String>,
    pub local_path: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// A mirrored row together with its child collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntity {
    pub entity_type: EntityType,
    pub local_id: LocalId,
    pub gid: Uuid,
    pub remote_id: RemoteId,
    /// Scalar columns keyed by column name.
    pub fields: Map<String, Value>,
    /// String collections (tags, domains, emails, ...) keyed by collection name.
    #[serde(default)]
    pub values: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub custom_fields: Map<String, Value>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub last_fetched_at: Option<DateTime<Utc>>,
}

impl LocalEntity {
    pub fn field(&self, column: &str) -> Option<&Value> {
        self.fields.get(column).filter(|v| !v.is_null())
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.field(column).and_then(Value::as_str)
    }

    /// A foreign-key column as a local id.
    pub fn reference(&self, column: &str) -> Option<LocalId> {
        self.field(column).and_then(id_from_value).map(LocalId)
    }

    /// Values of a string collection, empty when the collection is unknown.
    pub fn values_of(&self, collection: &str) -> &[String] {
        self.values
            .get(collection)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Canonical text form of stored timestamps. Fixed width so `MAX()` over the
/// column orders chronologically.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_parses_plural_and_kebab_forms() {
        assert_eq!("tickets".parse::<EntityType>().unwrap(), EntityType::Ticket);
        assert_eq!(
            "canned-responses".parse::<EntityType>().unwrap(),
            EntityType::CannedResponse
        );
        assert_eq!(
            "companies".parse::<EntityType>().unwrap(),
            EntityType::Company
        );
        assert!("widgets".parse::<EntityType>().is_err());
    }

    #[test]
    fn sync_order_puts_tickets_after_their_references() {
        let pos = |t| EntityType::SYNC_ORDER.iter().position(|x| *x == t).unwrap();
        assert!(pos(EntityType::Company) < pos(EntityType::Ticket));
        assert!(pos(EntityType::Contact) < pos(EntityType::Ticket));
        assert!(pos(EntityType::Agent) < pos(EntityType::Group));
        assert!(pos(EntityType::Group) < pos(EntityType::Ticket));
        assert!(!EntityType::SYNC_ORDER.contains(&EntityType::Conversation));
    }

    #[test]
    fn timestamps_normalize_to_utc_seconds() {
        let dt = parse_timestamp("2024-03-01T10:00:00+02:00").unwrap();
        assert_eq!(format_timestamp(dt), "2024-03-01T08:00:00Z");
    }

    #[test]
    fn ids_accept_numeric_strings() {
        assert_eq!(id_from_value(&serde_json::json!(42)), Some(42));
        assert_eq!(id_from_value(&serde_json::json!("42")), Some(42));
        assert_eq!(id_from_value(&serde_json::json!(null)), None);
    }
}
