//! Field mapping tables: how each remote payload lands in the local schema.

use crate::entities::models::EntityType;
use serde_json::{Map, Value};

/// Storage kind of a scalar column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Bool,
    /// Boolean that is stored as `false` when the payload omits it.
    Flag,
    /// RFC 3339 timestamp, normalized to UTC seconds.
    Timestamp,
    /// Arbitrary JSON kept verbatim as text.
    Json,
}

/// One scalar column and where its value lives in the remote payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub column: &'static str,
    /// Dotted path into the payload (`contact.email`).
    pub path: &'static str,
    pub kind: FieldKind,
}

impl FieldSpec {
    const fn new(column: &'static str, kind: FieldKind) -> Self {
        Self {
            column,
            path: column,
            kind,
        }
    }

    const fn text(column: &'static str) -> Self {
        Self::new(column, FieldKind::Text)
    }

    const fn int(column: &'static str) -> Self {
        Self::new(column, FieldKind::Integer)
    }

    const fn bool(column: &'static str) -> Self {
        Self::new(column, FieldKind::Bool)
    }

    const fn ts(column: &'static str) -> Self {
        Self::new(column, FieldKind::Timestamp)
    }

    const fn json(column: &'static str) -> Self {
        Self::new(column, FieldKind::Json)
    }

    const fn at(mut self, path: &'static str) -> Self {
        self.path = path;
        self
    }

    /// Top-level payload key this field is read from.
    pub fn root_key(&self) -> &'static str {
        match self.path.split_once('.') {
            Some((root, _)) => root,
            None => self.path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    /// Array of strings.
    Values,
    /// Object of name -> JSON value.
    CustomFields,
    /// Array of attachment objects.
    Attachments,
}

/// A child collection rebuilt from a payload array/object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSpec {
    pub collection: &'static str,
    pub path: &'static str,
    pub kind: ChildKind,
}

impl ChildSpec {
    const fn values(collection: &'static str) -> Self {
        Self {
            collection,
            path: collection,
            kind: ChildKind::Values,
        }
    }

    const fn custom_fields() -> Self {
        Self {
            collection: "custom_fields",
            path: "custom_fields",
            kind: ChildKind::CustomFields,
        }
    }

    const fn attachments() -> Self {
        Self {
            collection: "attachments",
            path: "attachments",
            kind: ChildKind::Attachments,
        }
    }
}

/// A payload field that references another entity by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub field: &'static str,
    pub target: EntityType,
    /// The field holds an array of ids rather than one id.
    pub many: bool,
    /// Authorship-style references that keep pointing at the original row
    /// when that row is merged away.
    pub keeps_history: bool,
    /// `(flag, other)`: when the payload's `flag` is `false` the id refers to
    /// `other` instead of `target`.
    pub unless: Option<(&'static str, EntityType)>,
}

impl ForeignKey {
    const fn one(field: &'static str, target: EntityType) -> Self {
        Self {
            field,
            target,
            many: false,
            keeps_history: false,
            unless: None,
        }
    }

    const fn many(field: &'static str, target: EntityType) -> Self {
        Self {
            field,
            target,
            many: true,
            keeps_history: false,
            unless: None,
        }
    }

    const fn history(mut self) -> Self {
        self.keeps_history = true;
        self
    }

    const fn unless(mut self, flag: &'static str, other: EntityType) -> Self {
        self.unless = Some((flag, other));
        self
    }

    /// The entity type the id in `payload` refers to.
    pub fn target_for(&self, payload: &Map<String, Value>) -> EntityType {
        match self.unless {
            Some((flag, other)) if payload.get(flag) == Some(&Value::Bool(false)) => other,
            _ => self.target,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySpec {
    pub entity_type: EntityType,
    pub table: &'static str,
    /// Remote collection path, also the base for `/{id}` record paths.
    pub remote_path: &'static str,
    pub fields: &'static [FieldSpec],
    pub children: &'static [ChildSpec],
    pub foreign_keys: &'static [ForeignKey],
    /// Columns forming the upsert conflict target.
    pub identity: &'static [&'static str],
    /// Extra predicate selecting rows that are addressable by remote id.
    pub remote_lookup_filter: Option<&'static str>,
}

impl EntitySpec {
    pub fn field(&self, column: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.column == column)
    }

    pub fn foreign_key(&self, field: &str) -> Option<&'static ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.field == field)
    }

    pub fn record_path(&self, remote_id: impl std::fmt::Display) -> String {
        format!("{}/{}", self.remote_path, remote_id)
    }

    /// Whether `column` may appear in a filter or ORDER BY.
    pub fn is_queryable(&self, column: &str) -> bool {
        matches!(column, "local_id" | "remote_id" | "gid" | "deleted_at" | "last_fetched_at")
            || self.field(column).is_some()
    }
}

const COMPANY_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("name"),
    FieldSpec::text("description"),
    FieldSpec::text("note"),
    FieldSpec::text("health_score"),
    FieldSpec::text("account_tier"),
    FieldSpec::text("renewal_date"),
    FieldSpec::text("industry"),
    FieldSpec::ts("created_at"),
    FieldSpec::ts("updated_at"),
];

const CONTACT_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("name"),
    FieldSpec::text("email"),
    FieldSpec::text("phone"),
    FieldSpec::text("mobile"),
    FieldSpec::text("twitter_id"),
    FieldSpec::text("unique_external_id"),
    FieldSpec::text("job_title"),
    FieldSpec::text("language"),
    FieldSpec::text("time_zone"),
    FieldSpec::text("address"),
    FieldSpec::text("description"),
    FieldSpec::int("company_id"),
    FieldSpec::bool("view_all_tickets"),
    FieldSpec::bool("active"),
    FieldSpec::ts("created_at"),
    FieldSpec::ts("updated_at"),
];

const AGENT_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("name").at("contact.name"),
    FieldSpec::text("email").at("contact.email"),
    FieldSpec::text("phone").at("contact.phone"),
    FieldSpec::text("mobile").at("contact.mobile"),
    FieldSpec::text("job_title").at("contact.job_title"),
    FieldSpec::text("language").at("contact.language"),
    FieldSpec::text("time_zone").at("contact.time_zone"),
    FieldSpec::bool("active").at("contact.active"),
    FieldSpec::bool("available"),
    FieldSpec::bool("occasional"),
    FieldSpec::int("ticket_scope"),
    FieldSpec::text("signature"),
    FieldSpec::text("agent_type").at("type"),
    FieldSpec::ts("last_active_at"),
    FieldSpec::ts("created_at"),
    FieldSpec::ts("updated_at"),
];

const GROUP_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("name"),
    FieldSpec::text("description"),
    FieldSpec::int("escalate_to"),
    FieldSpec::text("unassigned_for"),
    FieldSpec::int("business_hour_id"),
    FieldSpec::json("auto_ticket_assign"),
    FieldSpec::ts("created_at"),
    FieldSpec::ts("updated_at"),
];

const TICKET_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("subject"),
    FieldSpec::text("description"),
    FieldSpec::text("description_text"),
    FieldSpec::int("status"),
    FieldSpec::int("priority"),
    FieldSpec::int("source"),
    FieldSpec::text("ticket_type").at("type"),
    FieldSpec::int("requester_id"),
    FieldSpec::int("responder_id"),
    FieldSpec::int("company_id"),
    FieldSpec::int("group_id"),
    FieldSpec::int("product_id"),
    FieldSpec::int("email_config_id"),
    FieldSpec::ts("due_by"),
    FieldSpec::ts("fr_due_by"),
    FieldSpec::bool("is_escalated"),
    FieldSpec::bool("fr_escalated"),
    FieldSpec::bool("spam"),
    FieldSpec::ts("created_at"),
    FieldSpec::ts("updated_at"),
];

const CONVERSATION_FIELDS: &[FieldSpec] = &[
    FieldSpec::int("ticket_id"),
    FieldSpec::int("user_id"),
    FieldSpec::text("body"),
    FieldSpec::text("body_text"),
    FieldSpec::bool("incoming"),
    FieldSpec::bool("private"),
    FieldSpec::int("source"),
    FieldSpec::text("support_email"),
    FieldSpec::text("from_email"),
    FieldSpec::json("to_emails"),
    FieldSpec::json("cc_emails"),
    FieldSpec::new("is_description", FieldKind::Flag),
    FieldSpec::ts("created_at"),
    FieldSpec::ts("updated_at"),
];

const CANNED_RESPONSE_FIELDS: &[FieldSpec] = &[
    FieldSpec::text("title"),
    FieldSpec::text("content"),
    FieldSpec::text("content_html"),
    FieldSpec::int("folder_id"),
    FieldSpec::int("visibility"),
    FieldSpec::ts("created_at"),
    FieldSpec::ts("updated_at"),
];

const BY_REMOTE_ID: &[&str] = &["remote_id"];

static COMPANY: EntitySpec = EntitySpec {
    entity_type: EntityType::Company,
    table: "companies",
    remote_path: "/api/v2/companies",
    fields: COMPANY_FIELDS,
    children: &[ChildSpec::values("domains"), ChildSpec::custom_fields()],
    foreign_keys: &[],
    identity: BY_REMOTE_ID,
    remote_lookup_filter: None,
};

static CONTACT: EntitySpec = EntitySpec {
    entity_type: EntityType::Contact,
    table: "contacts",
    remote_path: "/api/v2/contacts",
    fields: CONTACT_FIELDS,
    children: &[
        ChildSpec::values("other_emails"),
        ChildSpec::values("tags"),
        ChildSpec::custom_fields(),
    ],
    foreign_keys: &[ForeignKey::one("company_id", EntityType::Company)],
    identity: BY_REMOTE_ID,
    remote_lookup_filter: None,
};

static AGENT: EntitySpec = EntitySpec {
    entity_type: EntityType::Agent,
    table: "agents",
    remote_path: "/api/v2/agents",
    fields: AGENT_FIELDS,
    children: &[ChildSpec::values("role_ids")],
    foreign_keys: &[],
    identity: BY_REMOTE_ID,
    remote_lookup_filter: None,
};

static GROUP: EntitySpec = EntitySpec {
    entity_type: EntityType::Group,
    table: "helpdesk_groups",
    remote_path: "/api/v2/groups",
    fields: GROUP_FIELDS,
    children: &[],
    foreign_keys: &[
        ForeignKey::one("escalate_to", EntityType::Agent),
        ForeignKey::many("agent_ids", EntityType::Agent),
    ],
    identity: BY_REMOTE_ID,
    remote_lookup_filter: None,
};

static TICKET: EntitySpec = EntitySpec {
    entity_type: EntityType::Ticket,
    table: "tickets",
    remote_path: "/api/v2/tickets",
    fields: TICKET_FIELDS,
    children: &[
        ChildSpec::values("tags"),
        ChildSpec::values("cc_emails"),
        ChildSpec::custom_fields(),
    ],
    foreign_keys: &[
        ForeignKey::one("requester_id", EntityType::Contact),
        ForeignKey::one("responder_id", EntityType::Agent),
        ForeignKey::one("company_id", EntityType::Company),
        ForeignKey::one("group_id", EntityType::Group),
    ],
    identity: BY_REMOTE_ID,
    remote_lookup_filter: None,
};

static CONVERSATION: EntitySpec = EntitySpec {
    entity_type: EntityType::Conversation,
    table: "conversations",
    remote_path: "/api/v2/conversations",
    fields: CONVERSATION_FIELDS,
    children: &[ChildSpec::attachments()],
    foreign_keys: &[
        ForeignKey::one("ticket_id", EntityType::Ticket).history(),
        // Incoming messages are written by contacts, replies and notes by agents.
        ForeignKey::one("user_id", EntityType::Contact)
            .history()
            .unless("incoming", EntityType::Agent),
    ],
    // The description pseudo-conversation borrows its ticket's remote id.
    identity: &["remote_id", "is_description"],
    remote_lookup_filter: Some("is_description = 0"),
};

static CANNED_RESPONSE: EntitySpec = EntitySpec {
    entity_type: EntityType::CannedResponse,
    table: "canned_responses",
    remote_path: "/api/v2/canned_responses",
    fields: CANNED_RESPONSE_FIELDS,
    children: &[ChildSpec::attachments()],
    foreign_keys: &[],
    identity: BY_REMOTE_ID,
    remote_lookup_filter: None,
};

pub fn spec(entity_type: EntityType) -> &'static EntitySpec {
    match entity_type {
        EntityType::Company => &COMPANY,
        EntityType::Contact => &CONTACT,
        EntityType::Agent => &AGENT,
        EntityType::Group => &GROUP,
        EntityType::Ticket => &TICKET,
        EntityType::Conversation => &CONVERSATION,
        EntityType::CannedResponse => &CANNED_RESPONSE,
    }
}

const ALL_TYPES: [EntityType; 7] = [
    EntityType::Company,
    EntityType::Contact,
    EntityType::Agent,
    EntityType::Group,
    EntityType::Ticket,
    EntityType::CannedResponse,
    EntityType::Conversation,
];

/// Every single-id foreign key pointing at `target`, with its owning type.
pub fn references_to(target: EntityType) -> impl Iterator<Item = (EntityType, &'static ForeignKey)> {
    ALL_TYPES.into_iter().flat_map(move |owner| {
        spec(owner)
            .foreign_keys
            .iter()
            .filter(move |fk| fk.target == target && !fk.many)
            .map(move |fk| (owner, fk))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_foreign_key_has_a_column_unless_it_is_a_list() {
        for ty in ALL_TYPES {
            let spec = spec(ty);
            for fk in spec.foreign_keys {
                assert_eq!(
                    spec.field(fk.field).is_some(),
                    !fk.many,
                    "{}.{}",
                    spec.table,
                    fk.field
                );
            }
        }
    }

    #[test]
    fn contact_references_include_ticket_requester_and_conversation_author() {
        let refs: Vec<_> = references_to(EntityType::Contact)
            .map(|(owner, fk)| (owner, fk.field, fk.keeps_history))
            .collect();
        assert!(refs.contains(&(EntityType::Ticket, "requester_id", false)));
        assert!(refs.contains(&(EntityType::Conversation, "user_id", true)));
    }

    #[test]
    fn conversation_author_follows_the_incoming_flag() {
        let fk = spec(EntityType::Conversation).foreign_key("user_id").unwrap();
        let payload = |v: Value| v.as_object().unwrap().clone();
        assert_eq!(
            fk.target_for(&payload(serde_json::json!({"incoming": true}))),
            EntityType::Contact
        );
        assert_eq!(
            fk.target_for(&payload(serde_json::json!({"incoming": false}))),
            EntityType::Agent
        );
        assert_eq!(
            fk.target_for(&payload(serde_json::json!({}))),
            EntityType::Contact
        );
    }

    #[test]
    fn agent_fields_read_from_nested_contact() {
        let name = spec(EntityType::Agent).field("name").unwrap();
        assert_eq!(name.path, "contact.name");
        assert_eq!(name.root_key(), "contact");
    }
}
