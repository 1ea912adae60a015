//! SQLite-backed `LocalStore`.
//!
//! One WAL-mode SQLite file holds every mirrored entity table plus the shared
//! child tables (`entity_values`, `custom_fields`, `attachments`,
//! `group_agents`). Column lists come from the field mapping tables in
//! `entities::tables`, so the SQL here is generated per entity type.
//!
//! Usage:
//! ```ignore
//! let store = SqliteStore::new("./data/mirror.db").await?;
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Arguments, Row, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::entities::models::{
    AttachmentRecord, EntityType, LocalEntity, LocalId, RemoteId, format_timestamp,
    parse_timestamp,
};
use crate::entities::tables::{ChildKind, EntitySpec, FieldKind, FieldSpec, spec};
use crate::store::traits::{
    AttachmentWrite, EntityWrite, ListQuery, LocalStore, SqlParam,
};
use crate::{Error, Result};

/// A durable, file-backed mirror in a single SQLite file (WAL mode).
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create (or open) a mirror database at the given file path.
    ///
    /// Creates the file and parent directories if they don't exist and runs
    /// the schema migration.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::backend("sqlite_store", e))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path.display()))
            .map_err(|e| Error::backend("sqlite_store", e))?
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("sqlite_store", e))?;

        Self::with_pool(pool).await
    }

    /// Private in-memory database. A single connection that never expires,
    /// since every SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::backend("sqlite_store", e))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await
            .map_err(|e| Error::backend("sqlite_store", e))?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::backend("sqlite_store_migration", e))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS companies (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    gid TEXT NOT NULL UNIQUE,
    remote_id INTEGER NOT NULL UNIQUE,
    name TEXT,
    description TEXT,
    note TEXT,
    health_score TEXT,
    account_tier TEXT,
    renewal_date TEXT,
    industry TEXT,
    created_at TEXT,
    updated_at TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT,
    last_fetched_at TEXT
);
CREATE INDEX IF NOT EXISTS companies_updated_at_idx ON companies(updated_at);

CREATE TABLE IF NOT EXISTS contacts (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    gid TEXT NOT NULL UNIQUE,
    remote_id INTEGER NOT NULL UNIQUE,
    name TEXT,
    email TEXT,
    phone TEXT,
    mobile TEXT,
    twitter_id TEXT,
    unique_external_id TEXT,
    job_title TEXT,
    language TEXT,
    time_zone TEXT,
    address TEXT,
    description TEXT,
    company_id INTEGER,
    view_all_tickets INTEGER,
    active INTEGER,
    created_at TEXT,
    updated_at TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT,
    last_fetched_at TEXT
);
CREATE INDEX IF NOT EXISTS contacts_updated_at_idx ON contacts(updated_at);
CREATE INDEX IF NOT EXISTS contacts_company_idx ON contacts(company_id);

CREATE TABLE IF NOT EXISTS agents (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    gid TEXT NOT NULL UNIQUE,
    remote_id INTEGER NOT NULL UNIQUE,
    name TEXT,
    email TEXT,
    phone TEXT,
    mobile TEXT,
    job_title TEXT,
    language TEXT,
    time_zone TEXT,
    active INTEGER,
    available INTEGER,
    occasional INTEGER,
    ticket_scope INTEGER,
    signature TEXT,
    agent_type TEXT,
    last_active_at TEXT,
    created_at TEXT,
    updated_at TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT,
    last_fetched_at TEXT
);
CREATE INDEX IF NOT EXISTS agents_updated_at_idx ON agents(updated_at);

CREATE TABLE IF NOT EXISTS helpdesk_groups (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    gid TEXT NOT NULL UNIQUE,
    remote_id INTEGER NOT NULL UNIQUE,
    name TEXT,
    description TEXT,
    escalate_to INTEGER,
    unassigned_for TEXT,
    business_hour_id INTEGER,
    auto_ticket_assign TEXT,
    created_at TEXT,
    updated_at TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT,
    last_fetched_at TEXT
);
CREATE INDEX IF NOT EXISTS helpdesk_groups_updated_at_idx ON helpdesk_groups(updated_at);

CREATE TABLE IF NOT EXISTS tickets (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    gid TEXT NOT NULL UNIQUE,
    remote_id INTEGER NOT NULL UNIQUE,
    subject TEXT,
    description TEXT,
    description_text TEXT,
    status INTEGER,
    priority INTEGER,
    source INTEGER,
    ticket_type TEXT,
    requester_id INTEGER,
    responder_id INTEGER,
    company_id INTEGER,
    group_id INTEGER,
    product_id INTEGER,
    email_config_id INTEGER,
    due_by TEXT,
    fr_due_by TEXT,
    is_escalated INTEGER,
    fr_escalated INTEGER,
    spam INTEGER,
    created_at TEXT,
    updated_at TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT,
    last_fetched_at TEXT
);
CREATE INDEX IF NOT EXISTS tickets_updated_at_idx ON tickets(updated_at);
CREATE INDEX IF NOT EXISTS tickets_requester_idx ON tickets(requester_id);
CREATE INDEX IF NOT EXISTS tickets_group_idx ON tickets(group_id);

CREATE TABLE IF NOT EXISTS conversations (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    gid TEXT NOT NULL UNIQUE,
    remote_id INTEGER NOT NULL,
    ticket_id INTEGER,
    user_id INTEGER,
    body TEXT,
    body_text TEXT,
    incoming INTEGER,
    private INTEGER,
    source INTEGER,
    support_email TEXT,
    from_email TEXT,
    to_emails TEXT,
    cc_emails TEXT,
    is_description INTEGER NOT NULL DEFAULT 0,
    created_at TEXT,
    updated_at TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT,
    last_fetched_at TEXT,
    UNIQUE (remote_id, is_description)
);
CREATE INDEX IF NOT EXISTS conversations_ticket_idx ON conversations(ticket_id);

CREATE TABLE IF NOT EXISTS canned_responses (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    gid TEXT NOT NULL UNIQUE,
    remote_id INTEGER NOT NULL UNIQUE,
    title TEXT,
    content TEXT,
    content_html TEXT,
    folder_id INTEGER,
    visibility INTEGER,
    created_at TEXT,
    updated_at TEXT,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    deleted_at TEXT,
    last_fetched_at TEXT
);
CREATE INDEX IF NOT EXISTS canned_responses_updated_at_idx ON canned_responses(updated_at);

CREATE TABLE IF NOT EXISTS entity_values (
    parent_type TEXT NOT NULL,
    parent_id INTEGER NOT NULL,
    collection TEXT NOT NULL,
    position INTEGER NOT NULL,
    value TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS entity_values_parent_idx
    ON entity_values(parent_type, parent_id, collection);
CREATE INDEX IF NOT EXISTS entity_values_lookup_idx
    ON entity_values(parent_type, collection, value);

CREATE TABLE IF NOT EXISTS custom_fields (
    parent_type TEXT NOT NULL,
    parent_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    value_json TEXT NOT NULL,
    PRIMARY KEY (parent_type, parent_id, name)
);

CREATE TABLE IF NOT EXISTS attachments (
    local_id INTEGER PRIMARY KEY AUTOINCREMENT,
    remote_id INTEGER NOT NULL,
    parent_type TEXT NOT NULL,
    parent_id INTEGER NOT NULL,
    name TEXT,
    content_type TEXT,
    size INTEGER,
    attachment_url TEXT,
    local_path TEXT,
    created_at TEXT,
    updated_at TEXT,
    UNIQUE (parent_type, parent_id, remote_id)
);

CREATE TABLE IF NOT EXISTS group_agents (
    group_id INTEGER NOT NULL,
    agent_id INTEGER NOT NULL,
    PRIMARY KEY (group_id, agent_id)
);
CREATE INDEX IF NOT EXISTS group_agents_agent_idx ON group_agents(agent_id);
"#;

fn db_err(e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db) = &e {
        if db.is_unique_violation() {
            return Error::Conflict(db.message().to_string());
        }
    }
    Error::backend_sqlx(e)
}

fn bind_err(e: impl std::fmt::Display) -> Error {
    Error::BackendMessage(format!("sqlite_store bind: {e}"))
}

fn table_for(entity_type: EntityType) -> &'static str {
    spec(entity_type).table
}

fn add_params(args: &mut SqliteArguments<'_>, params: &[SqlParam]) -> Result<()> {
    for p in params {
        match p {
            SqlParam::Null => args.add(Option::<String>::None).map_err(bind_err)?,
            SqlParam::I64(i) => args.add(*i).map_err(bind_err)?,
            SqlParam::F64(f) => args.add(*f).map_err(bind_err)?,
            SqlParam::String(s) => args.add(s.clone()).map_err(bind_err)?,
        }
    }
    Ok(())
}

fn param_from_json(value: &Value) -> SqlParam {
    match value {
        Value::Null => SqlParam::Null,
        Value::Bool(b) => SqlParam::I64(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlParam::I64)
            .or_else(|| n.as_f64().map(SqlParam::F64))
            .unwrap_or(SqlParam::Null),
        Value::String(s) => SqlParam::String(s.clone()),
        other => SqlParam::String(other.to_string()),
    }
}

fn column_value(row: &SqliteRow, field: &FieldSpec) -> Result<Value> {
    let value = match field.kind {
        FieldKind::Text | FieldKind::Timestamp => row
            .try_get::<Option<String>, _>(field.column)
            .map_err(db_err)?
            .map(Value::String),
        FieldKind::Integer => row
            .try_get::<Option<i64>, _>(field.column)
            .map_err(db_err)?
            .map(Value::from),
        FieldKind::Bool | FieldKind::Flag => row
            .try_get::<Option<i64>, _>(field.column)
            .map_err(db_err)?
            .map(|v| Value::Bool(v != 0)),
        FieldKind::Json => row
            .try_get::<Option<String>, _>(field.column)
            .map_err(db_err)?
            .map(|s| serde_json::from_str(&s).unwrap_or(Value::String(s))),
    };
    Ok(value.unwrap_or(Value::Null))
}

fn optional_timestamp(row: &SqliteRow, column: &str) -> Result<Option<DateTime<Utc>>> {
    Ok(row
        .try_get::<Option<String>, _>(column)
        .map_err(db_err)?
        .as_deref()
        .and_then(parse_timestamp))
}

fn remote_lookup_sql(spec: &EntitySpec, select: &str) -> String {
    let mut sql = format!(
        "SELECT {select} FROM {} WHERE remote_id = ?1",
        table_for(spec.entity_type)
    );
    if let Some(filter) = spec.remote_lookup_filter {
        sql.push_str(" AND ");
        sql.push_str(filter);
    }
    sql
}

impl SqliteStore {
    /// Decode the scalar part of an entity row.
    fn row_to_entity(entity_type: EntityType, row: &SqliteRow) -> Result<LocalEntity> {
        let spec = spec(entity_type);
        let gid_str: String = row.try_get("gid").map_err(db_err)?;
        let gid = Uuid::parse_str(&gid_str)
            .map_err(|e| Error::backend(format!("invalid gid '{gid_str}'"), e))?;

        let mut fields = Map::new();
        for field in spec.fields {
            fields.insert(field.column.to_string(), column_value(row, field)?);
        }

        let is_deleted: i64 = row.try_get("is_deleted").map_err(db_err)?;
        Ok(LocalEntity {
            entity_type,
            local_id: LocalId(row.try_get("local_id").map_err(db_err)?),
            gid,
            remote_id: RemoteId(row.try_get("remote_id").map_err(db_err)?),
            fields,
            values: BTreeMap::new(),
            custom_fields: Map::new(),
            attachments: Vec::new(),
            is_deleted: is_deleted != 0,
            deleted_at: optional_timestamp(row, "deleted_at")?,
            last_fetched_at: optional_timestamp(row, "last_fetched_at")?,
        })
    }

    async fn load_children(&self, entity: &mut LocalEntity) -> Result<()> {
        let spec = spec(entity.entity_type);
        let parent_type = entity.entity_type.as_str();
        let parent_id = entity.local_id.0;

        for child in spec.children {
            match child.kind {
                ChildKind::Values => {
                    let rows = sqlx::query(
                        "SELECT value FROM entity_values
                         WHERE parent_type = ?1 AND parent_id = ?2 AND collection = ?3
                         ORDER BY position",
                    )
                    .bind(parent_type)
                    .bind(parent_id)
                    .bind(child.collection)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(db_err)?;
                    let values = rows
                        .iter()
                        .map(|r| r.try_get::<String, _>("value"))
                        .collect::<std::result::Result<Vec<_>, _>>()
                        .map_err(db_err)?;
                    entity.values.insert(child.collection.to_string(), values);
                }
                ChildKind::CustomFields => {
                    let rows = sqlx::query(
                        "SELECT name, value_json FROM custom_fields
                         WHERE parent_type = ?1 AND parent_id = ?2
                         ORDER BY name",
                    )
                    .bind(parent_type)
                    .bind(parent_id)
                    .fetch_all(&self.pool)
                    .await
                    .map_err(db_err)?;
                    for r in rows {
                        let name: String = r.try_get("name").map_err(db_err)?;
                        let raw: String = r.try_get("value_json").map_err(db_err)?;
                        let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
                        entity.custom_fields.insert(name, value);
                    }
                }
                ChildKind::Attachments => {
                    entity.attachments = self
                        .attachments_of(entity.entity_type, entity.local_id)
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn attachments_of(
        &self,
        parent_type: EntityType,
        parent_id: LocalId,
    ) -> Result<Vec<AttachmentRecord>> {
        let rows = sqlx::query(
            "SELECT local_id, remote_id, name, content_type, size, attachment_url, local_path,
                    created_at, updated_at
             FROM attachments WHERE parent_type = ?1 AND parent_id = ?2
             ORDER BY remote_id",
        )
        .bind(parent_type.as_str())
        .bind(parent_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(AttachmentRecord {
                local_id: LocalId(r.try_get("local_id").map_err(db_err)?),
                remote_id: RemoteId(r.try_get("remote_id").map_err(db_err)?),
                name: r.try_get("name").map_err(db_err)?,
                content_type: r.try_get("content_type").map_err(db_err)?,
                size: r.try_get("size").map_err(db_err)?,
                attachment_url: r.try_get("attachment_url").map_err(db_err)?,
                local_path: r.try_get("local_path").map_err(db_err)?,
                created_at: r.try_get("created_at").map_err(db_err)?,
                updated_at: r.try_get("updated_at").map_err(db_err)?,
            });
        }
        Ok(out)
    }

    async fn hydrate(&self, entity_type: EntityType, row: &SqliteRow) -> Result<LocalEntity> {
        let mut entity = Self::row_to_entity(entity_type, row)?;
        self.load_children(&mut entity).await?;
        Ok(entity)
    }

    async fn insert_attachment(
        tx: &mut Transaction<'_, Sqlite>,
        parent_type: EntityType,
        parent_id: i64,
        a: &AttachmentWrite,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO attachments
               (remote_id, parent_type, parent_id, name, content_type, size, attachment_url,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(parent_type, parent_id, remote_id) DO UPDATE SET
               name = excluded.name,
               content_type = excluded.content_type,
               size = excluded.size,
               attachment_url = excluded.attachment_url,
               created_at = excluded.created_at,
               updated_at = excluded.updated_at",
        )
        .bind(a.remote_id.0)
        .bind(parent_type.as_str())
        .bind(parent_id)
        .bind(a.name.as_deref())
        .bind(a.content_type.as_deref())
        .bind(a.size)
        .bind(a.attachment_url.as_deref())
        .bind(a.created_at.as_deref())
        .bind(a.updated_at.as_deref())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_children(
        tx: &mut Transaction<'_, Sqlite>,
        parent_type: EntityType,
        parent_id: i64,
    ) -> Result<()> {
        for sql in [
            "DELETE FROM entity_values WHERE parent_type = ?1 AND parent_id = ?2",
            "DELETE FROM custom_fields WHERE parent_type = ?1 AND parent_id = ?2",
            "DELETE FROM attachments WHERE parent_type = ?1 AND parent_id = ?2",
        ] {
            sqlx::query(sql)
                .bind(parent_type.as_str())
                .bind(parent_id)
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for SqliteStore {
    async fn get(&self, entity_type: EntityType, local_id: LocalId) -> Result<Option<LocalEntity>> {
        let sql = format!(
            "SELECT * FROM {} WHERE local_id = ?1",
            table_for(entity_type)
        );
        let row = sqlx::query(&sql)
            .bind(local_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(r) => Ok(Some(self.hydrate(entity_type, &r).await?)),
            None => Ok(None),
        }
    }

    async fn find_by_remote_id(
        &self,
        entity_type: EntityType,
        remote_id: RemoteId,
    ) -> Result<Option<LocalEntity>> {
        let sql = remote_lookup_sql(spec(entity_type), "*");
        let row = sqlx::query(&sql)
            .bind(remote_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        match row {
            Some(r) => Ok(Some(self.hydrate(entity_type, &r).await?)),
            None => Ok(None),
        }
    }

    async fn local_id_for(
        &self,
        entity_type: EntityType,
        remote_id: RemoteId,
    ) -> Result<Option<LocalId>> {
        let sql = remote_lookup_sql(spec(entity_type), "local_id");
        let id: Option<i64> = sqlx::query_scalar(&sql)
            .bind(remote_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(id.map(LocalId))
    }

    async fn remote_id_for(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
    ) -> Result<Option<RemoteId>> {
        let sql = format!(
            "SELECT remote_id FROM {} WHERE local_id = ?1",
            table_for(entity_type)
        );
        let id: Option<i64> = sqlx::query_scalar(&sql)
            .bind(local_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(id.map(RemoteId))
    }

    async fn count(&self, entity_type: EntityType) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table_for(entity_type));
        let n: i64 = sqlx::query_scalar(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(n.max(0) as u64)
    }

    async fn max_updated_at(&self, entity_type: EntityType) -> Result<Option<DateTime<Utc>>> {
        // Rows written before timestamp normalization may hold free text.
        let sql = format!(
            "SELECT updated_at FROM {} WHERE updated_at GLOB '[0-9][0-9][0-9][0-9]-*'
             ORDER BY updated_at DESC LIMIT 16",
            table_for(entity_type)
        );
        let newest: Vec<String> = sqlx::query_scalar(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(newest.iter().find_map(|s| parse_timestamp(s)))
    }

    #[tracing::instrument(level = "debug", skip(self, write), fields(remote_id = %write.remote_id))]
    async fn write_entity(
        &self,
        entity_type: EntityType,
        write: &EntityWrite,
    ) -> Result<LocalEntity> {
        let spec = spec(entity_type);
        let columns: Vec<&str> = write.scalars.iter().map(|(c, _)| *c).collect();
        if let Some(unknown) = columns.iter().find(|c| spec.field(c).is_none()) {
            return Err(Error::InvalidInput(format!(
                "{} has no column '{unknown}'",
                spec.table
            )));
        }

        let placeholders: Vec<String> = (3..columns.len() + 3).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = if columns.is_empty() {
            vec!["remote_id = excluded.remote_id".to_string()]
        } else {
            columns
                .iter()
                .map(|c| format!("{c} = excluded.{c}"))
                .collect()
        };
        let column_list = std::iter::once("gid")
            .chain(std::iter::once("remote_id"))
            .chain(columns.iter().copied())
            .collect::<Vec<_>>()
            .join(", ");
        let value_list = std::iter::once("?1".to_string())
            .chain(std::iter::once("?2".to_string()))
            .chain(placeholders)
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {table} ({column_list}) VALUES ({value_list})
             ON CONFLICT({identity}) DO UPDATE SET {updates}
             RETURNING local_id",
            table = table_for(entity_type),
            identity = spec.identity.join(", "),
            updates = updates.join(", "),
        );

        let mut params = vec![
            SqlParam::String(Uuid::new_v4().to_string()),
            SqlParam::I64(write.remote_id.0),
        ];
        params.extend(write.scalars.iter().map(|(_, p)| p.clone()));
        let mut args = SqliteArguments::default();
        add_params(&mut args, &params)?;

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let local_id: i64 = sqlx::query_scalar_with(&sql, args)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_err)?;
        let parent_type = entity_type.as_str();

        for (collection, values) in &write.values {
            sqlx::query(
                "DELETE FROM entity_values
                 WHERE parent_type = ?1 AND parent_id = ?2 AND collection = ?3",
            )
            .bind(parent_type)
            .bind(local_id)
            .bind(*collection)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
            for (position, value) in values.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO entity_values (parent_type, parent_id, collection, position, value)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .bind(parent_type)
                .bind(local_id)
                .bind(*collection)
                .bind(position as i64)
                .bind(value)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        if let Some(custom_fields) = &write.custom_fields {
            sqlx::query("DELETE FROM custom_fields WHERE parent_type = ?1 AND parent_id = ?2")
                .bind(parent_type)
                .bind(local_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            for (name, value) in custom_fields {
                sqlx::query(
                    "INSERT INTO custom_fields (parent_type, parent_id, name, value_json)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(parent_type)
                .bind(local_id)
                .bind(name)
                .bind(value.to_string())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            }
        }

        if let Some(attachments) = &write.attachments {
            sqlx::query("DELETE FROM attachments WHERE parent_type = ?1 AND parent_id = ?2")
                .bind(parent_type)
                .bind(local_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
            for a in attachments {
                Self::insert_attachment(&mut tx, entity_type, local_id, a).await?;
            }
        }

        tx.commit().await.map_err(db_err)?;

        self.get(entity_type, LocalId(local_id))
            .await?
            .ok_or_else(|| {
                Error::BackendMessage(format!(
                    "{} row {local_id} vanished after write",
                    spec.table
                ))
            })
    }

    async fn merge_attachments(
        &self,
        parent_type: EntityType,
        parent_id: LocalId,
        attachments: &[AttachmentWrite],
    ) -> Result<u64> {
        if attachments.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for a in attachments {
            Self::insert_attachment(&mut tx, parent_type, parent_id.0, a).await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(attachments.len() as u64)
    }

    async fn mark_fetched(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET last_fetched_at = ?1 WHERE local_id = ?2",
            table_for(entity_type)
        );
        sqlx::query(&sql)
            .bind(format_timestamp(at))
            .bind(local_id.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn soft_delete(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET is_deleted = 1, deleted_at = ?1 WHERE local_id = ?2",
            table_for(entity_type)
        );
        sqlx::query(&sql)
            .bind(format_timestamp(at))
            .bind(local_id.0)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn hard_delete(&self, entity_type: EntityType, local_id: LocalId) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        Self::delete_children(&mut tx, entity_type, local_id.0).await?;

        let membership = match entity_type {
            EntityType::Group => Some("DELETE FROM group_agents WHERE group_id = ?1"),
            EntityType::Agent => Some("DELETE FROM group_agents WHERE agent_id = ?1"),
            _ => None,
        };
        if let Some(sql) = membership {
            sqlx::query(sql)
                .bind(local_id.0)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        let sql = format!("DELETE FROM {} WHERE local_id = ?1", table_for(entity_type));
        sqlx::query(&sql)
            .bind(local_id.0)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn reassign_references(
        &self,
        owner: EntityType,
        column: &str,
        from: &[LocalId],
        to: LocalId,
    ) -> Result<u64> {
        let spec = spec(owner);
        let fk = spec
            .foreign_key(column)
            .filter(|fk| !fk.many)
            .ok_or_else(|| {
                Error::InvalidInput(format!("{}.{column} is not a reference", spec.table))
            })?;
        if from.is_empty() {
            return Ok(0);
        }

        let placeholders: Vec<String> = (2..from.len() + 2).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "UPDATE {table} SET {col} = ?1 WHERE {col} IN ({list})",
            table = table_for(owner),
            col = fk.field,
            list = placeholders.join(", "),
        );
        let mut params = vec![SqlParam::I64(to.0)];
        params.extend(from.iter().map(|id| SqlParam::I64(id.0)));
        let mut args = SqliteArguments::default();
        add_params(&mut args, &params)?;

        let res = sqlx::query_with(&sql, args)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(res.rows_affected())
    }

    async fn replace_group_members(&self, group_id: LocalId, agent_ids: &[LocalId]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("DELETE FROM group_agents WHERE group_id = ?1")
            .bind(group_id.0)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        for agent_id in agent_ids {
            sqlx::query("INSERT OR IGNORE INTO group_agents (group_id, agent_id) VALUES (?1, ?2)")
                .bind(group_id.0)
                .bind(agent_id.0)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn group_members(&self, group_id: LocalId) -> Result<Vec<LocalId>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT agent_id FROM group_agents WHERE group_id = ?1 ORDER BY agent_id")
                .bind(group_id.0)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(ids.into_iter().map(LocalId).collect())
    }

    #[tracing::instrument(level = "debug", skip(self, query))]
    async fn list(&self, entity_type: EntityType, query: &ListQuery) -> Result<Vec<LocalEntity>> {
        let spec = spec(entity_type);
        let mut sql = format!("SELECT * FROM {} WHERE 1 = 1", table_for(entity_type));
        let mut params: Vec<SqlParam> = Vec::new();

        if !query.include_deleted {
            sql.push_str(" AND is_deleted = 0");
        }
        for filter in &query.filters {
            if !spec.is_queryable(&filter.column) {
                return Err(Error::InvalidInput(format!(
                    "cannot filter {} by '{}'",
                    spec.table, filter.column
                )));
            }
            if filter.value.is_null() {
                sql.push_str(&format!(" AND {} IS NULL", filter.column));
            } else {
                params.push(param_from_json(&filter.value));
                sql.push_str(&format!(" AND {} = ?{}", filter.column, params.len()));
            }
        }
        if let Some(tag) = &query.tag {
            params.push(SqlParam::String(entity_type.as_str().to_string()));
            let type_idx = params.len();
            params.push(SqlParam::String(tag.clone()));
            sql.push_str(&format!(
                " AND local_id IN (SELECT parent_id FROM entity_values
                   WHERE parent_type = ?{type_idx} AND collection = 'tags' AND value = ?{})",
                params.len()
            ));
        }

        let order_by = query.order_by.as_deref().unwrap_or("local_id");
        if !spec.is_queryable(order_by) {
            return Err(Error::InvalidInput(format!(
                "cannot order {} by '{order_by}'",
                spec.table
            )));
        }
        let direction = if query.descending { "DESC" } else { "ASC" };
        params.push(SqlParam::I64(query.limit as i64));
        params.push(SqlParam::I64(query.offset as i64));
        sql.push_str(&format!(
            " ORDER BY {order_by} {direction}, local_id ASC LIMIT ?{} OFFSET ?{}",
            params.len() - 1,
            params.len()
        ));

        let mut args = SqliteArguments::default();
        add_params(&mut args, &params)?;
        let rows = sqlx::query_with(&sql, args)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            out.push(self.hydrate(entity_type, &r).await?);
        }
        Ok(out)
    }
}
