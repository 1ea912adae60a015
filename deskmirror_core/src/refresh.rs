//! Staleness-gated single-ticket reads.
//!
//! A ticket whose `last_fetched_at` is missing or older than the threshold is
//! re-pulled together with its conversation thread before being returned.

use crate::entities::models::{EntityType, LocalEntity, LocalId, RemoteId};
use crate::entities::tables::spec;
use crate::reconcile::{Reconciler, attachment_writes};
use crate::remote::paths;
use crate::remote::traits::RemoteApi;
use crate::store::traits::{ListQuery, LocalStore};
use crate::sync::engine::DEFAULT_PAGE_SIZE;
use crate::sync::paging::Pager;
use crate::translate::{LocalPayload, RemotePayload};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;

pub const DEFAULT_STALE_AFTER_SECS: i64 = 300;

/// Whether a row must be refetched before being served.
pub fn is_stale(entity: &LocalEntity, now: DateTime<Utc>, stale_after: Duration) -> bool {
    match entity.last_fetched_at {
        Some(fetched) => now - fetched > stale_after,
        None => true,
    }
}

pub struct TicketReader {
    remote: Arc<dyn RemoteApi>,
    store: Arc<dyn LocalStore>,
    reconciler: Reconciler,
    stale_after: Duration,
    page_size: usize,
}

impl TicketReader {
    pub fn new(remote: Arc<dyn RemoteApi>, store: Arc<dyn LocalStore>) -> Self {
        Self {
            remote,
            reconciler: Reconciler::new(store.clone()),
            store,
            stale_after: Duration::seconds(DEFAULT_STALE_AFTER_SECS),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Return the ticket, refreshing it first when stale.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn show(&self, local_id: LocalId) -> Result<LocalEntity> {
        let ticket = self
            .store
            .get(EntityType::Ticket, local_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("ticket {local_id}")))?;

        if !is_stale(&ticket, Utc::now(), self.stale_after) {
            tracing::debug!(local_id = %local_id, "serving cached ticket");
            return Ok(ticket);
        }
        self.refresh(&ticket).await
    }

    /// Re-pull a ticket and its thread and reconcile both.
    #[tracing::instrument(level = "info", skip(self, ticket), fields(remote_id = %ticket.remote_id))]
    pub async fn refresh(&self, ticket: &LocalEntity) -> Result<LocalEntity> {
        let ticket_spec = spec(EntityType::Ticket);
        let body = self
            .remote
            .get(&ticket_spec.record_path(ticket.remote_id), &[])
            .await?;
        let thread = Pager::new(
            &*self.remote,
            paths::ticket_conversations(ticket.remote_id),
            self.page_size,
        )
        .collect_all()
        .await?;

        let payload = RemotePayload::from_value(body)?;
        let refreshed = self
            .reconciler
            .upsert_remote(EntityType::Ticket, payload.clone())
            .await?;

        self.reconcile_description(&refreshed, &payload).await?;
        for entry in thread {
            self.reconcile_thread_entry(entry).await?;
        }
        // Only a complete refresh counts as fetched.
        self.store
            .mark_fetched(EntityType::Ticket, refreshed.local_id, Utc::now())
            .await?;

        self.store
            .get(EntityType::Ticket, refreshed.local_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("ticket {}", refreshed.local_id)))
    }

    /// The description pseudo-conversation of a ticket, if mirrored.
    pub async fn description_of(&self, ticket_id: LocalId) -> Result<Option<LocalEntity>> {
        let query = ListQuery {
            limit: 1,
            ..ListQuery::default()
                .filter("ticket_id", ticket_id.0)
                .filter("is_description", true)
                .with_deleted()
        };
        Ok(self
            .store
            .list(EntityType::Conversation, &query)
            .await?
            .into_iter()
            .next())
    }

    /// Create the description conversation, or update its body and merge
    /// the ticket's attachments into it.
    async fn reconcile_description(
        &self,
        ticket: &LocalEntity,
        remote: &RemotePayload,
    ) -> Result<LocalEntity> {
        let mut payload = Map::new();
        payload.insert("id".into(), Value::from(ticket.remote_id.0));
        payload.insert("is_description".into(), Value::Bool(true));
        for (column, source) in [("body", "description"), ("body_text", "description_text")] {
            payload.insert(
                column.into(),
                ticket.field(source).cloned().unwrap_or(Value::Null),
            );
        }
        payload.insert(
            "updated_at".into(),
            ticket.field("updated_at").cloned().unwrap_or(Value::Null),
        );

        match self.description_of(ticket.local_id).await? {
            Some(existing) => {
                let updated = self
                    .reconciler
                    .upsert_partial(EntityType::Conversation, &LocalPayload::new(payload))
                    .await?;
                self.store
                    .merge_attachments(
                        EntityType::Conversation,
                        existing.local_id,
                        &attachment_writes(remote.get("attachments")),
                    )
                    .await?;
                Ok(updated)
            }
            None => {
                payload.insert("ticket_id".into(), Value::from(ticket.local_id.0));
                payload.insert(
                    "user_id".into(),
                    ticket.field("requester_id").cloned().unwrap_or(Value::Null),
                );
                payload.insert("incoming".into(), Value::Bool(true));
                payload.insert(
                    "created_at".into(),
                    ticket.field("created_at").cloned().unwrap_or(Value::Null),
                );
                payload.insert(
                    "attachments".into(),
                    remote
                        .get("attachments")
                        .cloned()
                        .unwrap_or(Value::Array(Vec::new())),
                );
                tracing::debug!(ticket = %ticket.local_id, "creating description conversation");
                self.reconciler
                    .upsert(EntityType::Conversation, &LocalPayload::new(payload))
                    .await
            }
        }
    }

    /// New thread entries are inserted; known ones only get their
    /// attachments merged.
    async fn reconcile_thread_entry(&self, entry: Value) -> Result<()> {
        let payload = RemotePayload::from_value(entry)?;
        let remote_id = payload.id().map(RemoteId).ok_or_else(|| {
            Error::InvalidInput("conversation payload has no remote id".to_string())
        })?;

        match self
            .store
            .find_by_remote_id(EntityType::Conversation, remote_id)
            .await?
        {
            Some(existing) => {
                self.store
                    .merge_attachments(
                        EntityType::Conversation,
                        existing.local_id,
                        &attachment_writes(payload.get("attachments")),
                    )
                    .await?;
            }
            None => {
                self.reconciler
                    .upsert_remote(EntityType::Conversation, payload)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeRemote, conversation_json, memory_store, ticket_json};
    use serde_json::json;

    async fn seeded(
        store: &Arc<crate::store::sqlite::SqliteStore>,
        fetched_ago: Option<Duration>,
    ) -> LocalEntity {
        let ticket = Reconciler::new(store.clone())
            .upsert(
                EntityType::Ticket,
                &LocalPayload::from_value(ticket_json(900, "2024-01-01T00:00:00Z")).unwrap(),
            )
            .await
            .unwrap();
        if let Some(ago) = fetched_ago {
            store
                .mark_fetched(EntityType::Ticket, ticket.local_id, Utc::now() - ago)
                .await
                .unwrap();
        }
        ticket
    }

    fn remote_with_ticket() -> Arc<FakeRemote> {
        let remote = FakeRemote::new();
        let mut ticket = ticket_json(900, "2024-02-01T00:00:00Z");
        ticket["subject"] = json!("Updated remotely");
        ticket["attachments"] = json!([{"id": 501, "name": "log.txt", "size": 12}]);
        remote.on("GET", "/api/v2/tickets/900", ticket);
        remote.on_pages(
            "/api/v2/tickets/900/conversations",
            vec![json!([conversation_json(31, 900), conversation_json(32, 900)])],
        );
        remote
    }

    #[test]
    fn staleness_threshold() {
        let stale_after = Duration::seconds(DEFAULT_STALE_AFTER_SECS);
        let now = Utc::now();
        let entity_fetched = |ago: Option<Duration>| LocalEntity {
            entity_type: EntityType::Ticket,
            local_id: LocalId(1),
            gid: uuid::Uuid::nil(),
            remote_id: RemoteId(1),
            fields: Map::new(),
            values: Default::default(),
            custom_fields: Map::new(),
            attachments: Vec::new(),
            is_deleted: false,
            deleted_at: None,
            last_fetched_at: ago.map(|a| now - a),
        };
        assert!(is_stale(&entity_fetched(None), now, stale_after));
        assert!(is_stale(
            &entity_fetched(Some(Duration::minutes(10))),
            now,
            stale_after
        ));
        assert!(!is_stale(
            &entity_fetched(Some(Duration::minutes(1))),
            now,
            stale_after
        ));
    }

    #[tokio::test]
    async fn stale_ticket_is_refetched_with_its_thread() {
        let store = memory_store().await;
        let ticket = seeded(&store, Some(Duration::minutes(10))).await;
        let remote = remote_with_ticket();
        let reader = TicketReader::new(remote.clone(), store.clone());

        let shown = reader.show(ticket.local_id).await.unwrap();

        assert_eq!(shown.text("subject"), Some("Updated remotely"));
        assert!(!is_stale(&shown, Utc::now(), Duration::minutes(5)));
        assert_eq!(remote.calls_to("GET", "/api/v2/tickets/900").len(), 1);

        let thread = store
            .list(
                EntityType::Conversation,
                &ListQuery::default().filter("ticket_id", ticket.local_id.0),
            )
            .await
            .unwrap();
        assert_eq!(thread.len(), 3);

        let description = reader.description_of(ticket.local_id).await.unwrap().unwrap();
        assert_eq!(description.remote_id, RemoteId(900));
        assert_eq!(description.text("body_text"), Some("It broke"));
        assert_eq!(description.attachments.len(), 1);
    }

    #[tokio::test]
    async fn failed_thread_entry_leaves_ticket_stale() {
        let store = memory_store().await;
        let ticket = seeded(&store, None).await;
        let remote = remote_with_ticket();
        let mut broken = conversation_json(32, 900);
        broken.as_object_mut().unwrap().remove("id");
        remote.on_pages(
            "/api/v2/tickets/900/conversations",
            vec![json!([broken, conversation_json(33, 900)])],
        );
        let reader = TicketReader::new(remote.clone(), store.clone());

        assert!(matches!(
            reader.show(ticket.local_id).await,
            Err(Error::InvalidInput(_))
        ));
        let row = store
            .get(EntityType::Ticket, ticket.local_id)
            .await
            .unwrap()
            .unwrap();
        assert!(row.last_fetched_at.is_none());

        remote.on_pages(
            "/api/v2/tickets/900/conversations",
            vec![json!([conversation_json(33, 900)])],
        );
        let shown = reader.show(ticket.local_id).await.unwrap();
        assert!(shown.last_fetched_at.is_some());
        assert_eq!(remote.calls_to("GET", "/api/v2/tickets/900").len(), 2);
        assert!(
            store
                .find_by_remote_id(EntityType::Conversation, RemoteId(33))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn fresh_ticket_makes_no_remote_call() {
        let store = memory_store().await;
        let ticket = seeded(&store, Some(Duration::minutes(1))).await;
        let remote = FakeRemote::new();

        let shown = TicketReader::new(remote.clone(), store)
            .show(ticket.local_id)
            .await
            .unwrap();

        assert_eq!(shown.local_id, ticket.local_id);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_ticket_is_not_found() {
        let reader = TicketReader::new(FakeRemote::new(), memory_store().await);
        assert!(matches!(
            reader.show(LocalId(404)).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn repeated_refresh_keeps_one_description_and_local_attachment_paths() {
        let store = memory_store().await;
        let ticket = seeded(&store, None).await;
        let remote = remote_with_ticket();
        let reader = TicketReader::new(remote.clone(), store.clone());

        reader.show(ticket.local_id).await.unwrap();
        let description = reader.description_of(ticket.local_id).await.unwrap().unwrap();
        sqlx::query("UPDATE attachments SET local_path = '/cache/501' WHERE local_id = ?1")
            .bind(description.attachments[0].local_id.0)
            .execute(store.pool())
            .await
            .unwrap();

        let mut updated = ticket_json(900, "2024-03-01T00:00:00Z");
        updated["description_text"] = json!("It broke again");
        updated["attachments"] = json!([{"id": 501, "name": "log-v2.txt"}]);
        remote.on("GET", "/api/v2/tickets/900", updated);
        let refreshed = reader.refresh(&ticket).await.unwrap();
        assert_eq!(refreshed.local_id, ticket.local_id);

        let descriptions = store
            .list(
                EntityType::Conversation,
                &ListQuery::default().filter("is_description", true),
            )
            .await
            .unwrap();
        assert_eq!(descriptions.len(), 1);
        let description = &descriptions[0];
        assert_eq!(description.text("body_text"), Some("It broke again"));
        assert_eq!(description.attachments.len(), 1);
        assert_eq!(description.attachments[0].name.as_deref(), Some("log-v2.txt"));
        assert_eq!(
            description.attachments[0].local_path.as_deref(),
            Some("/cache/501")
        );
        assert_eq!(
            store.count(EntityType::Conversation).await.unwrap(),
            3,
            "thread entries are not duplicated"
        );
    }
}
