//! `MirrorEngine`: the single entry point callers use.

use crate::config::MirrorConfig;
use crate::entities::models::{EntityType, LocalEntity, LocalId};
use crate::merge::{MergeCoordinator, MergeOutcome, TicketMergeOptions};
use crate::reconcile::Reconciler;
use crate::refresh::TicketReader;
use crate::remote::traits::{RemoteApi, UploadFile};
use crate::store::sqlite::SqliteStore;
use crate::store::traits::{ListQuery, LocalStore};
use crate::sync::engine::SyncOrchestrator;
use crate::sync::models::{SyncOutcome, SyncReport};
use crate::translate::{LocalPayload, RemotePayload, translate_inbound, translate_outbound};
use crate::writes::WriteThrough;
use crate::{Error, Result};
use std::sync::Arc;

/// Wires a remote transport and a local store into the sync, read, merge and
/// write paths. Holds no state between calls beyond its two handles.
pub struct MirrorEngine {
    store: Arc<dyn LocalStore>,
    reconciler: Reconciler,
    sync: SyncOrchestrator,
    reader: TicketReader,
    merges: MergeCoordinator,
    writes: WriteThrough,
}

impl MirrorEngine {
    pub fn new(remote: Arc<dyn RemoteApi>, store: Arc<dyn LocalStore>) -> Self {
        Self::with_config(remote, store, &MirrorConfig::default())
    }

    #[tracing::instrument(level = "debug", skip(remote, store))]
    pub fn with_config(
        remote: Arc<dyn RemoteApi>,
        store: Arc<dyn LocalStore>,
        config: &MirrorConfig,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(store.clone()),
            sync: SyncOrchestrator::new(remote.clone(), store.clone())
                .with_page_size(config.page_size),
            reader: TicketReader::new(remote.clone(), store.clone())
                .with_page_size(config.page_size)
                .with_stale_after(config.stale_after_chrono()),
            merges: MergeCoordinator::new(remote.clone(), store.clone())
                .with_page_size(config.page_size),
            writes: WriteThrough::new(remote, store.clone()),
            store,
        }
    }

    /// Open (or create) the SQLite mirror at `config.db_path`.
    pub async fn open(remote: Arc<dyn RemoteApi>, config: &MirrorConfig) -> Result<Self> {
        config.validate()?;
        let store = SqliteStore::new(&config.db_path).await?;
        Ok(Self::with_config(remote, Arc::new(store), config))
    }

    pub async fn sync_all(&self) -> SyncReport {
        self.sync.sync_all().await
    }

    pub async fn sync_one(&self, entity_type: EntityType) -> Result<SyncOutcome> {
        self.sync.sync_one(entity_type).await
    }

    pub async fn upsert(&self, entity_type: EntityType, payload: &LocalPayload) -> Result<LocalEntity> {
        self.reconciler.upsert(entity_type, payload).await
    }

    pub async fn upsert_remote(
        &self,
        entity_type: EntityType,
        payload: RemotePayload,
    ) -> Result<LocalEntity> {
        self.reconciler.upsert_remote(entity_type, payload).await
    }

    pub async fn translate_outbound(
        &self,
        entity_type: EntityType,
        payload: LocalPayload,
    ) -> Result<RemotePayload> {
        translate_outbound(self.store.as_ref(), entity_type, payload).await
    }

    pub async fn translate_inbound(
        &self,
        entity_type: EntityType,
        payload: RemotePayload,
    ) -> Result<LocalPayload> {
        translate_inbound(self.store.as_ref(), entity_type, payload).await
    }

    pub async fn show_ticket(&self, local_id: LocalId) -> Result<LocalEntity> {
        self.reader.show(local_id).await
    }

    /// Local read without any remote call.
    pub async fn get(&self, entity_type: EntityType, local_id: LocalId) -> Result<LocalEntity> {
        self.store
            .get(entity_type, local_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{entity_type} {local_id}")))
    }

    pub async fn merge_contacts(
        &self,
        primary: LocalId,
        secondaries: &[LocalId],
        overrides: LocalPayload,
    ) -> Result<MergeOutcome> {
        self.merges
            .merge_contacts(primary, secondaries, overrides)
            .await
    }

    pub async fn merge_tickets(
        &self,
        primary: LocalId,
        secondaries: &[LocalId],
        options: &TicketMergeOptions,
    ) -> Result<MergeOutcome> {
        self.merges
            .merge_tickets(primary, secondaries, options)
            .await
    }

    pub async fn create(
        &self,
        entity_type: EntityType,
        payload: LocalPayload,
        files: Vec<UploadFile>,
    ) -> Result<LocalEntity> {
        self.writes.create(entity_type, payload, files).await
    }

    pub async fn update(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
        payload: LocalPayload,
    ) -> Result<LocalEntity> {
        self.writes.update(entity_type, local_id, payload).await
    }

    pub async fn delete(&self, entity_type: EntityType, local_id: LocalId) -> Result<LocalEntity> {
        self.writes.delete(entity_type, local_id).await
    }

    pub async fn list(&self, entity_type: EntityType, query: &ListQuery) -> Result<Vec<LocalEntity>> {
        self.store.list(entity_type, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::models::RemoteId;
    use crate::entities::tables::spec;
    use crate::remote::paths;
    use crate::test_support::{FakeRemote, contact_json, memory_store, ticket_json};
    use serde_json::json;

    #[tokio::test]
    async fn sync_then_read_and_list() {
        let remote = FakeRemote::new();
        for ty in EntityType::SYNC_ORDER {
            remote.on_pages(spec(ty).remote_path, vec![]);
        }
        remote.on("GET", paths::CANNED_RESPONSE_FOLDERS, json!([]));
        remote.on_pages("/api/v2/contacts", vec![json!([contact_json(42)])]);
        let mut ticket = ticket_json(900, "2024-01-01T00:00:00Z");
        ticket["requester_id"] = json!(42);
        ticket["tags"] = json!(["vip"]);
        remote.on_pages("/api/v2/tickets", vec![json!([ticket.clone()])]);
        remote.on("GET", "/api/v2/tickets/900", ticket);
        remote.on_pages("/api/v2/tickets/900/conversations", vec![]);

        let engine = MirrorEngine::new(remote.clone(), memory_store().await);
        let report = engine.sync_all().await;
        assert!(report.is_success());
        assert_eq!(report.total_records(), 2);

        let listed = engine
            .list(
                EntityType::Ticket,
                &ListQuery {
                    tag: Some("vip".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].remote_id, RemoteId(900));

        // Synced rows carry no fetch stamp, so the first read refreshes.
        let shown = engine.show_ticket(listed[0].local_id).await.unwrap();
        assert!(shown.last_fetched_at.is_some());
        assert_eq!(remote.calls_to("GET", "/api/v2/tickets/900").len(), 1);

        let contact = engine.get(EntityType::Contact, shown.reference("requester_id").unwrap()).await.unwrap();
        assert_eq!(contact.remote_id, RemoteId(42));
    }
}
