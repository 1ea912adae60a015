use crate::entities::models::{
    EntityType, LocalEntity, RemoteId, format_timestamp, id_from_value, parse_timestamp,
};
use crate::entities::tables::spec;
use crate::reconcile::Reconciler;
use crate::remote::error::RemoteError;
use crate::remote::paths;
use crate::remote::traits::RemoteApi;
use crate::store::traits::LocalStore;
use crate::sync::models::{SyncMode, SyncOutcome, SyncReport};
use crate::sync::paging::Pager;
use crate::translate::RemotePayload;
use crate::{Error, Result};
use chrono::Duration;
use serde_json::Value;
use std::sync::Arc;

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Pulls every syncable type from the remote API in dependency order.
///
/// Each type runs in isolation: a failure is recorded in the report and the
/// run moves on. Records reconciled before a failure stay committed.
pub struct SyncOrchestrator {
    remote: Arc<dyn RemoteApi>,
    store: Arc<dyn LocalStore>,
    reconciler: Reconciler,
    page_size: usize,
}

impl SyncOrchestrator {
    pub fn new(remote: Arc<dyn RemoteApi>, store: Arc<dyn LocalStore>) -> Self {
        Self {
            remote,
            reconciler: Reconciler::new(store.clone()),
            store,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn sync_all(&self) -> SyncReport {
        let mut report = SyncReport::default();
        for entity_type in EntityType::SYNC_ORDER {
            let outcome = self.run(entity_type).await;
            report.insert(entity_type, outcome);
        }
        tracing::info!(
            records = report.total_records(),
            failed = report.failed_types().len(),
            "sync run finished"
        );
        report
    }

    /// Sync a single type. Conversations are only reachable through their
    /// tickets and are rejected here.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn sync_one(&self, entity_type: EntityType) -> Result<SyncOutcome> {
        if !EntityType::SYNC_ORDER.contains(&entity_type) {
            return Err(Error::InvalidInput(format!(
                "{entity_type} cannot be synced on its own"
            )));
        }
        Ok(self.run(entity_type).await)
    }

    /// Bulk when nothing of this type is mirrored or no row carries
    /// `updated_at`; otherwise incremental from one second past the newest row.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn plan(&self, entity_type: EntityType) -> Result<SyncMode> {
        if self.store.count(entity_type).await? == 0 {
            return Ok(SyncMode::Bulk);
        }
        Ok(match self.store.max_updated_at(entity_type).await? {
            Some(newest) => SyncMode::Incremental {
                since: newest + Duration::seconds(1),
            },
            None => SyncMode::Bulk,
        })
    }

    async fn run(&self, entity_type: EntityType) -> SyncOutcome {
        let mode = match self.plan(entity_type).await {
            Ok(mode) => mode,
            Err(e) => {
                tracing::warn!(entity_type = %entity_type, error = %e, "sync planning failed");
                return SyncOutcome::failed(None, 0, e.to_string());
            }
        };

        let mut records = 0u64;
        let result = match entity_type {
            EntityType::CannedResponse => self.pull_canned_responses(mode, &mut records).await,
            _ => self.pull(entity_type, mode, &mut records).await,
        };

        match result {
            Ok(()) => {
                tracing::info!(entity_type = %entity_type, ?mode, records, "entity sync complete");
                SyncOutcome::succeeded(mode, records)
            }
            Err(e) => {
                tracing::warn!(
                    entity_type = %entity_type,
                    records,
                    retryable = e.is_retryable(),
                    error = %e,
                    "entity sync failed"
                );
                SyncOutcome::failed(Some(mode), records, e.to_string())
            }
        }
    }

    async fn pull(&self, entity_type: EntityType, mode: SyncMode, records: &mut u64) -> Result<()> {
        let mut pager = Pager::new(&*self.remote, spec(entity_type).remote_path, self.page_size);
        if let Some(since) = mode.since() {
            pager = pager.with_query("updated_since", format_timestamp(since));
        }

        while let Some(items) = pager.next_page().await? {
            for item in items {
                self.reconcile_record(entity_type, item).await?;
                *records += 1;
            }
        }
        Ok(())
    }

    /// Canned responses have no flat listing: walk the folders, then each
    /// folder's responses. The folder endpoint has no `updated_since`, so the
    /// cursor is applied here.
    async fn pull_canned_responses(&self, mode: SyncMode, records: &mut u64) -> Result<()> {
        let folders = match self.remote.get(paths::CANNED_RESPONSE_FOLDERS, &[]).await? {
            Value::Array(folders) => folders,
            Value::Null => Vec::new(),
            _ => {
                return Err(RemoteError::Request(
                    "canned response folder listing is not an array".to_string(),
                )
                .into());
            }
        };

        for folder in folders {
            let Some(folder_id) = folder.get("id").and_then(id_from_value) else {
                continue;
            };
            let mut pager = Pager::new(
                &*self.remote,
                paths::folder_responses(RemoteId(folder_id)),
                self.page_size,
            );
            while let Some(items) = pager.next_page().await? {
                for mut item in items {
                    if let Some(since) = mode.since() {
                        let updated = item
                            .get("updated_at")
                            .and_then(Value::as_str)
                            .and_then(parse_timestamp);
                        if updated.is_some_and(|u| u < since) {
                            continue;
                        }
                    }
                    if let Some(obj) = item.as_object_mut() {
                        if obj.get("folder_id").is_none_or(Value::is_null) {
                            obj.insert("folder_id".to_string(), Value::from(folder_id));
                        }
                    }
                    self.reconcile_record(EntityType::CannedResponse, item)
                        .await?;
                    *records += 1;
                }
            }
        }
        Ok(())
    }

    async fn reconcile_record(&self, entity_type: EntityType, item: Value) -> Result<LocalEntity> {
        let payload = RemotePayload::from_value(item)?;
        self.reconciler.upsert_remote(entity_type, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::models::LocalId;
    use crate::test_support::{FakeRemote, contact_json, memory_store, page_of, ticket_json};
    use crate::translate::LocalPayload;
    use serde_json::json;

    /// A remote where every list endpoint answers with no records.
    fn quiet_remote() -> Arc<FakeRemote> {
        let remote = FakeRemote::new();
        for ty in EntityType::SYNC_ORDER {
            remote.on_pages(spec(ty).remote_path, vec![]);
        }
        remote.on("GET", paths::CANNED_RESPONSE_FOLDERS, json!([]));
        remote
    }

    #[tokio::test]
    async fn bulk_sync_pages_until_a_short_page() {
        let store = memory_store().await;
        let remote = quiet_remote();
        remote.on_pages(
            "/api/v2/tickets",
            vec![page_of(1, 100), page_of(101, 100), page_of(201, 37)],
        );

        let report = SyncOrchestrator::new(remote.clone(), store.clone())
            .sync_all()
            .await;

        let tickets = report.get(EntityType::Ticket).unwrap();
        assert!(tickets.success);
        assert_eq!(tickets.mode, Some(SyncMode::Bulk));
        assert_eq!(tickets.records, 237);
        assert_eq!(remote.calls_to("GET", "/api/v2/tickets").len(), 3);
        assert_eq!(store.count(EntityType::Ticket).await.unwrap(), 237);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn incremental_sync_starts_one_second_past_newest_row() {
        let store = memory_store().await;
        Reconciler::new(store.clone())
            .upsert(
                EntityType::Ticket,
                &LocalPayload::from_value(ticket_json(1, "2024-05-01T10:00:00Z")).unwrap(),
            )
            .await
            .unwrap();
        let remote = quiet_remote();

        let outcome = SyncOrchestrator::new(remote.clone(), store)
            .sync_one(EntityType::Ticket)
            .await
            .unwrap();

        assert_eq!(
            outcome.mode,
            Some(SyncMode::Incremental {
                since: parse_timestamp("2024-05-01T10:00:01Z").unwrap()
            })
        );
        let call = &remote.calls_to("GET", "/api/v2/tickets")[0];
        assert_eq!(call.query_value("updated_since"), Some("2024-05-01T10:00:01Z"));
        assert_eq!(call.query_value("per_page"), Some("100"));
    }

    #[tokio::test]
    async fn free_text_updated_at_does_not_hide_the_cursor() {
        let store = memory_store().await;
        let reconciler = Reconciler::new(store.clone());
        for (id, updated_at) in [(1, "2024-05-01T10:00:00Z"), (2, "not-a-date")] {
            reconciler
                .upsert(
                    EntityType::Ticket,
                    &LocalPayload::from_value(ticket_json(id, updated_at)).unwrap(),
                )
                .await
                .unwrap();
        }
        // A row left over from before timestamps were normalized.
        sqlx::query("UPDATE tickets SET updated_at = 'zzz' WHERE remote_id = 2")
            .execute(store.pool())
            .await
            .unwrap();

        let mode = SyncOrchestrator::new(quiet_remote(), store)
            .plan(EntityType::Ticket)
            .await
            .unwrap();
        assert_eq!(
            mode,
            SyncMode::Incremental {
                since: parse_timestamp("2024-05-01T10:00:01Z").unwrap()
            }
        );
    }

    #[tokio::test]
    async fn rows_without_updated_at_fall_back_to_bulk() {
        let store = memory_store().await;
        Reconciler::new(store.clone())
            .upsert(
                EntityType::Company,
                &LocalPayload::from_value(json!({"id": 1, "name": "Acme"})).unwrap(),
            )
            .await
            .unwrap();
        let orchestrator = SyncOrchestrator::new(quiet_remote(), store);
        assert_eq!(
            orchestrator.plan(EntityType::Company).await.unwrap(),
            SyncMode::Bulk
        );
    }

    #[tokio::test]
    async fn one_failing_type_does_not_stop_the_run() {
        let store = memory_store().await;
        let remote = quiet_remote();
        remote.on_pages("/api/v2/companies", vec![json!([{"id": 1, "name": "Acme"}])]);
        remote.fail(
            "GET",
            "/api/v2/contacts",
            RemoteError::ServiceUnavailable { status: 503 },
        );
        remote.on_pages("/api/v2/tickets", vec![page_of(1, 2)]);

        let report = SyncOrchestrator::new(remote, store.clone()).sync_all().await;

        assert!(report.get(EntityType::Company).unwrap().success);
        let contacts = report.get(EntityType::Contact).unwrap();
        assert!(!contacts.success);
        assert!(contacts.message.as_deref().unwrap().contains("503"));
        let tickets = report.get(EntityType::Ticket).unwrap();
        assert!(tickets.success);
        assert_eq!(tickets.records, 2);
        assert_eq!(report.failed_types(), vec![EntityType::Contact]);
    }

    #[tokio::test]
    async fn records_before_a_mid_page_failure_stay_committed() {
        let store = memory_store().await;
        let remote = quiet_remote();
        remote.on_pages(
            "/api/v2/contacts",
            vec![json!([contact_json(1), contact_json(2), "not an object"])],
        );

        let outcome = SyncOrchestrator::new(remote, store.clone())
            .sync_one(EntityType::Contact)
            .await
            .unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.records, 2);
        assert_eq!(store.count(EntityType::Contact).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn canned_responses_are_walked_per_folder_and_filtered_by_cursor() {
        let store = memory_store().await;
        Reconciler::new(store.clone())
            .upsert(
                EntityType::CannedResponse,
                &LocalPayload::from_value(
                    json!({"id": 1, "title": "old", "updated_at": "2024-01-01T00:00:00Z"}),
                )
                .unwrap(),
            )
            .await
            .unwrap();

        let remote = quiet_remote();
        remote.on("GET", paths::CANNED_RESPONSE_FOLDERS, json!([{"id": 8}]));
        remote.on_pages(
            "/api/v2/canned_response_folders/8/responses",
            vec![json!([
                {"id": 2, "title": "stale", "updated_at": "2023-12-31T00:00:00Z"},
                {"id": 3, "title": "fresh", "updated_at": "2024-02-01T00:00:00Z"},
            ])],
        );

        let outcome = SyncOrchestrator::new(remote, store.clone())
            .sync_one(EntityType::CannedResponse)
            .await
            .unwrap();

        assert_eq!(outcome.records, 1);
        let fresh = store
            .find_by_remote_id(EntityType::CannedResponse, RemoteId(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fresh.field("folder_id"), Some(&json!(8)));
        assert!(
            store
                .find_by_remote_id(EntityType::CannedResponse, RemoteId(2))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn group_sync_after_agents_resolves_membership() {
        let store = memory_store().await;
        let remote = quiet_remote();
        remote.on_pages(
            "/api/v2/agents",
            vec![json!([{"id": 70, "contact": {"name": "Ann"}}])],
        );
        remote.on_pages(
            "/api/v2/groups",
            vec![json!([{"id": 5, "name": "L1", "agent_ids": [70]}])],
        );

        let report = SyncOrchestrator::new(remote, store.clone()).sync_all().await;
        assert!(report.is_success());

        let group = store
            .find_by_remote_id(EntityType::Group, RemoteId(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            store.group_members(group.local_id).await.unwrap(),
            vec![LocalId(1)]
        );
    }

    #[tokio::test]
    async fn conversations_cannot_be_synced_directly() {
        let orchestrator = SyncOrchestrator::new(quiet_remote(), memory_store().await);
        assert!(matches!(
            orchestrator.sync_one(EntityType::Conversation).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
