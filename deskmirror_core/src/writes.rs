//! Write-through mutations: the remote API is called first and its answer is
//! reconciled into the mirror. A failed remote call leaves the mirror as it
//! was.

use crate::entities::models::{EntityType, LocalEntity, LocalId, RemoteId};
use crate::entities::tables::spec;
use crate::reconcile::Reconciler;
use crate::remote::traits::{RemoteApi, UploadFile};
use crate::store::traits::LocalStore;
use crate::translate::{LocalPayload, RemotePayload, translate_inbound, translate_outbound};
use crate::{Error, Result};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Flatten a JSON object into multipart text fields: arrays become repeated
/// `key[]` fields and objects become `key[name]` fields.
pub fn form_fields(map: &Map<String, Value>) -> Vec<(String, String)> {
    fn scalar(value: &Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    let mut fields = Vec::new();
    for (key, value) in map {
        match value {
            Value::Array(items) => fields.extend(
                items
                    .iter()
                    .filter_map(scalar)
                    .map(|v| (format!("{key}[]"), v)),
            ),
            Value::Object(inner) => fields.extend(
                inner
                    .iter()
                    .filter_map(|(name, v)| scalar(v).map(|v| (format!("{key}[{name}]"), v))),
            ),
            other => fields.extend(scalar(other).map(|v| (key.clone(), v))),
        }
    }
    fields
}

fn ensure_writable(entity_type: EntityType) -> Result<()> {
    if entity_type == EntityType::Conversation {
        return Err(Error::InvalidInput(
            "conversations are mirrored read-only".to_string(),
        ));
    }
    Ok(())
}

pub struct WriteThrough {
    remote: Arc<dyn RemoteApi>,
    store: Arc<dyn LocalStore>,
    reconciler: Reconciler,
}

impl WriteThrough {
    pub fn new(remote: Arc<dyn RemoteApi>, store: Arc<dyn LocalStore>) -> Self {
        Self {
            remote,
            reconciler: Reconciler::new(store.clone()),
            store,
        }
    }

    async fn remote_id(&self, entity_type: EntityType, local_id: LocalId) -> Result<RemoteId> {
        self.store
            .remote_id_for(entity_type, local_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{entity_type} {local_id}")))
    }

    /// Create the record remotely, then mirror what the helpdesk returned.
    /// Attachments switch the request to multipart.
    #[tracing::instrument(level = "info", skip(self, payload, files), fields(files = files.len()))]
    pub async fn create(
        &self,
        entity_type: EntityType,
        payload: LocalPayload,
        files: Vec<UploadFile>,
    ) -> Result<LocalEntity> {
        ensure_writable(entity_type)?;
        let outbound = translate_outbound(self.store.as_ref(), entity_type, payload).await?;
        let path = spec(entity_type).remote_path;

        let response = if files.is_empty() {
            self.remote.post(path, &outbound.into_value()).await?
        } else {
            let fields = form_fields(outbound.as_map());
            self.remote.post_multipart(path, &fields, files).await?
        };

        let created = self
            .reconciler
            .upsert_remote(entity_type, RemotePayload::from_value(response)?)
            .await?;
        tracing::info!(entity_type = %entity_type, local_id = %created.local_id, remote_id = %created.remote_id, "created");
        Ok(created)
    }

    /// Update the record remotely, then write back only the submitted keys
    /// (plus `updated_at`) from the response.
    #[tracing::instrument(level = "info", skip(self, payload))]
    pub async fn update(
        &self,
        entity_type: EntityType,
        local_id: LocalId,
        payload: LocalPayload,
    ) -> Result<LocalEntity> {
        ensure_writable(entity_type)?;
        let remote_id = self.remote_id(entity_type, local_id).await?;
        let submitted: Vec<String> = payload.as_map().keys().cloned().collect();

        let outbound = translate_outbound(self.store.as_ref(), entity_type, payload).await?;
        let response = self
            .remote
            .put(
                &spec(entity_type).record_path(remote_id),
                &outbound.clone().into_value(),
            )
            .await?;
        let echoed = match response {
            Value::Null => outbound,
            other => RemotePayload::from_value(other)?,
        };

        let mut local = translate_inbound(self.store.as_ref(), entity_type, echoed)
            .await?
            .into_inner();
        local.retain(|key, _| key == "updated_at" || submitted.iter().any(|s| s == key));
        local.insert("id".to_string(), Value::from(remote_id.0));

        self.reconciler
            .upsert_partial(entity_type, &LocalPayload::new(local))
            .await
    }

    /// Delete the record remotely, then soft delete the local row.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn delete(&self, entity_type: EntityType, local_id: LocalId) -> Result<LocalEntity> {
        ensure_writable(entity_type)?;
        let remote_id = self.remote_id(entity_type, local_id).await?;
        self.remote
            .delete(&spec(entity_type).record_path(remote_id))
            .await?;
        self.store
            .soft_delete(entity_type, local_id, Utc::now())
            .await?;
        self.store
            .get(entity_type, local_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{entity_type} {local_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::error::RemoteError;
    use crate::store::traits::ListQuery;
    use crate::test_support::{FakeRemote, contact_json, memory_store, ticket_json};
    use serde_json::json;

    async fn seed_contact(store: &Arc<crate::store::sqlite::SqliteStore>, remote_id: i64) -> LocalId {
        Reconciler::new(store.clone())
            .upsert_remote(
                EntityType::Contact,
                RemotePayload::from_value(contact_json(remote_id)).unwrap(),
            )
            .await
            .unwrap()
            .local_id
    }

    #[test]
    fn form_fields_flatten_arrays_and_objects() {
        let map = json!({
            "subject": "Printer",
            "priority": 2,
            "tags": ["a", "b"],
            "custom_fields": {"cf_region": "eu"},
            "responder_id": null,
        });
        let mut fields = form_fields(map.as_object().unwrap());
        fields.sort();
        assert_eq!(
            fields,
            vec![
                ("custom_fields[cf_region]".to_string(), "eu".to_string()),
                ("priority".to_string(), "2".to_string()),
                ("subject".to_string(), "Printer".to_string()),
                ("tags[]".to_string(), "a".to_string()),
                ("tags[]".to_string(), "b".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn create_translates_both_ways() {
        let store = memory_store().await;
        let requester = seed_contact(&store, 42).await;
        let remote = FakeRemote::new();
        let mut created = ticket_json(950, "2024-04-01T00:00:00Z");
        created["requester_id"] = json!(42);
        remote.on("POST", "/api/v2/tickets", created);

        let ticket = WriteThrough::new(remote.clone(), store.clone())
            .create(
                EntityType::Ticket,
                LocalPayload::from_value(json!({"subject": "Ticket 950", "requester_id": requester.0}))
                    .unwrap(),
                Vec::new(),
            )
            .await
            .unwrap();

        let sent = remote.calls_to("POST", "/api/v2/tickets")[0].body.clone().unwrap();
        assert_eq!(sent["requester_id"], json!(42));
        assert_eq!(ticket.remote_id, RemoteId(950));
        assert_eq!(ticket.reference("requester_id"), Some(requester));
    }

    #[tokio::test]
    async fn create_with_files_goes_multipart() {
        let store = memory_store().await;
        let remote = FakeRemote::new();
        remote.on("POST", "/api/v2/tickets", ticket_json(951, "2024-04-01T00:00:00Z"));

        WriteThrough::new(remote.clone(), store)
            .create(
                EntityType::Ticket,
                LocalPayload::from_value(json!({"subject": "s", "tags": ["x"]})).unwrap(),
                vec![UploadFile::attachment("log.txt", b"boom".to_vec())],
            )
            .await
            .unwrap();

        let sent = remote.calls_to("POST", "/api/v2/tickets")[0].body.clone().unwrap();
        assert_eq!(sent["files"], json!(["log.txt"]));
        assert!(
            sent["fields"]
                .as_array()
                .unwrap()
                .contains(&json!(["tags[]", "x"]))
        );
    }

    #[tokio::test]
    async fn update_writes_back_only_submitted_keys() {
        let store = memory_store().await;
        let mut original = ticket_json(900, "2024-01-01T00:00:00Z");
        original["tags"] = json!(["keep"]);
        let ticket = Reconciler::new(store.clone())
            .upsert_remote(EntityType::Ticket, RemotePayload::from_value(original).unwrap())
            .await
            .unwrap();

        let remote = FakeRemote::new();
        let mut echoed = ticket_json(900, "2024-01-05T00:00:00Z");
        echoed["status"] = json!(5);
        echoed["priority"] = json!(4);
        echoed["tags"] = json!([]);
        remote.on("PUT", "/api/v2/tickets/900", echoed);

        let updated = WriteThrough::new(remote, store)
            .update(
                EntityType::Ticket,
                ticket.local_id,
                LocalPayload::from_value(json!({"status": 5})).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(updated.field("status"), Some(&json!(5)));
        assert_eq!(updated.field("priority"), Some(&json!(1)));
        assert_eq!(updated.values_of("tags"), ["keep".to_string()]);
        assert_eq!(updated.text("updated_at"), Some("2024-01-05T00:00:00Z"));
    }

    #[tokio::test]
    async fn delete_soft_deletes_after_remote_success() {
        let store = memory_store().await;
        let contact = seed_contact(&store, 42).await;
        let remote = FakeRemote::new();
        remote.on("DELETE", "/api/v2/contacts/42", Value::Null);

        let deleted = WriteThrough::new(remote, store.clone())
            .delete(EntityType::Contact, contact)
            .await
            .unwrap();
        assert!(deleted.is_deleted);
        assert!(
            store
                .list(EntityType::Contact, &ListQuery::default())
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn failed_remote_delete_keeps_the_row() {
        let store = memory_store().await;
        let contact = seed_contact(&store, 42).await;
        let remote = FakeRemote::new();
        remote.fail("DELETE", "/api/v2/contacts/42", RemoteError::NotFound("42".into()));

        let err = WriteThrough::new(remote, store.clone())
            .delete(EntityType::Contact, contact)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote(RemoteError::NotFound(_))));
        let row = store.get(EntityType::Contact, contact).await.unwrap().unwrap();
        assert!(!row.is_deleted);
    }

    #[tokio::test]
    async fn conversations_and_unknown_rows_are_rejected() {
        let store = memory_store().await;
        let writes = WriteThrough::new(FakeRemote::new(), store);
        assert!(matches!(
            writes
                .create(EntityType::Conversation, LocalPayload::default(), Vec::new())
                .await,
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            writes.delete(EntityType::Ticket, LocalId(5)).await,
            Err(Error::NotFound(_))
        ));
    }
}
