//! Merging duplicate remote records and replaying the merge locally.
//!
//! The remote merge runs first; the local side then re-pulls the primary,
//! repoints references held by other rows, retires the secondaries and (for
//! tickets) backfills conversations. Every local step is idempotent so a
//! retried merge converges.

use crate::entities::models::{EntityType, LocalEntity, LocalId, RemoteId};
use crate::entities::tables::{references_to, spec};
use crate::reconcile::Reconciler;
use crate::remote::paths;
use crate::remote::traits::RemoteApi;
use crate::store::traits::LocalStore;
use crate::sync::engine::DEFAULT_PAGE_SIZE;
use crate::sync::paging::Pager;
use crate::translate::{LocalPayload, RemotePayload, translate_outbound};
use crate::{Error, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// A note the helpdesk adds to a ticket as part of a merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeNote {
    pub body: String,
    #[serde(default)]
    pub private: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TicketMergeOptions {
    #[serde(default)]
    pub note_in_primary: Option<MergeNote>,
    #[serde(default)]
    pub note_in_secondary: Option<MergeNote>,
    /// Add the secondaries' recipients to the primary as CCs.
    #[serde(default)]
    pub convert_recipients_to_cc: bool,
}

impl TicketMergeOptions {
    fn write_into(&self, body: &mut Map<String, Value>) {
        for (key, note) in [
            ("note_in_primary", &self.note_in_primary),
            ("note_in_secondary", &self.note_in_secondary),
        ] {
            if let Some(note) = note {
                body.insert(
                    key.to_string(),
                    json!({"body": note.body, "private": note.private}),
                );
            }
        }
        // Key spelling is the helpdesk's.
        body.insert(
            "convert_recepients_to_cc".to_string(),
            Value::Bool(self.convert_recipients_to_cc),
        );
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// The primary as mirrored after the merge.
    pub primary: LocalEntity,
    pub merged_local_ids: Vec<LocalId>,
    pub references_repointed: u64,
    pub conversations_inserted: u64,
}

pub struct MergeCoordinator {
    remote: Arc<dyn RemoteApi>,
    store: Arc<dyn LocalStore>,
    reconciler: Reconciler,
    page_size: usize,
}

struct MergeIds {
    primary_remote: RemoteId,
    secondaries: Vec<LocalId>,
    secondary_remotes: Vec<RemoteId>,
}

impl MergeCoordinator {
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

    /// Merge `secondaries` into `primary` contact. Secondary rows are removed;
    /// tickets they requested move to the primary while conversation
    /// authorship keeps pointing at the original contact.
    #[tracing::instrument(level = "info", skip(self, overrides))]
    pub async fn merge_contacts(
        &self,
        primary: LocalId,
        secondaries: &[LocalId],
        overrides: LocalPayload,
    ) -> Result<MergeOutcome> {
        let MergeIds {
            primary_remote,
            secondaries,
            secondary_remotes,
        } = self.resolve(EntityType::Contact, primary, secondaries).await?;

        let mut body = Map::new();
        body.insert("primary_contact_id".into(), json!(primary_remote.0));
        body.insert(
            "secondary_contact_ids".into(),
            json!(secondary_remotes.iter().map(|r| r.0).collect::<Vec<_>>()),
        );
        if !overrides.as_map().is_empty() {
            let overrides =
                translate_outbound(self.store.as_ref(), EntityType::Contact, overrides).await?;
            body.insert("contact".into(), overrides.into_value());
        }
        self.remote
            .post(paths::CONTACT_MERGE, &Value::Object(body))
            .await?;

        let primary_entity = self.refetch(EntityType::Contact, primary_remote).await?;
        let references_repointed = self
            .cascade(EntityType::Contact, &secondaries, primary_entity.local_id)
            .await?;
        for secondary in &secondaries {
            self.store.hard_delete(EntityType::Contact, *secondary).await?;
        }

        tracing::info!(
            primary = %primary_entity.local_id,
            merged = secondaries.len(),
            references_repointed,
            "contacts merged"
        );
        Ok(MergeOutcome {
            primary: primary_entity,
            merged_local_ids: secondaries,
            references_repointed,
            conversations_inserted: 0,
        })
    }

    /// Merge `secondaries` into `primary` ticket. Secondaries are soft
    /// deleted and every conversation of the merged tickets missing locally
    /// is pulled in.
    #[tracing::instrument(level = "info", skip(self, options))]
    pub async fn merge_tickets(
        &self,
        primary: LocalId,
        secondaries: &[LocalId],
        options: &TicketMergeOptions,
    ) -> Result<MergeOutcome> {
        let MergeIds {
            primary_remote,
            secondaries,
            secondary_remotes,
        } = self.resolve(EntityType::Ticket, primary, secondaries).await?;

        let mut body = Map::new();
        body.insert("primary_id".into(), json!(primary_remote.0));
        body.insert(
            "ticket_ids".into(),
            json!(secondary_remotes.iter().map(|r| r.0).collect::<Vec<_>>()),
        );
        options.write_into(&mut body);
        self.remote
            .put(paths::TICKET_MERGE, &Value::Object(body))
            .await?;

        let primary_entity = self.refetch(EntityType::Ticket, primary_remote).await?;
        let references_repointed = self
            .cascade(EntityType::Ticket, &secondaries, primary_entity.local_id)
            .await?;
        let now = Utc::now();
        for secondary in &secondaries {
            self.store
                .soft_delete(EntityType::Ticket, *secondary, now)
                .await?;
        }

        let mut conversations_inserted = 0;
        for ticket in std::iter::once(primary_remote).chain(secondary_remotes) {
            conversations_inserted += self.backfill_conversations(ticket).await?;
        }

        tracing::info!(
            primary = %primary_entity.local_id,
            merged = secondaries.len(),
            conversations_inserted,
            "tickets merged"
        );
        Ok(MergeOutcome {
            primary: primary_entity,
            merged_local_ids: secondaries,
            references_repointed,
            conversations_inserted,
        })
    }

    /// Validate the ids and look up their remote counterparts. Repeated
    /// secondaries collapse to their first occurrence.
    async fn resolve(
        &self,
        entity_type: EntityType,
        primary: LocalId,
        secondaries: &[LocalId],
    ) -> Result<MergeIds> {
        if secondaries.is_empty() {
            return Err(Error::InvalidInput(format!(
                "{entity_type} merge needs at least one secondary"
            )));
        }
        if secondaries.contains(&primary) {
            return Err(Error::InvalidInput(format!(
                "{entity_type} {primary} cannot be merged into itself"
            )));
        }

        let mut unique: Vec<LocalId> = Vec::with_capacity(secondaries.len());
        for id in secondaries {
            if !unique.contains(id) {
                unique.push(*id);
            }
        }

        let primary_remote = self.remote_id(entity_type, primary).await?;
        let mut secondary_remotes = Vec::with_capacity(unique.len());
        for local_id in &unique {
            secondary_remotes.push(self.remote_id(entity_type, *local_id).await?);
        }
        Ok(MergeIds {
            primary_remote,
            secondaries: unique,
            secondary_remotes,
        })
    }

    async fn remote_id(&self, entity_type: EntityType, local_id: LocalId) -> Result<RemoteId> {
        self.store
            .remote_id_for(entity_type, local_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{entity_type} {local_id}")))
    }

    async fn refetch(&self, entity_type: EntityType, remote_id: RemoteId) -> Result<LocalEntity> {
        let body = self
            .remote
            .get(&spec(entity_type).record_path(remote_id), &[])
            .await?;
        self.reconciler
            .upsert_remote(entity_type, RemotePayload::from_value(body)?)
            .await
    }

    /// Repoint every single-id reference to `from` at `to`, skipping
    /// references that keep history.
    async fn cascade(&self, target: EntityType, from: &[LocalId], to: LocalId) -> Result<u64> {
        let mut changed = 0;
        for (owner, fk) in references_to(target).filter(|(_, fk)| !fk.keeps_history) {
            changed += self
                .store
                .reassign_references(owner, fk.field, from, to)
                .await?;
        }
        Ok(changed)
    }

    async fn backfill_conversations(&self, ticket: RemoteId) -> Result<u64> {
        let thread = Pager::new(
            &*self.remote,
            paths::ticket_conversations(ticket),
            self.page_size,
        )
        .collect_all()
        .await?;

        let mut inserted = 0;
        for entry in thread {
            let payload = RemotePayload::from_value(entry)?;
            let Some(remote_id) = payload.id().map(RemoteId) else {
                continue;
            };
            if self
                .store
                .local_id_for(EntityType::Conversation, remote_id)
                .await?
                .is_some()
            {
                continue;
            }
            self.reconciler
                .upsert_remote(EntityType::Conversation, payload)
                .await?;
            inserted += 1;
        }
        Ok(inserted)
    }
}
