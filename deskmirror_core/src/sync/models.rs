use crate::entities::models::EntityType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a type is pulled from the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SyncMode {
    /// Every record, because nothing is mirrored yet (or no cursor exists).
    Bulk,
    /// Records updated at or after `since`.
    Incremental { since: DateTime<Utc> },
}

impl SyncMode {
    pub fn since(&self) -> Option<DateTime<Utc>> {
        match self {
            SyncMode::Bulk => None,
            SyncMode::Incremental { since } => Some(*since),
        }
    }
}

/// Result of syncing one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub success: bool,
    pub message: Option<String>,
    pub mode: Option<SyncMode>,
    /// Records reconciled, including those committed before a failure.
    pub records: u64,
}

impl SyncOutcome {
    pub fn succeeded(mode: SyncMode, records: u64) -> Self {
        Self {
            success: true,
            message: None,
            mode: Some(mode),
            records,
        }
    }

    pub fn failed(mode: Option<SyncMode>, records: u64, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            mode,
            records,
        }
    }
}

/// Per-type outcomes of a `sync_all` run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncReport {
    pub outcomes: BTreeMap<EntityType, SyncOutcome>,
}

impl SyncReport {
    pub fn insert(&mut self, entity_type: EntityType, outcome: SyncOutcome) {
        self.outcomes.insert(entity_type, outcome);
    }

    pub fn get(&self, entity_type: EntityType) -> Option<&SyncOutcome> {
        self.outcomes.get(&entity_type)
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(|o| o.success)
    }

    pub fn failed_types(&self) -> Vec<EntityType> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.success)
            .map(|(t, _)| *t)
            .collect()
    }

    pub fn total_records(&self) -> u64 {
        self.outcomes.values().map(|o| o.records).sum()
    }
}
