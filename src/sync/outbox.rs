//! Pending mutation log
//!
//! Every local write appends a snapshot of the written entity. Entries leave
//! the log only when the server acknowledges that entity's id.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::protocol::{SamplePayload, SessionPayload, SyncUpRequest};
use crate::error::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    SessionUpsert,
    SampleUpsert,
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::SessionUpsert => "session_upsert",
            MutationKind::SampleUpsert => "sample_upsert",
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session_upsert" => Ok(MutationKind::SessionUpsert),
            "sample_upsert" => Ok(MutationKind::SampleUpsert),
            other => Err(Error::Internal(format!("unknown mutation kind '{}'", other))),
        }
    }
}

/// One queued local write.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMutation {
    /// Local sequence number, strictly increasing
    pub seq: i64,
    pub kind: MutationKind,
    pub entity_id: Uuid,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

/// Collapse the log to the newest snapshot per entity, oldest entity first.
///
/// The surviving entry carries the highest `seq` seen for its entity, which is
/// the bound used when acknowledging it.
pub fn coalesce(pending: Vec<PendingMutation>) -> Vec<PendingMutation> {
    let mut order: Vec<(MutationKind, Uuid)> = Vec::new();
    let mut latest: HashMap<(MutationKind, Uuid), PendingMutation> = HashMap::new();

    for mutation in pending {
        let key = (mutation.kind, mutation.entity_id);
        match latest.get(&key) {
            Some(existing) if existing.seq > mutation.seq => {}
            Some(_) => {
                latest.insert(key, mutation);
            }
            None => {
                order.push(key);
                latest.insert(key, mutation);
            }
        }
    }

    order.into_iter().filter_map(|key| latest.remove(&key)).collect()
}

/// A coalesced set of mutations ready to be pushed.
#[derive(Debug, Clone, Default)]
pub struct PushBatch {
    pub mutations: Vec<PendingMutation>,
}

impl PushBatch {
    pub fn new(mutations: Vec<PendingMutation>) -> Self {
        Self { mutations }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Highest sequence included for `(kind, id)`, if the batch carries it.
    pub fn seq_for(&self, kind: MutationKind, id: Uuid) -> Option<i64> {
        self.mutations
            .iter()
            .find(|m| m.kind == kind && m.entity_id == id)
            .map(|m| m.seq)
    }

    /// The completed session snapshots in this batch.
    pub fn completed_sessions(&self) -> Vec<Uuid> {
        self.mutations
            .iter()
            .filter(|m| m.kind == MutationKind::SessionUpsert)
            .filter(|m| {
                m.payload.get("status").and_then(|s| s.as_str()) == Some("completed")
            })
            .map(|m| m.entity_id)
            .collect()
    }

    pub fn to_request(&self) -> Result<SyncUpRequest, Error> {
        let mut request = SyncUpRequest::default();
        for mutation in &self.mutations {
            match mutation.kind {
                MutationKind::SessionUpsert => {
                    let payload: SessionPayload = serde_json::from_value(mutation.payload.clone())?;
                    request.sessions.push(payload);
                }
                MutationKind::SampleUpsert => {
                    let payload: SamplePayload = serde_json::from_value(mutation.payload.clone())?;
                    request.samples.push(payload);
                }
            }
        }
        Ok(request)
    }
}
