use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stowage_core::OrgId;

/// Envelope for a published event, carrying tenant and timing metadata.
///
/// `org_id` scopes every event to one organization; consumers serving a
/// single tenant filter on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    event_id: Uuid,
    org_id: OrgId,
    occurred_at: DateTime<Utc>,
    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(org_id: OrgId, occurred_at: DateTime<Utc>, payload: E) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            org_id,
            occurred_at,
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn org_id(&self) -> OrgId {
        self.org_id
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Whether the event belongs to `org_id`.
    pub fn is_for(&self, org_id: OrgId) -> bool {
        self.org_id == org_id
    }
}
