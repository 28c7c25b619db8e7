use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One entry of a conversation's view catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ViewRecord {
    view_name: String,
    source_id: String,
    source_ref: String,
    created_at: DateTime<Utc>,
    last_used_at: DateTime<Utc>,
}

impl ViewRecord {
    pub fn new(
        view_name: impl Into<String>,
        source_id: impl Into<String>,
        source_ref: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            view_name: view_name.into(),
            source_id: source_id.into(),
            source_ref: source_ref.into(),
            created_at: now,
            last_used_at: now,
        }
    }

    pub(crate) fn restore(
        view_name: String,
        source_id: String,
        source_ref: String,
        created_at: DateTime<Utc>,
        last_used_at: DateTime<Utc>,
    ) -> Self {
        Self {
            view_name,
            source_id,
            source_ref,
            created_at,
            last_used_at: last_used_at.max(created_at),
        }
    }

    pub fn view_name(&self) -> &str {
        &self.view_name
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn source_ref(&self) -> &str {
        &self.source_ref
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
    }

    /// Advance `last_used_at`. Always moves forward, even when `at` does not
    /// (coarse clocks, two touches within one tick).
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_used_at = if at > self.last_used_at {
            at
        } else {
            self.last_used_at + Duration::milliseconds(1)
        };
    }

    pub(crate) fn renamed(&self, view_name: &str) -> Self {
        Self {
            view_name: view_name.to_string(),
            ..self.clone()
        }
    }
}

/// Listing shape handed to the tool layer.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ViewSummary {
    pub view_name: String,
    pub source_ref: String,
    pub source_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl From<&ViewRecord> for ViewSummary {
    fn from(r: &ViewRecord) -> Self {
        Self {
            view_name: r.view_name.clone(),
            source_ref: r.source_ref.clone(),
            source_id: r.source_id.clone(),
            created_at: r.created_at,
            last_used_at: r.last_used_at,
        }
    }
}
