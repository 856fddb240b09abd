use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    ICloud,
    CalDav,
    Ics,
    Local,
}

/// What a given provider variant is able to do with the sync engine.
pub struct ProviderCapabilities {
    pub can_discover: bool,
    pub can_push: bool,
    pub can_pull: bool,
    pub is_read_only: bool,
}

impl Provider {
    pub fn capabilities(&self) -> ProviderCapabilities {
        match self {
            Provider::ICloud | Provider::CalDav => ProviderCapabilities {
                can_discover: true,
                can_push: true,
                can_pull: true,
                is_read_only: false,
            },
            Provider::Ics => ProviderCapabilities {
                can_discover: false,
                can_push: false,
                can_pull: true,
                is_read_only: true,
            },
            Provider::Local => ProviderCapabilities {
                can_discover: false,
                can_push: false,
                can_pull: false,
                is_read_only: false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub provider: Provider,
    pub email: String,
    pub display_name: String,
    pub principal_url: Option<Url>,
    pub calendar_home_url: Option<Url>,
    pub credential_ref: Option<String>,
    pub enabled: bool,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    pub last_sync_success: Option<DateTime<Utc>>,
    pub consecutive_sync_failures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calendar {
    pub id: Uuid,
    pub account_id: Uuid,
    pub server_url: Option<Url>,
    pub display_name: String,
    pub color_argb: u32,
    pub read_only: bool,
    pub visible: bool,
    pub is_default: bool,
    pub sort_order: i32,
    pub sync_token: Option<String>,
    pub ctag: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Tentative,
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transparency {
    Opaque,
    Transparent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Public,
    Private,
    Confidential,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
}

/// A single RFC 5545 VEVENT: either the master of a recurrence set, or an
/// exception instance (`original_event_id` points at its master).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub uid: String,
    pub calendar_id: Uuid,
    pub original_event_id: Option<Uuid>,
    pub original_instance_time: Option<i64>,
    pub title: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub start_ts: i64,
    pub end_ts: i64,
    pub timezone: Option<String>,
    pub all_day: bool,
    pub status: EventStatus,
    pub transparency: Transparency,
    pub classification: Classification,
    pub organizer: Option<String>,
    pub rrule: Option<String>,
    pub rdate: Vec<i64>,
    pub exdate: Vec<i64>,
    pub duration: Option<String>,
    pub dtstamp: DateTime<Utc>,
    pub reminders: Vec<String>,
    pub extra_properties: BTreeMap<String, String>,
    pub categories: Vec<String>,
    pub priority: u8,
    pub url: Option<Url>,
    pub color: Option<u32>,
    pub geo: Option<(f64, f64)>,
    pub server_url: Option<Url>,
    pub etag: Option<String>,
    pub sequence: i32,
    pub sync_status: SyncStatus,
    pub retry_count: u32,
    pub last_sync_error: Option<String>,
    pub local_modified_at: DateTime<Utc>,
    pub server_modified_at: Option<DateTime<Utc>>,
}

impl Event {
    pub fn is_master(&self) -> bool {
        self.original_event_id.is_none()
    }

    pub fn has_pending_changes(&self) -> bool {
        !matches!(self.sync_status, SyncStatus::Synced)
    }
}

/// A materialized single instance of a (possibly recurring) event, used for
/// O(1) range queries instead of expanding RRULE on every read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: Uuid,
    pub event_id: Uuid,
    pub calendar_id: Uuid,
    pub start_ts: i64,
    pub end_ts: i64,
    pub start_day: i32,
    pub end_day: i32,
    pub is_cancelled: bool,
    pub exception_event_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Move,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MovePhase {
    Delete = 0,
    Create = 1,
}

/// A queued remote mutation awaiting push. `event_id` is deliberately not a
/// foreign key -- the row must survive deletion of the event it targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: Uuid,
    pub event_id: Uuid,
    pub operation: OperationKind,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub target_url: Option<Url>,
    pub target_calendar_id: Option<Uuid>,
    pub source_calendar_id: Option<Uuid>,
    pub move_phase: Option<MovePhase>,
    pub lifetime_reset_at: DateTime<Utc>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl PendingOperation {
    pub fn is_move(&self) -> bool {
        matches!(self.operation, OperationKind::Move)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReminderStatus {
    Pending,
    Fired,
    Snoozed,
    Dismissed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledReminder {
    pub id: Uuid,
    pub event_id: Uuid,
    pub trigger_time: DateTime<Utc>,
    pub occurrence_time: i64,
    pub reminder_offset: String,
    pub status: ReminderStatus,
}
