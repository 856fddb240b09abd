use async_trait::async_trait;
use uuid::Uuid;

use crate::error::CoreError;
use crate::model::ScheduledReminder;

/// External collaborator that owns actually scheduling/cancelling OS-level
/// notifications. The sync core only tells it what to do.
#[async_trait]
pub trait ReminderSink: Send + Sync {
    async fn schedule(&self, reminder: &ScheduledReminder) -> Result<(), CoreError>;
    async fn cancel(&self, reminder_id: Uuid) -> Result<(), CoreError>;
    async fn cancel_for_event(&self, event_id: Uuid) -> Result<(), CoreError>;
}
