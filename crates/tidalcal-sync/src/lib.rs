mod engine;
mod error;
mod event_writer;
mod ics_codec;
mod ics_subscription;
mod occurrence;
mod pull;
mod push;
mod queue;

pub use engine::{SyncEngine, SyncEngineConfig};
pub use error::SyncError;
pub use event_writer::{
    cancel_pulled_occurrence, create_event, delete_event, delete_series, delete_single_occurrence,
    edit_single_occurrence, edit_this_and_future, move_event_to_calendar, update_event, MoveOutcome,
};
pub use ics_codec::{parse_resource, render_resource, render_single, ParsedVevent};
pub use ics_subscription::{sync_subscription, FeedResponse, IcsFeedClient, SubscriptionSyncSummary};
pub use occurrence::{
    cancel_occurrence, day_code, expand_master, extend_occurrences, generate_occurrences,
    link_exception, regenerate_occurrences, uncancel_occurrence, OccurrenceSlot,
};
pub use pull::{pull_calendar, PullSummary};
pub use push::{drain, PushSummary};
pub use queue::{
    advance_to_create_phase, auto_reset_old_failed, calculate_retry_delay, enqueue,
    get_expired_operations, get_ready_operations, mark_failed, mark_in_progress,
    refresh_operation_lifetime, reset_stale_in_progress, schedule_retry,
};
