//! The single mutation surface for events (C3). Every write here runs
//! inside one transaction that also regenerates occurrences and enqueues
//! the matching PendingOperation, so a caller never observes a half-applied
//! mutation. Grounded on `CalendarService`'s facade shape in the teacher's
//! `cove-calendar/service.rs`, generalized from a single upsert call into
//! the full SyncStatus state machine of the mutation surface this spec
//! describes.

use chrono::{DateTime, Utc};
use tidalcal_core::{
    Clock, Event, EventStatus, MovePhase, OperationKind, OperationStatus, PendingOperation, ReminderSink, SyncStatus,
};
use tidalcal_storage::Store;
use uuid::Uuid;

use crate::error::SyncError;
use crate::occurrence;

fn new_pending_operation(event_id: Uuid, kind: OperationKind, now: DateTime<Utc>) -> PendingOperation {
    PendingOperation {
        id: Uuid::new_v4(),
        event_id,
        operation: kind,
        status: OperationStatus::Pending,
        retry_count: 0,
        max_retries: 10,
        next_retry_at: now,
        last_error: None,
        created_at: now,
        updated_at: now,
        target_url: None,
        target_calendar_id: None,
        source_calendar_id: None,
        move_phase: None,
        lifetime_reset_at: now,
        failed_at: None,
    }
}

/// Creates a brand-new event. Local-only calendars (no server ever involved)
/// are written as already-SYNCED with no queue side effect.
pub async fn create_event(store: &Store, clock: &dyn Clock, mut event: Event, is_local: bool) -> Result<Event, SyncError> {
    if event.uid.is_empty() {
        event.uid = Uuid::new_v4().to_string();
    }

    let now = clock.now();
    let operation = if is_local {
        event.sync_status = SyncStatus::Synced;
        None
    } else {
        event.sync_status = SyncStatus::PendingCreate;
        Some(new_pending_operation(event.id, OperationKind::Create, now))
    };

    let occurrences = occurrence::expand_master(&event, event.start_ts, event.start_ts + occurrence::DEFAULT_WINDOW_DAYS * 86_400_000)?;
    let rows: Vec<_> = occurrences
        .into_iter()
        .map(|slot| tidalcal_core::Occurrence {
            id: Uuid::new_v4(),
            event_id: event.id,
            calendar_id: event.calendar_id,
            start_ts: slot.start_ts,
            end_ts: slot.end_ts,
            start_day: slot.start_day,
            end_day: slot.end_day,
            is_cancelled: false,
            exception_event_id: None,
        })
        .collect();

    store.write_event_with_occurrences(&event, &rows, operation.as_ref()).await?;
    Ok(event)
}

/// Applies the SyncStatus transition table of the state machine and
/// regenerates occurrences when timing/recurrence fields changed.
pub async fn update_event(
    store: &Store,
    clock: &dyn Clock,
    mut event: Event,
    is_local: bool,
    timing_changed: bool,
) -> Result<Event, SyncError> {
    let now = clock.now();

    let mut operation = None;
    if is_local {
        event.sync_status = SyncStatus::Synced;
    } else {
        match event.sync_status {
            SyncStatus::PendingCreate => {
                // stays PENDING_CREATE; no UPDATE queued
            }
            SyncStatus::PendingUpdate | SyncStatus::Synced => {
                event.sync_status = SyncStatus::PendingUpdate;
                if store.find_pending_operation(event.id, OperationKind::Update).await?.is_none() {
                    operation = Some(new_pending_operation(event.id, OperationKind::Update, now));
                }
            }
            SyncStatus::PendingDelete => {
                // a delete in flight is not reopened by an update
            }
        }
    }

    let rows = if timing_changed {
        let previous = store.list_occurrences_for_event(event.id).await?;
        let cancelled_starts = occurrence::snapshot_cancelled_starts(&previous);

        let range_end = occurrence::DEFAULT_WINDOW_DAYS * 86_400_000 + event.start_ts;
        let slots = occurrence::expand_master(&event, event.start_ts, range_end)?;
        let exceptions = store.list_exceptions_for_master(event.id).await?;
        let mut rows: Vec<_> = slots
            .into_iter()
            .map(|slot| tidalcal_core::Occurrence {
                id: Uuid::new_v4(),
                event_id: event.id,
                calendar_id: event.calendar_id,
                start_ts: slot.start_ts,
                end_ts: slot.end_ts,
                start_day: slot.start_day,
                end_day: slot.end_day,
                is_cancelled: false,
                exception_event_id: None,
            })
            .collect();
        apply_links_for_update(&mut rows, &exceptions);
        occurrence::apply_cancellations(&mut rows, &cancelled_starts);
        rows
    } else {
        store.list_occurrences_for_event(event.id).await?
    };

    store.write_event_with_occurrences(&event, &rows, operation.as_ref()).await?;
    Ok(event)
}

fn apply_links_for_update(rows: &mut [tidalcal_core::Occurrence], exceptions: &[Event]) {
    for exception in exceptions {
        let Some(occurrence_time) = exception.original_instance_time else { continue };
        if let Some(row) = rows.iter_mut().find(|row| (row.start_ts - occurrence_time).abs() < 60_000) {
            row.exception_event_id = Some(exception.id);
            row.start_ts = exception.start_ts;
            row.end_ts = exception.end_ts;
            row.start_day = occurrence::day_code(exception.start_ts, exception.all_day, exception.timezone.as_deref());
            row.end_day = occurrence::day_code(exception.end_ts, exception.all_day, exception.timezone.as_deref());
        }
    }
}

/// Deletes an event. Never-synced events are hard-deleted; otherwise the
/// row is marked PENDING_DELETE and a DELETE operation is queued with the
/// server URL captured at this instant.
pub async fn delete_event(store: &Store, clock: &dyn Clock, reminders: &dyn ReminderSink, mut event: Event) -> Result<(), SyncError> {
    reminders.cancel_for_event(event.id).await?;

    if event.server_url.is_none() {
        store.delete_event(event.id).await?;
        return Ok(());
    }

    let now = clock.now();
    event.sync_status = SyncStatus::PendingDelete;
    let mut op = new_pending_operation(event.id, OperationKind::Delete, now);
    op.target_url = event.server_url.clone();

    let rows = store.list_occurrences_for_event(event.id).await?;
    store.write_event_with_occurrences(&event, &rows, Some(&op)).await?;
    Ok(())
}

/// Creates or updates the exception event for a single occurrence edit,
/// links it, and enqueues an UPDATE on the master (exceptions are bundled
/// into the master's push, never pushed standalone). The exception upsert,
/// the occurrence link, and the master's UPDATE enqueue all land in one
/// transaction so a crash between them can never leave a linked occurrence
/// with no queued UPDATE.
pub async fn edit_single_occurrence(
    store: &Store,
    clock: &dyn Clock,
    master: &Event,
    occurrence_time: i64,
    modified: Event,
) -> Result<Event, SyncError> {
    let existing = store
        .list_exceptions_for_master(master.id)
        .await?
        .into_iter()
        .find(|e| e.original_instance_time == Some(occurrence_time));

    let mut exception = modified;
    exception.uid = master.uid.clone();
    exception.original_event_id = Some(master.id);
    exception.original_instance_time = Some(occurrence_time);
    exception.rrule = None;
    exception.calendar_id = master.calendar_id;
    if let Some(existing) = &existing {
        exception.id = existing.id;
    }

    let mut rows = store.list_occurrences_for_event(master.id).await?;
    occurrence::apply_exception_link(&mut rows, occurrence_time, &exception)?;

    let (master_update, operation) = prepare_master_update(store, clock, master.id).await?;

    store
        .write_exception_with_master_update(&exception, &master_update, &rows, operation.as_ref())
        .await?;

    Ok(exception)
}

/// Computes the master's next state for an UPDATE enqueue (PENDING_UPDATE,
/// reusing any already-queued UPDATE op) without writing anything, so the
/// caller can fold the write into one atomic transaction alongside other
/// rows. Returns `operation: None` when the master is mid PENDING_CREATE or
/// PENDING_DELETE, in which case its row is still returned unchanged.
async fn prepare_master_update(store: &Store, clock: &dyn Clock, master_id: Uuid) -> Result<(Event, Option<PendingOperation>), SyncError> {
    let Some(mut master) = store.get_event(master_id).await? else {
        return Err(SyncError::Validation(format!("master event {master_id} not found")));
    };
    if master.sync_status == SyncStatus::PendingCreate || master.sync_status == SyncStatus::PendingDelete {
        return Ok((master, None));
    }
    master.sync_status = SyncStatus::PendingUpdate;
    let now = clock.now();
    let op = match store.find_pending_operation(master_id, OperationKind::Update).await? {
        Some(existing) => existing,
        None => new_pending_operation(master_id, OperationKind::Update, now),
    };
    Ok((master, Some(op)))
}

/// Splits the series at `pivot`: the old master is truncated with
/// `UNTIL = pivot - 1s`, occurrences/exceptions at or after pivot are
/// removed, and a fresh-UID master carries the modified fields forward.
pub async fn edit_this_and_future(
    store: &Store,
    clock: &dyn Clock,
    mut old_master: Event,
    pivot: i64,
    mut new_master: Event,
) -> Result<(Event, Event), SyncError> {
    if let Some(rrule) = &old_master.rrule {
        let until = DateTime::<Utc>::from_timestamp_millis(pivot - 1_000)
            .unwrap_or_else(Utc::now)
            .format("%Y%m%dT%H%M%SZ");
        let truncated = strip_until(rrule);
        old_master.rrule = Some(format!("{truncated};UNTIL={until}"));
    }

    let occurrences: Vec<_> = store
        .list_occurrences_for_event(old_master.id)
        .await?
        .into_iter()
        .filter(|o| o.start_ts < pivot)
        .collect();

    let now = clock.now();
    let old_update = if old_master.sync_status != SyncStatus::PendingCreate {
        old_master.sync_status = SyncStatus::PendingUpdate;
        Some(new_pending_operation(old_master.id, OperationKind::Update, now))
    } else {
        None
    };
    store.write_event_with_occurrences(&old_master, &occurrences, old_update.as_ref()).await?;

    for exception in store.list_exceptions_for_master(old_master.id).await? {
        if exception.original_instance_time.map(|t| t >= pivot).unwrap_or(false) {
            store.delete_event(exception.id).await?;
        }
    }

    new_master.id = Uuid::new_v4();
    new_master.uid = Uuid::new_v4().to_string();
    new_master.original_event_id = None;
    new_master.original_instance_time = None;
    new_master.start_ts = pivot;
    let created = create_event(store, clock, new_master, false).await?;

    Ok((old_master, created))
}

fn strip_until(rrule: &str) -> String {
    rrule
        .split(';')
        .filter(|part| !part.to_ascii_uppercase().starts_with("UNTIL="))
        .collect::<Vec<_>>()
        .join(";")
}

/// Cancels one occurrence by adding it to the master's EXDATE; this is
/// never a separate DELETE operation, only an UPDATE on the master. The
/// EXDATE write and the occurrence cancellation are applied to the same row
/// set passed into `write_event_with_occurrences`, so both land in the one
/// transaction that call already runs -- no separate cancel-then-enqueue
/// step that a crash could split.
pub async fn delete_single_occurrence(store: &Store, clock: &dyn Clock, mut master: Event, occurrence_time: i64) -> Result<(), SyncError> {
    if !master.exdate.iter().any(|&t| (t - occurrence_time).abs() < 60_000) {
        master.exdate.push(occurrence_time);
    }

    let mut rows = store.list_occurrences_for_event(master.id).await?;
    occurrence::set_cancelled_in_place(&mut rows, occurrence_time, true)?;

    let now = clock.now();
    let op = if master.sync_status != SyncStatus::PendingCreate && master.sync_status != SyncStatus::PendingDelete {
        master.sync_status = SyncStatus::PendingUpdate;
        match store.find_pending_operation(master.id, OperationKind::Update).await? {
            Some(existing) => Some(existing),
            None => Some(new_pending_operation(master.id, OperationKind::Update, now)),
        }
    } else {
        None
    };

    store.write_event_with_occurrences(&master, &rows, op.as_ref()).await?;
    Ok(())
}

pub async fn delete_series(store: &Store, clock: &dyn Clock, reminders: &dyn ReminderSink, master: Event) -> Result<(), SyncError> {
    delete_event(store, clock, reminders, master).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOutcome {
    MovedRemote,
    MovedToLocal,
    MovedFromLocal,
    MovedCrossAccount,
}

/// Handles all four cross-calendar move cases named by the spec.
pub async fn move_event_to_calendar(
    store: &Store,
    clock: &dyn Clock,
    mut event: Event,
    target_calendar_id: Uuid,
    target_is_local: bool,
    cross_account: bool,
) -> Result<(Event, MoveOutcome), SyncError> {
    let now = clock.now();
    let source_calendar_id = event.calendar_id;
    let was_synced = event.server_url.is_some();

    if was_synced && !target_is_local {
        let old_url = event.server_url.clone();
        event.calendar_id = target_calendar_id;
        event.server_url = None;
        event.etag = None;
        event.sync_status = SyncStatus::PendingUpdate;

        let mut op = new_pending_operation(event.id, OperationKind::Move, now);
        op.source_calendar_id = Some(source_calendar_id);
        op.target_calendar_id = Some(target_calendar_id);
        op.target_url = old_url;
        op.move_phase = Some(MovePhase::Delete);

        let rows = store.list_occurrences_for_event(event.id).await?;
        store.write_event_with_occurrences(&event, &rows, Some(&op)).await?;
        let outcome = if cross_account { MoveOutcome::MovedCrossAccount } else { MoveOutcome::MovedRemote };
        return Ok((event, outcome));
    }

    if was_synced && target_is_local {
        let mut op = new_pending_operation(event.id, OperationKind::Delete, now);
        op.target_url = event.server_url.clone();
        op.source_calendar_id = Some(source_calendar_id);

        event.calendar_id = target_calendar_id;
        event.server_url = None;
        event.etag = None;
        event.sync_status = SyncStatus::Synced;

        let rows = store.list_occurrences_for_event(event.id).await?;
        store.write_event_with_occurrences(&event, &rows, Some(&op)).await?;
        return Ok((event, MoveOutcome::MovedToLocal));
    }

    // Local -> Synced: enqueue CREATE on the new calendar.
    event.calendar_id = target_calendar_id;
    let moved = create_event(store, clock, event, false).await?;
    Ok((moved, MoveOutcome::MovedFromLocal))
}

/// Invoked when STATUS:CANCELLED + RECURRENCE-ID arrives from a pull for an
/// occurrence that has no local exception: represented as a cancelled
/// occurrence row rather than folded into the master's EXDATE, so local-first
/// wins is preserved on the master itself.
pub async fn cancel_pulled_occurrence(store: &Store, master_id: Uuid, occurrence_time: i64) -> Result<(), SyncError> {
    occurrence::cancel_occurrence(store, master_id, occurrence_time).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidalcal_core::{Classification, SystemClock, Transparency};

    struct NoopReminders;

    #[async_trait::async_trait]
    impl ReminderSink for NoopReminders {
        async fn schedule(&self, _reminder: &tidalcal_core::ScheduledReminder) -> Result<(), tidalcal_core::CoreError> {
            Ok(())
        }
        async fn cancel(&self, _reminder_id: Uuid) -> Result<(), tidalcal_core::CoreError> {
            Ok(())
        }
        async fn cancel_for_event(&self, _event_id: Uuid) -> Result<(), tidalcal_core::CoreError> {
            Ok(())
        }
    }

    fn sample_event(calendar_id: Uuid, start_ts: i64) -> Event {
        Event {
            id: Uuid::new_v4(),
            uid: String::new(),
            calendar_id,
            original_event_id: None,
            original_instance_time: None,
            title: "Lunch".into(),
            location: None,
            description: None,
            start_ts,
            end_ts: start_ts + 3_600_000,
            timezone: None,
            all_day: false,
            status: EventStatus::Confirmed,
            transparency: Transparency::Opaque,
            classification: Classification::Public,
            organizer: None,
            rrule: None,
            rdate: Vec::new(),
            exdate: Vec::new(),
            duration: None,
            dtstamp: Utc::now(),
            reminders: Vec::new(),
            extra_properties: Default::default(),
            categories: Vec::new(),
            priority: 0,
            url: None,
            color: None,
            geo: None,
            server_url: None,
            etag: None,
            sequence: 0,
            sync_status: SyncStatus::Synced,
            retry_count: 0,
            last_sync_error: None,
            local_modified_at: Utc::now(),
            server_modified_at: None,
        }
    }

    #[tokio::test]
    async fn create_event_on_synced_calendar_queues_create() {
        let store = Store::connect_in_memory().await.unwrap();
        let account = tidalcal_core::Account {
            id: Uuid::new_v4(),
            provider: tidalcal_core::Provider::CalDav,
            email: "a@example.com".into(),
            display_name: "A".into(),
            principal_url: None,
            calendar_home_url: None,
            credential_ref: None,
            enabled: true,
            last_sync_attempt: None,
            last_sync_success: None,
            consecutive_sync_failures: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_account(&account).await.unwrap();
        let calendar = tidalcal_core::Calendar {
            id: Uuid::new_v4(),
            account_id: account.id,
            server_url: None,
            display_name: "Work".into(),
            color_argb: 0xff0000ff,
            read_only: false,
            visible: true,
            is_default: true,
            sort_order: 0,
            sync_token: None,
            ctag: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.upsert_calendar(&calendar).await.unwrap();

        let clock = SystemClock;
        let event = sample_event(calendar.id, Utc::now().timestamp_millis());
        let created = create_event(&store, &clock, event, false).await.unwrap();

        assert_eq!(created.sync_status, SyncStatus::PendingCreate);
        let op = store.find_pending_operation(created.id, OperationKind::Create).await.unwrap();
        assert!(op.is_some());
    }
}
