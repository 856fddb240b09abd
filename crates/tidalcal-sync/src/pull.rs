//! Pull Strategy (C4): server -> local reconciliation, local-first-wins on
//! conflict. Grounded on `mxschll-kitchen-fridge`'s `Provider::sync_calendar_pair`
//! diff-then-commit shape (`calculate_item_changes` classifying each URL as an
//! addition/change/deletion before any write happens), adapted here for the
//! inverted conflict rule this spec requires: a pending local change always
//! wins over whatever just arrived from the server.
use std::collections::HashMap;

use tidalcal_core::{CalDavClient, Calendar, Event};
use tidalcal_storage::Store;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::{event_writer, ics_codec, occurrence};

#[derive(Debug, Default)]
pub struct PullSummary {
    pub added: usize,
    pub changed: usize,
    pub removed: usize,
    pub skipped_pending: usize,
}

/// Pulls one calendar. A ctag match short-circuits the whole thing.
/// `calendar_home_url` is the account's discovered home set, which is where
/// `listCalendars` reports ctag for every calendar under it.
#[instrument(skip(store, client), fields(calendar_id = %calendar.id))]
pub async fn pull_calendar(
    store: &Store,
    client: &dyn CalDavClient,
    mut calendar: Calendar,
    calendar_home_url: &url::Url,
) -> Result<PullSummary, SyncError> {
    let Some(server_url) = calendar.server_url.clone() else {
        return Ok(PullSummary::default());
    };

    let remote_calendars = client.list_calendars(calendar_home_url).await?;
    let Some(remote) = remote_calendars.into_iter().find(|c| c.href == server_url) else {
        return Ok(PullSummary::default());
    };

    if remote.ctag.is_some() && remote.ctag == calendar.ctag {
        debug!("ctag unchanged, skipping pull");
        return Ok(PullSummary::default());
    }

    let resources = client.list_resources(&server_url).await?;
    let local_events = store.list_events_for_calendar(calendar.id).await?;
    let mut local_by_url: HashMap<String, Event> = local_events
        .into_iter()
        .filter(|event| event.original_event_id.is_none())
        .filter_map(|event| event.server_url.clone().map(|url| (url.to_string(), event)))
        .collect();

    let mut summary = PullSummary::default();

    for resource in &resources {
        let key = resource.url.to_string();
        match local_by_url.remove(&key) {
            None => {
                if let Err(err) = apply_addition(store, client, &calendar, resource).await {
                    warn!(error = %err, url = %key, "failed to apply remote addition");
                    continue;
                }
                summary.added += 1;
            }
            Some(local) => {
                if local.etag.as_deref() == Some(resource.etag.as_str()) {
                    continue;
                }
                if local.has_pending_changes() {
                    summary.skipped_pending += 1;
                    continue;
                }
                if let Err(err) = apply_change(store, client, &calendar, resource, local).await {
                    warn!(error = %err, url = %key, "failed to apply remote change");
                    continue;
                }
                summary.changed += 1;
            }
        }
    }

    // Anything left in local_by_url is missing from the server.
    for (_, local) in local_by_url {
        if local.has_pending_changes() {
            summary.skipped_pending += 1;
            continue;
        }
        store.delete_event(local.id).await?;
        summary.removed += 1;
    }

    calendar.ctag = remote.ctag;
    store.upsert_calendar(&calendar).await?;

    Ok(summary)
}

async fn apply_addition(
    store: &Store,
    client: &dyn CalDavClient,
    calendar: &Calendar,
    resource: &tidalcal_core::RemoteResource,
) -> Result<(), SyncError> {
    let body = client.get_resource(&resource.url).await?;
    let parsed = ics_codec::parse_resource(&body.body)?;
    let Some(master_raw) = parsed.iter().find(|v| v.recurrence_id.is_none()) else {
        return Err(SyncError::Parse("resource has no master VEVENT".to_string()));
    };

    let master = build_event(calendar.id, master_raw, Some(resource.url.clone()), Some(body.etag.clone()), None);
    let occurrences = occurrence::expand_master(&master, master.start_ts, master.start_ts + occurrence::DEFAULT_WINDOW_DAYS * 86_400_000)?;
    let rows: Vec<_> = occurrences
        .into_iter()
        .map(|slot| tidalcal_core::Occurrence {
            id: Uuid::new_v4(),
            event_id: master.id,
            calendar_id: calendar.id,
            start_ts: slot.start_ts,
            end_ts: slot.end_ts,
            start_day: slot.start_day,
            end_day: slot.end_day,
            is_cancelled: false,
            exception_event_id: None,
        })
        .collect();
    store.write_event_with_occurrences(&master, &rows, None).await?;

    for exception_raw in parsed.iter().filter(|v| v.recurrence_id.is_some()) {
        let exception = build_event(
            calendar.id,
            exception_raw,
            None,
            Some(body.etag.clone()),
            Some((master.id, master.uid.clone(), exception_raw.recurrence_id.unwrap())),
        );
        apply_exception(store, &master, exception, exception_raw).await?;
    }

    Ok(())
}

async fn apply_change(
    store: &Store,
    client: &dyn CalDavClient,
    calendar: &Calendar,
    resource: &tidalcal_core::RemoteResource,
    mut existing: Event,
) -> Result<(), SyncError> {
    let body = client.get_resource(&resource.url).await?;
    let parsed = ics_codec::parse_resource(&body.body)?;
    let Some(master_raw) = parsed.iter().find(|v| v.recurrence_id.is_none()) else {
        return Err(SyncError::Parse("resource has no master VEVENT".to_string()));
    };

    apply_parsed_onto(&mut existing, master_raw);
    existing.server_url = Some(resource.url.clone());
    existing.etag = Some(body.etag.clone());
    existing.sync_status = tidalcal_core::SyncStatus::Synced;

    let slots = occurrence::expand_master(&existing, existing.start_ts, existing.start_ts + occurrence::DEFAULT_WINDOW_DAYS * 86_400_000)?;
    let mut rows: Vec<_> = slots
        .into_iter()
        .map(|slot| tidalcal_core::Occurrence {
            id: Uuid::new_v4(),
            event_id: existing.id,
            calendar_id: existing.calendar_id,
            start_ts: slot.start_ts,
            end_ts: slot.end_ts,
            start_day: slot.start_day,
            end_day: slot.end_day,
            is_cancelled: false,
            exception_event_id: None,
        })
        .collect();
    let exceptions = store.list_exceptions_for_master(existing.id).await?;
    for exception in &exceptions {
        let Some(occurrence_time) = exception.original_instance_time else { continue };
        if let Some(row) = rows.iter_mut().find(|row| (row.start_ts - occurrence_time).abs() < 60_000) {
            row.exception_event_id = Some(exception.id);
            row.start_ts = exception.start_ts;
            row.end_ts = exception.end_ts;
            row.start_day = occurrence::day_code(exception.start_ts, exception.all_day, exception.timezone.as_deref());
            row.end_day = occurrence::day_code(exception.end_ts, exception.all_day, exception.timezone.as_deref());
        }
    }
    store.write_event_with_occurrences(&existing, &rows, None).await?;

    for exception_raw in parsed.iter().filter(|v| v.recurrence_id.is_some()) {
        let exception = build_event(
            calendar.id,
            exception_raw,
            None,
            Some(body.etag.clone()),
            Some((existing.id, existing.uid.clone(), exception_raw.recurrence_id.unwrap())),
        );
        apply_exception(store, &existing, exception, exception_raw).await?;
    }

    Ok(())
}

async fn apply_exception(store: &Store, master: &Event, mut exception: Event, raw: &ics_codec::ParsedVevent) -> Result<(), SyncError> {
    let occurrence_time = raw.recurrence_id.expect("caller filters by recurrence_id.is_some()");

    if let Some(existing) = store
        .list_exceptions_for_master(master.id)
        .await?
        .into_iter()
        .find(|e| e.original_instance_time == Some(occurrence_time))
    {
        if existing.has_pending_changes() {
            return Ok(()); // local-first wins
        }
        exception.id = existing.id;
    }

    if raw.status == tidalcal_core::EventStatus::Cancelled {
        event_writer::cancel_pulled_occurrence(store, master.id, occurrence_time).await?;
        return Ok(());
    }

    store.upsert_event(&exception).await?;
    occurrence::link_exception(store, master.id, occurrence_time, &exception).await?;
    Ok(())
}

fn apply_parsed_onto(event: &mut Event, raw: &ics_codec::ParsedVevent) {
    event.title = raw.title.clone();
    event.description = raw.description.clone();
    event.location = raw.location.clone();
    event.start_ts = raw.start_ts;
    event.end_ts = raw.end_ts;
    event.all_day = raw.all_day;
    event.timezone = raw.timezone.clone();
    event.status = raw.status;
    event.rrule = raw.rrule.clone();
    event.rdate = raw.rdate.clone();
    event.exdate = raw.exdate.clone();
    event.organizer = raw.organizer.clone();
    event.sequence = raw.sequence;
    event.dtstamp = raw.dtstamp;
}

fn build_event(
    calendar_id: Uuid,
    raw: &ics_codec::ParsedVevent,
    server_url: Option<url::Url>,
    etag: Option<String>,
    exception_of: Option<(Uuid, String, i64)>,
) -> Event {
    let (uid, original_event_id, original_instance_time) = match exception_of {
        Some((master_id, uid, occurrence_time)) => (uid, Some(master_id), Some(occurrence_time)),
        None => (raw.uid.clone(), None, None),
    };

    Event {
        id: Uuid::new_v4(),
        uid,
        calendar_id,
        original_event_id,
        original_instance_time,
        title: raw.title.clone(),
        location: raw.location.clone(),
        description: raw.description.clone(),
        start_ts: raw.start_ts,
        end_ts: raw.end_ts,
        timezone: raw.timezone.clone(),
        all_day: raw.all_day,
        status: raw.status,
        transparency: tidalcal_core::Transparency::Opaque,
        classification: tidalcal_core::Classification::Public,
        organizer: raw.organizer.clone(),
        rrule: if original_event_id.is_some() { None } else { raw.rrule.clone() },
        rdate: raw.rdate.clone(),
        exdate: raw.exdate.clone(),
        duration: None,
        dtstamp: raw.dtstamp,
        reminders: Vec::new(),
        extra_properties: Default::default(),
        categories: Vec::new(),
        priority: 0,
        url: None,
        color: None,
        geo: None,
        server_url,
        etag,
        sequence: raw.sequence,
        sync_status: tidalcal_core::SyncStatus::Synced,
        retry_count: 0,
        last_sync_error: None,
        local_modified_at: raw.dtstamp,
        server_modified_at: Some(raw.dtstamp),
    }
}
