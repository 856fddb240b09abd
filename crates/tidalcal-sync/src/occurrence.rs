//! RRULE/RDATE/EXDATE expansion and exception linkage (materializes Occurrence rows).

use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use rrule::{RRuleError, RRuleSet};
use std::str::FromStr;
use tidalcal_core::{Event, Occurrence};
use tidalcal_storage::Store;
use uuid::Uuid;

use crate::error::SyncError;

pub const DEFAULT_WINDOW_DAYS: i64 = 730;
const EXDATE_TOLERANCE_MS: i64 = 60_000;
const EXPANSION_CAP: u16 = 5_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OccurrenceSlot {
    pub start_ts: i64,
    pub end_ts: i64,
    pub start_day: i32,
    pub end_day: i32,
}

fn default_window_end(start_ts: i64) -> i64 {
    start_ts + DEFAULT_WINDOW_DAYS * 24 * 3_600_000
}

fn ms_to_utc(ts_ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap())
}

/// UTC day-code for all-day events, local-timezone day-code for timed events.
pub fn day_code(ts_ms: i64, all_day: bool, timezone: Option<&str>) -> i32 {
    let utc = ms_to_utc(ts_ms);
    let (year, month, day) = if all_day {
        (utc.year(), utc.month(), utc.day())
    } else {
        match timezone.and_then(|name| Tz::from_str(name).ok()) {
            Some(tz) => {
                let local = utc.with_timezone(&tz);
                (local.year(), local.month(), local.day())
            }
            None => (utc.year(), utc.month(), utc.day()),
        }
    };
    year * 10_000 + (month as i32) * 100 + day as i32
}

fn expand_rrule(rrule_str: &str, start_ts: i64, range_start: i64, effective_end: i64) -> Result<Vec<i64>, SyncError> {
    let dtstart = ms_to_utc(start_ts);
    let dtstart_str = dtstart.format("%Y%m%dT%H%M%SZ").to_string();
    let full_str = format!("DTSTART:{dtstart_str}\nRRULE:{rrule_str}");

    let rrule_set: RRuleSet = full_str
        .parse()
        .map_err(|err: RRuleError| SyncError::Validation(format!("invalid rrule: {err}")))?;

    let rrule_tz = rrule_set.get_dt_start().timezone();
    let search_start = ms_to_utc(range_start)
        .with_timezone(&rrule_tz)
        .checked_sub_signed(chrono::Duration::seconds(1))
        .unwrap_or_else(|| ms_to_utc(range_start).with_timezone(&rrule_tz));
    let range_end_in_tz = ms_to_utc(effective_end).with_timezone(&rrule_tz);

    let dates = rrule_set
        .after(search_start)
        .all(EXPANSION_CAP)
        .dates
        .into_iter()
        .take_while(|d| *d <= range_end_in_tz)
        .map(|d| d.with_timezone(&Utc).timestamp_millis())
        .collect();

    Ok(dates)
}

/// Computes the occurrence seed timestamps for a master event over
/// `[range_start, range_end)`, applying RDATE union, EXDATE subtraction
/// (60-second DST tolerance) and de-duplication, per the occurrence engine
/// algorithm.
pub fn expand_master(event: &Event, range_start: i64, range_end: i64) -> Result<Vec<OccurrenceSlot>, SyncError> {
    let duration_ms = event.end_ts - event.start_ts;
    let effective_end = range_end.min(default_window_end(event.start_ts));

    let mut starts = match &event.rrule {
        Some(rule) => expand_rrule(rule, event.start_ts, range_start, effective_end)?,
        None => vec![event.start_ts],
    };

    for &rdate in &event.rdate {
        if !starts.contains(&rdate) {
            starts.push(rdate);
        }
    }

    starts.retain(|&start| !event.exdate.iter().any(|&ex| (start - ex).abs() < EXDATE_TOLERANCE_MS));

    starts.sort_unstable();
    starts.dedup();

    let slots = starts
        .into_iter()
        .filter(|&start| start >= range_start && start < range_end)
        .map(|start| {
            let end = start + duration_ms;
            OccurrenceSlot {
                start_ts: start,
                end_ts: end,
                start_day: day_code(start, event.all_day, event.timezone.as_deref()),
                end_day: day_code(end, event.all_day, event.timezone.as_deref()),
            }
        })
        .collect();

    Ok(slots)
}

fn slot_to_row(event: &Event, slot: OccurrenceSlot) -> Occurrence {
    Occurrence {
        id: Uuid::new_v4(),
        event_id: event.id,
        calendar_id: event.calendar_id,
        start_ts: slot.start_ts,
        end_ts: slot.end_ts,
        start_day: slot.start_day,
        end_day: slot.end_day,
        is_cancelled: false,
        exception_event_id: None,
    }
}

/// Applies every exception's link onto the freshly-expanded occurrence rows,
/// matching by `|start_ts - original_instance_time| < 60s`. The source of
/// truth for a link is the exception's own `original_instance_time`, not a
/// snapshot of the previous occurrence table, so this is safe to call
/// against a brand-new set of rows after any RRULE change.
fn apply_exception_links(rows: &mut [Occurrence], exceptions: &[Event]) {
    for exception in exceptions {
        let Some(occurrence_time) = exception.original_instance_time else {
            continue;
        };
        if let Some(row) = rows
            .iter_mut()
            .find(|row| (row.start_ts - occurrence_time).abs() < EXDATE_TOLERANCE_MS)
        {
            row.exception_event_id = Some(exception.id);
            row.start_ts = exception.start_ts;
            row.end_ts = exception.end_ts;
            row.start_day = day_code(exception.start_ts, exception.all_day, exception.timezone.as_deref());
            row.end_day = day_code(exception.end_ts, exception.all_day, exception.timezone.as_deref());
            row.is_cancelled = false;
        }
    }
}

/// Snapshots which occurrence starts were cancelled in the row set about to
/// be replaced, so rebuilding (a new RRULE expansion, a timing change) can
/// carry that cancellation forward. A row already claimed by an exception
/// link is left alone -- the exception is the active occurrence there.
pub(crate) fn snapshot_cancelled_starts(rows: &[Occurrence]) -> Vec<i64> {
    rows.iter().filter(|row| row.is_cancelled).map(|row| row.start_ts).collect()
}

pub(crate) fn apply_cancellations(rows: &mut [Occurrence], cancelled_starts: &[i64]) {
    for &start in cancelled_starts {
        if let Some(row) = rows
            .iter_mut()
            .find(|row| row.exception_event_id.is_none() && (row.start_ts - start).abs() < EXDATE_TOLERANCE_MS)
        {
            row.is_cancelled = true;
        }
    }
}

/// Clears and recomputes occurrences for `event` within the default window,
/// preserving exception links and EXDATE-independent cancellations (e.g. a
/// pulled STATUS:CANCELLED occurrence). Must be called inside the same
/// transaction as the event write it follows; callers needing that
/// atomicity should use `Store::write_event_with_occurrences` directly with
/// the rows this function's sibling `expand_master` produces instead.
pub async fn regenerate_occurrences(store: &Store, event: &Event) -> Result<Vec<Occurrence>, SyncError> {
    let range_start = event.start_ts.min(Utc::now().timestamp_millis());
    let range_end = default_window_end(event.start_ts);

    let previous = store.list_occurrences_for_event(event.id).await?;
    let cancelled_starts = snapshot_cancelled_starts(&previous);

    let slots = expand_master(event, range_start, range_end)?;
    let mut rows: Vec<Occurrence> = slots.into_iter().map(|slot| slot_to_row(event, slot)).collect();

    let exceptions = store.list_exceptions_for_master(event.id).await?;
    apply_exception_links(&mut rows, &exceptions);
    apply_cancellations(&mut rows, &cancelled_starts);

    store.replace_occurrences(event.id, &rows).await?;
    Ok(rows)
}

/// Materializes occurrences over an arbitrary range without clearing
/// existing rows outside it; returns the count of newly inserted rows.
pub async fn generate_occurrences(
    store: &Store,
    event: &Event,
    range_start: i64,
    range_end: i64,
) -> Result<usize, SyncError> {
    let existing = store.list_occurrences_for_event(event.id).await?;
    let existing_starts: std::collections::HashSet<i64> = existing.iter().map(|o| o.start_ts).collect();

    let slots = expand_master(event, range_start, range_end)?;
    let new_rows: Vec<Occurrence> = slots
        .into_iter()
        .filter(|slot| !existing_starts.contains(&slot.start_ts))
        .map(|slot| slot_to_row(event, slot))
        .collect();

    let count = new_rows.len();
    if count > 0 {
        let mut all_rows = existing;
        let exceptions = store.list_exceptions_for_master(event.id).await?;
        all_rows.extend(new_rows);
        apply_exception_links(&mut all_rows, &exceptions);
        store.replace_occurrences(event.id, &all_rows).await?;
    }
    Ok(count)
}

/// No-op for non-recurring events; otherwise extends the materialized
/// window from the current max occurrence start up to `target_ts`.
pub async fn extend_occurrences(store: &Store, event: &Event, target_ts: i64) -> Result<usize, SyncError> {
    if event.rrule.is_none() {
        return Ok(0);
    }
    let existing = store.list_occurrences_for_event(event.id).await?;
    let max_start = existing.iter().map(|o| o.start_ts).max().unwrap_or(event.start_ts);
    if target_ts <= max_start {
        return Ok(0);
    }
    generate_occurrences(store, event, max_start + 1, target_ts).await
}

/// Finds the occurrence row matching `occurrence_time` (or already linked to
/// `exception`) in an already-fetched row set and links it in place.
/// Idempotent: matches either by original timing or by an already-applied
/// link to this exception, so re-edits of the same exception don't create
/// duplicates. Pulled out of `link_exception` so a caller that needs the
/// link applied as part of a larger atomic write (event_writer's single-
/// occurrence edit) can do the matching without a standalone DB round trip.
pub(crate) fn apply_exception_link(rows: &mut [Occurrence], occurrence_time: i64, exception: &Event) -> Result<(), SyncError> {
    let Some(row) = rows.iter_mut().find(|row| {
        (row.start_ts - occurrence_time).abs() < EXDATE_TOLERANCE_MS || row.exception_event_id == Some(exception.id)
    }) else {
        return Err(SyncError::Validation(format!("no occurrence slot near {occurrence_time} for exception {}", exception.id)));
    };

    row.exception_event_id = Some(exception.id);
    row.start_ts = exception.start_ts;
    row.end_ts = exception.end_ts;
    row.start_day = day_code(exception.start_ts, exception.all_day, exception.timezone.as_deref());
    row.end_day = day_code(exception.end_ts, exception.all_day, exception.timezone.as_deref());
    row.is_cancelled = false;
    Ok(())
}

/// Atomically links an exception event to its occurrence slot.
pub async fn link_exception(
    store: &Store,
    master_id: Uuid,
    occurrence_time: i64,
    exception: &Event,
) -> Result<(), SyncError> {
    let mut occurrences = store.list_occurrences_for_event(master_id).await?;
    apply_exception_link(&mut occurrences, occurrence_time, exception)?;
    let row = occurrences
        .into_iter()
        .find(|row| row.exception_event_id == Some(exception.id))
        .expect("apply_exception_link just set this");
    store.update_occurrence(&row).await?;
    Ok(())
}

/// Sets `isCancelled` on the occurrence row matching `occurrence_time` in an
/// already-fetched row set. See `apply_exception_link` for why this is split
/// out of the DB-backed version.
pub(crate) fn set_cancelled_in_place(rows: &mut [Occurrence], occurrence_time: i64, cancelled: bool) -> Result<(), SyncError> {
    let Some(row) = rows.iter_mut().find(|row| (row.start_ts - occurrence_time).abs() < EXDATE_TOLERANCE_MS) else {
        return Err(SyncError::Validation(format!("no occurrence slot near {occurrence_time}")));
    };
    row.is_cancelled = cancelled;
    Ok(())
}

async fn set_cancelled(store: &Store, master_id: Uuid, occurrence_time: i64, cancelled: bool) -> Result<(), SyncError> {
    let mut occurrences = store.list_occurrences_for_event(master_id).await?;
    set_cancelled_in_place(&mut occurrences, occurrence_time, cancelled)?;
    let row = occurrences
        .into_iter()
        .find(|row| (row.start_ts - occurrence_time).abs() < EXDATE_TOLERANCE_MS)
        .expect("set_cancelled_in_place just matched this");
    store.update_occurrence(&row).await?;
    Ok(())
}

pub async fn cancel_occurrence(store: &Store, master_id: Uuid, occurrence_time: i64) -> Result<(), SyncError> {
    set_cancelled(store, master_id, occurrence_time, true).await
}

pub async fn uncancel_occurrence(store: &Store, master_id: Uuid, occurrence_time: i64) -> Result<(), SyncError> {
    set_cancelled(store, master_id, occurrence_time, false).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tidalcal_core::{Classification, EventStatus, SyncStatus, Transparency};

    fn base_event(rrule: Option<&str>, start: DateTime<Utc>, end: DateTime<Utc>) -> Event {
        Event {
            id: Uuid::new_v4(),
            uid: "U1".into(),
            calendar_id: Uuid::new_v4(),
            original_event_id: None,
            original_instance_time: None,
            title: "Weekly".into(),
            location: None,
            description: None,
            start_ts: start.timestamp_millis(),
            end_ts: end.timestamp_millis(),
            timezone: None,
            all_day: false,
            status: EventStatus::Confirmed,
            transparency: Transparency::Opaque,
            classification: Classification::Public,
            organizer: None,
            rrule: rrule.map(str::to_owned),
            rdate: Vec::new(),
            exdate: Vec::new(),
            duration: None,
            dtstamp: start,
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
            local_modified_at: start,
            server_modified_at: None,
        }
    }

    #[test]
    fn expand_weekly_rrule() {
        let start = Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 6, 11, 0, 0).unwrap();
        let event = base_event(Some("FREQ=WEEKLY;BYDAY=MO;COUNT=4"), start, end);

        let range_start = start.timestamp_millis();
        let range_end = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap().timestamp_millis();

        let slots = expand_master(&event, range_start, range_end).unwrap();
        assert_eq!(slots.len(), 4);
        assert_eq!(slots[1].start_ts, (start + chrono::Duration::weeks(1)).timestamp_millis());
    }

    #[test]
    fn regeneration_is_idempotent() {
        let start = Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 6, 11, 0, 0).unwrap();
        let event = base_event(Some("FREQ=DAILY;COUNT=5"), start, end);
        let range_end = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap().timestamp_millis();

        let first = expand_master(&event, start.timestamp_millis(), range_end).unwrap();
        let second = expand_master(&event, start.timestamp_millis(), range_end).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn exdate_is_subtractive_with_tolerance() {
        let start = Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        let mut event = base_event(Some("FREQ=DAILY;COUNT=5"), start, end);
        let excluded = Utc.with_ymd_and_hms(2024, 6, 17, 9, 0, 0).unwrap();
        event.exdate.push(excluded.timestamp_millis() + 30_000);

        let range_end = Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap().timestamp_millis();
        let slots = expand_master(&event, start.timestamp_millis(), range_end).unwrap();

        assert_eq!(slots.len(), 4);
        assert!(slots
            .iter()
            .all(|slot| (slot.start_ts - excluded.timestamp_millis()).abs() >= 60_000));
    }

    #[test]
    fn day_code_uses_utc_for_all_day_and_local_for_timed() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 1, 23, 30, 0).unwrap().timestamp_millis();
        assert_eq!(day_code(ts, true, None), 20250101);
        assert_eq!(day_code(ts, false, Some("Pacific/Auckland")), 20250102);
    }
}
