//! iCalendar (RFC 5545) parsing and rendering for CalDAV resource bodies and
//! webcal subscriptions. Parsing goes through the `ical` crate the way
//! `CalendarService::import_ics` does; rendering is hand-rolled the way
//! `CalendarService::export_ics` / `render_single_event_ics` build bodies,
//! generalized to carry RRULE/RDATE/EXDATE/RECURRENCE-ID/STATUS and to bundle
//! a master event with its exceptions into one VCALENDAR resource.

use std::io::Cursor;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use tidalcal_core::{Event, EventStatus};

use crate::error::SyncError;

/// One VEVENT block as parsed off the wire, before it's matched against a
/// master event (by UID) or linked as an exception (by RECURRENCE-ID).
#[derive(Debug, Clone)]
pub struct ParsedVevent {
    pub uid: String,
    pub recurrence_id: Option<i64>,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub start_ts: i64,
    pub end_ts: i64,
    pub all_day: bool,
    pub timezone: Option<String>,
    pub status: EventStatus,
    pub rrule: Option<String>,
    pub rdate: Vec<i64>,
    pub exdate: Vec<i64>,
    pub organizer: Option<String>,
    pub sequence: i32,
    pub dtstamp: DateTime<Utc>,
    pub etag: Option<String>,
}

/// Parses every VEVENT block across every VCALENDAR object in `payload`.
/// A resource with a master and its exceptions is returned as a flat list;
/// callers distinguish the master (no RECURRENCE-ID) from exceptions
/// (RECURRENCE-ID set) themselves.
pub fn parse_resource(payload: &str) -> Result<Vec<ParsedVevent>, SyncError> {
    let reader = Cursor::new(payload.as_bytes());
    let parser = ical::IcalParser::new(reader);

    let mut events = Vec::new();
    for calendar in parser {
        let calendar = calendar.map_err(|err| SyncError::Parse(err.to_string()))?;
        for vevent in calendar.events {
            let uid = property_value(&vevent.properties, "UID")
                .ok_or_else(|| SyncError::Parse("VEVENT missing UID".to_string()))?;

            let dtstart_prop = find_property(&vevent.properties, "DTSTART")
                .ok_or_else(|| SyncError::Parse("VEVENT missing DTSTART".to_string()))?;
            let dtstart_raw = dtstart_prop
                .value
                .clone()
                .ok_or_else(|| SyncError::Parse("DTSTART has no value".to_string()))?;
            let all_day = property_has_value_date(dtstart_prop) || is_date_only(&dtstart_raw);
            let timezone = property_tzid(dtstart_prop);
            let start_ts = parse_datetime(&dtstart_raw, timezone.as_deref())?;

            let end_ts = match find_property(&vevent.properties, "DTEND") {
                Some(dtend_prop) => match &dtend_prop.value {
                    Some(raw) => parse_datetime(raw, timezone.as_deref())?,
                    None => start_ts + default_duration_ms(all_day),
                },
                None => start_ts + default_duration_ms(all_day),
            };

            let recurrence_id = find_property(&vevent.properties, "RECURRENCE-ID")
                .and_then(|prop| prop.value.as_deref())
                .and_then(|raw| parse_datetime(raw, timezone.as_deref()).ok());

            let status = match property_value(&vevent.properties, "STATUS").as_deref() {
                Some(s) if s.eq_ignore_ascii_case("CANCELLED") => EventStatus::Cancelled,
                Some(s) if s.eq_ignore_ascii_case("TENTATIVE") => EventStatus::Tentative,
                _ => EventStatus::Confirmed,
            };

            let rdate = vevent
                .properties
                .iter()
                .filter(|p| p.name.eq_ignore_ascii_case("RDATE"))
                .flat_map(|p| parse_multi_value_dates(p.value.as_deref().unwrap_or_default(), timezone.as_deref()))
                .collect();
            let exdate = vevent
                .properties
                .iter()
                .filter(|p| p.name.eq_ignore_ascii_case("EXDATE"))
                .flat_map(|p| parse_multi_value_dates(p.value.as_deref().unwrap_or_default(), timezone.as_deref()))
                .collect();

            let dtstamp = property_value(&vevent.properties, "DTSTAMP")
                .and_then(|raw| parse_datetime(&raw, None).ok())
                .map(ms_to_utc)
                .unwrap_or_else(Utc::now);

            let sequence = property_value(&vevent.properties, "SEQUENCE")
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(0);

            events.push(ParsedVevent {
                uid,
                recurrence_id,
                title: property_value(&vevent.properties, "SUMMARY")
                    .map(|v| unescape_text(&v))
                    .unwrap_or_else(|| "Untitled event".to_string()),
                description: property_value(&vevent.properties, "DESCRIPTION").map(|v| unescape_text(&v)),
                location: property_value(&vevent.properties, "LOCATION").map(|v| unescape_text(&v)),
                start_ts,
                end_ts: if end_ts <= start_ts { start_ts + default_duration_ms(all_day) } else { end_ts },
                all_day,
                timezone,
                status,
                rrule: property_value(&vevent.properties, "RRULE"),
                rdate,
                exdate,
                organizer: property_value(&vevent.properties, "ORGANIZER").map(|v| strip_mailto(&v)),
                sequence,
                dtstamp,
                etag: None,
            });
        }
    }

    Ok(events)
}

fn default_duration_ms(all_day: bool) -> i64 {
    if all_day {
        24 * 3_600_000
    } else {
        3_600_000
    }
}

fn find_property<'a>(properties: &'a [ical::property::Property], key: &str) -> Option<&'a ical::property::Property> {
    properties.iter().find(|p| p.name.eq_ignore_ascii_case(key))
}

fn property_value(properties: &[ical::property::Property], key: &str) -> Option<String> {
    find_property(properties, key).and_then(|p| p.value.clone())
}

fn property_tzid(property: &ical::property::Property) -> Option<String> {
    property
        .params
        .as_ref()?
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case("TZID"))
        .and_then(|(_, values)| values.first().cloned())
}

fn property_has_value_date(property: &ical::property::Property) -> bool {
    property
        .params
        .as_ref()
        .map(|params| {
            params
                .iter()
                .any(|(key, values)| key.eq_ignore_ascii_case("VALUE") && values.iter().any(|v| v.eq_ignore_ascii_case("DATE")))
        })
        .unwrap_or(false)
}

fn is_date_only(value: &str) -> bool {
    value.len() == 8 && value.chars().all(|c| c.is_ascii_digit())
}

fn ms_to_utc(ts_ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ts_ms).unwrap_or_else(|| DateTime::<Utc>::from_timestamp(0, 0).unwrap())
}

/// Parses a single ICS datetime/date value into epoch milliseconds.
fn parse_datetime(raw: &str, tzid: Option<&str>) -> Result<i64, SyncError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc).timestamp_millis());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%SZ") {
        return Ok(Utc.from_utc_datetime(&naive).timestamp_millis());
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y%m%d") {
        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| SyncError::Parse(format!("invalid all-day date: {raw}")))?;
        return Ok(Utc.from_utc_datetime(&midnight).timestamp_millis());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y%m%dT%H%M%S") {
        if let Some(zone) = tzid.and_then(|name| name.parse::<Tz>().ok()) {
            let localized = zone
                .from_local_datetime(&naive)
                .single()
                .unwrap_or_else(|| zone.from_utc_datetime(&naive));
            return Ok(localized.with_timezone(&Utc).timestamp_millis());
        }
        return Ok(Utc.from_utc_datetime(&naive).timestamp_millis());
    }

    Err(SyncError::Parse(format!("unsupported ICS datetime: {raw}")))
}

/// Parses a comma-separated RDATE/EXDATE value list; malformed entries are
/// silently discarded rather than failing the whole property.
fn parse_multi_value_dates(raw: &str, tzid: Option<&str>) -> Vec<i64> {
    raw.split(',')
        .filter_map(|part| parse_datetime(part.trim(), tzid).ok())
        .collect()
}

fn strip_mailto(value: &str) -> String {
    let unescaped = unescape_text(value);
    unescaped
        .strip_prefix("mailto:")
        .or_else(|| unescaped.strip_prefix("MAILTO:"))
        .unwrap_or(&unescaped)
        .to_string()
}

fn unescape_text(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(current) = chars.next() {
        if current != '\\' {
            result.push(current);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => result.push('\n'),
            Some('\\') => result.push('\\'),
            Some(';') => result.push(';'),
            Some(',') => result.push(','),
            Some(other) => result.push(other),
            None => {}
        }
    }
    result
}

fn escape_text(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace(';', "\\;").replace(',', "\\,")
}

fn format_datetime(ts_ms: i64, all_day: bool) -> String {
    let dt = ms_to_utc(ts_ms);
    if all_day {
        dt.format("%Y%m%d").to_string()
    } else {
        dt.format("%Y%m%dT%H%M%SZ").to_string()
    }
}

fn render_vevent(out: &mut String, event: &Event, recurrence_id: Option<i64>) {
    out.push_str("BEGIN:VEVENT\r\n");
    out.push_str(&format!("UID:{}\r\n", escape_text(&event.uid)));
    out.push_str(&format!("DTSTAMP:{}\r\n", event.dtstamp.format("%Y%m%dT%H%M%SZ")));
    out.push_str(&format!("SEQUENCE:{}\r\n", event.sequence));

    if event.all_day {
        out.push_str(&format!("DTSTART;VALUE=DATE:{}\r\n", format_datetime(event.start_ts, true)));
        out.push_str(&format!("DTEND;VALUE=DATE:{}\r\n", format_datetime(event.end_ts, true)));
    } else if let Some(tzid) = &event.timezone {
        out.push_str(&format!("DTSTART;TZID={tzid}:{}\r\n", format_local(event.start_ts, tzid)));
        out.push_str(&format!("DTEND;TZID={tzid}:{}\r\n", format_local(event.end_ts, tzid)));
    } else {
        out.push_str(&format!("DTSTART:{}\r\n", format_datetime(event.start_ts, false)));
        out.push_str(&format!("DTEND:{}\r\n", format_datetime(event.end_ts, false)));
    }

    if let Some(recurrence_id) = recurrence_id {
        out.push_str(&format!("RECURRENCE-ID:{}\r\n", format_datetime(recurrence_id, event.all_day)));
    }

    out.push_str(&format!("SUMMARY:{}\r\n", escape_text(&event.title)));
    if let Some(description) = &event.description {
        out.push_str(&format!("DESCRIPTION:{}\r\n", escape_text(description)));
    }
    if let Some(location) = &event.location {
        out.push_str(&format!("LOCATION:{}\r\n", escape_text(location)));
    }
    if let Some(organizer) = &event.organizer {
        out.push_str(&format!("ORGANIZER:mailto:{}\r\n", escape_text(organizer)));
    }
    if let Some(rrule) = &event.rrule {
        out.push_str(&format!("RRULE:{rrule}\r\n"));
    }
    if !event.rdate.is_empty() {
        let values: Vec<String> = event.rdate.iter().map(|&ts| format_datetime(ts, event.all_day)).collect();
        out.push_str(&format!("RDATE:{}\r\n", values.join(",")));
    }
    if !event.exdate.is_empty() {
        let values: Vec<String> = event.exdate.iter().map(|&ts| format_datetime(ts, event.all_day)).collect();
        out.push_str(&format!("EXDATE:{}\r\n", values.join(",")));
    }
    if event.status == EventStatus::Cancelled {
        out.push_str("STATUS:CANCELLED\r\n");
    }
    for category in &event.categories {
        out.push_str(&format!("CATEGORIES:{}\r\n", escape_text(category)));
    }
    out.push_str("END:VEVENT\r\n");
}

fn format_local(ts_ms: i64, tzid: &str) -> String {
    match tzid.parse::<Tz>() {
        Ok(zone) => ms_to_utc(ts_ms).with_timezone(&zone).format("%Y%m%dT%H%M%S").to_string(),
        Err(_) => ms_to_utc(ts_ms).format("%Y%m%dT%H%M%SZ").to_string(),
    }
}

/// Renders a master event and its exceptions as one VCALENDAR resource, the
/// shape a CalDAV server expects when a recurring event's overrides live
/// alongside the master under a shared href.
pub fn render_resource(master: &Event, exceptions: &[Event]) -> String {
    let mut out = String::from("BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//TidalCal//EN\r\n");
    render_vevent(&mut out, master, None);
    for exception in exceptions {
        let recurrence_id = exception.original_instance_time.unwrap_or(exception.start_ts);
        render_vevent(&mut out, exception, Some(recurrence_id));
    }
    out.push_str("END:VCALENDAR\r\n");
    out
}

/// Renders a single non-recurring (or standalone exception) VEVENT resource.
pub fn render_single(event: &Event) -> String {
    let mut out = String::from("BEGIN:VCALENDAR\r\nVERSION:2.0\r\nPRODID:-//TidalCal//EN\r\n");
    let recurrence_id = event.original_event_id.and(event.original_instance_time);
    render_vevent(&mut out, event, recurrence_id);
    out.push_str("END:VCALENDAR\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_vevent() {
        let ics = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nBEGIN:VEVENT\r\nUID:abc-123\r\nDTSTAMP:20250101T000000Z\r\nDTSTART:20250102T090000Z\r\nDTEND:20250102T100000Z\r\nSUMMARY:Standup\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let parsed = parse_resource(ics).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].uid, "abc-123");
        assert_eq!(parsed[0].title, "Standup");
        assert!(!parsed[0].all_day);
    }

    #[test]
    fn parses_all_day_event() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:holiday\r\nDTSTAMP:20250101T000000Z\r\nDTSTART;VALUE=DATE:20250704\r\nDTEND;VALUE=DATE:20250705\r\nSUMMARY:Independence Day\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let parsed = parse_resource(ics).unwrap();
        assert!(parsed[0].all_day);
    }

    #[test]
    fn malformed_rdate_entries_are_discarded() {
        assert_eq!(parse_multi_value_dates("20250101T000000Z,not-a-date,20250102T000000Z", None).len(), 2);
    }

    #[test]
    fn render_single_carries_uid_and_summary() {
        let ics = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:abc-123\r\nDTSTAMP:20250101T000000Z\r\nDTSTART:20250102T090000Z\r\nDTEND:20250102T100000Z\r\nSUMMARY:Standup\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        let parsed = parse_resource(ics).unwrap();

        let event = tidalcal_core::Event {
            id: uuid::Uuid::new_v4(),
            uid: parsed[0].uid.clone(),
            calendar_id: uuid::Uuid::new_v4(),
            original_event_id: None,
            original_instance_time: None,
            title: parsed[0].title.clone(),
            location: None,
            description: None,
            start_ts: parsed[0].start_ts,
            end_ts: parsed[0].end_ts,
            timezone: None,
            all_day: false,
            status: EventStatus::Confirmed,
            transparency: tidalcal_core::Transparency::Opaque,
            classification: tidalcal_core::Classification::Public,
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
            sync_status: tidalcal_core::SyncStatus::Synced,
            retry_count: 0,
            last_sync_error: None,
            local_modified_at: Utc::now(),
            server_modified_at: None,
        };

        let rendered = render_single(&event);
        assert!(rendered.contains("UID:abc-123"));
        assert!(rendered.contains("SUMMARY:Standup"));
    }
}
