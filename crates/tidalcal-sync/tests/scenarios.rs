//! The six literal end-to-end scenarios named by the sync core's design
//! notes, run against an in-memory store and the fake CalDAV client in
//! `common`. Mirrors the teacher pack's own `tests/scenarii.rs` +
//! `tests/sync.rs` split (scenario data separate from the test driver).

mod common;

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use common::FakeCalDavClient;
use tidalcal_core::{
    Account, CalDavError, Calendar, Classification, CoreError, Event, EventStatus,
    OperationKind, OperationStatus, PendingOperation, Provider, ReminderSink, ScheduledReminder,
    SyncStatus, SystemClock, Transparency,
};
use tidalcal_storage::Store;
use uuid::Uuid;

#[derive(Default)]
struct CountingReminders {
    cancelled: std::sync::Mutex<Vec<Uuid>>,
}

#[async_trait::async_trait]
impl ReminderSink for CountingReminders {
    async fn schedule(&self, _reminder: &ScheduledReminder) -> Result<(), CoreError> {
        Ok(())
    }
    async fn cancel(&self, _reminder_id: Uuid) -> Result<(), CoreError> {
        Ok(())
    }
    async fn cancel_for_event(&self, event_id: Uuid) -> Result<(), CoreError> {
        self.cancelled.lock().unwrap().push(event_id);
        Ok(())
    }
}

async fn seeded_account_and_calendar(store: &Store, server_url: Option<url::Url>) -> (Account, Calendar) {
    let now = Utc::now();
    let account = Account {
        id: Uuid::new_v4(),
        provider: Provider::CalDav,
        email: "a@example.com".into(),
        display_name: "A".into(),
        principal_url: None,
        calendar_home_url: Some(url::Url::parse("https://dav.example.com/home/").unwrap()),
        credential_ref: None,
        enabled: true,
        last_sync_attempt: None,
        last_sync_success: None,
        consecutive_sync_failures: 0,
        created_at: now,
        updated_at: now,
    };
    store.upsert_account(&account).await.unwrap();

    let calendar = Calendar {
        id: Uuid::new_v4(),
        account_id: account.id,
        server_url,
        display_name: "Work".into(),
        color_argb: 0xff0000ff,
        read_only: false,
        visible: true,
        is_default: true,
        sort_order: 0,
        sync_token: None,
        ctag: None,
        created_at: now,
        updated_at: now,
    };
    store.upsert_calendar(&calendar).await.unwrap();
    (account, calendar)
}

fn master_event(calendar_id: Uuid, uid: &str, start_ts: i64, end_ts: i64, rrule: Option<&str>) -> Event {
    Event {
        id: Uuid::new_v4(),
        uid: uid.to_string(),
        calendar_id,
        original_event_id: None,
        original_instance_time: None,
        title: "Weekly sync".into(),
        location: None,
        description: None,
        start_ts,
        end_ts,
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

/// Scenario 1: weekly master + single-instance edit.
#[tokio::test]
async fn scenario_weekly_master_single_instance_edit() {
    let store = Store::connect_in_memory().await.unwrap();
    let (_account, calendar) = seeded_account_and_calendar(&store, None).await;
    let clock = SystemClock;

    let start = Utc.with_ymd_and_hms(2025, 1, 6, 10, 0, 0).unwrap();
    let master = master_event(
        calendar.id,
        "U1",
        start.timestamp_millis(),
        (start + Duration::hours(1)).timestamp_millis(),
        Some("FREQ=WEEKLY;BYDAY=MO"),
    );
    let master = tidalcal_sync::create_event(&store, &clock, master, true).await.unwrap();

    let occurrence_time = (start + Duration::weeks(2)).timestamp_millis();
    let moved_start = Utc.with_ymd_and_hms(2025, 1, 20, 14, 0, 0).unwrap().timestamp_millis();

    let mut modified = master.clone();
    modified.id = Uuid::new_v4();
    modified.title = "Moved".into();
    modified.start_ts = moved_start;
    modified.end_ts = moved_start + 3_600_000;

    tidalcal_sync::edit_single_occurrence(&store, &clock, &master, occurrence_time, modified).await.unwrap();

    let all_events = store.list_events_for_calendar(calendar.id).await.unwrap();
    assert_eq!(all_events.len(), 2);
    assert!(all_events.iter().all(|e| e.uid == "U1"));

    let occurrences = store.list_occurrences_for_event(master.id).await.unwrap();
    let moved_row = occurrences.iter().find(|o| o.start_ts == moved_start).expect("moved occurrence present");
    assert!(moved_row.exception_event_id.is_some());

    let op = store.find_pending_operation(master.id, OperationKind::Update).await.unwrap();
    assert!(op.is_some());
}

/// Scenario 2: EXDATE path.
#[tokio::test]
async fn scenario_exdate_path() {
    let store = Store::connect_in_memory().await.unwrap();
    let (_account, calendar) = seeded_account_and_calendar(&store, None).await;
    let clock = SystemClock;

    let start = Utc.with_ymd_and_hms(2024, 6, 15, 9, 0, 0).unwrap();
    let master = master_event(
        calendar.id,
        "U2",
        start.timestamp_millis(),
        (start + Duration::hours(1)).timestamp_millis(),
        Some("FREQ=DAILY;COUNT=5"),
    );
    let master = tidalcal_sync::create_event(&store, &clock, master, true).await.unwrap();

    let excluded = Utc.with_ymd_and_hms(2024, 6, 17, 9, 0, 0).unwrap().timestamp_millis();
    tidalcal_sync::delete_single_occurrence(&store, &clock, master.clone(), excluded).await.unwrap();

    let reloaded = store.get_event(master.id).await.unwrap().unwrap();
    assert!(reloaded.exdate.iter().any(|&t| (t - excluded).abs() < 60_000));

    let occurrences = store.list_occurrences_for_event(master.id).await.unwrap();
    let cancelled_row = occurrences.iter().find(|o| (o.start_ts - excluded).abs() < 60_000).unwrap();
    assert!(cancelled_row.is_cancelled);

    assert!(store.find_pending_operation(master.id, OperationKind::Update).await.unwrap().is_some());
    assert!(store.find_pending_operation(master.id, OperationKind::Delete).await.unwrap().is_none());
}

/// Scenario 3: literal backoff schedule.
#[test]
fn scenario_backoff_schedule() {
    let expected_secs = [30, 60, 120, 240, 480, 960, 1920, 3840, 7680, 15360, 18000];
    for (n, &expected) in expected_secs.iter().enumerate() {
        let delay = tidalcal_sync::calculate_retry_delay(n as u32);
        assert_eq!(delay, Duration::seconds(expected), "retryCount={n}");
    }
}

/// Scenario 4: MOVE two-phase retry. Each probed `now` is pushed well past
/// the 5-hour backoff cap so readiness never depends on the exact delay the
/// previous failure scheduled.
#[tokio::test]
async fn scenario_move_two_phase_retry() {
    let store = Store::connect_in_memory().await.unwrap();
    let calendar_url = url::Url::parse("https://dav.example.com/home/c1/").unwrap();
    let (_account, c1) = seeded_account_and_calendar(&store, Some(calendar_url.clone())).await;
    let c2_url = url::Url::parse("https://dav.example.com/home/c2/").unwrap();
    let c2 = Calendar {
        id: Uuid::new_v4(),
        account_id: c1.account_id,
        server_url: Some(c2_url),
        display_name: "Personal".into(),
        color_argb: 0xff00ff00,
        read_only: false,
        visible: true,
        is_default: false,
        sort_order: 1,
        sync_token: None,
        ctag: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    store.upsert_calendar(&c2).await.unwrap();

    let client = FakeCalDavClient::new();
    let old_resource_url = calendar_url.join("u3.ics").unwrap();
    let etag = client.seed_resource(old_resource_url.clone(), "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n");

    let clock = SystemClock;
    let mut event = master_event(c1.id, "U3", Utc::now().timestamp_millis(), Utc::now().timestamp_millis() + 3_600_000, None);
    event.server_url = Some(old_resource_url);
    event.etag = Some(etag);
    let event = tidalcal_sync::create_event(&store, &clock, event, true).await.unwrap();

    let (_moved_event, _outcome) = tidalcal_sync::move_event_to_calendar(&store, &clock, event.clone(), c2.id, false, false).await.unwrap();
    let op = store.find_pending_operation(event.id, OperationKind::Move).await.unwrap().unwrap();

    let base = Utc::now();

    // DELETE phase: four failed attempts bring retryCount to 4.
    for n in 0..4i64 {
        client.fail_next_with(CalDavError::Network("timeout".into()));
        let probe = base + Duration::hours(6 * (n + 1));
        let summary = tidalcal_sync::drain(&store, &client, probe).await.unwrap();
        assert_eq!(summary.retried, 1, "delete attempt {n} should be retried, not succeeded");
    }

    // Fifth attempt: DELETE succeeds, phase advances to CREATE (not closed).
    let delete_succeeds_at = base + Duration::hours(6 * 5);
    let summary = tidalcal_sync::drain(&store, &client, delete_succeeds_at).await.unwrap();
    assert_eq!(summary.retried, 1, "a successful DELETE advances the phase rather than closing the operation");

    let after_delete = store.get_pending_operation(op.id).await.unwrap().expect("op advances, not consumed");
    assert_eq!(after_delete.move_phase, Some(tidalcal_core::MovePhase::Create));
    assert_eq!(after_delete.retry_count, 0);

    // CREATE phase: three failures then a clean success, with an independent retry budget.
    for n in 0..3i64 {
        client.fail_next_with(CalDavError::Server("boom".into()));
        let probe = delete_succeeds_at + Duration::hours(6 * (n + 1));
        let summary = tidalcal_sync::drain(&store, &client, probe).await.unwrap();
        assert_eq!(summary.retried, 1, "create attempt {n} should be retried");
    }

    let create_succeeds_at = delete_succeeds_at + Duration::hours(6 * 4);
    let final_summary = tidalcal_sync::drain(&store, &client, create_succeeds_at).await.unwrap();
    assert_eq!(final_summary.succeeded, 1);
    assert!(store.get_pending_operation(op.id).await.unwrap().is_none());

    let final_event = store.get_event(event.id).await.unwrap().unwrap();
    assert_eq!(final_event.calendar_id, c2.id);
    assert!(final_event.server_url.is_some());
}

/// Scenario 5: local-first wins on concurrent server change.
#[tokio::test]
async fn scenario_local_first_wins() {
    let store = Store::connect_in_memory().await.unwrap();
    let calendar_url = url::Url::parse("https://dav.example.com/home/c1/").unwrap();
    let (_account, calendar) = seeded_account_and_calendar(&store, Some(calendar_url.clone())).await;

    let client = FakeCalDavClient::new();
    client.add_calendar(calendar_url.clone(), "ctag-1");

    let resource_url = calendar_url.join("u4.ics").unwrap();
    let clock = SystemClock;
    let mut event = master_event(calendar.id, "U4", Utc::now().timestamp_millis(), Utc::now().timestamp_millis() + 3_600_000, None);
    event.title = "L".into();
    event.server_url = Some(resource_url.clone());
    event.etag = Some("etag-local".into());
    event.sync_status = SyncStatus::PendingUpdate;
    let stored = tidalcal_sync::create_event(&store, &clock, event, true).await.unwrap();

    let now = Utc::now();
    let op = PendingOperation {
        id: Uuid::new_v4(),
        event_id: stored.id,
        operation: OperationKind::Update,
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
    };
    tidalcal_sync::enqueue(&store, op).await.unwrap();

    client.seed_resource(
        resource_url.clone(),
        "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:U4\r\nDTSTAMP:20250101T000000Z\r\nDTSTART:20250102T090000Z\r\nDTEND:20250102T100000Z\r\nSUMMARY:S\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n",
    );
    client.bump_ctag(&calendar_url, "ctag-2");

    tidalcal_sync::pull_calendar(&store, &client, calendar.clone(), &calendar_url).await.unwrap();

    let reloaded = store.get_event(stored.id).await.unwrap().unwrap();
    assert_eq!(reloaded.title, "L");
    assert_eq!(reloaded.etag.as_deref(), Some("etag-local"));
    let ops_after = store.list_pending_operations_for_event(stored.id).await.unwrap();
    assert_eq!(ops_after.len(), 1);
}

/// Scenario 6: account deletion cascade.
#[tokio::test]
async fn scenario_account_deletion_cascade() {
    let store = Arc::new(Store::connect_in_memory().await.unwrap());
    let (account, calendar) = seeded_account_and_calendar(&store, None).await;
    let clock = SystemClock;

    let event = master_event(calendar.id, "U5", Utc::now().timestamp_millis(), Utc::now().timestamp_millis() + 3_600_000, None);
    let event = tidalcal_sync::create_event(&store, &clock, event, false).await.unwrap();

    let reminders = Arc::new(CountingReminders::default());
    let client: Arc<dyn tidalcal_core::CalDavClient> = Arc::new(FakeCalDavClient::new());
    let clock_arc: Arc<dyn tidalcal_core::Clock> = Arc::new(SystemClock);
    let engine = tidalcal_sync::SyncEngine::new(store.clone(), clock_arc, client, reminders.clone(), tidalcal_sync::SyncEngineConfig::default());

    engine.delete_account(account.id).await.unwrap();

    assert!(store.get_account(account.id).await.unwrap().is_none());
    assert!(store.get_calendar(calendar.id).await.unwrap().is_none());
    assert!(store.get_event(event.id).await.unwrap().is_none());
    assert!(store.list_pending_operations_for_event(event.id).await.unwrap().is_empty());
    assert_eq!(reminders.cancelled.lock().unwrap().as_slice(), &[event.id]);
}
