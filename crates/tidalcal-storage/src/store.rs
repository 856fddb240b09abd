use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, Row, Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use url::Url;
use uuid::Uuid;

use tidalcal_core::{
    Account, Calendar, Classification, Event, EventStatus, MovePhase, Occurrence, OperationKind,
    OperationStatus, PendingOperation, Provider, ReminderStatus, ScheduledReminder, SyncStatus,
    Transparency,
};

use crate::StorageError;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());
        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30))
            .pragma("temp_store", "memory")
            .pragma("cache_size", "-20000");

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn connect_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<sqlx::Transaction<'_, Sqlite>, StorageError> {
        Ok(self.pool.begin().await?)
    }

    // ---- accounts ----

    pub async fn upsert_account(&self, account: &Account) -> Result<(), StorageError> {
        upsert_account(&self.pool, account).await
    }

    pub async fn get_account(&self, id: Uuid) -> Result<Option<Account>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, provider, email, display_name, principal_url, calendar_home_url,
                   credential_ref, enabled, last_sync_attempt, last_sync_success,
                   consecutive_sync_failures, created_at, updated_at
            FROM accounts WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_account).transpose()
    }

    pub async fn list_enabled_accounts(&self) -> Result<Vec<Account>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, provider, email, display_name, principal_url, calendar_home_url,
                   credential_ref, enabled, last_sync_attempt, last_sync_success,
                   consecutive_sync_failures, created_at, updated_at
            FROM accounts WHERE enabled = 1 ORDER BY email
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_account).collect()
    }

    pub async fn record_sync_attempt(
        &self,
        account_id: Uuid,
        at: DateTime<Utc>,
        success: bool,
    ) -> Result<(), StorageError> {
        if success {
            sqlx::query(
                r#"UPDATE accounts SET last_sync_attempt = ?2, last_sync_success = ?2,
                   consecutive_sync_failures = 0, updated_at = ?2 WHERE id = ?1"#,
            )
            .bind(account_id.to_string())
            .bind(at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"UPDATE accounts SET last_sync_attempt = ?2,
                   consecutive_sync_failures = consecutive_sync_failures + 1, updated_at = ?2
                   WHERE id = ?1"#,
            )
            .bind(account_id.to_string())
            .bind(at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Cascade-deletes an account and everything owned by it: (1) pending
    /// operations for every event in every calendar of the account, (2)
    /// reminders for those events (FK cascade handles the rest once the
    /// account row itself is removed).
    pub async fn delete_account_cascade(&self, account_id: Uuid) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM pending_operations WHERE event_id IN (
                SELECT e.id FROM events e
                JOIN calendars c ON c.id = e.calendar_id
                WHERE c.account_id = ?1
            )
            "#,
        )
        .bind(account_id.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM accounts WHERE id = ?1")
            .bind(account_id.to_string())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // ---- calendars ----

    pub async fn upsert_calendar(&self, calendar: &Calendar) -> Result<(), StorageError> {
        upsert_calendar(&self.pool, calendar).await
    }

    pub async fn get_calendar(&self, id: Uuid) -> Result<Option<Calendar>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT id, account_id, server_url, display_name, color_argb, read_only, visible,
                   is_default, sort_order, sync_token, ctag, created_at, updated_at
            FROM calendars WHERE id = ?1
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_calendar).transpose()
    }

    pub async fn list_calendars_for_account(
        &self,
        account_id: Uuid,
    ) -> Result<Vec<Calendar>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, server_url, display_name, color_argb, read_only, visible,
                   is_default, sort_order, sync_token, ctag, created_at, updated_at
            FROM calendars WHERE account_id = ?1 ORDER BY sort_order
            "#,
        )
        .bind(account_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_calendar).collect()
    }

    pub async fn update_calendar_ctag(
        &self,
        calendar_id: Uuid,
        ctag: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE calendars SET ctag = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(calendar_id.to_string())
            .bind(ctag)
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- events ----

    pub async fn get_event(&self, id: Uuid) -> Result<Option<Event>, StorageError> {
        let row = sqlx::query(&event_select_sql("WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_event).transpose()
    }

    pub async fn get_event_by_server_url(
        &self,
        server_url: &Url,
    ) -> Result<Option<Event>, StorageError> {
        let row = sqlx::query(&event_select_sql("WHERE server_url = ?1"))
            .bind(server_url.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_event).transpose()
    }

    pub async fn list_events_for_calendar(&self, calendar_id: Uuid) -> Result<Vec<Event>, StorageError> {
        let rows = sqlx::query(&event_select_sql("WHERE calendar_id = ?1 ORDER BY start_ts"))
            .bind(calendar_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_event).collect()
    }

    pub async fn list_exceptions_for_master(&self, master_id: Uuid) -> Result<Vec<Event>, StorageError> {
        let rows = sqlx::query(&event_select_sql(
            "WHERE original_event_id = ?1 ORDER BY original_instance_time",
        ))
        .bind(master_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_event).collect()
    }

    pub async fn list_events_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Event>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (1..=ids.len()).map(|n| format!("?{n}")).collect::<Vec<_>>().join(",");
        let sql = event_select_sql(&format!("WHERE id IN ({placeholders})"));
        let mut query = sqlx::query(&sql);
        for id in ids {
            query = query.bind(id.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_event).collect()
    }

    pub async fn upsert_event(&self, event: &Event) -> Result<(), StorageError> {
        upsert_event(&self.pool, event).await
    }

    pub async fn delete_event(&self, id: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM events WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Inserts/updates an event, replaces its occurrence rows, and enqueues
    /// a pending operation, all in one transaction -- the write-and-enqueue
    /// atomicity guarantee.
    pub async fn write_event_with_occurrences(
        &self,
        event: &Event,
        occurrences: &[Occurrence],
        operation: Option<&PendingOperation>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        upsert_event(&mut *tx, event).await?;
        delete_occurrences_for_event(&mut *tx, event.id).await?;
        for occurrence in occurrences {
            insert_occurrence(&mut *tx, occurrence).await?;
        }
        if let Some(op) = operation {
            upsert_pending_operation(&mut *tx, op).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Upserts an exception event, the master it belongs to, and the
    /// master's full occurrence row set (including the link onto the
    /// exception's slot), plus the master's pending operation if one is
    /// enqueued -- one transaction, so a single-occurrence edit can never
    /// leave the occurrence linked without the matching UPDATE queued.
    pub async fn write_exception_with_master_update(
        &self,
        exception: &Event,
        master: &Event,
        occurrences: &[Occurrence],
        operation: Option<&PendingOperation>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;

        upsert_event(&mut *tx, exception).await?;
        upsert_event(&mut *tx, master).await?;
        delete_occurrences_for_event(&mut *tx, master.id).await?;
        for occurrence in occurrences {
            insert_occurrence(&mut *tx, occurrence).await?;
        }
        if let Some(op) = operation {
            upsert_pending_operation(&mut *tx, op).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    // ---- occurrences ----

    pub async fn list_occurrences_in_range(
        &self,
        calendar_id: Uuid,
        range_start: i64,
        range_end: i64,
    ) -> Result<Vec<Occurrence>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, calendar_id, start_ts, end_ts, start_day, end_day,
                   is_cancelled, exception_event_id
            FROM occurrences
            WHERE calendar_id = ?1 AND end_ts >= ?2 AND start_ts <= ?3 AND is_cancelled = 0
            ORDER BY start_ts
            "#,
        )
        .bind(calendar_id.to_string())
        .bind(range_start)
        .bind(range_end)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_occurrence).collect()
    }

    pub async fn list_occurrences_for_event(&self, event_id: Uuid) -> Result<Vec<Occurrence>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, calendar_id, start_ts, end_ts, start_day, end_day,
                   is_cancelled, exception_event_id
            FROM occurrences WHERE event_id = ?1 ORDER BY start_ts
            "#,
        )
        .bind(event_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_occurrence).collect()
    }

    pub async fn replace_occurrences(
        &self,
        event_id: Uuid,
        occurrences: &[Occurrence],
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        delete_occurrences_for_event(&mut *tx, event_id).await?;
        for occurrence in occurrences {
            insert_occurrence(&mut *tx, occurrence).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn update_occurrence(&self, occurrence: &Occurrence) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE occurrences SET start_ts = ?2, end_ts = ?3, start_day = ?4, end_day = ?5,
                   is_cancelled = ?6, exception_event_id = ?7
            WHERE id = ?1
            "#,
        )
        .bind(occurrence.id.to_string())
        .bind(occurrence.start_ts)
        .bind(occurrence.end_ts)
        .bind(occurrence.start_day)
        .bind(occurrence.end_day)
        .bind(occurrence.is_cancelled as i64)
        .bind(occurrence.exception_event_id.map(|id| id.to_string()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ---- pending operations ----

    pub async fn upsert_pending_operation(&self, op: &PendingOperation) -> Result<(), StorageError> {
        upsert_pending_operation(&self.pool, op).await
    }

    pub async fn get_pending_operation(&self, id: Uuid) -> Result<Option<PendingOperation>, StorageError> {
        let row = sqlx::query(&pending_operation_select_sql("WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_pending_operation).transpose()
    }

    pub async fn find_pending_operation(
        &self,
        event_id: Uuid,
        kind: OperationKind,
    ) -> Result<Option<PendingOperation>, StorageError> {
        let row = sqlx::query(&pending_operation_select_sql(
            "WHERE event_id = ?1 AND operation = ?2 AND status != 'failed'",
        ))
        .bind(event_id.to_string())
        .bind(enum_to_text(&kind)?)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_pending_operation).transpose()
    }

    pub async fn list_pending_operations_for_event(
        &self,
        event_id: Uuid,
    ) -> Result<Vec<PendingOperation>, StorageError> {
        let rows = sqlx::query(&pending_operation_select_sql("WHERE event_id = ?1"))
            .bind(event_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_pending_operation).collect()
    }

    pub async fn get_ready_operations(&self, now: DateTime<Utc>) -> Result<Vec<PendingOperation>, StorageError> {
        let rows = sqlx::query(&pending_operation_select_sql(
            "WHERE status = 'pending' AND next_retry_at <= ?1 ORDER BY created_at",
        ))
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_pending_operation).collect()
    }

    pub async fn get_stale_in_progress(&self, cutoff: DateTime<Utc>) -> Result<Vec<PendingOperation>, StorageError> {
        let rows = sqlx::query(&pending_operation_select_sql(
            "WHERE status = 'in_progress' AND updated_at < ?1",
        ))
        .bind(cutoff.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_pending_operation).collect()
    }

    pub async fn get_old_failed(
        &self,
        failed_before: DateTime<Utc>,
    ) -> Result<Vec<PendingOperation>, StorageError> {
        let rows = sqlx::query(&pending_operation_select_sql(
            "WHERE status = 'failed' AND failed_at IS NOT NULL AND failed_at < ?1",
        ))
        .bind(failed_before.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_pending_operation).collect()
    }

    pub async fn get_expired_operations(&self, cutoff: DateTime<Utc>) -> Result<Vec<PendingOperation>, StorageError> {
        let rows = sqlx::query(&pending_operation_select_sql("WHERE lifetime_reset_at < ?1"))
            .bind(cutoff.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_pending_operation).collect()
    }

    pub async fn delete_pending_operation(&self, id: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM pending_operations WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_pending_operations_for_event(&self, event_id: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM pending_operations WHERE event_id = ?1")
            .bind(event_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- scheduled reminders ----

    pub async fn upsert_reminder(&self, reminder: &ScheduledReminder) -> Result<(), StorageError> {
        upsert_reminder(&self.pool, reminder).await
    }

    pub async fn list_reminders_for_event(&self, event_id: Uuid) -> Result<Vec<ScheduledReminder>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, trigger_time, occurrence_time, reminder_offset, status
            FROM scheduled_reminders WHERE event_id = ?1
            "#,
        )
        .bind(event_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_reminder).collect()
    }

    pub async fn delete_reminders_for_event(&self, event_id: Uuid) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM scheduled_reminders WHERE event_id = ?1")
            .bind(event_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ---- free CRUD primitives, generic over pool or transaction ----

async fn upsert_account<'e, E>(executor: E, account: &Account) -> Result<(), StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO accounts (
          id, provider, email, display_name, principal_url, calendar_home_url, credential_ref,
          enabled, last_sync_attempt, last_sync_success, consecutive_sync_failures,
          created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(id) DO UPDATE SET
          provider = excluded.provider, email = excluded.email,
          display_name = excluded.display_name, principal_url = excluded.principal_url,
          calendar_home_url = excluded.calendar_home_url, credential_ref = excluded.credential_ref,
          enabled = excluded.enabled, last_sync_attempt = excluded.last_sync_attempt,
          last_sync_success = excluded.last_sync_success,
          consecutive_sync_failures = excluded.consecutive_sync_failures,
          updated_at = excluded.updated_at
        "#,
    )
    .bind(account.id.to_string())
    .bind(serde_json::to_string(&account.provider)?)
    .bind(&account.email)
    .bind(&account.display_name)
    .bind(account.principal_url.as_ref().map(Url::as_str))
    .bind(account.calendar_home_url.as_ref().map(Url::as_str))
    .bind(&account.credential_ref)
    .bind(account.enabled as i64)
    .bind(account.last_sync_attempt.map(|dt| dt.to_rfc3339()))
    .bind(account.last_sync_success.map(|dt| dt.to_rfc3339()))
    .bind(account.consecutive_sync_failures as i64)
    .bind(account.created_at.to_rfc3339())
    .bind(account.updated_at.to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

async fn upsert_calendar<'e, E>(executor: E, calendar: &Calendar) -> Result<(), StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO calendars (
          id, account_id, server_url, display_name, color_argb, read_only, visible, is_default,
          sort_order, sync_token, ctag, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        ON CONFLICT(id) DO UPDATE SET
          server_url = excluded.server_url, display_name = excluded.display_name,
          color_argb = excluded.color_argb, read_only = excluded.read_only,
          visible = excluded.visible, is_default = excluded.is_default,
          sort_order = excluded.sort_order, sync_token = excluded.sync_token,
          ctag = excluded.ctag, updated_at = excluded.updated_at
        "#,
    )
    .bind(calendar.id.to_string())
    .bind(calendar.account_id.to_string())
    .bind(calendar.server_url.as_ref().map(Url::as_str))
    .bind(&calendar.display_name)
    .bind(calendar.color_argb as i64)
    .bind(calendar.read_only as i64)
    .bind(calendar.visible as i64)
    .bind(calendar.is_default as i64)
    .bind(calendar.sort_order as i64)
    .bind(&calendar.sync_token)
    .bind(&calendar.ctag)
    .bind(calendar.created_at.to_rfc3339())
    .bind(calendar.updated_at.to_rfc3339())
    .execute(executor)
    .await?;
    Ok(())
}

fn event_select_sql(predicate: &str) -> String {
    format!(
        r#"
        SELECT id, uid, calendar_id, original_event_id, original_instance_time, title, location,
               description, start_ts, end_ts, timezone, all_day, status, transparency,
               classification, organizer, rrule, rdate_json, exdate_json, duration, dtstamp,
               reminders_json, extra_properties_json, categories_json, priority, url, color,
               geo_lat, geo_lon, server_url, etag, sequence, sync_status, retry_count,
               last_sync_error, local_modified_at, server_modified_at
        FROM events {predicate}
        "#
    )
}

async fn upsert_event<'e, E>(executor: E, event: &Event) -> Result<(), StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO events (
          id, uid, calendar_id, original_event_id, original_instance_time, title, location,
          description, start_ts, end_ts, timezone, all_day, status, transparency, classification,
          organizer, rrule, rdate_json, exdate_json, duration, dtstamp, reminders_json,
          extra_properties_json, categories_json, priority, url, color, geo_lat, geo_lon,
          server_url, etag, sequence, sync_status, retry_count, last_sync_error,
          local_modified_at, server_modified_at
        ) VALUES (
          ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19,
          ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30, ?31, ?32, ?33, ?34, ?35, ?36, ?37
        )
        ON CONFLICT(id) DO UPDATE SET
          uid = excluded.uid, calendar_id = excluded.calendar_id,
          original_event_id = excluded.original_event_id,
          original_instance_time = excluded.original_instance_time, title = excluded.title,
          location = excluded.location, description = excluded.description,
          start_ts = excluded.start_ts, end_ts = excluded.end_ts, timezone = excluded.timezone,
          all_day = excluded.all_day, status = excluded.status,
          transparency = excluded.transparency, classification = excluded.classification,
          organizer = excluded.organizer, rrule = excluded.rrule, rdate_json = excluded.rdate_json,
          exdate_json = excluded.exdate_json, duration = excluded.duration,
          dtstamp = excluded.dtstamp, reminders_json = excluded.reminders_json,
          extra_properties_json = excluded.extra_properties_json,
          categories_json = excluded.categories_json, priority = excluded.priority,
          url = excluded.url, color = excluded.color, geo_lat = excluded.geo_lat,
          geo_lon = excluded.geo_lon, server_url = excluded.server_url, etag = excluded.etag,
          sequence = excluded.sequence, sync_status = excluded.sync_status,
          retry_count = excluded.retry_count, last_sync_error = excluded.last_sync_error,
          local_modified_at = excluded.local_modified_at,
          server_modified_at = excluded.server_modified_at
        "#,
    )
    .bind(event.id.to_string())
    .bind(&event.uid)
    .bind(event.calendar_id.to_string())
    .bind(event.original_event_id.map(|id| id.to_string()))
    .bind(event.original_instance_time)
    .bind(&event.title)
    .bind(&event.location)
    .bind(&event.description)
    .bind(event.start_ts)
    .bind(event.end_ts)
    .bind(&event.timezone)
    .bind(event.all_day as i64)
    .bind(serde_json::to_string(&event.status)?)
    .bind(serde_json::to_string(&event.transparency)?)
    .bind(serde_json::to_string(&event.classification)?)
    .bind(&event.organizer)
    .bind(&event.rrule)
    .bind(serde_json::to_string(&event.rdate)?)
    .bind(serde_json::to_string(&event.exdate)?)
    .bind(&event.duration)
    .bind(event.dtstamp.to_rfc3339())
    .bind(serde_json::to_string(&event.reminders)?)
    .bind(serde_json::to_string(&event.extra_properties)?)
    .bind(serde_json::to_string(&event.categories)?)
    .bind(event.priority as i64)
    .bind(event.url.as_ref().map(Url::as_str))
    .bind(event.color.map(|c| c as i64))
    .bind(event.geo.map(|g| g.0))
    .bind(event.geo.map(|g| g.1))
    .bind(event.server_url.as_ref().map(Url::as_str))
    .bind(&event.etag)
    .bind(event.sequence)
    .bind(serde_json::to_string(&event.sync_status)?)
    .bind(event.retry_count as i64)
    .bind(&event.last_sync_error)
    .bind(event.local_modified_at.to_rfc3339())
    .bind(event.server_modified_at.map(|dt| dt.to_rfc3339()))
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_occurrence<'e, E>(executor: E, occurrence: &Occurrence) -> Result<(), StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO occurrences (
          id, event_id, calendar_id, start_ts, end_ts, start_day, end_day, is_cancelled,
          exception_event_id
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
    )
    .bind(occurrence.id.to_string())
    .bind(occurrence.event_id.to_string())
    .bind(occurrence.calendar_id.to_string())
    .bind(occurrence.start_ts)
    .bind(occurrence.end_ts)
    .bind(occurrence.start_day)
    .bind(occurrence.end_day)
    .bind(occurrence.is_cancelled as i64)
    .bind(occurrence.exception_event_id.map(|id| id.to_string()))
    .execute(executor)
    .await?;
    Ok(())
}

async fn delete_occurrences_for_event<'e, E>(executor: E, event_id: Uuid) -> Result<(), StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query("DELETE FROM occurrences WHERE event_id = ?1")
        .bind(event_id.to_string())
        .execute(executor)
        .await?;
    Ok(())
}

fn pending_operation_select_sql(predicate: &str) -> String {
    format!(
        r#"
        SELECT id, event_id, operation, status, retry_count, max_retries, next_retry_at,
               last_error, created_at, updated_at, target_url, target_calendar_id,
               source_calendar_id, move_phase, lifetime_reset_at, failed_at
        FROM pending_operations {predicate}
        "#
    )
}

async fn upsert_pending_operation<'e, E>(executor: E, op: &PendingOperation) -> Result<(), StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO pending_operations (
          id, event_id, operation, status, retry_count, max_retries, next_retry_at, last_error,
          created_at, updated_at, target_url, target_calendar_id, source_calendar_id, move_phase,
          lifetime_reset_at, failed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
        ON CONFLICT(id) DO UPDATE SET
          operation = excluded.operation, status = excluded.status,
          retry_count = excluded.retry_count, max_retries = excluded.max_retries,
          next_retry_at = excluded.next_retry_at, last_error = excluded.last_error,
          updated_at = excluded.updated_at, target_url = excluded.target_url,
          target_calendar_id = excluded.target_calendar_id,
          source_calendar_id = excluded.source_calendar_id, move_phase = excluded.move_phase,
          lifetime_reset_at = excluded.lifetime_reset_at, failed_at = excluded.failed_at
        "#,
    )
    .bind(op.id.to_string())
    .bind(op.event_id.to_string())
    .bind(enum_to_text(&op.operation)?)
    .bind(enum_to_text(&op.status)?)
    .bind(op.retry_count as i64)
    .bind(op.max_retries as i64)
    .bind(op.next_retry_at.to_rfc3339())
    .bind(&op.last_error)
    .bind(op.created_at.to_rfc3339())
    .bind(op.updated_at.to_rfc3339())
    .bind(op.target_url.as_ref().map(Url::as_str))
    .bind(op.target_calendar_id.map(|id| id.to_string()))
    .bind(op.source_calendar_id.map(|id| id.to_string()))
    .bind(op.move_phase.map(|phase| phase as i64))
    .bind(op.lifetime_reset_at.to_rfc3339())
    .bind(op.failed_at.map(|dt| dt.to_rfc3339()))
    .execute(executor)
    .await?;
    Ok(())
}

async fn upsert_reminder<'e, E>(executor: E, reminder: &ScheduledReminder) -> Result<(), StorageError>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO scheduled_reminders (
          id, event_id, trigger_time, occurrence_time, reminder_offset, status
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(event_id, occurrence_time, reminder_offset) DO UPDATE SET
          trigger_time = excluded.trigger_time, status = excluded.status
        "#,
    )
    .bind(reminder.id.to_string())
    .bind(reminder.event_id.to_string())
    .bind(reminder.trigger_time.to_rfc3339())
    .bind(reminder.occurrence_time)
    .bind(&reminder.reminder_offset)
    .bind(serde_json::to_string(&reminder.status)?)
    .execute(executor)
    .await?;
    Ok(())
}

// ---- row -> domain mapping ----

fn row_to_account(row: sqlx::sqlite::SqliteRow) -> Result<Account, StorageError> {
    let id_raw: String = row.try_get("id")?;
    let provider_raw: String = row.try_get("provider")?;
    let principal_raw: Option<String> = row.try_get("principal_url")?;
    let home_raw: Option<String> = row.try_get("calendar_home_url")?;
    let last_attempt_raw: Option<String> = row.try_get("last_sync_attempt")?;
    let last_success_raw: Option<String> = row.try_get("last_sync_success")?;
    let created_raw: String = row.try_get("created_at")?;
    let updated_raw: String = row.try_get("updated_at")?;

    Ok(Account {
        id: parse_uuid(&id_raw, "accounts.id")?,
        provider: parse_json(&provider_raw, "accounts.provider")?,
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        principal_url: principal_raw.as_deref().map(parse_url).transpose()?,
        calendar_home_url: home_raw.as_deref().map(parse_url).transpose()?,
        credential_ref: row.try_get("credential_ref")?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        last_sync_attempt: last_attempt_raw
            .as_deref()
            .map(|raw| parse_datetime(raw, "accounts.last_sync_attempt"))
            .transpose()?,
        last_sync_success: last_success_raw
            .as_deref()
            .map(|raw| parse_datetime(raw, "accounts.last_sync_success"))
            .transpose()?,
        consecutive_sync_failures: row.try_get::<i64, _>("consecutive_sync_failures")? as u32,
        created_at: parse_datetime(&created_raw, "accounts.created_at")?,
        updated_at: parse_datetime(&updated_raw, "accounts.updated_at")?,
    })
}

fn row_to_calendar(row: sqlx::sqlite::SqliteRow) -> Result<Calendar, StorageError> {
    let id_raw: String = row.try_get("id")?;
    let account_raw: String = row.try_get("account_id")?;
    let server_raw: Option<String> = row.try_get("server_url")?;
    let created_raw: String = row.try_get("created_at")?;
    let updated_raw: String = row.try_get("updated_at")?;

    Ok(Calendar {
        id: parse_uuid(&id_raw, "calendars.id")?,
        account_id: parse_uuid(&account_raw, "calendars.account_id")?,
        server_url: server_raw.as_deref().map(parse_url).transpose()?,
        display_name: row.try_get("display_name")?,
        color_argb: row.try_get::<i64, _>("color_argb")? as u32,
        read_only: row.try_get::<i64, _>("read_only")? != 0,
        visible: row.try_get::<i64, _>("visible")? != 0,
        is_default: row.try_get::<i64, _>("is_default")? != 0,
        sort_order: row.try_get::<i64, _>("sort_order")? as i32,
        sync_token: row.try_get("sync_token")?,
        ctag: row.try_get("ctag")?,
        created_at: parse_datetime(&created_raw, "calendars.created_at")?,
        updated_at: parse_datetime(&updated_raw, "calendars.updated_at")?,
    })
}

fn row_to_event(row: sqlx::sqlite::SqliteRow) -> Result<Event, StorageError> {
    let id_raw: String = row.try_get("id")?;
    let calendar_raw: String = row.try_get("calendar_id")?;
    let original_event_raw: Option<String> = row.try_get("original_event_id")?;
    let status_raw: String = row.try_get("status")?;
    let transparency_raw: String = row.try_get("transparency")?;
    let classification_raw: String = row.try_get("classification")?;
    let rdate_raw: String = row.try_get("rdate_json")?;
    let exdate_raw: String = row.try_get("exdate_json")?;
    let dtstamp_raw: String = row.try_get("dtstamp")?;
    let reminders_raw: String = row.try_get("reminders_json")?;
    let extra_raw: String = row.try_get("extra_properties_json")?;
    let categories_raw: String = row.try_get("categories_json")?;
    let url_raw: Option<String> = row.try_get("url")?;
    let geo_lat: Option<f64> = row.try_get("geo_lat")?;
    let geo_lon: Option<f64> = row.try_get("geo_lon")?;
    let server_url_raw: Option<String> = row.try_get("server_url")?;
    let sync_status_raw: String = row.try_get("sync_status")?;
    let local_modified_raw: String = row.try_get("local_modified_at")?;
    let server_modified_raw: Option<String> = row.try_get("server_modified_at")?;

    Ok(Event {
        id: parse_uuid(&id_raw, "events.id")?,
        uid: row.try_get("uid")?,
        calendar_id: parse_uuid(&calendar_raw, "events.calendar_id")?,
        original_event_id: original_event_raw
            .as_deref()
            .map(|raw| parse_uuid(raw, "events.original_event_id"))
            .transpose()?,
        original_instance_time: row.try_get("original_instance_time")?,
        title: row.try_get("title")?,
        location: row.try_get("location")?,
        description: row.try_get("description")?,
        start_ts: row.try_get("start_ts")?,
        end_ts: row.try_get("end_ts")?,
        timezone: row.try_get("timezone")?,
        all_day: row.try_get::<i64, _>("all_day")? != 0,
        status: parse_json::<EventStatus>(&status_raw, "events.status")?,
        transparency: parse_json::<Transparency>(&transparency_raw, "events.transparency")?,
        classification: parse_json::<Classification>(&classification_raw, "events.classification")?,
        organizer: row.try_get("organizer")?,
        rrule: row.try_get("rrule")?,
        rdate: parse_json(&rdate_raw, "events.rdate_json")?,
        exdate: parse_json(&exdate_raw, "events.exdate_json")?,
        duration: row.try_get("duration")?,
        dtstamp: parse_datetime(&dtstamp_raw, "events.dtstamp")?,
        reminders: parse_json(&reminders_raw, "events.reminders_json")?,
        extra_properties: parse_json(&extra_raw, "events.extra_properties_json")?,
        categories: parse_json(&categories_raw, "events.categories_json")?,
        priority: row.try_get::<i64, _>("priority")? as u8,
        url: url_raw.as_deref().map(parse_url).transpose()?,
        color: row.try_get::<Option<i64>, _>("color")?.map(|c| c as u32),
        geo: geo_lat.zip(geo_lon),
        server_url: server_url_raw.as_deref().map(parse_url).transpose()?,
        etag: row.try_get("etag")?,
        sequence: row.try_get("sequence")?,
        sync_status: parse_json::<SyncStatus>(&sync_status_raw, "events.sync_status")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        last_sync_error: row.try_get("last_sync_error")?,
        local_modified_at: parse_datetime(&local_modified_raw, "events.local_modified_at")?,
        server_modified_at: server_modified_raw
            .as_deref()
            .map(|raw| parse_datetime(raw, "events.server_modified_at"))
            .transpose()?,
    })
}

fn row_to_occurrence(row: sqlx::sqlite::SqliteRow) -> Result<Occurrence, StorageError> {
    let id_raw: String = row.try_get("id")?;
    let event_raw: String = row.try_get("event_id")?;
    let calendar_raw: String = row.try_get("calendar_id")?;
    let exception_raw: Option<String> = row.try_get("exception_event_id")?;

    Ok(Occurrence {
        id: parse_uuid(&id_raw, "occurrences.id")?,
        event_id: parse_uuid(&event_raw, "occurrences.event_id")?,
        calendar_id: parse_uuid(&calendar_raw, "occurrences.calendar_id")?,
        start_ts: row.try_get("start_ts")?,
        end_ts: row.try_get("end_ts")?,
        start_day: row.try_get("start_day")?,
        end_day: row.try_get("end_day")?,
        is_cancelled: row.try_get::<i64, _>("is_cancelled")? != 0,
        exception_event_id: exception_raw
            .as_deref()
            .map(|raw| parse_uuid(raw, "occurrences.exception_event_id"))
            .transpose()?,
    })
}

fn row_to_pending_operation(row: sqlx::sqlite::SqliteRow) -> Result<PendingOperation, StorageError> {
    let id_raw: String = row.try_get("id")?;
    let event_raw: String = row.try_get("event_id")?;
    let operation_raw: String = row.try_get("operation")?;
    let status_raw: String = row.try_get("status")?;
    let next_retry_raw: String = row.try_get("next_retry_at")?;
    let created_raw: String = row.try_get("created_at")?;
    let updated_raw: String = row.try_get("updated_at")?;
    let target_url_raw: Option<String> = row.try_get("target_url")?;
    let target_calendar_raw: Option<String> = row.try_get("target_calendar_id")?;
    let source_calendar_raw: Option<String> = row.try_get("source_calendar_id")?;
    let move_phase_raw: Option<i64> = row.try_get("move_phase")?;
    let lifetime_reset_raw: String = row.try_get("lifetime_reset_at")?;
    let failed_at_raw: Option<String> = row.try_get("failed_at")?;

    Ok(PendingOperation {
        id: parse_uuid(&id_raw, "pending_operations.id")?,
        event_id: parse_uuid(&event_raw, "pending_operations.event_id")?,
        operation: parse_enum::<OperationKind>(&operation_raw, "pending_operations.operation")?,
        status: parse_enum::<OperationStatus>(&status_raw, "pending_operations.status")?,
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        max_retries: row.try_get::<i64, _>("max_retries")? as u32,
        next_retry_at: parse_datetime(&next_retry_raw, "pending_operations.next_retry_at")?,
        last_error: row.try_get("last_error")?,
        created_at: parse_datetime(&created_raw, "pending_operations.created_at")?,
        updated_at: parse_datetime(&updated_raw, "pending_operations.updated_at")?,
        target_url: target_url_raw.as_deref().map(parse_url).transpose()?,
        target_calendar_id: target_calendar_raw
            .as_deref()
            .map(|raw| parse_uuid(raw, "pending_operations.target_calendar_id"))
            .transpose()?,
        source_calendar_id: source_calendar_raw
            .as_deref()
            .map(|raw| parse_uuid(raw, "pending_operations.source_calendar_id"))
            .transpose()?,
        move_phase: move_phase_raw.map(|raw| match raw {
            0 => MovePhase::Delete,
            _ => MovePhase::Create,
        }),
        lifetime_reset_at: parse_datetime(&lifetime_reset_raw, "pending_operations.lifetime_reset_at")?,
        failed_at: failed_at_raw
            .as_deref()
            .map(|raw| parse_datetime(raw, "pending_operations.failed_at"))
            .transpose()?,
    })
}

fn row_to_reminder(row: sqlx::sqlite::SqliteRow) -> Result<ScheduledReminder, StorageError> {
    let id_raw: String = row.try_get("id")?;
    let event_raw: String = row.try_get("event_id")?;
    let trigger_raw: String = row.try_get("trigger_time")?;
    let status_raw: String = row.try_get("status")?;

    Ok(ScheduledReminder {
        id: parse_uuid(&id_raw, "scheduled_reminders.id")?,
        event_id: parse_uuid(&event_raw, "scheduled_reminders.event_id")?,
        trigger_time: parse_datetime(&trigger_raw, "scheduled_reminders.trigger_time")?,
        occurrence_time: row.try_get("occurrence_time")?,
        reminder_offset: row.try_get("reminder_offset")?,
        status: parse_json::<ReminderStatus>(&status_raw, "scheduled_reminders.status")?,
    })
}

fn parse_uuid(raw: &str, field: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(raw).map_err(|err| StorageError::Data(format!("invalid uuid for {field}: {err}")))
}

fn parse_datetime(raw: &str, field: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StorageError::Data(format!("invalid datetime for {field}: {err}")))
}

fn parse_url(raw: &str) -> Result<Url, StorageError> {
    Url::parse(raw).map_err(|err| StorageError::Data(format!("invalid url: {err}")))
}

fn parse_json<T>(raw: &str, field: &str) -> Result<T, StorageError>
where
    T: DeserializeOwned,
{
    serde_json::from_str(raw).map_err(|err| StorageError::Data(format!("invalid json for {field}: {err}")))
}

/// Serializes a unit-variant enum to its bare snake_case text (no surrounding
/// quotes), so the column can be compared against a plain SQL string literal
/// such as `status = 'pending'`.
fn enum_to_text<T: serde::Serialize>(value: &T) -> Result<String, StorageError> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(text) => Ok(text),
        other => Err(StorageError::Data(format!("expected a string-like enum, got {other}"))),
    }
}

fn parse_enum<T>(raw: &str, field: &str) -> Result<T, StorageError>
where
    T: DeserializeOwned,
{
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|err| StorageError::Data(format!("invalid value for {field}: {err}")))
}
