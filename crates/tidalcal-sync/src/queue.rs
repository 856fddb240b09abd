//! Pending-operation retry/backoff lifecycle (C6). Shaped after the
//! teacher's `SyncJob` (attempt_count/max_attempts/run_after/last_error) in
//! `cove-core::model`, generalized to the two-phase MOVE lifecycle and the
//! auto-reset/abandonment windows this spec adds.

use chrono::{DateTime, Duration, Utc};
use tidalcal_core::{MovePhase, OperationKind, OperationStatus, PendingOperation};
use tidalcal_storage::Store;
use uuid::Uuid;

use crate::error::SyncError;

const BACKOFF_BASE_SECS: i64 = 30;
const BACKOFF_CAP_SECS: i64 = 5 * 3_600;
const STALE_IN_PROGRESS_AFTER: Duration = Duration::hours(1);
const AUTO_RESET_FAILED_AFTER: Duration = Duration::hours(24);
const LIFETIME_LIMIT: Duration = Duration::days(30);

/// `min(30s * 2^retryCount, 5h)`.
pub fn calculate_retry_delay(retry_count: u32) -> Duration {
    let exp = 2i64.saturating_pow(retry_count.min(20));
    let seconds = (BACKOFF_BASE_SECS.saturating_mul(exp)).min(BACKOFF_CAP_SECS);
    Duration::seconds(seconds)
}

/// Deduplicates by (eventId, operation) among non-FAILED rows, consolidating
/// an existing CREATE with an incoming UPDATE into CREATE-only.
pub async fn enqueue(store: &Store, mut op: PendingOperation) -> Result<PendingOperation, SyncError> {
    if op.operation == OperationKind::Update {
        if let Some(existing_create) = store.find_pending_operation(op.event_id, OperationKind::Create).await? {
            return Ok(existing_create);
        }
    }

    if let Some(existing) = store.find_pending_operation(op.event_id, op.operation).await? {
        return Ok(existing);
    }

    op.status = OperationStatus::Pending;
    store.upsert_pending_operation(&op).await?;
    Ok(op)
}

pub async fn get_ready_operations(store: &Store, now: DateTime<Utc>) -> Result<Vec<PendingOperation>, SyncError> {
    Ok(store.get_ready_operations(now).await?)
}

pub async fn mark_in_progress(store: &Store, op_id: Uuid, now: DateTime<Utc>) -> Result<(), SyncError> {
    let Some(mut op) = store.get_pending_operation(op_id).await? else {
        return Err(SyncError::Validation(format!("pending operation {op_id} not found")));
    };
    op.status = OperationStatus::InProgress;
    op.updated_at = now;
    store.upsert_pending_operation(&op).await?;
    Ok(())
}

/// Schedules a retry with exponential backoff, capping at `maxRetries`
/// (then FAILED, recording `failedAt`).
pub async fn schedule_retry(store: &Store, op_id: Uuid, error: &str, now: DateTime<Utc>) -> Result<PendingOperation, SyncError> {
    let Some(mut op) = store.get_pending_operation(op_id).await? else {
        return Err(SyncError::Validation(format!("pending operation {op_id} not found")));
    };

    op.retry_count += 1;
    op.last_error = Some(error.to_string());
    op.updated_at = now;

    if op.retry_count >= op.max_retries {
        op.status = OperationStatus::Failed;
        op.failed_at = Some(now);
    } else {
        op.status = OperationStatus::Pending;
        op.next_retry_at = now + calculate_retry_delay(op.retry_count);
    }

    store.upsert_pending_operation(&op).await?;
    Ok(op)
}

pub async fn mark_failed(store: &Store, op_id: Uuid, error: &str, now: DateTime<Utc>) -> Result<PendingOperation, SyncError> {
    let Some(mut op) = store.get_pending_operation(op_id).await? else {
        return Err(SyncError::Validation(format!("pending operation {op_id} not found")));
    };
    op.status = OperationStatus::Failed;
    op.last_error = Some(error.to_string());
    op.failed_at = Some(now);
    op.updated_at = now;
    store.upsert_pending_operation(&op).await?;
    Ok(op)
}

/// MOVE phase transition: DELETE succeeded, switch to CREATE with a fresh
/// retry budget independent of the DELETE phase's retry count.
pub async fn advance_to_create_phase(store: &Store, op_id: Uuid, now: DateTime<Utc>) -> Result<PendingOperation, SyncError> {
    let Some(mut op) = store.get_pending_operation(op_id).await? else {
        return Err(SyncError::Validation(format!("pending operation {op_id} not found")));
    };
    op.move_phase = Some(MovePhase::Create);
    op.retry_count = 0;
    op.status = OperationStatus::Pending;
    op.next_retry_at = now;
    op.last_error = None;
    op.updated_at = now;
    store.upsert_pending_operation(&op).await?;
    Ok(op)
}

/// Crash recovery: any IN_PROGRESS row stuck past `cutoff` is returned to
/// PENDING so the next drain picks it back up.
pub async fn reset_stale_in_progress(store: &Store, now: DateTime<Utc>) -> Result<usize, SyncError> {
    let cutoff = now - STALE_IN_PROGRESS_AFTER;
    let stale = store.get_stale_in_progress(cutoff).await?;
    let count = stale.len();
    for mut op in stale {
        op.status = OperationStatus::Pending;
        op.updated_at = now;
        store.upsert_pending_operation(&op).await?;
    }
    Ok(count)
}

/// Resets eligible FAILED rows to PENDING. Does not touch
/// `sourceCalendarId` — a revived MOVE still needs it to retry the DELETE
/// phase against the original calendar.
pub async fn auto_reset_old_failed(store: &Store, now: DateTime<Utc>) -> Result<usize, SyncError> {
    let failed_before = now - AUTO_RESET_FAILED_AFTER;
    let lifetime_cutoff = now - LIFETIME_LIMIT;

    let candidates = store.get_old_failed(failed_before).await?;
    let mut reset_count = 0;
    for mut op in candidates {
        if op.lifetime_reset_at <= lifetime_cutoff {
            continue;
        }
        op.status = OperationStatus::Pending;
        op.retry_count = 0;
        op.next_retry_at = now;
        op.failed_at = None;
        op.updated_at = now;
        store.upsert_pending_operation(&op).await?;
        reset_count += 1;
    }
    Ok(reset_count)
}

pub async fn get_expired_operations(store: &Store, now: DateTime<Utc>) -> Result<Vec<PendingOperation>, SyncError> {
    let cutoff = now - LIFETIME_LIMIT;
    Ok(store.get_expired_operations(cutoff).await?)
}

/// Extends the 30-day abandonment window on user interaction with the event.
pub async fn refresh_operation_lifetime(store: &Store, event_id: Uuid, now: DateTime<Utc>) -> Result<(), SyncError> {
    for mut op in store.list_pending_operations_for_event(event_id).await? {
        op.lifetime_reset_at = now;
        op.updated_at = now;
        store.upsert_pending_operation(&op).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_monotone_and_capped() {
        let mut previous = Duration::zero();
        for n in 0..15 {
            let delay = calculate_retry_delay(n);
            assert!(delay >= previous);
            assert!(delay <= Duration::hours(5));
            previous = delay;
        }
    }

    #[test]
    fn backoff_matches_literal_formula_before_cap() {
        assert_eq!(calculate_retry_delay(0), Duration::seconds(30));
        assert_eq!(calculate_retry_delay(1), Duration::seconds(60));
        assert_eq!(calculate_retry_delay(3), Duration::seconds(240));
    }

    #[tokio::test]
    async fn enqueue_consolidates_create_and_update() {
        let store = Store::connect_in_memory().await.unwrap();
        let event_id = Uuid::new_v4();
        let now = Utc::now();

        let create = PendingOperation {
            id: Uuid::new_v4(),
            event_id,
            operation: OperationKind::Create,
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
        let create = enqueue(&store, create).await.unwrap();

        let mut update = create.clone();
        update.id = Uuid::new_v4();
        update.operation = OperationKind::Update;
        let resolved = enqueue(&store, update).await.unwrap();

        assert_eq!(resolved.id, create.id);
        assert_eq!(resolved.operation, OperationKind::Create);
        assert!(store.find_pending_operation(event_id, OperationKind::Update).await.unwrap().is_none());
    }
}
