//! Push Strategy (C5): drains `PendingOperation`s FIFO and dispatches each
//! against the abstract `CalDavClient`. Grounded on the same
//! `mxschll-kitchen-fridge::Provider` commit-phase shape as the pull side
//! (`commit_item_changes` applying one classified change at a time and
//! updating sync status from the server's response), generalized to this
//! spec's CREATE/UPDATE/DELETE/MOVE dispatch and two-phase MOVE budgets.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tidalcal_core::{CalDavClient, CalDavError, Event, MovePhase, OperationKind, PendingOperation, SyncStatus};
use tidalcal_storage::Store;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::{ics_codec, queue};

#[derive(Debug, Default)]
pub struct PushSummary {
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Drains every ready operation once, FIFO by createdAt (the order
/// `get_ready_operations` already returns).
#[instrument(skip(store, client))]
pub async fn drain(store: &Store, client: &dyn CalDavClient, now: DateTime<Utc>) -> Result<PushSummary, SyncError> {
    let ready = queue::get_ready_operations(store, now).await?;
    if ready.is_empty() {
        return Ok(PushSummary::default());
    }

    let event_ids: Vec<Uuid> = ready.iter().map(|op| op.event_id).collect();
    let events: HashMap<Uuid, Event> = store
        .list_events_by_ids(&event_ids)
        .await?
        .into_iter()
        .map(|e| (e.id, e))
        .collect();

    let mut summary = PushSummary::default();
    for op in ready {
        queue::mark_in_progress(store, op.id, now).await?;

        let Some(event) = events.get(&op.event_id) else {
            // event vanished locally; the operation has nothing left to act on
            store.delete_pending_operation(op.id).await?;
            continue;
        };

        if !event.is_master() {
            // exceptions are never pushed individually, their master's UPDATE carries them
            store.delete_pending_operation(op.id).await?;
            continue;
        }

        match dispatch(store, client, &op, event, now).await {
            Ok(DispatchOutcome::Succeeded) => summary.succeeded += 1,
            Ok(DispatchOutcome::Retried) => summary.retried += 1,
            Ok(DispatchOutcome::Failed) => summary.failed += 1,
            Err(err) => {
                warn!(error = %err, operation_id = %op.id, "push dispatch failed unexpectedly");
                queue::schedule_retry(store, op.id, &err.to_string(), now).await?;
                summary.retried += 1;
            }
        }
    }

    Ok(summary)
}

/// Outcome of dispatching a single operation once.
enum DispatchOutcome {
    /// Operation consumed, reflected on the server.
    Succeeded,
    /// Still pending: backoff scheduled, or an in-place CREATE conversion.
    Retried,
    /// Non-retryable error (e.g. auth); operation parked as FAILED.
    Failed,
}

async fn dispatch(store: &Store, client: &dyn CalDavClient, op: &PendingOperation, master: &Event, now: DateTime<Utc>) -> Result<DispatchOutcome, SyncError> {
    match op.operation {
        OperationKind::Create => dispatch_create(store, client, op, master, now).await,
        OperationKind::Update => dispatch_update(store, client, op, master, now).await,
        OperationKind::Delete => dispatch_delete(store, client, op, master, now).await,
        OperationKind::Move => dispatch_move(store, client, op, master, now).await,
    }
}

async fn dispatch_create(store: &Store, client: &dyn CalDavClient, op: &PendingOperation, master: &Event, now: DateTime<Utc>) -> Result<DispatchOutcome, SyncError> {
    let Some(calendar) = store.get_calendar(master.calendar_id).await? else {
        return classify_and_retry(store, op.id, &CalDavError::Server("calendar missing".into()), now).await;
    };
    let Some(calendar_url) = calendar.server_url.clone() else {
        return classify_and_retry(store, op.id, &CalDavError::Server("calendar has no server url".into()), now).await;
    };

    let exceptions = store.list_exceptions_for_master(master.id).await?;
    let body = ics_codec::render_resource(master, &exceptions);

    match client.create_event(&calendar_url, &master.uid, &body).await {
        Ok((resource_url, etag)) => {
            persist_success(store, master, &exceptions, Some(resource_url), etag, SyncStatus::Synced).await?;
            store.delete_pending_operation(op.id).await?;
            Ok(DispatchOutcome::Succeeded)
        }
        Err(err) => classify_and_retry(store, op.id, &err, now).await,
    }
}

async fn dispatch_update(store: &Store, client: &dyn CalDavClient, op: &PendingOperation, master: &Event, now: DateTime<Utc>) -> Result<DispatchOutcome, SyncError> {
    let Some(server_url) = master.server_url.clone() else {
        // never actually created on the server; fall back to CREATE
        return dispatch_create(store, client, op, master, now).await;
    };
    let etag = master.etag.clone().unwrap_or_default();
    let exceptions = store.list_exceptions_for_master(master.id).await?;
    let body = ics_codec::render_resource(master, &exceptions);

    match client.update_event(&server_url, &body, &etag).await {
        Ok(new_etag) => {
            persist_success(store, master, &exceptions, Some(server_url), new_etag, SyncStatus::Synced).await?;
            store.delete_pending_operation(op.id).await?;
            Ok(DispatchOutcome::Succeeded)
        }
        Err(CalDavError::NotFound) => {
            // the resource is gone server-side; recover by converting to CREATE in place
            let mut reset = master.clone();
            reset.server_url = None;
            reset.etag = None;
            store.upsert_event(&reset).await?;
            let mut create_op = op.clone();
            create_op.operation = OperationKind::Create;
            create_op.retry_count = 0;
            create_op.next_retry_at = now;
            create_op.target_url = None;
            store.upsert_pending_operation(&create_op).await?;
            Ok(DispatchOutcome::Retried)
        }
        Err(err) => classify_and_retry(store, op.id, &err, now).await,
    }
}

async fn dispatch_delete(store: &Store, client: &dyn CalDavClient, op: &PendingOperation, master: &Event, now: DateTime<Utc>) -> Result<DispatchOutcome, SyncError> {
    let Some(server_url) = op.target_url.clone().or_else(|| master.server_url.clone()) else {
        store.delete_pending_operation(op.id).await?;
        store.delete_event(master.id).await?;
        return Ok(DispatchOutcome::Succeeded);
    };
    let etag = master.etag.clone().unwrap_or_default();

    match client.delete_event(&server_url, &etag).await {
        Ok(()) | Err(CalDavError::NotFound) => {
            store.delete_pending_operation(op.id).await?;
            store.delete_event(master.id).await?;
            Ok(DispatchOutcome::Succeeded)
        }
        Err(err) => classify_and_retry(store, op.id, &err, now).await,
    }
}

async fn dispatch_move(store: &Store, client: &dyn CalDavClient, op: &PendingOperation, master: &Event, now: DateTime<Utc>) -> Result<DispatchOutcome, SyncError> {
    match op.move_phase.unwrap_or(MovePhase::Delete) {
        MovePhase::Delete => {
            let Some(old_url) = op.target_url.clone() else {
                queue::advance_to_create_phase(store, op.id, now).await?;
                return Ok(DispatchOutcome::Retried);
            };
            let etag = master.etag.clone().unwrap_or_default();
            match client.delete_event(&old_url, &etag).await {
                Ok(()) | Err(CalDavError::NotFound) => {
                    queue::advance_to_create_phase(store, op.id, now).await?;
                    Ok(DispatchOutcome::Retried)
                }
                Err(err) => classify_and_retry(store, op.id, &err, now).await,
            }
        }
        MovePhase::Create => {
            let Some(target_calendar_id) = op.target_calendar_id else {
                return Err(SyncError::Validation("MOVE create phase missing target calendar".to_string()));
            };
            let Some(calendar) = store.get_calendar(target_calendar_id).await? else {
                return classify_and_retry(store, op.id, &CalDavError::Server("target calendar missing".into()), now).await;
            };
            let Some(calendar_url) = calendar.server_url.clone() else {
                return classify_and_retry(store, op.id, &CalDavError::Server("target calendar has no server url".into()), now).await;
            };
            let exceptions = store.list_exceptions_for_master(master.id).await?;
            let body = ics_codec::render_resource(master, &exceptions);

            match client.create_event(&calendar_url, &master.uid, &body).await {
                Ok((resource_url, etag)) => {
                    persist_success(store, master, &exceptions, Some(resource_url), etag, SyncStatus::Synced).await?;
                    store.delete_pending_operation(op.id).await?;
                    Ok(DispatchOutcome::Succeeded)
                }
                Err(err) => classify_and_retry(store, op.id, &err, now).await,
            }
        }
    }
}

async fn persist_success(
    store: &Store,
    master: &Event,
    exceptions: &[Event],
    server_url: Option<url::Url>,
    etag: String,
    sync_status: SyncStatus,
) -> Result<(), SyncError> {
    let mut updated_master = master.clone();
    updated_master.server_url = server_url;
    updated_master.etag = Some(etag.clone());
    updated_master.sync_status = sync_status;
    store.upsert_event(&updated_master).await?;

    for exception in exceptions {
        let mut updated = exception.clone();
        updated.etag = Some(etag.clone());
        store.upsert_event(&updated).await?;
    }
    Ok(())
}

/// Authentication failures are non-retryable; everything else (network,
/// server, conflict) gets exponential backoff up to `maxRetries`.
async fn classify_and_retry(store: &Store, op_id: Uuid, error: &CalDavError, now: DateTime<Utc>) -> Result<DispatchOutcome, SyncError> {
    match error {
        CalDavError::Auth => {
            queue::mark_failed(store, op_id, "authentication failed", now).await?;
            Ok(DispatchOutcome::Failed)
        }
        CalDavError::Conflict(detail) => {
            queue::schedule_retry(store, op_id, &format!("Conflict: {detail}"), now).await?;
            Ok(DispatchOutcome::Retried)
        }
        other => {
            queue::schedule_retry(store, op_id, &other.to_string(), now).await?;
            Ok(DispatchOutcome::Retried)
        }
    }
}
