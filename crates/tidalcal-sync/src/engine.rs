//! Top-level `SyncEngine`: owns the pull/push/queue lifecycle and the
//! "one mailbox per account" scheduling model. Grounded on the teacher's
//! per-account IMAP IDLE task (`cove-email::backend::start_idle_imap`, one
//! long-lived task per mailbox) and the `run_sync_queue` worker-pool command
//! in `src-tauri/commands.rs` (per-account concurrency gating), generalized
//! here to one `tokio` task per enabled calendar account processing an
//! `mpsc` channel of sync requests sequentially.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use tidalcal_core::{Account, CalDavClient, Clock, Provider, ReminderSink};
use tidalcal_storage::Store;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::{pull, push, queue};

/// Constants fixed by the algorithms this engine drives; overridable for
/// tests so retry/backoff timing stays deterministic.
#[derive(Debug, Clone)]
pub struct SyncEngineConfig {
    pub occurrence_window_days: i64,
    pub max_retries_per_phase: u32,
    pub backoff_base_secs: i64,
    pub backoff_cap_secs: i64,
    pub stale_in_progress_after: Duration,
    pub auto_reset_failed_after: Duration,
    pub lifetime_limit: Duration,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            occurrence_window_days: 730,
            max_retries_per_phase: 10,
            backoff_base_secs: 30,
            backoff_cap_secs: 5 * 3_600,
            stale_in_progress_after: Duration::hours(1),
            auto_reset_failed_after: Duration::hours(24),
            lifetime_limit: Duration::days(30),
        }
    }
}

/// A request dispatched into one account's mailbox.
enum SyncRequest {
    Run,
    Shutdown,
}

struct Mailbox {
    sender: mpsc::Sender<SyncRequest>,
    handle: JoinHandle<()>,
}

/// Owns C4 (pull), C5 (push) and C6 (queue) for every enabled account. No
/// shared mutable state beyond the store itself: each account's mailbox task
/// processes its requests strictly sequentially, so cross-account
/// concurrency is just "one task per account" with no locking.
pub struct SyncEngine {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    client: Arc<dyn CalDavClient>,
    reminders: Arc<dyn ReminderSink>,
    config: SyncEngineConfig,
    mailboxes: Mutex<HashMap<Uuid, Mailbox>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        client: Arc<dyn CalDavClient>,
        reminders: Arc<dyn ReminderSink>,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            client,
            reminders,
            config,
            mailboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Crash recovery + spawning a mailbox task for every enabled account.
    /// Call once at startup.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SyncError> {
        let now = self.clock.now();
        let reset = queue::reset_stale_in_progress(&self.store, now).await?;
        if reset > 0 {
            warn!(count = reset, "reset stale in-progress operations at startup");
        }
        queue::auto_reset_old_failed(&self.store, now).await?;

        let accounts = self.store.list_enabled_accounts().await?;
        let mut mailboxes = self.mailboxes.lock().await;
        for account in accounts {
            self.spawn_mailbox(&mut mailboxes, account);
        }
        Ok(())
    }

    fn spawn_mailbox(&self, mailboxes: &mut HashMap<Uuid, Mailbox>, account: Account) {
        if mailboxes.contains_key(&account.id) {
            return;
        }
        let (tx, rx) = mpsc::channel(8);
        let store = self.store.clone();
        let clock = self.clock.clone();
        let client = self.client.clone();
        let account_id = account.id;

        let handle = tokio::spawn(run_mailbox(store, clock, client, account, rx));
        mailboxes.insert(account_id, Mailbox { sender: tx, handle });
    }

    /// Registers a newly-created account's mailbox task.
    pub async fn register_account(&self, account: Account) {
        let mut mailboxes = self.mailboxes.lock().await;
        self.spawn_mailbox(&mut mailboxes, account);
    }

    /// Requests an out-of-band sync for one account; the request is queued
    /// behind whatever that account's mailbox is already processing.
    pub async fn request_sync(&self, account_id: Uuid) -> Result<(), SyncError> {
        let mailboxes = self.mailboxes.lock().await;
        let Some(mailbox) = mailboxes.get(&account_id) else {
            return Err(SyncError::Validation(format!("no mailbox for account {account_id}")));
        };
        let _ = mailbox.sender.send(SyncRequest::Run).await;
        Ok(())
    }

    /// Triggers a sync pass on every enabled account's mailbox.
    pub async fn sync_all(&self) {
        let mailboxes = self.mailboxes.lock().await;
        for mailbox in mailboxes.values() {
            let _ = mailbox.sender.send(SyncRequest::Run).await;
        }
    }

    /// Account deletion sequence (§5, ordered and atomic):
    /// (1) stop the account's mailbox so no further sync touches it,
    /// (2) cancel every reminder for every event in its calendars,
    /// (3)-(4) delete its pending operations and cascade-delete the row.
    #[instrument(skip(self))]
    pub async fn delete_account(&self, account_id: Uuid) -> Result<(), SyncError> {
        {
            let mut mailboxes = self.mailboxes.lock().await;
            if let Some(mailbox) = mailboxes.remove(&account_id) {
                let _ = mailbox.sender.send(SyncRequest::Shutdown).await;
                mailbox.handle.abort();
            }
        }

        let calendars = self.store.list_calendars_for_account(account_id).await?;
        for calendar in calendars {
            let events = self.store.list_events_for_calendar(calendar.id).await?;
            for event in events {
                if let Err(err) = self.reminders.cancel_for_event(event.id).await {
                    warn!(error = %err, event_id = %event.id, "reminder cancellation failed during account deletion, continuing");
                }
            }
        }

        self.store.delete_account_cascade(account_id).await?;
        Ok(())
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }
}

/// One account's serialized pull -> push -> queue-maintenance cycle.
async fn run_mailbox(
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    client: Arc<dyn CalDavClient>,
    account: Account,
    mut requests: mpsc::Receiver<SyncRequest>,
) {
    info!(account_id = %account.id, email = %account.email, "mailbox task started");
    while let Some(request) = requests.recv().await {
        match request {
            SyncRequest::Shutdown => break,
            SyncRequest::Run => {
                if let Err(err) = sync_account(&store, clock.as_ref(), client.as_ref(), &account).await {
                    error!(account_id = %account.id, error = %err, "account sync failed");
                }
            }
        }
    }
    info!(account_id = %account.id, "mailbox task stopped");
}

#[instrument(skip(store, clock, client), fields(account_id = %account.id))]
async fn sync_account(store: &Store, clock: &dyn Clock, client: &dyn CalDavClient, account: &Account) -> Result<(), SyncError> {
    let now = clock.now();
    let calendars = store.list_calendars_for_account(account.id).await?;

    if matches!(account.provider, Provider::CalDav | Provider::ICloud) {
        if let Some(home_url) = account.calendar_home_url.clone() {
            for calendar in calendars.iter().filter(|c| !c.read_only) {
                if let Err(err) = pull::pull_calendar(store, client, calendar.clone(), &home_url).await {
                    warn!(calendar_id = %calendar.id, error = %err, "pull failed for calendar, continuing with others");
                }
            }
        }

        if let Err(err) = push::drain(store, client, now).await {
            warn!(account_id = %account.id, error = %err, "push drain failed");
        }
    }

    queue::reset_stale_in_progress(store, now).await?;
    queue::auto_reset_old_failed(store, now).await?;

    store.record_sync_attempt(account.id, now, true).await?;
    Ok(())
}

/// A periodic driver an application embeds to call `sync_all` on an
/// interval; kept separate from `SyncEngine` so tests can drive syncs
/// on demand without a timer.
pub async fn run_periodic(engine: Arc<SyncEngine>, interval: StdDuration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        engine.sync_all().await;
    }
}
