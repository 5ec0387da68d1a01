//! Background processor
//!
//! Periodically loads a user's unresolved records and drives each one
//! a step toward terminal. Per-record concurrency is bounded to one by
//! a `<kind>-<record id>` task scope; cross-record drives run in
//! parallel. Polling cadence adapts to record age, and storage change
//! notifications invalidate the read cache between polls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use agicash_common::database::{Database, RecordKind};
use agicash_common::records::{
    CashuReceiveQuote, CashuSendQuote, CashuSendSwap, CashuTokenSwap, SparkReceiveQuote,
    SparkSendQuote,
};
use agicash_common::util::unix_time;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use uuid::Uuid;

mod cache;
mod scope;

pub use cache::VersionedCache;
pub use scope::TaskScope;

use crate::receive::{CashuReceiveService, SparkReceiveService};
use crate::send::{CashuSendService, SparkSendService};
use crate::swap::{SendSwapService, TokenSwapService};

/// Base tick of the scheduler; individual records are driven at their
/// age-adaptive cadence on top of it.
const TICK: Duration = Duration::from_secs(1);

/// Poll interval for a record created `age_secs` ago
pub fn poll_interval(age_secs: u64) -> Duration {
    match age_secs {
        0..=299 => Duration::from_secs(1),
        300..=599 => Duration::from_secs(5),
        600..=3599 => Duration::from_secs(30),
        _ => Duration::from_secs(60),
    }
}

/// The engines the processor drives
#[derive(Debug, Clone)]
pub struct Engines {
    /// Cashu receive engine
    pub cashu_receive: CashuReceiveService,
    /// Spark receive engine
    pub spark_receive: SparkReceiveService,
    /// Cashu send engine
    pub cashu_send: CashuSendService,
    /// Spark send engine
    pub spark_send: SparkSendService,
    /// Token swap engine
    pub token_swaps: TokenSwapService,
    /// Send swap engine
    pub send_swaps: SendSwapService,
}

/// Read caches the processor maintains for UI reads
#[derive(Debug, Default)]
pub struct RecordCaches {
    /// Cashu receive quotes
    pub cashu_receive: VersionedCache<CashuReceiveQuote>,
    /// Spark receive quotes
    pub spark_receive: VersionedCache<SparkReceiveQuote>,
    /// Cashu send quotes
    pub cashu_send: VersionedCache<CashuSendQuote>,
    /// Spark send quotes
    pub spark_send: VersionedCache<SparkSendQuote>,
    /// Token swaps
    pub token_swaps: VersionedCache<CashuTokenSwap>,
    /// Send swaps
    pub send_swaps: VersionedCache<CashuSendSwap>,
}

/// Background processor for one user's unresolved records
#[derive(Debug)]
pub struct BackgroundProcessor {
    db: Arc<dyn Database>,
    engines: Engines,
    scope: TaskScope,
    caches: Arc<RecordCaches>,
    cancel: CancellationToken,
    next_due: Mutex<HashMap<String, tokio::time::Instant>>,
}

impl BackgroundProcessor {
    /// New processor
    pub fn new(db: Arc<dyn Database>, engines: Engines) -> Self {
        Self {
            db,
            engines,
            scope: TaskScope::new(),
            caches: Arc::new(RecordCaches::default()),
            cancel: CancellationToken::new(),
            next_due: Mutex::new(HashMap::new()),
        }
    }

    /// The read caches, for UI consumption
    pub fn caches(&self) -> Arc<RecordCaches> {
        self.caches.clone()
    }

    /// Token cancelling the run loop and in-flight polls
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run until cancelled: drain change notifications, then drive
    /// every unresolved record whose cadence is due.
    #[instrument(skip(self))]
    pub async fn run(&self, user_id: &str) {
        let mut changes = self.db.subscribe_changes();

        loop {
            // Change notifications short-circuit polls by dropping the
            // cached entry for the affected id
            while let Ok(change) = changes.try_recv() {
                self.invalidate(change.kind, change.id);
            }

            if let Err(err) = self.tick(user_id).await {
                tracing::warn!("processor tick failed: {err}");
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(TICK) => {}
            }
        }
    }

    fn invalidate(&self, kind: RecordKind, id: Uuid) {
        match kind {
            RecordKind::CashuReceiveQuote => self.caches.cashu_receive.invalidate(id),
            RecordKind::SparkReceiveQuote => self.caches.spark_receive.invalidate(id),
            RecordKind::CashuSendQuote => self.caches.cashu_send.invalidate(id),
            RecordKind::SparkSendQuote => self.caches.spark_send.invalidate(id),
            RecordKind::CashuTokenSwap => self.caches.token_swaps.invalidate(id),
            RecordKind::CashuSendSwap => self.caches.send_swaps.invalidate(id),
            RecordKind::Account | RecordKind::Proof => {}
        }
    }

    async fn is_due(&self, key: &str, created_at: u64) -> bool {
        let now = tokio::time::Instant::now();
        let mut next_due = self.next_due.lock().await;
        match next_due.get(key) {
            Some(due) if *due > now => false,
            _ => {
                let age = unix_time().saturating_sub(created_at);
                next_due.insert(key.to_string(), now + poll_interval(age));
                true
            }
        }
    }

    /// One scheduling pass: drive every due unresolved record of the
    /// user. Each record is driven under its scope key, so a pass
    /// overlapping an unfinished drive skips that record.
    pub async fn tick(&self, user_id: &str) -> Result<(), agicash_common::Error> {
        for quote in self
            .db
            .list_unresolved_cashu_receive_quotes(user_id)
            .await?
        {
            let key = format!("cashu-receive-{}", quote.id);
            if !self.is_due(&key, quote.created_at).await {
                continue;
            }
            let Some(_guard) = self.scope.try_enter(&key) else {
                continue;
            };
            match self.engines.cashu_receive.drive(quote).await {
                Ok(updated) => {
                    self.caches
                        .cashu_receive
                        .put(updated.id, updated.version, updated);
                }
                Err(err) => tracing::warn!(key, "drive failed: {err}"),
            }
        }

        for quote in self
            .db
            .list_unresolved_spark_receive_quotes(user_id)
            .await?
        {
            let key = format!("spark-receive-{}", quote.id);
            if !self.is_due(&key, quote.created_at).await {
                continue;
            }
            let Some(_guard) = self.scope.try_enter(&key) else {
                continue;
            };
            match self.engines.spark_receive.drive(quote).await {
                Ok(updated) => {
                    self.caches
                        .spark_receive
                        .put(updated.id, updated.version, updated);
                }
                Err(err) => tracing::warn!(key, "drive failed: {err}"),
            }
        }

        for quote in self.db.list_unresolved_cashu_send_quotes(user_id).await? {
            let key = format!("cashu-send-{}", quote.id);
            if !self.is_due(&key, quote.created_at).await {
                continue;
            }
            let Some(_guard) = self.scope.try_enter(&key) else {
                continue;
            };
            match self.engines.cashu_send.drive(quote).await {
                Ok(updated) => {
                    self.caches
                        .cashu_send
                        .put(updated.id, updated.version, updated);
                }
                Err(err) => tracing::warn!(key, "drive failed: {err}"),
            }
        }

        for quote in self.db.list_unresolved_spark_send_quotes(user_id).await? {
            let key = format!("spark-send-{}", quote.id);
            if !self.is_due(&key, quote.created_at).await {
                continue;
            }
            let Some(_guard) = self.scope.try_enter(&key) else {
                continue;
            };
            match self.engines.spark_send.drive(quote).await {
                Ok(updated) => {
                    self.caches
                        .spark_send
                        .put(updated.id, updated.version, updated);
                }
                Err(err) => tracing::warn!(key, "drive failed: {err}"),
            }
        }

        for swap in self.db.list_unresolved_cashu_token_swaps(user_id).await? {
            let key = format!("token-swap-{}", swap.id);
            if !self.is_due(&key, swap.created_at).await {
                continue;
            }
            let Some(_guard) = self.scope.try_enter(&key) else {
                continue;
            };
            match self.engines.token_swaps.drive(swap).await {
                Ok(updated) => {
                    self.caches
                        .token_swaps
                        .put(updated.id, updated.version, updated);
                }
                Err(err) => tracing::warn!(key, "drive failed: {err}"),
            }
        }

        for swap in self.db.list_unresolved_cashu_send_swaps(user_id).await? {
            let key = format!("send-swap-{}", swap.id);
            if !self.is_due(&key, swap.created_at).await {
                continue;
            }
            let Some(_guard) = self.scope.try_enter(&key) else {
                continue;
            };
            match self.engines.send_swaps.drive(swap).await {
                Ok(updated) => {
                    self.caches
                        .send_swaps
                        .put(updated.id, updated.version, updated);
                }
                Err(err) => tracing::warn!(key, "drive failed: {err}"),
            }
        }

        Ok(())
    }

    /// One pass ignoring cadence, driving every unresolved record.
    /// Used by interactive refresh and tests.
    pub async fn drive_all(&self, user_id: &str) -> Result<(), agicash_common::Error> {
        self.next_due.lock().await.clear();
        self.tick(user_id).await
    }
}
