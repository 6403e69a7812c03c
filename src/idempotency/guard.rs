//! The idempotency state machine.
//!
//! ```text
//! ABSENT --set_if_absent--> PROCESSING --ok--> SUCCESS --ttl--> ABSENT
//!                                      \--err--> FAILED --compare_and_delete / ttl--> ABSENT
//! ```
//!
//! Only the invocation whose `set_if_absent` wins runs the guarded operation.
//! All coordination goes through the [`StateStore`]; nothing is shared in-process.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use super::context::{CallerKind, Invocation};
use super::mode::{resolve, IdempotentOptions, ResolvedMode};
use super::record::RecordState;
use super::result_cache::ResultCache;
use super::token::resolve_token;
use super::translate::{translate, Rejection};
use crate::error::{IdempotencyError, Result};
use crate::live_config::ConfigSource;
use crate::observability::{get_metrics, mask_token, LatencyTimer};
use crate::store::StateStore;

const BACKOFF_STEP_MS: u64 = 50;
const BACKOFF_CAP_MS: u64 = 300;

/// Backoff before re-attempting ownership of a reopened record: `min(50ms * attempt, 300ms)`.
pub fn backoff(attempt: u32) -> Duration {
    Duration::from_millis((BACKOFF_STEP_MS * u64::from(attempt)).min(BACKOFF_CAP_MS))
}

/// In-process counters for one guard.
#[derive(Debug, Default)]
pub struct GuardStats {
    pub acquired: AtomicU64,
    pub duplicates: AtomicU64,
    pub replayed: AtomicU64,
    pub reopened: AtomicU64,
    pub retry_exhausted: AtomicU64,
    pub wait_timeouts: AtomicU64,
    pub operation_failures: AtomicU64,
    pub tokens_missing: AtomicU64,
}

impl GuardStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            acquired: self.acquired.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            reopened: self.reopened.load(Ordering::Relaxed),
            retry_exhausted: self.retry_exhausted.load(Ordering::Relaxed),
            wait_timeouts: self.wait_timeouts.load(Ordering::Relaxed),
            operation_failures: self.operation_failures.load(Ordering::Relaxed),
            tokens_missing: self.tokens_missing.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub acquired: u64,
    pub duplicates: u64,
    pub replayed: u64,
    pub reopened: u64,
    pub retry_exhausted: u64,
    pub wait_timeouts: u64,
    pub operation_failures: u64,
    pub tokens_missing: u64,
}

enum Acquisition<T> {
    Owner,
    Replay(T),
    Rejected(Rejection),
}

enum Resolution<T> {
    Replay(T),
    Reopened,
    TimedOut,
}

/// Runs guarded operations at most once per token within the record TTL.
#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn StateStore>,
    config: Arc<dyn ConfigSource>,
    results: ResultCache,
    stats: Arc<GuardStats>,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn StateStore>, config: Arc<dyn ConfigSource>) -> Self {
        Self {
            results: ResultCache::new(Arc::clone(&store)),
            store,
            config,
            stats: Arc::new(GuardStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<GuardStats> {
        Arc::clone(&self.stats)
    }

    /// Executes `operation` under idempotency control.
    ///
    /// Returns the operation's value when this call owns the token, or the
    /// replayed value of the owner in wait-and-replay mode. Store failures are
    /// always returned as errors.
    pub async fn execute<T, F, Fut, E>(
        &self,
        options: &IdempotentOptions,
        invocation: &Invocation<'_>,
        operation: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Default + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        E: Into<anyhow::Error> + Send,
    {
        let timer = LatencyTimer::new();
        let result = self.guard(options, invocation, operation).await;
        get_metrics().record_guard_latency(invocation.operation(), timer.elapsed_ms());
        result
    }

    async fn guard<T, F, Fut, E>(
        &self,
        options: &IdempotentOptions,
        invocation: &Invocation<'_>,
        operation: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Default + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        E: Into<anyhow::Error> + Send,
    {
        options.check()?;

        let kind = invocation.kind();
        let operation_name = invocation.operation();

        let Some(token) = resolve_token(options, invocation) else {
            GuardStats::bump(&self.stats.tokens_missing);
            get_metrics().record_token_missing(operation_name, kind.as_str());
            tracing::warn!(operation = operation_name, caller = %kind, "No idempotency token resolved");
            return translate(kind, Rejection::TokenMissing);
        };

        let config = self.config.generation();
        let mode = resolve(options, config.as_ref(), &token, operation_name);
        let span = tracing::info_span!(
            "idempotent",
            operation = operation_name,
            token = %mask_token(&token),
            mode = mode.mode_name(),
            caller = %kind,
        );

        async move {
            if mode.wait_and_replay && kind == CallerKind::Synchronous {
                tracing::warn!(
                    "Wait-and-replay holds the request task while polling; prefer fail-fast for synchronous callers"
                );
            }

            if mode.wait_and_replay {
                if let Some(value) = self.results.fetch::<T>(&mode.keys.result).await? {
                    self.note_replayed(operation_name);
                    tracing::debug!("Replayed cached result without touching the lock");
                    return Ok(value);
                }
            }

            match self.acquire::<T>(&mode, operation_name).await? {
                Acquisition::Owner => self.run_as_owner(&mode, operation_name, operation).await,
                Acquisition::Replay(value) => Ok(value),
                Acquisition::Rejected(rejection) => {
                    tracing::info!(outcome = ?rejection, "Idempotent invocation did not run the operation");
                    translate(kind, rejection)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn read_state(&self, key: &str) -> Result<Option<RecordState>> {
        match self.store.get(key).await? {
            Some(raw) => Ok(Some(raw.parse()?)),
            None => Ok(None),
        }
    }

    /// Contends for ownership, bounded by `max_retry_count` reopen attempts.
    async fn acquire<T: DeserializeOwned>(
        &self,
        mode: &ResolvedMode,
        operation: &str,
    ) -> Result<Acquisition<T>> {
        let keys = &mode.keys;

        for attempt in 1..=mode.max_retry_count.saturating_add(1) {
            if self
                .store
                .set_if_absent(&keys.record, RecordState::Processing.as_str(), mode.expire_time)
                .await?
            {
                GuardStats::bump(&self.stats.acquired);
                get_metrics().record_acquired(operation);
                tracing::debug!(attempt, "Acquired idempotency record");
                return Ok(Acquisition::Owner);
            }

            let state = self.read_state(&keys.record).await?;
            tracing::debug!(attempt, state = ?state, "Idempotency record is held");

            match state {
                // Expired or reopened between the two calls; contend again.
                None => continue,
                Some(RecordState::Processing | RecordState::Success) if !mode.wait_and_replay => {
                    GuardStats::bump(&self.stats.duplicates);
                    get_metrics().record_duplicate(operation);
                    return Ok(Acquisition::Rejected(Rejection::DuplicateRejected(
                        mode.reject_message.clone(),
                    )));
                }
                Some(RecordState::Failed) => {
                    if !mode.wait_and_replay {
                        let count = self
                            .store
                            .increment_and_maybe_expire(&keys.retry_count, mode.expire_time)
                            .await?;
                        if count > i64::from(mode.max_retry_count) {
                            GuardStats::bump(&self.stats.retry_exhausted);
                            get_metrics().record_retry_exhausted(operation);
                            tracing::warn!(count, "Retry limit exhausted for failed record");
                            return Ok(Acquisition::Rejected(Rejection::RetryExhausted));
                        }
                    }

                    // Losing this delete means another caller reopened first; the next
                    // set_if_absent decides ownership either way.
                    if self
                        .store
                        .compare_and_delete(&keys.record, RecordState::Failed.as_str())
                        .await?
                    {
                        GuardStats::bump(&self.stats.reopened);
                        get_metrics().record_reopened(operation);
                        tracing::info!(attempt, "Reopened failed idempotency record");
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                    continue;
                }
                Some(RecordState::Success) => {
                    if let Some(value) = self.results.fetch::<T>(&keys.result).await? {
                        self.note_replayed(operation);
                        return Ok(Acquisition::Replay(value));
                    }
                    tracing::debug!("SUCCESS without a cached result, waiting for resolution");
                }
                Some(RecordState::Processing) => {}
            }

            match self.await_resolution::<T>(mode).await? {
                Resolution::Replay(value) => {
                    self.note_replayed(operation);
                    return Ok(Acquisition::Replay(value));
                }
                Resolution::Reopened => continue,
                Resolution::TimedOut => return Ok(self.timed_out(operation)),
            }
        }

        if mode.wait_and_replay {
            Ok(self.timed_out(operation))
        } else {
            GuardStats::bump(&self.stats.retry_exhausted);
            get_metrics().record_retry_exhausted(operation);
            Ok(Acquisition::Rejected(Rejection::RetryExhausted))
        }
    }

    /// Polls until the owner publishes a result or the record leaves `PROCESSING`/`SUCCESS`.
    async fn await_resolution<T: DeserializeOwned>(
        &self,
        mode: &ResolvedMode,
    ) -> Result<Resolution<T>> {
        for _ in 0..mode.max_wait_attempts {
            tokio::time::sleep(mode.retry_interval).await;

            if let Some(value) = self.results.fetch::<T>(&mode.keys.result).await? {
                return Ok(Resolution::Replay(value));
            }

            match self.read_state(&mode.keys.record).await? {
                Some(RecordState::Processing | RecordState::Success) => continue,
                Some(RecordState::Failed) | None => return Ok(Resolution::Reopened),
            }
        }
        Ok(Resolution::TimedOut)
    }

    async fn run_as_owner<T, F, Fut, E>(
        &self,
        mode: &ResolvedMode,
        operation_name: &str,
        operation: F,
    ) -> Result<T>
    where
        T: Serialize + Default + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        E: Into<anyhow::Error> + Send,
    {
        let keys = &mode.keys;

        match operation().await {
            Ok(value) => {
                // Publish the payload before the state so pollers that see SUCCESS find it.
                if mode.wait_and_replay {
                    self.results.put(&keys.result, &value, mode.expire_time).await?;
                }
                self.finish(mode, RecordState::Success).await?;
                self.store.delete(&keys.retry_count).await?;
                tracing::debug!("Guarded operation succeeded");
                Ok(value)
            }
            Err(e) => {
                let cause: anyhow::Error = e.into();
                if mode.wait_and_replay {
                    self.results.evict(&keys.result).await?;
                }
                self.finish(mode, RecordState::Failed).await?;

                GuardStats::bump(&self.stats.operation_failures);
                get_metrics().record_operation_failed(operation_name, mode.surface_failure);

                if mode.surface_failure {
                    tracing::warn!(error = %cause, "Guarded operation failed");
                    Err(IdempotencyError::OperationFailed(cause))
                } else {
                    tracing::warn!(error = %cause, "Guarded operation failed, suppressing");
                    Ok(T::default())
                }
            }
        }
    }

    /// Moves the owned record out of `PROCESSING`, refreshing its TTL.
    async fn finish(&self, mode: &ResolvedMode, state: RecordState) -> Result<()> {
        let written = self
            .store
            .compare_and_set(
                &mode.keys.record,
                RecordState::Processing.as_str(),
                state.as_str(),
                mode.expire_time,
            )
            .await?;

        if !written {
            tracing::warn!(
                state = %state,
                "Record was no longer PROCESSING when the operation finished; it expired or changed owner"
            );
        }
        Ok(())
    }

    fn note_replayed(&self, operation: &str) {
        GuardStats::bump(&self.stats.replayed);
        get_metrics().record_replayed(operation);
    }

    fn timed_out<T>(&self, operation: &str) -> Acquisition<T> {
        GuardStats::bump(&self.stats.wait_timeouts);
        get_metrics().record_wait_timeout(operation);
        Acquisition::Rejected(Rejection::WaitTimedOut)
    }
}
