//! Compression coordinator
//!
//! Decides when the Observer and Reflector run and commits their output.
//! Each thread has one slot holding its phase; a pass must claim the slot
//! (Idle -> Observing/Reflecting) before touching the provider, and the
//! claim is released by dropping a [`FlightGuard`], so a failed, panicked or
//! cancelled pass always returns the thread to Idle.

use crate::config::MemoryConfig;
use crate::context_builder::{ContextBuilder, ThreadContext};
use crate::error::{MemoryError, Result};
use crate::observer::Observer;
use crate::pulses::{pulse, MemoryPulses, Pulse};
use crate::reflector::Reflector;
use crate::stats::{SavingsReport, ThreadStats};
use crate::storage_traits::{MessageStore, ObservationStore, ThreadStore};
use crate::token_estimator::TokenEstimator;
use crate::types::{CompressionPhase, CompressionState, Message, Observation, Role, Sequence};

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// What an explicit or triggered pass did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CompressionOutcome {
    /// Observer entries were appended
    Observed { entries: usize, covers_through: Sequence },
    /// The log was rewritten
    Reflected { entries_before: usize, entries_after: usize },
    /// Nothing eligible; no provider call was made
    NothingToCompress,
    /// Another pass holds the thread
    Busy,
    /// The provider failed; stores are unchanged
    Abandoned { reason: String },
}

impl CompressionOutcome {
    pub fn committed(&self) -> bool {
        matches!(
            self,
            CompressionOutcome::Observed { .. } | CompressionOutcome::Reflected { .. }
        )
    }
}

#[derive(Default)]
struct ThreadSlot {
    phase: Mutex<CompressionPhase>,
    stats: Mutex<ThreadStats>,
    idle: Notify,
}

impl ThreadSlot {
    fn phase(&self) -> MutexGuard<'_, CompressionPhase> {
        self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stats(&self) -> MutexGuard<'_, ThreadStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive claim on a thread's compression slot
pub struct FlightGuard {
    slot: Arc<ThreadSlot>,
}

impl FlightGuard {
    fn set_phase(&self, phase: CompressionPhase) {
        *self.slot.phase() = phase;
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        *self.slot.phase() = CompressionPhase::Idle;
        self.slot.idle.notify_waiters();
    }
}

pub struct CompressionCoordinator {
    store: Arc<dyn ThreadStore>,
    observer: Observer,
    reflector: Reflector,
    context: ContextBuilder,
    estimator: Arc<dyn TokenEstimator>,
    config: MemoryConfig,
    pulses: MemoryPulses,
    slots: DashMap<String, Arc<ThreadSlot>>,
}

impl std::fmt::Debug for CompressionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionCoordinator")
            .field("backend", &self.store.backend_name())
            .field("threads", &self.slots.len())
            .finish()
    }
}

impl CompressionCoordinator {
    pub fn new(
        store: Arc<dyn ThreadStore>,
        observer: Observer,
        reflector: Reflector,
        estimator: Arc<dyn TokenEstimator>,
        config: MemoryConfig,
        pulses: MemoryPulses,
    ) -> Self {
        Self {
            context: ContextBuilder::new(Arc::clone(&estimator)),
            store,
            observer,
            reflector,
            estimator,
            config,
            pulses,
            slots: DashMap::new(),
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ThreadStore> {
        &self.store
    }

    fn slot(&self, thread_id: &str) -> Arc<ThreadSlot> {
        if let Some(slot) = self.slots.get(thread_id) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.slots
                .entry(thread_id.to_string())
                .or_default()
                .value(),
        )
    }

    /// Claim the thread for `phase`, or `None` if a pass already holds it
    fn try_begin(&self, thread_id: &str, phase: CompressionPhase) -> Option<FlightGuard> {
        let slot = self.slot(thread_id);
        {
            let mut current = slot.phase();
            if *current != CompressionPhase::Idle {
                return None;
            }
            *current = phase;
        }
        Some(FlightGuard { slot })
    }

    fn is_busy(&self, thread_id: &str) -> bool {
        *self.slot(thread_id).phase() != CompressionPhase::Idle
    }

    /// Append a message and run any pass it triggers.
    ///
    /// Only the append can fail this call; compression problems are logged,
    /// counted and reported through pulses.
    pub async fn add_message(
        self: &Arc<Self>,
        thread_id: &str,
        role: Role,
        content: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<Message> {
        let message = MessageStore::append(&*self.store, thread_id, role, content, metadata).await?;
        self.slot(thread_id).stats().messages_added += 1;
        self.pulses
            .emit(pulse::message_added(thread_id, message.sequence))
            .await;

        if !self.config.auto_observe || self.is_busy(thread_id) {
            return Ok(message);
        }

        let raw_tokens = match self.raw_token_estimate(thread_id).await {
            Ok(tokens) => tokens,
            Err(e) => {
                warn!("Skipping compression check for {}: {}", thread_id, e);
                return Ok(message);
            }
        };
        if raw_tokens <= self.config.observer_token_threshold {
            return Ok(message);
        }

        let Some(guard) = self.try_begin(thread_id, CompressionPhase::Observing) else {
            return Ok(message);
        };
        debug!(
            "Observer threshold crossed for {} ({} > {})",
            thread_id, raw_tokens, self.config.observer_token_threshold
        );

        if self.config.blocking_mode {
            if let Err(e) = self.run_cycle(thread_id, &guard).await {
                warn!("Compression for {} failed: {}", thread_id, e);
            }
        } else {
            let this = Arc::clone(self);
            let thread = thread_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = this.run_cycle(&thread, &guard).await {
                    warn!("Background compression for {} failed: {}", thread, e);
                }
                drop(guard);
            });
        }

        Ok(message)
    }

    /// Observer pass, then Reflector if the log has outgrown its threshold
    async fn run_cycle(&self, thread_id: &str, guard: &FlightGuard) -> Result<CompressionOutcome> {
        let outcome = self.observe_pass(thread_id).await?;
        if !outcome.committed() || !self.config.auto_reflect {
            return Ok(outcome);
        }

        let log = self.store.read_all(thread_id).await?;
        let log_tokens = self.estimator.estimate_observations(&log);
        if log_tokens > self.config.reflector_token_threshold {
            debug!(
                "Reflector threshold crossed for {} ({} > {})",
                thread_id, log_tokens, self.config.reflector_token_threshold
            );
            guard.set_phase(CompressionPhase::Reflecting);
            self.reflect_pass(thread_id, log).await?;
        }
        Ok(outcome)
    }

    async fn observe_pass(&self, thread_id: &str) -> Result<CompressionOutcome> {
        let marker = self.store.compressed_through(thread_id).await?;
        let latest = self.store.latest_sequence(thread_id).await?;
        let upper = latest.saturating_sub(self.config.message_retention_count as Sequence);
        if upper <= marker {
            return Ok(CompressionOutcome::NothingToCompress);
        }

        let window = self.store.read_range(thread_id, marker, Some(upper)).await?;
        if window.is_empty() {
            return Ok(CompressionOutcome::NothingToCompress);
        }
        let existing = self.store.read_all(thread_id).await?;
        let raw_tokens = self.estimator.estimate_messages(&window);
        self.pulses
            .emit(pulse::observer_triggered(thread_id, raw_tokens))
            .await;

        let started = Instant::now();
        let output = match self.observer.observe(thread_id, &existing, &window).await {
            Ok(output) => output,
            Err(e) => return Ok(self.abandon(thread_id, "observer", e.to_string()).await),
        };

        ObservationStore::append(&*self.store, thread_id, &output.entries).await?;

        let observation_tokens = self.estimator.estimate_observations(&output.entries);
        self.slot(thread_id).stats().record_observer_run(
            output.input_tokens,
            output.output_tokens,
            output.messages_compressed,
            raw_tokens,
            observation_tokens,
            &self.config.cost_model(),
        );
        info!(
            "Observer compressed {} messages of {} into {} entries (through {})",
            output.messages_compressed,
            thread_id,
            output.entries.len(),
            output.covers_through
        );
        self.pulses
            .emit(Pulse::ObserverCompleted {
                thread_id: thread_id.to_string(),
                entries: output.entries.len(),
                covers_through: output.covers_through,
                input_tokens: output.input_tokens,
                output_tokens: output.output_tokens,
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            })
            .await;

        Ok(CompressionOutcome::Observed {
            entries: output.entries.len(),
            covers_through: output.covers_through,
        })
    }

    async fn reflect_pass(&self, thread_id: &str, log: Vec<Observation>) -> Result<CompressionOutcome> {
        if log.is_empty() {
            return Ok(CompressionOutcome::NothingToCompress);
        }
        self.pulses
            .emit(pulse::reflector_triggered(
                thread_id,
                self.estimator.estimate_observations(&log),
            ))
            .await;

        let started = Instant::now();
        let output = match self.reflector.reflect(thread_id, &log).await {
            Ok(output) => output,
            Err(e) => return Ok(self.abandon(thread_id, "reflector", e.to_string()).await),
        };

        self.store.replace_all(thread_id, &output.entries).await?;

        self.slot(thread_id)
            .stats()
            .record_reflector_run(
                output.input_tokens,
                output.output_tokens,
                &self.config.cost_model(),
            );
        info!(
            "Reflector rewrote {}: {} -> {} entries",
            thread_id,
            output.entries_before,
            output.entries.len()
        );
        self.pulses
            .emit(Pulse::ReflectorCompleted {
                thread_id: thread_id.to_string(),
                entries_before: output.entries_before,
                entries_after: output.entries.len(),
                input_tokens: output.input_tokens,
                output_tokens: output.output_tokens,
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            })
            .await;

        Ok(CompressionOutcome::Reflected {
            entries_before: output.entries_before,
            entries_after: output.entries.len(),
        })
    }

    async fn abandon(&self, thread_id: &str, stage: &str, reason: String) -> CompressionOutcome {
        warn!("{} pass for {} abandoned: {}", stage, thread_id, reason);
        self.slot(thread_id).stats().failures += 1;
        self.pulses
            .emit(pulse::compression_failed(thread_id, stage, &reason))
            .await;
        CompressionOutcome::Abandoned { reason }
    }

    /// Run one Observer pass now, ignoring the threshold
    pub async fn force_observe(&self, thread_id: &str) -> Result<CompressionOutcome> {
        let Some(guard) = self.try_begin(thread_id, CompressionPhase::Observing) else {
            return Ok(CompressionOutcome::Busy);
        };
        self.run_cycle(thread_id, &guard).await
    }

    /// Run one Reflector pass now, ignoring the threshold
    pub async fn force_reflect(&self, thread_id: &str) -> Result<CompressionOutcome> {
        let Some(_guard) = self.try_begin(thread_id, CompressionPhase::Reflecting) else {
            return Ok(CompressionOutcome::Busy);
        };
        let log = self.store.read_all(thread_id).await?;
        self.reflect_pass(thread_id, log).await
    }

    pub async fn get_context(&self, thread_id: &str) -> Result<ThreadContext> {
        self.get_context_with_budget(thread_id, self.config.message_token_budget)
            .await
    }

    /// Build the two-block context. Read-only; never starts a pass.
    pub async fn get_context_with_budget(&self, thread_id: &str, budget: usize) -> Result<ThreadContext> {
        // The marker is taken from the log snapshot itself, so a pass that
        // commits between the two reads cannot make a message vanish from both blocks
        let observations = self.store.read_all(thread_id).await?;
        let marker = observations.iter().map(|o| o.covers_through).max().unwrap_or(0);
        let latest = self.store.latest_sequence(thread_id).await?;
        let floor_start = latest.saturating_sub(self.config.message_retention_count as Sequence);

        let candidates: Vec<Message> = self
            .store
            .read_range(thread_id, marker.min(floor_start), Some(latest))
            .await?
            .into_iter()
            .filter(|m| m.sequence > marker || m.sequence > floor_start)
            .collect();

        let context = self.context.build(
            thread_id,
            &observations,
            candidates,
            self.config.message_retention_count,
            budget,
        );

        self.slot(thread_id)
            .stats()
            .record_context_built(context.observation_tokens, &self.config.cost_model());
        self.pulses
            .emit(pulse::context_built(
                thread_id,
                context.observation_tokens,
                context.message_tokens,
            ))
            .await;
        Ok(context)
    }

    pub async fn observations(&self, thread_id: &str) -> Result<Vec<Observation>> {
        self.store.read_all(thread_id).await
    }

    async fn raw_token_estimate(&self, thread_id: &str) -> Result<usize> {
        let marker = self.store.compressed_through(thread_id).await?;
        let pending = self.store.read_range(thread_id, marker, None).await?;
        Ok(self.estimator.estimate_messages(&pending))
    }

    pub async fn compression_state(&self, thread_id: &str) -> Result<CompressionState> {
        let phase = *self.slot(thread_id).phase();
        let last_compressed_sequence = self.store.compressed_through(thread_id).await?;
        let observations = self.store.read_all(thread_id).await?;

        Ok(CompressionState {
            last_compressed_sequence,
            observation_token_estimate: self.estimator.estimate_observations(&observations),
            raw_token_estimate: self.raw_token_estimate(thread_id).await?,
            compression_in_progress: phase != CompressionPhase::Idle,
            phase,
        })
    }

    pub fn stats(&self, thread_id: &str) -> ThreadStats {
        self.slot(thread_id).stats().clone()
    }

    /// Estimated spend with and without compression
    pub fn savings_report(&self, thread_id: &str) -> SavingsReport {
        self.slot(thread_id).stats().savings_report()
    }

    /// Delete raw messages already summarized by the log, keeping the retention floor
    pub async fn prune_compressed(&self, thread_id: &str) -> Result<usize> {
        let marker = self.store.compressed_through(thread_id).await?;
        let latest = self.store.latest_sequence(thread_id).await?;
        let through = marker.min(latest.saturating_sub(self.config.message_retention_count as Sequence));
        if through == 0 {
            return Ok(0);
        }

        let removed = self.store.delete_through(thread_id, through).await?;
        debug!("Pruned {} compressed messages from {}", removed, thread_id);
        Ok(removed)
    }

    /// Drop every message, observation and counter for the thread
    pub async fn clear_thread(&self, thread_id: &str) -> Result<()> {
        let Some(guard) = self.try_begin(thread_id, CompressionPhase::Observing) else {
            return Err(MemoryError::InvalidOperation(format!(
                "compression in progress for {thread_id}"
            )));
        };
        self.store.clear_thread(thread_id).await?;
        *self.slot(thread_id).stats() = ThreadStats::default();
        drop(guard);

        // A pass may have claimed the slot since the guard dropped; keep it then
        self.slots
            .remove_if(thread_id, |_, slot| *slot.phase() == CompressionPhase::Idle);
        info!("Cleared thread {}", thread_id);
        Ok(())
    }

    /// Wait until no pass holds the thread
    pub async fn wait_idle(&self, thread_id: &str) {
        let slot = self.slot(thread_id);
        loop {
            let notified = slot.idle.notified();
            if *slot.phase() == CompressionPhase::Idle {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryStore;
    use crate::provider::{LlmProvider, Prompt, ProviderError};
    use crate::token_estimator::WordBasedEstimator;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for Echo {
        async fn complete(&self, prompt: &Prompt, _timeout: Duration) -> std::result::Result<String, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if prompt.user.starts_with("Current Observations:") {
                Ok("- 🔴 merged".to_string())
            } else {
                Ok("- 🟡 noted".to_string())
            }
        }

        fn model_name(&self) -> &str {
            "echo"
        }
    }

    fn coordinator(config: MemoryConfig) -> (Arc<CompressionCoordinator>, Arc<Echo>) {
        let provider = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let estimator: Arc<dyn TokenEstimator> = Arc::new(WordBasedEstimator::new(1.0));
        let timeout = config.provider_timeout;
        let coordinator = CompressionCoordinator::new(
            InMemoryStore::new(),
            Observer::new(provider.clone(), Arc::clone(&estimator), None, timeout),
            Reflector::new(provider.clone(), Arc::clone(&estimator), None, timeout),
            estimator,
            config,
            MemoryPulses::default(),
        );
        (Arc::new(coordinator), provider)
    }

    fn config(observer: usize, reflector: usize, retention: usize) -> MemoryConfig {
        MemoryConfig::builder()
            .observer_token_threshold(observer)
            .reflector_token_threshold(reflector)
            .message_retention_count(retention)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_guard_releases_slot_on_drop() {
        let (c, _) = coordinator(MemoryConfig::default());
        let guard = c.try_begin("t", CompressionPhase::Observing).unwrap();
        assert!(c.try_begin("t", CompressionPhase::Reflecting).is_none());
        assert!(c.try_begin("other", CompressionPhase::Observing).is_some());
        drop(guard);
        assert!(!c.is_busy("t"));
    }

    #[tokio::test]
    async fn test_force_observe_respects_retention() {
        let (c, provider) = coordinator(config(1_000, 1_000, 2));
        for i in 0..2 {
            c.add_message("t", Role::User, &format!("hello {i}"), None).await.unwrap();
        }
        assert_eq!(c.force_observe("t").await.unwrap(), CompressionOutcome::NothingToCompress);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        c.add_message("t", Role::Assistant, "third", None).await.unwrap();
        assert_eq!(
            c.force_observe("t").await.unwrap(),
            CompressionOutcome::Observed { entries: 1, covers_through: 1 }
        );
    }

    #[tokio::test]
    async fn test_force_observe_while_busy() {
        let (c, _) = coordinator(MemoryConfig::default());
        let _guard = c.try_begin("t", CompressionPhase::Observing).unwrap();
        assert_eq!(c.force_observe("t").await.unwrap(), CompressionOutcome::Busy);
        assert!(c.clear_thread("t").await.is_err());
    }

    #[tokio::test]
    async fn test_reflector_follows_observer_when_log_is_large() {
        // Any single observation ("🟡 noted" = 2 tokens) exceeds a reflector threshold of 1
        let (c, provider) = coordinator(config(3, 1, 1));
        c.add_message("t", Role::User, "one two three", None).await.unwrap();
        c.add_message("t", Role::User, "four five six", None).await.unwrap();

        let log = c.observations("t").await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].text, "merged");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);

        let stats = c.stats("t");
        assert_eq!((stats.observer_runs, stats.reflector_runs), (1, 1));
        assert_eq!(c.compression_state("t").await.unwrap().last_compressed_sequence, 1);
    }

    #[tokio::test]
    async fn test_prune_keeps_floor_and_context() {
        let (c, _) = coordinator(config(1_000, 1_000, 2));
        for i in 0..6 {
            c.add_message("t", Role::User, &format!("m{i}"), None).await.unwrap();
        }
        c.force_observe("t").await.unwrap();
        let before = c.get_context("t").await.unwrap();

        assert_eq!(c.prune_compressed("t").await.unwrap(), 4);
        let after = c.get_context("t").await.unwrap();
        assert_eq!(before.recent_block, after.recent_block);
        assert_eq!(after.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_clear_thread_releases_slot() {
        let (c, _) = coordinator(config(1_000, 1_000, 1));
        c.add_message("a", Role::User, "kept", None).await.unwrap();
        c.add_message("b", Role::User, "dropped", None).await.unwrap();
        assert_eq!(c.slots.len(), 2);

        c.clear_thread("b").await.unwrap();
        assert_eq!(c.slots.len(), 1);
        assert!(!c.slots.contains_key("b"));
        assert_eq!(c.stats("a").messages_added, 1);

        // A cleared thread starts over with a fresh slot
        c.add_message("b", Role::User, "again", None).await.unwrap();
        assert_eq!(c.stats("b").messages_added, 1);
        assert!(!c.is_busy("b"));
    }

    #[tokio::test]
    async fn test_context_reads_record_cached_tokens() {
        let (c, _) = coordinator(config(1_000, 1_000, 1));
        for i in 0..3 {
            c.add_message("t", Role::User, &format!("turn {i}"), None).await.unwrap();
        }
        c.force_observe("t").await.unwrap();
        let context = c.get_context("t").await.unwrap();

        let stats = c.stats("t");
        assert_eq!(stats.contexts_built, 1);
        assert_eq!(stats.cached_tokens, context.observation_tokens as u64);
        assert!(stats.estimated_cost_without_om > 0.0);
        assert_eq!(c.savings_report("t").observer_runs, 1);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_idle() {
        let (c, _) = coordinator(MemoryConfig::default());
        tokio::time::timeout(Duration::from_millis(100), c.wait_idle("t"))
            .await
            .unwrap();
    }
}
