//! # obsmem - Observational memory for AI agents
//!
//! Keeps a bounded context per conversation thread: a compact log of
//! observations distilled from older turns, followed by the most recent raw
//! messages. An Observer pass folds old messages into the log once they
//! outgrow a token threshold, and a Reflector pass rewrites the log when it
//! outgrows its own.
//!
//! ```rust,no_run
//! use obsmem::{MemoryConfig, ObservationalMemory, OllamaProvider, Role};
//! use std::sync::Arc;
//!
//! # async fn run() -> obsmem::Result<()> {
//! let provider = Arc::new(OllamaProvider::new("http://localhost:11434", "llama3.1")?);
//! let memory = ObservationalMemory::open("./data", provider, MemoryConfig::default()).await?;
//!
//! memory.add_message("thread-1", Role::User, "We ship on March 3rd").await?;
//! let context = memory.get_context("thread-1").await?;
//! println!("{}", context.to_prompt(true));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context_builder;
pub mod coordinator;
pub mod error;
pub mod memory_store;
pub mod observer;
pub mod parsing;
pub mod prompts;
pub mod provider;
pub mod pulses;
pub mod reflector;
pub mod stats;
pub mod storage_traits;
pub mod store;
pub mod token_estimator;
pub mod types;

pub use config::{MemoryConfig, MemoryConfigBuilder};
pub use context_builder::{ContextBuilder, ThreadContext};
pub use coordinator::{CompressionCoordinator, CompressionOutcome};
pub use error::{MemoryError, Result};
pub use memory_store::InMemoryStore;
pub use observer::{Observer, ObserverOutput};
pub use provider::{
    LlmProvider, OllamaProvider, OpenAiCompatibleProvider, OpenAiConfig, Prompt, ProviderError,
};
pub use pulses::{pulse, MemoryPulses, Pulse, PulseStats, PulseType};
pub use reflector::{Reflector, ReflectorOutput};
pub use stats::{CostModel, SavingsReport, ThreadStats};
pub use storage_traits::{MessageStore, ObservationStore, ThreadStore};
pub use store::SqliteStore;
#[cfg(feature = "tiktoken")]
pub use token_estimator::TiktokenEstimator;
pub use token_estimator::{
    default_estimator, CharRatioEstimator, TokenEstimator, WordBasedEstimator,
};
pub use types::{
    CompressionPhase, CompressionState, Message, Observation, Priority, Role, Sequence, ThreadId,
};

use std::path::Path;
use std::sync::Arc;

/// Main entry point: one instance serves any number of threads
#[derive(Clone)]
pub struct ObservationalMemory {
    coordinator: Arc<CompressionCoordinator>,
    pulses: MemoryPulses,
}

impl std::fmt::Debug for ObservationalMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservationalMemory")
            .field("backend", &self.coordinator.store().backend_name())
            .finish()
    }
}

impl ObservationalMemory {
    /// Create a memory over any store, estimating tokens with [`default_estimator`]
    pub fn new(
        store: Arc<dyn ThreadStore>,
        provider: Arc<dyn LlmProvider>,
        config: MemoryConfig,
    ) -> Result<Self> {
        Self::with_estimator(store, provider, default_estimator(), config)
    }

    /// Create a memory with a custom token estimator
    pub fn with_estimator(
        store: Arc<dyn ThreadStore>,
        provider: Arc<dyn LlmProvider>,
        estimator: Arc<dyn TokenEstimator>,
        config: MemoryConfig,
    ) -> Result<Self> {
        config.validate()?;

        let observer = Observer::new(
            Arc::clone(&provider),
            Arc::clone(&estimator),
            config.observer_instructions.clone(),
            config.provider_timeout,
        );
        let reflector = Reflector::new(
            provider,
            Arc::clone(&estimator),
            config.reflector_instructions.clone(),
            config.provider_timeout,
        );
        let pulses = MemoryPulses::default();
        let coordinator = CompressionCoordinator::new(
            store,
            observer,
            reflector,
            estimator,
            config,
            pulses.clone(),
        );

        tracing::debug!(
            "Observational memory ready (backend: {})",
            coordinator.store().backend_name()
        );
        Ok(Self {
            coordinator: Arc::new(coordinator),
            pulses,
        })
    }

    /// SQLite-backed memory persisted under `data_dir`
    pub async fn open(
        data_dir: impl AsRef<Path>,
        provider: Arc<dyn LlmProvider>,
        config: MemoryConfig,
    ) -> Result<Self> {
        let store = SqliteStore::open(data_dir).await?;
        Self::new(store, provider, config)
    }

    /// Non-persistent memory for tests and demos
    pub fn in_memory(provider: Arc<dyn LlmProvider>, config: MemoryConfig) -> Result<Self> {
        Self::new(InMemoryStore::new(), provider, config)
    }

    /// Record a message. Returns once it is durably appended.
    pub async fn add_message(&self, thread_id: &str, role: Role, content: &str) -> Result<Message> {
        self.coordinator
            .add_message(thread_id, role, content, None)
            .await
    }

    /// Record a message with caller metadata
    pub async fn add_message_with_metadata(
        &self,
        thread_id: &str,
        role: Role,
        content: &str,
        metadata: serde_json::Value,
    ) -> Result<Message> {
        self.coordinator
            .add_message(thread_id, role, content, Some(metadata))
            .await
    }

    /// Context for the next model call, using the configured message budget
    pub async fn get_context(&self, thread_id: &str) -> Result<ThreadContext> {
        self.coordinator.get_context(thread_id).await
    }

    /// Context with a one-off message budget
    pub async fn get_context_with_budget(
        &self,
        thread_id: &str,
        budget: usize,
    ) -> Result<ThreadContext> {
        self.coordinator
            .get_context_with_budget(thread_id, budget)
            .await
    }

    /// Run an Observer pass regardless of the threshold
    pub async fn force_observe(&self, thread_id: &str) -> Result<CompressionOutcome> {
        self.coordinator.force_observe(thread_id).await
    }

    /// Run a Reflector pass regardless of the threshold
    pub async fn force_reflect(&self, thread_id: &str) -> Result<CompressionOutcome> {
        self.coordinator.force_reflect(thread_id).await
    }

    /// Current observation log
    pub async fn observations(&self, thread_id: &str) -> Result<Vec<Observation>> {
        self.coordinator.observations(thread_id).await
    }

    pub async fn compression_state(&self, thread_id: &str) -> Result<CompressionState> {
        self.coordinator.compression_state(thread_id).await
    }

    /// Delete raw messages the log already covers, keeping the retention floor
    pub async fn prune_compressed(&self, thread_id: &str) -> Result<usize> {
        self.coordinator.prune_compressed(thread_id).await
    }

    /// Remove everything stored for a thread
    pub async fn clear_thread(&self, thread_id: &str) -> Result<()> {
        self.coordinator.clear_thread(thread_id).await
    }

    /// Wait for a background pass on the thread to finish
    pub async fn wait_idle(&self, thread_id: &str) {
        self.coordinator.wait_idle(thread_id).await
    }

    /// Counters for one thread
    pub fn stats(&self, thread_id: &str) -> ThreadStats {
        self.coordinator.stats(thread_id)
    }

    /// Estimated provider spend against a retrieval-memory baseline
    pub fn savings_report(&self, thread_id: &str) -> SavingsReport {
        self.coordinator.savings_report(thread_id)
    }

    /// Get the pulses system for subscribing to events
    pub fn pulses(&self) -> &MemoryPulses {
        &self.pulses
    }

    pub fn config(&self) -> &MemoryConfig {
        self.coordinator.config()
    }

    /// Get the underlying store
    pub fn store(&self) -> &Arc<dyn ThreadStore> {
        self.coordinator.store()
    }
}
