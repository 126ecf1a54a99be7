//! End-to-end tests for the compression pipeline
//!
//! A scripted provider stands in for the model: observer prompts get one
//! observation back, reflector prompts get a single merged entry.

use async_trait::async_trait;
use obsmem::{
    CompressionOutcome, CompressionPhase, InMemoryStore, LlmProvider, MemoryConfig, MemoryError,
    ObservationalMemory, Prompt, ProviderError, Pulse, Role, WordBasedEstimator,
};
use tokio_test::assert_ok;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Succeed,
    FailAll,
    FailEveryOther,
    FailReflector,
}

struct ScriptedProvider {
    mode: Mode,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    fn new(mode: Mode) -> Arc<Self> {
        Self::slow(mode, Duration::ZERO)
    }

    fn slow(mode: Mode, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            mode,
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, prompt: &Prompt, _timeout: Duration) -> Result<String, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let reflecting = prompt.user.starts_with("Current Observations:");
        let fail = match self.mode {
            Mode::Succeed => false,
            Mode::FailAll => true,
            Mode::FailEveryOther => call % 2 == 1,
            Mode::FailReflector => reflecting,
        };
        if fail {
            return Err(ProviderError::NetworkError("connection refused".to_string()));
        }

        if reflecting {
            Ok("Date: 2026-02-23\n- 🔴 09:00 merged log".to_string())
        } else {
            Ok(format!("Date: 2026-02-23\n- 🔴 10:00 observed batch {call}"))
        }
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

fn config(observer: usize, reflector: usize, retention: usize) -> MemoryConfig {
    MemoryConfig::builder()
        .observer_token_threshold(observer)
        .reflector_token_threshold(reflector)
        .message_retention_count(retention)
        .build()
        .unwrap()
}

/// One token per word, so "user: one two three" costs 4
fn memory(provider: Arc<ScriptedProvider>, config: MemoryConfig) -> ObservationalMemory {
    ObservationalMemory::with_estimator(
        InMemoryStore::new(),
        provider,
        Arc::new(WordBasedEstimator::new(1.0)),
        config,
    )
    .unwrap()
}

fn sequences(ctx: &obsmem::ThreadContext) -> Vec<u64> {
    ctx.messages.iter().map(|m| m.sequence).collect()
}

#[tokio::test]
async fn test_recent_block_always_holds_retention_floor() {
    let memory = memory(ScriptedProvider::new(Mode::Succeed), config(10, 10_000, 3));

    for i in 1..=15u64 {
        memory
            .add_message("t", Role::User, "one two three")
            .await
            .unwrap();
        let ctx = memory.get_context("t").await.unwrap();
        let expected: Vec<u64> = (i.saturating_sub(2).max(1)..=i).collect();
        assert!(
            sequences(&ctx).ends_with(&expected),
            "after {} appends got {:?}",
            i,
            sequences(&ctx)
        );
    }
    assert!(memory.stats("t").observer_runs > 0);
}

#[tokio::test]
async fn test_get_context_is_idempotent() {
    let memory = memory(ScriptedProvider::new(Mode::Succeed), config(10, 10_000, 2));
    for _ in 0..6 {
        memory.add_message("t", Role::User, "one two three").await.unwrap();
    }

    let first = memory.get_context("t").await.unwrap();
    let second = memory.get_context("t").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.to_prompt(true), second.to_prompt(true));
}

#[tokio::test]
async fn test_get_context_never_compresses() {
    let provider = ScriptedProvider::new(Mode::Succeed);
    let config = MemoryConfig::builder()
        .observer_token_threshold(5)
        .auto_observe(false)
        .build()
        .unwrap();
    let memory = memory(Arc::clone(&provider), config);

    for _ in 0..10 {
        memory.add_message("t", Role::User, "one two three").await.unwrap();
    }
    memory.get_context("t").await.unwrap();
    assert_eq!(provider.calls(), 0);
    assert!(memory.observations("t").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_marker_never_decreases_under_intermittent_failures() {
    let memory = memory(ScriptedProvider::new(Mode::FailEveryOther), config(5, 10_000, 1));

    let mut last = 0;
    for _ in 0..20 {
        memory.add_message("t", Role::User, "one two three").await.unwrap();
        let marker = memory
            .compression_state("t")
            .await
            .unwrap()
            .last_compressed_sequence;
        assert!(marker >= last, "marker went from {} to {}", last, marker);
        last = marker;
    }
    assert!(last > 0);
    assert!(memory.stats("t").failures > 0);
}

#[tokio::test]
async fn test_failing_provider_never_fails_appends() {
    let provider = ScriptedProvider::new(Mode::FailAll);
    let memory = memory(Arc::clone(&provider), config(5, 10_000, 2));
    let mut pulses = memory.pulses().subscribe();

    for i in 0..20 {
        memory
            .add_message("t", Role::User, &format!("message {i} here"))
            .await
            .unwrap();
    }

    assert!(provider.calls() > 0);
    assert!(memory.observations("t").await.unwrap().is_empty());
    assert_eq!(memory.compression_state("t").await.unwrap().last_compressed_sequence, 0);

    let stored = memory.store().read_range("t", 0, None).await.unwrap();
    assert_eq!(stored.len(), 20);
    assert!(stored.windows(2).all(|w| w[0].sequence + 1 == w[1].sequence));
    assert_eq!(stored[7].content, "message 7 here");

    let mut failures = 0;
    while let Ok(pulse) = pulses.try_recv() {
        if matches!(pulse, Pulse::CompressionFailed { .. }) {
            failures += 1;
        }
    }
    assert!(failures > 0);
    assert_eq!(memory.stats("t").failures as usize, failures);
}

#[tokio::test]
async fn test_observer_runs_exactly_once_on_crossing() {
    let provider = ScriptedProvider::new(Mode::Succeed);
    let memory = memory(Arc::clone(&provider), config(20, 10_000, 2));

    // Five messages of 4 tokens reach the threshold without exceeding it
    for _ in 0..5 {
        memory.add_message("t", Role::User, "one two three").await.unwrap();
    }
    assert_eq!(provider.calls(), 0);

    memory.add_message("t", Role::User, "one two three").await.unwrap();
    assert_eq!(provider.calls(), 1);
    assert_eq!(memory.compression_state("t").await.unwrap().last_compressed_sequence, 4);

    memory.add_message("t", Role::User, "one two three").await.unwrap();
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_single_flight_under_concurrent_appends() {
    let provider = ScriptedProvider::slow(Mode::Succeed, Duration::from_millis(50));
    let config = MemoryConfig::builder()
        .observer_token_threshold(5)
        .reflector_token_threshold(10_000)
        .message_retention_count(1)
        .blocking_mode(false)
        .build()
        .unwrap();
    let memory = memory(Arc::clone(&provider), config);

    for round in 0..3 {
        let adds = (0..10).map(|i| {
            let memory = memory.clone();
            async move {
                memory
                    .add_message("t", Role::User, &format!("round {round} turn {i}"))
                    .await
            }
        });
        for result in futures::future::join_all(adds).await {
            result.unwrap();
        }
        memory.wait_idle("t").await;
    }

    assert_eq!(provider.max_in_flight.load(Ordering::SeqCst), 1);
    assert!(provider.calls() >= 1);

    let stored = memory.store().read_range("t", 0, None).await.unwrap();
    assert_eq!(stored.len(), 30);
    assert_eq!(stored.last().map(|m| m.sequence), Some(30));
}

#[tokio::test]
async fn test_context_read_during_inflight_pass() {
    let provider = ScriptedProvider::slow(Mode::Succeed, Duration::from_millis(300));
    let config = MemoryConfig::builder()
        .observer_token_threshold(5)
        .reflector_token_threshold(10_000)
        .message_retention_count(1)
        .blocking_mode(false)
        .build()
        .unwrap();
    let memory = memory(Arc::clone(&provider), config);

    // 8 pending tokens > 5: the pass covers message 1 and keeps message 2 raw
    assert_ok!(memory.add_message("t", Role::User, "one two three").await);
    assert_ok!(memory.add_message("t", Role::User, "four five six").await);
    while provider.calls() == 0 {
        tokio::task::yield_now().await;
    }

    let state = assert_ok!(memory.compression_state("t").await);
    assert!(state.compression_in_progress);
    assert_eq!(state.phase, CompressionPhase::Observing);

    let read = tokio::time::timeout(Duration::from_millis(100), memory.get_context("t")).await;
    let ctx = assert_ok!(assert_ok!(read));
    assert_eq!(ctx.observations_block, "No previous memory observed.");
    assert_eq!(sequences(&ctx), vec![1, 2]);

    // Appended mid-flight, outside the window the pass already bounded
    assert_ok!(memory.add_message("t", Role::User, "seven eight nine").await);
    memory.wait_idle("t").await;
    assert_eq!(provider.calls(), 1);

    let state = assert_ok!(memory.compression_state("t").await);
    assert!(!state.compression_in_progress);
    assert_eq!(state.last_compressed_sequence, 1);

    let ctx = assert_ok!(memory.get_context("t").await);
    assert!(ctx.observations_block.contains("observed batch 1"));
    assert_eq!(sequences(&ctx), vec![2, 3]);

    // The next pass picks up where the first stopped
    assert_eq!(
        assert_ok!(memory.force_observe("t").await),
        CompressionOutcome::Observed {
            entries: 1,
            covers_through: 2
        }
    );
}

#[tokio::test]
async fn test_savings_report_tracks_compression() {
    let tracked = memory(ScriptedProvider::new(Mode::Succeed), config(5, 10_000, 1));
    let untracked = memory(
        ScriptedProvider::new(Mode::Succeed),
        MemoryConfig::builder()
            .observer_token_threshold(5)
            .message_retention_count(1)
            .track_costs(false)
            .build()
            .unwrap(),
    );

    for memory in [&tracked, &untracked] {
        for _ in 0..4 {
            assert_ok!(memory.add_message("t", Role::User, "one two three").await);
        }
        assert_ok!(memory.get_context("t").await);
    }

    let report = tracked.savings_report("t");
    assert!(report.observer_runs > 0);
    assert_eq!(report.messages_processed, 4);
    assert!(report.estimated_rag_cost > 0.0);
    assert!(report.om_cost >= 0.0);

    let report = untracked.savings_report("t");
    assert!(report.observer_runs > 0);
    assert_eq!(report.estimated_rag_cost, 0.0);
}

#[tokio::test]
async fn test_threshold_fifty_with_eighty_tokens() {
    let provider = ScriptedProvider::new(Mode::Succeed);
    let memory = memory(Arc::clone(&provider), config(50, 10_000, 1));

    // Each message renders as "user: " plus 26 words = 27 tokens
    let body = vec!["word"; 26].join(" ");
    for _ in 0..3 {
        memory.add_message("t", Role::User, &body).await.unwrap();
    }

    let ctx = memory.get_context("t").await.unwrap();
    let state = memory.compression_state("t").await.unwrap();
    assert!(ctx.observations_block.contains("observed batch"));
    assert!(state.last_compressed_sequence > 0);
    assert!(!ctx.messages.is_empty());
    assert!(ctx
        .messages
        .iter()
        .all(|m| m.sequence > state.last_compressed_sequence));
    assert_eq!(sequences(&ctx), vec![3]);
}

#[tokio::test]
async fn test_retention_larger_than_history() {
    let memory = memory(ScriptedProvider::new(Mode::Succeed), config(50, 10_000, 2));
    memory.add_message("t", Role::User, "hello").await.unwrap();

    let ctx = memory.get_context("t").await.unwrap();
    assert_eq!(ctx.messages.len(), 1);
    assert_eq!(ctx.recent_block, "user: hello");
    assert_eq!(ctx.observations_block, "No previous memory observed.");
}

#[tokio::test]
async fn test_timeout_abandons_pass() {
    let provider = ScriptedProvider::slow(Mode::Succeed, Duration::from_secs(5));
    let config = MemoryConfig::builder()
        .message_retention_count(1)
        .provider_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let memory = memory(provider, config);
    memory.add_message("t", Role::User, "first").await.unwrap();
    memory.add_message("t", Role::User, "second").await.unwrap();

    let outcome = memory.force_observe("t").await.unwrap();
    assert!(matches!(outcome, CompressionOutcome::Abandoned { .. }));
    assert!(memory.observations("t").await.unwrap().is_empty());

    let state = memory.compression_state("t").await.unwrap();
    assert_eq!(state.last_compressed_sequence, 0);
    assert!(!state.compression_in_progress);
}

#[tokio::test]
async fn test_reflector_replaces_log_and_keeps_marker() {
    let provider = ScriptedProvider::new(Mode::Succeed);
    let memory = memory(Arc::clone(&provider), config(5, 3, 1));

    memory.add_message("t", Role::User, "one two three").await.unwrap();
    memory.add_message("t", Role::User, "one two three").await.unwrap();

    let log = memory.observations("t").await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].text, "merged log");
    assert_eq!(log[0].covers_through, 1);
    assert_eq!(provider.calls(), 2);

    let stats = memory.stats("t");
    assert_eq!((stats.observer_runs, stats.reflector_runs), (1, 1));
    assert_eq!(memory.compression_state("t").await.unwrap().last_compressed_sequence, 1);
}

#[tokio::test]
async fn test_failed_reflection_keeps_observer_log() {
    let memory = memory(ScriptedProvider::new(Mode::FailReflector), config(5, 3, 1));

    memory.add_message("t", Role::User, "one two three").await.unwrap();
    memory.add_message("t", Role::User, "one two three").await.unwrap();

    let log = memory.observations("t").await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].text, "observed batch 1");

    let outcome = memory.force_reflect("t").await.unwrap();
    assert!(matches!(outcome, CompressionOutcome::Abandoned { .. }));
    assert_eq!(memory.observations("t").await.unwrap(), log);
}

#[tokio::test]
async fn test_threads_are_independent() {
    let memory = memory(ScriptedProvider::new(Mode::Succeed), config(5, 10_000, 1));
    for _ in 0..3 {
        memory.add_message("a", Role::User, "one two three").await.unwrap();
    }
    memory.add_message("b", Role::User, "one two three").await.unwrap();

    assert!(!memory.observations("a").await.unwrap().is_empty());
    assert!(memory.observations("b").await.unwrap().is_empty());
    assert_eq!(memory.compression_state("b").await.unwrap().last_compressed_sequence, 0);
}

#[tokio::test]
async fn test_invalid_config_rejected_at_construction() {
    let config = MemoryConfig {
        message_token_budget: 0,
        ..MemoryConfig::default()
    };
    let err = ObservationalMemory::in_memory(ScriptedProvider::new(Mode::Succeed), config).unwrap_err();
    assert!(matches!(err, MemoryError::Configuration(_)));
}

#[tokio::test]
async fn test_sqlite_memory_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(1_000, 10_000, 2);

    let before = {
        let memory = ObservationalMemory::open(
            dir.path(),
            ScriptedProvider::new(Mode::Succeed),
            config.clone(),
        )
        .await
        .unwrap();
        for i in 0..5 {
            memory
                .add_message("t", Role::User, &format!("persisted turn {i}"))
                .await
                .unwrap();
        }
        assert_eq!(
            memory.force_observe("t").await.unwrap(),
            CompressionOutcome::Observed {
                entries: 1,
                covers_through: 3
            }
        );
        memory.get_context("t").await.unwrap()
    };

    let memory = ObservationalMemory::open(dir.path(), ScriptedProvider::new(Mode::Succeed), config)
        .await
        .unwrap();
    let after = memory.get_context("t").await.unwrap();
    assert_eq!(before.observations_block, after.observations_block);
    assert_eq!(before.recent_block, after.recent_block);
    assert_eq!(memory.compression_state("t").await.unwrap().last_compressed_sequence, 3);
}
