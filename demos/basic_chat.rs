//! Basic chat loop showing observations replacing old turns.
//! Uses a scripted provider so it runs offline; swap in `OllamaProvider` or
//! `OpenAiCompatibleProvider` for real compression.
//!
//! Run: cargo run --example basic_chat

use async_trait::async_trait;
use obsmem::{
    LlmProvider, MemoryConfig, ObservationalMemory, Prompt, ProviderError, Pulse, Role,
};
use std::sync::Arc;
use std::time::Duration;

/// Pretends to be an Observer/Reflector model
struct ScriptedProvider;

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(&self, prompt: &Prompt, _timeout: Duration) -> Result<String, ProviderError> {
        let lines = prompt
            .user
            .lines()
            .filter(|l| l.contains("user: "))
            .count();
        Ok(format!(
            "Date: 2026-02-23\n\
             - 🔴 10:00 User is building MediTrack, a medication tracker\n\
             - 🟡 10:05 Summarized {lines} user turns about the stack\n\
             CURRENT_TASK: Choosing a database\n\
             SUGGESTED_NEXT: Compare PostgreSQL and SQLite for offline use"
        ))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("🧠 obsmem - Basic Chat Example\n");

    let config = MemoryConfig::builder()
        .observer_token_threshold(60)
        .reflector_token_threshold(400)
        .message_retention_count(2)
        .build()?;
    let memory = ObservationalMemory::in_memory(Arc::new(ScriptedProvider), config)?;

    let mut pulses = memory.pulses().subscribe();
    tokio::spawn(async move {
        while let Ok(pulse) = pulses.recv().await {
            if !matches!(pulse, Pulse::MessageAdded { .. } | Pulse::ContextBuilt { .. }) {
                println!("  ⚡ {}", pulse.description());
            }
        }
    });

    let turns = [
        (Role::User, "I'm building a medication tracker called MediTrack for elderly patients."),
        (Role::Assistant, "Great idea. Which platforms do you want to support first?"),
        (Role::User, "iOS and Android, so probably React Native with Expo."),
        (Role::Assistant, "Expo works well. Do you need offline support for reminders?"),
        (Role::User, "Yes, reminders must work offline. Which database should I use?"),
        (Role::Assistant, "For offline-first, SQLite on device with sync to PostgreSQL is common."),
    ];

    for (role, content) in turns {
        memory.add_message("demo", role, content).await?;
    }

    let context = memory.get_context("demo").await?;
    println!("\n{}\n", context.to_prompt(true));

    let stats = memory.stats("demo");
    println!(
        "📊 {} messages, {} observer runs, compression ratio {:.1}x",
        stats.messages_added,
        stats.observer_runs,
        stats.compression_ratio()
    );
    if let Some(task) = context.current_task {
        println!("🎯 Current task: {task}");
    }

    Ok(())
}
