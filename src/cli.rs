//! obsmem CLI - inspect and drive observational memory from the shell
//!
//! Usage:
//!   obsmem add <thread> "content"     Append a message (may trigger compression)
//!   obsmem context <thread>           Print the context window
//!   obsmem observe <thread>           Force an Observer pass
//!   obsmem reflect <thread>           Force a Reflector pass
//!   obsmem observations <thread>      List the observation log
//!   obsmem state <thread>             Show compression state and savings
//!   obsmem prune <thread>             Delete compressed raw messages
//!   obsmem clear <thread>             Remove everything for a thread

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use obsmem::{
    CompressionOutcome, LlmProvider, MemoryConfig, ObservationalMemory, OllamaProvider,
    OpenAiCompatibleProvider, OpenAiConfig, Priority, Role,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "obsmem")]
#[command(about = "obsmem - Observational memory for AI agents")]
#[command(version)]
struct Cli {
    /// Path to data directory
    #[arg(short, long, default_value = "./obsmem_data")]
    data_dir: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Completion backend for the Observer and Reflector
    #[arg(long, value_enum, default_value = "openai")]
    provider: ProviderKind,

    /// Base URL of the provider API
    #[arg(long)]
    base_url: Option<String>,

    /// Model name
    #[arg(long)]
    model: Option<String>,

    /// API key for OpenAI-compatible endpoints
    #[arg(long, env = "OM_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Use low demo thresholds
    #[arg(long)]
    demo: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append a message to a thread
    Add {
        thread: String,

        /// Message content
        content: String,

        /// Author role
        #[arg(short, long, value_enum, default_value = "user")]
        role: CliRole,
    },

    /// Print the context window for a thread
    Context {
        thread: String,

        /// Output JSON instead of prompt text
        #[arg(long)]
        json: bool,

        /// Override the recent-message token budget
        #[arg(short, long)]
        budget: Option<usize>,

        /// Omit section headers
        #[arg(long)]
        no_header: bool,
    },

    /// Run an Observer pass now
    Observe { thread: String },

    /// Run a Reflector pass now
    Reflect { thread: String },

    /// List the observation log
    Observations { thread: String },

    /// Show compression state and counters
    State { thread: String },

    /// Delete raw messages already covered by observations
    Prune { thread: String },

    /// Remove all messages and observations of a thread
    Clear {
        thread: String,

        /// Skip confirmation
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProviderKind {
    Openai,
    Ollama,
}

#[derive(Clone, Copy, ValueEnum)]
enum CliRole {
    User,
    Assistant,
    System,
    Tool,
}

impl From<CliRole> for Role {
    fn from(role: CliRole) -> Self {
        match role {
            CliRole::User => Role::User,
            CliRole::Assistant => Role::Assistant,
            CliRole::System => Role::System,
            CliRole::Tool => Role::Tool,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "info,obsmem=debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let memory = open_memory(&cli).await?;

    match cli.command {
        Commands::Add {
            thread,
            content,
            role,
        } => cmd_add(&memory, &thread, &content, role.into()).await,
        Commands::Context {
            thread,
            json,
            budget,
            no_header,
        } => cmd_context(&memory, &thread, json, budget, no_header).await,
        Commands::Observe { thread } => {
            let outcome = memory.force_observe(&thread).await?;
            print_outcome("Observer", &outcome);
            Ok(())
        }
        Commands::Reflect { thread } => {
            let outcome = memory.force_reflect(&thread).await?;
            print_outcome("Reflector", &outcome);
            Ok(())
        }
        Commands::Observations { thread } => cmd_observations(&memory, &thread).await,
        Commands::State { thread } => cmd_state(&memory, &thread).await,
        Commands::Prune { thread } => {
            let removed = memory.prune_compressed(&thread).await?;
            println!("{}", format!("Pruned {} messages", removed).green());
            Ok(())
        }
        Commands::Clear { thread, force } => cmd_clear(&memory, &thread, force).await,
    }
}

async fn open_memory(cli: &Cli) -> anyhow::Result<ObservationalMemory> {
    let provider: Arc<dyn LlmProvider> = match cli.provider {
        ProviderKind::Openai => {
            let mut config = OpenAiConfig {
                api_key: cli.api_key.clone(),
                ..OpenAiConfig::default()
            };
            if let Some(base) = &cli.base_url {
                config.endpoint = format!("{}/chat/completions", base.trim_end_matches('/'));
            }
            if let Some(model) = &cli.model {
                config.model = model.clone();
            }
            Arc::new(OpenAiCompatibleProvider::new(config)?)
        }
        ProviderKind::Ollama => Arc::new(OllamaProvider::new(
            cli.base_url.as_deref().unwrap_or("http://localhost:11434"),
            cli.model.as_deref().unwrap_or("llama3.1"),
        )?),
    };

    let base = if cli.demo {
        MemoryConfig::demo()
    } else {
        MemoryConfig::default()
    };
    let config = base.from_env();

    Ok(ObservationalMemory::open(&cli.data_dir, provider, config).await?)
}

async fn cmd_add(
    memory: &ObservationalMemory,
    thread: &str,
    content: &str,
    role: Role,
) -> anyhow::Result<()> {
    let message = memory.add_message(thread, role, content).await?;
    memory.wait_idle(thread).await;

    println!("{}", "Message added".green().bold());
    println!("  Thread:   {}", thread.cyan());
    println!("  Sequence: {}", message.sequence);

    let state = memory.compression_state(thread).await?;
    println!(
        "  Compressed through {} ({} pending raw tokens)",
        state.last_compressed_sequence, state.raw_token_estimate
    );
    Ok(())
}

async fn cmd_context(
    memory: &ObservationalMemory,
    thread: &str,
    json: bool,
    budget: Option<usize>,
    no_header: bool,
) -> anyhow::Result<()> {
    let context = match budget {
        Some(budget) => memory.get_context_with_budget(thread, budget).await?,
        None => memory.get_context(thread).await?,
    };

    if json {
        println!("{}", context.to_json()?);
    } else {
        println!("{}", context.to_prompt(!no_header));
        eprintln!(
            "{}",
            format!(
                "{} observation tokens + {} message tokens",
                context.observation_tokens, context.message_tokens
            )
            .dimmed()
        );
    }
    Ok(())
}

async fn cmd_observations(memory: &ObservationalMemory, thread: &str) -> anyhow::Result<()> {
    let observations = memory.observations(thread).await?;
    if observations.is_empty() {
        println!("{}", "No observations yet".yellow());
        return Ok(());
    }

    println!("{}", format!("{} observations", observations.len()).bold());
    for obs in &observations {
        let text = match obs.priority {
            Priority::Critical => obs.text.red(),
            Priority::Important => obs.text.yellow(),
            Priority::Info => obs.text.normal(),
        };
        println!(
            "{} {} {} {}",
            obs.priority,
            obs.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed(),
            text,
            format!("(through #{})", obs.covers_through).dimmed()
        );
    }
    Ok(())
}

async fn cmd_state(memory: &ObservationalMemory, thread: &str) -> anyhow::Result<()> {
    let state = memory.compression_state(thread).await?;
    let config = memory.config();

    println!("{}", "Compression State".bold().underline());
    println!("  Phase:              {}", state.phase.to_string().cyan());
    println!("  Compressed through: {}", state.last_compressed_sequence);
    println!(
        "  Raw tokens:         {} / {}",
        state.raw_token_estimate, config.observer_token_threshold
    );
    println!(
        "  Observation tokens: {} / {}",
        state.observation_token_estimate, config.reflector_token_threshold
    );
    println!("  Stored messages:    {}", memory.store().count(thread).await?);

    if config.track_costs {
        let report = memory.savings_report(thread);
        println!();
        println!("{}", "Savings Report".bold().underline());
        println!("  OM cost:            ${:.4}", report.om_cost);
        println!("  Est. RAG cost:      ${:.4}", report.estimated_rag_cost);
        println!(
            "  Savings:            {} ({:.1}%)",
            format!("${:.4}", report.savings_dollars).green(),
            report.savings_percentage
        );
        println!("  Compression ratio:  {:.1}x", report.compression_ratio);
        println!(
            "  Passes:             {} observer, {} reflector over {} messages",
            report.observer_runs, report.reflector_runs, report.messages_processed
        );
    }
    Ok(())
}

async fn cmd_clear(memory: &ObservationalMemory, thread: &str, force: bool) -> anyhow::Result<()> {
    if !force {
        println!(
            "{}",
            format!("Refusing to clear '{}' without --force", thread).yellow()
        );
        return Ok(());
    }
    memory.clear_thread(thread).await?;
    println!("{}", format!("Thread '{}' cleared", thread).green());
    Ok(())
}

fn print_outcome(stage: &str, outcome: &CompressionOutcome) {
    match outcome {
        CompressionOutcome::Observed {
            entries,
            covers_through,
        } => println!(
            "{}",
            format!(
                "{}: {} new observations (through #{})",
                stage, entries, covers_through
            )
            .green()
        ),
        CompressionOutcome::Reflected {
            entries_before,
            entries_after,
        } => println!(
            "{}",
            format!("{}: {} -> {} observations", stage, entries_before, entries_after).green()
        ),
        CompressionOutcome::NothingToCompress => {
            println!("{}", format!("{}: nothing to compress", stage).yellow())
        }
        CompressionOutcome::Busy => {
            println!("{}", format!("{}: another pass is running", stage).yellow())
        }
        CompressionOutcome::Abandoned { reason } => {
            println!("{}", format!("{} failed: {}", stage, reason).red())
        }
    }
}
