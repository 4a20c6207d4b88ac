// context-keeper/crates/context-keeper/src/main.rs

#[cfg(feature = "cli")]
use anyhow::Context;
#[cfg(feature = "cli")]
use clap::{Parser, Subcommand, ValueEnum};
#[cfg(feature = "cli")]
use context_keeper::{
    config::ContextConfig, memory_db::MemoryDatabase, metrics, telemetry, utils::preview, HeuristicCounter,
    LLMWorker, SessionManager, TiktokenCounter,
};
#[cfg(feature = "cli")]
use std::sync::Arc;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "context-keeper", about = "Inspect and drive context-managed sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Clone, Copy, ValueEnum)]
enum Speaker {
    User,
    Assistant,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Append a message, creating the session if needed, then compress if over threshold
    Say {
        session: String,
        speaker: Speaker,
        text: String,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Print the active history
    History {
        session: String,
        #[arg(long)]
        window: Option<usize>,
        /// Include compressed messages
        #[arg(long)]
        all: bool,
    },
    /// Session counters and token budget
    Stats { session: String },
    /// Force a compression round
    Compress { session: String },
    /// Recompute session counters from the message log
    Repair { session: String },
    /// Compression history
    Rounds { session: String },
    /// List sessions, most recently active first
    Sessions {
        #[arg(long)]
        user: Option<String>,
    },
    /// Database totals and process metrics
    Db,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    metrics::init_metrics();

    let cli = Cli::parse();
    let config = Arc::new(ContextConfig::from_env()?);
    config.print_config();

    let db = Arc::new(
        MemoryDatabase::new(&config.database_path)
            .with_context(|| format!("Failed to open {}", config.database_path.display()))?,
    );
    let counter = Arc::new(TiktokenCounter::new(HeuristicCounter::new(
        config.heuristic_chars_per_token,
    )));
    let summarizer = Arc::new(LLMWorker::new(&config));
    let manager = SessionManager::new(db, summarizer, counter, Arc::clone(&config));

    match cli.command {
        Command::Say { session, speaker, text, user } => {
            manager.get_or_create_session(Some(&session), &user)?;
            let message = match speaker {
                Speaker::User => manager.add_user_message(&session, &text)?,
                Speaker::Assistant => manager.add_assistant_message(&session, &text)?,
            };
            println!("{} {} ({} tokens)", message.seq_label(), message.role, message.token_count);
            if let Some(record) = manager.maybe_compress(&session).await {
                println!(
                    "compressed round {}: {} messages, saved {} tokens",
                    record.round,
                    record.original_message_count,
                    record.saved_tokens()
                );
            }
        }
        Command::History { session, window, all } => {
            let messages = if all {
                manager.get_all_messages(&session)?
            } else {
                manager.get_conversation_history(&session, window)?
            };
            for m in messages {
                let flag = if m.is_compressed { "x" } else { " " };
                println!("{} {:<5} {:<11} {:>6}  {}", flag, m.seq_label(), m.role, m.token_count, preview(&m.content, 80));
            }
        }
        Command::Stats { session } => {
            let budget = manager.budget(&session)?;
            println!("{}", serde_json::to_string_pretty(&budget)?);
        }
        Command::Compress { session } => {
            let record = manager.trigger_compression(&session).await?;
            println!(
                "round {}: {} messages, {} -> {} tokens (ratio {:.2})",
                record.round,
                record.original_message_count,
                record.compressed_token_count,
                record.summary_token_count,
                record.compression_ratio()
            );
        }
        Command::Repair { session } => {
            if !manager.recalculate_session_stats(&session) {
                anyhow::bail!("repair failed for session {}", session);
            }
            println!("{}", serde_json::to_string_pretty(&manager.budget(&session)?)?);
        }
        Command::Rounds { session } => {
            for record in manager.get_compression_history(&session)? {
                println!(
                    "round {:<3} {} messages  {:>7} -> {:<6} tokens  {}",
                    record.round,
                    record.original_message_count,
                    record.compressed_token_count,
                    record.summary_token_count,
                    record.created_at.to_rfc3339()
                );
            }
        }
        Command::Sessions { user } => {
            for s in manager.list_sessions(user.as_deref())? {
                println!(
                    "{}  user={}  tokens={}  turns={}  rounds={}  updated={}",
                    s.session_id,
                    s.user_id,
                    s.total_token_count,
                    s.message_count,
                    s.compression_count,
                    s.updated_at.to_rfc3339()
                );
            }
        }
        Command::Db => {
            let stats = manager.database().get_stats()?;
            println!("sessions:     {}", stats.total_sessions);
            println!("messages:     {} ({} active)", stats.total_messages, stats.active_messages);
            println!("compressions: {}", stats.total_compressions);
            println!("size:         {} bytes", stats.database_size_bytes);
            print!("{}", metrics::gather_metrics());
        }
    }

    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
