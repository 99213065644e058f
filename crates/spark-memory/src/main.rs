// spark-memory/crates/spark-memory/src/main.rs

#[cfg(feature = "cli")]
use anyhow::Context;
#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use spark_memory::{config::MemoryConfig, context_engine::parse_fact_blocks, telemetry, MemoryRuntime};

#[cfg(feature = "cli")]
#[derive(Parser, Debug)]
#[command(name = "spark-memory", version, about = "Inspect and maintain an agent's long-term memory")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Subcommand, Debug)]
enum Command {
    /// Print the system prompt a new conversation would start with
    Context {
        /// Number of recent sessions to summarize
        #[arg(short = 'n', long)]
        sessions: Option<usize>,
    },
    /// Full-text search over facts and messages
    Search {
        query: String,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// List stored sessions, newest first
    Sessions {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// List active facts
    Facts,
    /// Row counts and schema version
    Stats,
    /// Extract [MEMORY] facts from a saved reply
    Extract {
        file: std::path::PathBuf,
        /// Only show the candidates, record nothing
        #[arg(long)]
        dry_run: bool,
    },
}

#[cfg(feature = "cli")]
fn main() -> anyhow::Result<()> {
    telemetry::init_tracing();
    let args = Args::parse();
    let config = MemoryConfig::from_env()?;

    if let Command::Extract { file, dry_run: true } = &args.command {
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        for fact in parse_fact_blocks(&text) {
            println!("- {}", fact);
        }
        return Ok(());
    }

    let runtime = MemoryRuntime::open(config)?;
    match args.command {
        Command::Context { sessions } => {
            let n = sessions.unwrap_or(runtime.config().recent_sessions);
            println!("{}", runtime.build_context(n)?);
        }
        Command::Search { query, limit } => {
            let limit = limit.unwrap_or(runtime.config().search_limit);
            let results = runtime.search(&query, limit)?;
            if results.is_empty() {
                println!("No matches for '{}'", query);
            }
            for result in results {
                let when = result
                    .timestamp
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                let session = result.session_title.or(result.session_id).unwrap_or_default();
                println!("[{}] {:.3} {} {}\n    {}", result.source, result.rank, when, session, result.content);
            }
        }
        Command::Sessions { limit } => {
            for session in runtime.store().conversations.list_sessions(limit)? {
                let count = runtime.store().conversations.get_session_message_count(&session.id)?;
                println!(
                    "{}  {}  {:>4} msg  {}",
                    session.id,
                    session.created_at.format("%Y-%m-%d %H:%M"),
                    count,
                    session.title.unwrap_or_default()
                );
            }
        }
        Command::Facts => {
            for fact in runtime.store().facts.get_active_facts()? {
                println!("#{:<5} [{}] {}", fact.id, fact.category, fact.fact);
            }
        }
        Command::Stats => {
            let stats = runtime.store().get_stats()?;
            println!("schema version:  {}", stats.schema_version);
            println!("sessions:        {}", stats.total_sessions);
            println!("messages:        {}", stats.total_messages);
            println!("facts:           {} ({} active)", stats.total_facts, stats.active_facts);
            println!("database size:   {} bytes", stats.database_size_bytes);
        }
        Command::Extract { file, .. } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let accepted = runtime.extractor().extract(&text);
            println!("{} new fact(s)", accepted.len());
            for fact in accepted {
                println!("- {}", fact);
            }
        }
    }
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
