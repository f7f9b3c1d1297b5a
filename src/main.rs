use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use herald_gateway::db::{DeliveryAttemptRepo, MessageRepo};
use herald_gateway::pipeline::{fallback_key, reply_key};
use herald_gateway::{Config, Daemon};

/// Herald - Messaging gateway that answers chats and voice notes with a language model
#[derive(Parser)]
#[command(name = "herald", version, about)]
struct Cli {
    /// Port to listen on (overrides config)
    #[arg(long, env = "HERALD_PORT")]
    port: Option<u16>,

    /// Database path (overrides config)
    #[arg(long, env = "HERALD_DB_PATH")]
    db: Option<std::path::PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve webhooks and run the pipeline (default)
    Serve,
    /// Re-drive unfinished messages once and exit
    Resume,
    /// Archive idle conversations once and exit
    Archive,
    /// Print the pipeline status of a message
    Status {
        /// Platform message id
        external_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity; RUST_LOG wins when set
    let filter = match cli.verbose {
        0 => "info,herald_gateway=info",
        1 => "info,herald_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            tracing::info!(port = config.server.port, "starting herald gateway");
            Daemon::new(config)?.run().await?;
        }
        Command::Resume => {
            let finished = Daemon::new(config)?.resume_once().await?;
            println!("Resumed {finished} message(s)");
        }
        Command::Archive => {
            let archived = Daemon::new(config)?.archive_once()?;
            println!("Archived {archived} conversation(s)");
        }
        Command::Status { external_id } => {
            let daemon = Daemon::new(config)?;
            cmd_status(&daemon, &external_id)?;
        }
    }

    Ok(())
}

/// Print a message's status, its replies, and every recorded attempt
fn cmd_status(daemon: &Daemon, external_id: &str) -> anyhow::Result<()> {
    let messages = MessageRepo::new(daemon.db().clone());
    let attempts = DeliveryAttemptRepo::new(daemon.db().clone());

    let Some(message) = messages.find_by_external_id(external_id)? else {
        anyhow::bail!("message not found: {external_id}");
    };

    println!("{external_id}: {}", message.status);
    println!("  conversation: {}", message.conversation_id);
    println!("  kind:         {}", message.kind.as_str());
    println!("  transcript:   {}", if message.transcript.is_some() { "yes" } else { "no" });

    let mut rows = vec![(external_id.to_string(), message.id)];
    for key in [reply_key(external_id), fallback_key(external_id)] {
        if let Some(outbound) = messages.find_by_external_id(&key)? {
            println!("{key}: {}", outbound.status);
            rows.push((key, outbound.id));
        }
    }

    for (label, id) in rows {
        for attempt in attempts.list(&id)? {
            println!(
                "  [{label}] {} #{} {} after {}ms{}",
                attempt.stage.as_str(),
                attempt.attempt_number,
                attempt.outcome.as_str(),
                attempt.delay.as_millis(),
                attempt
                    .error_detail
                    .map(|d| format!(" ({d})"))
                    .unwrap_or_default()
            );
        }
    }

    Ok(())
}
