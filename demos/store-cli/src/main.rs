mod commands;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use hotfix_store::config::Config;
use hotfix_store::{AnyStoreFactory, StoreFactory};
use std::path::Path;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    config: String,
    #[arg(short, long)]
    logfile: Option<String>,
    /// Index of the session in the config file.
    #[arg(short, long, default_value_t = 0)]
    session: usize,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the sequence numbers and timestamps of the session.
    Show,
    /// Print stored messages, with SOH shown as '|'.
    Messages {
        #[arg(short, long, default_value_t = 1)]
        begin: u64,
        #[arg(short, long, default_value_t = u64::MAX)]
        end: u64,
    },
    /// Store a message, written with '|' in place of SOH.
    Add { sequence_number: u64, message: String },
    /// Drop all messages and restart both sequences from 1.
    Reset,
    SetNextSender { sequence_number: u64 },
    SetNextTarget { sequence_number: u64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.logfile {
        let p = Path::new(path);
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let logfile = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(p)
            .with_context(|| format!("failed to open log file {}", path))?;
        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            .with_writer(logfile)
            .with_env_filter(EnvFilter::from_default_env())
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    }

    let config = Config::load_from_path(&args.config)?;
    let session_id = config
        .sessions
        .get(args.session)
        .ok_or_else(|| anyhow!("config has no session at index {}", args.session))?;
    debug!(%session_id, "selected session");

    let factory = AnyStoreFactory::from_config(&config.store)?;
    let store = factory.create(session_id).await?;
    commands::run_and_close(&factory, store, session_id, args.command).await
}
