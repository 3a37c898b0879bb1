//! BookChat - git-backed chat with one branch per author
//!
//! Command-line entry point over the message store, pins, archive tier and
//! remote sync.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use bookchat_core::{Config, Message, ValidationError, format_timestamp, global_metrics};
use bookchat_keys::{KeyError, KeyOutcome};
use bookchat_storage::{
    ArchiveManager, BranchedMessageStore, PinBoard, PinOutcome, RepositoryError, StoreError,
};
use bookchat_sync::{PushOutcome, SyncCoordinator};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Keys(#[from] KeyError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl CliError {
    const fn error_type(&self) -> &'static str {
        match self {
            Self::Store(e) => e.error_type(),
            Self::Repository(e) => e.error_type(),
            Self::Keys(e) => e.error_type(),
            Self::Validation(e) => e.error_type(),
            Self::Json(_) => "SERIALIZATION_ERROR",
            Self::Io(_) => "OS_ERROR",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
        }
    }
}

type CliResult<T> = Result<T, CliError>;

#[derive(Parser, Debug)]
#[command(name = "bookchat")]
#[command(version, about = "BookChat - git-backed chat with one branch per author")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Append a message to the author's branch
    Post { author: String, content: String },

    /// Show every message from every branch in time order
    List {
        #[arg(long)]
        json: bool,
    },

    /// Show one message by author and file name
    Show { author: String, file: String },

    /// Show one message by id
    Get { id: String },

    /// Pin a message id
    Pin { id: String, by: String },

    /// Remove a pin
    Unpin { id: String },

    /// List pins, newest first
    Pins,

    /// Per-author branch metadata
    Authors,

    /// Commit history of an author's branch
    History {
        author: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Signing key commands
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Remote sync commands
    Sync {
        #[command(subcommand)]
        action: SyncAction,
    },

    /// Archive commands
    Archive {
        #[command(subcommand)]
        action: ArchiveAction,
    },

    /// Remove stale lock files left by crashed processes
    Heal,

    /// Print process metrics
    Stats,

    /// Run the archive and sync timers until killed
    Daemon,

    /// Show configuration
    Config,
}

#[derive(Subcommand, Debug)]
enum KeysAction {
    /// Create a keypair unless one exists
    Generate { author: String },
    /// Replace the signing key, keeping old public keys for verification
    Rotate { author: String },
    /// Print the public key history
    Show { author: String },
}

#[derive(Subcommand, Debug)]
enum SyncAction {
    /// Fetch and integrate branches (all known authors when none are given)
    Pull { authors: Vec<String> },
    /// Push one author's branch
    Push { author: String },
}

#[derive(Subcommand, Debug)]
enum ArchiveAction {
    /// Run one archive pass now
    Run,
}

fn main() {
    let cli = Cli::parse();
    let config = Config::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { config.log_level.as_str() }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = execute(cli.command, &config) {
        eprintln!("error [{}]: {err}", err.error_type());
        std::process::exit(1);
    }
}

fn execute(command: Commands, config: &Config) -> CliResult<()> {
    // only commands that touch the repository open it
    let store = || -> CliResult<Arc<BranchedMessageStore>> {
        Ok(Arc::new(BranchedMessageStore::open(config)?))
    };
    match command {
        Commands::Post { author, content } => {
            let store = store()?;
            let message = store.append(&author, &content)?;
            println!("{}", message.id);
            if config.sync_enabled && store.driver().has_remote() {
                match coordinator(&store, config).push_local(&author)? {
                    PushOutcome::Pushed { .. } => {}
                    PushOutcome::Stale(w) => {
                        eprintln!("warning [{}]: {} not pushed: {}", w.kind, w.branch, w.message);
                    }
                }
            }
        }
        Commands::List { json } => {
            let messages = store()?.list_all()?;
            if json {
                print_json(&messages)?;
            } else {
                for m in &messages {
                    println!("{}", render_line(m));
                }
            }
        }
        Commands::Show { author, file } => print_json(&store()?.get_by_file(&author, &file)?)?,
        Commands::Get { id } => print_json(&store()?.get_by_id(&id)?)?,
        Commands::Pin { id, by } => {
            match pin_board(&*store()?).pin(&id, &by)? {
                PinOutcome::Pinned(_) => println!("pinned {id}"),
                PinOutcome::AlreadyPinned(p) => println!("{id} already pinned by {}", p.pinned_by),
            }
        }
        Commands::Unpin { id } => {
            if pin_board(&*store()?).unpin(&id)? {
                println!("unpinned {id}");
            } else {
                println!("{id} was not pinned");
            }
        }
        Commands::Pins => print_json(&pin_board(&*store()?).list_pinned()?)?,
        Commands::Authors => print_json(&store()?.authors()?)?,
        Commands::History { author, limit } => print_json(&store()?.history(&author, limit)?)?,
        Commands::Keys { action } => handle_keys(&*store()?, action)?,
        Commands::Sync { action } => handle_sync(&store()?, config, action)?,
        Commands::Archive {
            action: ArchiveAction::Run,
        } => {
            let report = ArchiveManager::new(store()?, config.archive()).run_once()?;
            print_json(&report)?;
        }
        Commands::Heal => print_json(&store()?.driver().heal_worktree_locks()?)?,
        Commands::Stats => {
            // warm the read path so the snapshot reflects this repository
            let _ = store()?.list_all()?;
            print_json(&global_metrics().snapshot())?;
        }
        Commands::Daemon => run_daemon(store()?, config)?,
        Commands::Config => println!("{config:#?}"),
    }
    Ok(())
}

fn handle_keys(store: &BranchedMessageStore, action: KeysAction) -> CliResult<()> {
    let keys = store.keys();
    match action {
        KeysAction::Generate { author } => match keys.generate_keypair(&author)? {
            KeyOutcome::Generated { fingerprint } => println!("generated {fingerprint}"),
            KeyOutcome::AlreadyPresent { fingerprint } => println!("existing {fingerprint}"),
        },
        KeysAction::Rotate { author } => println!("rotated to {}", keys.rotate(&author)?),
        KeysAction::Show { author } => print_json(&keys.public_keys(&author)?)?,
    }
    Ok(())
}

fn handle_sync(store: &Arc<BranchedMessageStore>, config: &Config, action: SyncAction) -> CliResult<()> {
    if !store.driver().has_remote() {
        return Err(CliError::InvalidArgument(
            "no remote configured (set GIT_REMOTE_URL)".to_string(),
        ));
    }
    let sync = coordinator(store, config);
    match action {
        SyncAction::Pull { authors } => {
            let report = if authors.is_empty() {
                sync.pull_everything(store)
            } else {
                sync.pull_all(&authors)
            };
            for w in &report.stale {
                eprintln!("warning [{}]: {} is stale: {}", w.kind, w.branch, w.message);
            }
            print_json(&report)?;
        }
        SyncAction::Push { author } => print_json(&sync.push_local(&author)?)?,
    }
    Ok(())
}

fn run_daemon(store: Arc<BranchedMessageStore>, config: &Config) -> CliResult<()> {
    let mut tasks = Vec::new();
    let archive = config.archive();
    if archive.enabled {
        let manager = Arc::new(ArchiveManager::new(Arc::clone(&store), archive));
        tasks.push(manager.spawn()?);
    }
    if config.sync_enabled && store.driver().has_remote() {
        let sync = Arc::new(coordinator(&store, config));
        let interval = config.sync().interval;
        tasks.push(sync.spawn(Arc::clone(&store), interval)?);
    }
    if tasks.is_empty() {
        return Err(CliError::InvalidArgument(
            "nothing to run: enable ARCHIVE_ENABLED or SYNC_ENABLED".to_string(),
        ));
    }
    tracing::info!(
        tasks = tasks.len(),
        root = %store.driver().root().display(),
        "daemon started"
    );
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

fn coordinator(store: &Arc<BranchedMessageStore>, config: &Config) -> SyncCoordinator {
    SyncCoordinator::new(
        store.driver().clone(),
        &config.sync(),
        Arc::clone(store.clock()),
    )
}

fn pin_board(store: &BranchedMessageStore) -> PinBoard {
    PinBoard::new(Arc::clone(store.driver()), Arc::clone(store.clock()))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_line(m: &Message) -> String {
    let mut flags = String::new();
    if m.verified {
        flags.push_str(" [verified]");
    }
    if m.archived {
        flags.push_str(" [archived]");
    }
    format!(
        "{} {}{}: {}",
        format_timestamp(&m.created_at),
        m.author,
        flags,
        m.content
    )
}
