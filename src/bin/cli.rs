//! index-helper CLI - shared-memory index publisher.
//!
//! Usage:
//!   index-helper daemon [--exit-after 10m] [--detach]   # Run the daemon
//!   index-helper poke                                   # Ask for a fresh publish
//!   index-helper refresh                                # Force a republish
//!   index-helper status                                 # Daemon state as JSON
//!   index-helper stop                                   # Shut the daemon down
//!   index-helper read [--json]                          # Load the index like a client

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use index_helper::daemon::{self, Request, Response};
use index_helper::{HelperConfig, IdleTimeout, IndexSource};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "index-helper")]
#[command(about = "Keep the repository index published in shared memory", long_about = None)]
struct Cli {
    /// Repository metadata directory (default: .git)
    #[arg(short, long, default_value = ".git", global = true)]
    git_dir: PathBuf,

    /// Shared segment name prefix
    #[arg(long, global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the index helper daemon
    Daemon(DaemonArgs),

    /// Ask the daemon to make sure the published index is fresh
    Poke,

    /// Re-read and republish the index now
    Refresh,

    /// Show daemon state and live segments
    Status,

    /// Stop the daemon, removing its segments
    Stop,

    /// Load the index through shared memory (falling back to disk)
    Read {
        /// Print every entry as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct DaemonArgs {
    /// Exit after this long without events (minutes, or 90s/10m/2h; 0 = never)
    #[arg(long, value_parser = parse_idle)]
    exit_after: Option<IdleTimeout>,

    /// Verify every published segment
    #[arg(long, conflicts_with = "no_strict")]
    strict: bool,

    /// Skip verification
    #[arg(long)]
    no_strict: bool,

    /// Detach from the terminal
    #[arg(long)]
    detach: bool,

    /// Don't watch the index for changes
    #[arg(long)]
    no_watch: bool,
}

fn parse_idle(s: &str) -> std::result::Result<IdleTimeout, String> {
    s.parse().map_err(|e: index_helper::IndexHelperError| e.to_string())
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("index_helper=info")),
        )
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let git_dir = &cli.git_dir;
    if !git_dir.is_dir() {
        bail!("not a repository metadata directory: {}", git_dir.display());
    }
    let mut config = HelperConfig::load(git_dir).context("failed to load configuration")?;
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    config.validate()?;

    match cli.command {
        Commands::Daemon(args) => {
            if let Some(idle) = args.exit_after {
                config.exit_after = idle;
            }
            if args.strict {
                config.strict = true;
            }
            if args.no_strict {
                config.strict = false;
            }
            config.detach |= args.detach;
            if args.no_watch {
                config.watch = false;
            }
            daemon::run_daemon(git_dir, &config).context("index helper daemon failed")?;
        }

        Commands::Poke => {
            let response = daemon::poke(git_dir, config.poke_timeout())?;
            print_response(&response)?;
        }

        Commands::Refresh => {
            let response = daemon::request(git_dir, &Request::Refresh, control_timeout(&config))?;
            print_response(&response)?;
        }

        Commands::Status => {
            if !daemon::is_daemon_running(git_dir) {
                println!("index helper is not running");
                return Ok(());
            }
            let response = daemon::request(git_dir, &Request::Status, control_timeout(&config))?;
            print_response(&response)?;
        }

        Commands::Stop => {
            if !daemon::is_daemon_running(git_dir) {
                println!("index helper is not running");
                return Ok(());
            }
            let response = daemon::request(git_dir, &Request::Shutdown, control_timeout(&config))?;
            print_response(&response)?;
        }

        Commands::Read { json } => read(git_dir, &config, json)?,
    }

    Ok(())
}

/// Refresh and stop may run a full publish cycle before replying.
fn control_timeout(config: &HelperConfig) -> Duration {
    config.poke_timeout().max(Duration::from_secs(10))
}

fn print_response(response: &Response) -> Result<()> {
    match response {
        Response::Error { message } => bail!("daemon error: {}", message),
        other => {
            println!("{}", serde_json::to_string_pretty(other)?);
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct EntryView {
    name: String,
    mode: String,
    oid: String,
    stage: u8,
}

#[derive(Serialize)]
struct BaseView {
    hash: String,
    entries: usize,
}

#[derive(Serialize)]
struct ReadReport {
    source: IndexSource,
    hash: String,
    version: u32,
    base: Option<BaseView>,
    entries: Vec<EntryView>,
}

fn read(git_dir: &Path, config: &HelperConfig, json: bool) -> Result<()> {
    let loaded = daemon::read_index(git_dir, config)
        .with_context(|| format!("failed to read index in {}", git_dir.display()))?;
    let snapshot = &loaded.snapshot;

    let entries: Vec<EntryView> = snapshot.entries().iter().map(entry_view).collect();
    let base = snapshot.split_base().map(|b| BaseView {
        hash: b.hash().to_hex(),
        entries: b.len(),
    });

    if json {
        let report = ReadReport {
            source: loaded.source,
            hash: snapshot.hash().to_hex(),
            version: snapshot.version(),
            base,
            entries,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for entry in &entries {
            println!("{} {} {}\t{}", entry.mode, entry.oid, entry.stage, entry.name);
        }
        eprintln!(
            "{} entries from {}",
            entries.len(),
            match loaded.source {
                IndexSource::SharedMemory => "shared memory",
                IndexSource::Disk => "disk",
            }
        );
    }
    Ok(())
}

fn entry_view(entry: &index_helper::IndexEntry) -> EntryView {
    EntryView {
        name: entry.name_lossy().into_owned(),
        mode: format!("{:06o}", entry.mode),
        oid: entry.oid.to_hex(),
        stage: entry.stage(),
    }
}
