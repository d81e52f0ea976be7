use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use serde_json::Value;

use feedlease::{
    ChangeEvent, Config, Filter, LeaseStore, OperationKind, Shutdown,
    clock::SystemClock,
    feed::file::FileFeed,
    store::FileLeaseStore,
    worker,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the primary collection's change log
    #[arg(long, env = "FEEDLEASE_DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Directory holding lease records (defaults to <data-dir>/leases)
    #[arg(long, env = "FEEDLEASE_LEASE_DIR")]
    lease_dir: Option<PathBuf>,

    /// Role contended for by every worker sharing the lease directory
    #[arg(long, env = "FEEDLEASE_OWNER_KEY", default_value = "feed-worker")]
    owner_key: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a worker, printing each delivered change as a JSON line
    Run(RunArgs),
    /// Append a change to the primary change log
    Publish {
        #[arg(long, default_value = "insert")]
        op: OperationKind,
        /// Full document as JSON
        document: String,
    },
    /// Print the current lease record
    Lease,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Identity recorded in the lease (defaults to $HOSTNAME plus the pid)
    #[arg(long, env = "FEEDLEASE_HOST_NAME")]
    host_name: Option<String>,

    /// Seconds between lease renewals and passive checks
    #[arg(long, env = "FEEDLEASE_HEALTH_CHECK_SECS", default_value_t = 5)]
    health_check_secs: u64,

    /// Seconds without renewal after which the lease is abandoned
    #[arg(long, env = "FEEDLEASE_STALE_SECS")]
    stale_secs: Option<u64>,

    /// Idle wait between change log polls, in milliseconds
    #[arg(long, env = "FEEDLEASE_POLL_MS", default_value_t = 100)]
    poll_ms: u64,

    /// Consume unconditionally, without a lease
    #[arg(long, env = "FEEDLEASE_NO_COORDINATION")]
    no_coordination: bool,

    /// Operation kinds to deliver (repeatable; all when omitted)
    #[arg(long = "op")]
    ops: Vec<OperationKind>,

    /// Deliver only documents where a dotted field equals a value,
    /// e.g. --match customer.tier=gold (repeatable)
    #[arg(long = "match", value_parser = parse_match)]
    matches: Vec<(String, Value)>,
}

static STOP: AtomicBool = AtomicBool::new(false);

fn main() {
    env_logger::init();
    if let Err(e) = try_main() {
        error!("{e:#}");
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    let lease_dir = cli
        .lease_dir
        .clone()
        .unwrap_or_else(|| cli.data_dir.join("leases"));

    match cli.command {
        Command::Run(args) => run(&cli.data_dir, &lease_dir, cli.owner_key, args),
        Command::Publish { op, document } => {
            let document: Value =
                serde_json::from_str(&document).context("document is not valid JSON")?;
            let feed = open_feed(&cli.data_dir)?;
            let event = feed
                .append(op, document)
                .context("Failed to append to change log")?;
            println!("{}", serde_json::to_string(&event)?);
            Ok(())
        }
        Command::Lease => {
            let store = FileLeaseStore::open(&lease_dir)
                .with_context(|| format!("Failed to open lease dir {}", lease_dir.display()))?;
            match store.get(&cli.owner_key)? {
                Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
                None => info!("no lease recorded for '{}'", cli.owner_key),
            }
            Ok(())
        }
    }
}

fn run(data_dir: &Path, lease_dir: &Path, owner_key: String, args: RunArgs) -> Result<()> {
    let mut filter = Filter::new();
    if !args.ops.is_empty() {
        filter = filter.operations(args.ops);
    }
    for (path, value) in args.matches {
        filter = filter.field_eq(path, value);
    }

    let host_name = args.host_name.unwrap_or_else(default_host_name);
    let mut builder = Config::builder(owner_key, host_name)
        .health_check_interval(Duration::from_secs(args.health_check_secs))
        .poll_interval(Duration::from_millis(args.poll_ms))
        .coordination_enabled(!args.no_coordination)
        .filter(filter);
    if let Some(secs) = args.stale_secs {
        builder = builder.lease_stale_interval(Duration::from_secs(secs));
    }
    let config = builder.build().context("Invalid configuration")?;
    info!("Config: {}", serde_json::to_string(&config)?);
    info!("Change log: {}", data_dir.display());
    info!("Lease dir: {}", lease_dir.display());

    let feed = open_feed(data_dir)?;
    let store = FileLeaseStore::open(lease_dir)
        .with_context(|| format!("Failed to open lease dir {}", lease_dir.display()))?;
    let lease_feed = store.feed();

    let shutdown = Shutdown::new();
    install_signal_handlers();
    {
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            while !STOP.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(50));
            }
            info!("signal received, shutting down");
            shutdown.trigger();
        });
    }

    let stdout = std::io::stdout();
    let mut handler = |event: &ChangeEvent| -> feedlease::Result<()> {
        let mut out = stdout.lock();
        serde_json::to_writer(&mut out, event)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    };

    worker::run(
        &feed,
        &lease_feed,
        &store,
        &config,
        &SystemClock,
        &mut handler,
        &shutdown,
    )
    .context("Worker stopped")
}

fn open_feed(data_dir: &Path) -> Result<FileFeed> {
    FileFeed::open(data_dir)
        .with_context(|| format!("Failed to open change log in {}", data_dir.display()))
}

fn default_host_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{host}-{}", std::process::id())
}

/// Parses `path=value`. The value is read as JSON when it parses, otherwise
/// as a plain string.
fn parse_match(raw: &str) -> std::result::Result<(String, Value), String> {
    let (path, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected path=value, got '{raw}'"))?;
    if path.is_empty() {
        return Err(format!("empty field path in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((path.to_string(), value))
}

#[cfg(unix)]
extern "C" fn on_signal(_: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    // SAFETY: the handler only stores to an atomic.
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}
