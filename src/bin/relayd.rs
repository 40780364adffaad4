//! relay daemon - WebSocket fan-out over a shared pub/sub store
//!
//! This binary serves WebSocket clients, relays their messages through the
//! shared store so every relay process delivers them, and runs the
//! periodic push job.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! relayd start
//!
//! # Start the daemon (background/daemonized) with a config file
//! relayd -c /etc/relay/relay.toml start -d
//!
//! # Stop the daemon
//! relayd stop
//!
//! # Check daemon status
//! relayd status
//!
//! # Publish one message to a channel through the shared store
//! relayd publish ws_example_channel "hello"
//! ```

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relay_core::ChannelName;
use relayd::config::{self, RelayConfig, StoreBackend};
use relayd::queue::QUEUE_CAPACITY;
use relayd::store::SharedStore;
use relayd::{
    spawn_broadcast_queue, spawn_push_job, AppState, DistributedLock, Hub, RelayServer,
    SessionSettings,
};

/// How long `relayd stop` waits for the daemon to exit.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// relay daemon - WebSocket fan-out over Redis/KeyDB pub/sub
#[derive(Parser, Debug)]
#[command(name = "relayd", version, about)]
struct Args {
    /// Path to a TOML config file
    #[arg(short = 'c', long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
    /// Publish one message to a channel and exit
    Publish {
        /// Target channel name
        channel: String,
        /// Message text, published verbatim
        message: String,
    },
}

/// Runtime files live under `$XDG_STATE_HOME/relay` (or `/tmp/relay`).
fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("relay")
}

/// PID file of the running daemon.
struct PidFile {
    path: PathBuf,
}

impl PidFile {
    fn new() -> Self {
        Self {
            path: state_dir().join("relayd.pid"),
        }
    }

    /// PID of a live daemon. A file naming a dead process is removed.
    fn live_pid(&self) -> Option<u32> {
        let pid: u32 = fs::read_to_string(&self.path).ok()?.trim().parse().ok()?;
        if process_alive(pid) {
            Some(pid)
        } else {
            self.remove();
            None
        }
    }

    /// Records this process; the returned guard removes the file on drop.
    fn claim(&self) -> Result<PidGuard<'_>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("Failed to create state directory")?;
        }
        fs::write(&self.path, process::id().to_string()).context("Failed to write PID file")?;
        Ok(PidGuard(self))
    }

    fn remove(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

struct PidGuard<'a>(&'a PidFile);

impl Drop for PidGuard<'_> {
    fn drop(&mut self) {
        self.0.remove();
    }
}

#[cfg(unix)]
fn signal_pid(pid: u32, signal: libc::c_int) -> Result<()> {
    let pid = libc::pid_t::try_from(pid).context("PID out of range")?;
    if unsafe { libc::kill(pid, signal) } != 0 {
        bail!("Failed to signal process {pid}");
    }
    Ok(())
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    // Signal 0 only checks that the process exists.
    signal_pid(pid, 0).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

/// Sends SIGTERM and waits up to `STOP_TIMEOUT` for the process to exit.
fn stop_daemon(pid: u32) -> Result<()> {
    #[cfg(unix)]
    signal_pid(pid, libc::SIGTERM)?;
    #[cfg(not(unix))]
    bail!("Stop is only supported on Unix systems");

    let deadline = Instant::now() + STOP_TIMEOUT;
    while Instant::now() < deadline {
        if !process_alive(pid) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    bail!("Daemon (PID {pid}) did not stop within {}s", STOP_TIMEOUT.as_secs())
}

fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    config::load(path).context("Failed to load configuration")
}

fn main() -> Result<()> {
    let args = Args::parse();
    let pid_file = PidFile::new();

    match args.command.unwrap_or(Command::Start { daemon: false }) {
        Command::Start { daemon } => {
            let config = load_config(args.config.as_deref())?;

            if let Some(pid) = pid_file.live_pid() {
                bail!("Daemon is already running (PID {pid}); use 'relayd stop' first");
            }
            if daemon {
                daemonize()?;
            }

            let _guard = pid_file.claim()?;
            run_daemon(config, args.log_json)
        }
        Command::Stop => {
            let Some(pid) = pid_file.live_pid() else {
                println!("Daemon is not running.");
                return Ok(());
            };
            println!("Stopping daemon (PID {pid})...");
            stop_daemon(pid)?;
            println!("Daemon stopped.");
            Ok(())
        }
        Command::Status => {
            let Some(pid) = pid_file.live_pid() else {
                println!("Daemon is not running.");
                process::exit(1);
            };
            println!("Daemon is running (PID {pid})");
            let config = load_config(args.config.as_deref())?;
            println!("Listen: {}", config.listen);
            println!("Store: {:?} ({})", config.store.backend, config.store.endpoint);
            Ok(())
        }
        Command::Publish { channel, message } => {
            let config = load_config(args.config.as_deref())?;
            publish_once(config, channel, message, args.log_json)
        }
    }
}

fn daemonize() -> Result<()> {
    let log_path = state_dir().join("relayd.log");
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file")?;
    let stderr = stdout.try_clone().context("Failed to duplicate log file handle")?;

    daemonize::Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;
    Ok(())
}

fn init_tracing(json: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("relayd=info".parse()?)
        .add_directive("relay_core=info".parse()?)
        .add_directive("relay_protocol=info".parse()?);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn run_daemon(config: RelayConfig, log_json: bool) -> Result<()> {
    init_tracing(log_json)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "relay daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let store = relayd::store::connect(&config.store)
        .await
        .context("Failed to connect to the shared store")?;
    info!(backend = store.backend_name(), "Shared store connected");

    let hub = Hub::new(
        Arc::clone(&store),
        config.broadcast_kind(),
        config.per_user_kind()?,
    );

    let (queue, queue_worker) =
        spawn_broadcast_queue(hub.clone(), QUEUE_CAPACITY, cancel_token.clone());

    let push_job = if config.push.enabled {
        let lock = DistributedLock::new(Arc::clone(&store), &config.lock);
        Some(spawn_push_job(
            queue,
            lock,
            config.push_channel(),
            config.push.interval(),
            cancel_token.clone(),
        ))
    } else {
        drop(queue);
        None
    };

    let state = AppState {
        hub,
        store,
        settings: SessionSettings::from(&config.session),
        shutdown: cancel_token.clone(),
    };
    let server = RelayServer::bind(config.listen_addr()?, state).await?;

    let result = server.run().await;
    // The server may exit on its own; make sure background jobs follow.
    cancel_token.cancel();

    if let Some(job) = push_job {
        if let Err(e) = job.await {
            warn!(error = %e, "Push job ended abnormally");
        }
    }
    if let Err(e) = queue_worker.await {
        warn!(error = %e, "Broadcast queue worker ended abnormally");
    }

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("relay daemon stopped");
    Ok(())
}

#[tokio::main]
async fn publish_once(
    config: RelayConfig,
    channel: String,
    message: String,
    log_json: bool,
) -> Result<()> {
    init_tracing(log_json)?;

    if config.store.backend == StoreBackend::Memory {
        bail!("The memory backend is process-local; publish needs a shared store");
    }

    let channel = ChannelName::parse(channel).context("Invalid channel name")?;
    let store = relayd::store::connect(&config.store)
        .await
        .context("Failed to connect to the shared store")?;

    publish_message(store.as_ref(), &channel, &message).await?;
    println!("Published to {channel}");
    Ok(())
}

/// Publishes `message` verbatim, straight to the store, so a failed
/// PUBLISH fails the command.
async fn publish_message(
    store: &dyn SharedStore,
    channel: &ChannelName,
    message: &str,
) -> Result<()> {
    store
        .publish(channel.as_str(), message)
        .await
        .with_context(|| format!("Failed to publish to {channel}"))
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
