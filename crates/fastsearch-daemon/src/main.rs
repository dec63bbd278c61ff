use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fastsearch_core::FastSearchConfig;
use serde_json::json;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "fastsearchd")]
#[command(about = "Hybrid search daemon over a local socket", long_about = None)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (the default when no subcommand is given).
    Run {
        /// Detach into the background, with stdio on /dev/null.
        #[arg(long)]
        detach: bool,
    },
    /// Stop a running daemon via its PID file.
    Stop,
    /// Print a running daemon's status as JSON.
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = fastsearch_core::load_config(cli.config.as_deref())?;

    match cli.command.unwrap_or(Command::Run { detach: false }) {
        Command::Run { detach } => run(config, detach),
        Command::Stop => stop(&config),
        Command::Status => status(&config),
    }
}

fn run(config: FastSearchConfig, detach: bool) -> Result<()> {
    init_tracing(&config.daemon.log_level);
    if detach {
        daemonize()?;
    }
    // The runtime is built after the fork: forking a live multi-threaded
    // runtime is undefined behavior territory.
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(fastsearch_daemon::run_daemon(config))
}

fn stop(config: &FastSearchConfig) -> Result<()> {
    let pid_path = Path::new(&config.daemon.pid_path);
    if !pid_path.exists() {
        println!("daemon is not running");
        return Ok(());
    }
    let raw = std::fs::read_to_string(pid_path)
        .with_context(|| format!("failed to read pid file {}", pid_path.display()))?;
    let Ok(pid) = raw.trim().parse::<i32>() else {
        std::fs::remove_file(pid_path)?;
        println!("removed stale pid file");
        return Ok(());
    };

    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        std::fs::remove_file(pid_path)?;
        println!("removed stale pid file");
        return Ok(());
    }

    // Give the daemon up to five seconds to exit.
    for _ in 0..50 {
        if unsafe { libc::kill(pid, 0) } != 0 {
            println!("daemon stopped");
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    bail!("daemon (pid {pid}) did not exit within 5 seconds");
}

fn status(config: &FastSearchConfig) -> Result<()> {
    let socket_path = PathBuf::from(&config.daemon.socket_path);
    let runtime = tokio::runtime::Runtime::new()?;
    let status = runtime
        .block_on(fastsearch_daemon::client::request(
            &socket_path,
            "status",
            json!({}),
        ))
        .with_context(|| format!("daemon not reachable at {}", socket_path.display()))?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level.to_lowercase()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Classic daemonization: fork, parent exits, child starts a new session
/// with stdio redirected to /dev/null.
fn daemonize() -> Result<()> {
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        bail!("fork failed: {}", std::io::Error::last_os_error());
    }
    if pid > 0 {
        println!("fastsearch daemon started (PID: {pid})");
        std::process::exit(0);
    }
    if unsafe { libc::setsid() } < 0 {
        bail!("setsid failed: {}", std::io::Error::last_os_error());
    }

    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")?;
    let fd = devnull.as_raw_fd();
    unsafe {
        libc::dup2(fd, libc::STDIN_FILENO);
        libc::dup2(fd, libc::STDOUT_FILENO);
        libc::dup2(fd, libc::STDERR_FILENO);
    }
    // The original descriptor stays open for the process lifetime.
    std::mem::forget(devnull);
    Ok(())
}
