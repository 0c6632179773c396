//! LogVault audit log server daemon.
//!
//! Parses the command line, reads the configuration file, daemonizes
//! (unless `-n`), wires signals into the event loop, and runs the server.

use std::fs;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::low_level::pipe;
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use logvault_server::{Config, Server, ServerOptions};

/// LogVault audit log server.
#[derive(Parser)]
#[command(name = "logvaultd", version, about = "LogVault audit log server")]
struct Cli {
    /// Path to the configuration file.
    #[arg(
        short = 'f',
        long = "file",
        value_name = "PATH",
        default_value = "/etc/logvault/logvaultd.toml"
    )]
    file: PathBuf,

    /// Do not fork, run in the foreground.
    #[arg(short = 'n', long = "no-fork")]
    no_fork: bool,

    /// Percent chance a connection drops per I/O buffer (debug).
    #[arg(short = 'R', long = "random-drop", value_name = "PERCENT")]
    random_drop: Option<f64>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "logvaultd=info,logvault_server=info"
                .parse()
                .expect("valid filter")
        }))
        .with(fmt::layer())
        .init();

    let random_drop = match cli.random_drop {
        Some(pct) if !(0.0..=100.0).contains(&pct) => {
            bail!("invalid random drop value: {pct}");
        }
        Some(pct) => Some(pct / 100.0),
        None => None,
    };

    let config = Config::load(&cli.file).context("unable to read configuration")?;
    let pid_file = config.server.pid_file.clone();

    let mut server = Server::new(
        config,
        ServerOptions {
            random_drop,
            config_path: Some(cli.file.clone()),
        },
    )
    .context("unable to set up listen socket")?;

    // Signals reach the event loop through self-pipes: INT/TERM start the
    // graceful shutdown, HUP reloads the configuration. SIGPIPE needs no
    // handling; the Rust runtime ignores it and writes surface EPIPE.
    let (shutdown_rx, shutdown_tx) = UnixStream::pair().context("signal pipe")?;
    let (reload_rx, reload_tx) = UnixStream::pair().context("signal pipe")?;
    shutdown_tx.set_nonblocking(true)?;
    reload_tx.set_nonblocking(true)?;
    pipe::register(SIGINT, shutdown_tx.try_clone()?).context("register SIGINT")?;
    pipe::register(SIGTERM, shutdown_tx).context("register SIGTERM")?;
    pipe::register(SIGHUP, reload_tx).context("register SIGHUP")?;
    server.set_signal_pipes(shutdown_rx, reload_rx)?;

    // Point of no return.
    if !cli.no_fork {
        daemonize().context("unable to daemonize")?;
        write_pid_file(pid_file.as_deref())?;
    }

    server.run()?;

    if !cli.no_fork {
        if let Some(path) = &pid_file {
            if let Err(e) = fs::remove_file(path) {
                warn!(pid_file = %path.display(), error = %e, "unable to remove pid file");
            }
        }
    }
    Ok(())
}

/// Forks, detaches from the terminal, and redirects stdio to /dev/null.
fn daemonize() -> Result<()> {
    use nix::unistd::{chdir, dup2, fork, setsid, ForkResult};

    // SAFETY: single-threaded at this point; the event loop has not
    // started and no other threads have been spawned.
    match unsafe { fork() }.context("fork")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("setsid")?;
    if let Err(e) = chdir("/") {
        warn!(error = %e, "unable to chdir to /");
    }

    let devnull = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("open /dev/null")?;
    for target in 0..=2 {
        dup2(devnull.as_raw_fd(), target).context("dup2")?;
    }
    Ok(())
}

/// Writes the process id to the configured pid file, creating parent
/// directories as needed.
fn write_pid_file(path: Option<&Path>) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("unable to create {}", parent.display()))?;
    }
    fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("unable to write {}", path.display()))
}
