use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use double_fork::{Catnap, ProcessIdentity, catnap, spawn_daemon};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Detach a worker that naps, then writes a note to ./hi
#[derive(Debug, Parser)]
#[command(name = "double-fork")]
#[command(version, about)]
struct Cli {
    /// Seconds the worker sleeps before writing the note
    #[arg(long, value_name = "SECONDS", default_value_t = catnap::NAP.as_secs())]
    nap: u64,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let catnap = Catnap::new().with_nap(Duration::from_secs(cli.nap));
    let spawned = spawn_daemon(move || {
        if let Ok(identity) = ProcessIdentity::current() {
            info!(pid = identity.pid, sid = identity.sid, "running detached");
        }
        if let Err(e) = catnap.run() {
            error!("failed to write {}: {e}", catnap.path().display());
        }
    });

    // the only place the error is printed
    match spawned {
        Ok(detached) => {
            info!(pid = detached.pid, "daemon spawned");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
