use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use double_fork::keyfile::POLL_INTERVAL;
use double_fork::{KeyFile, KeyFileError};
use tracing_subscriber::EnvFilter;

/// Exit status for bad command lines.
const ARGUMENT_ERROR: u8 = 3;

/// mresource - file-based resource key allocator
///
/// Given only FILE, prints the next free key in it and marks it in use,
/// waiting for one to come free if needed. Given FILE and KEYs, marks those
/// keys free again, after DELAY seconds if one is set.
///
/// Each line of FILE is a key whose first character is the allocation mark:
/// a space when free, `!` when in use. When the file is used a lot, keep it
/// on a RAM-backed file system such as /dev/shm.
#[derive(Debug, Parser)]
#[command(name = "mresource")]
#[command(version, about)]
struct Cli {
    /// Resource key file
    file: PathBuf,

    /// Keys to release, or to write with --create / --append
    keys: Vec<String>,

    /// Create FILE holding KEYS, all free
    #[arg(short, long, requires = "keys", conflicts_with = "append")]
    create: bool,

    /// Add KEYS to FILE, all free
    #[arg(short, long, requires = "keys")]
    append: bool,

    /// Stop trying to obtain a key after TIME seconds; 0 waits forever
    #[arg(short = 't', long = "timeout", value_name = "TIME", default_value_t = 0)]
    timeout: u64,

    /// Seconds between attempts to obtain a key
    #[arg(
        short = 'p',
        long = "poll",
        value_name = "POLLTIME",
        default_value_t = POLL_INTERVAL.as_secs(),
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    poll: u64,

    /// Release KEYS only after DELAY seconds, without waiting for it
    #[arg(short, long, value_name = "DELAY", default_value_t = 0)]
    delay: u64,

    /// Report what is being done on stderr
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(ARGUMENT_ERROR)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let default_filter = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mresource: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

fn run(cli: &Cli) -> Result<(), KeyFileError> {
    let file = KeyFile::new(&cli.file);

    if cli.create {
        return file.create(&cli.keys);
    }
    if cli.append {
        return file.append(&cli.keys);
    }
    if cli.keys.is_empty() {
        let timeout = (cli.timeout > 0).then_some(Duration::from_secs(cli.timeout));
        let key = file.obtain(timeout, Duration::from_secs(cli.poll))?;
        println!("{key}");
        return Ok(());
    }

    file.release_after(cli.keys.clone(), Duration::from_secs(cli.delay))?;
    Ok(())
}
