/// run with `cargo run --example spawn_pid`
use double_fork::Daemonizer;
use std::process::Command;

fn main() {
    // Keep stdio open so the worker's sleep can be spotted with `ps`
    match Daemonizer::new().spawn(|| {
        let _ = Command::new("sleep").arg("300").status();
    }) {
        Ok(detached) => println!("daemon pid: {}", detached.pid),
        Err(e) => eprintln!("{e}"),
    }
}
