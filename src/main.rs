//! Entry point: parse the command line, install the logging sink, and
//! either run the self-test sequence or bring the PF up and block until
//! a termination signal asks it to come back down.

mod cli;
mod error;
mod interrupt;
mod logging;
mod odm;
mod regs;
mod shmem;
mod uuid;
mod vfio;

use std::sync::mpsc;

use clap::Parser;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use cli::Cli;
use odm::OdmConfig;

/// Spawns a dedicated thread that blocks on `SIGTERM`/`SIGINT` and feeds
/// the main thread's shutdown wait through `rx.recv()`, replacing a
/// `sig_atomic_t` flag polled with `sleep(10)`.
fn spawn_signal_watcher() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let mut signals = match Signals::new([SIGTERM, SIGINT]) {
            Ok(signals) => signals,
            Err(e) => {
                log::error!("failed to install signal handler: {}", e);
                return;
            }
        };
        if let Some(signal) = signals.forever().next() {
            log::info!("received signal {}, shutting down", signal);
            let _ = tx.send(());
        }
    });
    rx
}

fn main() {
    let cli = Cli::parse();
    logging::init("odm_pf", cli.log_level, cli.console_logging);

    if cli.self_test {
        match odm::selftest::run() {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                log::error!("self-test failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let config = OdmConfig {
        eng_sel: cli.eng_sel,
        uuid: cli.vfio_vf_token.unwrap_or_default(),
        num_vfs: cli.num_vfs,
    };

    let shutdown_rx = spawn_signal_watcher();

    let device = match odm::probe(config) {
        Ok(device) => device,
        Err(e) => {
            log::error!("probe failed: {}", e);
            std::process::exit(1);
        }
    };

    let _ = shutdown_rx.recv();
    odm::release(device);
}
