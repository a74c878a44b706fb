//! Test Host
//!
//! Out-of-process host used by the spawn tests. It understands the
//! standard host command line and serves the test classes:
//!
//! - `Calculator`: a calculator, announced as `Calculator` or `Sink`
//! - `Recorder`: a recording sink
//! - `Silent`: never announces
//! - `Stubborn`: never announces and ignores SIGTERM
//!
//! When a data path (`-d`) is given the host writes its pid to
//! `<data>/<callsign>.pid` before doing anything else.
//!
//! # Usage
//!
//! ```text
//! comrpc-test-host -l test -c Calculator -C calc -r 127.0.0.1:5000 -i 0x101 -x 1
//! ```

mod common;

use clap::Parser;
use comrpc::{run_host, ClassRegistry, HostArgs, InterfacePtr};
use common::{CalculatorImpl, Recorder, ID_CALCULATOR, ID_SINK};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn registry() -> ClassRegistry {
    let registry = ClassRegistry::new();
    registry.register("Calculator", |interface, _| {
        let calculator = CalculatorImpl::new();
        match interface {
            ID_CALCULATOR => Some(calculator.ptr()),
            ID_SINK => Some(InterfacePtr::new::<dyn common::Sink>(calculator)),
            _ => None,
        }
    });
    registry.register("Recorder", |interface, _| {
        (interface == ID_SINK).then(|| Recorder::new().ptr())
    });
    registry
}

fn write_pid(args: &HostArgs) -> std::io::Result<()> {
    if let Some(dir) = &args.data_path {
        std::fs::create_dir_all(dir)?;
        std::fs::write(
            dir.join(format!("{}.pid", args.callsign)),
            std::process::id().to_string(),
        )?;
    }
    Ok(())
}

#[cfg(unix)]
fn ignore_sigterm() {
    use nix::sys::signal::{signal, SigHandler, Signal};
    // SAFETY: SIG_IGN installs no handler code
    if let Err(e) = unsafe { signal(Signal::SIGTERM, SigHandler::SigIgn) } {
        error!("Cannot ignore SIGTERM: {}", e);
    }
}

#[cfg(not(unix))]
fn ignore_sigterm() {}

#[tokio::main]
async fn main() -> ExitCode {
    let args = HostArgs::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level().as_str().to_lowercase()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // A Stubborn pid file implies SIGTERM is already ignored
    if args.class_name == "Stubborn" {
        ignore_sigterm();
    }
    if let Err(e) = write_pid(&args) {
        error!("Cannot write pid file: {}", e);
        return ExitCode::FAILURE;
    }

    match args.class_name.as_str() {
        "Silent" => {
            info!("Silent host {} waiting to be killed", std::process::id());
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ExitCode::SUCCESS
        }
        "Stubborn" => {
            info!("Stubborn host {} ignoring SIGTERM", std::process::id());
            tokio::time::sleep(Duration::from_secs(3600)).await;
            ExitCode::SUCCESS
        }
        _ => {
            let admin = common::administrator();
            match run_host(args, admin, registry()).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("Host failed: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}
