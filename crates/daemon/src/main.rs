// SPDX-License-Identifier: MIT

//! Overseer Daemon (overseerd)
//!
//! Keeps a set of SSH tunnels connected according to a rule-derived
//! security context, and supervises PTY-wrapped companion processes
//! slaved to their tunnel's connected state.
//!
//! This binary has three faces, all dispatched from the same entry
//! point:
//! - the daemon itself (default invocation, no args)
//! - the hidden `companion-run` subcommand, spawned by the companion
//!   supervisor as a `companion-run` child (spec.md §4.F)
//! - the `SSH_ASKPASS` helper, invoked by `ssh` itself with no args but
//!   with `OVERSEER_TUNNEL_ALIAS`/`OVERSEER_TUNNEL_TOKEN` in its
//!   environment (spec.md §4.E)

mod companion_run;
mod env;
mod lifecycle;
mod listener;
mod reconcile;
mod sensors;

use lifecycle::{LifecycleError, Paths, StartupResult};
use overseer_core::{Clock, DaemonEventKind, Event};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if std::env::args().nth(1).as_deref() == Some("companion-run") {
        return std::process::ExitCode::from(companion_run::run().await as u8);
    }

    if let (Ok(alias), Ok(token)) = (std::env::var("OVERSEER_TUNNEL_ALIAS"), std::env::var("OVERSEER_TUNNEL_TOKEN")) {
        return run_askpass(&alias, &token).await;
    }

    run_daemon().await
}

/// The `SSH_ASKPASS` helper path: connect to the daemon's own control
/// socket, present the token `ssh` inherited in its environment, and
/// print the password to stdout for `ssh` to read.
async fn run_askpass(alias: &str, token: &str) -> std::process::ExitCode {
    let socket_path = match env::state_dir().map(|dir| env::socket_path(&dir)) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("overseerd: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };
    let stream = match tokio::net::UnixStream::connect(&socket_path).await {
        Ok(s) => s,
        Err(e) => {
            eprintln!("overseerd: failed to connect to control socket: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };
    let (reader, mut writer) = stream.into_split();
    let mut reader = tokio::io::BufReader::new(reader);
    match overseer_adapters::request_password(&mut reader, &mut writer, alias, token).await {
        Ok(password) => {
            println!("{password}");
            std::process::ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("overseerd: askpass rejected: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run_daemon() -> std::process::ExitCode {
    let paths = match Paths::resolve() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("overseerd: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };
    let _log_guard = match setup_logging(&paths) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("overseerd: failed to set up logging: {e}");
            return std::process::ExitCode::FAILURE;
        }
    };

    info!("starting overseerd");

    let StartupResult { state, listener, lock_file } = match lifecycle::startup().await {
        Ok(r) => r,
        Err(LifecycleError::LockFailed(_)) => {
            let pid = std::fs::read_to_string(&paths.pid_path).unwrap_or_default();
            eprintln!("overseerd is already running");
            if !pid.trim().is_empty() {
                eprintln!("  pid: {}", pid.trim());
            }
            return std::process::ExitCode::FAILURE;
        }
        Err(e) => {
            error!(error = %e, "failed to start daemon");
            lifecycle::cleanup_on_failure(&paths, &e);
            return std::process::ExitCode::FAILURE;
        }
    };

    let _ = state.store.append_event(&Event::DaemonEvent {
        kind: DaemonEventKind::Startup,
        details: format!("overseerd {} started", lifecycle::DAEMON_VERSION),
        epoch_ms: state.clock.epoch_ms(),
    });

    let listener_cancel = state.shutdown.child_token();
    tokio::spawn(listener::run(listener, state.clone(), listener_cancel));

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            return std::process::ExitCode::FAILURE;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            return std::process::ExitCode::FAILURE;
        }
    };

    info!(socket = %paths.socket_path.display(), "daemon ready");
    println!("READY");

    tokio::select! {
        _ = state.shutdown.cancelled() => info!("shutdown requested"),
        _ = sigterm.recv() => {
            info!("received SIGTERM, shutting down");
            state.shutdown.cancel();
        }
        _ = sigint.recv() => {
            info!("received SIGINT, shutting down");
            state.shutdown.cancel();
        }
    }

    drop(lock_file);
    let _ = std::fs::remove_file(&paths.socket_path);
    let _ = std::fs::remove_file(&paths.pid_path);
    info!("overseerd stopped");
    std::process::ExitCode::SUCCESS
}

fn setup_logging(paths: &Paths) -> Result<tracing_appender::non_blocking::WorkerGuard, std::io::Error> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    std::fs::create_dir_all(&paths.state_dir)?;
    let log_file_name = paths.log_path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("daemon.log"));
    let file_appender = tracing_appender::rolling::never(&paths.state_dir, log_file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry().with(filter).with(fmt::layer().with_writer(non_blocking)).init();

    Ok(guard)
}
