// SPDX-License-Identifier: MIT

//! Entry point for the daemon's own hidden `companion-run` subcommand
//! (spec.md §4.F). Spawned by the companion supervisor with
//! `OVERSEER_COMPANION_RUN_ALIAS`/`OVERSEER_COMPANION_NAME`/
//! `OVERSEER_TUNNEL_TOKEN` set: presents the token over the control
//! socket to learn the companion's actual command, execs it as the
//! foreground process of a fresh PTY, and streams merged output back
//! over the per-companion unix socket the supervisor is listening on.
//!
//! Keeps its own mirror ring so a reconnect after the daemon restarts
//! still opens with a history block (see `overseer_core::ring`).
//!
//! On `SIGTERM` (the companion supervisor's graceful-stop signal,
//! `spec.md` §4.F/§6 "137 on forced kill after 5 s timeout"), injects
//! Ctrl+C into the pty master so a `sudo`-escalated script's whole
//! foreground process group sees the interrupt, waits out the grace
//! period, and only then force-kills the child.

use overseer_core::{Clock, CompanionOutputLine, LineRing, SystemClock};
use overseer_pty::{spawn, PtyChild, PtyCommand};
use overseer_wire::{payload, read_envelope, write_request_line};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};

const MIRROR_RING_CAPACITY: usize = 1000;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);
const CONNECT_ATTEMPTS: u32 = 10;
const HISTORY_START: &str = "HISTORY_START";
const HISTORY_END: &str = "HISTORY_END";
/// spec.md §6: "137 on forced kill after 5 s timeout".
const STOP_GRACE: Duration = Duration::from_secs(5);
const FORCED_KILL_EXIT_CODE: i32 = 137;

pub async fn run() -> i32 {
    let alias = match std::env::var("OVERSEER_COMPANION_RUN_ALIAS") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("companion-run: missing OVERSEER_COMPANION_RUN_ALIAS");
            return 1;
        }
    };
    let name = match std::env::var("OVERSEER_COMPANION_NAME") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("companion-run: missing OVERSEER_COMPANION_NAME");
            return 1;
        }
    };
    let token = match std::env::var("OVERSEER_TUNNEL_TOKEN") {
        Ok(v) => v,
        Err(_) => {
            eprintln!("companion-run: missing OVERSEER_TUNNEL_TOKEN");
            return 1;
        }
    };

    let command = match fetch_command(&alias, &name, &token).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("companion-run: {e}");
            return 1;
        }
    };
    if command.is_empty() {
        eprintln!("companion-run: daemon returned an empty command");
        return 1;
    }

    let mut child = match spawn(&PtyCommand { argv: command, env: Vec::new() }) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("companion-run: failed to spawn pty: {e}");
            return 1;
        }
    };

    let socket_path = crate::env::companion_socket_path(&alias, &name);
    let mut stream = match connect_with_retry(&socket_path).await {
        Some(s) => s,
        None => {
            eprintln!("companion-run: could not connect to companion output socket");
            return 1;
        }
    };

    let clock = SystemClock;
    let mut ring: LineRing<CompanionOutputLine> = LineRing::new(MIRROR_RING_CAPACITY);
    if write_history(&mut stream, ring.snapshot()).await.is_err() {
        eprintln!("companion-run: failed to write history block");
        return 1;
    }

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("companion-run: failed to install SIGTERM handler: {e}");
            return 1;
        }
    };

    loop {
        tokio::select! {
            line = child.output.recv() => {
                let Some(text) = line else { break };
                ring.push(CompanionOutputLine { epoch_ms: clock.epoch_ms(), text: text.clone() });
                if stream.write_all(format!("{text}\n").as_bytes()).await.is_err() {
                    break;
                }
            }
            status = &mut child.exit_status => {
                return status.unwrap_or(-1);
            }
            _ = sigterm.recv() => {
                return stop_gracefully(&mut child, &mut stream, &mut ring, &clock).await;
            }
        }
    }

    (&mut child.exit_status).await.unwrap_or(-1)
}

/// Injects Ctrl+C, keeps forwarding any final output while waiting out
/// `STOP_GRACE`, and force-kills the child if it hasn't exited by then.
async fn stop_gracefully(
    child: &mut PtyChild,
    stream: &mut UnixStream,
    ring: &mut LineRing<CompanionOutputLine>,
    clock: &SystemClock,
) -> i32 {
    let _ = child.send_ctrl_c();

    let deadline = tokio::time::sleep(STOP_GRACE);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            line = child.output.recv() => {
                let Some(text) = line else { break };
                ring.push(CompanionOutputLine { epoch_ms: clock.epoch_ms(), text: text.clone() });
                let _ = stream.write_all(format!("{text}\n").as_bytes()).await;
            }
            status = &mut child.exit_status => {
                return status.unwrap_or(-1);
            }
            _ = &mut deadline => break,
        }
    }

    let _ = child.kill();
    let _ = tokio::time::timeout(Duration::from_secs(1), &mut child.exit_status).await;
    FORCED_KILL_EXIT_CODE
}

/// Presents the token over the control socket and returns the
/// companion's configured command.
async fn fetch_command(alias: &str, name: &str, token: &str) -> Result<Vec<String>, String> {
    let socket_path = crate::env::socket_path(&crate::env::state_dir().map_err(|e| e.to_string())?);
    let stream = UnixStream::connect(&socket_path).await.map_err(|e| format!("failed to connect to control socket: {e}"))?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    write_request_line(&mut writer, &format!("COMPANION_INIT {alias} {name} {token}")).await.map_err(|e| e.to_string())?;
    let envelope = read_envelope(&mut reader).await.map_err(|e| e.to_string())?;
    if envelope.is_error() {
        return Err("daemon rejected companion-init (token mismatch?)".to_string());
    }
    let payload = envelope.payload.ok_or("daemon response carried no command payload")?;
    let parsed: payload::CompanionInitPayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;
    Ok(parsed.command)
}

/// The supervisor only accepts the companion's connection for a short
/// grace window after spawning it; retries smooth over the startup
/// race rather than requiring the pty child be ready instantly.
async fn connect_with_retry(path: &std::path::Path) -> Option<UnixStream> {
    for attempt in 0..CONNECT_ATTEMPTS {
        match UnixStream::connect(path).await {
            Ok(stream) => return Some(stream),
            Err(_) if attempt + 1 < CONNECT_ATTEMPTS => tokio::time::sleep(CONNECT_RETRY_DELAY).await,
            Err(_) => return None,
        }
    }
    None
}

async fn write_history(stream: &mut UnixStream, history: Vec<CompanionOutputLine>) -> std::io::Result<()> {
    stream.write_all(format!("{HISTORY_START}\n").as_bytes()).await?;
    for line in history {
        stream.write_all(format!("{}\t{}\n", line.epoch_ms, line.text).as_bytes()).await?;
    }
    stream.write_all(format!("{HISTORY_END}\n").as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader as TokioBufReader};

    #[tokio::test]
    async fn write_history_brackets_an_empty_replay() {
        let (mut a, b) = UnixStream::pair().unwrap();
        write_history(&mut a, Vec::new()).await.unwrap();
        drop(a);

        let mut reader = TokioBufReader::new(b);
        let mut lines = Vec::new();
        let mut line = String::new();
        while reader.read_line(&mut line).await.unwrap() > 0 {
            lines.push(line.trim_end().to_string());
            line.clear();
        }
        assert_eq!(lines, vec![HISTORY_START, HISTORY_END]);
    }

    #[tokio::test]
    async fn write_history_emits_tab_separated_replay_lines() {
        let (mut a, b) = UnixStream::pair().unwrap();
        let history = vec![
            CompanionOutputLine { epoch_ms: 111, text: "first".into() },
            CompanionOutputLine { epoch_ms: 222, text: "second".into() },
        ];
        write_history(&mut a, history).await.unwrap();
        drop(a);

        let mut reader = TokioBufReader::new(b);
        let mut lines = Vec::new();
        let mut line = String::new();
        while reader.read_line(&mut line).await.unwrap() > 0 {
            lines.push(line.trim_end().to_string());
            line.clear();
        }
        assert_eq!(lines, vec![HISTORY_START, "111\tfirst", "222\tsecond", HISTORY_END]);
    }

    #[tokio::test]
    async fn connect_with_retry_finds_a_listener_that_starts_late() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("companion.sock");
        let bind_path = path.clone();

        let accept_task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let listener = tokio::net::UnixListener::bind(&bind_path).unwrap();
            listener.accept().await.unwrap();
        });

        let connected = connect_with_retry(&path).await;
        assert!(connected.is_some());
        accept_task.await.unwrap();
    }

    #[tokio::test]
    async fn connect_with_retry_gives_up_against_a_path_with_no_listener() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nobody-home.sock");
        let connected = connect_with_retry(&path).await;
        assert!(connected.is_none());
    }
}
