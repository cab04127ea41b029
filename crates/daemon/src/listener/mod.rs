// SPDX-License-Identifier: MIT

//! Control socket listener (spec.md §4.H). One connection per client, each
//! driven by its own spawned task: reads a single request line, dispatches
//! it, and either writes one response envelope or (for `LOGS`/`ATTACH`/
//! `COMPANION_ATTACH`) switches into a long-lived streaming mode. Unix-only:
//! Overseer's control socket has no remote/TCP surface and therefore no
//! auth-token handshake to gate on.

mod stream;

use crate::lifecycle::DaemonState;
use overseer_core::Clock;
use overseer_wire::{payload, read_request_line, write_envelope, Envelope, Request};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, BufReader};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Accepts connections until `shutdown` fires; each connection is handled
/// in its own task so a slow or stuck client (e.g. an `ATTACH` stream)
/// never blocks anyone else.
pub async fn run(listener: UnixListener, state: Arc<DaemonState>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let state = state.clone();
                        let cancel = shutdown.child_token();
                        tokio::spawn(async move {
                            let (reader, writer) = stream.into_split();
                            handle_connection(BufReader::new(reader), writer, state, cancel).await;
                        });
                    }
                    Err(e) => error!(error = %e, "control socket accept failed"),
                }
            }
        }
    }
}

async fn handle_connection<R, W>(mut reader: R, mut writer: W, state: Arc<DaemonState>, cancel: CancellationToken)
where
    R: AsyncBufRead + AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let line = match read_request_line(&mut reader).await {
        Ok(Some(line)) => line,
        Ok(None) => return,
        Err(e) => {
            debug!(error = %e, "failed to read request line");
            return;
        }
    };

    let request = match overseer_wire::parse(&line) {
        Ok(r) => r,
        Err(e) => {
            let _ = write_envelope(&mut writer, &Envelope::error(e.to_string())).await;
            return;
        }
    };

    debug!(?request, "control socket request");

    if request.is_streaming() {
        if let Err(e) = stream::handle_streaming(request, &mut reader, &mut writer, &state, cancel).await {
            warn!(error = %e, "streaming handler failed");
        }
        return;
    }

    let envelope = handle_request(request, &state).await;
    if let Err(e) = write_envelope(&mut writer, &envelope).await {
        debug!(error = %e, "failed to write response envelope");
    }
}

async fn handle_request(request: Request, state: &Arc<DaemonState>) -> Envelope {
    match request {
        Request::Status => handle_status(state).await,
        Request::Version => Envelope::info("ok").with_payload(&payload::VersionPayload { version: crate::lifecycle::DAEMON_VERSION.to_string() }),
        Request::Stop => handle_stop(state).await,
        Request::Reload => handle_reload(state).await,
        Request::Reset => handle_reset(state).await,
        Request::SshConnect { alias, options } => handle_ssh_connect(state, &alias, options).await,
        Request::SshDisconnect { alias } => handle_ssh_disconnect(state, &alias).await,
        Request::SshDisconnectAll => handle_ssh_disconnect_all(state).await,
        Request::SshReconnect { alias } => handle_ssh_reconnect(state, &alias).await,
        Request::ContextStatus { events } => handle_context_status(state, events).await,
        Request::Askpass { alias, token } => handle_askpass(state, &alias, &token).await,
        Request::CompanionInit { alias, name, token } => handle_companion_init(state, &alias, &name, &token).await,
        Request::CompanionStatus => handle_companion_status(state).await,
        Request::CompanionStart { alias, name } => handle_companion_command(state, &alias, &name, CompanionOp::Start).await,
        Request::CompanionStop { alias, name } => handle_companion_command(state, &alias, &name, CompanionOp::Stop).await,
        Request::CompanionRestart { alias, name } => handle_companion_command(state, &alias, &name, CompanionOp::Restart).await,
        Request::Logs { .. } | Request::Attach | Request::CompanionAttach { .. } => {
            unreachable!("streaming requests are dispatched before handle_request")
        }
    }
}

async fn handle_status(state: &Arc<DaemonState>) -> Envelope {
    let context = state.context.lock().await;
    let (context_name, location_name) = context
        .current()
        .map(|r| (r.context.clone(), r.location.clone()))
        .unwrap_or_else(|| ("unknown".to_string(), "unknown".to_string()));
    drop(context);

    let online = state.sensors.get(overseer_core::sensor_names::ONLINE).and_then(|r| r.online).unwrap_or(false);

    let mut tunnels = Vec::new();
    for alias in state.tunnels.aliases() {
        let Some(handle) = state.tunnels.get(alias) else { continue };
        let guard = handle.state.lock().await;
        tunnels.push(payload::TunnelStatusEntry {
            alias: guard.alias.clone(),
            desired: format!("{:?}", guard.desired).to_lowercase(),
            state: format!("{:?}", guard.state).to_lowercase(),
            pid: guard.pid,
            retry_count: guard.retry_count,
            total_reconnects: guard.total_reconnects,
            last_connected_epoch_ms: None,
        });
    }

    Envelope::info("ok").with_payload(&payload::StatusPayload {
        uptime_secs: state.start_time.elapsed().as_secs(),
        context: context_name,
        location: location_name,
        online,
        tunnels,
    })
}

/// Signals every managed tunnel and companion child and cascades the
/// shutdown token; the process exit itself is left to `main`'s select
/// loop, which observes `shutdown.cancelled()` after this returns.
async fn handle_stop(state: &Arc<DaemonState>) -> Envelope {
    use overseer_core::{DaemonEventKind, Event};

    for alias in state.tunnels.aliases() {
        if let Some(handle) = state.tunnels.get(alias) {
            let (tx, rx) = tokio::sync::oneshot::channel();
            if handle.commands.send(overseer_engine::TunnelCommand::Disconnect { reply: tx }).await.is_ok() {
                let _ = rx.await;
            }
        }
    }

    let _ = state.store.append_event(&Event::DaemonEvent {
        kind: DaemonEventKind::Stop,
        details: "stop requested over control socket".to_string(),
        epoch_ms: state.clock.epoch_ms(),
    });
    state.shutdown.cancel();
    Envelope::info("stopping")
}

/// Writes a reload-state snapshot (bookkeeping only, see `adopt_snapshot`
/// in `lifecycle::startup`) and cancels the process; an external
/// supervisor (launchd/systemd unit, or the CLI itself) is responsible
/// for starting the replacement daemon.
async fn handle_reload(state: &Arc<DaemonState>) -> Envelope {
    use overseer_core::{DaemonEventKind, Event};
    use overseer_storage::{ReloadState, TunnelSnapshot};

    let mut snapshots = Vec::new();
    for alias in state.tunnels.aliases() {
        let Some(handle) = state.tunnels.get(alias) else { continue };
        let guard = handle.state.lock().await;
        if let Some(pid) = guard.pid {
            snapshots.push(TunnelSnapshot {
                alias: guard.alias.clone(),
                pid,
                state: format!("{:?}", guard.state).to_lowercase(),
                token: guard.auth_token.clone(),
                start_time_epoch_ms: state.clock.epoch_ms(),
                last_connected_epoch_ms: None,
                retry_count: guard.retry_count,
                total_reconnects: guard.total_reconnects,
            });
        }
    }

    let now_epoch_ms = state.clock.epoch_ms();
    let reload_state = ReloadState::new(snapshots);
    if let Err(e) = reload_state.write_atomic(&state.paths.reload_state_path) {
        warn!(error = %e, "failed to write reload-state snapshot");
        return Envelope::error(format!("failed to write reload state: {e}"));
    }

    let _ = state.store.append_event(&Event::DaemonEvent {
        kind: DaemonEventKind::ReloadInitiated,
        details: "reload requested over control socket".to_string(),
        epoch_ms: now_epoch_ms,
    });
    state.shutdown.cancel();
    Envelope::info("reloading")
}

/// Forces every `reconnecting` tunnel to retry immediately (spec.md
/// §4.H "RESET"): clears its backoff and, if still desired-connected,
/// sends an out-of-band `Reconnect` to pre-empt the scheduled retry.
async fn handle_reset(state: &Arc<DaemonState>) -> Envelope {
    use overseer_core::{TunnelDesired, TunnelLifecycleState};

    let mut reset_count = 0;
    for alias in state.tunnels.aliases() {
        let Some(handle) = state.tunnels.get(alias) else { continue };
        let should_reconnect = {
            let mut guard = handle.state.lock().await;
            if guard.state == TunnelLifecycleState::Reconnecting {
                guard.reset_backoff();
                reset_count += 1;
                guard.desired == TunnelDesired::Connected
            } else {
                false
            }
        };
        if should_reconnect {
            let (tx, rx) = tokio::sync::oneshot::channel();
            if handle.commands.send(overseer_engine::TunnelCommand::Reconnect { reply: tx }).await.is_ok() {
                let _ = rx.await;
            }
        }
    }
    Envelope::info(format!("reset {reset_count} tunnel(s)"))
}

async fn handle_ssh_connect(state: &Arc<DaemonState>, alias: &str, options: overseer_wire::ConnectOptions) -> Envelope {
    let Some(handle) = state.tunnels.get(alias) else { return Envelope::not_found() };
    let overlay = options.env.into_iter().collect();
    let (tx, rx) = tokio::sync::oneshot::channel();
    let cmd = overseer_engine::TunnelCommand::Connect { tags: options.tags, overlay, reply: tx };
    if handle.commands.send(cmd).await.is_ok() {
        let _ = rx.await;
    }
    Envelope::info(format!("{alias} connect requested"))
}

async fn handle_ssh_disconnect(state: &Arc<DaemonState>, alias: &str) -> Envelope {
    let Some(handle) = state.tunnels.get(alias) else { return Envelope::not_found() };
    let (tx, rx) = tokio::sync::oneshot::channel();
    if handle.commands.send(overseer_engine::TunnelCommand::Disconnect { reply: tx }).await.is_ok() {
        let _ = rx.await;
    }
    Envelope::info(format!("{alias} disconnect requested"))
}

async fn handle_ssh_disconnect_all(state: &Arc<DaemonState>) -> Envelope {
    let aliases: Vec<String> = state.tunnels.aliases().cloned().collect();
    for alias in &aliases {
        if let Some(handle) = state.tunnels.get(alias) {
            let (tx, rx) = tokio::sync::oneshot::channel();
            if handle.commands.send(overseer_engine::TunnelCommand::Disconnect { reply: tx }).await.is_ok() {
                let _ = rx.await;
            }
        }
    }
    Envelope::info(format!("{} tunnel(s) disconnect requested", aliases.len()))
}

async fn handle_ssh_reconnect(state: &Arc<DaemonState>, alias: &str) -> Envelope {
    let Some(handle) = state.tunnels.get(alias) else { return Envelope::not_found() };
    let (tx, rx) = tokio::sync::oneshot::channel();
    if handle.commands.send(overseer_engine::TunnelCommand::Reconnect { reply: tx }).await.is_ok() {
        let _ = rx.await;
    }
    Envelope::info(format!("{alias} reconnect requested"))
}

async fn handle_context_status(state: &Arc<DaemonState>, events: bool) -> Envelope {
    let context = state.context.lock().await;
    let Some(current) = context.current() else {
        return Envelope::info("no context established yet").with_payload(&payload::ContextStatusPayload {
            context: "unknown".to_string(),
            location: "unknown".to_string(),
            matched_rule: None,
            environment: Default::default(),
            history: Vec::new(),
        });
    };

    let history = if events {
        context
            .history()
            .map(|t| payload::ContextTransitionEntry { from: t.from.clone(), to: t.to.clone(), trigger: t.trigger.clone(), epoch_ms: t.epoch_ms })
            .collect()
    } else {
        Vec::new()
    };

    Envelope::info("ok").with_payload(&payload::ContextStatusPayload {
        context: current.context.clone(),
        location: current.location.clone(),
        matched_rule: current.matched_rule.clone(),
        environment: current.environment.clone(),
        history,
    })
}

/// Validates the presented token against the tunnel's current
/// `auth_token` (stamped by `mark_connecting`) before consulting the
/// keyring; a stale or forged token never reaches the keyring lookup.
async fn handle_askpass(state: &Arc<DaemonState>, alias: &str, token: &str) -> Envelope {
    use overseer_core::{DaemonEventKind, Event};

    let Some(handle) = state.tunnels.get(alias) else { return Envelope::not_found() };
    let expected = handle.state.lock().await.auth_token.clone();
    if expected.is_empty() || expected != token {
        let _ = state.store.append_event(&Event::DaemonEvent {
            kind: DaemonEventKind::AskpassTokenMismatch,
            details: format!("askpass token mismatch for {alias}"),
            epoch_ms: state.clock.epoch_ms(),
        });
        return Envelope::error("token mismatch");
    }

    match state.keyring.password_for(alias).await {
        Ok(password) => Envelope::info("ok").with_payload(&payload::AskpassPayload { password }),
        Err(e) => Envelope::error(e.to_string()),
    }
}

/// Validates the presented token against the companion's current
/// `current_token` (stamped on spawn) and, if it matches, hands back
/// the companion's configured command.
async fn handle_companion_init(state: &Arc<DaemonState>, alias: &str, name: &str, token: &str) -> Envelope {
    let Some(handle) = state.companions.get(alias, name) else { return Envelope::not_found() };
    let guard = handle.state.lock().await;
    if guard.current_token.as_deref() != Some(token) {
        return Envelope::error("token mismatch");
    }
    Envelope::info("ok").with_payload(&payload::CompanionInitPayload { command: guard.command.clone() })
}

async fn handle_companion_status(state: &Arc<DaemonState>) -> Envelope {
    let mut companions = Vec::new();
    for alias in state.tunnels.aliases() {
        for handle in state.companions.for_tunnel(alias) {
            let guard = handle.state.lock().await;
            companions.push(payload::CompanionStatusEntry {
                alias: guard.tunnel_alias.clone(),
                name: guard.name.clone(),
                state: format!("{:?}", guard.state).to_lowercase(),
                pid: guard.pid,
                exit_code: guard.exit_code,
            });
        }
    }
    Envelope::info("ok").with_payload(&payload::CompanionStatusPayload { companions })
}

enum CompanionOp {
    Start,
    Stop,
    Restart,
}

async fn handle_companion_command(state: &Arc<DaemonState>, alias: &str, name: &str, op: CompanionOp) -> Envelope {
    let Some(handle) = state.companions.get(alias, name) else { return Envelope::not_found() };
    let (tx, rx) = tokio::sync::oneshot::channel();
    let cmd = match op {
        CompanionOp::Start => overseer_engine::CompanionCommand::Start { reply: tx },
        CompanionOp::Stop => overseer_engine::CompanionCommand::Stop { reply: tx },
        CompanionOp::Restart => overseer_engine::CompanionCommand::Restart { reply: tx },
    };
    if handle.commands.send(cmd).await.is_ok() {
        let _ = rx.await;
    }
    Envelope::info(format!("{alias}/{name} command sent"))
}
