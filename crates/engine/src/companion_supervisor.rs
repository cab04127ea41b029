//! Companion supervisor (spec.md §4.F). One task per `(tunnel_alias,
//! name)`, slaved to the owning tunnel's connected state: the daemon
//! spawns itself as a `companion-run` child, accepts its single output
//! connection on a per-companion unix socket, and fans merged lines out
//! to ring history plus any live attach streams.
//!
//! Wire format on the companion output socket, newline-delimited UTF-8:
//! a `HISTORY_START` line, zero or more `<epoch_ms>\t<text>` replayed
//! lines carrying their original timestamp, a `HISTORY_END` line, then
//! plain `<text>` live lines timestamped on receipt. A companion-run
//! child reconnecting after a daemon restart always sends its local
//! ring inside a history block before resuming live output.

use overseer_adapters::{CompanionRunRequest, CompanionSpawner};
use overseer_core::{Clock, CompanionLifecycleState, CompanionOutputLine, CompanionState, Event, IdGen, TunnelEventKind};
use overseer_storage::Store;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

const HISTORY_START: &str = "HISTORY_START";
const HISTORY_END: &str = "HISTORY_END";
/// Optional sentinel a companion script may print once its own startup
/// has settled; writing it is never required (spec.md §4.F).
const READY_SENTINEL: &str = "OVERSEER_COMPANION_READY";
const ACCEPT_GRACE: std::time::Duration = std::time::Duration::from_secs(5);
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub enum CompanionCommand {
    Start { reply: oneshot::Sender<()> },
    Stop { reply: oneshot::Sender<()> },
    Restart { reply: oneshot::Sender<()> },
    /// Parent tunnel left `connected`. Per the decision that an in-place
    /// reconnect always respawns the companion, this only parks the
    /// state as `waiting` and kills the current child; the caller is
    /// expected to send `Start` again once the tunnel is `connected`.
    TunnelUnavailable,
}

pub type SharedCompanionState = Arc<Mutex<CompanionState>>;

pub struct CompanionHandle {
    pub commands: mpsc::Sender<CompanionCommand>,
    pub state: SharedCompanionState,
    pub output: broadcast::Sender<CompanionOutputLine>,
}

impl CompanionHandle {
    /// History tail plus a receiver for everything published from now
    /// on; used by `COMPANION_ATTACH` to implement "history then live"
    /// replay without missing a line in between.
    pub async fn attach(&self, lines: usize) -> (Vec<CompanionOutputLine>, broadcast::Receiver<CompanionOutputLine>) {
        let rx = self.output.subscribe();
        let history = self.state.lock().await.output_ring.tail(lines);
        (history, rx)
    }
}

/// Drives one companion's lifecycle until canceled. `stop_grace` bounds
/// how long a stop/restart waits for the `companion-run` process to exit
/// on its own (it runs its own Ctrl+C-then-kill sequence internally,
/// spec.md §4.F/§6) before the supervisor falls back to `SIGKILL`.
#[allow(clippy::too_many_arguments)]
pub async fn run<C: Clock, G: IdGen>(
    tunnel_alias: String,
    name: String,
    state: SharedCompanionState,
    mut commands: mpsc::Receiver<CompanionCommand>,
    output_tx: broadcast::Sender<CompanionOutputLine>,
    spawner: Arc<dyn CompanionSpawner>,
    store: Arc<Store>,
    socket_path: PathBuf,
    daemon_exe: String,
    clock: C,
    id_gen: G,
    stop_grace: Duration,
    cancel: CancellationToken,
) {
    let mut child: Option<tokio::process::Child> = None;
    let mut reader: Option<tokio::task::JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                stop_child(&mut child, &mut reader, stop_grace).await;
                return;
            }
            Some(cmd) = commands.recv() => {
                handle_command(
                    cmd, &tunnel_alias, &name, &state, &output_tx, &spawner, &store,
                    &socket_path, &daemon_exe, &clock, &id_gen, stop_grace, &mut child, &mut reader,
                ).await;
            }
            status = wait_child(&mut child) => {
                on_child_exit(status, &tunnel_alias, &name, &state, &store, &clock, &mut child, &mut reader).await;
            }
        }
    }
}

async fn wait_child(child: &mut Option<tokio::process::Child>) -> std::process::ExitStatus {
    match child {
        Some(c) => c.wait().await.unwrap_or_else(|_| default_exit_status()),
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
fn default_exit_status() -> std::process::ExitStatus {
    use std::os::unix::process::ExitStatusExt;
    std::process::ExitStatus::from_raw(-1)
}

#[allow(clippy::too_many_arguments)]
async fn handle_command<C: Clock, G: IdGen>(
    cmd: CompanionCommand,
    tunnel_alias: &str,
    name: &str,
    state: &SharedCompanionState,
    output_tx: &broadcast::Sender<CompanionOutputLine>,
    spawner: &Arc<dyn CompanionSpawner>,
    store: &Arc<Store>,
    socket_path: &PathBuf,
    daemon_exe: &str,
    clock: &C,
    id_gen: &G,
    stop_grace: Duration,
    child: &mut Option<tokio::process::Child>,
    reader: &mut Option<tokio::task::JoinHandle<()>>,
) {
    match cmd {
        CompanionCommand::Start { reply } => {
            spawn_companion(tunnel_alias, name, state, output_tx, spawner, store, socket_path, daemon_exe, clock, id_gen, child, reader).await;
            let _ = reply.send(());
        }
        CompanionCommand::Stop { reply } => {
            stop_child(child, reader, stop_grace).await;
            let mut guard = state.lock().await;
            guard.state = CompanionLifecycleState::Stopped;
            guard.pid = None;
            let _ = reply.send(());
        }
        CompanionCommand::Restart { reply } => {
            stop_child(child, reader, stop_grace).await;
            spawn_companion(tunnel_alias, name, state, output_tx, spawner, store, socket_path, daemon_exe, clock, id_gen, child, reader).await;
            let _ = reply.send(());
        }
        CompanionCommand::TunnelUnavailable => {
            stop_child(child, reader, stop_grace).await;
            let mut guard = state.lock().await;
            guard.state = CompanionLifecycleState::Waiting;
            guard.pid = None;
        }
    }
}

/// `SIGTERM`s the `companion-run` process so it can run its own Ctrl+C
/// grace sequence against the wrapped script, waits up to `stop_grace`
/// for it to exit, and only then falls back to `SIGKILL` against
/// `companion-run` itself (mirrors the tunnel supervisor's
/// `terminate_child`).
async fn stop_child(child: &mut Option<tokio::process::Child>, reader: &mut Option<tokio::task::JoinHandle<()>>, stop_grace: Duration) {
    if let Some(mut c) = child.take() {
        if let Some(pid) = c.id() {
            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
        }
        if tokio::time::timeout(stop_grace, c.wait()).await.is_err() {
            let _ = c.start_kill();
            let _ = c.wait().await;
        }
    }
    if let Some(r) = reader.take() {
        r.abort();
    }
}

async fn on_child_exit<C: Clock>(
    status: std::process::ExitStatus,
    tunnel_alias: &str,
    name: &str,
    state: &SharedCompanionState,
    store: &Arc<Store>,
    clock: &C,
    child: &mut Option<tokio::process::Child>,
    reader: &mut Option<tokio::task::JoinHandle<()>>,
) {
    *child = None;
    if let Some(r) = reader.take() {
        r.abort();
    }
    let mut guard = state.lock().await;
    // A companion we already parked as `waiting` (tunnel going away)
    // exiting on its own is expected, not a failure.
    if guard.state == CompanionLifecycleState::Waiting {
        return;
    }
    let code = status.code();
    if code == Some(0) {
        guard.state = CompanionLifecycleState::Exited;
        guard.exit_code = code;
    } else {
        guard.state = CompanionLifecycleState::Failed;
        guard.exit_code = code;
        guard.exit_error = Some(format!("companion-run exited with status {status}"));
    }
    guard.pid = None;
    drop(guard);
    tracing::warn!(alias = %tunnel_alias, companion = %name, ?status, "companion child exited");
    let _ = store.append_event(&Event::TunnelEvent {
        alias: tunnel_alias.to_string(),
        kind: TunnelEventKind::ConnectFailed,
        details: format!("companion {name} exited: {status}"),
        epoch_ms: clock.epoch_ms(),
    });
}

#[allow(clippy::too_many_arguments)]
async fn spawn_companion<C: Clock, G: IdGen>(
    tunnel_alias: &str,
    name: &str,
    state: &SharedCompanionState,
    output_tx: &broadcast::Sender<CompanionOutputLine>,
    spawner: &Arc<dyn CompanionSpawner>,
    store: &Arc<Store>,
    socket_path: &PathBuf,
    daemon_exe: &str,
    clock: &C,
    id_gen: &G,
    child: &mut Option<tokio::process::Child>,
    reader: &mut Option<tokio::task::JoinHandle<()>>,
) {
    let _ = std::fs::remove_file(socket_path);
    let listener = match UnixListener::bind(socket_path) {
        Ok(l) => l,
        Err(e) => {
            tracing::warn!(alias = %tunnel_alias, companion = %name, error = %e, "failed to bind companion socket");
            let mut guard = state.lock().await;
            guard.state = CompanionLifecycleState::Failed;
            guard.exit_error = Some(e.to_string());
            return;
        }
    };

    let token = id_gen.next_id();
    let req = CompanionRunRequest { alias: tunnel_alias.to_string(), name: name.to_string(), token: token.clone(), daemon_exe: daemon_exe.to_string() };
    let new_child = match spawner.spawn(&req).await {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(alias = %tunnel_alias, companion = %name, error = %e, "companion spawn failed");
            let mut guard = state.lock().await;
            guard.state = CompanionLifecycleState::Failed;
            guard.exit_error = Some(e.to_string());
            return;
        }
    };

    {
        let mut guard = state.lock().await;
        guard.state = CompanionLifecycleState::Starting;
        guard.pid = new_child.id();
        guard.exit_code = None;
        guard.exit_error = None;
        guard.current_token = Some(token);
    }
    *child = Some(new_child);

    let state = state.clone();
    let output_tx = output_tx.clone();
    let clock = clock.clone();
    reader.replace(tokio::spawn(async move {
        match tokio::time::timeout(ACCEPT_GRACE, listener.accept()).await {
            Ok(Ok((stream, _))) => stream_output(stream, state, output_tx, clock).await,
            Ok(Err(e)) => tracing::warn!(error = %e, "companion socket accept failed"),
            Err(_) => tracing::warn!("companion did not connect to its output socket in time"),
        }
    }));
}

async fn stream_output<C: Clock>(stream: UnixStream, state: SharedCompanionState, output_tx: broadcast::Sender<CompanionOutputLine>, clock: C) {
    let mut lines = BufReader::new(stream).lines();
    let mut replaying = false;
    let mut handshook = false;
    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) | Err(_) => break,
        };
        if line == HISTORY_START {
            replaying = true;
            continue;
        }
        if line == HISTORY_END {
            replaying = false;
            continue;
        }
        if !handshook {
            handshook = true;
            let mut guard = state.lock().await;
            if guard.state == CompanionLifecycleState::Starting {
                guard.state = CompanionLifecycleState::Running;
            }
        }
        let record = if replaying {
            parse_historical_line(&line, &clock)
        } else {
            if line == READY_SENTINEL {
                let mut guard = state.lock().await;
                if guard.state == CompanionLifecycleState::Running {
                    guard.state = CompanionLifecycleState::Ready;
                }
                continue;
            }
            CompanionOutputLine { epoch_ms: clock.epoch_ms(), text: line }
        };
        {
            let mut guard = state.lock().await;
            guard.output_ring.push(record.clone());
        }
        let _ = output_tx.send(record);
    }
}

fn parse_historical_line<C: Clock>(line: &str, clock: &C) -> CompanionOutputLine {
    match line.split_once('\t') {
        Some((epoch, text)) if epoch.parse::<u64>().is_ok() => {
            CompanionOutputLine { epoch_ms: epoch.parse().unwrap_or_else(|_| clock.epoch_ms()), text: text.to_string() }
        }
        _ => CompanionOutputLine { epoch_ms: clock.epoch_ms(), text: line.to_string() },
    }
}

/// Owns every companion's command channel, keyed by `(tunnel_alias,
/// name)`.
#[derive(Default)]
pub struct CompanionRegistry {
    handles: HashMap<(String, String), CompanionHandle>,
}

impl CompanionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: (String, String), handle: CompanionHandle) {
        self.handles.insert(key, handle);
    }

    pub fn get(&self, alias: &str, name: &str) -> Option<&CompanionHandle> {
        self.handles.get(&(alias.to_string(), name.to_string()))
    }

    pub fn for_tunnel(&self, alias: &str) -> impl Iterator<Item = &CompanionHandle> {
        self.handles.iter().filter(move |((a, _), _)| a == alias).map(|(_, h)| h)
    }

    /// Slaves companion lifecycle to the tunnel supervisor's
    /// connected-tunnel set (spec.md §4.F): on `connected` every
    /// companion for that alias is (re)started; otherwise every
    /// companion for that alias is parked `waiting`.
    pub async fn on_tunnel_state_change(&self, alias: &str, connected: bool) {
        for handle in self.for_tunnel(alias) {
            if connected {
                let (tx, rx) = oneshot::channel();
                if handle.commands.send(CompanionCommand::Start { reply: tx }).await.is_ok() {
                    let _ = rx.await;
                }
            } else {
                let _ = handle.commands.send(CompanionCommand::TunnelUnavailable).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::FakeClock;

    #[test]
    fn parses_tab_separated_historical_line() {
        let clock = FakeClock::new();
        let record = parse_historical_line("42\tbuilding project", &clock);
        assert_eq!(record.epoch_ms, 42);
        assert_eq!(record.text, "building project");
    }

    #[test]
    fn falls_back_to_receipt_time_for_malformed_historical_line() {
        let clock = FakeClock::new();
        let record = parse_historical_line("not-a-timestamp", &clock);
        assert_eq!(record.epoch_ms, clock.epoch_ms());
        assert_eq!(record.text, "not-a-timestamp");
    }

    #[tokio::test]
    async fn attach_replays_history_before_live_lines() {
        let mut seed = CompanionState::new("lab", "watch", vec!["echo".into()], 10);
        seed.output_ring.push(CompanionOutputLine { epoch_ms: 1, text: "old".into() });
        let state = Arc::new(Mutex::new(seed));
        let (output_tx, _rx) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let handle = CompanionHandle { commands: mpsc::channel(1).0, state, output: output_tx.clone() };

        let (history, mut live) = handle.attach(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text, "old");

        output_tx.send(CompanionOutputLine { epoch_ms: 2, text: "new".into() }).unwrap();
        let next = live.recv().await.unwrap();
        assert_eq!(next.text, "new");
    }

    #[tokio::test]
    async fn registry_looks_up_by_alias_and_name() {
        let mut registry = CompanionRegistry::new();
        let state = Arc::new(Mutex::new(CompanionState::new("lab", "watch", vec![], 10)));
        let (output_tx, _rx) = broadcast::channel(OUTPUT_CHANNEL_CAPACITY);
        let handle = CompanionHandle { commands: mpsc::channel(1).0, state, output: output_tx };
        registry.insert(("lab".to_string(), "watch".to_string()), handle);
        assert!(registry.get("lab", "watch").is_some());
        assert!(registry.get("lab", "other").is_none());
        assert_eq!(registry.for_tunnel("lab").count(), 1);
    }
}
