//! Tunnel supervisor (spec.md §4.E). One task per alias, driving the
//! `TunnelState` machine already defined in `overseer_core`. Spawns via
//! `SshSpawner`, schedules backoff, and is the only place a tunnel child
//! is spawned or signaled.

use overseer_adapters::{SshSpawnRequest, SshSpawner};
use overseer_core::{Clock, Event, IdGen, TunnelDescriptor, TunnelEventKind, TunnelLifecycleState, TunnelState};
use overseer_storage::Store;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum TunnelCommand {
    Connect { tags: Vec<String>, overlay: BTreeMap<String, String>, reply: oneshot::Sender<()> },
    Disconnect { reply: oneshot::Sender<()> },
    Reconnect { reply: oneshot::Sender<()> },
}

/// Backoff schedule shared by every tunnel: exponential with a cap,
/// `max_retries == 0` meaning retry forever.
#[derive(Debug, Clone, Copy)]
pub struct BackoffSchedule {
    pub initial: Duration,
    pub factor: f64,
    pub max: Duration,
    pub max_retries: u32,
}

impl BackoffSchedule {
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let scaled = self.initial.as_secs_f64() * self.factor.powi(retry_count as i32);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }

    pub fn retries_exhausted(&self, retry_count: u32) -> bool {
        self.max_retries != 0 && retry_count >= self.max_retries
    }
}

/// Shared, lock-guarded handle to one tunnel's state, read by RPC status
/// handlers while the owning task mutates it.
pub type SharedTunnelState = Arc<Mutex<TunnelState>>;

pub struct TunnelHandle {
    pub commands: mpsc::Sender<TunnelCommand>,
    pub state: SharedTunnelState,
}

/// SSH invocation settings that are uniform across reconnects but come
/// from configuration rather than being hardcoded per spawn.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub keepalive_interval_secs: u64,
    pub keepalive_count: u32,
    pub extra_options: Vec<(String, String)>,
}

/// A tunnel child the supervisor is tracking: either one it spawned
/// itself, or one adopted by pid from a previous daemon's reload-state
/// snapshot (`spec.md` §4.E "Adoption on reload"). `tokio::process::Child`
/// cannot be reconstructed from a bare pid, so an adopted child is
/// monitored by polling `kill(pid, 0)` rather than `wait()`.
enum ChildHandle {
    Owned(tokio::process::Child),
    Adopted(u32),
}

impl ChildHandle {
    fn pid(&self) -> Option<u32> {
        match self {
            ChildHandle::Owned(c) => c.id(),
            ChildHandle::Adopted(pid) => Some(*pid),
        }
    }
}

/// How `wait_child` observed a child leaving: a real wait status for one
/// the supervisor spawned, or just a liveness-poll death for one it
/// adopted.
enum ChildExit {
    Owned(std::process::ExitStatus),
    Adopted,
}

const ADOPTED_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn process_is_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

/// Polls liveness since an adopted pid has no `Child` to `wait()` on.
async fn wait_for_pid_exit(pid: u32) {
    while process_is_alive(pid) {
        tokio::time::sleep(ADOPTED_POLL_INTERVAL).await;
    }
}

/// Drives one tunnel's lifecycle until canceled. `descriptor` supplies
/// the alias and tag set; `spawner` creates the SSH child; `ready_grace`
/// is the settle interval before a newly spawned child is considered
/// `connected`. `adopted_pid` seeds the supervisor with a still-running
/// child carried over from a previous daemon's reload (its state machine
/// side was already restored to `connected` by the caller).
#[allow(clippy::too_many_arguments)]
pub async fn run<C: Clock, G: IdGen>(
    descriptor: TunnelDescriptor,
    state: SharedTunnelState,
    mut commands: mpsc::Receiver<TunnelCommand>,
    spawner: Arc<dyn SshSpawner>,
    store: Arc<Store>,
    backoff: BackoffSchedule,
    ssh_options: SshOptions,
    ready_grace: Duration,
    stop_grace: Duration,
    daemon_exe: String,
    clock: C,
    id_gen: G,
    adopted_pid: Option<u32>,
    cancel: CancellationToken,
) {
    let mut child: Option<ChildHandle> = adopted_pid.map(ChildHandle::Adopted);

    loop {
        let retry_wait = {
            let guard = state.lock().await;
            guard.next_retry_at
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some(c) = child.take() {
                    send_sigterm(&c);
                    match c {
                        ChildHandle::Owned(mut c) => { let _ = c.start_kill(); }
                        ChildHandle::Adopted(pid) => {
                            let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGKILL);
                        }
                    }
                }
                return;
            }
            Some(cmd) = commands.recv() => {
                handle_command(cmd, &descriptor, &state, &spawner, &store, &daemon_exe, stop_grace, ready_grace, &ssh_options, &clock, &id_gen, &mut child).await;
            }
            Some(exit) = wait_child(&mut child) => {
                on_child_exit(exit, &descriptor, &state, &store, &backoff, &clock, &mut child).await;
            }
            _ = sleep_until_retry(retry_wait, &clock), if retry_wait.is_some() => {
                maybe_respawn(&descriptor, &state, &spawner, &store, &daemon_exe, ready_grace, &ssh_options, &clock, &id_gen, &mut child).await;
            }
        }
    }
}

/// Best-effort `SIGTERM` to a child by pid. The portable
/// `Child::start_kill` sends `SIGKILL` directly on Unix, which is too
/// blunt for the graceful-stop path spec.md §4.E requires.
fn send_sigterm(child: &ChildHandle) {
    if let Some(pid) = child.pid() {
        let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
    }
}

/// `spec.md` §4.E/§5/§8: send `SIGTERM`, wait up to `stop_grace` for the
/// child to exit, and only then fall back to `SIGKILL`.
async fn terminate_child(child: &mut ChildHandle, stop_grace: Duration) {
    send_sigterm(child);
    match child {
        ChildHandle::Owned(c) => {
            if tokio::time::timeout(stop_grace, c.wait()).await.is_err() {
                let _ = c.start_kill();
                let _ = c.wait().await;
            }
        }
        ChildHandle::Adopted(pid) => {
            if tokio::time::timeout(stop_grace, wait_for_pid_exit(*pid)).await.is_err() {
                let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(*pid as i32), nix::sys::signal::Signal::SIGKILL);
                wait_for_pid_exit(*pid).await;
            }
        }
    }
}

async fn wait_child(child: &mut Option<ChildHandle>) -> Option<ChildExit> {
    match child {
        Some(ChildHandle::Owned(c)) => c.wait().await.ok().map(ChildExit::Owned),
        Some(ChildHandle::Adopted(pid)) => {
            wait_for_pid_exit(*pid).await;
            Some(ChildExit::Adopted)
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_retry<C: Clock>(retry_at: Option<std::time::Instant>, clock: &C) {
    if let Some(at) = retry_at {
        let now = clock.now();
        if at > now {
            tokio::time::sleep(at - now).await;
        }
    } else {
        std::future::pending::<()>().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_command<C: Clock, G: IdGen>(
    cmd: TunnelCommand,
    descriptor: &TunnelDescriptor,
    state: &SharedTunnelState,
    spawner: &Arc<dyn SshSpawner>,
    store: &Arc<Store>,
    daemon_exe: &str,
    stop_grace: Duration,
    ready_grace: Duration,
    ssh_options: &SshOptions,
    clock: &C,
    id_gen: &G,
    child: &mut Option<ChildHandle>,
) {
    match cmd {
        TunnelCommand::Connect { tags, overlay, reply } => {
            let already_connected = {
                let mut guard = state.lock().await;
                guard.request_connect(tags, overlay);
                guard.is_connected()
            };
            if !already_connected && child.is_none() {
                spawn_child(descriptor, state, spawner, store, daemon_exe, ready_grace, ssh_options, clock, id_gen, child).await;
            }
            let _ = reply.send(());
        }
        TunnelCommand::Disconnect { reply } => {
            {
                let mut guard = state.lock().await;
                guard.request_disconnect();
                guard.mark_disconnecting();
            }
            if let Some(c) = child.as_mut() {
                terminate_child(c, stop_grace).await;
            }
            {
                let mut guard = state.lock().await;
                guard.mark_disconnected(clock.now());
            }
            let _ = store.append_event(&Event::TunnelEvent {
                alias: descriptor.alias.clone(),
                kind: TunnelEventKind::Disconnect,
                details: String::new(),
                epoch_ms: clock.epoch_ms(),
            });
            *child = None;
            let _ = reply.send(());
        }
        TunnelCommand::Reconnect { reply } => {
            if let Some(c) = child.as_mut() {
                terminate_child(c, stop_grace).await;
            }
            *child = None;
            spawn_child(descriptor, state, spawner, store, daemon_exe, ready_grace, ssh_options, clock, id_gen, child).await;
            let _ = reply.send(());
        }
    }
}

async fn on_child_exit<C: Clock>(
    exit: ChildExit,
    descriptor: &TunnelDescriptor,
    state: &SharedTunnelState,
    store: &Arc<Store>,
    backoff: &BackoffSchedule,
    clock: &C,
    child: &mut Option<ChildHandle>,
) {
    *child = None;
    match exit {
        ChildExit::Owned(status) => tracing::warn!(alias = %descriptor.alias, ?status, "tunnel child exited"),
        ChildExit::Adopted => tracing::warn!(alias = %descriptor.alias, "adopted tunnel process exited"),
    }
    let mut guard = state.lock().await;
    if guard.desired == overseer_core::TunnelDesired::Disconnected {
        guard.mark_disconnected(clock.now());
        return;
    }
    if backoff.retries_exhausted(guard.retry_count) {
        guard.mark_disconnected(clock.now());
        drop(guard);
        let _ = store.append_event(&Event::TunnelEvent {
            alias: descriptor.alias.clone(),
            kind: TunnelEventKind::RetriesExhausted,
            details: String::new(),
            epoch_ms: clock.epoch_ms(),
        });
        return;
    }
    let delay = backoff.delay_for(guard.retry_count);
    guard.mark_reconnecting(delay, clock.now());
    drop(guard);
    let _ = store.append_event(&Event::TunnelEvent {
        alias: descriptor.alias.clone(),
        kind: TunnelEventKind::Reconnecting,
        details: String::new(),
        epoch_ms: clock.epoch_ms(),
    });
}

#[allow(clippy::too_many_arguments)]
async fn maybe_respawn<C: Clock, G: IdGen>(
    descriptor: &TunnelDescriptor,
    state: &SharedTunnelState,
    spawner: &Arc<dyn SshSpawner>,
    store: &Arc<Store>,
    daemon_exe: &str,
    ready_grace: Duration,
    ssh_options: &SshOptions,
    clock: &C,
    id_gen: &G,
    child: &mut Option<ChildHandle>,
) {
    let should_spawn = {
        let guard = state.lock().await;
        guard.state == TunnelLifecycleState::Reconnecting && guard.desired == overseer_core::TunnelDesired::Connected
    };
    if should_spawn {
        spawn_child(descriptor, state, spawner, store, daemon_exe, ready_grace, ssh_options, clock, id_gen, child).await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn spawn_child<C: Clock, G: IdGen>(
    descriptor: &TunnelDescriptor,
    state: &SharedTunnelState,
    spawner: &Arc<dyn SshSpawner>,
    store: &Arc<Store>,
    daemon_exe: &str,
    ready_grace: Duration,
    ssh_options: &SshOptions,
    clock: &C,
    id_gen: &G,
    child: &mut Option<ChildHandle>,
) {
    let (tags, token) = {
        let guard = state.lock().await;
        (guard.tags_in_effect.clone(), id_gen.next_id())
    };
    let req = SshSpawnRequest {
        alias: descriptor.alias.clone(),
        tags,
        keepalive_interval_secs: ssh_options.keepalive_interval_secs,
        keepalive_count: ssh_options.keepalive_count,
        extra_options: ssh_options.extra_options.clone(),
        tunnel_token: token.clone(),
        daemon_exe: daemon_exe.to_string(),
    };
    match spawner.spawn(&req).await {
        Ok(new_child) => {
            let pid = new_child.id().unwrap_or(0);
            *child = Some(ChildHandle::Owned(new_child));
            let mut guard = state.lock().await;
            guard.mark_connecting(pid, token, clock.now());
            drop(guard);
            // Readiness is a settle interval, not a real handshake: the
            // tunnel supervisor has no visibility into SSH's forwarding
            // state beyond "the process is still alive".
            let state = state.clone();
            let store = store.clone();
            let alias = descriptor.alias.clone();
            let clock = clock.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ready_grace).await;
                let mut guard = state.lock().await;
                if guard.state == TunnelLifecycleState::Connecting {
                    guard.mark_connected(clock.now());
                    drop(guard);
                    let _ = store.append_event(&Event::TunnelEvent {
                        alias,
                        kind: TunnelEventKind::Connect,
                        details: String::new(),
                        epoch_ms: clock.epoch_ms(),
                    });
                }
            });
        }
        Err(e) => {
            tracing::warn!(alias = %descriptor.alias, error = %e, "ssh spawn failed");
            {
                let mut guard = state.lock().await;
                guard.mark_reconnecting(Duration::from_secs(1), clock.now());
            }
            let _ = store.append_event(&Event::TunnelEvent {
                alias: descriptor.alias.clone(),
                kind: TunnelEventKind::ConnectFailed,
                details: e.to_string(),
                epoch_ms: clock.epoch_ms(),
            });
        }
    }
}

/// Owns every tunnel's command channel, keyed by alias. `reconcile`
/// implements spec.md §4.E "Reconciliation on context change".
pub struct TunnelRegistry {
    handles: HashMap<String, TunnelHandle>,
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self { handles: HashMap::new() }
    }

    pub fn insert(&mut self, alias: String, handle: TunnelHandle) {
        self.handles.insert(alias, handle);
    }

    pub fn get(&self, alias: &str) -> Option<&TunnelHandle> {
        self.handles.get(alias)
    }

    pub fn aliases(&self) -> impl Iterator<Item = &String> {
        self.handles.keys()
    }

    /// Applies `connect_set`/`disconnect_set` per §4.E: disconnect
    /// dominates connect on conflict, and only tunnels the context
    /// actually names are touched.
    pub async fn reconcile(&self, connect_set: &[String], disconnect_set: &[String]) {
        for alias in disconnect_set {
            if let Some(handle) = self.handles.get(alias) {
                let (tx, rx) = oneshot::channel();
                if handle.commands.send(TunnelCommand::Disconnect { reply: tx }).await.is_ok() {
                    let _ = rx.await;
                }
            }
        }
        for alias in connect_set {
            if disconnect_set.contains(alias) {
                continue;
            }
            if let Some(handle) = self.handles.get(alias) {
                let (tx, rx) = oneshot::channel();
                let cmd = TunnelCommand::Connect { tags: Vec::new(), overlay: BTreeMap::new(), reply: tx };
                if handle.commands.send(cmd).await.is_ok() {
                    let _ = rx.await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_up_to_the_cap() {
        let schedule = BackoffSchedule { initial: Duration::from_secs(1), factor: 2.0, max: Duration::from_secs(10), max_retries: 0 };
        assert_eq!(schedule.delay_for(0), Duration::from_secs(1));
        assert_eq!(schedule.delay_for(1), Duration::from_secs(2));
        assert_eq!(schedule.delay_for(10), Duration::from_secs(10));
    }

    #[test]
    fn zero_max_retries_never_exhausts() {
        let schedule = BackoffSchedule { initial: Duration::from_secs(1), factor: 2.0, max: Duration::from_secs(10), max_retries: 0 };
        assert!(!schedule.retries_exhausted(1000));
    }

    #[test]
    fn nonzero_max_retries_exhausts_at_the_limit() {
        let schedule = BackoffSchedule { initial: Duration::from_secs(1), factor: 2.0, max: Duration::from_secs(10), max_retries: 3 };
        assert!(schedule.retries_exhausted(3));
        assert!(!schedule.retries_exhausted(2));
    }

    #[test]
    fn process_is_alive_is_true_for_our_own_pid() {
        assert!(process_is_alive(std::process::id()));
    }

    #[test]
    fn process_is_alive_is_false_for_a_pid_that_does_not_exist() {
        assert!(!process_is_alive(u32::MAX));
    }

    #[tokio::test]
    async fn reconcile_disconnects_before_connecting_on_conflict() {
        let registry = TunnelRegistry::new();
        // With no handles registered, reconcile is a no-op; this exercises
        // the disjoint-set logic without needing a real spawner.
        registry.reconcile(&["lab".to_string()], &["lab".to_string()]).await;
        assert_eq!(registry.aliases().count(), 0);
    }
}
