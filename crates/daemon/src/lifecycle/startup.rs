// SPDX-License-Identifier: MIT

use super::{DaemonState, LifecycleError, Paths, DAEMON_VERSION};
use crate::reconcile::ContextReconciler;
use fs2::FileExt;
use overseer_adapters::{DesktopNotifyAdapter, KeyringProvider, NoopNotifyAdapter, NotifyAdapter, OsKeyringProvider};
use overseer_config::Config;
use overseer_core::{
    Clock, CompanionState, Event, NanoIdGen, SystemClock, TunnelDesired, TunnelEventKind, TunnelLifecycleState, TunnelState,
};
use overseer_engine::{
    CompanionHandle, CompanionRegistry, ContextManager, OnlinePolicy, TcpPriorityPolicy, TunnelHandle, TunnelRegistry,
};
use overseer_storage::{ReloadState, Store, TunnelSnapshot};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UnixListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Settle interval before a freshly spawned `ssh` child is considered
/// connected; not user-configurable (spec.md has no handshake signal to
/// key off of).
const TUNNEL_READY_GRACE: std::time::Duration = std::time::Duration::from_secs(2);
/// `SIGTERM`-to-`SIGKILL` grace for both tunnel and companion children.
const TUNNEL_STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

pub struct StartupResult {
    pub state: Arc<DaemonState>,
    pub listener: UnixListener,
    /// Held for the process lifetime: dropping it releases the `fs2`
    /// lock, which is how a second `overseerd` detects us as gone.
    pub lock_file: std::fs::File,
}

/// Acquires the single-instance lock, loads configuration, opens
/// storage, builds every in-process registry and background task, and
/// finally binds the control socket. Order matters: the lock must be
/// held before anything else touches the state directory, and the
/// socket is bound last so a listening socket always implies a fully
/// initialized daemon.
pub async fn startup() -> Result<StartupResult, LifecycleError> {
    let paths = Paths::resolve()?;
    std::fs::create_dir_all(&paths.state_dir)?;

    let lock_file = acquire_lock(&paths)?;
    write_pid(&paths)?;
    std::fs::write(&paths.version_path, DAEMON_VERSION)?;

    let config = overseer_config::load_file(&paths.config_path)?;

    let store = Arc::new(Store::open(&paths.db_path)?);

    let daemon_exe = std::env::current_exe().map(|p| p.to_string_lossy().into_owned()).unwrap_or_else(|_| "overseerd".to_string());

    let clock = SystemClock;
    let id_gen = NanoIdGen;

    let notify: Arc<dyn NotifyAdapter> =
        if config.daemon.notifications_enabled { Arc::new(DesktopNotifyAdapter::new()) } else { Arc::new(NoopNotifyAdapter) };
    let keyring: Arc<dyn KeyringProvider> = Arc::new(OsKeyringProvider);

    let previous_reload = load_fresh_reload_state(&paths.reload_state_path, config.daemon.reload_state_ttl.as_duration());
    let shutdown = CancellationToken::new();

    let tunnels = Arc::new(build_tunnel_registry(&config, &store, &daemon_exe, &clock, &id_gen, previous_reload.as_ref(), &shutdown));
    let companions = Arc::new(build_companion_registry(&config, &store, &daemon_exe, &clock, &id_gen, TUNNEL_STOP_GRACE, &shutdown));

    let pipeline = crate::sensors::start(
        &config.probes,
        config.daemon.ipv4_hysteresis_count,
        config.daemon.ipv6_hysteresis_count,
        config.daemon.sleep_wake_grace.as_duration(),
        clock.clone(),
        store.clone(),
        &shutdown,
    );

    let context = ContextManager::new(
        config.daemon.context_history_len,
        config.exports.clone(),
        config.daemon.preferred_ip_version,
        clock.clone(),
    );

    let state = Arc::new(DaemonState {
        paths: paths.clone(),
        config,
        store,
        sensors: pipeline.map,
        context: Mutex::new(context),
        tunnels,
        companions,
        notify,
        clock,
        id_gen,
        start_time: Instant::now(),
        daemon_exe,
        keyring,
        shutdown,
    });

    let online_policy: Arc<dyn OnlinePolicy> = Arc::new(TcpPriorityPolicy::new(state.config.daemon.tcp_stale_threshold.as_duration()));
    let reconciler = ContextReconciler { tunnels: state.tunnels.clone(), rules: Arc::new(state.config.rules.clone()) };

    crate::reconcile::evaluate_and_apply(&state, &state.config.rules, &state.config.locations, &*online_policy, &reconciler, "startup").await;

    tokio::spawn(crate::reconcile::run_context_loop(
        state.clone(),
        state.config.rules.clone(),
        state.config.locations.clone(),
        online_policy,
        reconciler,
        pipeline.on_change,
        state.shutdown.child_token(),
    ));
    tokio::spawn(crate::reconcile::run_tunnel_watch(state.clone(), state.shutdown.child_token()));

    let _ = std::fs::remove_file(&paths.socket_path);
    let listener = UnixListener::bind(&paths.socket_path).map_err(|e| LifecycleError::BindFailed(paths.socket_path.clone(), e))?;

    Ok(StartupResult { state, listener, lock_file })
}

/// Reads the previous daemon's reload-state snapshot, discarding it if
/// it's older than `ttl`. A stale snapshot is worse than none: it would
/// misreport retry counts for tunnels that have since changed underneath
/// an unrelated process.
fn load_fresh_reload_state(path: &std::path::Path, ttl: std::time::Duration) -> Option<ReloadState> {
    let state = ReloadState::read(path).ok().flatten()?;
    let now_epoch_ms = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0);
    if state.is_fresh(now_epoch_ms, ttl.as_millis() as u64) {
        Some(state)
    } else {
        None
    }
}

fn acquire_lock(paths: &Paths) -> Result<std::fs::File, LifecycleError> {
    let file = OpenOptions::new().write(true).create(true).truncate(false).open(&paths.pid_path).map_err(LifecycleError::LockFailed)?;
    file.try_lock_exclusive().map_err(LifecycleError::LockFailed)?;
    Ok(file)
}

fn write_pid(paths: &Paths) -> Result<(), LifecycleError> {
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(&paths.pid_path)?;
    write!(file, "{}", std::process::id())?;
    Ok(())
}

/// Removes everything `startup` creates, except when the failure was
/// `LockFailed`: in that case another daemon instance owns these files
/// and touching them would corrupt its state.
pub fn cleanup_on_failure(paths: &Paths, error: &LifecycleError) {
    if matches!(error, LifecycleError::LockFailed(_)) {
        return;
    }
    let _ = std::fs::remove_file(&paths.socket_path);
    let _ = std::fs::remove_file(&paths.version_path);
    let _ = std::fs::remove_file(&paths.pid_path);
}

fn build_tunnel_registry(
    config: &Config,
    store: &Arc<Store>,
    daemon_exe: &str,
    clock: &SystemClock,
    id_gen: &NanoIdGen,
    previous_reload: Option<&ReloadState>,
    shutdown: &CancellationToken,
) -> TunnelRegistry {
    let mut registry = TunnelRegistry::new();
    let backoff = overseer_engine::BackoffSchedule {
        initial: config.daemon.initial_backoff.as_duration(),
        factor: config.daemon.backoff_factor,
        max: config.daemon.max_backoff.as_duration(),
        max_retries: config.daemon.max_retries,
    };
    let ssh_options = overseer_engine::SshOptions {
        keepalive_interval_secs: config.daemon.ssh_keepalive_interval.as_duration().as_secs(),
        keepalive_count: config.daemon.ssh_keepalive_count,
        extra_options: config.daemon.ssh_extra_options.clone(),
    };
    let ready_grace = TUNNEL_READY_GRACE;
    let stop_grace = TUNNEL_STOP_GRACE;

    for descriptor in &config.tunnels {
        let snapshot = previous_reload.and_then(|r| r.tunnels.iter().find(|t| t.alias == descriptor.alias));
        let mut tunnel_state = TunnelState::new(descriptor.alias.clone());
        let adopted_pid = snapshot.and_then(|snapshot| adopt_snapshot(&mut tunnel_state, snapshot, clock.now()));
        if let Some(pid) = adopted_pid {
            let _ = store.append_event(&Event::TunnelEvent {
                alias: descriptor.alias.clone(),
                kind: TunnelEventKind::Adopted,
                details: format!("pid {pid}"),
                epoch_ms: clock.epoch_ms(),
            });
        }
        let state = Arc::new(tokio::sync::Mutex::new(tunnel_state));
        let (tx, rx) = tokio::sync::mpsc::channel(8);
        let handle = TunnelHandle { commands: tx, state: state.clone() };
        registry.insert(descriptor.alias.clone(), handle);

        let descriptor = descriptor.clone();
        let store = store.clone();
        let daemon_exe = daemon_exe.to_string();
        let clock = clock.clone();
        let id_gen = id_gen.clone();
        let spawner: Arc<dyn overseer_adapters::SshSpawner> = Arc::new(overseer_adapters::SystemSshSpawner);
        let ssh_options = ssh_options.clone();
        let cancel = shutdown.child_token();
        tokio::spawn(async move {
            overseer_engine::run_tunnel(
                descriptor,
                state,
                rx,
                spawner,
                store,
                backoff,
                ssh_options,
                ready_grace,
                stop_grace,
                daemon_exe,
                clock,
                id_gen,
                adopted_pid,
                cancel,
            )
            .await;
        });
    }
    registry
}

/// Re-adopts a tunnel still running from a previous daemon's reload-state
/// snapshot (spec.md §4.E "Adoption on reload"). Verifies the recorded
/// pid is both alive and still the `ssh` binary before trusting it — the
/// number may since have been reused by an unrelated process — and only
/// then restores `connected` state in place, so the caller never spawns
/// a replacement child. On a failed check, only the retry bookkeeping is
/// carried forward and the tunnel starts `disconnected`, resuming normal
/// backoff on the next reconcile.
///
/// Returns the adopted pid on success, for the caller to seed the
/// supervisor's child handle and emit the `Adopted` event.
fn adopt_snapshot(state: &mut TunnelState, snapshot: &TunnelSnapshot, now: std::time::Instant) -> Option<u32> {
    state.retry_count = snapshot.retry_count;
    state.total_reconnects = snapshot.total_reconnects;

    if !overseer_adapters::process_is_ssh(snapshot.pid) {
        return None;
    }

    state.state = TunnelLifecycleState::Connected;
    state.desired = TunnelDesired::Connected;
    state.pid = Some(snapshot.pid);
    state.start_time = Some(now);
    state.last_connected_time = Some(now);
    state.disconnected_time = None;
    state.next_retry_at = None;
    state.auth_token = snapshot.token.clone();
    state.awaiting_child_exit = false;
    Some(snapshot.pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_snapshot(pid: u32) -> TunnelSnapshot {
        TunnelSnapshot {
            alias: "lab".into(),
            pid,
            state: "connected".into(),
            token: "tok-123".into(),
            start_time_epoch_ms: 1,
            last_connected_epoch_ms: Some(2),
            retry_count: 3,
            total_reconnects: 7,
        }
    }

    #[test]
    fn a_pid_that_no_longer_exists_falls_through_to_reconnecting() {
        let mut state = TunnelState::new("lab");
        let adopted = adopt_snapshot(&mut state, &sample_snapshot(u32::MAX), std::time::Instant::now());

        assert!(adopted.is_none());
        assert_eq!(state.state, TunnelLifecycleState::Disconnected);
        assert!(state.pid.is_none());
        // Retry bookkeeping still carries forward even when adoption fails.
        assert_eq!(state.retry_count, 3);
        assert_eq!(state.total_reconnects, 7);
    }

    #[test]
    fn a_live_pid_that_is_not_ssh_is_not_adopted() {
        let mut state = TunnelState::new("lab");
        let adopted = adopt_snapshot(&mut state, &sample_snapshot(std::process::id()), std::time::Instant::now());

        assert!(adopted.is_none());
        assert_eq!(state.state, TunnelLifecycleState::Disconnected);
    }
}

/// `stop_grace` bounds the supervisor's wait for `companion-run` to exit
/// on its own before `SIGKILL`; comfortably exceeds `companion-run`'s own
/// 5 s internal Ctrl+C grace (spec.md §6) so a companion stopping
/// normally is never raced against by the outer timeout.
fn build_companion_registry(
    config: &Config,
    store: &Arc<Store>,
    daemon_exe: &str,
    clock: &SystemClock,
    id_gen: &NanoIdGen,
    stop_grace: std::time::Duration,
    shutdown: &CancellationToken,
) -> CompanionRegistry {
    let mut registry = CompanionRegistry::new();
    let ring_capacity = config.daemon.companion_ring_capacity;

    for tunnel in &config.tunnels {
        for companion in &tunnel.companions {
            let state = Arc::new(tokio::sync::Mutex::new(CompanionState::new(
                tunnel.alias.clone(),
                companion.name.clone(),
                companion.command.clone(),
                ring_capacity,
            )));
            let (tx, rx) = tokio::sync::mpsc::channel(8);
            let (output_tx, _rx) = tokio::sync::broadcast::channel(256);
            let handle = CompanionHandle { commands: tx, state: state.clone(), output: output_tx.clone() };
            registry.insert((tunnel.alias.clone(), companion.name.clone()), handle);

            let socket_path = crate::env::companion_socket_path(&tunnel.alias, &companion.name);
            let spawner: Arc<dyn overseer_adapters::CompanionSpawner> = Arc::new(overseer_adapters::SystemCompanionSpawner);
            let store = store.clone();
            let daemon_exe = daemon_exe.to_string();
            let clock = clock.clone();
            let id_gen = id_gen.clone();
            let alias = tunnel.alias.clone();
            let name = companion.name.clone();
            let cancel = shutdown.child_token();
            tokio::spawn(async move {
                overseer_engine::run_companion(alias, name, state, rx, output_tx, spawner, store, socket_path, daemon_exe, clock, id_gen, stop_grace, cancel).await;
            });
        }
    }
    registry
}
