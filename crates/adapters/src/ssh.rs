//! Builds the system SSH invocation for a tunnel and spawns it
//! (`spec.md` §4.E "Spawning a tunnel child").

use async_trait::async_trait;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, Command};

#[derive(Debug, Error)]
pub enum SshError {
    #[error("failed to spawn ssh: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Parameters needed to build and spawn an `ssh` child for one tunnel.
#[derive(Debug, Clone)]
pub struct SshSpawnRequest {
    pub alias: String,
    pub tags: Vec<String>,
    pub keepalive_interval_secs: u64,
    pub keepalive_count: u32,
    pub extra_options: Vec<(String, String)>,
    pub tunnel_token: String,
    pub daemon_exe: String,
}

/// Build the `ssh` argv and environment for a tunnel, without spawning
/// anything. Kept pure and separate from `spawn` so the invocation
/// shape is unit-testable without a real `ssh` binary.
pub fn build_invocation(req: &SshSpawnRequest) -> (Vec<String>, Vec<(String, String)>) {
    let mut argv = vec!["ssh".to_string(), "-N".to_string()];
    argv.push("-o".into());
    argv.push(format!("ServerAliveInterval={}", req.keepalive_interval_secs));
    argv.push("-o".into());
    argv.push(format!("ServerAliveCountMax={}", req.keepalive_count));
    for tag in &req.tags {
        argv.push("-o".into());
        argv.push(format!("Tag={tag}"));
    }
    for (key, value) in &req.extra_options {
        argv.push("-o".into());
        argv.push(format!("{key}={value}"));
    }
    argv.push(req.alias.clone());

    let env = vec![
        ("OVERSEER_TUNNEL_TOKEN".to_string(), req.tunnel_token.clone()),
        ("OVERSEER_TUNNEL_ALIAS".to_string(), req.alias.clone()),
        ("SSH_ASKPASS".to_string(), req.daemon_exe.clone()),
        ("SSH_ASKPASS_REQUIRE".to_string(), "force".to_string()),
    ];

    (argv, env)
}

/// Spawns the system SSH binary for a tunnel. Abstracted behind a trait
/// so the tunnel supervisor can be driven by a fake spawner in tests.
#[async_trait]
pub trait SshSpawner: Send + Sync + 'static {
    async fn spawn(&self, req: &SshSpawnRequest) -> Result<Child, SshError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSshSpawner;

#[async_trait]
impl SshSpawner for SystemSshSpawner {
    async fn spawn(&self, req: &SshSpawnRequest) -> Result<Child, SshError> {
        let (argv, env) = build_invocation(req);
        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()?;
        Ok(child)
    }
}

/// True if `pid` is alive and its executable resolves to `ssh`. Used by
/// the daemon's reload-adoption path (`spec.md` §4.E) to decide whether a
/// pid recorded by a previous process still belongs to the tunnel that
/// wrote it, rather than to some unrelated process that has since reused
/// the number. Linux-only (`/proc`); a dead pid or unreadable link both
/// read as "not ssh".
pub fn process_is_ssh(pid: u32) -> bool {
    let exe = match std::fs::read_link(format!("/proc/{pid}/exe")) {
        Ok(path) => path,
        Err(_) => return false,
    };
    exe.file_name().and_then(|n| n.to_str()).map(|n| n == "ssh").unwrap_or(false)
}
