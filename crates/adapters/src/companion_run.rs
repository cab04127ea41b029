//! Builds the invocation for the daemon's own hidden `companion-run`
//! subcommand and spawns it (`spec.md` §4.F). The child validates with
//! the daemon by presenting `OVERSEER_TUNNEL_TOKEN` back over the
//! control socket and receives the actual companion command to run.

use async_trait::async_trait;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, Command};

#[derive(Debug, Error)]
pub enum CompanionRunError {
    #[error("failed to spawn companion-run: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Parameters needed to build and spawn a `companion-run` child for one
/// companion.
#[derive(Debug, Clone)]
pub struct CompanionRunRequest {
    pub alias: String,
    pub name: String,
    pub token: String,
    pub daemon_exe: String,
}

/// Build the `companion-run` argv and environment, without spawning
/// anything. Kept pure and separate from `spawn` for the same reason as
/// `ssh::build_invocation`: the shape is unit-testable without a real
/// child process.
pub fn build_invocation(req: &CompanionRunRequest) -> (Vec<String>, Vec<(String, String)>) {
    let argv = vec![req.daemon_exe.clone(), "companion-run".to_string()];
    let env = vec![
        ("OVERSEER_COMPANION_RUN_ALIAS".to_string(), req.alias.clone()),
        ("OVERSEER_COMPANION_NAME".to_string(), req.name.clone()),
        ("OVERSEER_TUNNEL_TOKEN".to_string(), req.token.clone()),
    ];
    (argv, env)
}

/// Spawns the daemon's own `companion-run` subcommand. Abstracted behind
/// a trait so the companion supervisor can be driven by a fake spawner
/// in tests.
#[async_trait]
pub trait CompanionSpawner: Send + Sync + 'static {
    async fn spawn(&self, req: &CompanionRunRequest) -> Result<Child, CompanionRunError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCompanionSpawner;

#[async_trait]
impl CompanionSpawner for SystemCompanionSpawner {
    async fn spawn(&self, req: &CompanionRunRequest) -> Result<Child, CompanionRunError> {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> CompanionRunRequest {
        CompanionRunRequest {
            alias: "lab".into(),
            name: "build-watch".into(),
            token: "tok-123".into(),
            daemon_exe: "/usr/local/bin/overseerd".into(),
        }
    }

    #[test]
    fn builds_companion_run_argv() {
        let (argv, _) = build_invocation(&sample_request());
        assert_eq!(argv, vec!["/usr/local/bin/overseerd".to_string(), "companion-run".to_string()]);
    }

    #[test]
    fn sets_identifying_environment() {
        let (_, env) = build_invocation(&sample_request());
        assert!(env.contains(&("OVERSEER_COMPANION_RUN_ALIAS".to_string(), "lab".to_string())));
        assert!(env.contains(&("OVERSEER_COMPANION_NAME".to_string(), "build-watch".to_string())));
        assert!(env.contains(&("OVERSEER_TUNNEL_TOKEN".to_string(), "tok-123".to_string())));
    }
}
