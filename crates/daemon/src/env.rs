// SPDX-License-Identifier: MIT

//! Centralized path resolution for every file the daemon touches:
//! control socket, PID file, database, log file, reload-state snapshot.
//! Every other module asks this one for a path rather than assembling
//! one itself.

use std::path::PathBuf;

use crate::lifecycle::LifecycleError;

/// `OVERSEER_STATE_DIR` overrides everything; otherwise
/// `XDG_STATE_HOME/overseer`, falling back to `~/.local/state/overseer`.
pub fn state_dir() -> Result<PathBuf, LifecycleError> {
    if let Ok(dir) = std::env::var("OVERSEER_STATE_DIR") {
        return Ok(PathBuf::from(dir));
    }
    if let Ok(xdg) = std::env::var("XDG_STATE_HOME") {
        return Ok(PathBuf::from(xdg).join("overseer"));
    }
    let home = dirs::home_dir().ok_or(LifecycleError::NoStateDir)?;
    Ok(home.join(".local").join("state").join("overseer"))
}

pub fn config_path() -> Result<PathBuf, LifecycleError> {
    if let Ok(path) = std::env::var("OVERSEER_CONFIG") {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(LifecycleError::NoStateDir)?;
    Ok(home.join(".config").join("overseer").join("overseer.hcl"))
}

pub fn socket_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("daemon.sock")
}

pub fn pid_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("daemon.pid")
}

pub fn version_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("daemon.version")
}

pub fn db_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("overseer.db")
}

pub fn log_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("daemon.log")
}

pub fn reload_state_path(state_dir: &std::path::Path) -> PathBuf {
    state_dir.join("reload_state.json")
}

/// Temp directory companion sockets live in: `overseer-companion-<alias>-<name>.sock`.
pub fn companion_socket_path(alias: &str, name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("overseer-companion-{alias}-{name}.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_dir_honors_override() {
        std::env::set_var("OVERSEER_STATE_DIR", "/tmp/overseer-test-state");
        let dir = state_dir().unwrap();
        assert_eq!(dir, PathBuf::from("/tmp/overseer-test-state"));
        std::env::remove_var("OVERSEER_STATE_DIR");
    }

    #[test]
    fn companion_socket_path_embeds_alias_and_name() {
        let path = companion_socket_path("lab", "build-watch");
        assert!(path.to_string_lossy().contains("overseer-companion-lab-build-watch.sock"));
    }
}
