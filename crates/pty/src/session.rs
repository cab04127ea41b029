//! Spawns a companion command as the foreground process of a fresh PTY
//! and streams its merged stdout/stderr back line by line.
//!
//! Grounded on the fork+thread pattern used to drive interactive shells
//! in a PTY: one thread blocks on raw reads from the master side and
//! forwards completed lines over a channel, a second blocks on
//! `waitpid` and reports the exit status, and the caller retains the
//! master to write `0x03` (Ctrl+C) into the whole foreground process
//! group — the one thing a plain pipe+SIGINT cannot do for a
//! `sudo`-escalated script.

use crate::error::PtyError;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use shpool_pty::fork::Fork;
use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::thread;
use tokio::sync::{mpsc, oneshot};

const CTRL_C: u8 = 0x03;

pub struct PtyCommand {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// A spawned companion child. Owns the PTY master; dropping it closes
/// the master side, which the child observes as EOF/HUP.
pub struct PtyChild {
    master: shpool_pty::fork::Master,
    child_pid: i32,
    pub output: mpsc::UnboundedReceiver<String>,
    pub exit_status: oneshot::Receiver<i32>,
}

impl PtyChild {
    pub fn pid(&self) -> i32 {
        self.child_pid
    }

    /// Write a literal Ctrl+C byte into the pty master so the kernel
    /// delivers SIGINT to the whole foreground process group.
    pub fn send_ctrl_c(&mut self) -> Result<(), PtyError> {
        self.master.write_all(&[CTRL_C])?;
        self.master.flush()?;
        Ok(())
    }

    /// Force-kill the pty child outright, bypassing the Ctrl+C path.
    pub fn kill(&self) -> Result<(), PtyError> {
        nix::sys::signal::kill(Pid::from_raw(self.child_pid), nix::sys::signal::Signal::SIGKILL)
            .map_err(PtyError::Wait)
    }
}

/// Fork a PTY and exec `command` as its foreground process.
pub fn spawn(command: &PtyCommand) -> Result<PtyChild, PtyError> {
    let mut fork = Fork::from_ptmx().map_err(|e| PtyError::Fork(format!("{e:?}")))?;

    if fork.is_child().is_ok() {
        for fd in 3..1024 {
            let _ = nix::unistd::close(fd);
        }
        let mut cmd = Command::new(&command.argv[0]);
        cmd.args(&command.argv[1..]).envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        let err = cmd.exec();
        eprintln!("overseer-pty: exec failed: {err}");
        std::process::exit(127);
    }

    let master = fork.is_parent().map_err(|e| PtyError::Fork(format!("{e:?}")))?;
    let child_pid = fork.child_pid().ok_or_else(|| PtyError::Fork("missing child pid".into()))?;

    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let mut reader = master.clone();
    thread::spawn(move || {
        let mut buf = [0u8; 4096];
        let mut pending = Vec::new();
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = pending.drain(..=pos).collect();
                        let text = String::from_utf8_lossy(&line).trim_end_matches(['\r', '\n']).to_string();
                        if output_tx.send(text).is_err() {
                            return;
                        }
                    }
                }
                Err(_) => break,
            }
        }
        if !pending.is_empty() {
            let text = String::from_utf8_lossy(&pending).to_string();
            let _ = output_tx.send(text);
        }
    });

    let (exit_tx, exit_rx) = oneshot::channel();
    thread::spawn(move || {
        let code = match waitpid(Pid::from_raw(child_pid), None) {
            Ok(WaitStatus::Exited(_, code)) => code,
            Ok(WaitStatus::Signaled(_, _, _)) => 128,
            _ => -1,
        };
        let _ = exit_tx.send(code);
    });

    Ok(PtyChild { master, child_pid, output: output_rx, exit_status: exit_rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawns_and_streams_output() {
        let mut child = spawn(&PtyCommand { argv: vec!["/bin/echo".into(), "hello".into()], env: vec![] }).unwrap();
        let line = child.output.recv().await.unwrap();
        assert_eq!(line, "hello");
        let code = child.exit_status.await.unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn propagates_environment_to_child() {
        let mut child = spawn(&PtyCommand {
            argv: vec!["/bin/sh".into(), "-c".into(), "echo $OVERSEER_TEST".into()],
            env: vec![("OVERSEER_TEST".into(), "marker".into())],
        })
        .unwrap();
        let line = child.output.recv().await.unwrap();
        assert_eq!(line, "marker");
    }
}
