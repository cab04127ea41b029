//! End-to-end specs driving the real `overseerd` binary: spawn it
//! against an isolated state directory, wait for it to announce
//! readiness, and exercise the control socket protocol the way a real
//! client would, over a plain unix socket rather than any in-process
//! shortcut.

use assert_cmd::cargo::cargo_bin;
use serial_test::serial;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

const FALLBACK_ONLY_CONFIG: &str = r#"
rules = [
  {
    name         = "default"
    display_name = "Default"
  }
]
"#;

struct TestDaemon {
    child: Child,
    state_dir: tempfile::TempDir,
    socket_path: std::path::PathBuf,
}

impl TestDaemon {
    fn start() -> Self {
        let state_dir = tempfile::tempdir().expect("create temp state dir");
        let config_path = state_dir.path().join("overseer.hcl");
        std::fs::write(&config_path, FALLBACK_ONLY_CONFIG).expect("write test config");

        let mut child = Command::new(cargo_bin("overseerd"))
            .env("OVERSEER_STATE_DIR", state_dir.path())
            .env("OVERSEER_CONFIG", &config_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("spawn overseerd");

        let stdout = child.stdout.take().expect("captured stdout");
        let mut reader = BufReader::new(stdout);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).unwrap_or(0) == 0 {
                panic!("overseerd exited before announcing readiness");
            }
            if line.trim() == "READY" {
                break;
            }
            if Instant::now() > deadline {
                panic!("overseerd never printed READY");
            }
        }

        let socket_path = state_dir.path().join("daemon.sock");
        Self { child, state_dir, socket_path }
    }

    fn connect(&self) -> UnixStream {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match UnixStream::connect(&self.socket_path) {
                Ok(stream) => return stream,
                Err(_) if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(50)),
                Err(e) => panic!("could not connect to control socket: {e}"),
            }
        }
    }

    fn request(&self, line: &str) -> String {
        let mut stream = self.connect();
        writeln!(stream, "{line}").expect("write request line");
        stream.shutdown(std::net::Shutdown::Write).ok();
        let mut response = String::new();
        stream.read_to_string(&mut response).expect("read response");
        response
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = &self.state_dir;
    }
}

#[test]
#[serial]
fn version_reports_the_running_daemon_version() {
    let daemon = TestDaemon::start();
    let response = daemon.request("VERSION");
    assert!(response.contains("INFO ok"));
    assert!(response.contains(env!("CARGO_PKG_VERSION")));
}

#[test]
#[serial]
fn status_reports_empty_tunnel_set_for_a_fallback_only_config() {
    let daemon = TestDaemon::start();
    let response = daemon.request("STATUS");
    assert!(response.contains("INFO ok"));
    assert!(response.contains("\"tunnels\":[]"));
}

#[test]
#[serial]
fn unknown_request_line_is_rejected_with_an_error() {
    let daemon = TestDaemon::start();
    let response = daemon.request("BOGUS_COMMAND");
    assert!(response.contains("ERROR"));
}

#[test]
#[serial]
fn stop_request_cancels_the_daemon() {
    let mut daemon = TestDaemon::start();
    let response = daemon.request("STOP");
    assert!(response.contains("INFO stopping"));

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(Some(_)) = daemon.child.try_wait() {
            break;
        }
        if Instant::now() > deadline {
            panic!("overseerd did not exit after STOP");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
#[serial]
fn second_daemon_against_the_same_state_dir_refuses_to_start() {
    let daemon = TestDaemon::start();

    let config_path = daemon.state_dir.path().join("overseer.hcl");
    let mut second = Command::new(cargo_bin("overseerd"))
        .env("OVERSEER_STATE_DIR", daemon.state_dir.path())
        .env("OVERSEER_CONFIG", &config_path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn second overseerd");

    let status = second.wait().expect("second overseerd should exit");
    assert!(!status.success(), "a second daemon against a locked state dir must fail to start");
}
