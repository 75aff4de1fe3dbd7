//! End-to-end tests of the `bastion` binary

use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn bastion(dir: &Path, base_port: u16) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_bastion"));
    command
        .env_remove("RUST_LOG")
        .env_remove("BASTION_SOCKS_PROXY")
        .arg("--config")
        .arg(dir.join("config.json"))
        .arg("--control-base-port")
        .arg(base_port.to_string())
        .arg("--attempts")
        .arg("1");
    command
}

fn released_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn run(command: &mut Command) -> Output {
    command.output().expect("failed to run bastion")
}

fn wait_for_file(path: &Path, child: &mut Child) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !path.exists() {
        if let Ok(Some(status)) = child.try_wait() {
            panic!("server exited early: {}", status);
        }
        assert!(Instant::now() < deadline, "server did not write {:?}", path);
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_message_without_daemon_fails() {
    let dir = TempDir::new().unwrap();
    let state_file = dir.path().join("bastion.state");

    let output = run(bastion(dir.path(), released_port())
        .arg(&state_file)
        .arg("message")
        .arg("status"));

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Cannot connect to server"));
    assert!(!state_file.exists());
}

#[test]
fn test_server_status_and_stop() {
    let dir = TempDir::new().unwrap();
    let state_file = dir.path().join("bastion.state");
    let base_port = released_port();

    let mut server = bastion(dir.path(), base_port)
        .arg(&state_file)
        .arg("server")
        .arg("--silent")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    wait_for_file(&state_file, &mut server);

    let record = std::fs::read_to_string(&state_file).unwrap();
    assert!(record.starts_with("AF_INET 127.0.0.1 "), "{}", record);

    let status = run(bastion(dir.path(), base_port)
        .arg(&state_file)
        .arg("message")
        .arg("status"));
    assert!(status.status.success());
    assert_eq!(String::from_utf8_lossy(&status.stdout).trim(), "");

    let again = run(bastion(dir.path(), base_port).arg(&state_file).arg("server"));
    assert!(again.status.success());
    assert_eq!(
        String::from_utf8_lossy(&again.stdout).trim(),
        "Server already running"
    );

    let stop = run(bastion(dir.path(), base_port)
        .arg(&state_file)
        .arg("message")
        .arg("stop"));
    assert!(stop.status.success());
    assert_eq!(String::from_utf8_lossy(&stop.stdout).trim(), "stopped");

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(status) = server.try_wait().unwrap() {
            assert!(status.success());
            break;
        }
        assert!(Instant::now() < deadline, "server did not exit after stop");
        std::thread::sleep(Duration::from_millis(50));
    }
}
