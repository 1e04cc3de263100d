// Integration tests for the `sqlbridge` binary.
// Run with: cargo test -p sqlbridge-cli --test cli_tests

use std::io::{Read, Write};
use std::process::{Command, Stdio};

use serde_json::{json, Value};

fn sqlbridge() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_sqlbridge"));
    cmd.env_remove("RUST_LOG");
    cmd.env_remove("SQLBRIDGE_CONFIG");
    cmd
}

fn frame(message: &Value) -> Vec<u8> {
    let body = serde_json::to_vec(message).unwrap();
    let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    out.extend(body);
    out
}

/// Split a captured stdout into message bodies.
fn bodies(mut raw: &[u8]) -> Vec<Value> {
    let mut out = Vec::new();
    while let Some(split) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
        let header = std::str::from_utf8(&raw[..split]).unwrap();
        let len: usize = header
            .trim()
            .strip_prefix("Content-Length:")
            .expect("Content-Length header")
            .trim()
            .parse()
            .unwrap();
        let start = split + 4;
        out.push(serde_json::from_slice(&raw[start..start + len]).unwrap());
        raw = &raw[start + len..];
    }
    out
}

#[test]
fn config_path_honours_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("custom.toml");
    let output = sqlbridge()
        .args(["--config", path.to_str().unwrap(), "config", "path"])
        .output()
        .expect("sqlbridge config path");

    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), path.to_str().unwrap());
}

#[test]
fn config_show_prints_effective_settings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.toml");
    std::fs::write(&path, "[edit]\nrow_limit = 25\n").unwrap();

    let output = sqlbridge()
        .args(["--config", path.to_str().unwrap(), "config", "show"])
        .output()
        .expect("sqlbridge config show");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("row_limit = 25"), "{}", stdout);
    assert!(stdout.contains("[query]"), "{}", stdout);
}

#[test]
fn invalid_settings_exit_with_config_code() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.toml");
    std::fs::write(&path, "[edit\nrow_limit = ").unwrap();

    let output = sqlbridge()
        .args(["--config", path.to_str().unwrap()])
        .stdin(Stdio::null())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(20));
    assert!(String::from_utf8_lossy(&output.stderr).starts_with("error: "));
}

#[test]
fn bad_log_level_is_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = sqlbridge()
        .args(["--config", dir.path().join("none.toml").to_str().unwrap(), "--log-level", "loud"])
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn stdio_session_answers_and_exits_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("host.log");
    let mut child = sqlbridge()
        .args([
            "--config",
            dir.path().join("none.toml").to_str().unwrap(),
            "--log-level",
            "debug",
            "--log-file",
            log.to_str().unwrap(),
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    {
        let stdin = child.stdin.as_mut().unwrap();
        stdin.write_all(&frame(&json!({ "jsonrpc": "2.0", "id": 1, "method": "nope/missing" }))).unwrap();
        stdin.write_all(&frame(&json!({ "jsonrpc": "2.0", "id": 2, "method": "shutdown" }))).unwrap();
        stdin.write_all(&frame(&json!({ "jsonrpc": "2.0", "method": "exit" }))).unwrap();
    }

    let mut stdout = Vec::new();
    child.stdout.take().unwrap().read_to_end(&mut stdout).unwrap();
    let status = child.wait().unwrap();
    assert!(status.success());

    let messages = bodies(&stdout);
    assert_eq!(messages.len(), 2, "{:?}", messages);
    assert_eq!(messages[0]["error"]["code"], -32601);
    assert_eq!(messages[1]["id"], 2);

    let logged = std::fs::read_to_string(&log).unwrap();
    assert!(logged.contains("Exit received"), "{}", logged);
}

#[test]
fn malformed_frame_exits_with_transport_code() {
    let dir = tempfile::tempdir().unwrap();
    let mut child = sqlbridge()
        .args(["--config", dir.path().join("none.toml").to_str().unwrap()])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();

    child
        .stdin
        .take()
        .unwrap()
        .write_all(b"Content-Length: nope\r\n\r\n{}")
        .unwrap();

    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(21));
}
