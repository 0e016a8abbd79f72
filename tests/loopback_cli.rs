use std::process::Command;

#[test]
fn loopback_prints_response_and_stats() {
    let exe = env!("CARGO_BIN_EXE_msgstream");
    let out = Command::new(exe)
        .env_remove("MSGSTREAM_NAGLE_MS")
        .env_remove("MSGSTREAM_READ_TIMEOUT_MS")
        .args(["loopback", "--nagle-ms=-1", "--path", "/x", "--body", "body"])
        .output()
        .expect("run loopback");
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("HTTP/1.0 200 OK"));
    assert!(stdout.contains("x-request: GET /x HTTP/1.0"));
    assert!(stdout.contains("body"));
    assert!(stdout.contains("encoding: msgpack"));
    assert!(stdout.contains("nagle_ms: -1"));
    assert!(stdout.contains("client: sent="));
    assert!(stdout.contains("server: sent="));
    assert!(stdout.contains("protocol_errors=0"));
}

#[test]
fn loopback_reads_config_file() {
    let tmp = std::env::temp_dir().join(format!("msgstream-cli-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&tmp).unwrap();
    let cfg_path = tmp.join("config.json");
    std::fs::write(
        &cfg_path,
        r#"{
          "endpoint_id": "cli-test",
          "nagle_ms": 0,
          "encoding": "JSON",
          "read_timeout_ms": 10000,
          "log_file": "msgstream.log"
        }"#,
    )
    .unwrap();

    let exe = env!("CARGO_BIN_EXE_msgstream");
    let out = Command::new(exe)
        .env_remove("MSGSTREAM_NAGLE_MS")
        .env_remove("MSGSTREAM_READ_TIMEOUT_MS")
        .arg("-c")
        .arg(&cfg_path)
        .args(["loopback", "--body", "from config"])
        .output()
        .expect("run loopback");
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("encoding: json"));
    assert!(stdout.contains("nagle_ms: 0"));
    assert!(stdout.contains("from config"));

    let log = std::fs::read_to_string(tmp.join("msgstream.log")).unwrap();
    assert!(log.contains("session opened"));
    assert!(log.contains("session accepted"));
    let _ = std::fs::remove_dir_all(&tmp);
}

#[test]
fn loopback_rejects_unknown_encoding() {
    let exe = env!("CARGO_BIN_EXE_msgstream");
    let out = Command::new(exe)
        .args(["loopback", "--encoding", "yaml"])
        .output()
        .expect("run loopback");
    assert!(!out.status.success());
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("encoding must be json or msgpack"));
}
