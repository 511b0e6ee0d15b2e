use std::fs;
use std::process::Command;

use tempfile::TempDir;

const CONFIG: &str = r#"
version = 1
initial = "front"
switch_timeout = "5s"

[producer]
fps = 60
width = 16
height = 8

[consume]
policy = "wait"
wait_timeout = "20ms"

[[targets]]
name = "front"
width = 64
height = 48
present_interval = "5ms"

[[targets]]
name = "back"
width = 32
height = 32
present_interval = "5ms"
"#;

#[test]
fn headless_run_prints_json_summary() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("session.toml");
    fs::write(&config, CONFIG).unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_camswitch"))
        .env("RUST_LOG", "warn")
        .arg("--config")
        .arg(&config)
        .args(["--duration", "600ms", "--switch-every", "150ms", "--backend", "headless", "--json"])
        .output()
        .expect("failed to run camswitch");
    assert!(
        output.status.success(),
        "camswitch failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["backend"], "headless");
    assert_eq!(summary["leaked_handles"], 0);
    let targets = summary["targets"].as_array().unwrap();
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[0]["name"], "front");
    assert!(targets[0]["frames_drawn"].as_u64().unwrap() > 0);
    let switches = summary["switches"].as_array().unwrap();
    assert!(!switches.is_empty());
    assert_eq!(switches[0]["from"], "front");
    assert_eq!(switches[0]["to"], "back");
}

#[test]
fn invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("broken.toml");
    fs::write(&config, "version = 1\ninitial = \"nowhere\"\n").unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_camswitch"))
        .arg("--config")
        .arg(&config)
        .output()
        .expect("failed to run camswitch");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("broken.toml"));
}

#[test]
fn sample_config_round_trips_through_a_run() {
    let output = Command::new(env!("CARGO_BIN_EXE_camswitch"))
        .arg("sample-config")
        .output()
        .expect("failed to run camswitch sample-config");
    assert!(output.status.success());

    let dir = TempDir::new().unwrap();
    let config = dir.path().join("sample.toml");
    fs::write(&config, &output.stdout).unwrap();
    let status = Command::new(env!("CARGO_BIN_EXE_camswitch"))
        .env("RUST_LOG", "warn")
        .arg("--config")
        .arg(&config)
        .args(["--duration", "200ms"])
        .status()
        .expect("failed to run camswitch");
    assert!(status.success());
}
