//! Configuration system tests
//!
//! Tests configuration loading, validation, and environment overrides

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Test fixture for configuration testing
struct ConfigFixture {
    temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("switchyard.toml");
        Self { temp_dir, config_path }
    }

    fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).unwrap();
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }

    fn validate(&self) -> assert_cmd::assert::Assert {
        Command::cargo_bin("switchyard")
            .unwrap()
            .current_dir(self.temp_dir.path())
            .args(["--config", self.path(), "config", "validate"])
            .assert()
    }
}

// ─────────────────────────────────────────────────────────────────
// Valid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_minimal_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[broadcast]

[channel]
"#,
    );

    fixture
        .validate()
        .success()
        .stdout(predicate::str::contains("Configuration is valid"));
}

#[test]
fn test_full_config() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[broadcast]
publish_addr = "127.0.0.1:7556"
replay_addr = "127.0.0.1:7557"
topic = "prices"
capacity = 50
publish_interval_ms = 0
signal_gaps = false

[channel]
endpoint = "127.0.0.1:7555"
timeout_ms = 500
max_retries = 5
backoff_ms = 200

[router]
bind_addr = "127.0.0.1:7558"
registration_wait_ms = 2000
poll_interval_ms = 500

[aggregator]
bind_addr = "127.0.0.1:7559"
pending_timeout_ms = 10000

[worker]
index = 3
idle_timeout_ms = 60000

[logging]
level = "debug"
json_format = true
"#,
    );

    fixture.validate().success();

    Command::cargo_bin("switchyard")
        .unwrap()
        .args(["--config", fixture.path(), "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("prices"))
        .stdout(predicate::str::contains("capacity = 50"))
        .stdout(predicate::str::contains("signal_gaps = false"));
}

#[test]
fn test_generated_default_config_is_valid() {
    let fixture = ConfigFixture::new();

    Command::cargo_bin("switchyard")
        .unwrap()
        .args(["config", "init", "--path", fixture.path()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration written to"));

    assert!(fixture.config_path.exists());
    fixture.validate().success();
}

// ─────────────────────────────────────────────────────────────────
// Invalid Configuration Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_zero_capacity() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[broadcast]
capacity = 0
"#,
    );

    fixture
        .validate()
        .failure()
        .code(10)
        .stderr(predicate::str::contains("replay capacity must be at least 1"));
}

#[test]
fn test_zero_retries() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[channel]
max_retries = 0
"#,
    );

    fixture
        .validate()
        .failure()
        .stderr(predicate::str::contains("at least one attempt is required"));
}

#[test]
fn test_bad_address() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[router]
bind_addr = "not-an-address"
"#,
    );

    fixture
        .validate()
        .failure()
        .stderr(predicate::str::contains("'not-an-address' is not a valid socket address"));
}

#[test]
fn test_invalid_log_level() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[logging]
level = "verbose"
"#,
    );

    fixture
        .validate()
        .failure()
        .stderr(predicate::str::contains("Invalid log level 'verbose'"));
}

#[test]
fn test_invalid_log_rotation() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[logging]
rotation = "weekly"
"#,
    );

    fixture
        .validate()
        .failure()
        .code(10)
        .stderr(predicate::str::contains("Invalid rotation 'weekly'"));
}

#[test]
fn test_malformed_toml() {
    let fixture = ConfigFixture::new();
    fixture.write_config("[broadcast\ncapacity = ");

    fixture
        .validate()
        .failure()
        .code(10)
        .stderr(predicate::str::contains("Failed to parse configuration"));
}

#[test]
fn test_wrong_value_type() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[channel]
max_retries = "many"
"#,
    );

    fixture.validate().failure().code(10);
}

// ─────────────────────────────────────────────────────────────────
// Init Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_init_refuses_to_overwrite() {
    let fixture = ConfigFixture::new();
    fixture.write_config("# existing\n");

    Command::cargo_bin("switchyard")
        .unwrap()
        .args(["config", "init", "--path", fixture.path()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    assert_eq!(fs::read_to_string(&fixture.config_path).unwrap(), "# existing\n");
}

#[test]
fn test_init_force_overwrites() {
    let fixture = ConfigFixture::new();
    fixture.write_config("# existing\n");

    Command::cargo_bin("switchyard")
        .unwrap()
        .args(["config", "init", "--force", "--path", fixture.path()])
        .assert()
        .success();

    let content = fs::read_to_string(&fixture.config_path).unwrap();
    assert!(content.contains("[broadcast]"));
    assert!(content.contains("[channel]"));
}

#[test]
fn test_init_creates_parent_directories() {
    let fixture = ConfigFixture::new();
    let nested = fixture.temp_dir.path().join("a").join("b").join("switchyard.toml");

    Command::cargo_bin("switchyard")
        .unwrap()
        .args(["config", "init", "--path", nested.to_str().unwrap()])
        .assert()
        .success();

    assert!(nested.exists());
}

// ─────────────────────────────────────────────────────────────────
// Environment Override Tests
// ─────────────────────────────────────────────────────────────────

#[test]
fn test_env_overrides_file() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[channel]
max_retries = 5
"#,
    );

    Command::cargo_bin("switchyard")
        .unwrap()
        .env("SWITCHYARD_CHANNEL_MAX_RETRIES", "9")
        .env("SWITCHYARD_TOPIC", "orders")
        .args(["--config", fixture.path(), "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("max_retries = 9"))
        .stdout(predicate::str::contains("orders"));
}

#[test]
fn test_unparsable_env_override_is_ignored() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[broadcast]
capacity = 64
"#,
    );

    Command::cargo_bin("switchyard")
        .unwrap()
        .env("SWITCHYARD_CAPACITY", "lots")
        .args(["--config", fixture.path(), "config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("capacity = 64"));
}

#[test]
fn test_config_path_from_env() {
    let fixture = ConfigFixture::new();
    fixture.write_config(
        r#"
[broadcast]
capacity = 0
"#,
    );

    Command::cargo_bin("switchyard")
        .unwrap()
        .env("SWITCHYARD_CONFIG", fixture.path())
        .args(["config", "validate"])
        .assert()
        .failure()
        .code(10);
}
