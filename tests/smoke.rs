//! Smoke tests -- verify the binary runs and key commands parse.

use assert_cmd::Command;

#[test]
fn test_cli_help() {
    Command::cargo_bin("safeguard")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains(
            "Real-time threat detection and alert pipeline",
        ));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("safeguard")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("safeguard"));
}

#[test]
fn test_serve_subcommand_exists() {
    Command::cargo_bin("safeguard")
        .unwrap()
        .args(["serve", "--help"])
        .assert()
        .success();
}

#[test]
fn test_events_list_subcommand_exists() {
    Command::cargo_bin("safeguard")
        .unwrap()
        .args(["events", "list", "--help"])
        .assert()
        .success();
}

#[test]
fn test_notify_test_subcommand_exists() {
    Command::cargo_bin("safeguard")
        .unwrap()
        .args(["notify", "test", "--help"])
        .assert()
        .success();
}

#[test]
fn test_config_check_accepts_default_config() {
    // No config file present means defaults, which must validate.
    let dir = tempfile::TempDir::new().unwrap();
    Command::cargo_bin("safeguard")
        .unwrap()
        .current_dir(dir.path())
        .args(["config", "check"])
        .assert()
        .success()
        .stdout(predicates::str::contains("Config OK"));
}

#[test]
fn test_config_check_rejects_invalid_config() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[severity]\nhigh_threshold = 2.5\n").unwrap();

    Command::cargo_bin("safeguard")
        .unwrap()
        .args(["--config", path.to_str().unwrap(), "config", "check"])
        .assert()
        .failure();
}

#[test]
fn test_events_list_on_fresh_database() {
    let dir = tempfile::TempDir::new().unwrap();
    let config_path = dir.path().join("safeguard.toml");
    let db_path = dir.path().join("events.db");
    std::fs::write(
        &config_path,
        format!("[storage]\ndb_path = \"{}\"\n", db_path.display()),
    )
    .unwrap();

    Command::cargo_bin("safeguard")
        .unwrap()
        .args(["--config", config_path.to_str().unwrap(), "events", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("No events found."));
}
