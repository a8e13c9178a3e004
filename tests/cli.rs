use assert_cmd::Command;
use predicates::str::contains;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const COMPOSE_FIXTURE: &str = "services:
  open-webui:
    image: ghcr.io/open-webui/open-webui:main
  searxng:
    image: searxng/searxng:latest
    cap_drop:
      - ALL
    cap_add:
      - CHOWN
";

fn bin(root: &Path) -> Command {
    let path = assert_cmd::cargo::cargo_bin!("localai");
    let mut cmd = Command::new(path);
    cmd.env_remove("LOCALAI_CONFIG")
        .env_remove("LOCALAI_PROJECT_DIR")
        .env("LOCALAI_CONFIG_DIR", root.join("config"));
    cmd
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

#[test]
fn config_init_creates_file_and_keeps_existing() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config").join("config.yaml");

    let output = bin(dir.path())
        .args(["--json", "config", "init"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["result"]["created"], true);
    assert!(fs::read_to_string(&config_path)
        .unwrap()
        .contains("project_name: localai"));

    fs::write(&config_path, "version: 1\nstack:\n  profile: gpu-amd\n").unwrap();
    let output = bin(dir.path())
        .args(["--json", "config", "init"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    assert_eq!(parse_json(&output)["result"]["created"], false);
    assert!(fs::read_to_string(&config_path).unwrap().contains("gpu-amd"));
}

#[test]
fn config_validate_rejects_unknown_fields() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("custom.yaml");
    fs::write(&config_path, "version: 1\nbogus: true\n").unwrap();

    bin(dir.path())
        .arg("--config")
        .arg(&config_path)
        .args(["config", "validate"])
        .assert()
        .failure()
        .stderr(contains("unknown field"));
}

#[test]
fn explicit_missing_config_is_an_error() {
    let dir = tempdir().unwrap();
    bin(dir.path())
        .arg("--config")
        .arg(dir.path().join("missing.yaml"))
        .args(["config", "show"])
        .assert()
        .failure()
        .stderr(contains("config file not found"));
}

#[test]
fn start_rejects_conflicting_pull_flags() {
    let dir = tempdir().unwrap();
    bin(dir.path())
        .env("PATH", "")
        .arg("--project-dir")
        .arg(dir.path())
        .args(["start", "--pull-all", "--update-running"])
        .assert()
        .failure()
        .stderr(contains("conflicts"));
}

#[test]
fn start_rejects_unknown_profile() {
    let dir = tempdir().unwrap();
    bin(dir.path())
        .env("PATH", "")
        .arg("--project-dir")
        .arg(dir.path())
        .args(["start", "--profile", "tpu"])
        .assert()
        .failure()
        .stderr(contains("unknown profile 'tpu'"));
}

#[test]
fn verify_reports_missing_docker_in_json() {
    let dir = tempdir().unwrap();
    let output = bin(dir.path())
        .env("PATH", "")
        .arg("--project-dir")
        .arg(dir.path())
        .args(["--json", "verify"])
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["ok"], false);
    assert_eq!(json["error_details"]["error_code"], "docker_not_found");
    assert!(json["error_details"]["command"]
        .as_str()
        .unwrap()
        .starts_with("docker compose -p localai --profile cpu -f docker-compose.yml"));
}

#[test]
fn probe_without_docker_is_unknown() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("docker-compose.yml"), COMPOSE_FIXTURE).unwrap();
    let output = bin(dir.path())
        .env("PATH", "")
        .arg("--project-dir")
        .arg(dir.path())
        .args(["--json", "probe"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["result"]["probe"]["state"], "unknown");
    assert_eq!(json["result"]["directive"], "active");
}

#[test]
fn bootstrap_without_docker_suspends_directive() {
    let dir = tempdir().unwrap();
    let compose = dir.path().join("docker-compose.yml");
    fs::write(&compose, COMPOSE_FIXTURE).unwrap();

    let output = bin(dir.path())
        .env("PATH", "")
        .arg("--project-dir")
        .arg(dir.path())
        .args(["--json", "bootstrap"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["result"]["patch"]["changed"], true);
    assert!(fs::read_to_string(&compose).unwrap().contains(
        "    # cap_drop:\n    #   - ALL  # Temporarily commented out for first run\n"
    ));
}

#[test]
fn plan_puts_overlay_after_base_file() {
    let dir = tempdir().unwrap();
    let output = bin(dir.path())
        .args([
            "--json",
            "plan",
            "up",
            "--profile",
            "gpu-nvidia",
            "--environment",
            "public",
        ])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    let files: Vec<&str> = json["result"]["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(
        files,
        vec!["docker-compose.yml", "docker-compose.override.public.yml"]
    );
    assert_eq!(json["result"]["service_set"][1], "ollama-gpu");
}

#[test]
fn plan_prints_command_in_text_mode() {
    let dir = tempdir().unwrap();
    bin(dir.path())
        .args(["plan", "down", "--profile", "none", "--environment", "none"])
        .assert()
        .success()
        .stdout(contains("docker compose -p localai -f docker-compose.yml down"));
}

#[test]
fn secrets_skip_when_settings_are_missing() {
    let dir = tempdir().unwrap();
    let output = bin(dir.path())
        .arg("--project-dir")
        .arg(dir.path())
        .args(["--json", "secrets"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["ok"], true);
    assert!(json["result"]["skipped"].is_string());
    assert_eq!(json["result"]["key_generated"], false);
}

#[test]
fn doctor_json_reports_missing_docker() {
    let dir = tempdir().unwrap();
    let output = bin(dir.path())
        .env("PATH", "")
        .arg("--project-dir")
        .arg(dir.path())
        .args(["--json", "doctor"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json = parse_json(&output);
    assert_eq!(json["ok"], false);
    let checks = json["result"]["checks"].as_array().unwrap();
    let runtime = checks
        .iter()
        .find(|check| check["id"] == "docker_runtime")
        .unwrap();
    assert_eq!(runtime["ok"], false);
}

#[test]
fn environment_help_mentions_no_overlay_spelling() {
    let dir = tempdir().unwrap();
    bin(dir.path())
        .args(["start", "--help"])
        .assert()
        .success()
        .stdout(contains("none for no overlay"));
}
