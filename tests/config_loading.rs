// tests/config_loading.rs

use std::error::Error;
use std::fs;
use std::path::Path;
use std::time::Duration;

use droidflow::config::{load_and_validate, ConfigFile, RawConfigFile};
use droidflow::errors::DroidflowError;
use droidflow::types::DefinitionStatus;

type TestResult = Result<(), Box<dyn Error>>;

const FULL_CONFIG: &str = r#"
[policy]
stop_grace = "2s"
terminate_grace = 1
flag_dir = "state/flags"

[device.pixel]
connection = "192.168.1.20:5555"
name = "Pixel 7"

[device.emulator-5554]
online = false

[script.login]
interpreter = "python3"
path = "scripts/login.py"

[script.collect]
interpreter = "/usr/bin/python3"
path = "scripts/collect.py"
working_dir = "work"

[orchestration.morning]
status = "active"
steps = [
  { order = 2, script = "collect", timeout = "2m" },
  { order = 1, script = "login", timeout = 30 },
]

[orchestration.draft]
steps = [{ order = 1, script = "login", timeout = "10s" }]
"#;

fn write_config(dir: &Path, body: &str) -> std::path::PathBuf {
    let path = dir.join("Droidflow.toml");
    fs::write(&path, body).unwrap();
    path
}

fn parse(body: &str) -> Result<ConfigFile, DroidflowError> {
    let raw: RawConfigFile = toml::from_str(body)?;
    ConfigFile::try_from(raw)
}

#[test]
fn full_config_loads_and_anchors_paths() -> TestResult {
    let dir = tempfile::tempdir()?;
    let cfg = load_and_validate(write_config(dir.path(), FULL_CONFIG))?;

    assert_eq!(cfg.policy.stop_grace, Duration::from_secs(2));
    assert_eq!(cfg.policy.terminate_grace, Duration::from_secs(1));
    assert_eq!(cfg.policy.flag_dir, dir.path().join("state/flags"));
    assert!(cfg.policy.store_dir.is_none());

    let morning = cfg.catalog.orchestration("morning").expect("morning");
    assert_eq!(morning.status, DefinitionStatus::Active);
    let orders: Vec<u32> = morning.steps().iter().map(|s| s.order).collect();
    assert_eq!(orders, vec![1, 2]);
    assert_eq!(morning.steps()[0].timeout, Duration::from_secs(30));
    assert_eq!(morning.steps()[1].timeout, Duration::from_secs(120));

    let login = &morning.steps()[0].script;
    assert_eq!(login.script_path, dir.path().join("scripts/login.py"));
    assert_eq!(login.interpreter, Path::new("python3"));
    assert_eq!(login.working_dir(), dir.path().join("scripts"));

    let collect = &morning.steps()[1].script;
    assert_eq!(collect.working_dir(), dir.path().join("work"));

    let draft = cfg.catalog.orchestration("draft").expect("draft");
    assert_eq!(draft.status, DefinitionStatus::Draft);

    let emulator = cfg
        .devices
        .iter()
        .find(|d| d.id == "emulator-5554")
        .expect("emulator");
    assert_eq!(emulator.connection, "emulator-5554");
    assert!(!emulator.online);
    assert!(emulator.active);
    Ok(())
}

#[test]
fn missing_file_is_an_io_error() {
    let err = load_and_validate("/definitely/not/here/Droidflow.toml").unwrap_err();
    assert!(matches!(err, DroidflowError::IoError(_)));
}

#[test]
fn config_without_orchestrations_is_rejected() {
    let err = parse("[script.a]\ninterpreter = \"sh\"\npath = \"a.sh\"\n").unwrap_err();
    assert!(err.to_string().contains("at least one"));
}

#[test]
fn unknown_script_reference_is_rejected() {
    let err = parse(
        r#"
        [orchestration.o]
        steps = [{ order = 1, script = "ghost", timeout = "10s" }]
        "#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("unknown script 'ghost'"));
}

#[test]
fn timeout_below_minimum_is_rejected() {
    let err = parse(
        r#"
        [script.a]
        interpreter = "sh"
        path = "a.sh"

        [orchestration.o]
        steps = [{ order = 1, script = "a", timeout = "5s" }]
        "#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("below the minimum"));
}

#[test]
fn minimum_timeout_is_configurable() -> TestResult {
    let cfg = parse(
        r#"
        [policy]
        min_step_timeout = "500ms"

        [script.a]
        interpreter = "sh"
        path = "a.sh"

        [orchestration.o]
        steps = [{ order = 1, script = "a", timeout = "1s" }]
        "#,
    )?;
    assert_eq!(cfg.policy.min_step_timeout, Duration::from_millis(500));
    Ok(())
}

#[test]
fn duplicate_step_orders_are_rejected() {
    let err = parse(
        r#"
        [script.a]
        interpreter = "sh"
        path = "a.sh"

        [orchestration.o]
        steps = [
          { order = 1, script = "a", timeout = "10s" },
          { order = 1, script = "a", timeout = "20s" },
        ]
        "#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("two steps with execution order 1"));
}

#[test]
fn flag_ttl_shorter_than_stop_grace_is_rejected() {
    let err = parse(
        r#"
        [policy]
        stop_grace = "30s"
        cancel_flag_ttl = "10s"

        [orchestration.o]
        "#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("cancel_flag_ttl"));
}

#[test]
fn bad_duration_text_names_the_field() {
    let err = parse(
        r#"
        [policy]
        stop_grace = "soon"

        [orchestration.o]
        "#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("[policy].stop_grace"));
}

#[test]
fn unknown_status_fails_to_parse() {
    let err = parse(
        r#"
        [orchestration.o]
        status = "paused"
        "#,
    )
    .unwrap_err();
    assert!(matches!(err, DroidflowError::TomlError(_)));
}
