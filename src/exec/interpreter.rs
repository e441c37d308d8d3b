// src/exec/interpreter.rs

//! Interpreter resolution and invocation building.

use std::env;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::catalog::{is_path_like, ScriptDefinition};
use crate::errors::SpawnError;

use super::process::CommandSpec;

pub const ENV_DEVICE: &str = "DROIDFLOW_DEVICE";
pub const ENV_CANCEL_FLAG: &str = "DROIDFLOW_CANCEL_FLAG";

/// Variables that force UTF-8 text I/O in the child regardless of host
/// locale.
const UTF8_ENV: &[(&str, &str)] = &[
    ("PYTHONIOENCODING", "utf-8"),
    ("PYTHONUTF8", "1"),
    ("PYTHONLEGACYWINDOWSSTDIO", "utf-8"),
    ("LC_ALL", "C.UTF-8"),
    ("LANG", "C.UTF-8"),
];

/// Interpreter locations tried when the configured one is missing.
pub fn default_fallback_interpreters() -> Vec<PathBuf> {
    if cfg!(windows) {
        let mut paths = Vec::new();
        if let Some(local) = env::var_os("LOCALAPPDATA") {
            let local = PathBuf::from(local);
            for version in ["Python312", "Python311", "Python310"] {
                paths.push(local.join("Programs\\Python").join(version).join("python.exe"));
            }
        }
        paths.push(PathBuf::from("C:\\Python311\\python.exe"));
        paths.push(PathBuf::from("C:\\Program Files\\Python311\\python.exe"));
        paths
    } else {
        vec![
            PathBuf::from("/usr/bin/python3"),
            PathBuf::from("/usr/local/bin/python3"),
            PathBuf::from("/opt/homebrew/bin/python3"),
        ]
    }
}

/// Store alias stubs under `WindowsApps` exist on disk but usually cannot
/// run scripts.
fn is_app_alias(path: &Path) -> bool {
    path.components()
        .any(|c| c.as_os_str().eq_ignore_ascii_case("WindowsApps"))
}

fn find_on_path(name: &Path) -> Option<PathBuf> {
    let path_var = env::var_os("PATH")?;
    env::split_paths(&path_var).find_map(|dir| {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
        if cfg!(windows) {
            let exe = candidate.with_extension("exe");
            if exe.is_file() {
                return Some(exe);
            }
        }
        None
    })
}

/// Turn the configured interpreter into an executable path.
///
/// A path-like interpreter must exist (and not be a store alias); a bare
/// name is looked up on `PATH`. Failing that, the first existing fallback
/// is used.
pub fn resolve_interpreter(configured: &Path, fallbacks: &[PathBuf]) -> Result<PathBuf, SpawnError> {
    let direct = if is_path_like(configured) {
        (configured.is_file() && !is_app_alias(configured)).then(|| configured.to_path_buf())
    } else {
        find_on_path(configured)
    };
    if let Some(found) = direct {
        return Ok(found);
    }

    match fallbacks.iter().find(|p| p.is_file()) {
        Some(fallback) => {
            warn!(
                configured = %configured.display(),
                fallback = %fallback.display(),
                "configured interpreter unavailable; using fallback"
            );
            Ok(fallback.clone())
        }
        None => Err(SpawnError::ExecutableNotFound(configured.to_path_buf())),
    }
}

fn looks_like_python(interpreter: &Path) -> bool {
    interpreter
        .file_stem()
        .and_then(|s| s.to_str())
        .is_some_and(|s| s.to_ascii_lowercase().starts_with("python"))
}

/// `<interpreter> <script> <connection>`, run from the script's working
/// directory with a UTF-8 environment.
pub fn build_invocation(
    interpreter: &Path,
    script: &ScriptDefinition,
    device_id: &str,
    connection: &str,
    cancel_flag: &Path,
) -> CommandSpec {
    let mut args = Vec::new();
    if looks_like_python(interpreter) {
        args.push("-X".to_string());
        args.push("utf8".to_string());
    }
    args.push(script.script_path.display().to_string());
    args.push(connection.to_string());

    let mut env: Vec<(String, String)> = UTF8_ENV
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    env.push((ENV_DEVICE.to_string(), device_id.to_string()));
    env.push((ENV_CANCEL_FLAG.to_string(), cancel_flag.display().to_string()));

    CommandSpec {
        program: interpreter.to_path_buf(),
        args,
        working_dir: script.working_dir(),
        env,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_path_is_used_as_is() {
        let dir = tempfile::tempdir().unwrap();
        let interp = dir.path().join("python3");
        std::fs::write(&interp, "").unwrap();
        assert_eq!(resolve_interpreter(&interp, &[]).unwrap(), interp);
    }

    #[test]
    fn missing_path_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let fallback = dir.path().join("py");
        std::fs::write(&fallback, "").unwrap();
        let missing = dir.path().join("nope/python3");
        let resolved =
            resolve_interpreter(&missing, &[dir.path().join("also-missing"), fallback.clone()])
                .unwrap();
        assert_eq!(resolved, fallback);
    }

    #[test]
    fn missing_everything_is_executable_not_found() {
        let err = resolve_interpreter(Path::new("/nope/python3"), &[PathBuf::from("/nope/py")])
            .unwrap_err();
        assert!(matches!(err, SpawnError::ExecutableNotFound(p) if p == Path::new("/nope/python3")));
    }

    #[test]
    fn store_alias_is_skipped() {
        assert!(is_app_alias(Path::new(
            "C:/Users/me/AppData/Local/Microsoft/WindowsApps/python.exe"
        )));
        assert!(!is_app_alias(Path::new("/usr/bin/python3")));
    }

    #[test]
    fn python_invocation_gets_utf8_mode() {
        let script = ScriptDefinition::new("login", "python3", "/opt/scripts/login.py");
        let spec = build_invocation(
            Path::new("/usr/bin/python3"),
            &script,
            "pixel-7",
            "192.168.1.20:5555",
            Path::new("/var/flags/pixel-7.flag"),
        );
        assert_eq!(
            spec.args,
            vec!["-X", "utf8", "/opt/scripts/login.py", "192.168.1.20:5555"]
        );
        assert_eq!(spec.working_dir, PathBuf::from("/opt/scripts"));
        assert!(spec
            .env
            .contains(&(ENV_CANCEL_FLAG.to_string(), "/var/flags/pixel-7.flag".to_string())));
        assert!(spec
            .env
            .contains(&("PYTHONIOENCODING".to_string(), "utf-8".to_string())));
    }

    #[test]
    fn non_python_invocation_is_plain() {
        let script = ScriptDefinition::new("s", "/bin/sh", "/opt/s.sh");
        let spec = build_invocation(
            Path::new("/bin/sh"),
            &script,
            "d",
            "emulator-5554",
            Path::new("f"),
        );
        assert_eq!(spec.args, vec!["/opt/s.sh", "emulator-5554"]);
    }
}
