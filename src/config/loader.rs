// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::catalog::is_path_like;
use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Load a configuration file from a given path and return the raw `RawConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation. Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)?;

    let config: RawConfigFile = toml::from_str(&contents)?;

    Ok(config)
}

/// Load a configuration file from path, anchor its relative paths to the
/// file's directory and validate it.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    let mut raw_config = load_from_path(path)?;
    anchor_relative_paths(&mut raw_config, &config_root_dir(path));
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// Helper to resolve a default config path: `Droidflow.toml` in the current
/// working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("Droidflow.toml")
}

/// Directory relative paths in a config file are resolved against.
///
/// A bare filename like "Droidflow.toml" (parent = "") maps to ".".
pub fn config_root_dir(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn anchor(root: &Path, value: &mut String) {
    let path = Path::new(value.as_str());
    if path.is_relative() && !value.is_empty() {
        *value = root.join(path).display().to_string();
    }
}

/// Rewrite relative script, interpreter and directory paths so they do not
/// depend on the process's working directory. Bare interpreter names
/// (`python3`) are left for `PATH` lookup.
pub fn anchor_relative_paths(cfg: &mut RawConfigFile, root: &Path) {
    for script in cfg.script.values_mut() {
        anchor(root, &mut script.path);
        if let Some(dir) = script.working_dir.as_mut() {
            anchor(root, dir);
        }
        if is_path_like(Path::new(&script.interpreter)) {
            anchor(root, &mut script.interpreter);
        }
    }
    if let Some(dir) = cfg.policy.flag_dir.as_mut() {
        anchor(root, dir);
    }
    if let Some(dir) = cfg.policy.store_dir.as_mut() {
        anchor(root, dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_follow_the_config_file() {
        let mut cfg: RawConfigFile = toml::from_str(
            r#"
            [policy]
            store_dir = "runs"

            [script.a]
            interpreter = "python3"
            path = "scripts/a.py"

            [script.b]
            interpreter = "venv/bin/python"
            path = "/abs/b.py"
            "#,
        )
        .unwrap();
        anchor_relative_paths(&mut cfg, Path::new("/srv/flows"));

        assert_eq!(cfg.script["a"].path, "/srv/flows/scripts/a.py");
        assert_eq!(cfg.script["a"].interpreter, "python3");
        assert_eq!(cfg.script["b"].path, "/abs/b.py");
        assert_eq!(cfg.script["b"].interpreter, "/srv/flows/venv/bin/python");
        assert_eq!(cfg.policy.store_dir.as_deref(), Some("/srv/flows/runs"));
        assert!(cfg.policy.flag_dir.is_none());
    }

    #[test]
    fn root_dir_of_bare_filename_is_cwd() {
        assert_eq!(config_root_dir(Path::new("Droidflow.toml")), PathBuf::from("."));
        assert_eq!(
            config_root_dir(Path::new("conf/Droidflow.toml")),
            PathBuf::from("conf")
        );
    }
}
