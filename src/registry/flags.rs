// src/registry/flags.rs

//! Device-keyed cancellation flags.
//!
//! Before a stopped step is killed, a flag file is written for its device so
//! a polling loop inside the script can notice and exit on its own. The file
//! holds the signal value on the first line and a unix-seconds expiry on the
//! second; an expired flag reads as not raised.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use crate::errors::Result;
use crate::fs::FileSystem;

pub const STOP_SIGNAL: &str = "stop";

#[derive(Debug, Clone)]
pub struct CancelFlags {
    fs: Arc<dyn FileSystem>,
    dir: PathBuf,
    ttl: Duration,
}

impl CancelFlags {
    pub fn new(fs: Arc<dyn FileSystem>, dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            fs,
            dir: dir.into(),
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Flag file for a device. Characters that are awkward in file names
    /// (`host:port` connection strings, path separators) become `_`.
    pub fn path_for(&self, device_id: &str) -> PathBuf {
        let name: String = device_id
            .chars()
            .map(|c| match c {
                ':' | '/' | '\\' | ' ' => '_',
                c => c,
            })
            .collect();
        self.dir.join(format!("{name}.flag"))
    }

    pub fn raise(&self, device_id: &str) -> Result<PathBuf> {
        let path = self.path_for(device_id);
        let expires = Utc::now().timestamp() + self.ttl.as_secs() as i64;
        self.fs
            .write(&path, format!("{STOP_SIGNAL}\n{expires}\n").as_bytes())?;
        debug!(device = device_id, path = %path.display(), "raised cancellation flag");
        Ok(path)
    }

    pub fn is_raised(&self, device_id: &str) -> bool {
        let path = self.path_for(device_id);
        let Ok(contents) = self.fs.read_to_string(&path) else {
            return false;
        };
        let mut lines = contents.lines();
        let signal = lines.next().map(str::trim);
        let expires = lines.next().and_then(|l| l.trim().parse::<i64>().ok());
        match (signal, expires) {
            (Some(STOP_SIGNAL), Some(expires)) => expires > Utc::now().timestamp(),
            _ => false,
        }
    }

    pub fn clear(&self, device_id: &str) -> Result<()> {
        self.fs.remove_file(&self.path_for(device_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    fn flags(ttl: Duration) -> (MockFileSystem, CancelFlags) {
        let fs = MockFileSystem::new();
        let flags = CancelFlags::new(Arc::new(fs.clone()), "flags", ttl);
        (fs, flags)
    }

    #[test]
    fn raise_then_clear() {
        let (fs, flags) = flags(Duration::from_secs(60));
        let path = flags.raise("192.168.1.20:5555").unwrap();
        assert_eq!(path, PathBuf::from("flags/192.168.1.20_5555.flag"));
        assert!(fs.read_to_string(&path).unwrap().starts_with("stop\n"));
        assert!(flags.is_raised("192.168.1.20:5555"));

        flags.clear("192.168.1.20:5555").unwrap();
        assert!(!flags.is_raised("192.168.1.20:5555"));
        flags.clear("192.168.1.20:5555").unwrap();
    }

    #[test]
    fn expired_flag_is_not_raised() {
        let (fs, flags) = flags(Duration::from_secs(60));
        let past = Utc::now().timestamp() - 5;
        fs.add_file("flags/dev.flag", format!("stop\n{past}\n"));
        assert!(!flags.is_raised("dev"));
    }

    #[test]
    fn garbage_flag_is_not_raised() {
        let (fs, flags) = flags(Duration::from_secs(60));
        fs.add_file("flags/dev.flag", "go\n99999999999\n");
        assert!(!flags.is_raised("dev"));
    }
}
