// src/config/policy.rs

use std::path::PathBuf;
use std::time::Duration;

use crate::exec::interpreter::default_fallback_interpreters;

pub const DEFAULT_MIN_STEP_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(8);
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(3);
pub const DEFAULT_CANCEL_FLAG_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_FLAG_DIR: &str = ".droidflow/flags";

/// Timing and location knobs shared by the executor and the stop path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPolicy {
    /// Smallest step timeout accepted when loading definitions.
    pub min_step_timeout: Duration,
    /// How long `stop` waits after raising the cancellation flag before it
    /// starts terminating process trees.
    pub stop_grace: Duration,
    /// Interrupt-to-kill window when terminating a process tree.
    pub terminate_grace: Duration,
    pub cancel_flag_ttl: Duration,
    /// Upper bound on waiting for output readers after a process ends.
    pub output_drain_timeout: Duration,
    pub fallback_interpreters: Vec<PathBuf>,
    pub flag_dir: PathBuf,
    /// Where run records are mirrored; `None` keeps them in memory.
    pub store_dir: Option<PathBuf>,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            min_step_timeout: DEFAULT_MIN_STEP_TIMEOUT,
            stop_grace: DEFAULT_STOP_GRACE,
            terminate_grace: DEFAULT_TERMINATE_GRACE,
            cancel_flag_ttl: DEFAULT_CANCEL_FLAG_TTL,
            output_drain_timeout: DEFAULT_OUTPUT_DRAIN_TIMEOUT,
            fallback_interpreters: default_fallback_interpreters(),
            flag_dir: PathBuf::from(DEFAULT_FLAG_DIR),
            store_dir: None,
        }
    }
}

/// Parse strings like `"250ms"`, `"10s"`, `"5m"`, `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    // Find the boundary between digits and suffix.
    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' is missing a unit suffix (ms, s, m or h)"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{}': {}", num_part, e))?;
    let unit = unit_part.trim().to_lowercase();

    match unit.as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        _ => Err(format!(
            "unsupported duration unit '{}'; expected ms, s, m, or h",
            unit
        )),
    }
}
