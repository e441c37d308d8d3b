// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `droidflow`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "droidflow",
    version,
    about = "Run ordered script orchestrations against Android devices.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Droidflow.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Droidflow.toml")]
    pub config: String,

    /// Orchestration to run.
    #[arg(long, short = 'o', value_name = "NAME")]
    pub orchestration: String,

    /// Target device id. Repeat for several devices.
    ///
    /// If omitted, the first active online device is used.
    #[arg(long = "device", short = 'd', value_name = "ID")]
    pub devices: Vec<String>,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DROIDFLOW_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the resolved plan, but don't run anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_flag_repeats() {
        let args = CliArgs::parse_from([
            "droidflow",
            "-o",
            "smoke",
            "--device",
            "emulator-5554",
            "-d",
            "10.0.0.7:5555",
        ]);
        assert_eq!(args.orchestration, "smoke");
        assert_eq!(args.devices, vec!["emulator-5554", "10.0.0.7:5555"]);
        assert_eq!(args.config, "Droidflow.toml");
        assert!(!args.dry_run);
    }

    #[test]
    fn orchestration_is_required() {
        assert!(CliArgs::try_parse_from(["droidflow"]).is_err());
    }
}
