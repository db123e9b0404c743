//! CLI command definitions and dispatch.

pub mod launch;
pub mod probe;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use nestbox_common::config::NestboxConfig;

/// nestbox — launch a container from a JSON launch spec.
#[derive(Parser, Debug)]
#[command(name = "nestbox", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// JSON configuration file.
    #[arg(long, global = true, env = "NESTBOX_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding per-container staging mounts.
    #[arg(long, global = true, env = "NESTBOX_STATE_DIR")]
    pub state_dir: Option<PathBuf>,
}

/// Log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    Text,
    /// One JSON object per event.
    Json,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Report which container features the running kernel supports.
    Probe(probe::ProbeArgs),
    /// Launch a container and wait for it to exit.
    Launch(launch::LaunchArgs),
}

impl Cli {
    /// Builds the effective configuration: file first, then flags and
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file cannot be loaded.
    pub fn load_config(&self) -> anyhow::Result<NestboxConfig> {
        let mut config = match &self.config {
            Some(path) => NestboxConfig::load(path)
                .with_context(|| format!("loading configuration {}", path.display()))?,
            None => NestboxConfig::default(),
        };
        if let Some(state_dir) = &self.state_dir {
            config.state_dir.clone_from(state_dir);
        }
        Ok(config)
    }
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let config = cli.load_config()?;
    match cli.command {
        Command::Probe(args) => probe::execute(&args),
        Command::Launch(args) => launch::execute(&args, config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_dir_flag_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nestbox.json");
        std::fs::write(&path, r#"{ "state_dir": "/var/lib/nestbox", "stack_size": 65536 }"#)
            .unwrap();

        let cli = Cli::try_parse_from([
            "nestbox",
            "--config",
            path.to_str().unwrap(),
            "--state-dir",
            "/tmp/nestbox",
            "probe",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();

        assert_eq!(config.state_dir, PathBuf::from("/tmp/nestbox"));
        assert_eq!(config.stack_size, 65536);
    }

    #[test]
    fn launch_collects_repeated_flags() {
        let cli = Cli::try_parse_from([
            "nestbox",
            "--log-format",
            "json",
            "launch",
            "--spec",
            "web.json",
            "--interface",
            "vnet0",
            "--interface",
            "vnet1",
            "--tty",
            "/dev/tty5",
        ])
        .unwrap();

        assert_eq!(cli.log_format, LogFormat::Json);
        let Command::Launch(args) = cli.command else {
            panic!("expected launch");
        };
        assert_eq!(args.interfaces, vec!["vnet0", "vnet1"]);
        assert_eq!(args.ttys, vec![PathBuf::from("/dev/tty5")]);
    }
}
