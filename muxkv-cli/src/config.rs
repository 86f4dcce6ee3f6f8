//! Configuration for the `muxkv` command.
//!
//! Values come from an optional JSON file and from command-line flags;
//! flags take precedence over the file.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use muxkv_client::ClientConfig;
use serde::Deserialize;

/// Which client runs the commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Pipelining client over `connections` connections.
    #[default]
    Mux,
    /// One connection, one job at a time.
    Synced,
    /// Rent a client from a pool of `connections`.
    Pool,
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "muxkv")]
#[command(version)]
#[command(about = "Send commands to a Redis-compatible server", long_about = None)]
pub struct CliArgs {
    /// Path to a JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server host
    #[arg(long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Connections (mux) or pooled clients (pool)
    #[arg(short = 'n', long)]
    pub connections: Option<usize>,

    /// Client used to run the commands
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Commands separated by `;`, e.g. `SET k 1 ; INCR k ; GET k`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub words: Vec<String>,
}

/// JSON configuration file layout.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub client: ClientConfig,
    pub mode: Option<Mode>,
    pub log_level: Option<String>,
}

/// Resolved settings.
#[derive(Debug)]
pub struct Settings {
    pub client: ClientConfig,
    pub mode: Mode,
    pub log_level: String,
    pub commands: Vec<Vec<String>>,
}

impl Settings {
    /// Parses the process arguments and the configuration file they name.
    pub fn load() -> Result<Self> {
        let args = CliArgs::parse();
        let file = match &args.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => FileConfig::default(),
        };
        Ok(Self::merge(args, file))
    }

    fn merge(args: CliArgs, file: FileConfig) -> Self {
        let mut client = file.client;
        if let Some(host) = args.host {
            client.host = host;
        }
        if let Some(port) = args.port {
            client.port = port;
        }
        if let Some(connections) = args.connections {
            client.connections = connections;
        }
        Settings {
            client,
            mode: args.mode.or(file.mode).unwrap_or_default(),
            log_level: args
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
            commands: split_commands(&args.words),
        }
    }
}

/// Splits shell words into commands at `;`, which may stand alone or be
/// glued to a word (`GET k;`).
pub fn split_commands(words: &[String]) -> Vec<Vec<String>> {
    let mut commands = vec![Vec::new()];
    for word in words {
        for (idx, part) in word.split(';').enumerate() {
            if idx > 0 {
                commands.push(Vec::new());
            }
            if part.is_empty() {
                continue;
            }
            if let Some(current) = commands.last_mut() {
                current.push(part.to_string());
            }
        }
    }
    commands.retain(|command| !command.is_empty());
    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn splits_on_separate_and_glued_semicolons() {
        let commands = split_commands(&words("SET k 1 ; INCR k; GET k ;"));
        assert_eq!(
            commands,
            vec![words("SET k 1"), words("INCR k"), words("GET k")]
        );
    }

    #[test]
    fn flags_override_file() {
        let args = CliArgs::parse_from(["muxkv", "--port", "7000", "--mode", "pool", "PING"]);
        let file: FileConfig = serde_json::from_str(
            r#"{"client": {"host": "10.0.0.1", "port": 6380, "connections": 4}, "mode": "synced"}"#,
        )
        .unwrap();
        let settings = Settings::merge(args, file);
        assert_eq!(settings.client.host, "10.0.0.1");
        assert_eq!(settings.client.port, 7000);
        assert_eq!(settings.client.connections, 4);
        assert_eq!(settings.mode, Mode::Pool);
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.commands, vec![words("PING")]);
    }
}
