//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Event Gateway - file, webhook and timer signals as one event stream
#[derive(Parser, Debug)]
#[command(name = "event-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "EVENT_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "EVENT_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "EVENT_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "EVENT_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "EVENT_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Validate every entry of an event source resource file
    Validate {
        /// Path to the resource YAML file
        #[arg(required = true)]
        file: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_serve() {
        let cli = Cli::try_parse_from(["event-gateway"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_validate_subcommand() {
        let cli = Cli::try_parse_from(["event-gateway", "--log-level", "debug", "validate", "sources.yaml"])
            .unwrap();
        match cli.command {
            Some(Command::Validate { file }) => assert_eq!(file, PathBuf::from("sources.yaml")),
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_port_override() {
        let cli = Cli::try_parse_from(["event-gateway", "--port", "4000", "serve"]).unwrap();
        assert_eq!(cli.port, Some(4000));
        assert!(matches!(cli.command, Some(Command::Serve)));
    }
}
