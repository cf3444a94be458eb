use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

/// Serialized code execution coordinator: one interpreter, many clients.
#[derive(Parser)]
#[command(version, about, long_about = None, author)]
pub struct Cli {
    /// Path to the configuration file (defaults to <config dir>/execd/config.toml)
    #[arg(long, env = "EXECD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Write logs to a timestamped file in this directory instead of stderr
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Serve the WebSocket gateway
    Serve {
        /// Address to bind (overrides [server].bind)
        #[arg(long, env = "EXECD_BIND")]
        bind: Option<IpAddr>,
        /// Port to listen on (overrides [server].port)
        #[arg(short, long, env = "EXECD_PORT")]
        port: Option<u16>,
    },
    /// Execute one program through the coordinator and stream its output
    Run {
        /// Program file, or '-' to read from stdin
        path: PathBuf,
        /// Run id to use in events and logs
        #[arg(long, default_value = "cli")]
        id: String,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file location
    Path,
}
