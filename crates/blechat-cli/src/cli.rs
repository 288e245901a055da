//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Bluetooth adapter index, overriding the configuration
    #[arg(short, long, global = true)]
    pub adapter: Option<usize>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start interactive chat mode
    Chat {
        /// Advertised payload, overriding the configuration
        #[arg(short, long)]
        payload: Option<String>,
    },
    /// Run one scan window and list the peers found
    Scan {
        /// Print the peers as JSON
        #[arg(long)]
        json: bool,
        /// Report every device, not only blechat peers
        #[arg(long)]
        all: bool,
    },
    /// Print the effective configuration
    Config {
        /// Also write it to the configuration file
        #[arg(long)]
        save: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["blechat", "scan", "--json", "--adapter", "1", "-v"]);
        assert!(cli.verbose);
        assert_eq!(cli.adapter, Some(1));
        assert!(matches!(cli.command, Commands::Scan { json: true, all: false }));
    }

    #[test]
    fn test_chat_payload_override() {
        let cli = Cli::parse_from(["blechat", "--config", "/tmp/b.toml", "chat", "-p", "hey"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/b.toml")));
        assert!(matches!(cli.command, Commands::Chat { payload: Some(ref p) } if p == "hey"));
    }
}
