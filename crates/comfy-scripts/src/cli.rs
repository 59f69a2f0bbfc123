use std::path::PathBuf;

use clap::{Args, Parser};

use crate::commands::Command;

/// Drive a ComfyUI server from the command line.
#[derive(Parser, Debug)]
#[command(name = "comfy", version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Default)]
pub struct GlobalOpts {
    /// Config file to read instead of ./comfy-scripts.toml
    #[arg(global = true, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// ComfyUI server URL, overrides the configured one
    #[arg(global = true, long)]
    pub url: Option<String>,

    /// ComfyUI host, replaces the host of the configured URL
    #[arg(global = true, long)]
    pub host: Option<String>,

    /// ComfyUI port, replaces the port of the configured URL
    #[arg(global = true, long)]
    pub port: Option<u16>,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["comfy", "stats", "--port", "8189"]).unwrap();
        assert_eq!(cli.global.port, Some(8189));
        assert!(matches!(cli.command, Command::Stats(_)));
    }

    #[test]
    fn test_batch_requires_prompt_or_file() {
        assert!(Cli::try_parse_from(["comfy", "batch"]).is_err());
        assert!(Cli::try_parse_from(["comfy", "batch", "-p", "a", "-f", "b.txt"]).is_err());
        assert!(Cli::try_parse_from(["comfy", "batch", "-p", "sunset", "-r", "portrait-hd"]).is_ok());
    }
}
