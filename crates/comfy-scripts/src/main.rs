use anyhow::Context;
use clap::Parser;
use tracing::{metadata::LevelFilter, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod cli;
mod commands;
mod config;

use cli::Cli;
use commands::Environment;
use config::Config;

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    let dotenv = dotenvy::dotenv();

    if let Err(e) = init_logging() {
        eprintln!("{:#}", e);
        std::process::exit(1);
    }

    if let Err(e) = dotenv {
        if !e.not_found() {
            warn!(error = %e, "failed to load .env");
        }
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging() -> anyhow::Result<()> {
    tracing_log::env_logger::init();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env()
        .context("Failed to parse filter from env")?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.global.config.as_deref())?;
    let url = config::server_url(
        &config.url,
        cli.global.url.as_deref(),
        cli.global.host.as_deref(),
        cli.global.port,
    )?;
    let env = Environment::new(config, url);
    commands::exec(&env, cli.command).await
}
