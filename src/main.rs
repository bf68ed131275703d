use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use openworld::app::App;
use openworld::config::AppConfig;

#[derive(Parser)]
#[command(name = "openworld", version, about = "Traffic-inspecting Shadowsocks-style proxy core")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the YAML config document.
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the config, start every enabled proxy, and run until Ctrl-C.
    Run,
    /// Load and validate the config without starting anything.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => cmd_run(&cli.config).await,
        Commands::Check => cmd_check(&cli.config),
    }
}

async fn cmd_run(config_path: &PathBuf) -> Result<()> {
    openworld::logging::init();

    let config = AppConfig::load(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    tracing::info!(path = %config_path.display(), "config loaded");

    let app = App::new(config).await;
    app.start_enabled_proxies()
        .await
        .context("failed to start one or more configured proxies")?;
    tracing::info!(proxies = ?app.list_proxies().await, "all enabled proxies started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to install ctrl-c handler")?;
    tracing::info!("shutdown signal received, stopping proxies");
    app.stop_all_proxies().await;
    Ok(())
}

fn cmd_check(config_path: &PathBuf) -> Result<()> {
    let config = AppConfig::load(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    println!("config '{}' is valid", config_path.display());
    println!("  proxies: {}", config.proxies.len());
    for proxy in &config.proxies {
        println!(
            "    - {} @ {} (enabled={})",
            proxy.id, proxy.listen_addr, proxy.enabled
        );
    }
    Ok(())
}
