//! blechat - two-party chat over Bluetooth Low Energy

use std::time::Duration;

use anyhow::Context;
use blechat_core::session::{FilterMode, ScanMode};
use clap::Parser;
use tokio::io::BufReader;
use tracing::info;

use blechat_cli::{
    app::ChatApp,
    cli::{Cli, Commands},
    config::AppConfig,
};

/// Slack on top of the scan window before `scan` gives up waiting
const SCAN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let mut config =
        AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(index) = cli.adapter {
        config.ble.adapter_index = index;
    }

    match cli.command {
        Commands::Chat { payload } => {
            if let Some(payload) = payload {
                config.chat.advertising_payload = payload;
            }
            config.validate()?;
            let app = ChatApp::launch(&config)
                .await
                .context("Failed to start the radio")?;
            let stdin = BufReader::new(tokio::io::stdin());
            app.run_chat(stdin, &mut std::io::stdout()).await?;
        }
        Commands::Scan { json, all } => {
            if all {
                config.chat.filter_mode = FilterMode::Unfiltered;
                config.session.rssi_filter_enabled = false;
            }
            config.chat.scan_mode = ScanMode::Interval;
            config.chat.scan_on_start = true;
            let limit = config.session.scan_window + SCAN_GRACE;
            let app = ChatApp::launch(&config)
                .await
                .context("Failed to start the radio")?;
            let peers = app.scan_once(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&peers)?);
            } else {
                print!("{}", blechat_cli::display::peers(&peers));
            }
        }
        Commands::Config { save } => {
            print!("{}", config.to_toml()?);
            if save {
                let path = match &cli.config {
                    Some(path) => path.clone(),
                    None => AppConfig::default_config_path()
                        .context("No configuration directory on this system")?,
                };
                config.save_to_file(&path)?;
                info!("Configuration saved to {}", path.display());
            }
        }
    }

    info!("blechat exited");
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        // stdout carries the chat and `scan --json`
        .with_writer(std::io::stderr)
        .init();
}
