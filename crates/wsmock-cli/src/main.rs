//! # wsmock
//!
//! Runs a single mock WebSocket server until Ctrl-C, for poking at clients
//! by hand.

#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use wsmock_core::{Matcher, MessageFrame, Responder};
use wsmock_server::{MockServer, MockServerConfig};

/// Mock WebSocket server.
#[derive(Parser, Debug)]
#[command(name = "wsmock", about = "Mock WebSocket server for client testing")]
struct Cli {
    /// Host to bind (overrides `WSMOCK_HOST`).
    #[arg(long)]
    host: Option<String>,

    /// First candidate port (overrides `WSMOCK_PORT_RANGE_START`).
    #[arg(long)]
    port_start: Option<u16>,

    /// Last candidate port (overrides `WSMOCK_PORT_RANGE_END`).
    #[arg(long)]
    port_end: Option<u16>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Echo every received frame back to its sender.
    #[arg(long)]
    echo: bool,
}

impl Cli {
    /// Environment config with command-line flags layered on top.
    fn config(&self) -> Result<MockServerConfig> {
        let mut config = MockServerConfig::from_env();
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(start) = self.port_start {
            config.port_range_start = start;
        }
        if let Some(end) = self.port_end {
            config.port_range_end = end;
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    wsmock_core::logging::init_subscriber(&args.log_level);

    let config = args.config()?;
    let server = MockServer::start_with(config)
        .await
        .context("Failed to start mock server")?;

    if args.echo {
        server.reply_with(
            Matcher::predicate(|_: &MessageFrame| true),
            Responder::transform(MessageFrame::clone),
        );
        tracing::info!("echo mode enabled");
    }

    println!("{}", server.url());
    tracing::info!(url = server.url(), "wsmock ready, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.stop().await;
    Ok(())
}
