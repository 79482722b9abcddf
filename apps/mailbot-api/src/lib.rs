pub mod routes;
pub mod state;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

#[derive(Debug, Parser)]
#[command(
	version = mailbot_cli::VERSION,
	rename_all = "kebab",
	styles = mailbot_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = mailbot_config::load(&args.config)?;

	init_tracing(&config);

	let http_addr: SocketAddr = config.service.http_bind.parse()?;
	let poll_on_start = config.service.poll_on_start;
	let state = AppState::new(config).await?;
	let app = routes::router(state.clone());
	let (stop_tx, mut stop_rx) = watch::channel(false);
	let poller = poll_on_start.then(|| {
		let orchestrator = Arc::clone(&state.bot.orchestrator);

		tokio::spawn(orchestrator.run(async move {
			let _ = stop_rx.changed().await;
		}))
	});
	let listener = TcpListener::bind(http_addr).await?;

	tracing::info!(%http_addr, poll_on_start, "HTTP server listening.");

	axum::serve(listener, app)
		.with_graceful_shutdown(async move {
			shutdown_signal().await;

			let _ = stop_tx.send(true);
		})
		.await?;

	if let Some(poller) = poller {
		poller.await?;
	}

	tracing::info!("HTTP server stopped.");

	Ok(())
}

fn init_tracing(config: &mailbot_config::Config) {
	let filter =
		EnvFilter::try_new(&config.service.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
	if let Err(err) = tokio::signal::ctrl_c().await {
		tracing::error!(error = %err, "Failed to listen for the shutdown signal.");
	}

	tracing::info!("Shutdown requested.");
}
