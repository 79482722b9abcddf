use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mailbot_service::Mailbot;

#[derive(Debug, Parser)]
#[command(
	version = mailbot_cli::VERSION,
	rename_all = "kebab",
	styles = mailbot_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	/// Process the unseen mail once, print the batch report and exit.
	#[arg(long)]
	pub once: bool,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = mailbot_config::load(&args.config)?;
	let filter =
		EnvFilter::try_new(&config.service.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt().with_env_filter(filter).init();

	let bot = Mailbot::from_config(config).await?;
	let orchestrator = Arc::clone(&bot.orchestrator);

	if args.once {
		let report = orchestrator.poll_once().await?;

		println!("{}", serde_json::to_string_pretty(&report)?);

		return Ok(());
	}

	orchestrator
		.run(async {
			if let Err(err) = tokio::signal::ctrl_c().await {
				tracing::error!(error = %err, "Failed to listen for the shutdown signal.");
			}

			tracing::info!("Shutdown requested.");
		})
		.await;

	Ok(())
}
