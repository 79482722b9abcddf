use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::eyre;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use mailbot_domain::SourceDocument;
use mailbot_service::{IngestReport, Mailbot};

#[derive(Debug, Parser)]
#[command(
	version = mailbot_cli::VERSION,
	rename_all = "kebab",
	styles = mailbot_cli::styles(),
)]
pub struct Args {
	#[arg(long, short = 'c', value_name = "FILE")]
	pub config: PathBuf,
	#[command(subcommand)]
	pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
	/// Index knowledge files. `.json` files hold an array of `{id, text, metadata}` documents;
	/// any other file is indexed as one plain-text document keyed by its path.
	Files {
		#[arg(required = true, value_name = "PATH")]
		paths: Vec<PathBuf>,
	},
	/// Index the mailbox history as knowledge.
	Mailbox {
		/// Only the newest messages.
		#[arg(long, value_name = "COUNT")]
		limit: Option<usize>,
	},
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	let config = mailbot_config::load(&args.config)?;
	let filter =
		EnvFilter::try_new(&config.service.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

	let bot = Mailbot::from_config(config).await?;
	let report = match args.command {
		Command::Files { paths } => {
			let mut documents = Vec::new();

			for path in &paths {
				documents.extend(read_documents(path).await?);
			}

			bot.ingestor.ingest(&documents).await
		},
		Command::Mailbox { limit } =>
			bot.ingestor.backfill_mailbox(bot.mailbox.as_ref(), limit).await?,
	};

	println!("{}", serde_json::to_string_pretty(&report)?);

	for failure in &report.failures {
		tracing::error!(
			document_id = %failure.document_id,
			chunk_id = ?failure.chunk_id,
			stage = ?failure.stage,
			error = %failure.error,
			"Ingestion failure."
		);
	}

	if !report.failures.is_empty() {
		return Err(failed(&report));
	}

	Ok(())
}

pub async fn read_documents(path: &Path) -> color_eyre::Result<Vec<SourceDocument>> {
	let raw = tokio::fs::read_to_string(path).await?;

	if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("json")) {
		return Ok(serde_json::from_str(&raw)?);
	}

	let id = path.to_string_lossy().into_owned();
	let mut metadata = Map::new();

	metadata.insert("source".to_string(), Value::String(id.clone()));

	Ok(vec![SourceDocument { id, text: raw, metadata }])
}

fn failed(report: &IngestReport) -> eyre::Report {
	eyre::eyre!(
		"Ingestion recorded {} failures across {} chunks.",
		report.failures.len(),
		report.chunks
	)
}
