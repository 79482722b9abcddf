use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = mailbot_ingest::Args::parse();

	mailbot_ingest::run(args).await
}
