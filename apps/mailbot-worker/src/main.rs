use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = mailbot_worker::Args::parse();

	mailbot_worker::run(args).await
}
