use clap::Parser;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
	color_eyre::install()?;

	let args = mailbot_api::Args::parse();

	mailbot_api::run(args).await
}
