use std::sync::Arc;

use mailbot_service::Mailbot;

#[derive(Clone)]
pub struct AppState {
	pub bot: Arc<Mailbot>,
}
impl AppState {
	pub async fn new(config: mailbot_config::Config) -> color_eyre::Result<Self> {
		let bot = Mailbot::from_config(config).await?;

		Ok(Self::from_mailbot(bot))
	}

	pub fn from_mailbot(bot: Mailbot) -> Self {
		Self { bot: Arc::new(bot) }
	}
}
