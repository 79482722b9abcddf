use std::sync::Arc;

use mailbot_domain::{
	Embedder, EmbeddingVector, InboundMessage, RetrievalError, RetrievalResult, VectorStore,
};

/// Embeds the text of a message and looks up its nearest knowledge chunks.
pub struct Retriever {
	embedder: Arc<dyn Embedder>,
	store: Arc<dyn VectorStore>,
	subject_weight: f32,
}
impl Retriever {
	pub fn new(
		embedder: Arc<dyn Embedder>,
		store: Arc<dyn VectorStore>,
		subject_weight: f32,
	) -> Self {
		Self { embedder, store, subject_weight: subject_weight.clamp(0.0, 1.0) }
	}

	/// Matches come back in the order the vector index ranked them.
	pub async fn retrieve(
		&self,
		message: &InboundMessage,
		top_k: u32,
	) -> Result<RetrievalResult, RetrievalError> {
		let body = message.body.trim();
		let subject = message.subject.trim();
		let vector = match (body.is_empty(), subject.is_empty()) {
			(true, true) => return Err(RetrievalError::EmptyQuery),
			(true, false) => self.embed(subject).await?,
			(false, true) => self.embed(body).await?,
			(false, false) if self.subject_weight > 0.0 => {
				let subject_vec = self.embed(subject).await?;
				let body_vec = self.embed(body).await?;

				blend(&subject_vec, &body_vec, self.subject_weight)
			},
			(false, false) => self.embed(body).await?,
		};

		Ok(self.store.query(&vector, top_k).await?)
	}

	async fn embed(&self, text: &str) -> Result<EmbeddingVector, RetrievalError> {
		Ok(self.embedder.embed(text).await?)
	}
}

fn blend(subject: &[f32], body: &[f32], weight: f32) -> EmbeddingVector {
	subject.iter().zip(body).map(|(s, b)| weight * s + (1.0 - weight) * b).collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn blend_weights_both_sides() {
		let out = blend(&[1.0, 0.0], &[0.0, 1.0], 0.25);

		assert_eq!(out, vec![0.25, 0.75]);
	}
}
