use std::collections::HashMap;

use qdrant_client::{
	Payload, Qdrant, QdrantError,
	qdrant::{
		Condition, CreateCollectionBuilder, DeletePointsBuilder, Distance, Filter, PointStruct,
		Query, QueryPointsBuilder, Range, ScoredPoint, UpsertPointsBuilder, Value as QdrantValue,
		VectorParamsBuilder, point_id::PointIdOptions, value::Kind, vectors_config,
		vectors_output::VectorsOptions,
	},
};
use serde_json::{Map, Number, Value};
use uuid::Uuid;

use mailbot_domain::{
	BoxFuture, DocumentChunk, RetrievalResult, RetrievedChunk, VectorStore, VectorStoreError,
	model::METADATA_CHUNK_INDEX,
};

// gRPC status codes.
const GRPC_DEADLINE_EXCEEDED: i32 = 4;
const GRPC_RESOURCE_EXHAUSTED: i32 = 8;
const GRPC_UNAVAILABLE: i32 = 14;

const PAYLOAD_DOCUMENT_ID: &str = "document_id";
const PAYLOAD_TEXT: &str = "text";
const PAYLOAD_METADATA: &str = "metadata";

pub struct QdrantStore {
	client: Qdrant,
	collection: String,
	dimensions: u32,
}
impl QdrantStore {
	/// Connects and creates the collection when it does not exist yet.
	///
	/// An existing collection must hold a single unnamed vector of `dimensions` values.
	pub async fn connect(
		cfg: &mailbot_config::Qdrant,
		dimensions: u32,
		metric: &str,
	) -> Result<Self, VectorStoreError> {
		let client = Qdrant::from_url(&cfg.url).build().map_err(qdrant_error)?;
		let exists =
			client.collection_exists(cfg.collection.as_str()).await.map_err(qdrant_error)?;

		if !exists {
			tracing::info!(collection = %cfg.collection, dimensions, "Creating Qdrant collection.");

			let params = VectorParamsBuilder::new(u64::from(dimensions), distance(metric));

			client
				.create_collection(
					CreateCollectionBuilder::new(cfg.collection.clone()).vectors_config(params),
				)
				.await
				.map_err(qdrant_error)?;
		} else {
			let size = collection_vector_size(&client, &cfg.collection).await?;

			if size != u64::from(dimensions) {
				return Err(VectorStoreError::DimensionMismatch {
					expected: dimensions,
					actual: size as usize,
				});
			}
		}

		Ok(Self { client, collection: cfg.collection.clone(), dimensions })
	}

	async fn upsert_chunks(&self, chunks: &[DocumentChunk]) -> Result<(), VectorStoreError> {
		if chunks.is_empty() {
			return Ok(());
		}

		let mut points = Vec::with_capacity(chunks.len());

		for chunk in chunks {
			VectorStoreError::check_dimensions(&chunk.embedding, self.dimensions)?;

			let mut payload = HashMap::new();

			payload.insert(
				PAYLOAD_DOCUMENT_ID.to_string(),
				QdrantValue::from(Value::String(chunk.document_id.clone())),
			);
			payload.insert(
				PAYLOAD_TEXT.to_string(),
				QdrantValue::from(Value::String(chunk.text.clone())),
			);
			payload.insert(
				PAYLOAD_METADATA.to_string(),
				QdrantValue::from(Value::Object(chunk.metadata.clone())),
			);
			points.push(PointStruct::new(
				chunk.chunk_id.to_string(),
				chunk.embedding.clone(),
				Payload::from(payload),
			));
		}

		self.client
			.upsert_points(UpsertPointsBuilder::new(self.collection.clone(), points).wait(true))
			.await
			.map_err(qdrant_error)?;

		Ok(())
	}

	async fn prune_chunks(&self, document_id: &str, keep: u32) -> Result<(), VectorStoreError> {
		let filter = Filter::must([
			Condition::matches(PAYLOAD_DOCUMENT_ID, document_id.to_string()),
			Condition::range(
				format!("{PAYLOAD_METADATA}.{METADATA_CHUNK_INDEX}"),
				Range { gte: Some(f64::from(keep)), ..Default::default() },
			),
		]);

		let request = DeletePointsBuilder::new(self.collection.clone()).points(filter).wait(true);

		self.client.delete_points(request).await.map_err(qdrant_error)?;

		Ok(())
	}

	async fn query_chunks(
		&self,
		vector: &[f32],
		top_k: u32,
	) -> Result<RetrievalResult, VectorStoreError> {
		if top_k == 0 {
			return Err(VectorStoreError::InvalidTopK);
		}

		VectorStoreError::check_dimensions(vector, self.dimensions)?;

		let response = self
			.client
			.query(
				QueryPointsBuilder::new(self.collection.clone())
					.query(Query::new_nearest(vector.to_vec()))
					.limit(u64::from(top_k))
					.with_payload(true)
					.with_vectors(true),
			)
			.await
			.map_err(qdrant_error)?;
		let mut matches = Vec::with_capacity(response.result.len());

		for point in response.result {
			matches.push(retrieved_chunk(point)?);
		}

		Ok(RetrievalResult::new(matches))
	}
}
impl VectorStore for QdrantStore {
	fn dimensions(&self) -> u32 {
		self.dimensions
	}

	fn upsert<'a>(
		&'a self,
		chunks: &'a [DocumentChunk],
	) -> BoxFuture<'a, Result<(), VectorStoreError>> {
		Box::pin(self.upsert_chunks(chunks))
	}

	fn prune<'a>(
		&'a self,
		document_id: &'a str,
		keep: u32,
	) -> BoxFuture<'a, Result<(), VectorStoreError>> {
		Box::pin(self.prune_chunks(document_id, keep))
	}

	fn query<'a>(
		&'a self,
		vector: &'a [f32],
		top_k: u32,
	) -> BoxFuture<'a, Result<RetrievalResult, VectorStoreError>> {
		Box::pin(self.query_chunks(vector, top_k))
	}
}

fn distance(metric: &str) -> Distance {
	match metric {
		"dotproduct" => Distance::Dot,
		"euclidean" => Distance::Euclid,
		_ => Distance::Cosine,
	}
}

async fn collection_vector_size(
	client: &Qdrant,
	collection: &str,
) -> Result<u64, VectorStoreError> {
	let info = client.collection_info(collection).await.map_err(qdrant_error)?;
	let config = info
		.result
		.and_then(|info| info.config)
		.and_then(|config| config.params)
		.and_then(|params| params.vectors_config)
		.and_then(|vectors| vectors.config);

	match config {
		Some(vectors_config::Config::Params(params)) => Ok(params.size),
		Some(vectors_config::Config::ParamsMap(_)) => Err(VectorStoreError::Rejected {
			message: format!("Qdrant collection {collection:?} uses named vectors."),
		}),
		None => Err(VectorStoreError::MalformedResponse {
			message: format!("Qdrant collection {collection:?} reports no vector parameters."),
		}),
	}
}

fn qdrant_error(err: QdrantError) -> VectorStoreError {
	match err {
		QdrantError::ResponseError { status } =>
			status_error(status.code() as i32, status.message()),
		QdrantError::ResourceExhaustedError { .. } =>
			VectorStoreError::Unavailable { message: err.to_string() },
		QdrantError::ConversionError(_)
		| QdrantError::InvalidUri(_)
		| QdrantError::NoSnapshotFound(_) =>
			VectorStoreError::Rejected { message: err.to_string() },
		other => VectorStoreError::Unavailable { message: other.to_string() },
	}
}

fn status_error(code: i32, message: &str) -> VectorStoreError {
	match code {
		GRPC_DEADLINE_EXCEEDED | GRPC_RESOURCE_EXHAUSTED | GRPC_UNAVAILABLE =>
			VectorStoreError::Unavailable { message: message.to_string() },
		_ => dimension_error(message)
			.unwrap_or_else(|| VectorStoreError::Rejected { message: message.to_string() }),
	}
}

/// Parses Qdrant's `expected dim: N, got M` rejection.
fn dimension_error(message: &str) -> Option<VectorStoreError> {
	let (_, rest) = message.split_once("expected dim:")?;
	let (expected, rest) = rest.split_once(',')?;
	let (_, actual) = rest.split_once("got")?;
	let actual: String = actual.trim().chars().take_while(char::is_ascii_digit).collect();

	Some(VectorStoreError::DimensionMismatch {
		expected: expected.trim().parse().ok()?,
		actual: actual.parse().ok()?,
	})
}

#[allow(deprecated)]
fn retrieved_chunk(point: ScoredPoint) -> Result<RetrievedChunk, VectorStoreError> {
	let chunk_id = match point.id.and_then(|id| id.point_id_options) {
		Some(PointIdOptions::Uuid(raw)) =>
			Uuid::parse_str(&raw).map_err(|_| VectorStoreError::MalformedResponse {
				message: format!("Point id {raw:?} is not a UUID."),
			})?,
		_ => {
			return Err(VectorStoreError::MalformedResponse {
				message: "Point id is missing or numeric.".to_string(),
			});
		},
	};
	let embedding = match point.vectors.and_then(|vectors| vectors.vectors_options) {
		Some(VectorsOptions::Vector(vector)) => vector.data,
		_ => Vec::new(),
	};
	let mut payload = point.payload;
	let document_id = match payload.remove(PAYLOAD_DOCUMENT_ID).map(json_from_qdrant) {
		Some(Value::String(value)) => value,
		_ => String::new(),
	};
	let text = match payload.remove(PAYLOAD_TEXT).map(json_from_qdrant) {
		Some(Value::String(value)) => value,
		_ => String::new(),
	};
	let metadata = match payload.remove(PAYLOAD_METADATA).map(json_from_qdrant) {
		Some(Value::Object(metadata)) => metadata,
		_ => Map::new(),
	};

	Ok(RetrievedChunk {
		chunk: DocumentChunk { chunk_id, document_id, text, embedding, metadata },
		score: point.score,
	})
}

fn json_from_qdrant(value: QdrantValue) -> Value {
	match value.kind {
		Some(Kind::BoolValue(value)) => Value::Bool(value),
		Some(Kind::IntegerValue(value)) => Value::Number(Number::from(value)),
		Some(Kind::DoubleValue(value)) =>
			Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null),
		Some(Kind::StringValue(value)) => Value::String(value),
		Some(Kind::ListValue(list)) =>
			Value::Array(list.values.into_iter().map(json_from_qdrant).collect()),
		Some(Kind::StructValue(object)) => Value::Object(
			object.fields.into_iter().map(|(key, value)| (key, json_from_qdrant(value))).collect(),
		),
		Some(Kind::NullValue(_)) | None => Value::Null,
	}
}
