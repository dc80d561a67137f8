//! Remote vector index: the authoritative roster.
//!
//! [`RemoteIndex`] is the seam; [`HttpRemoteIndex`] talks to a
//! Pinecone-compatible REST endpoint.

use crate::types::{Metadata, EMBEDDING_DIM};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Largest result set the remote returns for a single query.
pub const REMOTE_MAX_TOP_K: usize = 10_000;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("invalid response: {0}")]
    Decode(String),
}

/// One query hit.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoteMatch {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

/// A full stored vector, as returned when pulling the whole index.
#[derive(Debug, Clone)]
pub struct RemoteVector {
    pub id: String,
    pub values: Vec<f32>,
    pub metadata: Metadata,
}

/// Everything the remote returned in one bulk pull, alongside the count it
/// claims to hold. The two can disagree when the index outgrows one page.
#[derive(Debug, Clone)]
pub struct RemoteSnapshot {
    pub vectors: Vec<RemoteVector>,
    pub reported_total: usize,
}

#[async_trait]
pub trait RemoteIndex: Send + Sync {
    /// Nearest neighbours of `vector`, best first.
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        include_metadata: bool,
    ) -> Result<Vec<RemoteMatch>, RemoteError>;

    async fn upsert(&self, id: &str, vector: &[f32], metadata: &Metadata) -> Result<(), RemoteError>;

    /// Pull up to `limit` stored vectors with values and metadata.
    async fn fetch_all(&self, limit: usize) -> Result<RemoteSnapshot, RemoteError>;
}

/// Connection settings for [`HttpRemoteIndex`].
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5080".to_string(),
            api_key: None,
            timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    vector: &'a [f32],
    top_k: usize,
    include_metadata: bool,
    include_values: bool,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<WireMatch>,
}

#[derive(Deserialize)]
struct WireMatch {
    id: String,
    #[serde(default)]
    score: f32,
    #[serde(default)]
    values: Vec<f32>,
    #[serde(default)]
    metadata: Option<Metadata>,
}

#[derive(Serialize)]
struct UpsertRequest<'a> {
    vectors: [WireVector<'a>; 1],
}

#[derive(Serialize)]
struct WireVector<'a> {
    id: &'a str,
    values: &'a [f32],
    metadata: &'a Metadata,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatsResponse {
    #[serde(default)]
    total_vector_count: usize,
}

/// Pinecone-compatible REST client.
pub struct HttpRemoteIndex {
    client: reqwest::Client,
    config: RemoteConfig,
}

impl HttpRemoteIndex {
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .pool_max_idle_per_host(4)
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn post<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, RemoteError> {
        let mut request = self.client.post(self.endpoint(path)).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.header("Api-Key", key);
        }

        let response = request.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response.bytes().await.map_err(|e| self.classify(e))?;
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    fn classify(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout(self.config.timeout)
        } else {
            RemoteError::Http(err)
        }
    }
}

#[async_trait]
impl RemoteIndex for HttpRemoteIndex {
    async fn query(
        &self,
        vector: &[f32],
        top_k: usize,
        include_metadata: bool,
    ) -> Result<Vec<RemoteMatch>, RemoteError> {
        let body = QueryRequest {
            vector,
            top_k,
            include_metadata,
            include_values: false,
        };
        let response: QueryResponse = self.post("query", &body).await?;
        Ok(response
            .matches
            .into_iter()
            .map(|m| RemoteMatch {
                id: m.id,
                score: m.score,
                metadata: m.metadata,
            })
            .collect())
    }

    async fn upsert(&self, id: &str, vector: &[f32], metadata: &Metadata) -> Result<(), RemoteError> {
        let body = UpsertRequest {
            vectors: [WireVector {
                id,
                values: vector,
                metadata,
            }],
        };
        let _: serde_json::Value = self.post("vectors/upsert", &body).await?;
        tracing::debug!(id, "upserted vector to remote index");
        Ok(())
    }

    async fn fetch_all(&self, limit: usize) -> Result<RemoteSnapshot, RemoteError> {
        let stats: StatsResponse = self
            .post("describe_index_stats", &serde_json::json!({}))
            .await?;

        // A zero vector scores every entry equally, so a maximal top_k pulls
        // the whole index in one page.
        let zeros = vec![0.0f32; EMBEDDING_DIM];
        let body = QueryRequest {
            vector: &zeros,
            top_k: limit.min(REMOTE_MAX_TOP_K),
            include_metadata: true,
            include_values: true,
        };
        let response: QueryResponse = self.post("query", &body).await?;

        let vectors = response
            .matches
            .into_iter()
            .map(|m| RemoteVector {
                id: m.id,
                values: m.values,
                metadata: m.metadata.unwrap_or_default(),
            })
            .collect();

        Ok(RemoteSnapshot {
            vectors,
            reported_total: stats.total_vector_count,
        })
    }
}
