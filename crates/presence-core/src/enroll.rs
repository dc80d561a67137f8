//! Enrollment: fold several face samples into one reference embedding and
//! register it in both tiers.

use crate::cache::LocalSimilarityCache;
use crate::remote::{RemoteError, RemoteIndex};
use crate::types::{Detection, Embedding, Metadata};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// Fewest usable samples an enrollment accepts.
pub const MIN_ENROLL_SAMPLES: usize = 2;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("need at least {required} usable face samples, got {usable}")]
    NotEnoughSamples { usable: usize, required: usize },
    #[error("remote index rejected enrollment: {0}")]
    Remote(#[from] RemoteError),
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollOutcome {
    pub identity: String,
    pub samples_used: usize,
    pub remote_stored: bool,
    pub cache_persisted: bool,
}

pub struct Enroller {
    cache: Arc<LocalSimilarityCache>,
    remote: Option<Arc<dyn RemoteIndex>>,
    min_detection_score: f32,
}

impl Enroller {
    pub fn new(
        cache: Arc<LocalSimilarityCache>,
        remote: Option<Arc<dyn RemoteIndex>>,
        min_detection_score: f32,
    ) -> Self {
        Self {
            cache,
            remote,
            min_detection_score,
        }
    }

    /// Average the confident samples and store the result.
    ///
    /// The remote index is written first; the local cache only learns about
    /// the identity once the remote has accepted it. Metadata without a
    /// `type` key is tagged `"student"`.
    pub async fn enroll(
        &self,
        identity: &str,
        samples: &[Detection],
        mut metadata: Metadata,
    ) -> Result<EnrollOutcome, EnrollError> {
        if identity.trim().is_empty() {
            return Err(EnrollError::EmptyIdentity);
        }

        let usable: Vec<Embedding> = samples
            .iter()
            .filter(|d| d.score >= self.min_detection_score)
            .filter_map(|d| match Embedding::new(d.embedding.clone()) {
                Ok(e) => Some(e),
                Err(err) => {
                    tracing::warn!(identity, error = %err, "discarding enrollment sample");
                    None
                }
            })
            .collect();

        if usable.len() < MIN_ENROLL_SAMPLES {
            return Err(EnrollError::NotEnoughSamples {
                usable: usable.len(),
                required: MIN_ENROLL_SAMPLES,
            });
        }

        let Some(reference) = Embedding::mean(&usable) else {
            return Err(EnrollError::NotEnoughSamples {
                usable: 0,
                required: MIN_ENROLL_SAMPLES,
            });
        };

        metadata
            .entry("type")
            .or_insert_with(|| serde_json::Value::String("student".into()));

        let remote_stored = match &self.remote {
            Some(remote) => {
                remote.upsert(identity, reference.values(), &metadata).await?;
                true
            }
            None => {
                tracing::warn!(identity, "no remote index configured; enrolling locally only");
                false
            }
        };

        let cache_persisted = match self.cache.add(identity, reference, metadata) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(identity, error = %e, "enrolled but cache file not updated");
                false
            }
        };

        tracing::info!(identity, samples = usable.len(), remote_stored, "enrollment complete");
        Ok(EnrollOutcome {
            identity: identity.to_owned(),
            samples_used: usable.len(),
            remote_stored,
            cache_persisted,
        })
    }
}
