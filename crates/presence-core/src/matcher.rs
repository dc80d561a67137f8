//! Two-tier identity lookup: local cache first, remote index on a miss.
//!
//! A cache hit is trusted without asking the remote. Staleness is tolerated
//! because nothing acts on a single frame's match; the verification
//! aggregator needs several corroborating frames first.

use crate::cache::LocalSimilarityCache;
use crate::remote::RemoteIndex;
use crate::types::{Embedding, MatchResult, MatchSource};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Minimum cosine similarity for a match, in either tier.
    pub threshold: f32,
    /// Upper bound on one remote query.
    pub remote_timeout: Duration,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            threshold: 0.55,
            remote_timeout: Duration::from_secs(3),
        }
    }
}

pub struct CandidateMatcher {
    cache: Arc<LocalSimilarityCache>,
    remote: Option<Arc<dyn RemoteIndex>>,
    config: MatcherConfig,
}

impl CandidateMatcher {
    /// `remote` may be `None`, in which case a cache miss is final.
    pub fn new(
        cache: Arc<LocalSimilarityCache>,
        remote: Option<Arc<dyn RemoteIndex>>,
        config: MatcherConfig,
    ) -> Self {
        Self {
            cache,
            remote,
            config,
        }
    }

    pub fn threshold(&self) -> f32 {
        self.config.threshold
    }

    /// Resolve one embedding. Never fails: remote errors and timeouts come
    /// back as `source = Error` with no identity.
    pub async fn match_embedding(&self, embedding: &Embedding) -> MatchResult {
        if let Some(hit) = self
            .cache
            .search(embedding, 1, self.config.threshold)
            .into_iter()
            .next()
        {
            tracing::debug!(identity = %hit.identity, score = hit.score, "cache hit");
            return MatchResult {
                identity: Some(hit.identity),
                score: hit.score,
                source: MatchSource::Cache,
                metadata: Some(hit.metadata),
            };
        }

        let Some(remote) = &self.remote else {
            return MatchResult::unknown(MatchSource::None, 0.0);
        };

        let query = remote.query(embedding.values(), 1, true);
        let matches = match tokio::time::timeout(self.config.remote_timeout, query).await {
            Ok(Ok(matches)) => matches,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "remote lookup failed; treating as no match");
                return MatchResult::unknown(MatchSource::Error, 0.0);
            }
            Err(_) => {
                tracing::warn!(
                    timeout = ?self.config.remote_timeout,
                    "remote lookup timed out; treating as no match"
                );
                return MatchResult::unknown(MatchSource::Error, 0.0);
            }
        };

        match matches.into_iter().next() {
            Some(best) if best.score >= self.config.threshold => {
                tracing::debug!(identity = %best.id, score = best.score, "remote hit");
                MatchResult {
                    identity: Some(best.id),
                    score: best.score,
                    source: MatchSource::Remote,
                    metadata: best.metadata,
                }
            }
            Some(best) => MatchResult::unknown(MatchSource::None, best.score),
            None => MatchResult::unknown(MatchSource::None, 0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::{emb, meta};
    use crate::remote::{RemoteError, RemoteMatch, RemoteSnapshot};
    use crate::types::{unit_vector, vector_at, Metadata};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behaviour {
        Answer(Vec<RemoteMatch>),
        Fail,
        Hang,
    }

    struct ScriptedRemote {
        behaviour: Behaviour,
        queries: AtomicUsize,
    }

    impl ScriptedRemote {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                queries: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RemoteIndex for ScriptedRemote {
        async fn query(&self, _: &[f32], _: usize, _: bool) -> Result<Vec<RemoteMatch>, RemoteError> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            match &self.behaviour {
                Behaviour::Answer(m) => Ok(m.clone()),
                Behaviour::Fail => Err(RemoteError::Status {
                    status: 503,
                    message: "unavailable".into(),
                }),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Vec::new())
                }
            }
        }

        async fn upsert(&self, _: &str, _: &[f32], _: &Metadata) -> Result<(), RemoteError> {
            Ok(())
        }

        async fn fetch_all(&self, _: usize) -> Result<RemoteSnapshot, RemoteError> {
            Ok(RemoteSnapshot {
                vectors: Vec::new(),
                reported_total: 0,
            })
        }
    }

    fn matcher(
        dir: &tempfile::TempDir,
        remote: Option<Arc<ScriptedRemote>>,
    ) -> (CandidateMatcher, Arc<LocalSimilarityCache>) {
        let cache = Arc::new(LocalSimilarityCache::load(dir.path().join("cache.json")));
        let config = MatcherConfig {
            threshold: 0.55,
            remote_timeout: Duration::from_millis(100),
        };
        let remote = remote.map(|r| r as Arc<dyn RemoteIndex>);
        (CandidateMatcher::new(Arc::clone(&cache), remote, config), cache)
    }

    #[tokio::test]
    async fn test_empty_cache_falls_back_to_remote() {
        let dir = tempfile::tempdir().unwrap();
        let remote = ScriptedRemote::new(Behaviour::Answer(vec![RemoteMatch {
            id: "42".into(),
            score: 0.72,
            metadata: Some(meta("student")),
        }]));
        let (matcher, _) = matcher(&dir, Some(Arc::clone(&remote)));

        let result = matcher.match_embedding(&emb(vector_at(0.72, 3))).await;
        assert_eq!(result.identity.as_deref(), Some("42"));
        assert!((result.score - 0.72).abs() < 1e-6);
        assert_eq!(result.source, MatchSource::Remote);
        assert_eq!(remote.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_remote() {
        let dir = tempfile::tempdir().unwrap();
        let remote = ScriptedRemote::new(Behaviour::Fail);
        let (matcher, cache) = matcher(&dir, Some(Arc::clone(&remote)));
        cache.add("7", emb(vector_at(0.61, 8)), meta("student")).unwrap();

        let result = matcher.match_embedding(&emb(unit_vector(0))).await;
        assert_eq!(result.identity.as_deref(), Some("7"));
        assert_eq!(result.source, MatchSource::Cache);
        assert!((result.score - 0.61).abs() < 1e-5);
        assert_eq!(remote.queries.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remote_below_threshold_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let remote = ScriptedRemote::new(Behaviour::Answer(vec![RemoteMatch {
            id: "42".into(),
            score: 0.41,
            metadata: None,
        }]));
        let (matcher, _) = matcher(&dir, Some(remote));

        let result = matcher.match_embedding(&emb(unit_vector(0))).await;
        assert!(!result.is_match());
        assert_eq!(result.source, MatchSource::None);
        assert!((result.score - 0.41).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_cache_below_threshold_consults_remote() {
        let dir = tempfile::tempdir().unwrap();
        let remote = ScriptedRemote::new(Behaviour::Answer(Vec::new()));
        let (matcher, cache) = matcher(&dir, Some(Arc::clone(&remote)));
        cache.add("7", emb(vector_at(0.3, 8)), Metadata::new()).unwrap();

        let result = matcher.match_embedding(&emb(unit_vector(0))).await;
        assert_eq!(result.source, MatchSource::None);
        assert_eq!(remote.queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_error_degrades_to_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let (matcher, _) = matcher(&dir, Some(ScriptedRemote::new(Behaviour::Fail)));
        let result = matcher.match_embedding(&emb(unit_vector(0))).await;
        assert_eq!(result.source, MatchSource::Error);
        assert_eq!(result.label(), "Unknown");
    }

    #[tokio::test]
    async fn test_remote_timeout_degrades_to_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let (matcher, _) = matcher(&dir, Some(ScriptedRemote::new(Behaviour::Hang)));
        let started = std::time::Instant::now();
        let result = matcher.match_embedding(&emb(unit_vector(0))).await;
        assert_eq!(result.source, MatchSource::Error);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_no_remote_configured() {
        let dir = tempfile::tempdir().unwrap();
        let (matcher, _) = matcher(&dir, None);
        let result = matcher.match_embedding(&emb(unit_vector(0))).await;
        assert_eq!(result.source, MatchSource::None);
    }
}
