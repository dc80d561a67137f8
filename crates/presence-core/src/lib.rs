//! presence-core: identity matching for the attendance pipeline.
//!
//! A face embedding is resolved against a local similarity cache first and a
//! remote vector index on a miss; per-frame matches are then debounced into
//! one confirmed mark per person per session.

pub mod cache;
pub mod detector;
pub mod enroll;
pub mod matcher;
pub mod remote;
pub mod types;
pub mod verification;

pub use cache::{CacheError, CacheHit, CacheStats, LocalSimilarityCache};
pub use detector::{Detector, DetectorConfig, DetectorError, HttpDetector};
pub use enroll::{EnrollError, EnrollOutcome, Enroller, MIN_ENROLL_SAMPLES};
pub use matcher::{CandidateMatcher, MatcherConfig};
pub use remote::{HttpRemoteIndex, RemoteConfig, RemoteError, RemoteIndex};
pub use types::{
    BoundingBox, Detection, Embedding, EmbeddingError, MatchResult, MatchSource, Metadata,
    EMBEDDING_DIM,
};
pub use verification::{Verdict, VerificationAggregator, VerificationConfig};
