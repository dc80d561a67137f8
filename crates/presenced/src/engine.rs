use crate::sink::{AttendanceEvent, AttendanceSink};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use presence_core::{
    CacheError, CandidateMatcher, Detection, Detector, DetectorError, Embedding, EmbeddingError,
    EnrollError, EnrollOutcome, Enroller, LocalSimilarityCache, MatchResult, MatchSource,
    MatcherConfig, Metadata, RemoteIndex, Verdict, VerificationAggregator, VerificationConfig,
};
use presence_hw::{Frame, FrameBroker};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera unavailable: no capture backend could be opened")]
    CameraUnavailable,
    #[error("no usable frame within {0:?}")]
    NoFrame(Duration),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedding rejected: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("enrollment failed: {0}")]
    Enroll(#[from] EnrollError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("no remote index configured")]
    NoRemote,
    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Pipeline timing and sampling knobs.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Session pipeline poll period.
    pub poll_interval: Duration,
    /// Consecutive empty polls before the camera is restarted. 0 disables.
    pub restart_after_misses: u32,
    pub min_detection_score: f32,
    /// Poll period used by one-shot identify and enrollment capture.
    pub capture_poll: Duration,
    /// How long identify waits for a usable frame.
    pub identify_wait: Duration,
    /// Enrollment looks at every n-th frame.
    pub enroll_frame_stride: u32,
    pub enroll_max_samples: usize,
    pub enroll_max_frames: u32,
    pub enroll_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            restart_after_misses: 25,
            min_detection_score: 0.6,
            capture_poll: Duration::from_millis(33),
            identify_wait: Duration::from_secs(3),
            enroll_frame_stride: 10,
            enroll_max_samples: 5,
            enroll_max_frames: 100,
            enroll_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything the engine is assembled from.
pub struct EngineParts {
    pub broker: Arc<FrameBroker>,
    pub detector: Arc<dyn Detector>,
    pub cache: Arc<LocalSimilarityCache>,
    pub remote: Option<Arc<dyn RemoteIndex>>,
    pub sink: Arc<dyn AttendanceSink>,
    pub matcher: MatcherConfig,
    pub verification: VerificationConfig,
    pub settings: EngineSettings,
}

/// Result of a one-shot identify.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyOutcome {
    /// Matched identity, or "Unknown".
    pub identity: String,
    pub confidence: f32,
    pub source: MatchSource,
    /// Faces the detector reported in the frame used.
    pub faces: usize,
}

struct SessionHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    started_at: DateTime<Utc>,
}

/// Owns the attendance pipelines. Shared as `Arc<Engine>` between the D-Bus
/// service and the session tasks it spawns.
pub struct Engine {
    broker: Arc<FrameBroker>,
    detector: Arc<dyn Detector>,
    cache: Arc<LocalSimilarityCache>,
    remote: Option<Arc<dyn RemoteIndex>>,
    sink: Arc<dyn AttendanceSink>,
    matcher: CandidateMatcher,
    aggregator: VerificationAggregator,
    enroller: Enroller,
    settings: EngineSettings,
    sessions: Mutex<HashMap<String, SessionHandle>>,
}

impl Engine {
    pub fn new(parts: EngineParts) -> Self {
        let matcher = CandidateMatcher::new(
            Arc::clone(&parts.cache),
            parts.remote.clone(),
            parts.matcher,
        );
        let enroller = Enroller::new(
            Arc::clone(&parts.cache),
            parts.remote.clone(),
            parts.settings.min_detection_score,
        );
        Self {
            broker: parts.broker,
            detector: parts.detector,
            cache: parts.cache,
            remote: parts.remote,
            sink: parts.sink,
            matcher,
            aggregator: VerificationAggregator::new(parts.verification),
            enroller,
            settings: parts.settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Take a camera lease and start a pipeline for `session`.
    ///
    /// Returns `Ok(false)` if the session is already running.
    pub async fn start_session(self: &Arc<Self>, session: &str) -> Result<bool, EngineError> {
        if self.sessions.lock().contains_key(session) {
            return Ok(false);
        }

        self.acquire_broker().await?;

        let started = {
            let mut sessions = self.sessions.lock();
            if sessions.contains_key(session) {
                false
            } else {
                let (stop, stop_rx) = watch::channel(false);
                let task = tokio::spawn(Arc::clone(self).run_session(session.to_owned(), stop_rx));
                sessions.insert(
                    session.to_owned(),
                    SessionHandle {
                        stop,
                        task,
                        started_at: Utc::now(),
                    },
                );
                true
            }
        };

        if !started {
            // Lost a race with a concurrent start of the same session.
            self.release_broker().await;
            return Ok(false);
        }

        tracing::info!(session, "session started");
        Ok(true)
    }

    /// Stop the pipeline, drop its camera lease and its verification state.
    pub async fn end_session(&self, session: &str) -> bool {
        let handle = self.sessions.lock().remove(session);
        let Some(handle) = handle else {
            return false;
        };
        self.stop_session(session, handle).await;
        true
    }

    /// Identify the largest confident face in the current frame.
    pub async fn identify(&self) -> Result<IdentifyOutcome, EngineError> {
        self.acquire_broker().await?;
        let outcome = self.identify_leased().await;
        self.release_broker().await;
        outcome
    }

    /// Capture face samples for `identity` and enroll them in both tiers.
    pub async fn enroll(&self, identity: &str, metadata: Metadata) -> Result<EnrollOutcome, EngineError> {
        if identity.trim().is_empty() {
            return Err(EnrollError::EmptyIdentity.into());
        }

        self.acquire_broker().await?;
        let samples = self.collect_samples().await;
        self.release_broker().await;

        Ok(self.enroller.enroll(identity, &samples, metadata).await?)
    }

    /// Replace the local cache with the remote index contents.
    pub async fn sync_cache(&self) -> Result<usize, EngineError> {
        let remote = self.remote.as_ref().ok_or(EngineError::NoRemote)?;
        Ok(self.cache.sync(&**remote).await?)
    }

    /// Stop every session, force the camera closed, flush the cache.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, SessionHandle)> = self.sessions.lock().drain().collect();
        for (session, handle) in drained {
            self.stop_session(&session, handle).await;
        }

        let broker = Arc::clone(&self.broker);
        if let Err(e) = tokio::task::spawn_blocking(move || broker.shutdown()).await {
            tracing::warn!(error = %e, "camera shutdown task failed");
        }

        let cache = Arc::clone(&self.cache);
        match tokio::task::spawn_blocking(move || cache.flush()).await {
            Ok(Ok(())) => tracing::info!(path = %self.cache.path().display(), "embedding cache saved"),
            Ok(Err(e)) => tracing::warn!(error = %e, "failed to save embedding cache"),
            Err(e) => tracing::warn!(error = %e, "cache flush task failed"),
        }
    }

    pub async fn status(&self) -> Result<serde_json::Value, EngineError> {
        // Cache stats touch the filesystem.
        let (broker, cache) = (Arc::clone(&self.broker), Arc::clone(&self.cache));
        let (camera, cache) =
            tokio::task::spawn_blocking(move || (broker.status(), cache.stats())).await?;
        let mut sessions: Vec<serde_json::Value> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, h)| serde_json::json!({ "id": id, "started_at": h.started_at.to_rfc3339() }))
            .collect();
        sessions.sort_by(|a, b| a["id"].as_str().cmp(&b["id"].as_str()));

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": {
                "running": camera.running,
                "healthy": camera.healthy,
                "ref_count": camera.ref_count,
                "backend": camera.backend,
                "frame_age_ms": camera.frame_age.map(|d| d.as_millis() as u64),
            },
            "cache": {
                "entries": cache.entries,
                "path": cache.path.display().to_string(),
                "file_exists": cache.file_exists,
                "last_modified": cache.last_modified.map(|t| t.to_rfc3339()),
            },
            "remote": self.remote.is_some(),
            "match_threshold": self.matcher.threshold(),
            "sessions": sessions,
            "tracked_keys": self.aggregator.tracked_keys(),
        }))
    }

    async fn run_session(self: Arc<Self>, session: String, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut misses = 0u32;
        let mut last_sequence = None;

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = ticker.tick() => {}
            }

            let Some(frame) = self.broker.get_frame() else {
                misses += 1;
                if self.settings.restart_after_misses > 0 && misses >= self.settings.restart_after_misses {
                    tracing::warn!(session = %session, misses, "no fresh frames; restarting camera");
                    misses = 0;
                    self.restart_broker().await;
                }
                continue;
            };
            misses = 0;

            if last_sequence == Some(frame.sequence) {
                continue;
            }
            last_sequence = Some(frame.sequence);

            if frame.is_dark {
                tracing::debug!(session = %session, sequence = frame.sequence, "skipping dark frame");
                continue;
            }

            self.process_frame(&session, &frame).await;
        }

        tracing::debug!(session = %session, "session pipeline stopped");
    }

    async fn process_frame(&self, session: &str, frame: &Frame) {
        let detections = match self.detector.detect(&frame.data, frame.width, frame.height).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(session, error = %e, "detection failed; skipping frame");
                return;
            }
        };

        for detection in detections {
            if detection.score < self.settings.min_detection_score {
                continue;
            }
            let embedding = match Embedding::new(detection.embedding) {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(session, error = %e, "detector produced an unusable embedding");
                    continue;
                }
            };

            let result = self.matcher.match_embedding(&embedding).await;
            let Some(identity) = result.identity.as_deref() else {
                continue;
            };
            tracing::debug!(session, identity, score = result.score, source = %result.source, "face matched");

            let verdict = self
                .aggregator
                .observe_at(session, identity, result.score, Instant::now());
            if let Verdict::Confirmed { mean } = verdict {
                self.mark(session, identity, mean, &result).await;
            }
        }
    }

    async fn mark(&self, session: &str, identity: &str, confidence: f32, result: &MatchResult) {
        let event = AttendanceEvent {
            session: session.to_owned(),
            identity: identity.to_owned(),
            confidence,
            source: result.source,
            metadata: result.metadata.clone(),
            marked_at: Utc::now(),
        };
        // Sinks may write files.
        let sink = Arc::clone(&self.sink);
        match tokio::task::spawn_blocking(move || sink.record(&event)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(session, identity, error = %e, "failed to record attendance"),
            Err(e) => tracing::warn!(session, identity, error = %e, "attendance sink task failed"),
        }
    }

    async fn identify_leased(&self) -> Result<IdentifyOutcome, EngineError> {
        let deadline = Instant::now() + self.settings.identify_wait;
        let mut last_sequence = None;
        let frame = loop {
            match self.next_frame(&mut last_sequence, deadline).await {
                Some(frame) if frame.is_dark => continue,
                Some(frame) => break frame,
                None => return Err(EngineError::NoFrame(self.settings.identify_wait)),
            }
        };

        let detections = self.detector.detect(&frame.data, frame.width, frame.height).await?;
        let confident: Vec<Detection> = detections
            .iter()
            .filter(|d| d.score >= self.settings.min_detection_score)
            .cloned()
            .collect();
        let face = Detection::largest(&confident).ok_or(EngineError::NoFaceDetected)?;

        let embedding = Embedding::new(face.embedding.clone())?;
        let result = self.matcher.match_embedding(&embedding).await;
        tracing::info!(identity = result.label(), score = result.score, source = %result.source, "identify");

        Ok(IdentifyOutcome {
            identity: result.label().to_owned(),
            confidence: result.score,
            source: result.source,
            faces: detections.len(),
        })
    }

    /// Largest confident face from every n-th new frame, until enough
    /// samples, enough frames, or the timeout.
    async fn collect_samples(&self) -> Vec<Detection> {
        let s = &self.settings;
        let stride = s.enroll_frame_stride.max(1);
        let deadline = Instant::now() + s.enroll_timeout;
        let mut last_sequence = None;
        let mut seen = 0u32;
        let mut samples = Vec::new();

        while samples.len() < s.enroll_max_samples && seen < s.enroll_max_frames {
            let Some(frame) = self.next_frame(&mut last_sequence, deadline).await else {
                tracing::warn!(frames = seen, "enrollment capture timed out");
                break;
            };
            seen += 1;
            if seen % stride != 0 || frame.is_dark {
                continue;
            }

            let detections = match self.detector.detect(&frame.data, frame.width, frame.height).await {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(error = %e, "detection failed during enrollment");
                    continue;
                }
            };
            if let Some(face) = Detection::largest(&detections) {
                if face.score >= s.min_detection_score {
                    samples.push(face.clone());
                    tracing::debug!(collected = samples.len(), score = face.score, "enrollment sample");
                }
            }
        }

        tracing::info!(frames = seen, samples = samples.len(), "enrollment capture finished");
        samples
    }

    /// Next frame with a sequence number different from the last one seen,
    /// or `None` once `deadline` passes.
    async fn next_frame(&self, last_sequence: &mut Option<u32>, deadline: Instant) -> Option<Frame> {
        loop {
            if let Some(frame) = self.broker.get_frame() {
                if *last_sequence != Some(frame.sequence) {
                    *last_sequence = Some(frame.sequence);
                    return Some(frame);
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.settings.capture_poll).await;
        }
    }

    async fn stop_session(&self, session: &str, handle: SessionHandle) {
        let _ = handle.stop.send(true);
        if let Err(e) = handle.task.await {
            tracing::warn!(session, error = %e, "session task ended abnormally");
        }
        self.release_broker().await;
        let cleared = self.aggregator.clear_session(session);
        tracing::info!(session, cleared, "session ended");
    }

    // Broker calls can open, join, or close a device, so they run on the
    // blocking pool.

    async fn acquire_broker(&self) -> Result<(), EngineError> {
        let broker = Arc::clone(&self.broker);
        if tokio::task::spawn_blocking(move || broker.acquire()).await? {
            Ok(())
        } else {
            Err(EngineError::CameraUnavailable)
        }
    }

    async fn release_broker(&self) {
        let broker = Arc::clone(&self.broker);
        if let Err(e) = tokio::task::spawn_blocking(move || broker.release()).await {
            tracing::warn!(error = %e, "camera release task failed");
        }
    }

    async fn restart_broker(&self) {
        let broker = Arc::clone(&self.broker);
        match tokio::task::spawn_blocking(move || broker.restart()).await {
            Ok(true) => tracing::info!("camera restarted"),
            Ok(false) => tracing::warn!("camera restart failed; will retry"),
            Err(e) => tracing::warn!(error = %e, "camera restart task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use async_trait::async_trait;
    use presence_core::{BoundingBox, EMBEDDING_DIM};
    use presence_hw::{BrokerConfig, CameraError, CaptureBackend, CaptureDevice};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Clone, Copy, PartialEq)]
    enum Feed {
        Bright,
        Stale,
    }

    struct FakeDevice {
        feed: Feed,
        seq: u32,
    }

    impl CaptureDevice for FakeDevice {
        fn read_frame(&mut self) -> Result<Frame, CameraError> {
            std::thread::sleep(Duration::from_millis(2));
            self.seq += 1;
            let mut frame = Frame::new(vec![128u8; 16], 4, 4, self.seq);
            if self.feed == Feed::Stale {
                frame.timestamp = Instant::now()
                    .checked_sub(Duration::from_secs(10))
                    .unwrap_or(frame.timestamp);
            }
            Ok(frame)
        }
    }

    struct FakeCamera {
        feed: Option<Feed>,
        opens: Arc<AtomicUsize>,
    }

    impl CaptureBackend for FakeCamera {
        fn name(&self) -> &str {
            "fake"
        }

        fn open(&self) -> Result<Box<dyn CaptureDevice>, CameraError> {
            let Some(feed) = self.feed else {
                return Err(CameraError::DeviceNotFound("fake".into()));
            };
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeDevice { feed, seq: 0 }))
        }
    }

    struct FakeDetector {
        faces: Vec<Detection>,
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Detector for FakeDetector {
        async fn detect(&self, _: &[u8], _: u32, _: u32) -> Result<Vec<Detection>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DetectorError::Decode("model not loaded".into()));
            }
            Ok(self.faces.clone())
        }
    }

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        v[i] = 1.0;
        v
    }

    fn face(score: f32, size: f32, embedding: Vec<f32>) -> Detection {
        Detection {
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: size,
                height: size,
            },
            score,
            embedding,
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        engine: Arc<Engine>,
        broker: Arc<FrameBroker>,
        cache: Arc<LocalSimilarityCache>,
        sink: Arc<MemorySink>,
        detector: Arc<FakeDetector>,
        opens: Arc<AtomicUsize>,
    }

    fn harness(feed: Option<Feed>, faces: Vec<Detection>, fail_detect: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let opens = Arc::new(AtomicUsize::new(0));
        let backends: Vec<Box<dyn CaptureBackend>> = vec![Box::new(FakeCamera {
            feed,
            opens: Arc::clone(&opens),
        })];
        let broker = Arc::new(FrameBroker::new(
            backends,
            BrokerConfig {
                stale_after: Duration::from_millis(500),
                ..BrokerConfig::default()
            },
        ));
        let cache = Arc::new(LocalSimilarityCache::load(dir.path().join("cache.json")));
        let sink = Arc::new(MemorySink::default());
        let detector = Arc::new(FakeDetector {
            faces,
            fail: fail_detect,
            calls: AtomicUsize::new(0),
        });

        let engine = Arc::new(Engine::new(EngineParts {
            broker: Arc::clone(&broker),
            detector: Arc::clone(&detector) as Arc<dyn Detector>,
            cache: Arc::clone(&cache),
            remote: None,
            sink: Arc::clone(&sink) as Arc<dyn AttendanceSink>,
            matcher: MatcherConfig::default(),
            verification: VerificationConfig {
                window: 3,
                threshold: 0.55,
                cooldown: Duration::from_secs(300),
            },
            settings: EngineSettings {
                poll_interval: Duration::from_millis(10),
                restart_after_misses: 3,
                capture_poll: Duration::from_millis(5),
                identify_wait: Duration::from_secs(2),
                enroll_frame_stride: 2,
                enroll_max_samples: 3,
                enroll_timeout: Duration::from_secs(5),
                ..EngineSettings::default()
            },
        }));

        Harness {
            _dir: dir,
            engine,
            broker,
            cache,
            sink,
            detector,
            opens,
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_marks_attendance_once() {
        let h = harness(Some(Feed::Bright), vec![face(0.9, 100.0, axis(0))], false);
        h.cache.add("alice", Embedding::new(axis(0)).unwrap(), Metadata::new()).unwrap();

        assert!(h.engine.start_session("cs101").await.unwrap());
        assert!(wait_for(|| !h.sink.events.lock().is_empty()).await);

        // Plenty more matching frames; the cooldown holds.
        assert!(wait_for(|| h.detector.calls.load(Ordering::SeqCst) > 15).await);
        {
            let events = h.sink.events.lock();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].identity, "alice");
            assert_eq!(events[0].session, "cs101");
            assert_eq!(events[0].source, MatchSource::Cache);
        }

        assert!(h.engine.end_session("cs101").await);
        assert_eq!(h.broker.ref_count(), 0);
        assert_eq!(h.engine.status().await.unwrap()["tracked_keys"], 0);
        assert!(!h.engine.end_session("cs101").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sessions_share_one_camera() {
        let h = harness(Some(Feed::Bright), Vec::new(), false);
        assert!(h.engine.start_session("a").await.unwrap());
        assert!(h.engine.start_session("b").await.unwrap());
        assert!(!h.engine.start_session("a").await.unwrap());
        assert_eq!(h.broker.ref_count(), 2);
        assert_eq!(h.opens.load(Ordering::SeqCst), 1);

        h.engine.end_session("a").await;
        assert_eq!(h.broker.ref_count(), 1);
        assert!(h.broker.status().running);
        h.engine.end_session("b").await;
        assert!(!h.broker.status().running);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_fails_without_camera() {
        let h = harness(None, Vec::new(), false);
        let err = h.engine.start_session("cs101").await.unwrap_err();
        assert!(matches!(err, EngineError::CameraUnavailable));
        assert_eq!(h.broker.ref_count(), 0);
        assert!(h.engine.status().await.unwrap()["sessions"].as_array().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_detector_failures_do_not_stop_pipeline() {
        let h = harness(Some(Feed::Bright), Vec::new(), true);
        h.engine.start_session("cs101").await.unwrap();
        assert!(wait_for(|| h.detector.calls.load(Ordering::SeqCst) >= 5).await);
        assert!(h.sink.events.lock().is_empty());
        h.engine.end_session("cs101").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_camera_is_restarted() {
        let h = harness(Some(Feed::Stale), Vec::new(), false);
        // The broker's own open check only needs a frame, not a fresh one.
        assert!(h.engine.start_session("cs101").await.unwrap());
        assert!(wait_for(|| h.opens.load(Ordering::SeqCst) >= 3).await);
        assert_eq!(h.detector.calls.load(Ordering::SeqCst), 0);
        h.engine.end_session("cs101").await;
        assert_eq!(h.broker.ref_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_identify_largest_face() {
        let faces = vec![
            face(0.95, 40.0, axis(1)),
            face(0.9, 120.0, axis(0)),
            face(0.2, 300.0, axis(2)),
        ];
        let h = harness(Some(Feed::Bright), faces, false);
        h.cache.add("alice", Embedding::new(axis(0)).unwrap(), Metadata::new()).unwrap();
        h.cache.add("bob", Embedding::new(axis(1)).unwrap(), Metadata::new()).unwrap();

        let outcome = h.engine.identify().await.unwrap();
        assert_eq!(outcome.identity, "alice");
        assert_eq!(outcome.faces, 3);
        assert_eq!(outcome.source, MatchSource::Cache);
        assert_eq!(h.broker.ref_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_identify_unknown_and_no_face() {
        let h = harness(Some(Feed::Bright), vec![face(0.9, 100.0, axis(0))], false);
        let outcome = h.engine.identify().await.unwrap();
        assert_eq!(outcome.identity, "Unknown");
        assert_eq!(outcome.source, MatchSource::None);

        let h = harness(Some(Feed::Bright), Vec::new(), false);
        assert!(matches!(h.engine.identify().await, Err(EngineError::NoFaceDetected)));
        assert_eq!(h.broker.ref_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_enroll_captures_and_stores() {
        let h = harness(Some(Feed::Bright), vec![face(0.9, 100.0, axis(4))], false);
        let outcome = h.engine.enroll("s-100", Metadata::new()).await.unwrap();
        assert_eq!(outcome.samples_used, 3);
        assert!(!outcome.remote_stored);
        assert!(h.cache.get("s-100").is_some());
        assert_eq!(h.broker.ref_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_enroll_without_confident_faces() {
        let h = harness(Some(Feed::Bright), vec![face(0.4, 100.0, axis(4))], false);
        let err = h.engine.enroll("s-100", Metadata::new()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Enroll(EnrollError::NotEnoughSamples { usable: 0, .. })
        ));
        assert!(h.cache.get("s-100").is_none());
    }

    /// Blocks in `record` until the test lets it go, then notes whether it
    /// was let go before its own deadline.
    #[derive(Default)]
    struct GateSink {
        entered: AtomicBool,
        opened: AtomicBool,
        opened_in_time: Mutex<Vec<bool>>,
    }

    impl AttendanceSink for GateSink {
        fn record(&self, _: &AttendanceEvent) -> Result<(), crate::sink::SinkError> {
            self.entered.store(true, Ordering::SeqCst);
            let deadline = Instant::now() + Duration::from_secs(2);
            while !self.opened.load(Ordering::SeqCst) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            self.opened_in_time.lock().push(self.opened.load(Ordering::SeqCst));
            Ok(())
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_slow_sink_does_not_stall_the_runtime() {
        let h = harness(Some(Feed::Bright), vec![face(0.9, 100.0, axis(0))], false);
        h.cache.add("alice", Embedding::new(axis(0)).unwrap(), Metadata::new()).unwrap();
        let gate = Arc::new(GateSink::default());
        let engine = Arc::new(Engine::new(EngineParts {
            broker: Arc::clone(&h.broker),
            detector: Arc::clone(&h.detector) as Arc<dyn Detector>,
            cache: Arc::clone(&h.cache),
            remote: None,
            sink: Arc::clone(&gate) as Arc<dyn AttendanceSink>,
            matcher: MatcherConfig::default(),
            verification: VerificationConfig::default(),
            settings: EngineSettings {
                poll_interval: Duration::from_millis(10),
                ..EngineSettings::default()
            },
        }));

        assert!(engine.start_session("cs101").await.unwrap());
        // Only reachable while `record` is still blocked if the runtime
        // thread is free to run this task.
        assert!(wait_for(|| gate.entered.load(Ordering::SeqCst)).await);
        gate.opened.store(true, Ordering::SeqCst);

        assert!(wait_for(|| !gate.opened_in_time.lock().is_empty()).await);
        assert_eq!(*gate.opened_in_time.lock(), vec![true]);
        assert_eq!(engine.status().await.unwrap()["sessions"].as_array().unwrap().len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sync_requires_remote() {
        let h = harness(Some(Feed::Bright), Vec::new(), false);
        assert!(matches!(h.engine.sync_cache().await, Err(EngineError::NoRemote)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_stops_everything_and_flushes() {
        let h = harness(Some(Feed::Bright), Vec::new(), false);
        h.engine.start_session("a").await.unwrap();
        h.engine.start_session("b").await.unwrap();

        assert_eq!(h.engine.status().await.unwrap()["sessions"].as_array().unwrap().len(), 2);
        h.engine.shutdown().await;
        assert!(h.engine.status().await.unwrap()["sessions"].as_array().unwrap().is_empty());
        assert_eq!(h.broker.ref_count(), 0);
        assert!(!h.broker.status().running);
        assert!(h.cache.path().exists());
    }
}
