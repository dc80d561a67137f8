use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Candidate V4L2 device paths, tried in order.
    pub camera_devices: Vec<String>,
    /// Frames older than this are never handed to a consumer.
    pub stale_frame_after: Duration,
    /// Location of the persisted embedding cache.
    pub cache_path: PathBuf,
    /// Cosine similarity needed for a per-frame match.
    pub match_threshold: f32,
    /// Faces the detector is less sure of than this are ignored.
    pub min_detection_score: f32,
    /// Remote vector index base URL. Unset means cache-only matching.
    pub remote_url: Option<String>,
    pub remote_api_key: Option<String>,
    pub remote_timeout: Duration,
    /// Face detection / embedding service endpoint.
    pub detector_url: String,
    /// Consecutive matches averaged before a presence is confirmed.
    pub window: usize,
    /// Mean confidence a full window must reach.
    pub confidence_threshold: f32,
    /// Minimum time between two marks of the same person in one session.
    pub cooldown: Duration,
    /// How often a session pipeline polls the broker.
    pub poll_interval: Duration,
    /// Consecutive empty polls before a pipeline restarts the camera.
    pub restart_after_misses: u32,
    /// Append-only JSON lines log of confirmed attendance.
    pub attendance_log: PathBuf,
    /// Register on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Config {
    /// Load configuration from `PRESENCE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("presence");

        let camera_devices = parse_list(
            &std::env::var("PRESENCE_CAMERA_DEVICES").unwrap_or_else(|_| "/dev/video0".to_string()),
        );

        Self {
            camera_devices,
            stale_frame_after: Duration::from_millis(env_u64("PRESENCE_STALE_FRAME_MS", 2000)),
            cache_path: std::env::var("PRESENCE_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("embeddings_cache.json")),
            match_threshold: env_f32("PRESENCE_MATCH_THRESHOLD", 0.55),
            min_detection_score: env_f32("PRESENCE_MIN_DETECTION_SCORE", 0.6),
            remote_url: env_nonempty("PRESENCE_REMOTE_URL"),
            remote_api_key: env_nonempty("PRESENCE_REMOTE_API_KEY"),
            remote_timeout: Duration::from_millis(env_u64("PRESENCE_REMOTE_TIMEOUT_MS", 3000)),
            detector_url: std::env::var("PRESENCE_DETECTOR_URL")
                .unwrap_or_else(|_| "http://localhost:5090/detect".to_string()),
            window: env_usize("PRESENCE_WINDOW", 3),
            confidence_threshold: env_f32("PRESENCE_CONFIDENCE_THRESHOLD", 0.55),
            cooldown: Duration::from_secs(env_u64("PRESENCE_COOLDOWN_SECS", 300)),
            poll_interval: Duration::from_millis(env_u64("PRESENCE_POLL_MS", 200)),
            restart_after_misses: env_u32("PRESENCE_RESTART_AFTER_MISSES", 25),
            attendance_log: std::env::var("PRESENCE_ATTENDANCE_LOG")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_dir.join("attendance.jsonl")),
            session_bus: std::env::var("PRESENCE_SESSION_BUS")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Out-of-range values fall back to the default rather than wrapping.
fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
