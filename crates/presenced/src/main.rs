use anyhow::{Context, Result};
use presence_core::{
    DetectorConfig, HttpDetector, HttpRemoteIndex, LocalSimilarityCache, MatcherConfig,
    RemoteConfig, RemoteIndex, VerificationConfig,
};
use presence_hw::{BrokerConfig, FrameBroker, V4l2Backend};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod sink;

use config::Config;
use dbus_interface::{PresenceService, BUS_NAME, OBJECT_PATH};
use engine::{Engine, EngineParts, EngineSettings};
use sink::JsonlSink;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::from_env();
    let engine = Arc::new(build_engine(&config)?);

    match engine.sync_cache().await {
        Ok(entries) => tracing::info!(entries, "startup cache sync complete"),
        Err(engine::EngineError::NoRemote) => {
            tracing::warn!("PRESENCE_REMOTE_URL not set; matching against the local cache only")
        }
        Err(e) => tracing::warn!(error = %e, "startup cache sync failed; using cached embeddings"),
    }

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, PresenceService::new(Arc::clone(&engine)))?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "presenced ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");
    engine.shutdown().await;

    Ok(())
}

fn build_engine(config: &Config) -> Result<Engine> {
    tracing::info!(
        devices = ?config.camera_devices,
        cache = %config.cache_path.display(),
        remote = config.remote_url.as_deref().unwrap_or("none"),
        detector = %config.detector_url,
        "configuration loaded"
    );

    let broker = Arc::new(FrameBroker::new(
        V4l2Backend::strategies(&config.camera_devices),
        BrokerConfig {
            stale_after: config.stale_frame_after,
            ..BrokerConfig::default()
        },
    ));

    let cache = Arc::new(LocalSimilarityCache::load(&config.cache_path));

    let remote: Option<Arc<dyn RemoteIndex>> = match &config.remote_url {
        Some(url) => {
            let index = HttpRemoteIndex::new(RemoteConfig {
                base_url: url.clone(),
                api_key: config.remote_api_key.clone(),
                timeout: config.remote_timeout,
            })
            .context("failed to build remote index client")?;
            Some(Arc::new(index))
        }
        None => None,
    };

    let detector = HttpDetector::new(DetectorConfig {
        url: config.detector_url.clone(),
        ..DetectorConfig::default()
    })
    .context("failed to build detector client")?;

    let sink = JsonlSink::new(&config.attendance_log);
    tracing::info!(path = %sink.path().display(), "attendance log");

    Ok(Engine::new(EngineParts {
        broker,
        detector: Arc::new(detector),
        cache,
        remote,
        sink: Arc::new(sink),
        matcher: MatcherConfig {
            threshold: config.match_threshold,
            remote_timeout: config.remote_timeout,
        },
        verification: VerificationConfig {
            window: config.window,
            threshold: config.confidence_threshold,
            cooldown: config.cooldown,
        },
        settings: EngineSettings {
            poll_interval: config.poll_interval,
            restart_after_misses: config.restart_after_misses,
            min_detection_score: config.min_detection_score,
            ..EngineSettings::default()
        },
    }))
}
