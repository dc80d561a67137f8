use crate::engine::{Engine, EngineError};
use presence_core::Metadata;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.presence.Presence1";
pub const OBJECT_PATH: &str = "/org/presence/Presence1";

/// D-Bus interface for the presence daemon.
///
/// Bus name: org.presence.Presence1
/// Object path: /org/presence/Presence1
pub struct PresenceService {
    engine: Arc<Engine>,
}

impl PresenceService {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

fn to_fdo(err: EngineError) -> zbus::fdo::Error {
    match err {
        EngineError::NoRemote => zbus::fdo::Error::NotSupported(err.to_string()),
        EngineError::Enroll(presence_core::EnrollError::EmptyIdentity) => {
            zbus::fdo::Error::InvalidArgs(err.to_string())
        }
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn parse_metadata(raw: &str) -> zbus::fdo::Result<Metadata> {
    if raw.trim().is_empty() {
        return Ok(Metadata::new());
    }
    serde_json::from_str(raw)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("metadata must be a JSON object: {e}")))
}

#[interface(name = "org.presence.Presence1")]
impl PresenceService {
    /// Start an attendance session. False if it is already running.
    async fn start_session(&self, session: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(session, "start_session requested");
        self.engine.start_session(session).await.map_err(to_fdo)
    }

    /// End an attendance session. False if it was not running.
    async fn end_session(&self, session: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(session, "end_session requested");
        Ok(self.engine.end_session(session).await)
    }

    /// Identify whoever is in front of the camera right now.
    async fn identify(&self) -> zbus::fdo::Result<String> {
        let outcome = self.engine.identify().await.map_err(to_fdo)?;
        serde_json::to_string(&outcome).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Enroll a new identity from live camera samples.
    async fn enroll(&self, identity: &str, metadata: &str) -> zbus::fdo::Result<String> {
        tracing::info!(identity, "enroll requested");
        let metadata = parse_metadata(metadata)?;
        let outcome = self.engine.enroll(identity, metadata).await.map_err(to_fdo)?;
        serde_json::to_string(&outcome).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Reload the local cache from the remote index; returns the entry count.
    async fn sync_cache(&self) -> zbus::fdo::Result<u32> {
        tracing::info!("sync_cache requested");
        let count = self.engine.sync_cache().await.map_err(to_fdo)?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        Ok(self.engine.status().await.map_err(to_fdo)?.to_string())
    }
}
