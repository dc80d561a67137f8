//! Face detection + embedding, delegated to an external service.
//!
//! The pipeline only needs "frame in, faces with embeddings out"; the model
//! runs wherever [`Detector`] points. [`HttpDetector`] posts raw 8-bit
//! grayscale pixels and reads back a JSON face list.

use crate::types::Detection;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("detector returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("invalid detector response: {0}")]
    Decode(String),
    #[error("frame is {len} bytes, expected {width}x{height}")]
    FrameSize { len: usize, width: u32, height: u32 },
}

#[async_trait]
pub trait Detector: Send + Sync {
    /// Faces found in one grayscale frame, in no particular order.
    async fn detect(&self, data: &[u8], width: u32, height: u32) -> Result<Vec<Detection>, DetectorError>;
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub url: String,
    pub timeout: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5090/detect".to_string(),
            timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    faces: Vec<Detection>,
}

pub struct HttpDetector {
    client: reqwest::Client,
    config: DetectorConfig,
}

impl HttpDetector {
    pub fn new(config: DetectorConfig) -> Result<Self, DetectorError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    fn request_url(&self, width: u32, height: u32) -> String {
        let sep = if self.config.url.contains('?') { '&' } else { '?' };
        format!("{}{sep}width={width}&height={height}", self.config.url)
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, data: &[u8], width: u32, height: u32) -> Result<Vec<Detection>, DetectorError> {
        if data.len() != (width as usize) * (height as usize) {
            return Err(DetectorError::FrameSize {
                len: data.len(),
                width,
                height,
            });
        }

        let response = self
            .client
            .post(self.request_url(width, height))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DetectorError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response.bytes().await?;
        let parsed = decode_response(&bytes)?;
        tracing::debug!(faces = parsed.len(), "detector returned");
        Ok(parsed)
    }
}

fn decode_response(bytes: &[u8]) -> Result<Vec<Detection>, DetectorError> {
    serde_json::from_slice::<DetectResponse>(bytes)
        .map(|r| r.faces)
        .map_err(|e| DetectorError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_faces() {
        let raw = br#"{"faces":[{"bbox":{"x":10,"y":20,"width":100,"height":120},"score":0.93,"embedding":[0.1,0.2]}]}"#;
        let faces = decode_response(raw).unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].bbox.height, 120.0);
        assert!((faces[0].score - 0.93).abs() < 1e-6);
        assert_eq!(faces[0].embedding.len(), 2);
    }

    #[test]
    fn test_decode_no_faces() {
        assert!(decode_response(b"{}").unwrap().is_empty());
        assert!(decode_response(br#"{"faces":[]}"#).unwrap().is_empty());
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            decode_response(b"<html>bad gateway</html>"),
            Err(DetectorError::Decode(_))
        ));
    }

    #[test]
    fn test_request_url_appends_dimensions() {
        let d = HttpDetector::new(DetectorConfig {
            url: "http://embed.local/detect".into(),
            ..DetectorConfig::default()
        })
        .unwrap();
        assert_eq!(d.request_url(640, 480), "http://embed.local/detect?width=640&height=480");

        let d = HttpDetector::new(DetectorConfig {
            url: "http://embed.local/detect?model=buffalo_l".into(),
            ..DetectorConfig::default()
        })
        .unwrap();
        assert_eq!(
            d.request_url(2, 2),
            "http://embed.local/detect?model=buffalo_l&width=2&height=2"
        );
    }

    #[tokio::test]
    async fn test_rejects_short_frame() {
        let d = HttpDetector::new(DetectorConfig::default()).unwrap();
        let err = d.detect(&[0u8; 10], 4, 4).await.unwrap_err();
        assert!(matches!(err, DetectorError::FrameSize { len: 10, .. }));
    }
}
