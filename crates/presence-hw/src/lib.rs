//! presence-hw: Camera access and the shared frame broker.
//!
//! Provides V4L2-based camera capture and a reference-counted broker that
//! serves one physical device to many concurrent consumers.

pub mod broker;
pub mod camera;
pub mod frame;

pub use broker::{BrokerConfig, BrokerStatus, CaptureBackend, CaptureDevice, FrameBroker};
pub use camera::{Camera, CameraError, PixelFormat, V4l2Backend};
pub use frame::Frame;
