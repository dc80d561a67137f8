//! Shared camera broker.
//!
//! One physical capture device, many logical consumers. The device handle is
//! owned by a single background capture thread, which is the only writer of
//! the "latest frame" slot. Consumers take reference-counted leases with
//! [`FrameBroker::acquire`] / [`FrameBroker::release`] and poll clones of the
//! latest frame with [`FrameBroker::get_frame`].
//!
//! Lock order: `refs` before `control`. The frame slot locks are never held
//! while taking either of the others. Status reads go through the slot and
//! the lease mirror only, so they never wait on a device open.

use crate::camera::CameraError;
use crate::frame::Frame;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// An open capture device. Dropping it closes the device.
pub trait CaptureDevice: Send {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

/// One strategy for opening the camera (device path, pixel format, driver...).
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &str;
    fn open(&self) -> Result<Box<dyn CaptureDevice>, CameraError>;
}

/// Broker tuning knobs.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Frames older than this are not handed out.
    pub stale_after: Duration,
    /// Consecutive read failures before the capture loop pauses.
    pub retry_after_failures: u32,
    /// Length of that pause.
    pub retry_pause: Duration,
    /// Read failures since the last good frame before the loop gives up.
    pub error_budget: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(2),
            retry_after_failures: 5,
            retry_pause: Duration::from_millis(200),
            error_budget: 50,
        }
    }
}

/// Point-in-time view of the broker, for status reporting.
#[derive(Debug, Clone)]
pub struct BrokerStatus {
    pub running: bool,
    pub healthy: bool,
    pub ref_count: usize,
    pub backend: Option<String>,
    pub frame_age: Option<Duration>,
}

/// State shared with the capture thread.
struct CaptureSlot {
    latest: RwLock<Option<Frame>>,
    alive: AtomicBool,
    backend: RwLock<Option<String>>,
}

struct CaptureWorker {
    backend: String,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Serializes access to one camera across any number of consumers.
pub struct FrameBroker {
    backends: Vec<Box<dyn CaptureBackend>>,
    config: BrokerConfig,
    refs: Mutex<usize>,
    /// Copy of `refs`, written under its lock.
    leases: AtomicUsize,
    control: Mutex<Option<CaptureWorker>>,
    slot: Arc<CaptureSlot>,
}

impl FrameBroker {
    /// Create a broker over an ordered list of backend strategies.
    /// Nothing is opened until the first [`acquire`](Self::acquire).
    pub fn new(backends: Vec<Box<dyn CaptureBackend>>, config: BrokerConfig) -> Self {
        Self {
            backends,
            config,
            refs: Mutex::new(0),
            leases: AtomicUsize::new(0),
            control: Mutex::new(None),
            slot: Arc::new(CaptureSlot {
                latest: RwLock::new(None),
                alive: AtomicBool::new(false),
                backend: RwLock::new(None),
            }),
        }
    }

    /// Take a lease on the camera, opening it if nobody holds one or if the
    /// capture thread has died.
    ///
    /// Returns false if no backend could open the device; the reference
    /// count is left as it was before the call.
    pub fn acquire(&self) -> bool {
        let mut refs = self.refs.lock();
        let mut control = self.control.lock();
        *refs += 1;

        if *refs == 1 || !self.is_running_locked(&control) {
            if !self.start_locked(&mut control) {
                *refs -= 1;
                return false;
            }
        }
        self.leases.store(*refs, Ordering::Release);

        tracing::debug!(refs = *refs, "camera acquired");
        true
    }

    /// Drop a lease. The device is closed only when the last lease goes.
    pub fn release(&self) {
        let mut refs = self.refs.lock();
        if *refs == 0 {
            tracing::warn!("camera release without a matching acquire");
            return;
        }
        *refs -= 1;
        self.leases.store(*refs, Ordering::Release);
        tracing::debug!(refs = *refs, "camera released");

        if *refs == 0 {
            let mut control = self.control.lock();
            self.stop_locked(&mut control);
        }
    }

    /// Latest frame, if one exists and is within the staleness threshold.
    pub fn get_frame(&self) -> Option<Frame> {
        let latest = self.slot.latest.read();
        latest
            .as_ref()
            .filter(|frame| frame.is_fresh(self.config.stale_after))
            .cloned()
    }

    /// Capture thread alive and latest frame fresh.
    pub fn is_healthy(&self) -> bool {
        if !self.slot.alive.load(Ordering::Acquire) {
            return false;
        }
        self.slot
            .latest
            .read()
            .as_ref()
            .is_some_and(|frame| frame.is_fresh(self.config.stale_after))
    }

    /// Tear the device down and open it again. Leases are preserved.
    ///
    /// Returns false without opening anything when nobody holds a lease.
    pub fn restart(&self) -> bool {
        let refs = self.refs.lock();
        let mut control = self.control.lock();
        if *refs == 0 {
            tracing::debug!("restart requested with no leases; camera stays closed");
            self.stop_locked(&mut control);
            return false;
        }
        tracing::info!(refs = *refs, "restarting camera");
        self.start_locked(&mut control)
    }

    /// Force-stop capture and forget all leases.
    pub fn shutdown(&self) {
        let mut refs = self.refs.lock();
        let mut control = self.control.lock();
        if *refs > 0 {
            tracing::info!(refs = *refs, "shutting down camera with outstanding leases");
        }
        *refs = 0;
        self.leases.store(0, Ordering::Release);
        self.stop_locked(&mut control);
    }

    pub fn ref_count(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    /// Name of the backend strategy currently in use.
    pub fn backend(&self) -> Option<String> {
        self.slot.backend.read().clone()
    }

    /// Snapshot for status reporting. Does not block behind an acquire or
    /// restart that is busy opening the device.
    pub fn status(&self) -> BrokerStatus {
        let backend = self.backend();
        let running = backend.is_some() && self.slot.alive.load(Ordering::Acquire);
        let frame_age = self.slot.latest.read().as_ref().map(Frame::age);
        BrokerStatus {
            running,
            healthy: self.is_healthy(),
            ref_count: self.ref_count(),
            backend,
            frame_age,
        }
    }

    fn is_running_locked(&self, control: &Option<CaptureWorker>) -> bool {
        control.is_some() && self.slot.alive.load(Ordering::Acquire)
    }

    /// Stop any running capture, then walk the backend list until one opens
    /// and passes a test read.
    fn start_locked(&self, control: &mut Option<CaptureWorker>) -> bool {
        self.stop_locked(control);

        for backend in &self.backends {
            let name = backend.name().to_string();
            let mut device = match backend.open() {
                Ok(device) => device,
                Err(e) => {
                    tracing::warn!(backend = %name, error = %e, "camera backend failed to open");
                    continue;
                }
            };

            let first = match device.read_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(backend = %name, error = %e, "camera backend failed test read");
                    continue;
                }
            };

            *self.slot.latest.write() = Some(first);
            self.slot.alive.store(true, Ordering::Release);

            let stop = Arc::new(AtomicBool::new(false));
            let spawned = std::thread::Builder::new()
                .name("presence-capture".into())
                .spawn({
                    let slot = Arc::clone(&self.slot);
                    let stop = Arc::clone(&stop);
                    let config = self.config.clone();
                    let name = name.clone();
                    move || capture_loop(device, slot, stop, config, name)
                });

            match spawned {
                Ok(handle) => {
                    tracing::info!(backend = %name, "camera capture started");
                    *self.slot.backend.write() = Some(name.clone());
                    *control = Some(CaptureWorker {
                        backend: name,
                        stop,
                        handle,
                    });
                    return true;
                }
                Err(e) => {
                    self.slot.alive.store(false, Ordering::Release);
                    *self.slot.latest.write() = None;
                    tracing::error!(backend = %name, error = %e, "failed to spawn capture thread");
                }
            }
        }

        tracing::error!(
            backends = self.backends.len(),
            "no camera backend could open the device"
        );
        false
    }

    fn stop_locked(&self, control: &mut Option<CaptureWorker>) {
        if let Some(worker) = control.take() {
            worker.stop.store(true, Ordering::Release);
            if worker.handle.join().is_err() {
                tracing::warn!(backend = %worker.backend, "capture thread panicked");
            }
            tracing::info!(backend = %worker.backend, "camera closed");
        }
        self.slot.alive.store(false, Ordering::Release);
        *self.slot.backend.write() = None;
        *self.slot.latest.write() = None;
    }
}

impl Drop for FrameBroker {
    fn drop(&mut self) {
        let mut control = self.control.lock();
        self.stop_locked(&mut control);
    }
}

/// Body of the capture thread. Owns the device until it returns.
fn capture_loop(
    mut device: Box<dyn CaptureDevice>,
    slot: Arc<CaptureSlot>,
    stop: Arc<AtomicBool>,
    config: BrokerConfig,
    backend: String,
) {
    let mut consecutive = 0u32;
    let mut since_last_good = 0u32;

    while !stop.load(Ordering::Acquire) {
        match device.read_frame() {
            Ok(frame) => {
                consecutive = 0;
                since_last_good = 0;
                *slot.latest.write() = Some(frame);
            }
            Err(e) => {
                consecutive += 1;
                since_last_good += 1;

                if since_last_good > config.error_budget {
                    tracing::error!(
                        backend = %backend,
                        errors = since_last_good,
                        error = %e,
                        "capture error budget exhausted; stopping capture"
                    );
                    break;
                }

                if consecutive >= config.retry_after_failures {
                    tracing::warn!(
                        backend = %backend,
                        consecutive,
                        error = %e,
                        "repeated capture failures; pausing"
                    );
                    std::thread::sleep(config.retry_pause);
                    consecutive = 0;
                } else {
                    tracing::debug!(backend = %backend, error = %e, "capture read failed");
                }
            }
        }
    }

    slot.alive.store(false, Ordering::Release);
    drop(device);
    tracing::debug!(backend = %backend, "capture thread exiting");
}
