//! `MotionHub`: the device ingest hub and motion-alert pipeline.
//!
//! Wires the registry, session manager, frame decoder, motion engine, alert
//! governor and broadcast hub together. All operations are safe to call from
//! any number of connection threads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::alert::{Alert, AlertDispatcher, ALERT_JPEG_QUALITY};
use crate::config::{DetectionSettings, HubConfig, SettingsHandle};
use crate::detect::{ModelFactory, MotionEngine};
use crate::error::{AdmissionError, IngestError};
use crate::frame::{DecodedFrame, FrameDecoder};
use crate::governor::{AlertGovernor, GovernorPolicy, SuppressReason, Verdict};
use crate::hub::{BroadcastHub, VIEWERS_TOPIC};
use crate::protocol::{DeviceSnapshot, StatsSnapshot};
use crate::registry::{Device, DeviceMetadata, DeviceRegistry, OriginPolicy};
use crate::session::{SessionInfo, SessionManager};
use crate::storage::{source_label, AlertStore, ReferenceFrame, ReferenceSampler};

const REFERENCE_QUEUE_DEPTH: usize = 16;

/// Server-generated id for devices that register without one.
pub fn generate_device_id() -> String {
    format!("device-{}", hex::encode(rand::random::<[u8; 8]>()))
}

#[derive(Default)]
struct HubStats {
    frames_processed: AtomicU64,
    frames_rejected: AtomicU64,
    motion_alerts: AtomicU64,
    reference_frames: AtomicU64,
    detection_faults: AtomicU64,
}

/// Result of one accepted frame.
#[derive(Clone, Debug, PartialEq)]
pub struct IngestOutcome {
    pub frame_count: u64,
    /// `None` when detection is disabled or the frame could not be processed.
    pub motion_fraction: Option<f32>,
    pub alert: Option<Alert>,
}

pub struct MotionHub {
    registry: Arc<DeviceRegistry>,
    sessions: SessionManager,
    decoder: FrameDecoder,
    engine: MotionEngine,
    governor: AlertGovernor,
    dispatcher: AlertDispatcher,
    hub: Arc<BroadcastHub>,
    settings: SettingsHandle,
    sampler: Option<ReferenceSampler>,
    reference_every_n: u64,
    stats: HubStats,
}

impl MotionHub {
    pub fn new(
        config: &HubConfig,
        store: Arc<dyn AlertStore>,
        factory: Arc<dyn ModelFactory>,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new(
            OriginPolicy::new(config.admission.allowed_networks.clone()),
            config.admission.max_connections_per_ip,
        ));
        let hub = Arc::new(BroadcastHub::new());
        let sampler = (config.reference_every_n > 0)
            .then(|| ReferenceSampler::spawn(store.clone(), REFERENCE_QUEUE_DEPTH));
        Self {
            sessions: SessionManager::new(registry.clone()),
            registry,
            decoder: FrameDecoder::new(
                config.admission.max_frame_bytes,
                config.admission.max_frame_dimension,
            ),
            engine: MotionEngine::new(factory),
            governor: AlertGovernor::new(),
            dispatcher: AlertDispatcher::new(store, hub.clone(), config.alert_persist_wait),
            hub,
            settings: SettingsHandle::new(config.detection.clone()),
            sampler,
            reference_every_n: config.reference_every_n,
            stats: HubStats::default(),
        }
    }

    pub fn register(
        &self,
        device_id: &str,
        metadata: DeviceMetadata,
        origin: &str,
    ) -> Result<Device, AdmissionError> {
        self.registry.register(device_id, metadata, origin)
    }

    /// Idempotent. Tears down the session first so no new frame is accepted,
    /// waits for a frame already in flight, drops the device's model and
    /// cooldown state, and only then frees the id for a new registration.
    pub fn unregister(&self, device_id: &str) -> Option<Device> {
        self.close_session(device_id);
        self.forget_device_state(device_id);
        let (removed, stray) = self.sessions.release_device(device_id);
        if let Some(lane) = stray {
            lane.lock().clear_slot();
            self.forget_device_state(device_id);
        }
        removed
    }

    fn forget_device_state(&self, device_id: &str) {
        self.engine.discard(device_id);
        self.governor.forget(device_id);
    }

    pub fn is_registered(&self, device_id: &str) -> bool {
        self.registry.is_registered(device_id)
    }

    pub fn start_stream(&self, device_id: &str) -> Result<SessionInfo, AdmissionError> {
        self.sessions.start_stream(device_id)
    }

    /// Idempotent. The device's model is kept unless `discard_model_on_stop` is set.
    pub fn stop_stream(&self, device_id: &str) -> bool {
        let stopped = self.close_session(device_id);
        if stopped && self.settings.snapshot().discard_model_on_stop {
            self.engine.discard(device_id);
        }
        stopped
    }

    fn close_session(&self, device_id: &str) -> bool {
        match self.sessions.close_stream(device_id) {
            Some(lane) => {
                lane.lock().clear_slot();
                true
            }
            None => false,
        }
    }

    pub fn is_streaming(&self, device_id: &str) -> bool {
        self.sessions.is_streaming(device_id)
    }

    pub fn session_info(&self, device_id: &str) -> Option<SessionInfo> {
        self.sessions.info(device_id)
    }

    /// Accept one encoded frame from a streaming device and run it through
    /// detection and alert governance before returning.
    pub fn ingest(&self, device_id: &str, encoded: &[u8]) -> Result<IngestOutcome, IngestError> {
        let result = self.ingest_frame(device_id, encoded);
        match &result {
            Ok(_) => self.stats.frames_processed.fetch_add(1, Ordering::Relaxed),
            Err(err) => {
                log::debug!("frame from {} rejected: {}", device_id, err);
                self.stats.frames_rejected.fetch_add(1, Ordering::Relaxed)
            }
        };
        result
    }

    /// Count a frame rejected before it reached `ingest` (e.g. bad base64).
    pub fn note_rejected(&self) {
        self.stats.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn ingest_frame(&self, device_id: &str, encoded: &[u8]) -> Result<IngestOutcome, IngestError> {
        let lane = self
            .sessions
            .lane(device_id)
            .ok_or(IngestError::NotStreaming)?;
        self.decoder.check_size(encoded.len())?;

        let mut session = lane.lock();
        if lane.is_closed() {
            return Err(IngestError::NotStreaming);
        }
        let frame = self.decoder.decode(encoded)?;
        let settings = self.settings.snapshot();
        let frame_count = session.record_frame(frame);

        let mut outcome = IngestOutcome {
            frame_count,
            motion_fraction: None,
            alert: None,
        };
        let Some(frame) = session.slot().latest() else {
            return Ok(outcome);
        };

        if self.reference_every_n > 0 && frame_count % self.reference_every_n == 0 {
            self.sample_reference(device_id, frame_count, frame);
        }
        if settings.enabled {
            let (fraction, alert) = self.detect(device_id, frame, &settings);
            outcome.motion_fraction = fraction;
            outcome.alert = alert;
        }
        Ok(outcome)
    }

    fn detect(
        &self,
        device_id: &str,
        frame: &DecodedFrame,
        settings: &DetectionSettings,
    ) -> (Option<f32>, Option<Alert>) {
        let event = match self.engine.process(device_id, frame, settings) {
            Ok(event) => event,
            Err(err) => {
                self.stats.detection_faults.fetch_add(1, Ordering::Relaxed);
                log::warn!("motion detection failed for {}: {}", device_id, err);
                return (None, None);
            }
        };
        match self.governor.evaluate(&event, GovernorPolicy::from(settings)) {
            Verdict::Dispatch => {
                let alert = self.dispatcher.dispatch(&event, frame);
                self.stats.motion_alerts.fetch_add(1, Ordering::Relaxed);
                (Some(event.motion_fraction), Some(alert))
            }
            Verdict::Suppressed(SuppressReason::CoolingDown { remaining }) => {
                log::debug!(
                    "motion on {} suppressed; cooldown has {}ms left",
                    device_id,
                    remaining.as_millis()
                );
                (Some(event.motion_fraction), None)
            }
            Verdict::Suppressed(SuppressReason::NoRegions) => {
                log::debug!(
                    "motion on {} suppressed; no region reached {}px",
                    device_id,
                    settings.min_contour_area
                );
                (Some(event.motion_fraction), None)
            }
            Verdict::Suppressed(SuppressReason::BelowThreshold) => (Some(event.motion_fraction), None),
        }
    }

    fn sample_reference(&self, device_id: &str, frame_number: u64, frame: &DecodedFrame) {
        let Some(sampler) = self.sampler.as_ref() else {
            return;
        };
        let image_jpeg = match frame.encode_jpeg(ALERT_JPEG_QUALITY) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                log::warn!("reference frame {} of {} not encoded: {:#}", frame_number, device_id, err);
                return;
            }
        };
        let queued = sampler.offer(ReferenceFrame {
            source_label: source_label(device_id),
            frame_number,
            captured_at_ms: frame.received_at_ms,
            image_jpeg,
        });
        if queued {
            self.stats.reference_frames.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_motion_detection(&self, enabled: bool) -> anyhow::Result<bool> {
        let settings = self.settings.set_enabled(enabled)?;
        log::info!(
            "motion detection {}",
            if settings.enabled { "enabled" } else { "disabled" }
        );
        Ok(settings.enabled)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut buffered_frame_bytes = 0;
        let devices: Vec<DeviceSnapshot> = self
            .registry
            .devices()
            .into_iter()
            .map(|device| {
                let session = self.sessions.info(&device.id);
                buffered_frame_bytes += session.as_ref().map_or(0, |s| s.buffered_bytes);
                DeviceSnapshot {
                    streaming: session.is_some(),
                    frame_count: session.as_ref().map_or(0, |s| s.frame_count),
                    last_frame_at_ms: session.and_then(|s| s.last_frame_at_ms),
                    device_id: device.id,
                    origin: device.origin,
                    connected_at_ms: device.connected_at_ms,
                    metadata: device.metadata,
                }
            })
            .collect();
        StatsSnapshot {
            total_devices: self.registry.lifetime_registrations(),
            active_devices: devices.len(),
            active_streams: self.sessions.active_count(),
            frames_processed: self.stats.frames_processed.load(Ordering::Relaxed),
            frames_rejected: self.stats.frames_rejected.load(Ordering::Relaxed),
            motion_alerts: self.stats.motion_alerts.load(Ordering::Relaxed),
            reference_frames: self.stats.reference_frames.load(Ordering::Relaxed),
            detection_faults: self.stats.detection_faults.load(Ordering::Relaxed),
            viewers: self.hub.subscriber_count(VIEWERS_TOPIC),
            broadcasts_dropped: self.hub.dropped_total(),
            buffered_frame_bytes,
            motion_detection: self.settings.snapshot().enabled,
            devices,
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &MotionEngine {
        &self.engine
    }

    pub fn max_frame_bytes(&self) -> usize {
        self.decoder.max_bytes()
    }
}
