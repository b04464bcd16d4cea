//! Session Manager: per-device streaming state.
//!
//! Each streaming device owns one `StreamLane`. The lane's mutex is held for
//! the whole ingest -> detect -> govern pass of a frame, which serializes
//! frames of one device without a queue. Different devices never share a lane.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::AdmissionError;
use crate::frame::{DecodedFrame, FrameSlot};
use crate::registry::{Device, DeviceRegistry};
use crate::{lock, now_ms, DeviceId};

pub struct Session {
    pub started_at_ms: u64,
    pub frame_count: u64,
    pub last_frame_at_ms: Option<u64>,
    slot: FrameSlot,
}

impl Session {
    fn new() -> Self {
        Self {
            started_at_ms: now_ms(),
            frame_count: 0,
            last_frame_at_ms: None,
            slot: FrameSlot::new(),
        }
    }

    /// Overwrite the frame slot and advance the counters. Returns the new frame count.
    pub fn record_frame(&mut self, frame: DecodedFrame) -> u64 {
        self.last_frame_at_ms = Some(frame.received_at_ms);
        self.slot.store(frame);
        self.frame_count += 1;
        self.frame_count
    }

    pub fn slot(&self) -> &FrameSlot {
        &self.slot
    }

    pub fn clear_slot(&mut self) {
        self.slot.clear();
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            started_at_ms: self.started_at_ms,
            frame_count: self.frame_count,
            last_frame_at_ms: self.last_frame_at_ms,
            buffered_bytes: self.slot.memory_bytes(),
        }
    }
}

/// Copy of a session's counters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub started_at_ms: u64,
    pub frame_count: u64,
    pub last_frame_at_ms: Option<u64>,
    pub buffered_bytes: usize,
}

/// Per-device processing lane.
pub struct StreamLane {
    closed: AtomicBool,
    session: Mutex<Session>,
}

impl StreamLane {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            session: Mutex::new(Session::new()),
        }
    }

    /// Lock the lane. Callers must check `is_closed()` after acquiring it.
    pub fn lock(&self) -> MutexGuard<'_, Session> {
        lock(&self.session)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct SessionManager {
    registry: Arc<DeviceRegistry>,
    lanes: Mutex<HashMap<DeviceId, Arc<StreamLane>>>,
}

impl SessionManager {
    pub fn new(registry: Arc<DeviceRegistry>) -> Self {
        Self {
            registry,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Start streaming for a registered device. Starting an already streaming
    /// device keeps the existing session and its counters.
    pub fn start_stream(&self, device_id: &str) -> Result<SessionInfo, AdmissionError> {
        // Registration is checked under the lane table lock, so an unregister
        // that lands after this check will find and close the new lane.
        let mut lanes = lock(&self.lanes);
        if !self.registry.is_registered(device_id) {
            return Err(AdmissionError::NotRegistered);
        }
        let lane = lanes
            .entry(device_id.to_string())
            .or_insert_with(|| {
                log::info!("stream started: {}", device_id);
                Arc::new(StreamLane::new())
            })
            .clone();
        drop(lanes);
        let info = lane.lock().info();
        Ok(info)
    }

    /// Tear down the session. Unknown ids are a no-op.
    ///
    /// A frame already being processed finishes; no new frame is accepted.
    /// The closed lane is handed back so the caller can wait out that frame
    /// by locking it.
    pub fn close_stream(&self, device_id: &str) -> Option<Arc<StreamLane>> {
        let lane = lock(&self.lanes).remove(device_id)?;
        lane.close();
        log::info!("stream stopped: {}", device_id);
        Some(lane)
    }

    /// Remove the registry entry under the lane table lock, so no stream can
    /// start for the id in between. Also closes and returns a lane that was
    /// started after the caller's last `close_stream`.
    pub fn release_device(&self, device_id: &str) -> (Option<Device>, Option<Arc<StreamLane>>) {
        let mut lanes = lock(&self.lanes);
        let removed = self.registry.unregister(device_id);
        let stray = lanes.remove(device_id);
        drop(lanes);
        if let Some(lane) = &stray {
            lane.close();
        }
        (removed, stray)
    }

    pub fn is_streaming(&self, device_id: &str) -> bool {
        lock(&self.lanes).contains_key(device_id)
    }

    pub fn lane(&self, device_id: &str) -> Option<Arc<StreamLane>> {
        lock(&self.lanes).get(device_id).cloned()
    }

    pub fn info(&self, device_id: &str) -> Option<SessionInfo> {
        let lane = self.lane(device_id)?;
        let info = lane.lock().info();
        Some(info)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.lanes).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DeviceMetadata, OriginPolicy};

    fn manager() -> (Arc<DeviceRegistry>, SessionManager) {
        let registry = Arc::new(DeviceRegistry::new(
            OriginPolicy::new(vec!["192.168.".to_string()]),
            5,
        ));
        let sessions = SessionManager::new(registry.clone());
        (registry, sessions)
    }

    #[test]
    fn start_requires_registration() {
        let (_registry, sessions) = manager();
        assert_eq!(
            sessions.start_stream("ghost").unwrap_err(),
            AdmissionError::NotRegistered
        );
        assert!(!sessions.is_streaming("ghost"));
    }

    #[test]
    fn start_stop_cycle() {
        let (registry, sessions) = manager();
        registry
            .register("cam-1", DeviceMetadata::new(), "192.168.0.2")
            .unwrap();
        let info = sessions.start_stream("cam-1").unwrap();
        assert_eq!(info.frame_count, 0);
        assert!(sessions.is_streaming("cam-1"));
        assert_eq!(sessions.active_count(), 1);

        let lane = sessions.lane("cam-1").unwrap();
        assert!(sessions.close_stream("cam-1").is_some());
        assert!(lane.is_closed());
        assert!(!sessions.is_streaming("cam-1"));
        assert!(sessions.close_stream("cam-1").is_none());
    }

    #[test]
    fn release_removes_registration_and_any_lane() {
        let (registry, sessions) = manager();
        registry
            .register("cam-1", DeviceMetadata::new(), "192.168.0.2")
            .unwrap();
        sessions.start_stream("cam-1").unwrap();
        let lane = sessions.lane("cam-1").unwrap();

        let (removed, stray) = sessions.release_device("cam-1");
        assert_eq!(removed.unwrap().id, "cam-1");
        assert!(stray.is_some());
        assert!(lane.is_closed());
        assert!(!registry.is_registered("cam-1"));
        assert_eq!(
            sessions.start_stream("cam-1").unwrap_err(),
            AdmissionError::NotRegistered
        );

        let (removed, stray) = sessions.release_device("cam-1");
        assert!(removed.is_none() && stray.is_none());
    }

    #[test]
    fn restart_keeps_running_session() {
        let (registry, sessions) = manager();
        registry
            .register("cam-1", DeviceMetadata::new(), "192.168.0.2")
            .unwrap();
        sessions.start_stream("cam-1").unwrap();
        let lane = sessions.lane("cam-1").unwrap();
        lane.lock().frame_count = 7;
        let info = sessions.start_stream("cam-1").unwrap();
        assert_eq!(info.frame_count, 7);
    }
}
