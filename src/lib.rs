//! Motion Hub
//!
//! Ingests live frames pushed by untrusted client devices acting as ad-hoc
//! security cameras, detects motion independently per device, and fans alerts
//! out to subscribed viewers while handing alert frames to a persistence
//! collaborator.
//!
//! # Pipeline
//!
//! connection -> `registry` (admission) -> `session` (stream state) ->
//! `frame` (decode, depth-one slot) -> `detect` (per-device background model)
//! -> `governor` (threshold + cooldown) -> `alert` (persist + notify) -> `hub`
//! (viewer fan-out).
//!
//! # Module Structure
//!
//! - `pipeline`: `MotionHub`, the facade tying the stages together
//! - `server`: TCP front end speaking the `protocol` (NDJSON) messages
//! - `storage`: `AlertStore` collaborator (SQLite, in-memory) and reference sampler
//! - `config`: `HubConfig` loading and the runtime `SettingsHandle`
//! - `error`: rejection taxonomy with wire reason codes

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod alert;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod governor;
pub mod hub;
pub mod pipeline;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod storage;

pub use alert::{Alert, AlertDispatcher};
pub use config::{AdmissionSettings, DetectionSettings, HubConfig, SettingsHandle};
pub use detect::{
    AdaptiveBackground, AdaptiveFactory, ModelFactory, MotionArea, MotionEngine, MotionEvent,
    MotionModel, ScriptedFactory,
};
pub use error::{AdmissionError, DetectionError, IngestError, PersistenceError};
pub use frame::{DecodedFrame, FrameDecoder, FrameSlot};
pub use governor::{AlertGovernor, GovernorPolicy, Verdict};
pub use hub::{BroadcastHub, DeliveryReport, VIEWERS_TOPIC};
pub use pipeline::{IngestOutcome, MotionHub};
pub use protocol::{ClientMessage, MotionAlertEvent, ServerMessage, StatsSnapshot};
pub use registry::{Device, DeviceMetadata, DeviceRegistry, MetadataValue, OriginPolicy};
pub use server::{HubServer, ServerConfig, ServerHandle};
pub use session::{SessionInfo, SessionManager};
pub use storage::{AlertRecord, AlertStore, InMemoryAlertStore, ReferenceFrame, SqliteAlertStore};

/// Opaque device identifier, unique among currently registered devices.
pub type DeviceId = String;

/// Wall-clock milliseconds since the Unix epoch. A clock before the epoch reads as 0.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// One device's panicking pipeline must not wedge the shared tables.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
