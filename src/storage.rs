use rusqlite::{params, Connection, OpenFlags};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::PersistenceError;
use crate::lock;

/// Alert handed to the persistence collaborator.
#[derive(Clone, Debug, PartialEq)]
pub struct AlertRecord {
    pub timestamp_ms: u64,
    /// Annotated JPEG.
    pub image_jpeg: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// `wireless-<device id>`.
    pub source_label: String,
    pub motion_fraction: f32,
    pub area_count: usize,
}

/// Periodic non-alert frame. Stored as its own record type, never as an alert.
#[derive(Clone, Debug, PartialEq)]
pub struct ReferenceFrame {
    pub source_label: String,
    pub frame_number: u64,
    pub captured_at_ms: u64,
    pub image_jpeg: Vec<u8>,
}

/// Persistence collaborator. Called concurrently from every device pipeline.
pub trait AlertStore: Send + Sync {
    /// Persist an alert and its image. Returns the store-assigned alert id.
    fn save_alert_with_image(&self, alert: &AlertRecord) -> Result<i64, PersistenceError>;

    fn save_reference_frame(&self, frame: &ReferenceFrame) -> Result<(), PersistenceError>;
}

pub fn source_label(device_id: &str) -> String {
    format!("wireless-{}", device_id)
}

pub struct SqliteAlertStore {
    conn: Mutex<Connection>,
}

impl SqliteAlertStore {
    pub fn open(db_path: &str) -> Result<Self, PersistenceError> {
        let conn = if db_path.starts_with("file:") {
            Connection::open_with_flags(
                db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI,
            )?
        } else {
            Connection::open(db_path)?
        };
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), PersistenceError> {
        lock(&self.conn).execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS alerts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_at_ms INTEGER NOT NULL,
              camera_source TEXT NOT NULL,
              alert_type TEXT NOT NULL DEFAULT 'motion',
              motion_confidence REAL NOT NULL,
              motion_areas_count INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alert_images (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              alert_id INTEGER NOT NULL REFERENCES alerts(id) ON DELETE CASCADE,
              image_jpeg BLOB NOT NULL,
              width INTEGER NOT NULL,
              height INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reference_frames (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              camera_source TEXT NOT NULL,
              frame_number INTEGER NOT NULL,
              captured_at_ms INTEGER NOT NULL,
              image_jpeg BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at_ms);
            CREATE INDEX IF NOT EXISTS idx_reference_source ON reference_frames(camera_source, captured_at_ms);
            "#,
        )?;
        Ok(())
    }

    pub fn alert_count(&self) -> Result<u64, PersistenceError> {
        let count: i64 = lock(&self.conn).query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn reference_count(&self) -> Result<u64, PersistenceError> {
        let count: i64 = lock(&self.conn).query_row("SELECT COUNT(*) FROM reference_frames", [], |row| {
            row.get(0)
        })?;
        Ok(count as u64)
    }
}

impl AlertStore for SqliteAlertStore {
    fn save_alert_with_image(&self, alert: &AlertRecord) -> Result<i64, PersistenceError> {
        let created_at = i64::try_from(alert.timestamp_ms)
            .map_err(|_| PersistenceError::Unavailable("timestamp exceeds i64 range".into()))?;
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO alerts(created_at_ms, camera_source, motion_confidence, motion_areas_count)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                created_at,
                alert.source_label,
                alert.motion_fraction as f64,
                alert.area_count as i64
            ],
        )?;
        let alert_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO alert_images(alert_id, image_jpeg, width, height) VALUES (?1, ?2, ?3, ?4)",
            params![alert_id, alert.image_jpeg, alert.width, alert.height],
        )?;
        tx.commit()?;
        Ok(alert_id)
    }

    fn save_reference_frame(&self, frame: &ReferenceFrame) -> Result<(), PersistenceError> {
        let captured_at = i64::try_from(frame.captured_at_ms)
            .map_err(|_| PersistenceError::Unavailable("timestamp exceeds i64 range".into()))?;
        let frame_number = i64::try_from(frame.frame_number)
            .map_err(|_| PersistenceError::Unavailable("frame number exceeds i64 range".into()))?;
        lock(&self.conn).execute(
            r#"
            INSERT INTO reference_frames(camera_source, frame_number, captured_at_ms, image_jpeg)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![frame.source_label, frame_number, captured_at, frame.image_jpeg],
        )?;
        Ok(())
    }
}

/// In-memory store for tests, with a switch to simulate an outage.
#[derive(Default)]
pub struct InMemoryAlertStore {
    alerts: Mutex<Vec<(i64, AlertRecord)>>,
    references: Mutex<Vec<ReferenceFrame>>,
    next_id: AtomicI64,
    failing: AtomicBool,
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn alerts(&self) -> Vec<(i64, AlertRecord)> {
        lock(&self.alerts).clone()
    }

    pub fn references(&self) -> Vec<ReferenceFrame> {
        lock(&self.references).clone()
    }

    fn check_available(&self) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable("simulated outage".into()));
        }
        Ok(())
    }
}

impl AlertStore for InMemoryAlertStore {
    fn save_alert_with_image(&self, alert: &AlertRecord) -> Result<i64, PersistenceError> {
        self.check_available()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.alerts).push((id, alert.clone()));
        Ok(id)
    }

    fn save_reference_frame(&self, frame: &ReferenceFrame) -> Result<(), PersistenceError> {
        self.check_available()?;
        lock(&self.references).push(frame.clone());
        Ok(())
    }
}

/// Background writer for reference frames.
///
/// `offer` never blocks: when the queue is full the frame is dropped.
pub struct ReferenceSampler {
    tx: Option<SyncSender<ReferenceFrame>>,
    join: Option<JoinHandle<()>>,
}

impl ReferenceSampler {
    pub fn spawn(store: Arc<dyn AlertStore>, depth: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel::<ReferenceFrame>(depth.max(1));
        let join = std::thread::Builder::new()
            .name("reference-sampler".into())
            .spawn(move || {
                for frame in rx {
                    if let Err(err) = store.save_reference_frame(&frame) {
                        log::error!(
                            "reference frame {} of {} not saved: {}",
                            frame.frame_number,
                            frame.source_label,
                            err
                        );
                    }
                }
            });
        let join = match join {
            Ok(join) => Some(join),
            Err(err) => {
                log::error!("reference sampler thread failed to start: {}", err);
                None
            }
        };
        Self { tx: Some(tx), join }
    }

    pub fn offer(&self, frame: ReferenceFrame) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                log::debug!(
                    "reference queue full; dropping frame {} of {}",
                    frame.frame_number,
                    frame.source_label
                );
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

impl Drop for ReferenceSampler {
    fn drop(&mut self) {
        // Closing the queue lets the worker drain and exit.
        self.tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

type AlertJob = (AlertRecord, SyncSender<Result<i64, PersistenceError>>);

/// Background writer for alerts.
///
/// Saves run on one worker thread, so a slow store never holds a device lane
/// for longer than the caller's wait.
pub struct AlertWriter {
    tx: Option<SyncSender<AlertJob>>,
    join: Option<JoinHandle<()>>,
}

impl AlertWriter {
    pub fn spawn(store: Arc<dyn AlertStore>, depth: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel::<AlertJob>(depth.max(1));
        let join = std::thread::Builder::new()
            .name("alert-writer".into())
            .spawn(move || {
                for (record, reply) in rx {
                    let result = store.save_alert_with_image(&record);
                    // The caller stopped waiting; report the late result here.
                    if let Err(unsent) = reply.send(result) {
                        match unsent.0 {
                            Ok(id) => log::info!(
                                "alert {} for {} stored after broadcast",
                                id,
                                record.source_label
                            ),
                            Err(err) => log::error!(
                                "alert for {} not persisted: {}",
                                record.source_label,
                                err
                            ),
                        }
                    }
                }
            });
        let join = match join {
            Ok(join) => Some(join),
            Err(err) => {
                log::error!("alert writer thread failed to start: {}", err);
                None
            }
        };
        Self { tx: Some(tx), join }
    }

    /// Queue `record` and wait up to `wait` for its id. Never blocks on a
    /// full queue.
    pub fn save(&self, record: AlertRecord, wait: Duration) -> Result<i64, PersistenceError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| PersistenceError::Unavailable("alert writer stopped".into()))?;
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        match tx.try_send((record, reply_tx)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(PersistenceError::Unavailable("alert queue full".into()))
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(PersistenceError::Unavailable("alert writer stopped".into()))
            }
        }
        match reply_rx.recv_timeout(wait) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(PersistenceError::Pending(wait)),
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                Err(PersistenceError::Unavailable("alert writer stopped".into()))
            }
        }
    }
}

impl Drop for AlertWriter {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(device: &str) -> AlertRecord {
        AlertRecord {
            timestamp_ms: 1_700_000_000_000,
            image_jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
            width: 4,
            height: 2,
            source_label: source_label(device),
            motion_fraction: 0.25,
            area_count: 3,
        }
    }

    #[test]
    fn sqlite_store_assigns_increasing_ids() {
        let store = SqliteAlertStore::open_in_memory().unwrap();
        let a = store.save_alert_with_image(&record("cam-1")).unwrap();
        let b = store.save_alert_with_image(&record("cam-2")).unwrap();
        assert!(b > a);
        assert_eq!(store.alert_count().unwrap(), 2);
        assert_eq!(store.reference_count().unwrap(), 0);
    }

    #[test]
    fn sqlite_store_keeps_reference_frames_separate() {
        let store = SqliteAlertStore::open_in_memory().unwrap();
        store
            .save_reference_frame(&ReferenceFrame {
                source_label: source_label("cam-1"),
                frame_number: 30,
                captured_at_ms: 1,
                image_jpeg: vec![1, 2, 3],
            })
            .unwrap();
        assert_eq!(store.reference_count().unwrap(), 1);
        assert_eq!(store.alert_count().unwrap(), 0);
    }

    #[test]
    fn in_memory_store_can_fail() {
        let store = InMemoryAlertStore::new();
        store.set_failing(true);
        assert!(store.save_alert_with_image(&record("cam-1")).is_err());
        store.set_failing(false);
        assert_eq!(store.save_alert_with_image(&record("cam-1")).unwrap(), 1);
    }

    #[test]
    fn sampler_drains_on_drop() {
        let store = Arc::new(InMemoryAlertStore::new());
        let sampler = ReferenceSampler::spawn(store.clone(), 8);
        for n in 1..=3 {
            assert!(sampler.offer(ReferenceFrame {
                source_label: source_label("cam-1"),
                frame_number: n * 30,
                captured_at_ms: n,
                image_jpeg: vec![0],
            }));
        }
        drop(sampler);
        assert_eq!(store.references().len(), 3);
    }

    struct SlowStore {
        inner: InMemoryAlertStore,
        delay: Duration,
    }

    impl AlertStore for SlowStore {
        fn save_alert_with_image(&self, alert: &AlertRecord) -> Result<i64, PersistenceError> {
            std::thread::sleep(self.delay);
            self.inner.save_alert_with_image(alert)
        }

        fn save_reference_frame(&self, frame: &ReferenceFrame) -> Result<(), PersistenceError> {
            self.inner.save_reference_frame(frame)
        }
    }

    #[test]
    fn alert_writer_returns_id_from_a_fast_store() {
        let store = Arc::new(InMemoryAlertStore::new());
        let writer = AlertWriter::spawn(store.clone(), 4);
        let id = writer
            .save(record("cam-1"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(store.alerts().len(), 1);
    }

    #[test]
    fn alert_writer_stops_waiting_on_a_slow_store_but_still_saves() {
        let store = Arc::new(SlowStore {
            inner: InMemoryAlertStore::new(),
            delay: Duration::from_millis(300),
        });
        let writer = AlertWriter::spawn(store.clone(), 4);
        let started = std::time::Instant::now();
        let err = writer
            .save(record("cam-1"), Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Pending(_)));
        assert!(started.elapsed() < Duration::from_millis(250));

        drop(writer);
        assert_eq!(store.inner.alerts().len(), 1);
    }
}
