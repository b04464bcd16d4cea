//! Alert construction: annotate the triggering frame, persist it, and notify viewers.

use image::{Rgb, RgbImage};
use std::sync::Arc;
use std::time::Duration;

use crate::detect::{MotionArea, MotionEvent};
use crate::frame::{encode_jpeg, DecodedFrame};
use crate::hub::{BroadcastHub, DeliveryReport, VIEWERS_TOPIC};
use crate::protocol::{MotionAlertEvent, ServerMessage};
use crate::error::PersistenceError;
use crate::storage::{source_label, AlertRecord, AlertStore, AlertWriter};
use crate::DeviceId;

const REGION_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const REGION_THICKNESS: u32 = 2;
const BORDER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BORDER_THICKNESS: u32 = 4;
pub const ALERT_JPEG_QUALITY: u8 = 85;
const ALERT_QUEUE_DEPTH: usize = 64;

/// Outcome of one dispatched alert.
#[derive(Clone, Debug, PartialEq)]
pub struct Alert {
    pub device_id: DeviceId,
    pub timestamp_ms: u64,
    pub area_count: usize,
    pub motion_fraction: f32,
    /// `None` when the image could not be encoded or stored in time.
    pub alert_id: Option<i64>,
    pub delivery: DeliveryReport,
}

/// Draw every region as a green box and frame the whole image in red.
pub fn render_alert_image(frame: &DecodedFrame, areas: &[MotionArea]) -> Option<RgbImage> {
    let mut image = frame.to_rgb_image()?;
    for area in areas {
        draw_rect(
            &mut image,
            area.x,
            area.y,
            area.width,
            area.height,
            REGION_THICKNESS,
            REGION_COLOR,
        );
    }
    let (w, h) = image.dimensions();
    draw_rect(&mut image, 0, 0, w, h, BORDER_THICKNESS, BORDER_COLOR);
    Some(image)
}

fn draw_rect(image: &mut RgbImage, x: u32, y: u32, width: u32, height: u32, thickness: u32, color: Rgb<u8>) {
    let (img_w, img_h) = image.dimensions();
    let x1 = x.saturating_add(width).min(img_w);
    let y1 = y.saturating_add(height).min(img_h);
    if x >= x1 || y >= y1 {
        return;
    }
    for py in y..y1 {
        for px in x..x1 {
            let on_edge = px < x + thickness
                || py < y + thickness
                || px + thickness >= x1
                || py + thickness >= y1;
            if on_edge {
                image.put_pixel(px, py, color);
            }
        }
    }
}

pub struct AlertDispatcher {
    writer: AlertWriter,
    persist_wait: Duration,
    hub: Arc<BroadcastHub>,
}

impl AlertDispatcher {
    /// `persist_wait` bounds how long a dispatch waits for the store to
    /// return an alert id before broadcasting without one.
    pub fn new(store: Arc<dyn AlertStore>, hub: Arc<BroadcastHub>, persist_wait: Duration) -> Self {
        Self {
            writer: AlertWriter::spawn(store, ALERT_QUEUE_DEPTH),
            persist_wait,
            hub,
        }
    }

    /// Persist and broadcast one alert.
    ///
    /// Storage failures are logged; viewers are notified regardless.
    pub fn dispatch(&self, event: &MotionEvent, frame: &DecodedFrame) -> Alert {
        let alert_id = self.persist(event, frame);
        let delivery = self.hub.publish(
            VIEWERS_TOPIC,
            ServerMessage::MotionAlert(MotionAlertEvent {
                device_id: event.device_id.clone(),
                timestamp_ms: event.timestamp_ms,
                area_count: event.area_count(),
                motion_fraction: event.motion_fraction,
                alert_id,
            }),
        );
        log::info!(
            "motion alert for {}: {:.2}% of frame, {} region(s), delivered to {} viewer(s)",
            event.device_id,
            event.motion_fraction * 100.0,
            event.area_count(),
            delivery.delivered
        );
        Alert {
            device_id: event.device_id.clone(),
            timestamp_ms: event.timestamp_ms,
            area_count: event.area_count(),
            motion_fraction: event.motion_fraction,
            alert_id,
            delivery,
        }
    }

    fn persist(&self, event: &MotionEvent, frame: &DecodedFrame) -> Option<i64> {
        let image = match render_alert_image(frame, &event.areas) {
            Some(image) => image,
            None => {
                log::error!("alert image for {} could not be rendered", event.device_id);
                return None;
            }
        };
        let jpeg = match encode_jpeg(&image, ALERT_JPEG_QUALITY) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                log::error!("alert image for {} not encoded: {:#}", event.device_id, err);
                return None;
            }
        };
        let record = AlertRecord {
            timestamp_ms: event.timestamp_ms,
            image_jpeg: jpeg,
            width: frame.width,
            height: frame.height,
            source_label: source_label(&event.device_id),
            motion_fraction: event.motion_fraction,
            area_count: event.area_count(),
        };
        match self.writer.save(record, self.persist_wait) {
            Ok(id) => Some(id),
            Err(err @ PersistenceError::Pending(_)) => {
                log::warn!("alert for {} broadcast before storage: {}", event.device_id, err);
                None
            }
            Err(err) => {
                log::error!("alert for {} not persisted: {}", event.device_id, err);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryAlertStore;
    use std::sync::mpsc;

    fn frame(width: u32, height: u32) -> DecodedFrame {
        DecodedFrame::from_rgb(vec![128; (width * height * 3) as usize], width, height)
    }

    fn event(device: &str, frame: &DecodedFrame) -> MotionEvent {
        MotionEvent {
            device_id: device.to_string(),
            timestamp_ms: frame.received_at_ms,
            observed_at: frame.received(),
            areas: vec![MotionArea {
                x: 10,
                y: 10,
                width: 8,
                height: 8,
                area: 64,
            }],
            motion_fraction: 0.05,
        }
    }

    #[test]
    fn render_draws_region_and_border() {
        let frame = frame(32, 32);
        let image = render_alert_image(&frame, &event("cam-1", &frame).areas).unwrap();
        assert_eq!(*image.get_pixel(0, 0), BORDER_COLOR);
        assert_eq!(*image.get_pixel(31, 31), BORDER_COLOR);
        assert_eq!(*image.get_pixel(10, 10), REGION_COLOR);
        assert_eq!(*image.get_pixel(17, 17), REGION_COLOR);
        assert_eq!(*image.get_pixel(14, 14), Rgb([128, 128, 128]));
    }

    #[test]
    fn region_outside_frame_is_clipped() {
        let frame = frame(16, 16);
        let areas = [MotionArea {
            x: 12,
            y: 12,
            width: 40,
            height: 40,
            area: 16,
        }];
        let image = render_alert_image(&frame, &areas).unwrap();
        assert_eq!(image.dimensions(), (16, 16));
    }

    #[test]
    fn dispatch_persists_and_notifies_viewers() {
        let store = Arc::new(InMemoryAlertStore::new());
        let hub = Arc::new(BroadcastHub::new());
        let (tx, rx) = mpsc::sync_channel(4);
        hub.attach(1, tx);
        hub.subscribe(VIEWERS_TOPIC, 1);
        let dispatcher = AlertDispatcher::new(store.clone(), hub, Duration::from_secs(5));

        let frame = frame(32, 32);
        let alert = dispatcher.dispatch(&event("cam-1", &frame), &frame);
        assert_eq!(alert.alert_id, Some(1));
        assert_eq!(alert.delivery.delivered, 1);

        let saved = store.alerts();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].1.source_label, "wireless-cam-1");
        assert_eq!(&saved[0].1.image_jpeg[..2], &[0xFF, 0xD8]);

        match rx.try_recv().unwrap().as_ref() {
            ServerMessage::MotionAlert(ev) => {
                assert_eq!(ev.device_id, "cam-1");
                assert_eq!(ev.area_count, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn storage_failure_still_notifies_viewers() {
        let store = Arc::new(InMemoryAlertStore::new());
        store.set_failing(true);
        let hub = Arc::new(BroadcastHub::new());
        let (tx, rx) = mpsc::sync_channel(4);
        hub.attach(1, tx);
        hub.subscribe(VIEWERS_TOPIC, 1);
        let dispatcher = AlertDispatcher::new(store, hub, Duration::from_secs(5));

        let frame = frame(16, 16);
        let alert = dispatcher.dispatch(&event("cam-1", &frame), &frame);
        assert_eq!(alert.alert_id, None);
        assert!(rx.try_recv().is_ok());
    }
}
