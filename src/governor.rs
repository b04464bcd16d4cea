//! Alert Governor: threshold and per-device cooldown policy.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::DetectionSettings;
use crate::detect::MotionEvent;
use crate::{lock, DeviceId};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GovernorPolicy {
    pub motion_threshold: f32,
    pub cooldown: Duration,
}

impl From<&DetectionSettings> for GovernorPolicy {
    fn from(settings: &DetectionSettings) -> Self {
        Self {
            motion_threshold: settings.motion_threshold,
            cooldown: settings.cooldown,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verdict {
    Dispatch,
    Suppressed(SuppressReason),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SuppressReason {
    BelowThreshold,
    /// Every region fell under the minimum area.
    NoRegions,
    CoolingDown { remaining: Duration },
}

/// Tracks the last dispatch instant per device. Suppressed events leave the
/// timer untouched.
#[derive(Default)]
pub struct AlertGovernor {
    last_dispatch: Mutex<HashMap<DeviceId, Instant>>,
}

impl AlertGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn evaluate(&self, event: &MotionEvent, policy: GovernorPolicy) -> Verdict {
        if event.motion_fraction <= policy.motion_threshold {
            return Verdict::Suppressed(SuppressReason::BelowThreshold);
        }
        if event.areas.is_empty() {
            return Verdict::Suppressed(SuppressReason::NoRegions);
        }
        let mut last = lock(&self.last_dispatch);
        if let Some(previous) = last.get(&event.device_id) {
            let elapsed = event.observed_at.saturating_duration_since(*previous);
            if elapsed <= policy.cooldown {
                return Verdict::Suppressed(SuppressReason::CoolingDown {
                    remaining: policy.cooldown - elapsed,
                });
            }
        }
        last.insert(event.device_id.clone(), event.observed_at);
        Verdict::Dispatch
    }

    /// Forget a device's cooldown timer.
    pub fn forget(&self, device_id: &str) {
        lock(&self.last_dispatch).remove(device_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::MotionArea;

    fn event(device: &str, fraction: f32, at: Instant) -> MotionEvent {
        MotionEvent {
            device_id: device.to_string(),
            timestamp_ms: 0,
            observed_at: at,
            areas: vec![MotionArea {
                x: 0,
                y: 0,
                width: 40,
                height: 30,
                area: 1200,
            }],
            motion_fraction: fraction,
        }
    }

    fn policy() -> GovernorPolicy {
        GovernorPolicy {
            motion_threshold: 0.02,
            cooldown: Duration::from_secs(5),
        }
    }

    #[test]
    fn below_threshold_is_suppressed() {
        let gov = AlertGovernor::new();
        let t = Instant::now();
        assert_eq!(
            gov.evaluate(&event("cam-1", 0.01, t), policy()),
            Verdict::Suppressed(SuppressReason::BelowThreshold)
        );
        assert_eq!(
            gov.evaluate(&event("cam-1", 0.02, t), policy()),
            Verdict::Suppressed(SuppressReason::BelowThreshold)
        );
    }

    #[test]
    fn cooldown_allows_one_alert_per_window() {
        let gov = AlertGovernor::new();
        let t = Instant::now();
        let eps = Duration::from_millis(100);

        assert_eq!(gov.evaluate(&event("cam-1", 0.05, t), policy()), Verdict::Dispatch);
        assert!(matches!(
            gov.evaluate(&event("cam-1", 0.05, t + eps), policy()),
            Verdict::Suppressed(SuppressReason::CoolingDown { .. })
        ));
        assert_eq!(
            gov.evaluate(&event("cam-1", 0.05, t + Duration::from_secs(5) + eps), policy()),
            Verdict::Dispatch
        );
    }

    #[test]
    fn suppressed_events_do_not_reset_timer() {
        let gov = AlertGovernor::new();
        let t = Instant::now();
        assert_eq!(gov.evaluate(&event("cam-1", 0.5, t), policy()), Verdict::Dispatch);
        for s in 1..5 {
            let verdict = gov.evaluate(&event("cam-1", 0.5, t + Duration::from_secs(s)), policy());
            assert!(matches!(verdict, Verdict::Suppressed(_)));
        }
        assert_eq!(
            gov.evaluate(&event("cam-1", 0.5, t + Duration::from_millis(5_001)), policy()),
            Verdict::Dispatch
        );
    }

    #[test]
    fn event_without_regions_is_suppressed_and_keeps_timer() {
        let gov = AlertGovernor::new();
        let t = Instant::now();
        let mut filtered = event("cam-1", 0.9, t);
        filtered.areas.clear();
        assert_eq!(
            gov.evaluate(&filtered, policy()),
            Verdict::Suppressed(SuppressReason::NoRegions)
        );
        // No cooldown was started by the suppressed event.
        assert_eq!(
            gov.evaluate(&event("cam-1", 0.9, t + Duration::from_millis(10)), policy()),
            Verdict::Dispatch
        );
    }

    #[test]
    fn cooldown_is_per_device() {
        let gov = AlertGovernor::new();
        let t = Instant::now();
        assert_eq!(gov.evaluate(&event("cam-1", 0.5, t), policy()), Verdict::Dispatch);
        assert_eq!(gov.evaluate(&event("cam-2", 0.5, t), policy()), Verdict::Dispatch);
        gov.forget("cam-1");
        assert_eq!(gov.evaluate(&event("cam-1", 0.5, t), policy()), Verdict::Dispatch);
    }
}
