//! Gap-free sequential playback of speech fragments with barge-in support.

use crate::audio::{lock, Completion, OutputDevice, VoiceId};
use crate::config::PlaybackConfig;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;

/// A decoded speech fragment waiting to be scheduled.
#[derive(Debug, Clone)]
pub struct PlaybackItem {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl PlaybackItem {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Duration in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Where and when a fragment was placed on the device clock.
#[derive(Debug)]
pub struct ScheduledFragment {
    pub id: VoiceId,
    pub start_time: f64,
    pub duration: f64,
    /// Resolves once the device finishes or stops the fragment
    pub completion: oneshot::Receiver<Completion>,
}

/// Next free start time. Only ever touched under the scheduler lock.
#[derive(Debug, Default)]
struct PlaybackClock {
    next_start_time: f64,
}

impl PlaybackClock {
    fn reserve(&mut self, earliest: f64, duration: f64) -> f64 {
        let start = earliest.max(self.next_start_time);
        self.next_start_time = start + duration;
        start
    }

    fn reset(&mut self) {
        self.next_start_time = 0.0;
    }
}

struct SchedulerState {
    device: Option<Arc<dyn OutputDevice>>,
    clock: PlaybackClock,
    in_flight: HashSet<VoiceId>,
    next_id: VoiceId,
}

/// Serializes fragments into continuous output on one device.
///
/// Enqueue, interrupt and teardown share a single lock, so an interrupt is
/// fully applied before any later enqueue computes its start time.
pub struct PlaybackScheduler {
    state: Arc<Mutex<SchedulerState>>,
    min_lead: f64,
}

impl PlaybackScheduler {
    pub fn new(config: &PlaybackConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SchedulerState {
                device: None,
                clock: PlaybackClock::default(),
                in_flight: HashSet::new(),
                next_id: 1,
            })),
            min_lead: config.min_lead.as_secs_f64(),
        }
    }

    /// Start scheduling onto `device` with a fresh clock.
    pub fn attach(&self, device: Arc<dyn OutputDevice>) {
        let mut state = lock(&self.state);
        Self::flush(&mut state);
        state.device = Some(device);
    }

    pub fn has_device(&self) -> bool {
        lock(&self.state).device.is_some()
    }

    /// Number of fragments scheduled and not yet completed.
    pub fn in_flight(&self) -> usize {
        lock(&self.state).in_flight.len()
    }

    /// Schedule `item` right after everything already queued, but never
    /// sooner than `now + min_lead`. Dropped when no device is attached.
    pub fn enqueue(&self, item: PlaybackItem) -> Option<ScheduledFragment> {
        let mut state = lock(&self.state);
        let Some(device) = state.device.clone() else {
            log::debug!(
                "🔊 Dropping {:.3}s fragment: no output device",
                item.duration()
            );
            return None;
        };

        let id = state.next_id;
        state.next_id += 1;

        let duration = item.duration();
        let now = device.current_time();
        let previous = state.clock.next_start_time;
        let start_time = state.clock.reserve(now + self.min_lead, duration);

        let (done_tx, done_rx) = oneshot::channel();
        let weak: Weak<Mutex<SchedulerState>> = Arc::downgrade(&self.state);
        let on_complete = Box::new(move |completion: Completion| {
            if let Some(state) = weak.upgrade() {
                lock(&state).in_flight.remove(&id);
            }
            let _ = done_tx.send(completion);
        });

        match device.schedule(id, item.samples, item.sample_rate, start_time, on_complete) {
            Ok(()) => {
                state.in_flight.insert(id);
                log::trace!(
                    "🔊 Fragment {} at {:.3}s for {:.3}s (now {:.3}s)",
                    id,
                    start_time,
                    duration,
                    now
                );
                Some(ScheduledFragment {
                    id,
                    start_time,
                    duration,
                    completion: done_rx,
                })
            }
            Err(e) => {
                log::warn!("🔊 Failed to schedule fragment {}: {}", id, e);
                state.clock.next_start_time = previous;
                None
            }
        }
    }

    /// Stop everything in flight and restart the schedule from zero.
    pub fn interrupt(&self) {
        let mut state = lock(&self.state);
        let stopped = state.in_flight.len();
        Self::flush(&mut state);
        if stopped > 0 {
            log::debug!("🔊 Interrupted {} fragment(s)", stopped);
        }
    }

    /// Interrupt and release the output device.
    pub fn teardown(&self) {
        let device = {
            let mut state = lock(&self.state);
            Self::flush(&mut state);
            state.device.take()
        };
        if let Some(device) = device {
            device.close();
        }
    }

    fn flush(state: &mut SchedulerState) {
        let ids: Vec<VoiceId> = state.in_flight.drain().collect();
        if let Some(device) = &state.device {
            for id in ids {
                device.stop(id);
            }
        }
        state.clock.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_reserve_and_reset() {
        let mut clock = PlaybackClock::default();
        assert_eq!(clock.reserve(0.05, 0.5), 0.05);
        assert_eq!(clock.reserve(0.06, 0.3), 0.55);
        // A late arrival starts at "now" rather than in the past
        assert_eq!(clock.reserve(2.0, 0.1), 2.0);
        clock.reset();
        assert_eq!(clock.next_start_time, 0.0);
    }

    #[test]
    fn test_item_duration() {
        let item = PlaybackItem::new(vec![0.0; 12000], 24000);
        assert!((item.duration() - 0.5).abs() < 1e-9);
        assert_eq!(PlaybackItem::new(vec![0.0; 10], 0).duration(), 0.0);
    }

    #[test]
    fn test_enqueue_without_device_drops() {
        let scheduler = PlaybackScheduler::new(&PlaybackConfig::default());
        assert!(scheduler
            .enqueue(PlaybackItem::new(vec![0.0; 240], 24000))
            .is_none());
        assert_eq!(scheduler.in_flight(), 0);
        // Teardown without a device is a no-op
        scheduler.teardown();
        scheduler.interrupt();
    }
}
