pub mod analysis;
pub mod capture;
pub mod output;

pub use analysis::{FrameAnalysis, LevelMeter};
pub use capture::{CpalCapture, FrameAssembler};
pub use output::CpalOutput;

use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("No {0} device found")]
    NoDevice(&'static str),

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resampling error: {0}")]
    Resampling(String),

    #[error("Output device is closed")]
    Closed,
}

/// One fixed-length block of mono capture samples.
///
/// The samples are shared so every consumer sees the same frame without
/// copying.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    samples: Arc<[f32]>,
    /// Position of this frame in capture order, starting at 0
    pub sequence: u64,
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sequence: u64) -> Self {
        Self {
            samples: samples.into(),
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Callback run once per captured frame. Must only enqueue work.
pub type FrameCallback = Box<dyn FnMut(&AudioFrame) + Send>;

/// An open microphone.
pub trait CaptureStream: Send {
    /// Register a callback for every frame delivered from now on.
    fn on_frame(&mut self, callback: FrameCallback);

    /// Level feedback for the frames delivered so far.
    fn meter(&self) -> LevelMeter;

    /// Release the device. Safe to call more than once.
    fn close(&mut self);
}

/// How a scheduled voice ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Finished,
    Stopped,
}

pub type VoiceId = u64;

pub type CompletionCallback = Box<dyn FnOnce(Completion) + Send>;

/// A speaker that plays mono buffers at absolute times on its own clock.
///
/// `on_complete` is invoked exactly once per scheduled voice, from the
/// device's own context and never from inside `schedule` or `stop`.
pub trait OutputDevice: Send + Sync {
    /// Device clock in seconds.
    fn current_time(&self) -> f64;

    fn schedule(
        &self,
        id: VoiceId,
        samples: Arc<[f32]>,
        sample_rate: u32,
        start_time: f64,
        on_complete: CompletionCallback,
    ) -> Result<(), AudioError>;

    fn stop(&self, id: VoiceId);

    fn close(&self);
}

/// Audio device information
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
    pub channel_count: u32,
}

/// Recover a guard from a poisoned lock. Audio callbacks never leave shared
/// state half-written, so the data is still usable.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
