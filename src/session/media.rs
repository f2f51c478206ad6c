use crate::audio::{AudioError, CaptureStream, CpalCapture, CpalOutput, OutputDevice};
use crate::config::{CaptureConfig, PlaybackConfig};
use std::sync::Arc;

/// Opens the session's microphone and speaker. Both calls may block while
/// the host brings the device up.
pub trait MediaBackend: Send + Sync {
    fn open_capture(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureStream>, AudioError>;

    fn open_output(&self, config: &PlaybackConfig) -> Result<Arc<dyn OutputDevice>, AudioError>;
}

/// Host audio devices through CPAL
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl MediaBackend for CpalBackend {
    fn open_capture(&self, config: &CaptureConfig) -> Result<Box<dyn CaptureStream>, AudioError> {
        Ok(Box::new(CpalCapture::open(config.clone())?))
    }

    fn open_output(&self, config: &PlaybackConfig) -> Result<Arc<dyn OutputDevice>, AudioError> {
        Ok(Arc::new(CpalOutput::open(config.clone())?))
    }
}
