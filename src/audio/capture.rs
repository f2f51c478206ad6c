use super::analysis::{analyze, LevelMeter};
use super::{lock, AudioDeviceInfo, AudioError, AudioFrame, CaptureStream, FrameCallback};
use crate::config::CaptureConfig;
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream as CpalStream,
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Hardware samples fed to the resampler per call
const RESAMPLE_CHUNK: usize = 1024;

/// Cuts a sample stream into fixed-length frames, applying gain.
pub struct FrameAssembler {
    frame_length: usize,
    gain: f32,
    pending: Vec<f32>,
    next_sequence: u64,
}

impl FrameAssembler {
    pub fn new(frame_length: usize, gain: f32) -> Self {
        Self {
            frame_length,
            gain,
            pending: Vec::with_capacity(frame_length),
            next_sequence: 0,
        }
    }

    /// Add samples and return every frame they complete.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        let mut frames = Vec::new();
        for &sample in samples {
            self.pending.push((sample * self.gain).clamp(-1.0, 1.0));
            if self.pending.len() == self.frame_length {
                let full = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_length));
                frames.push(AudioFrame::new(full, self.next_sequence));
                self.next_sequence += 1;
            }
        }
        frames
    }
}

/// Bounded hand-off from the device callback that favors recency: when the
/// queue is full the oldest frame is discarded.
#[derive(Clone)]
pub struct FrameQueue {
    tx: Sender<AudioFrame>,
    rx: Receiver<AudioFrame>,
    dropped: Arc<AtomicU64>,
}

impl FrameQueue {
    pub fn new(depth: usize) -> Self {
        let (tx, rx) = bounded(depth.max(1));
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue without blocking. Never grows past the configured depth.
    pub fn push(&self, frame: AudioFrame) {
        let mut frame = frame;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if self.rx.try_recv().is_ok() {
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        log::debug!("🎤 Capture queue full, dropped oldest frame ({} total)", total);
                    }
                    frame = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<AudioFrame, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Delivers frames to the level meter and every registered callback.
#[derive(Clone)]
pub struct FrameFanout {
    callbacks: Arc<Mutex<Vec<FrameCallback>>>,
    meter: LevelMeter,
    sample_rate: u32,
    bands: usize,
}

impl FrameFanout {
    pub fn new(sample_rate: u32, bands: usize) -> Self {
        Self {
            callbacks: Arc::new(Mutex::new(Vec::new())),
            meter: LevelMeter::new(),
            sample_rate,
            bands,
        }
    }

    pub fn register(&self, callback: FrameCallback) {
        lock(&self.callbacks).push(callback);
    }

    pub fn clear(&self) {
        lock(&self.callbacks).clear();
    }

    pub fn meter(&self) -> LevelMeter {
        self.meter.clone()
    }

    pub fn deliver(&self, frame: &AudioFrame) {
        self.meter
            .publish(analyze(frame.samples(), self.sample_rate, self.bands));
        for callback in lock(&self.callbacks).iter_mut() {
            callback(frame);
        }
    }
}

/// Microphone capture on a dedicated thread that owns the CPAL stream.
///
/// The device callback only converts, resamples and frames samples; frames
/// pass through a [`FrameQueue`] to the capture thread, which runs analysis
/// and the registered callbacks.
pub struct CpalCapture {
    fanout: FrameFanout,
    stop_sender: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CpalCapture {
    /// Open the input device. Blocks until the stream is running or fails.
    pub fn open(config: CaptureConfig) -> Result<Self, AudioError> {
        config
            .validate()
            .map_err(|e| AudioError::Config(e.to_string()))?;

        let fanout = FrameFanout::new(config.sample_rate, config.analysis_bands);
        let (stop_sender, stop_receiver) = bounded::<()>(1);
        let (ready_sender, ready_receiver) = bounded::<Result<(), AudioError>>(1);

        let thread_fanout = fanout.clone();
        let handle = thread::Builder::new()
            .name("voice-deck-capture".into())
            .spawn(move || {
                Self::run_capture_thread(config, thread_fanout, stop_receiver, ready_sender)
            })
            .map_err(|e| AudioError::Device(format!("Failed to spawn capture thread: {}", e)))?;

        match ready_receiver.recv() {
            Ok(Ok(())) => Ok(Self {
                fanout,
                stop_sender: Some(stop_sender),
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::Device("Capture thread exited during setup".into()))
            }
        }
    }

    fn run_capture_thread(
        config: CaptureConfig,
        fanout: FrameFanout,
        stop_receiver: Receiver<()>,
        ready_sender: Sender<Result<(), AudioError>>,
    ) {
        let queue = FrameQueue::new(config.queue_depth);
        let stream = match Self::start_stream(&config, queue.clone()) {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("🎤 Failed to open input device: {}", e);
                let _ = ready_sender.send(Err(e));
                return;
            }
        };
        let _ = ready_sender.send(Ok(()));

        loop {
            if stop_receiver.try_recv().is_ok() {
                break;
            }
            match queue.recv_timeout(Duration::from_millis(50)) {
                Ok(frame) => {
                    log::trace!("🎤 Frame {} ({} samples)", frame.sequence, frame.len());
                    fanout.deliver(&frame);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        drop(stream);
        fanout.clear();
        log::info!(
            "🎤 Capture stopped ({} frames dropped under backpressure)",
            queue.dropped()
        );
    }

    fn start_stream(config: &CaptureConfig, queue: FrameQueue) -> Result<CpalStream, AudioError> {
        let host = cpal::default_host();
        log::info!("🎤 Initializing audio capture with host: {:?}", host.id());

        let device = if let Some(name) = &config.device_name {
            host.input_devices()
                .map_err(|e| AudioError::Device(e.to_string()))?
                .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
                .ok_or_else(|| AudioError::Device(format!("Input device not found: {}", name)))?
        } else {
            host.default_input_device()
                .ok_or(AudioError::NoDevice("input"))?
        };

        log::info!("🎤 Using input device: {:?}", device.name());

        let supported_config = match Self::select_input_config(&device, config.sample_rate) {
            Ok(supported) => supported,
            Err(err) => {
                log::warn!(
                    "⚠️  Failed to select preferred input config: {}. Falling back to default input config.",
                    err
                );
                device
                    .default_input_config()
                    .map_err(|e| AudioError::Config(e.to_string()))?
            }
        };

        let stream_config = supported_config.config();
        let hardware_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;

        log::info!(
            "🎤 Hardware: {}Hz, {} channels, {:?} → {}Hz mono frames of {}",
            hardware_rate,
            channels,
            supported_config.sample_format(),
            config.sample_rate,
            config.frame_length
        );

        let resampler = if hardware_rate != config.sample_rate {
            let ratio = config.sample_rate as f64 / hardware_rate as f64;
            let params = SincInterpolationParameters {
                sinc_len: 32,
                f_cutoff: 0.95,
                interpolation: SincInterpolationType::Linear,
                oversampling_factor: 128,
                window: WindowFunction::BlackmanHarris2,
            };
            let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, RESAMPLE_CHUNK, 1)
                .map_err(|e| AudioError::Resampling(e.to_string()))?;
            log::info!(
                "🔄 Created resampler: {}Hz → {}Hz (ratio: {:.3})",
                hardware_rate,
                config.sample_rate,
                ratio
            );
            Some(resampler)
        } else {
            None
        };

        let assembler = FrameAssembler::new(config.frame_length, config.gain);

        let stream = match supported_config.sample_format() {
            SampleFormat::I16 => Self::create_input_stream::<i16>(
                &device,
                &stream_config,
                channels,
                assembler,
                resampler,
                queue,
            )?,
            SampleFormat::U16 => Self::create_input_stream::<u16>(
                &device,
                &stream_config,
                channels,
                assembler,
                resampler,
                queue,
            )?,
            SampleFormat::F32 => Self::create_input_stream::<f32>(
                &device,
                &stream_config,
                channels,
                assembler,
                resampler,
                queue,
            )?,
            other => {
                return Err(AudioError::Config(format!(
                    "Unsupported sample format: {:?}",
                    other
                )))
            }
        };

        stream
            .play()
            .map_err(|e| AudioError::Stream(e.to_string()))?;
        Ok(stream)
    }

    fn select_input_config(
        device: &Device,
        target_rate: u32,
    ) -> Result<cpal::SupportedStreamConfig, AudioError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| AudioError::Config(e.to_string()))?;

        let mut best_config: Option<cpal::SupportedStreamConfig> = None;
        let mut best_format_rank = u8::MAX;
        let mut best_rate_diff = u32::MAX;

        for config_range in configs {
            let format_rank = match config_range.sample_format() {
                SampleFormat::F32 => 0,
                SampleFormat::I16 => 1,
                SampleFormat::U16 => 2,
                _ => continue,
            };

            let min_rate = config_range.min_sample_rate().0;
            let max_rate = config_range.max_sample_rate().0;
            let chosen_rate = target_rate.clamp(min_rate, max_rate);
            let rate_diff = chosen_rate.abs_diff(target_rate);

            // Matching the rate avoids resampling, so it outranks the format
            if rate_diff < best_rate_diff
                || (rate_diff == best_rate_diff && format_rank < best_format_rank)
            {
                best_format_rank = format_rank;
                best_rate_diff = rate_diff;
                best_config = Some(config_range.with_sample_rate(cpal::SampleRate(chosen_rate)));
            }
        }

        best_config
            .ok_or_else(|| AudioError::Config("No supported input configs found".to_string()))
    }

    fn create_input_stream<T>(
        device: &Device,
        config: &cpal::StreamConfig,
        channels: usize,
        mut assembler: FrameAssembler,
        mut resampler: Option<SincFixedIn<f32>>,
        queue: FrameQueue,
    ) -> Result<CpalStream, AudioError>
    where
        T: Sample + SizedSample + Send + Sync + 'static,
        f32: FromSample<T>,
    {
        let mut hardware_buffer: Vec<f32> = Vec::with_capacity(RESAMPLE_CHUNK * 2);

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    // Downmix by taking the first channel
                    for frame in data.chunks(channels) {
                        if let Some(s) = frame.first() {
                            hardware_buffer.push(f32::from_sample(*s));
                        }
                    }

                    let frames = match resampler.as_mut() {
                        None => {
                            let frames = assembler.push(&hardware_buffer);
                            hardware_buffer.clear();
                            frames
                        }
                        Some(resampler) => {
                            let mut frames = Vec::new();
                            while hardware_buffer.len() >= RESAMPLE_CHUNK {
                                let chunk: Vec<f32> =
                                    hardware_buffer.drain(..RESAMPLE_CHUNK).collect();
                                match resampler.process(&[chunk], None) {
                                    Ok(output) => {
                                        if let Some(mono) = output.first() {
                                            frames.extend(assembler.push(mono));
                                        }
                                    }
                                    Err(e) => log::error!("Resampling error: {}", e),
                                }
                            }
                            frames
                        }
                    };

                    for frame in frames {
                        queue.push(frame);
                    }
                },
                move |err| log::error!("🎤 Audio input stream error: {}", err),
                None,
            )
            .map_err(|e| AudioError::Stream(e.to_string()))
    }

    /// List available input devices
    pub fn list_devices() -> Result<Vec<AudioDeviceInfo>, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::Device(e.to_string()))?;

        let default_name = host.default_input_device().and_then(|d| d.name().ok());

        let mut infos = Vec::new();
        for device in devices {
            let Ok(name) = device.name() else { continue };
            let channel_count = device
                .default_input_config()
                .map(|c| u32::from(c.channels()))
                .unwrap_or(0);
            infos.push(AudioDeviceInfo {
                is_default: default_name.as_ref() == Some(&name),
                name,
                channel_count,
            });
        }
        Ok(infos)
    }
}

impl CaptureStream for CpalCapture {
    fn on_frame(&mut self, callback: FrameCallback) {
        self.fanout.register(callback);
    }

    fn meter(&self) -> LevelMeter {
        self.fanout.meter()
    }

    fn close(&mut self) {
        if let Some(stop) = self.stop_sender.take() {
            log::debug!("🎤 Closing capture device");
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("🎤 Capture thread panicked");
            }
        }
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}
