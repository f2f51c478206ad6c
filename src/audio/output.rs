use super::{lock, AudioError, Completion, CompletionCallback, OutputDevice, VoiceId};
use crate::config::PlaybackConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

struct Voice {
    id: VoiceId,
    samples: Vec<f32>,
    start_frame: u64,
    position: usize,
    on_complete: Option<CompletionCallback>,
}

/// Voices waiting for or in playback, plus the device frame counter.
struct Mixer {
    voices: Vec<Voice>,
    frames_rendered: u64,
}

impl Mixer {
    /// Render `frames` mono output frames, returning finished voices.
    fn render(&mut self, out: &mut [f32]) -> Vec<Voice> {
        for (i, slot) in out.iter_mut().enumerate() {
            let frame = self.frames_rendered + i as u64;
            let mut mixed = 0.0f32;
            for voice in self.voices.iter_mut() {
                if frame >= voice.start_frame && voice.position < voice.samples.len() {
                    mixed += voice.samples[voice.position];
                    voice.position += 1;
                }
            }
            *slot = mixed.clamp(-1.0, 1.0);
        }
        self.frames_rendered += out.len() as u64;

        let mut finished = Vec::new();
        let mut i = 0;
        while i < self.voices.len() {
            if self.voices[i].position >= self.voices[i].samples.len() {
                finished.push(self.voices.swap_remove(i));
            } else {
                i += 1;
            }
        }
        finished
    }
}

type Notification = (CompletionCallback, Completion);

/// Speaker output that plays voices at absolute frame positions.
///
/// The CPAL stream lives on its own thread; completion callbacks run on a
/// separate notifier thread so they never execute inside the realtime
/// callback or inside `schedule`/`stop`.
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    device_rate: u32,
    closed: Arc<AtomicBool>,
    notify: Sender<Notification>,
    stop_sender: Sender<()>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    frames_played: Arc<AtomicU64>,
}

impl CpalOutput {
    pub fn open(config: PlaybackConfig) -> Result<Self, AudioError> {
        let mixer = Arc::new(Mutex::new(Mixer {
            voices: Vec::new(),
            frames_rendered: 0,
        }));
        let frames_played = Arc::new(AtomicU64::new(0));
        let (notify, notifications) = unbounded::<Notification>();
        let (stop_sender, stop_receiver) = bounded::<()>(1);
        let (ready_sender, ready_receiver) = bounded::<Result<u32, AudioError>>(1);

        let thread_mixer = Arc::clone(&mixer);
        let thread_frames = Arc::clone(&frames_played);
        let thread_notify = notify.clone();
        let device_name = config.device_name.clone();
        let audio_thread = thread::Builder::new()
            .name("voice-deck-output".into())
            .spawn(move || {
                Self::run_output_thread(
                    device_name,
                    thread_mixer,
                    thread_frames,
                    thread_notify,
                    stop_receiver,
                    ready_sender,
                )
            })
            .map_err(|e| AudioError::Device(format!("Failed to spawn output thread: {}", e)))?;

        let device_rate = match ready_receiver.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = audio_thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = audio_thread.join();
                return Err(AudioError::Device("Output thread exited during setup".into()));
            }
        };

        let notifier_thread = thread::Builder::new()
            .name("voice-deck-playback-notify".into())
            .spawn(move || Self::run_notifier(notifications))
            .map_err(|e| AudioError::Device(format!("Failed to spawn notifier: {}", e)))?;

        log::debug!("🔊 Output device open at {}Hz", device_rate);
        Ok(Self {
            mixer,
            device_rate,
            closed: Arc::new(AtomicBool::new(false)),
            notify,
            stop_sender,
            threads: Mutex::new(vec![audio_thread, notifier_thread]),
            frames_played,
        })
    }

    fn run_notifier(notifications: Receiver<Notification>) {
        while let Ok((callback, completion)) = notifications.recv() {
            callback(completion);
        }
    }

    fn run_output_thread(
        device_name: Option<String>,
        mixer: Arc<Mutex<Mixer>>,
        frames_played: Arc<AtomicU64>,
        notify: Sender<Notification>,
        stop_receiver: Receiver<()>,
        ready_sender: Sender<Result<u32, AudioError>>,
    ) {
        let host = cpal::default_host();
        log::debug!("🔊 Using audio host: {:?}", host.id());

        let device = match &device_name {
            Some(name) => host.output_devices().ok().and_then(|mut devices| {
                devices.find(|d| d.name().map(|n| n == *name).unwrap_or(false))
            }),
            None => host.default_output_device(),
        };
        let Some(device) = device else {
            log::error!("🔊 No output device found!");
            let _ = ready_sender.send(Err(AudioError::NoDevice("output")));
            return;
        };
        log::debug!("🔊 Using output device: {:?}", device.name());

        let supported_config = match device.default_output_config() {
            Ok(config) => config,
            Err(e) => {
                let _ = ready_sender.send(Err(AudioError::Device(e.to_string())));
                return;
            }
        };
        let stream_config = supported_config.config();
        let device_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;

        let built = match supported_config.sample_format() {
            SampleFormat::F32 => Self::build_stream::<f32>(
                &device,
                &stream_config,
                channels,
                Arc::clone(&mixer),
                Arc::clone(&frames_played),
                notify.clone(),
            ),
            SampleFormat::I16 => Self::build_stream::<i16>(
                &device,
                &stream_config,
                channels,
                Arc::clone(&mixer),
                Arc::clone(&frames_played),
                notify.clone(),
            ),
            SampleFormat::U16 => Self::build_stream::<u16>(
                &device,
                &stream_config,
                channels,
                Arc::clone(&mixer),
                Arc::clone(&frames_played),
                notify.clone(),
            ),
            other => Err(AudioError::Config(format!(
                "Unsupported output format: {:?}",
                other
            ))),
        };

        let stream = match built.and_then(|stream| {
            stream
                .play()
                .map_err(|e| AudioError::Stream(e.to_string()))
                .map(|_| stream)
        }) {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("🔊 Failed to start output stream: {}", e);
                let _ = ready_sender.send(Err(e));
                return;
            }
        };

        let _ = ready_sender.send(Ok(device_rate));
        let _ = stop_receiver.recv();

        drop(stream);
        let remaining: Vec<Voice> = lock(&mixer).voices.drain(..).collect();
        for mut voice in remaining {
            if let Some(callback) = voice.on_complete.take() {
                let _ = notify.send((callback, Completion::Stopped));
            }
        }
        log::debug!("🔊 Output thread exiting");
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        channels: usize,
        mixer: Arc<Mutex<Mixer>>,
        frames_played: Arc<AtomicU64>,
        notify: Sender<Notification>,
    ) -> Result<cpal::Stream, AudioError>
    where
        T: Sample + SizedSample + FromSample<f32> + Send + 'static,
    {
        let mut mono: Vec<f32> = Vec::new();
        device
            .build_output_stream(
                config,
                move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    mono.resize(frames, 0.0);

                    let finished = {
                        let mut mixer = lock(&mixer);
                        let finished = mixer.render(&mut mono);
                        frames_played.store(mixer.frames_rendered, Ordering::Release);
                        finished
                    };

                    for (frame, &sample) in data.chunks_mut(channels).zip(mono.iter()) {
                        for channel in frame.iter_mut() {
                            *channel = T::from_sample(sample);
                        }
                    }

                    for mut voice in finished {
                        if let Some(callback) = voice.on_complete.take() {
                            let _ = notify.send((callback, Completion::Finished));
                        }
                    }
                },
                move |err| log::error!("🔊 Output stream error: {}", err),
                None,
            )
            .map_err(|e| AudioError::Stream(e.to_string()))
    }
}

/// Linear interpolation resample of a mono buffer.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    resample_to_len(samples, from_rate, to_rate, out_len)
}

/// First device frame and frame count for `len` samples at `sample_rate`
/// starting at `start_time`. Both ends are rounded the same way, so a
/// fragment starting where another ends begins on the frame right after it.
pub fn voice_span(start_time: f64, len: usize, sample_rate: u32, device_rate: u32) -> (u64, usize) {
    let start_time = start_time.max(0.0);
    let start_frame = (start_time * device_rate as f64).round() as u64;
    if sample_rate == 0 {
        return (start_frame, 0);
    }
    let end_time = start_time + len as f64 / sample_rate as f64;
    let end_frame = (end_time * device_rate as f64).round() as u64;
    (start_frame, end_frame.saturating_sub(start_frame) as usize)
}

fn resample_to_len(samples: &[f32], from_rate: u32, to_rate: u32, out_len: usize) -> Vec<f32> {
    if samples.is_empty() {
        return Vec::new();
    }
    if from_rate == to_rate && out_len == samples.len() {
        return samples.to_vec();
    }
    let step = from_rate as f64 / to_rate as f64;
    (0..out_len)
        .map(|i| {
            let position = i as f64 * step;
            let index = position.floor() as usize;
            let fract = (position - index as f64) as f32;
            let a = samples[index.min(samples.len() - 1)];
            let b = samples[(index + 1).min(samples.len() - 1)];
            a * (1.0 - fract) + b * fract
        })
        .collect()
}

impl OutputDevice for CpalOutput {
    fn current_time(&self) -> f64 {
        self.frames_played.load(Ordering::Acquire) as f64 / self.device_rate as f64
    }

    fn schedule(
        &self,
        id: VoiceId,
        samples: Arc<[f32]>,
        sample_rate: u32,
        start_time: f64,
        on_complete: CompletionCallback,
    ) -> Result<(), AudioError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AudioError::Closed);
        }
        let (start_frame, frames) =
            voice_span(start_time, samples.len(), sample_rate, self.device_rate);
        let voice = Voice {
            id,
            samples: resample_to_len(&samples, sample_rate, self.device_rate, frames),
            start_frame,
            position: 0,
            on_complete: Some(on_complete),
        };
        log::trace!(
            "🔊 Voice {} at frame {} ({} frames)",
            id,
            voice.start_frame,
            voice.samples.len()
        );
        lock(&self.mixer).voices.push(voice);
        Ok(())
    }

    fn stop(&self, id: VoiceId) {
        let stopped = {
            let mut mixer = lock(&self.mixer);
            mixer
                .voices
                .iter()
                .position(|v| v.id == id)
                .map(|index| mixer.voices.swap_remove(index))
        };
        if let Some(mut voice) = stopped {
            if let Some(callback) = voice.on_complete.take() {
                let _ = self.notify.send((callback, Completion::Stopped));
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("🔊 Closing output device");
        let _ = self.stop_sender.send(());
        let handles: Vec<_> = lock(&self.threads).drain(..).collect();
        // The audio thread comes first and drains remaining voices as
        // stopped. The notifier is detached; it exits when `self.notify`
        // drops with the device.
        if let Some(audio_thread) = handles.into_iter().next() {
            if audio_thread.join().is_err() {
                log::error!("🔊 Output thread panicked");
            }
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(id: VoiceId, len: usize, start_frame: u64) -> Voice {
        Voice {
            id,
            samples: vec![0.25; len],
            start_frame,
            position: 0,
            on_complete: None,
        }
    }

    #[test]
    fn test_mixer_waits_for_start_frame() {
        let mut mixer = Mixer {
            voices: vec![voice(1, 4, 2)],
            frames_rendered: 0,
        };
        let mut out = vec![1.0; 4];
        let finished = mixer.render(&mut out);
        assert_eq!(out, vec![0.0, 0.0, 0.25, 0.25]);
        assert!(finished.is_empty());

        let finished = mixer.render(&mut out);
        assert_eq!(out, vec![0.25, 0.25, 0.0, 0.0]);
        assert_eq!(finished.len(), 1);
        assert_eq!(mixer.frames_rendered, 8);
    }

    #[test]
    fn test_mixer_back_to_back_voices_have_no_gap() {
        let mut mixer = Mixer {
            voices: vec![voice(1, 3, 0), voice(2, 3, 3)],
            frames_rendered: 0,
        };
        let mut out = vec![0.0; 6];
        mixer.render(&mut out);
        assert!(out.iter().all(|&s| s == 0.25));
    }

    #[test]
    fn test_back_to_back_voices_share_a_boundary_frame() {
        // 24 kHz speech on a 44.1 kHz device: the ratio is not a whole number
        let mut start_time = 0.05;
        let mut next_frame = None;
        for len in [1001, 2048, 777, 4096, 333] {
            let (start_frame, frames) = voice_span(start_time, len, 24_000, 44_100);
            if let Some(expected) = next_frame {
                assert_eq!(start_frame, expected);
            }
            next_frame = Some(start_frame + frames as u64);
            start_time += len as f64 / 24_000 as f64;
        }
    }

    #[test]
    fn test_resample_linear_lengths() {
        let input = vec![0.0, 1.0, 0.0, -1.0];
        assert_eq!(resample_linear(&input, 24000, 24000), input);
        assert_eq!(resample_linear(&input, 24000, 48000).len(), 8);
        let up = resample_linear(&input, 24000, 48000);
        assert!((up[1] - 0.5).abs() < 1e-6);
        assert_eq!(resample_linear(&[], 24000, 48000).len(), 0);
    }
}
