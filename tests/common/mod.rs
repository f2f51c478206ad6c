#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use voice_deck::audio::{
    AudioError, AudioFrame, CaptureStream, Completion, CompletionCallback, FrameCallback,
    LevelMeter, OutputDevice, VoiceId,
};
use voice_deck::config::{CaptureConfig, PlaybackConfig, SessionConfig};
use voice_deck::deck::SlideUpdate;
use voice_deck::protocol::{InboundEvent, OutboundMessage};
use voice_deck::session::{
    Channel, ChannelConnector, LiveSession, MediaBackend, SessionSettings, TranscriptEvent,
};
use voice_deck::tools::{DeckActions, ToolDispatcher};
use voice_deck::SessionError;

/// Poll `condition` until it holds or a second passes.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledVoice {
    pub id: VoiceId,
    pub start_time: f64,
    pub duration: f64,
    pub samples: usize,
}

/// Output device with a hand-driven clock. Stop and close fire completions
/// from a separate thread, like a real device.
#[derive(Default)]
pub struct FakeSpeaker {
    now: Mutex<f64>,
    pending: Mutex<HashMap<VoiceId, CompletionCallback>>,
    pub scheduled: Mutex<Vec<ScheduledVoice>>,
    pub stopped: Mutex<Vec<VoiceId>>,
    pub closed: AtomicBool,
}

impl FakeSpeaker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_time(&self, seconds: f64) {
        *self.now.lock().unwrap() = seconds;
    }

    pub fn scheduled(&self) -> Vec<ScheduledVoice> {
        self.scheduled.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<VoiceId> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Play `id` to the end
    pub fn finish(&self, id: VoiceId) {
        let callback = self.pending.lock().unwrap().remove(&id);
        if let Some(callback) = callback {
            callback(Completion::Finished);
        }
    }

    fn fire_later(callback: CompletionCallback, completion: Completion) {
        std::thread::spawn(move || callback(completion));
    }
}

impl OutputDevice for FakeSpeaker {
    fn current_time(&self) -> f64 {
        *self.now.lock().unwrap()
    }

    fn schedule(
        &self,
        id: VoiceId,
        samples: Arc<[f32]>,
        sample_rate: u32,
        start_time: f64,
        on_complete: CompletionCallback,
    ) -> Result<(), AudioError> {
        if self.is_closed() {
            return Err(AudioError::Closed);
        }
        self.scheduled.lock().unwrap().push(ScheduledVoice {
            id,
            start_time,
            duration: samples.len() as f64 / sample_rate as f64,
            samples: samples.len(),
        });
        self.pending.lock().unwrap().insert(id, on_complete);
        Ok(())
    }

    fn stop(&self, id: VoiceId) {
        self.stopped.lock().unwrap().push(id);
        if let Some(callback) = self.pending.lock().unwrap().remove(&id) {
            Self::fire_later(callback, Completion::Stopped);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for (_, callback) in self.pending.lock().unwrap().drain() {
            Self::fire_later(callback, Completion::Stopped);
        }
    }
}

/// Microphone driven by the test: `emit` plays the role of the capture thread.
#[derive(Clone, Default)]
pub struct FakeMic {
    callbacks: Arc<Mutex<Vec<FrameCallback>>>,
    closed: Arc<AtomicBool>,
    closing: Arc<AtomicBool>,
    opened: Arc<AtomicUsize>,
    close_gate: Arc<Mutex<Option<std::sync::mpsc::Receiver<()>>>>,
}

impl FakeMic {
    pub fn emit(&self, frame: &AudioFrame) {
        for callback in self.callbacks.lock().unwrap().iter_mut() {
            callback(frame);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// True once `close` has been entered, even if it has not returned
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Make the next `close` block the calling thread until released, the
    /// way joining a device thread does.
    pub fn hold_close(&self) -> std::sync::mpsc::Sender<()> {
        let (tx, rx) = std::sync::mpsc::channel();
        *self.close_gate.lock().unwrap() = Some(rx);
        tx
    }
}

struct FakeCapture {
    mic: FakeMic,
    meter: LevelMeter,
}

impl CaptureStream for FakeCapture {
    fn on_frame(&mut self, callback: FrameCallback) {
        self.mic.callbacks.lock().unwrap().push(callback);
    }

    fn meter(&self) -> LevelMeter {
        self.meter.clone()
    }

    fn close(&mut self) {
        self.mic.closing.store(true, Ordering::SeqCst);
        let gate = self.mic.close_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.recv_timeout(Duration::from_secs(2));
        }
        self.mic.callbacks.lock().unwrap().clear();
        self.mic.closed.store(true, Ordering::SeqCst);
    }
}

impl Drop for FakeCapture {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct FakeMedia {
    pub mic: FakeMic,
    pub speaker: Arc<FakeSpeaker>,
    pub no_microphone: AtomicBool,
}

impl MediaBackend for FakeMedia {
    fn open_capture(&self, _config: &CaptureConfig) -> Result<Box<dyn CaptureStream>, AudioError> {
        if self.no_microphone.load(Ordering::SeqCst) {
            return Err(AudioError::NoDevice("input"));
        }
        self.mic.closed.store(false, Ordering::SeqCst);
        self.mic.closing.store(false, Ordering::SeqCst);
        self.mic.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCapture {
            mic: self.mic.clone(),
            meter: LevelMeter::new(),
        }))
    }

    fn open_output(&self, _config: &PlaybackConfig) -> Result<Arc<dyn OutputDevice>, AudioError> {
        self.speaker.closed.store(false, Ordering::SeqCst);
        Ok(self.speaker.clone())
    }
}

/// The agent's side of an open channel
pub struct Remote {
    pub from_session: mpsc::Receiver<OutboundMessage>,
    pub to_session: mpsc::Sender<InboundEvent>,
    pub closer: CancellationToken,
}

#[derive(Default)]
pub struct FakeConnector {
    gate: Mutex<Option<oneshot::Receiver<()>>>,
    remotes: Mutex<Vec<Remote>>,
    pub setups: Mutex<Vec<String>>,
    pub attempts: AtomicUsize,
    pub refuse: AtomicBool,
}

impl FakeConnector {
    /// Make the next connect wait until the returned sender fires or drops
    pub fn hold(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn take_remote(&self) -> Remote {
        self.remotes.lock().unwrap().pop().expect("no open channel")
    }
}

#[async_trait]
impl ChannelConnector for FakeConnector {
    async fn connect(&self, setup: String) -> voice_deck::Result<Channel> {
        self.setups.lock().unwrap().push(setup);
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SessionError::Channel("connection refused".into()));
        }

        let (out_tx, out_rx) = mpsc::channel(voice_deck::session::OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(64);
        let closer = CancellationToken::new();
        self.remotes.lock().unwrap().push(Remote {
            from_session: out_rx,
            to_session: in_tx,
            closer: closer.clone(),
        });
        Ok(Channel {
            outbound: out_tx,
            inbound: in_rx,
            closer,
        })
    }
}

#[derive(Default)]
pub struct RecordingActions {
    pub topics: Mutex<Vec<String>>,
    pub updates: Mutex<Vec<SlideUpdate>>,
}

#[async_trait]
impl DeckActions for RecordingActions {
    async fn generate_presentation(&self, topic: String) {
        self.topics.lock().unwrap().push(topic);
    }

    async fn update_slide(&self, update: SlideUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

/// A session wired to fakes
pub struct Rig {
    pub media: Arc<FakeMedia>,
    pub connector: Arc<FakeConnector>,
    pub actions: Arc<RecordingActions>,
    pub session: LiveSession,
    pub transcripts: mpsc::UnboundedReceiver<TranscriptEvent>,
}

impl Rig {
    pub fn new() -> Self {
        let media = Arc::new(FakeMedia {
            mic: FakeMic::default(),
            speaker: FakeSpeaker::new(),
            no_microphone: AtomicBool::new(false),
        });
        let connector = Arc::new(FakeConnector::default());
        let actions = Arc::new(RecordingActions::default());
        let (session, transcripts) = LiveSession::new(
            SessionSettings {
                session: SessionConfig::with_key("test-key"),
                capture: CaptureConfig::default(),
                playback: PlaybackConfig::default(),
            },
            media.clone(),
            connector.clone(),
            ToolDispatcher::new(actions.clone()),
        );
        Self {
            media,
            connector,
            actions,
            session,
            transcripts,
        }
    }

    pub fn mic(&self) -> &FakeMic {
        &self.media.mic
    }

    pub fn speaker(&self) -> &Arc<FakeSpeaker> {
        &self.media.speaker
    }
}
