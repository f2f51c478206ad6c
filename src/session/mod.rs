//! The live duplex session: microphone frames out, transcripts, tool calls
//! and speech back in.

pub mod channel;
pub mod media;

pub use channel::{Channel, ChannelConnector, WebSocketConnector, OUTBOUND_CAPACITY};
pub use media::{CpalBackend, MediaBackend};

use crate::audio::{lock, AudioFrame, CaptureStream, LevelMeter, OutputDevice};
use crate::codec::{self, EncodedChunk};
use crate::config::{CaptureConfig, PlaybackConfig, SessionConfig, OUTPUT_SAMPLE_RATE};
use crate::error::{Result, SessionError};
use crate::playback::{PlaybackItem, PlaybackScheduler};
use crate::protocol::{self, InboundEvent, OutboundMessage};
use crate::tools::{self, ToolDispatcher};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Role {
    #[strum(serialize = "you")]
    User,
    #[strum(serialize = "agent")]
    Agent,
}

/// What the transcript sink receives, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    Fragment { role: Role, text: String },
    TurnComplete,
}

/// Everything a session needs besides its collaborators
#[derive(Debug)]
pub struct SessionSettings {
    pub session: SessionConfig,
    pub capture: CaptureConfig,
    pub playback: PlaybackConfig,
}

/// Resources that only exist while the session is active.
struct ActiveSession {
    capture: Box<dyn CaptureStream>,
    outbound: mpsc::Sender<OutboundMessage>,
    closer: CancellationToken,
    cancel: CancellationToken,
    dispatch: JoinHandle<()>,
}

enum Phase {
    Idle,
    Connecting { cancel: CancellationToken },
    Active(ActiveSession),
    Closing,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Phase::Idle => SessionState::Idle,
            Phase::Connecting { .. } => SessionState::Connecting,
            Phase::Active(_) => SessionState::Active,
            Phase::Closing => SessionState::Closing,
        }
    }
}

struct Shared {
    phase: Mutex<Phase>,
    state: watch::Sender<SessionState>,
    settings: SessionSettings,
    media: Arc<dyn MediaBackend>,
    connector: Arc<dyn ChannelConnector>,
    dispatcher: ToolDispatcher,
    scheduler: PlaybackScheduler,
    transcripts: mpsc::UnboundedSender<TranscriptEvent>,
}

impl Shared {
    /// Replace the phase and publish the new state under the same lock.
    fn set_phase(&self, phase: &mut Phase, next: Phase) -> Phase {
        let previous = std::mem::replace(phase, next);
        let state = phase.state();
        self.state.send_replace(state);
        log::debug!("Session {} -> {}", previous.state(), state);
        previous
    }

    /// Move an active session to Closing and hand back its resources.
    fn begin_close(&self) -> Option<ActiveSession> {
        let mut phase = lock(&self.phase);
        if !matches!(*phase, Phase::Active(_)) {
            return None;
        }
        match self.set_phase(&mut phase, Phase::Closing) {
            Phase::Active(active) => Some(active),
            _ => None,
        }
    }

    /// Release every session-scoped resource and return to Idle.
    ///
    /// Closing the devices joins their threads, so that part runs on the
    /// blocking pool.
    async fn finish_close(self: Arc<Self>, active: ActiveSession, from_dispatch: bool) {
        let ActiveSession {
            mut capture,
            outbound,
            closer,
            cancel,
            dispatch,
        } = active;

        cancel.cancel();
        if !from_dispatch {
            dispatch.abort();
        }
        closer.cancel();
        drop(outbound);

        let shared = self.clone();
        let released = tokio::task::spawn_blocking(move || {
            capture.close();
            shared.scheduler.teardown();
        })
        .await;
        if let Err(e) = released {
            log::error!("Releasing session devices failed: {}", e);
        }

        let mut phase = lock(&self.phase);
        self.set_phase(&mut phase, Phase::Idle);
        log::info!("Session closed");
    }
}

/// Returns the session to Idle if `start` fails or is dropped before the
/// session becomes active.
struct ConnectingGuard<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut phase = lock(&self.shared.phase);
        if matches!(*phase, Phase::Connecting { .. }) {
            self.shared.set_phase(&mut phase, Phase::Idle);
        }
    }
}

struct Acquired {
    capture: Box<dyn CaptureStream>,
    output: Arc<dyn OutputDevice>,
    channel: Channel,
}

/// A realtime voice session.
///
/// State moves `Idle -> Connecting -> Active -> Closing -> Idle`, or straight
/// back to `Idle` when `start` fails. Device handles and the channel exist
/// only while Connecting or Active.
#[derive(Clone)]
pub struct LiveSession {
    shared: Arc<Shared>,
}

impl LiveSession {
    pub fn new(
        settings: SessionSettings,
        media: Arc<dyn MediaBackend>,
        connector: Arc<dyn ChannelConnector>,
        dispatcher: ToolDispatcher,
    ) -> (Self, mpsc::UnboundedReceiver<TranscriptEvent>) {
        let (transcripts, transcript_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Idle);
        let scheduler = PlaybackScheduler::new(&settings.playback);
        let session = Self {
            shared: Arc::new(Shared {
                phase: Mutex::new(Phase::Idle),
                state,
                settings,
                media,
                connector,
                dispatcher,
                scheduler,
                transcripts,
            }),
        };
        (session, transcript_rx)
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Input level feedback while active
    pub fn meter(&self) -> Option<LevelMeter> {
        match &*lock(&self.shared.phase) {
            Phase::Active(active) => Some(active.capture.meter()),
            _ => None,
        }
    }

    /// Fragments currently scheduled on the speaker
    pub fn playing(&self) -> usize {
        self.shared.scheduler.in_flight()
    }

    /// Acquire devices, open the channel and begin streaming.
    ///
    /// Rejected unless Idle. Cancelled by a concurrent `stop`.
    pub async fn start(&self) -> Result<()> {
        let shared = &*self.shared;
        let cancel = CancellationToken::new();
        {
            let mut phase = lock(&shared.phase);
            if !matches!(*phase, Phase::Idle) {
                return Err(SessionError::InvalidState(phase.state()));
            }
            shared.set_phase(
                &mut phase,
                Phase::Connecting {
                    cancel: cancel.clone(),
                },
            );
        }
        let mut guard = ConnectingGuard {
            shared,
            armed: true,
        };

        let acquired = tokio::select! {
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            acquired = self.acquire() => acquired,
        };
        let acquired = match acquired {
            Ok(acquired) => acquired,
            Err(e) => {
                log::error!("Session start failed: {}", e);
                return Err(e);
            }
        };

        let acquired = {
            let mut phase = lock(&shared.phase);
            let still_connecting =
                matches!(&*phase, Phase::Connecting { cancel } if !cancel.is_cancelled());
            if still_connecting {
                let active = self.activate(acquired);
                shared.set_phase(&mut phase, Phase::Active(active));
                guard.armed = false;
                log::info!("Session active");
                return Ok(());
            }
            acquired
        };
        Self::release(acquired).await;
        Err(SessionError::Cancelled)
    }

    /// Tear the session down and wait until it is Idle. Safe from any state.
    pub async fn stop(&self) {
        let mut states = self.subscribe();
        let active = {
            let mut phase = lock(&self.shared.phase);
            match phase.state() {
                SessionState::Idle => return,
                SessionState::Connecting => {
                    if let Phase::Connecting { cancel } = &*phase {
                        log::info!("Cancelling session start");
                        cancel.cancel();
                    }
                    None
                }
                SessionState::Closing => None,
                SessionState::Active => match self.shared.set_phase(&mut phase, Phase::Closing) {
                    Phase::Active(active) => Some(active),
                    _ => None,
                },
            }
        };

        if let Some(active) = active {
            log::info!("Stopping session");
            // Runs to completion even if this call is dropped
            tokio::spawn(self.shared.clone().finish_close(active, false));
        }
        let _ = states.wait_for(|state| *state == SessionState::Idle).await;
    }

    async fn acquire(&self) -> Result<Acquired> {
        let settings = &self.shared.settings;

        let media = self.shared.media.clone();
        let capture_config = settings.capture.clone();
        let capture = tokio::task::spawn_blocking(move || media.open_capture(&capture_config))
            .await
            .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))??;
        log::info!("🎤 Microphone open");

        let media = self.shared.media.clone();
        let playback_config = settings.playback.clone();
        let output = tokio::task::spawn_blocking(move || media.open_output(&playback_config))
            .await
            .map_err(|e| SessionError::DeviceUnavailable(e.to_string()))??;
        log::info!("🔊 Speaker open");

        let setup = protocol::setup_message(&settings.session, tools::declarations())
            .map_err(|e| SessionError::Channel(e.to_string()))?;
        let channel = self.shared.connector.connect(setup).await?;

        Ok(Acquired {
            capture,
            output,
            channel,
        })
    }

    async fn release(acquired: Acquired) {
        let Acquired {
            mut capture,
            output,
            channel,
        } = acquired;
        channel.closer.cancel();
        let released = tokio::task::spawn_blocking(move || {
            capture.close();
            output.close();
        })
        .await;
        if let Err(e) = released {
            log::error!("Releasing session devices failed: {}", e);
        }
    }

    /// Wire the frame path and start the dispatch loop. Frames captured
    /// before this point are never sent, even if the capture stream still
    /// has them queued.
    fn activate(&self, acquired: Acquired) -> ActiveSession {
        let Acquired {
            mut capture,
            output,
            channel,
        } = acquired;
        let Channel {
            outbound,
            inbound,
            closer,
        } = channel;

        self.shared.scheduler.attach(output);

        let frames = outbound.clone();
        let opened_at = Instant::now();
        capture.on_frame(Box::new(move |frame: &AudioFrame| {
            // Still queued from before the channel opened
            if frame.captured_at < opened_at {
                log::debug!("🎤 Discarding frame {} captured before open", frame.sequence);
                return;
            }
            let chunk = EncodedChunk::from_samples(frame.samples());
            match frames.try_send(OutboundMessage::Audio(chunk)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::debug!("🎤 Outbound queue full, dropping frame {}", frame.sequence)
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }));

        let cancel = CancellationToken::new();
        let dispatch = tokio::spawn(dispatch_loop(
            self.shared.clone(),
            inbound,
            outbound.clone(),
            cancel.clone(),
        ));

        ActiveSession {
            capture,
            outbound,
            closer,
            cancel,
            dispatch,
        }
    }
}

/// Route inbound events in arrival order until the channel ends or the
/// session is stopped, then tear the session down.
async fn dispatch_loop(
    shared: Arc<Shared>,
    mut inbound: mpsc::Receiver<InboundEvent>,
    outbound: mpsc::Sender<OutboundMessage>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = inbound.recv() => event,
        };

        match event {
            Some(InboundEvent::InputTranscript(text)) => {
                let _ = shared.transcripts.send(TranscriptEvent::Fragment {
                    role: Role::User,
                    text,
                });
            }
            Some(InboundEvent::OutputTranscript(text)) => {
                let _ = shared.transcripts.send(TranscriptEvent::Fragment {
                    role: Role::Agent,
                    text,
                });
            }
            Some(InboundEvent::TurnComplete) => {
                let _ = shared.transcripts.send(TranscriptEvent::TurnComplete);
            }
            Some(InboundEvent::ToolCall(invocation)) => {
                let ack = shared.dispatcher.dispatch(invocation);
                if outbound.send(OutboundMessage::ToolResponse(ack)).await.is_err() {
                    log::warn!("🔧 Channel closed before tool response was sent");
                }
            }
            Some(InboundEvent::AudioFragment(bytes)) => {
                let trailing = codec::trailing_bytes(bytes.len(), 1);
                if trailing > 0 {
                    log::warn!(
                        "🔊 {}",
                        SessionError::DecodeSkew {
                            len: bytes.len(),
                            trailing
                        }
                    );
                }
                let samples = codec::decode(&bytes, OUTPUT_SAMPLE_RATE, 1);
                if !samples.is_empty() {
                    shared
                        .scheduler
                        .enqueue(PlaybackItem::new(samples, OUTPUT_SAMPLE_RATE));
                }
            }
            Some(InboundEvent::Interrupted) => {
                log::debug!("🔊 Barge-in, flushing playback");
                shared.scheduler.interrupt();
            }
            Some(InboundEvent::Error(message)) => {
                log::error!("🌐 Channel error: {}", message);
                break;
            }
            Some(InboundEvent::Closed) | None => {
                log::info!("🌐 Channel closed");
                break;
            }
        }
    }

    if let Some(active) = shared.begin_close() {
        shared.finish_close(active, true).await;
    }
}
