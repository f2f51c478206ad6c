mod common;

use common::{eventually, Rig};
use serde_json::{json, Value};
use std::fs;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;
use voice_deck::audio::AudioFrame;
use voice_deck::codec::{self, EncodedChunk};
use voice_deck::deck::{DeckStore, Presentation, SlideLayout};
use voice_deck::protocol::{InboundEvent, OutboundMessage, ToolInvocation};
use voice_deck::session::{Role, TranscriptEvent};
use voice_deck::{SessionError, SessionState};

fn frame(sequence: u64) -> AudioFrame {
    AudioFrame::new(vec![sequence as f32 / 100.0; 256], sequence)
}

async fn wait_for_idle(rig: &Rig) {
    let mut states = rig.session.subscribe();
    tokio::time::timeout(
        Duration::from_secs(2),
        states.wait_for(|s| *s == SessionState::Idle),
    )
    .await
    .expect("session did not return to Idle")
    .unwrap();
}

#[test_log::test(tokio::test)]
async fn test_frames_before_open_are_discarded() {
    let rig = Rig::new();
    let release = rig.connector.hold();

    let session = rig.session.clone();
    let starting = tokio::spawn(async move { session.start().await });

    // Microphone is live but the channel has not opened yet
    eventually(|| rig.connector.attempts() == 1).await;
    assert_eq!(rig.session.state(), SessionState::Connecting);
    assert_eq!(rig.mic().opened(), 1);
    for sequence in 0..10 {
        rig.mic().emit(&frame(sequence));
    }

    release.send(()).unwrap();
    starting.await.unwrap().unwrap();
    assert_eq!(rig.session.state(), SessionState::Active);

    let mut remote = rig.connector.take_remote();
    assert!(remote.from_session.try_recv().is_err());

    for sequence in 10..20 {
        rig.mic().emit(&frame(sequence));
    }
    for sequence in 10..20 {
        match remote.from_session.recv().await {
            Some(OutboundMessage::Audio(chunk)) => {
                assert_eq!(chunk, EncodedChunk::from_samples(frame(sequence).samples()));
            }
            other => panic!("expected audio, got {:?}", other),
        }
    }
    assert!(remote.from_session.try_recv().is_err());

    rig.session.stop().await;
}

#[tokio::test]
async fn test_frames_queued_before_open_are_discarded() {
    let rig = Rig::new();
    let release = rig.connector.hold();

    let session = rig.session.clone();
    let starting = tokio::spawn(async move { session.start().await });
    eventually(|| rig.connector.attempts() == 1).await;

    // Captured while connecting, but only handed over after the channel opened
    let stale: Vec<AudioFrame> = (0..5).map(frame).collect();
    tokio::time::sleep(Duration::from_millis(5)).await;

    release.send(()).unwrap();
    starting.await.unwrap().unwrap();
    let mut remote = rig.connector.take_remote();

    for queued in &stale {
        rig.mic().emit(queued);
    }
    rig.mic().emit(&frame(5));

    match remote.from_session.recv().await {
        Some(OutboundMessage::Audio(chunk)) => {
            assert_eq!(chunk, EncodedChunk::from_samples(frame(5).samples()));
        }
        other => panic!("expected audio, got {:?}", other),
    }
    assert!(remote.from_session.try_recv().is_err());

    rig.session.stop().await;
}

#[tokio::test]
async fn test_device_release_does_not_block_the_runtime() {
    let rig = Rig::new();
    rig.session.start().await.unwrap();
    let release = rig.mic().hold_close();

    let session = rig.session.clone();
    let stopping = tokio::spawn(async move { session.stop().await });

    // The microphone is stuck closing, yet this task keeps getting polled
    eventually(|| rig.mic().is_closing()).await;
    assert_eq!(rig.session.state(), SessionState::Closing);
    assert!(!rig.mic().is_closed());

    release.send(()).unwrap();
    stopping.await.unwrap();
    assert!(rig.mic().is_closed());
    assert!(rig.speaker().is_closed());
    assert_eq!(rig.session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_setup_carries_tools_and_voice() {
    let rig = Rig::new();
    rig.session.start().await.unwrap();

    let setups = rig.connector.setups.lock().unwrap().clone();
    assert_eq!(setups.len(), 1);
    let setup: Value = serde_json::from_str(&setups[0]).unwrap();
    assert_eq!(
        setup["setup"]["generationConfig"]["responseModalities"],
        json!(["AUDIO"])
    );
    let names: Vec<&str> = setup["setup"]["tools"][0]["functionDeclarations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["generate_presentation", "update_slide"]);

    rig.session.stop().await;
}

#[tokio::test]
async fn test_start_rejected_unless_idle() {
    let rig = Rig::new();
    rig.session.start().await.unwrap();

    match rig.session.start().await {
        Err(SessionError::InvalidState(state)) => assert_eq!(state, SessionState::Active),
        other => panic!("expected InvalidState, got {:?}", other),
    }
    assert_eq!(rig.mic().opened(), 1);
    assert_eq!(rig.connector.attempts(), 1);
    assert_eq!(rig.session.state(), SessionState::Active);

    rig.session.stop().await;
}

#[tokio::test]
async fn test_stop_releases_everything() {
    let rig = Rig::new();
    rig.session.start().await.unwrap();
    let remote = rig.connector.take_remote();
    assert!(rig.session.meter().is_some());

    rig.session.stop().await;

    assert_eq!(rig.session.state(), SessionState::Idle);
    assert!(rig.mic().is_closed());
    assert!(rig.speaker().is_closed());
    assert!(remote.closer.is_cancelled());
    assert!(rig.session.meter().is_none());

    // Idempotent, and a new session can start afterwards
    rig.session.stop().await;
    rig.session.start().await.unwrap();
    assert_eq!(rig.mic().opened(), 2);
    rig.session.stop().await;
}

#[tokio::test]
async fn test_stop_from_idle_is_noop() {
    let rig = Rig::new();
    rig.session.stop().await;
    assert_eq!(rig.session.state(), SessionState::Idle);
    assert_eq!(rig.mic().opened(), 0);
}

#[tokio::test]
async fn test_stop_cancels_pending_start() {
    let rig = Rig::new();
    let _release = rig.connector.hold();

    let session = rig.session.clone();
    let starting = tokio::spawn(async move { session.start().await });
    eventually(|| rig.connector.attempts() == 1).await;

    rig.session.stop().await;

    assert_eq!(rig.session.state(), SessionState::Idle);
    assert!(matches!(
        starting.await.unwrap(),
        Err(SessionError::Cancelled)
    ));
    assert!(rig.mic().is_closed());
}

#[tokio::test]
async fn test_device_failure_returns_to_idle() {
    let rig = Rig::new();
    rig.media.no_microphone.store(true, Ordering::SeqCst);

    let err = rig.session.start().await.unwrap_err();
    assert!(matches!(err, SessionError::DeviceUnavailable(_)));
    assert!(err.user_message().contains("audio device unavailable"));
    assert_eq!(rig.session.state(), SessionState::Idle);
    assert_eq!(rig.connector.attempts(), 0);

    rig.media.no_microphone.store(false, Ordering::SeqCst);
    rig.session.start().await.unwrap();
    rig.session.stop().await;
}

#[tokio::test]
async fn test_channel_failure_releases_devices() {
    let rig = Rig::new();
    rig.connector.refuse.store(true, Ordering::SeqCst);

    assert!(matches!(
        rig.session.start().await,
        Err(SessionError::Channel(_))
    ));
    assert_eq!(rig.session.state(), SessionState::Idle);
    assert!(rig.mic().is_closed());
}

#[tokio::test]
async fn test_remote_close_tears_down() {
    let rig = Rig::new();
    rig.session.start().await.unwrap();
    let remote = rig.connector.take_remote();

    remote.to_session.send(InboundEvent::Closed).await.unwrap();
    wait_for_idle(&rig).await;

    assert!(rig.mic().is_closed());
    assert!(rig.speaker().is_closed());
    assert!(remote.closer.is_cancelled());
}

#[tokio::test]
async fn test_channel_error_tears_down() {
    let rig = Rig::new();
    rig.session.start().await.unwrap();
    let remote = rig.connector.take_remote();

    remote
        .to_session
        .send(InboundEvent::Error("connection reset".into()))
        .await
        .unwrap();
    wait_for_idle(&rig).await;
    assert!(rig.mic().is_closed());
}

#[tokio::test]
async fn test_transcripts_forwarded_in_order() {
    let mut rig = Rig::new();
    rig.session.start().await.unwrap();
    let remote = rig.connector.take_remote();

    for event in [
        InboundEvent::InputTranscript("make a deck".into()),
        InboundEvent::OutputTranscript("On it".into()),
        InboundEvent::TurnComplete,
    ] {
        remote.to_session.send(event).await.unwrap();
    }

    assert_eq!(
        rig.transcripts.recv().await.unwrap(),
        TranscriptEvent::Fragment {
            role: Role::User,
            text: "make a deck".into()
        }
    );
    assert_eq!(
        rig.transcripts.recv().await.unwrap(),
        TranscriptEvent::Fragment {
            role: Role::Agent,
            text: "On it".into()
        }
    );
    assert_eq!(
        rig.transcripts.recv().await.unwrap(),
        TranscriptEvent::TurnComplete
    );

    rig.session.stop().await;
}

#[tokio::test]
async fn test_every_tool_call_acknowledged() {
    let rig = Rig::new();
    rig.session.start().await.unwrap();
    let mut remote = rig.connector.take_remote();

    let calls = [
        ("1", "generate_presentation", json!({"topic": "Deep sea"})),
        ("2", "open_pod_bay_doors", json!({})),
        ("3", "update_slide", json!({"layout": "QUOTE"})),
    ];
    for (id, name, arguments) in calls.clone() {
        remote
            .to_session
            .send(InboundEvent::ToolCall(ToolInvocation {
                id: id.into(),
                name: name.into(),
                arguments,
            }))
            .await
            .unwrap();
    }

    for (id, name, _) in calls {
        match remote.from_session.recv().await {
            Some(OutboundMessage::ToolResponse(ack)) => {
                assert_eq!(ack.id, id);
                assert_eq!(ack.name, name);
                if name == "open_pod_bay_doors" {
                    assert!(ack.response["error"].is_string());
                } else {
                    assert_eq!(ack.response, json!({"result": "ok"}));
                }
            }
            other => panic!("expected tool response, got {:?}", other),
        }
    }

    eventually(|| rig.actions.updates.lock().unwrap().len() == 1).await;
    assert_eq!(
        rig.actions.updates.lock().unwrap()[0].layout,
        Some(SlideLayout::Quote)
    );
    eventually(|| *rig.actions.topics.lock().unwrap() == vec!["Deep sea".to_string()]).await;
    // An unknown tool does not end the session
    assert_eq!(rig.session.state(), SessionState::Active);

    rig.session.stop().await;
}

#[tokio::test]
async fn test_audio_scheduled_and_interrupted() {
    let mut rig = Rig::new();
    rig.session.start().await.unwrap();
    let remote = rig.connector.take_remote();

    // 0.1 s at 24 kHz plus one stray byte
    let mut bytes = codec::encode(&vec![0.25; 2400]);
    bytes.push(0x7f);
    remote
        .to_session
        .send(InboundEvent::AudioFragment(bytes))
        .await
        .unwrap();
    remote
        .to_session
        .send(InboundEvent::AudioFragment(codec::encode(&vec![0.5; 4800])))
        .await
        .unwrap();
    remote
        .to_session
        .send(InboundEvent::AudioFragment(Vec::new()))
        .await
        .unwrap();
    remote
        .to_session
        .send(InboundEvent::InputTranscript("marker".into()))
        .await
        .unwrap();
    rig.transcripts.recv().await.unwrap();

    let scheduled = rig.speaker().scheduled();
    assert_eq!(scheduled.len(), 2);
    assert_eq!(scheduled[0].samples, 2400);
    assert!((scheduled[0].start_time - 0.05).abs() < 1e-9);
    assert!((scheduled[1].start_time - 0.15).abs() < 1e-9);
    assert_eq!(rig.session.playing(), 2);

    remote
        .to_session
        .send(InboundEvent::Interrupted)
        .await
        .unwrap();
    remote
        .to_session
        .send(InboundEvent::InputTranscript("marker".into()))
        .await
        .unwrap();
    rig.transcripts.recv().await.unwrap();

    let mut stopped = rig.speaker().stopped();
    stopped.sort();
    assert_eq!(stopped, vec![scheduled[0].id, scheduled[1].id]);
    assert_eq!(rig.session.playing(), 0);

    // Speech after barge-in starts a fresh schedule
    rig.speaker().set_time(0.02);
    remote
        .to_session
        .send(InboundEvent::AudioFragment(codec::encode(&[0.1; 240])))
        .await
        .unwrap();
    eventually(|| rig.speaker().scheduled().len() == 3).await;
    assert!((rig.speaker().scheduled()[2].start_time - 0.07).abs() < 1e-9);

    rig.session.stop().await;
    assert!(rig.speaker().is_closed());
}

#[tokio::test]
async fn test_playback_dropped_after_teardown() {
    let rig = Rig::new();
    rig.session.start().await.unwrap();
    let remote = rig.connector.take_remote();
    remote
        .to_session
        .send(InboundEvent::AudioFragment(codec::encode(&[0.3; 2400])))
        .await
        .unwrap();
    eventually(|| rig.session.playing() == 1).await;

    rig.session.stop().await;
    assert_eq!(rig.session.playing(), 0);
    // The fragment was stopped, not played out
    assert_eq!(rig.speaker().stopped().len(), 1);
}

#[test]
fn test_malformed_saved_deck_starts_with_default() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("deck.json");
    fs::write(&path, r#"{"saved_at": 42, "deck": {"slides": "lots"}}"#).unwrap();

    let deck = DeckStore::new(&path).load();
    assert_eq!(deck, Presentation::default());
    assert_eq!(deck.slides.len(), 1);
    assert_eq!(deck.slides[0].layout, SlideLayout::Title);
}
