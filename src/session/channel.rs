use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::protocol::{self, InboundEvent, OutboundMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretBox};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

/// Outbound messages buffered before audio frames start being dropped
pub const OUTBOUND_CAPACITY: usize = 32;
const INBOUND_CAPACITY: usize = 256;

/// An open bidirectional channel to the agent.
///
/// Dropping `outbound` and cancelling `closer` releases the connection.
pub struct Channel {
    pub outbound: mpsc::Sender<OutboundMessage>,
    pub inbound: mpsc::Receiver<InboundEvent>,
    pub closer: CancellationToken,
}

/// Opens channels. `connect` resolves once the remote side has accepted
/// `setup`.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, setup: String) -> Result<Channel>;
}

/// Realtime agent over a WebSocket
pub struct WebSocketConnector {
    endpoint: String,
    api_key: SecretBox<String>,
    setup_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            api_key: SecretBox::new(Box::new(config.api_key().to_string())),
            setup_timeout: config.setup_timeout,
        }
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self, setup: String) -> Result<Channel> {
        let url = Url::parse_with_params(&self.endpoint, &[("key", self.api_key.expose_secret())])?;

        log::info!("🌐 Connecting to {}", self.endpoint);
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        write.send(Message::Text(setup.into())).await?;

        let wait_for_setup = async {
            while let Some(message) = read.next().await {
                let text = match message? {
                    Message::Text(text) => text.as_str().to_owned(),
                    Message::Binary(data) => String::from_utf8_lossy(data.as_slice()).into_owned(),
                    Message::Close(frame) => {
                        return Err(SessionError::Channel(format!(
                            "Closed during setup: {:?}",
                            frame
                        )))
                    }
                    _ => continue,
                };
                match protocol::parse_server_message(&text) {
                    Ok(frame) if frame.setup_complete => return Ok(()),
                    Ok(_) => log::debug!("🌐 Ignoring message before setup completed"),
                    Err(e) => log::warn!("🌐 Malformed message during setup: {}", e),
                }
            }
            Err(SessionError::Channel("Closed during setup".to_string()))
        };

        tokio::time::timeout(self.setup_timeout, wait_for_setup)
            .await
            .map_err(|_| SessionError::Channel("Timed out waiting for setup".to_string()))??;
        log::info!("🌐 Session channel open");

        let (out_tx, mut out_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<InboundEvent>(INBOUND_CAPACITY);
        let closer = CancellationToken::new();

        let writer_closer = closer.clone();
        let writer_events = in_tx.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = writer_closer.cancelled() => break,
                    message = out_rx.recv() => message,
                };
                let Some(message) = message else { break };
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        log::error!("🌐 Failed to serialize outbound message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    log::warn!("🌐 Send failed: {}", e);
                    let _ = writer_events.send(InboundEvent::Error(e.to_string())).await;
                    break;
                }
            }
            let _ = write.close().await;
            log::debug!("🌐 Writer finished");
        });

        let reader_closer = closer.clone();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = reader_closer.cancelled() => break,
                    message = read.next() => message,
                };
                let text = match message {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(data))) => String::from_utf8_lossy(data.as_slice()).into_owned(),
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("🌐 Remote closed the session: {:?}", frame);
                        let _ = in_tx.send(InboundEvent::Closed).await;
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        let _ = in_tx.send(InboundEvent::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = in_tx.send(InboundEvent::Closed).await;
                        break;
                    }
                };

                match protocol::parse_server_message(&text) {
                    Ok(frame) => {
                        for event in frame.events {
                            if in_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => log::warn!("🌐 Ignoring malformed message: {}", e),
                }
            }
            log::debug!("🌐 Reader finished");
        });

        Ok(Channel {
            outbound: out_tx,
            inbound: in_rx,
            closer,
        })
    }
}
