//! Websocket transport to the remote model.
//!
//! `connect` fetches an ephemeral credential, opens the socket with it, and sends
//! the `session.configure` frame, all before one shared deadline. After that the
//! socket is split: a writer task drains an outbound queue, a reader task turns
//! messages into [`TransportEvent`]s in arrival order.

use crate::credential::CredentialProvider;
use crate::error::{ConnectError, VoiceError, VoiceResult};
use crate::protocol::{ClientFrame, ServerFrame, SessionConfiguration};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

/// What the reader task reports.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Frame(ServerFrame),
    /// A message that did not parse as a frame. The session continues.
    Malformed(String),
    /// Socket closed by the remote or failed. Carries the reason if there was one.
    Closed(Option<String>),
}

enum Outbound {
    Frame(ClientFrame),
    Close,
}

pub struct SessionTransport {
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl SessionTransport {
    /// Open and configure a session. The credential is requested exactly once.
    pub async fn connect(
        credentials: &dyn CredentialProvider,
        endpoint: &str,
        configuration: SessionConfiguration,
        timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), ConnectError> {
        let deadline = Instant::now() + timeout;

        let credential = tokio::time::timeout_at(deadline, credentials.ephemeral_credential())
            .await
            .map_err(|_| {
                warn!("Credential fetch timed out after {:?}", timeout);
                ConnectError::Timeout(timeout)
            })?
            .ok_or(ConnectError::CredentialUnavailable)?;
        if credential.is_expired_at(Utc::now()) {
            warn!("Ephemeral credential already expired at {}", credential.expires_at);
            return Err(ConnectError::CredentialUnavailable);
        }

        let mut request = endpoint
            .into_client_request()
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.secret))
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let configure = ClientFrame::SessionConfigure(configuration)
            .to_json()
            .map_err(|e| ConnectError::Handshake(e.to_string()))?;

        info!("🔌 Connecting to {}", endpoint);

        // Dropping the future on timeout drops the half-open socket with it.
        let opened = tokio::time::timeout_at(deadline, async move {
            let (mut ws, _response) = tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| ConnectError::Transport(e.to_string()))?;
            ws.send(Message::Text(configure))
                .await
                .map_err(|e| ConnectError::Transport(e.to_string()))?;
            Ok::<_, ConnectError>(ws)
        })
        .await;

        let ws = match opened {
            Ok(result) => result?,
            Err(_) => {
                warn!("Connect timed out after {:?}", timeout);
                return Err(ConnectError::Timeout(timeout));
            }
        };

        info!("✅ Session socket open, configuration sent");

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<TransportEvent>();

        let writer = tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                match outbound {
                    Outbound::Frame(frame) => {
                        let json = match frame.to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                error!("Failed to encode {}: {}", frame.kind(), e);
                                continue;
                            }
                        };
                        if sink.send(Message::Text(json)).await.is_err() {
                            warn!("Socket send failed, closing writer");
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = sink.close().await;
            debug!("Transport writer ended");
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if !dispatch(&text, &event_tx) {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) if text.trim_start().starts_with('{') => {
                            if !dispatch(text, &event_tx) {
                                return;
                            }
                        }
                        _ => {
                            warn!("Skipping non-JSON binary message ({} bytes)", data.len());
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            info!("Session socket closed ({})", reason.as_deref().unwrap_or("no reason"));
            let _ = event_tx.send(TransportEvent::Closed(reason));
        });

        Ok((
            Self {
                outbound: Some(out_tx),
                reader: Some(reader),
                writer: Some(writer),
            },
            event_rx,
        ))
    }

    pub fn is_open(&self) -> bool {
        self.outbound.is_some()
            && self.writer.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Queue one frame for the writer task.
    pub fn send(&self, frame: ClientFrame) -> VoiceResult<()> {
        let outbound = self.outbound.as_ref().ok_or(VoiceError::NotConnected)?;
        outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| VoiceError::TransportClosed("writer stopped".to_string()))
    }

    /// Close the socket. Idempotent. No events are delivered afterwards.
    pub fn disconnect(&mut self) {
        let Some(outbound) = self.outbound.take() else {
            return;
        };
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        // The writer flushes queued frames, sends Close, then exits by itself.
        let _ = outbound.send(Outbound::Close);
        self.writer.take();
        info!("🔌 Session socket disconnected");
    }
}

impl Drop for SessionTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Forward one JSON message. Returns false once nobody is listening.
fn dispatch(text: &str, events: &mpsc::UnboundedSender<TransportEvent>) -> bool {
    let event = match ServerFrame::parse(text) {
        Ok(frame) => TransportEvent::Frame(frame),
        Err(e) => {
            warn!("Dropping malformed frame: {}", e);
            TransportEvent::Malformed(e.to_string())
        }
    };
    events.send(event).is_ok()
}
