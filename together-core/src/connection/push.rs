//! Push transport over WebSocket

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::state::TransportSignal;
use crate::current_time_ms;
use crate::sync::{decode_inbound, PushMessage, SyncEvent};

#[derive(Debug, Error)]
pub enum PushError {
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("WebSocket handshake timed out after {0:?}")]
    Timeout(Duration),
}

/// Cloneable handle for queueing messages on an open link
#[derive(Debug, Clone)]
pub struct PushSender {
    outbound: mpsc::UnboundedSender<Message>,
}

impl PushSender {
    /// Queue a message. `false` once the link is gone.
    pub fn send(&self, message: PushMessage) -> bool {
        let kind = message.kind();
        let envelope = message.into_envelope(current_time_ms());
        match serde_json::to_string(&envelope) {
            Ok(text) => self.outbound.send(Message::Text(text)).is_ok(),
            Err(e) => {
                warn!("Failed to encode {} envelope: {}", kind, e);
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

/// An open push connection.
///
/// One task owns the socket: it writes queued messages and decodes inbound
/// frames onto the event channel. When the socket ends on its own a
/// `PushClosed` signal is raised; [`PushLink::close`] ends it silently.
pub struct PushLink {
    sender: PushSender,
    task: JoinHandle<()>,
}

impl PushLink {
    pub(crate) async fn open(
        url: &str,
        handshake_timeout: Duration,
        events: mpsc::UnboundedSender<SyncEvent>,
        signals: mpsc::UnboundedSender<TransportSignal>,
    ) -> Result<Self, PushError> {
        debug!("Opening push link to {}", url);
        let (stream, _) = tokio::time::timeout(handshake_timeout, connect_async(url))
            .await
            .map_err(|_| PushError::Timeout(handshake_timeout))??;
        info!("Push link open: {}", url);

        let (mut sink, mut source) = stream.split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();

        let task = tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    queued = queue.recv() => match queued {
                        Some(message) => {
                            if let Err(e) = sink.send(message).await {
                                break format!("send failed: {}", e);
                            }
                        }
                        None => break "outbound queue closed".to_string(),
                    },
                    incoming = source.next() => match incoming {
                        Some(Ok(Message::Text(text))) => match decode_inbound(&text) {
                            Ok(Some(event)) => {
                                if events.send(event).is_err() {
                                    break "event receiver gone".to_string();
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!("Malformed push message: {}", e),
                        },
                        Some(Ok(Message::Close(frame))) => {
                            break match frame {
                                Some(frame) => format!("closed by server ({})", frame.reason),
                                None => "closed by server".to_string(),
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break e.to_string(),
                        None => break "stream ended".to_string(),
                    },
                }
            };

            info!("Push link ended: {}", reason);
            let _ = signals.send(TransportSignal::PushClosed { reason });
        });

        Ok(Self {
            sender: PushSender { outbound },
            task,
        })
    }

    pub fn sender(&self) -> PushSender {
        self.sender.clone()
    }

    pub fn send(&self, message: PushMessage) -> bool {
        self.sender.send(message)
    }

    /// Drop the connection without raising `PushClosed`
    pub fn close(&self) {
        self.task.abort();
    }
}

impl Drop for PushLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}
