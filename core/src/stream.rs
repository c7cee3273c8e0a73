//! Live push stream of chat events
//!
//! One connection per open chat screen. The server pushes every message
//! created for the signed-in user (both directions) and typing signals; the
//! consumer filters to the conversation it shows. A dropped connection is not
//! retried, the history poll keeps the screen current.

use crate::auth::SessionContext;
use crate::error::Result;
use crate::models::{ChatMessage, UserId};
use crate::ClientConfig;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Message(ChatMessage),
    Typing { sender_id: UserId },
    Disconnected,
}

pub struct MessageStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    reader: JoinHandle<()>,
}

impl MessageStream {
    pub async fn connect(config: &ClientConfig, session: &SessionContext) -> Result<Self> {
        let mut url = config.stream_url()?;
        url.query_pairs_mut()
            .append_pair("token", &session.access_token);

        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (write, mut read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::info!("Message stream connected for user {}", session.user_id);

        let reader = tokio::spawn(async move {
            // Keep the write half alive so the socket is not half-closed.
            let _write = write;
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        if let Some(event) = parse_frame(&text) {
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        tracing::warn!("Message stream error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            tracing::info!("Message stream closed");
            let _ = tx.send(StreamEvent::Disconnected);
        });

        Ok(Self { events: rx, reader })
    }

    /// Next pushed event; `None` once the stream has ended and drained.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn close(&mut self) {
        self.reader.abort();
        self.events.close();
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Decodes one text frame. Unknown frames are ignored.
pub fn parse_frame(text: &str) -> Option<StreamEvent> {
    let data: Value = serde_json::from_str(text).ok()?;

    if let Some(message) = data.get("message") {
        return match serde_json::from_value::<ChatMessage>(message.clone()) {
            Ok(msg) => Some(StreamEvent::Message(msg)),
            Err(e) => {
                tracing::debug!("Dropping malformed pushed message: {}", e);
                None
            }
        };
    }

    match data["type"].as_str() {
        Some("typing") => data["sender_id"]
            .as_i64()
            .map(|sender_id| StreamEvent::Typing { sender_id }),
        _ => None,
    }
}
