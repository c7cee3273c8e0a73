//! Call signaling seam
//!
//! Every user registers under a stable address derived from their id, so
//! either side can reach the other without exchanging anything first. The
//! call machine only sees these traits; [`crate::peer`] provides the WebRTC
//! implementation.

use crate::error::Result;
use crate::media::{LocalStream, RemoteStream};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

pub type ConnectionId = String;

/// One media session with a remote peer, inbound or outbound.
#[async_trait]
pub trait MediaCall: Send + Sync {
    fn connection_id(&self) -> &str;

    /// Address of the remote peer.
    fn peer(&self) -> &str;

    /// Accepts an inbound call, sending `stream` to the caller.
    async fn answer(&self, stream: LocalStream) -> Result<()>;

    /// Hangs up. Safe to call more than once.
    fn close(&self);
}

pub enum BridgeEvent {
    Incoming(Arc<dyn MediaCall>),
    RemoteStream {
        connection: ConnectionId,
        stream: RemoteStream,
    },
    Closed {
        connection: ConnectionId,
    },
    /// `connection` is `None` for failures of the bridge itself.
    Error {
        connection: Option<ConnectionId>,
        kind: String,
    },
}

impl std::fmt::Debug for BridgeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Incoming(call) => f
                .debug_struct("Incoming")
                .field("connection", &call.connection_id())
                .field("peer", &call.peer())
                .finish(),
            Self::RemoteStream { connection, stream } => f
                .debug_struct("RemoteStream")
                .field("connection", connection)
                .field("stream", stream)
                .finish(),
            Self::Closed { connection } => {
                f.debug_struct("Closed").field("connection", connection).finish()
            }
            Self::Error { connection, kind } => f
                .debug_struct("Error")
                .field("connection", connection)
                .field("kind", kind)
                .finish(),
        }
    }
}

pub type BridgeEvents = mpsc::UnboundedReceiver<BridgeEvent>;

#[async_trait]
pub trait SignalingBridge: Send + Sync {
    /// Address this bridge is registered under.
    fn address(&self) -> &str;

    /// Places a call to `remote`, sending `stream`.
    async fn call(&self, remote: &str, stream: LocalStream) -> Result<Arc<dyn MediaCall>>;

    /// Closes every call and leaves the rendezvous server.
    fn shutdown(&self);
}

/// Registers a bridge for one chat screen.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn register(&self, address: &str) -> Result<(Arc<dyn SignalingBridge>, BridgeEvents)>;
}
