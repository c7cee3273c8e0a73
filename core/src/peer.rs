//! WebRTC voice calls signaled through a PeerJS-compatible rendezvous server
//!
//! The rendezvous socket relays `OFFER`/`ANSWER`/`CANDIDATE` envelopes between
//! registered addresses. Audio is G.711 µ-law at 8 kHz in 20 ms frames.
//! Remote candidates that arrive before the remote description is applied are
//! held back and flushed afterwards.

use crate::error::{Error, Result};
use crate::media::{g711, AudioTrack, LocalStream, RemoteStream, SAMPLE_RATE};
use crate::signaling::{
    BridgeEvent, BridgeEvents, MediaCall, SignalingBridge, SignalingConnector,
};
use crate::ClientConfig;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const FRAME_DURATION: Duration = Duration::from_millis(20);

// ============================================================================
// Rendezvous protocol
// ============================================================================

/// Wire form of every rendezvous message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Envelope {
    fn heartbeat() -> Self {
        Self {
            kind: "HEARTBEAT".into(),
            src: None,
            dst: None,
            payload: None,
        }
    }

    fn relay(kind: &str, dst: &str, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            src: None,
            dst: Some(dst.to_string()),
            payload: Some(payload),
        }
    }

    pub fn offer(dst: &str, connection_id: &str, sdp: &str) -> Self {
        Self::relay(
            "OFFER",
            dst,
            json!({
                "sdp": { "type": "offer", "sdp": sdp },
                "type": "media",
                "connectionId": connection_id,
                "metadata": null
            }),
        )
    }

    pub fn answer(dst: &str, connection_id: &str, sdp: &str) -> Self {
        Self::relay(
            "ANSWER",
            dst,
            json!({
                "sdp": { "type": "answer", "sdp": sdp },
                "type": "media",
                "connectionId": connection_id
            }),
        )
    }

    pub fn candidate(dst: &str, connection_id: &str, candidate: &CandidatePayload) -> Self {
        Self::relay(
            "CANDIDATE",
            dst,
            json!({
                "candidate": candidate,
                "type": "media",
                "connectionId": connection_id
            }),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for CandidatePayload {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<CandidatePayload> for RTCIceCandidateInit {
    fn from(payload: CandidatePayload) -> Self {
        RTCIceCandidateInit {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
            username_fragment: payload.username_fragment,
        }
    }
}

/// Decoded server message.
#[derive(Debug, Clone, PartialEq)]
pub enum Rendezvous {
    Open,
    IdTaken,
    ServerError(String),
    Offer {
        src: String,
        connection_id: String,
        sdp: String,
    },
    Answer {
        src: String,
        connection_id: String,
        sdp: String,
    },
    Candidate {
        src: String,
        connection_id: String,
        candidate: CandidatePayload,
    },
    Leave {
        src: String,
    },
    Expire {
        src: String,
    },
}

pub fn parse_rendezvous(text: &str) -> Option<Rendezvous> {
    let envelope: Envelope = serde_json::from_str(text).ok()?;
    let payload = envelope.payload.unwrap_or(Value::Null);
    let src = envelope.src.unwrap_or_default();
    let connection_id = || payload["connectionId"].as_str().map(str::to_string);
    let sdp = || payload["sdp"]["sdp"].as_str().map(str::to_string);

    match envelope.kind.as_str() {
        "OPEN" => Some(Rendezvous::Open),
        "ID-TAKEN" => Some(Rendezvous::IdTaken),
        "ERROR" => Some(Rendezvous::ServerError(
            payload["msg"].as_str().unwrap_or("server-error").to_string(),
        )),
        "OFFER" if payload["type"] == "media" => Some(Rendezvous::Offer {
            connection_id: connection_id()?,
            sdp: sdp()?,
            src,
        }),
        "ANSWER" => Some(Rendezvous::Answer {
            connection_id: connection_id()?,
            sdp: sdp()?,
            src,
        }),
        "CANDIDATE" => Some(Rendezvous::Candidate {
            connection_id: connection_id()?,
            candidate: serde_json::from_value(payload["candidate"].clone()).ok()?,
            src,
        }),
        "LEAVE" => Some(Rendezvous::Leave { src }),
        "EXPIRE" => Some(Rendezvous::Expire { src }),
        _ => None,
    }
}

fn random_id(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub fn new_connection_id() -> String {
    format!("mc_{}", random_id(12))
}

// ============================================================================
// Bridge
// ============================================================================

struct Hub {
    address: String,
    api: API,
    ice_servers: Vec<String>,
    outbox: mpsc::UnboundedSender<Envelope>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    calls: Mutex<HashMap<String, Arc<PeerCall>>>,
}

impl Hub {
    fn report(&self, connection: Option<String>, kind: &str) {
        tracing::warn!("Peer error on {:?}: {}", connection, kind);
        let _ = self.events.send(BridgeEvent::Error {
            connection,
            kind: kind.to_string(),
        });
    }

    fn lookup(&self, connection_id: &str) -> Option<Arc<PeerCall>> {
        self.calls.lock().get(connection_id).cloned()
    }

    fn calls_with(&self, peer: &str) -> Vec<Arc<PeerCall>> {
        self.calls
            .lock()
            .values()
            .filter(|c| c.peer == peer)
            .cloned()
            .collect()
    }

    async fn new_connection(&self) -> Result<Arc<RTCPeerConnection>> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        Ok(Arc::new(self.api.new_peer_connection(config).await?))
    }

    async fn dispatch(self: &Arc<Self>, message: Rendezvous) {
        match message {
            Rendezvous::Open | Rendezvous::IdTaken => {}
            Rendezvous::ServerError(msg) => {
                tracing::warn!("Rendezvous server error: {}", msg);
                self.report(None, "server-error");
            }
            Rendezvous::Offer {
                src,
                connection_id,
                sdp,
            } => {
                tracing::info!("Incoming call {} from {}", connection_id, src);
                match PeerCall::create(self, connection_id.clone(), src, Some(sdp)).await {
                    Ok(call) => {
                        let _ = self.events.send(BridgeEvent::Incoming(call));
                    }
                    Err(e) => {
                        tracing::warn!("Could not set up inbound call: {}", e);
                        self.report(Some(connection_id), "webrtc");
                    }
                }
            }
            Rendezvous::Answer {
                connection_id, sdp, ..
            } => {
                let Some(call) = self.lookup(&connection_id) else {
                    tracing::debug!("Answer for unknown connection {}", connection_id);
                    return;
                };
                if let Err(e) = call.apply_answer(sdp).await {
                    tracing::warn!("Failed to apply answer: {}", e);
                    self.report(Some(connection_id), "webrtc");
                }
            }
            Rendezvous::Candidate {
                connection_id,
                candidate,
                ..
            } => {
                if let Some(call) = self.lookup(&connection_id) {
                    if let Err(e) = call.add_remote_candidate(candidate.into()).await {
                        tracing::debug!("Dropping remote candidate: {}", e);
                    }
                }
            }
            Rendezvous::Leave { src } => {
                for call in self.calls_with(&src) {
                    let connection = call.connection_id.clone();
                    call.close();
                    let _ = self.events.send(BridgeEvent::Closed { connection });
                }
            }
            Rendezvous::Expire { src } => {
                for call in self.calls_with(&src) {
                    let connection = call.connection_id.clone();
                    call.close();
                    self.report(Some(connection), "peer-unavailable");
                }
            }
        }
    }
}

pub struct PeerBridge {
    hub: Arc<Hub>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl PeerBridge {
    /// Opens the rendezvous socket under `address` and waits for the server
    /// to accept the registration.
    pub async fn register(config: &ClientConfig, address: &str) -> Result<(Self, BridgeEvents)> {
        let url = config.rendezvous.socket_url(address, &random_id(16));
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        let (mut sink, mut read) = ws_stream.split();

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Envelope>();
        let (events, events_rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Hub {
            address: address.to_string(),
            api,
            ice_servers: config.ice_servers.clone(),
            outbox,
            events,
            calls: Mutex::new(HashMap::new()),
        });

        let writer = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
            heartbeat.tick().await;
            loop {
                let envelope = tokio::select! {
                    next = outbox_rx.recv() => match next {
                        Some(envelope) => envelope,
                        None => break,
                    },
                    _ = heartbeat.tick() => Envelope::heartbeat(),
                };
                let text = match serde_json::to_string(&envelope) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to encode {} envelope: {}", envelope.kind, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(WsMessage::Text(text)).await {
                    tracing::warn!("Rendezvous send failed: {}", e);
                    break;
                }
            }
        });

        let (open_tx, open_rx) = oneshot::channel::<Result<()>>();
        let reader_hub = hub.clone();
        let reader = tokio::spawn(async move {
            let mut open_tx = Some(open_tx);
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => match parse_rendezvous(&text) {
                        Some(Rendezvous::Open) => {
                            if let Some(tx) = open_tx.take() {
                                let _ = tx.send(Ok(()));
                            }
                        }
                        Some(Rendezvous::IdTaken) => match open_tx.take() {
                            Some(tx) => {
                                let _ = tx.send(Err(Error::Signaling("unavailable-id".into())));
                            }
                            None => reader_hub.report(None, "unavailable-id"),
                        },
                        Some(message) => reader_hub.dispatch(message).await,
                        None => tracing::trace!("Ignoring rendezvous frame: {}", text),
                    },
                    Ok(WsMessage::Close(_)) => break,
                    Err(e) => {
                        tracing::warn!("Rendezvous socket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            match open_tx.take() {
                Some(tx) => {
                    let _ = tx.send(Err(Error::Signaling("socket-closed".into())));
                }
                None => reader_hub.report(None, "network"),
            }
        });

        let opened = match tokio::time::timeout(OPEN_TIMEOUT, open_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Signaling("socket-closed".into())),
            Err(_) => Err(Error::Signaling("rendezvous server did not answer".into())),
        };
        let bridge = Self { hub, reader, writer };
        opened?;

        tracing::info!("Registered for calls as {}", address);
        Ok((bridge, events_rx))
    }
}

#[async_trait]
impl SignalingBridge for PeerBridge {
    fn address(&self) -> &str {
        &self.hub.address
    }

    async fn call(&self, remote: &str, stream: LocalStream) -> Result<Arc<dyn MediaCall>> {
        let connection_id = new_connection_id();
        tracing::info!("Calling {} ({})", remote, connection_id);

        let call = PeerCall::create(&self.hub, connection_id, remote.to_string(), None).await?;
        if let Err(e) = call.send_offer(&stream).await {
            call.close();
            return Err(e);
        }
        Ok(call as Arc<dyn MediaCall>)
    }

    fn shutdown(&self) {
        let calls: Vec<_> = self.hub.calls.lock().values().cloned().collect();
        for call in calls {
            call.close();
        }
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for PeerBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Connects a [`PeerBridge`] for each chat screen.
pub struct PeerConnector {
    config: ClientConfig,
}

impl PeerConnector {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SignalingConnector for PeerConnector {
    async fn register(&self, address: &str) -> Result<(Arc<dyn SignalingBridge>, BridgeEvents)> {
        let (bridge, events) = PeerBridge::register(&self.config, address).await?;
        let bridge: Arc<dyn SignalingBridge> = Arc::new(bridge);
        Ok((bridge, events))
    }
}

// ============================================================================
// Media connection
// ============================================================================

#[derive(Default)]
struct Negotiation {
    remote_offer: Option<String>,
    remote_set: bool,
    pending: Vec<RTCIceCandidateInit>,
}

pub struct PeerCall {
    connection_id: String,
    peer: String,
    hub: Weak<Hub>,
    pc: Arc<RTCPeerConnection>,
    negotiation: tokio::sync::Mutex<Negotiation>,
    closed: Arc<AtomicBool>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl PeerCall {
    async fn create(
        hub: &Arc<Hub>,
        connection_id: String,
        peer: String,
        remote_offer: Option<String>,
    ) -> Result<Arc<Self>> {
        let pc = hub.new_connection().await?;
        let closed = Arc::new(AtomicBool::new(false));

        let outbox = hub.outbox.clone();
        let (dst, conn) = (peer.clone(), connection_id.clone());
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let outbox = outbox.clone();
            let (dst, conn) = (dst.clone(), conn.clone());
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = outbox.send(Envelope::candidate(&dst, &conn, &init.into()));
                    }
                    Err(e) => tracing::debug!("Unserializable local candidate: {}", e),
                }
            })
        }));

        let events = hub.events.clone();
        let conn = connection_id.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                let events = events.clone();
                let connection = conn.clone();
                Box::pin(async move {
                    let remote = RemoteStream::new(format!("{}-{}", connection, track.ssrc()));
                    let sink = remote.clone();
                    tokio::spawn(async move {
                        while let Ok((packet, _)) = track.read_rtp().await {
                            sink.push_samples(&g711::decode(&packet.payload));
                        }
                    });
                    let _ = events.send(BridgeEvent::RemoteStream {
                        connection,
                        stream: remote,
                    });
                })
            },
        ));

        let events = hub.events.clone();
        let conn = connection_id.clone();
        let closed_flag = closed.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let events = events.clone();
            let connection = conn.clone();
            let closed = closed_flag.clone();
            Box::pin(async move {
                tracing::debug!("Connection {} is {:?}", connection, state);
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                let event = match state {
                    RTCPeerConnectionState::Failed => BridgeEvent::Error {
                        connection: Some(connection),
                        kind: "negotiation-failed".into(),
                    },
                    RTCPeerConnectionState::Closed => BridgeEvent::Closed { connection },
                    _ => return,
                };
                let _ = events.send(event);
            })
        }));

        let call = Arc::new(Self {
            connection_id: connection_id.clone(),
            peer,
            hub: Arc::downgrade(hub),
            pc,
            negotiation: tokio::sync::Mutex::new(Negotiation {
                remote_offer,
                ..Default::default()
            }),
            closed,
            pump: Mutex::new(None),
        });
        hub.calls.lock().insert(connection_id, call.clone());
        Ok(call)
    }

    fn send(&self, envelope: Envelope) {
        if let Some(hub) = self.hub.upgrade() {
            let _ = hub.outbox.send(envelope);
        }
    }

    async fn attach_local(&self, stream: &LocalStream) -> Result<()> {
        let track = stream
            .audio_track()
            .cloned()
            .ok_or_else(|| Error::Media("local stream has no audio track".into()))?;

        let out = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_owned(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            track.id().to_string(),
            "mallu".to_owned(),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&out) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        tokio::spawn(async move {
            let mut rtcp = vec![0u8; 1500];
            while sender.read(&mut rtcp).await.is_ok() {}
        });

        let pump = spawn_pump(track, out);
        if let Some(old) = self.pump.lock().replace(pump) {
            old.abort();
        }
        Ok(())
    }

    async fn send_offer(&self, stream: &LocalStream) -> Result<()> {
        self.attach_local(stream).await?;
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Signaling("no local description".into()))?;
        self.send(Envelope::offer(&self.peer, &self.connection_id, &local.sdp));
        Ok(())
    }

    async fn apply_answer(&self, sdp: String) -> Result<()> {
        let mut negotiation = self.negotiation.lock().await;
        self.pc
            .set_remote_description(RTCSessionDescription::answer(sdp)?)
            .await?;
        negotiation.remote_set = true;
        self.flush_candidates(&mut negotiation).await
    }

    async fn add_remote_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        let mut negotiation = self.negotiation.lock().await;
        if negotiation.remote_set {
            self.pc.add_ice_candidate(candidate).await?;
        } else {
            negotiation.pending.push(candidate);
        }
        Ok(())
    }

    async fn flush_candidates(&self, negotiation: &mut Negotiation) -> Result<()> {
        for candidate in std::mem::take(&mut negotiation.pending) {
            self.pc.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MediaCall for PeerCall {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    async fn answer(&self, stream: LocalStream) -> Result<()> {
        let mut negotiation = self.negotiation.lock().await;
        let offer = negotiation
            .remote_offer
            .take()
            .ok_or_else(|| Error::Signaling("call was already answered".into()))?;

        self.attach_local(&stream).await?;
        self.pc
            .set_remote_description(RTCSessionDescription::offer(offer)?)
            .await?;
        negotiation.remote_set = true;
        self.flush_candidates(&mut negotiation).await?;

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| Error::Signaling("no local description".into()))?;
        self.send(Envelope::answer(&self.peer, &self.connection_id, &local.sdp));
        tracing::info!("Answered {} from {}", self.connection_id, self.peer);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("Closing connection {}", self.connection_id);
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.calls.lock().remove(&self.connection_id);
        }
        let pc = self.pc.clone();
        tokio::spawn(async move {
            if let Err(e) = pc.close().await {
                tracing::debug!("Peer connection close failed: {}", e);
            }
        });
    }
}

fn spawn_pump(track: Arc<AudioTrack>, out: Arc<TrackLocalStaticSample>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FRAME_DURATION);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if !track.is_live() {
                break;
            }
            let sample = Sample {
                data: Bytes::from(g711::encode(&track.next_frame())),
                duration: FRAME_DURATION,
                ..Default::default()
            };
            if let Err(e) = out.write_sample(&sample).await {
                tracing::debug!("Audio pump stopped: {}", e);
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_offer_and_candidate() {
        let offer = r#"{"type":"OFFER","src":"mallu_user_4","dst":"mallu_user_9",
            "payload":{"sdp":{"type":"offer","sdp":"v=0\r\n"},"type":"media",
            "connectionId":"mc_abc","metadata":null}}"#;
        assert_eq!(
            parse_rendezvous(offer),
            Some(Rendezvous::Offer {
                src: "mallu_user_4".into(),
                connection_id: "mc_abc".into(),
                sdp: "v=0\r\n".into(),
            })
        );

        let candidate = r#"{"type":"CANDIDATE","src":"mallu_user_4",
            "payload":{"candidate":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 5000 typ host",
            "sdpMid":"0","sdpMLineIndex":0},"type":"media","connectionId":"mc_abc"}}"#;
        match parse_rendezvous(candidate) {
            Some(Rendezvous::Candidate {
                connection_id,
                candidate,
                ..
            }) => {
                assert_eq!(connection_id, "mc_abc");
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_control_messages() {
        assert_eq!(parse_rendezvous(r#"{"type":"OPEN"}"#), Some(Rendezvous::Open));
        assert_eq!(
            parse_rendezvous(r#"{"type":"ID-TAKEN","payload":{"msg":"taken"}}"#),
            Some(Rendezvous::IdTaken)
        );
        assert_eq!(
            parse_rendezvous(r#"{"type":"EXPIRE","src":"mallu_user_2"}"#),
            Some(Rendezvous::Expire { src: "mallu_user_2".into() })
        );
        assert_eq!(
            parse_rendezvous(r#"{"type":"ERROR","payload":{"msg":"Invalid key"}}"#),
            Some(Rendezvous::ServerError("Invalid key".into()))
        );
        // Data-channel offers are not ours to answer.
        assert_eq!(
            parse_rendezvous(r#"{"type":"OFFER","src":"a","payload":{"type":"data","connectionId":"dc_1","sdp":{"sdp":"x"}}}"#),
            None
        );
        assert_eq!(parse_rendezvous(r#"{"type":"HEARTBEAT"}"#), None);
    }

    #[test]
    fn test_outgoing_envelopes() {
        let offer = serde_json::to_value(Envelope::offer("mallu_user_9", "mc_x", "v=0")).unwrap();
        assert_eq!(offer["type"], "OFFER");
        assert_eq!(offer["dst"], "mallu_user_9");
        assert_eq!(offer["payload"]["sdp"]["type"], "offer");
        assert_eq!(offer["payload"]["connectionId"], "mc_x");
        assert!(offer.get("src").is_none());

        let heartbeat = serde_json::to_string(&Envelope::heartbeat()).unwrap();
        assert_eq!(heartbeat, r#"{"type":"HEARTBEAT"}"#);
    }

    #[test]
    fn test_connection_ids() {
        let a = new_connection_id();
        let b = new_connection_id();
        assert!(a.starts_with("mc_"));
        assert_eq!(a.len(), 15);
        assert_ne!(a, b);
    }
}
