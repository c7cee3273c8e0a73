//! In-memory stand-ins for the server, the audio devices and the signaling
//! network, shared by the unit tests.

use crate::error::{Error, Result};
use crate::media::{
    AudioConstraints, AudioOutput, AudioTrack, LocalStream, MediaDevices, PlaybackHandle,
    RemoteStream,
};
use crate::models::*;
use crate::ringtone::ToneSource;
use crate::signaling::{BridgeEvent, BridgeEvents, MediaCall, SignalingBridge, SignalingConnector};
use crate::transport::ChatApi;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn address(user: UserId) -> String {
    format!("mallu_user_{}", user)
}

// ============================================================================
// Server
// ============================================================================

#[derive(Default)]
struct ApiState {
    history: Vec<ChatMessage>,
    partner_status: Option<PartnerStatus>,
    sent: Vec<SendMessageRequest>,
    send_error: Option<(u16, Option<String>)>,
    send_delay: Option<Duration>,
    unauthorized: bool,
    typing: Vec<UserId>,
    started: Vec<UserId>,
    answered: Vec<CallId>,
    ended: Vec<CallId>,
    start_fails: bool,
    poll: CallPoll,
    reports: Vec<(UserId, ReportReason)>,
    blocks: Vec<UserId>,
}

pub struct FakeApi {
    me: UserId,
    next_call: AtomicI64,
    next_message: AtomicI64,
    state: Mutex<ApiState>,
}

impl FakeApi {
    pub fn new(me: UserId) -> Self {
        Self {
            me,
            next_call: AtomicI64::new(100),
            next_message: AtomicI64::new(1000),
            state: Mutex::new(ApiState::default()),
        }
    }

    pub fn set_history(&self, messages: Vec<ChatMessage>, status: Option<PartnerStatus>) {
        let mut state = self.state.lock();
        state.history = messages;
        state.partner_status = status;
    }

    pub fn fail_sends(&self, status: u16, message: Option<&str>) {
        self.state.lock().send_error = Some((status, message.map(str::to_string)));
    }

    /// Holds every send for `delay` before answering.
    pub fn delay_sends(&self, delay: Duration) {
        self.state.lock().send_delay = Some(delay);
    }

    /// Answers history and poll requests with 401 from now on.
    pub fn reject_credentials(&self) {
        self.state.lock().unauthorized = true;
    }

    pub fn fail_start_call(&self) {
        self.state.lock().start_fails = true;
    }

    pub fn set_poll(&self, poll: CallPoll) {
        self.state.lock().poll = poll;
    }

    pub fn sent(&self) -> Vec<SendMessageRequest> {
        self.state.lock().sent.clone()
    }

    pub fn typing(&self) -> Vec<UserId> {
        self.state.lock().typing.clone()
    }

    pub fn started(&self) -> Vec<UserId> {
        self.state.lock().started.clone()
    }

    pub fn answered(&self) -> Vec<CallId> {
        self.state.lock().answered.clone()
    }

    pub fn ended(&self) -> Vec<CallId> {
        self.state.lock().ended.clone()
    }

    pub fn reports(&self) -> Vec<(UserId, ReportReason)> {
        self.state.lock().reports.clone()
    }

    pub fn blocks(&self) -> Vec<UserId> {
        self.state.lock().blocks.clone()
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn history(&self, _partner: UserId) -> Result<ConversationHistory> {
        let state = self.state.lock();
        if state.unauthorized {
            return Err(Error::Unauthorized);
        }
        Ok(ConversationHistory {
            messages: state.history.clone(),
            partner_status: state.partner_status.clone(),
        })
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<ChatMessage> {
        let delay = {
            let mut state = self.state.lock();
            state.sent.push(request.clone());
            state.send_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if let Some((status, message)) = state.send_error.clone() {
            return Err(Error::Http { status, message });
        }
        let message = ChatMessage {
            id: Some(self.next_message.fetch_add(1, Ordering::SeqCst)),
            sender: self.me,
            receiver: request.receiver,
            content: request.content.clone(),
            message_type: request.message_type,
            parent_message: request.parent_message,
            reply_to: None,
            timestamp: Utc::now(),
            is_read: false,
            local_key: None,
        };
        state.history.push(message.clone());
        Ok(message)
    }

    async fn send_typing(&self, receiver: UserId) -> Result<()> {
        self.state.lock().typing.push(receiver);
        Ok(())
    }

    async fn start_call(&self, receiver: UserId) -> Result<CallRecord> {
        let mut state = self.state.lock();
        state.started.push(receiver);
        if state.start_fails {
            return Err(Error::Http {
                status: 500,
                message: None,
            });
        }
        Ok(CallRecord {
            id: self.next_call.fetch_add(1, Ordering::SeqCst),
            caller: self.me,
            receiver,
            status: CallStatus::Initiated,
            caller_name: None,
            created_at: None,
            updated_at: None,
        })
    }

    async fn answer_call(&self, call_id: CallId) -> Result<()> {
        self.state.lock().answered.push(call_id);
        Ok(())
    }

    async fn end_call(&self, call_id: CallId) -> Result<()> {
        self.state.lock().ended.push(call_id);
        Ok(())
    }

    async fn poll_calls(&self) -> Result<CallPoll> {
        let state = self.state.lock();
        if state.unauthorized {
            return Err(Error::Unauthorized);
        }
        Ok(state.poll.clone())
    }

    async fn profile(&self, user_id: UserId) -> Result<PartnerProfile> {
        Ok(PartnerProfile {
            first_name: Some(format!("User{}", user_id)),
            photos: vec![],
        })
    }

    async fn report(
        &self,
        user_id: UserId,
        reason: ReportReason,
        _explanation: &str,
    ) -> Result<()> {
        self.state.lock().reports.push((user_id, reason));
        Ok(())
    }

    async fn block(&self, user_id: UserId) -> Result<()> {
        self.state.lock().blocks.push(user_id);
        Ok(())
    }
}

// ============================================================================
// Devices
// ============================================================================

struct Live(Arc<AtomicUsize>);

impl Live {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct FakeDevices {
    streams: Mutex<Vec<LocalStream>>,
    deny_microphone: AtomicBool,
    block_playback: AtomicBool,
    tones: Arc<AtomicUsize>,
    playbacks: Arc<AtomicUsize>,
}

impl FakeDevices {
    pub fn deny_microphone(&self) {
        self.deny_microphone.store(true, Ordering::SeqCst);
    }

    pub fn block_playback(&self, blocked: bool) {
        self.block_playback.store(blocked, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn all_streams_stopped(&self) -> bool {
        self.streams.lock().iter().all(|s| !s.is_live())
    }

    pub fn last_track(&self) -> Option<Arc<AudioTrack>> {
        self.streams
            .lock()
            .last()
            .and_then(|s| s.audio_track().cloned())
    }

    pub fn live_tones(&self) -> usize {
        self.tones.load(Ordering::SeqCst)
    }

    pub fn live_playbacks(&self) -> usize {
        self.playbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire_microphone(&self, _constraints: &AudioConstraints) -> Result<LocalStream> {
        if self.deny_microphone.load(Ordering::SeqCst) {
            return Err(Error::Media("permission denied".into()));
        }
        let mut streams = self.streams.lock();
        let stream = LocalStream::new(vec![AudioTrack::silent(format!("mic-{}", streams.len()))]);
        streams.push(stream.clone());
        Ok(stream)
    }
}

impl AudioOutput for FakeDevices {
    fn play_remote(&self, _stream: &RemoteStream) -> Result<PlaybackHandle> {
        if self.block_playback.load(Ordering::SeqCst) {
            return Err(Error::PlaybackBlocked("needs a user gesture".into()));
        }
        Ok(PlaybackHandle::new(Live::new(&self.playbacks)))
    }

    fn open_tone(&self, _tone: ToneSource) -> Result<PlaybackHandle> {
        Ok(PlaybackHandle::new(Live::new(&self.tones)))
    }
}

// ============================================================================
// Signaling
// ============================================================================

type Peers = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<BridgeEvent>>>>;

/// Connects loopback bridges to each other by address.
#[derive(Clone, Default)]
pub struct Switchboard {
    peers: Peers,
    next: Arc<AtomicU64>,
}

impl Switchboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, address: &str) -> (Arc<LoopbackBridge>, BridgeEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().insert(address.to_string(), tx.clone());
        let bridge = Arc::new(LoopbackBridge {
            address: address.to_string(),
            peers: self.peers.clone(),
            next: self.next.clone(),
            events: tx,
            placed: Mutex::new(Vec::new()),
        });
        (bridge, rx)
    }
}

#[async_trait]
impl SignalingConnector for Switchboard {
    async fn register(&self, address: &str) -> Result<(Arc<dyn SignalingBridge>, BridgeEvents)> {
        let (bridge, events) = self.join(address);
        let bridge: Arc<dyn SignalingBridge> = bridge;
        Ok((bridge, events))
    }
}

pub struct LoopbackBridge {
    address: String,
    peers: Peers,
    next: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    placed: Mutex<Vec<Arc<LoopbackCall>>>,
}

impl LoopbackBridge {
    pub fn placed(&self) -> Vec<Arc<LoopbackCall>> {
        self.placed.lock().clone()
    }
}

#[async_trait]
impl SignalingBridge for LoopbackBridge {
    fn address(&self) -> &str {
        &self.address
    }

    async fn call(&self, remote: &str, _stream: LocalStream) -> Result<Arc<dyn MediaCall>> {
        let id = format!("mc_{}", self.next.fetch_add(1, Ordering::SeqCst));
        let theirs = self.peers.lock().get(remote).cloned();

        if let Some(tx) = &theirs {
            let callee = LoopbackCall::linked(
                &id,
                &self.address,
                Some(tx.clone()),
                Some(self.events.clone()),
            );
            let _ = tx.send(BridgeEvent::Incoming(callee));
        }
        let caller = LoopbackCall::linked(&id, remote, Some(self.events.clone()), theirs);
        self.placed.lock().push(caller.clone());
        Ok(caller)
    }

    fn shutdown(&self) {
        self.peers.lock().remove(&self.address);
    }
}

/// One end of a loopback call. Both ends share the connection id.
pub struct LoopbackCall {
    id: String,
    peer: String,
    mine: Option<mpsc::UnboundedSender<BridgeEvent>>,
    theirs: Option<mpsc::UnboundedSender<BridgeEvent>>,
    answered: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackCall {
    fn linked(
        id: &str,
        peer: &str,
        mine: Option<mpsc::UnboundedSender<BridgeEvent>>,
        theirs: Option<mpsc::UnboundedSender<BridgeEvent>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            peer: peer.to_string(),
            mine,
            theirs,
            answered: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// A call with no other end, for driving a machine by hand.
    pub fn detached(id: &str, peer: &str) -> Arc<Self> {
        Self::linked(id, peer, None, None)
    }

    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCall for LoopbackCall {
    fn connection_id(&self) -> &str {
        &self.id
    }

    fn peer(&self) -> &str {
        &self.peer
    }

    async fn answer(&self, _stream: LocalStream) -> Result<()> {
        self.answered.store(true, Ordering::SeqCst);
        for tx in self.mine.iter().chain(self.theirs.iter()) {
            let _ = tx.send(BridgeEvent::RemoteStream {
                connection: self.id.clone(),
                stream: RemoteStream::new(format!("{}-audio", self.id)),
            });
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = &self.theirs {
            let _ = tx.send(BridgeEvent::Closed {
                connection: self.id.clone(),
            });
        }
    }
}
