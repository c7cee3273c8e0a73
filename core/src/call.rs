//! Voice call state machine
//!
//! Inputs come from three places that know nothing of each other: the user,
//! the peer-to-peer bridge and the server's call poll. They are all
//! [`CallSignal`]s and go through [`CallMachine::apply`]. Every handler is
//! safe in every state, so duplicates and late arrivals are no-ops.
//!
//! The signaling handle, local stream and ringtone only exist while a call
//! is active; tearing down drops them together with the active state.

use crate::chat::Notice;
use crate::error::{Error, Result};
use crate::media::{
    AudioConstraints, AudioOutput, LocalStream, MediaDevices, PlaybackHandle, RemoteStream,
};
use crate::models::{CallId, CallPoll, CallRecord, CallStatus, UserId};
use crate::ringtone::{RingPattern, Ringtone};
use crate::signaling::{BridgeEvent, ConnectionId, MediaCall, SignalingBridge};
use crate::transport::ChatApi;
use std::sync::Arc;

pub const STEP_CALLING: &str = "Calling...";
pub const STEP_CONNECTING: &str = "Connecting...";
pub const STEP_DIALING_BACK: &str = "Dialing back...";
pub const STEP_VOICE_ACTIVE: &str = "Voice Active";
pub const STEP_TAP_TO_UNMUTE: &str = "Tap to Unmute";
pub const STEP_CONNECTING_VOICE: &str = "Connecting voice...";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallPhase {
    #[default]
    Idle,
    Dialing,
    Incoming,
    Connecting,
    Connected,
}

pub enum CallSignal {
    Dial,
    Accept,
    Hangup,
    ToggleMute,
    /// Retry remote playback after the output refused to start.
    ResumePlayback,
    PeerIncoming(Arc<dyn MediaCall>),
    PeerStream {
        connection: ConnectionId,
        stream: RemoteStream,
    },
    PeerClosed {
        connection: ConnectionId,
    },
    PeerError {
        connection: Option<ConnectionId>,
        kind: String,
    },
    ServerIncoming(CallRecord),
    ServerUpdate(CallRecord),
}

impl std::fmt::Debug for CallSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dial => f.write_str("Dial"),
            Self::Accept => f.write_str("Accept"),
            Self::Hangup => f.write_str("Hangup"),
            Self::ToggleMute => f.write_str("ToggleMute"),
            Self::ResumePlayback => f.write_str("ResumePlayback"),
            Self::PeerIncoming(call) => write!(f, "PeerIncoming({})", call.connection_id()),
            Self::PeerStream { connection, .. } => write!(f, "PeerStream({})", connection),
            Self::PeerClosed { connection } => write!(f, "PeerClosed({})", connection),
            Self::PeerError { connection, kind } => {
                write!(f, "PeerError({:?}, {})", connection, kind)
            }
            Self::ServerIncoming(record) => write!(f, "ServerIncoming({})", record.id),
            Self::ServerUpdate(record) => {
                write!(f, "ServerUpdate({}, {:?})", record.id, record.status)
            }
        }
    }
}

impl From<BridgeEvent> for CallSignal {
    fn from(event: BridgeEvent) -> Self {
        match event {
            BridgeEvent::Incoming(call) => Self::PeerIncoming(call),
            BridgeEvent::RemoteStream { connection, stream } => {
                Self::PeerStream { connection, stream }
            }
            BridgeEvent::Closed { connection } => Self::PeerClosed { connection },
            BridgeEvent::Error { connection, kind } => Self::PeerError { connection, kind },
        }
    }
}

/// Signals carried by one answer of the call poll endpoint.
pub fn signals_from_poll(poll: CallPoll) -> Vec<CallSignal> {
    let mut signals = Vec::new();
    if let Some(record) = poll.incoming {
        signals.push(CallSignal::ServerIncoming(record));
    }
    if let Some(record) = poll.my_call {
        signals.push(CallSignal::ServerUpdate(record));
    }
    if let Some(record) = poll.incoming_update {
        signals.push(CallSignal::ServerUpdate(record));
    }
    signals
}

/// What a renderer needs to know about the call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallView {
    pub phase: CallPhase,
    pub step: String,
    pub muted: bool,
    pub remote: Option<UserId>,
    pub server_id: Option<CallId>,
    pub ringing: bool,
}

pub type CallObserver = Box<dyn Fn(&CallView) + Send + Sync>;

// ============================================================================
// State
// ============================================================================

struct ActiveCall {
    phase: CallPhase,
    remote: UserId,
    step: String,
    muted: bool,
    server_id: Option<CallId>,
    handle: Option<Arc<dyn MediaCall>>,
    local: Option<LocalStream>,
    ringtone: Ringtone,
    remote_stream: Option<RemoteStream>,
    playback: Option<PlaybackHandle>,
}

impl ActiveCall {
    fn new(phase: CallPhase, remote: UserId, output: Arc<dyn AudioOutput>) -> Self {
        Self {
            phase,
            remote,
            step: String::new(),
            muted: false,
            server_id: None,
            handle: None,
            local: None,
            ringtone: Ringtone::new(output),
            remote_stream: None,
            playback: None,
        }
    }

    fn ring(&mut self, pattern: RingPattern) {
        if let Err(e) = self.ringtone.start(pattern) {
            tracing::warn!("Ringtone unavailable: {}", e);
        }
    }

    fn owns(&self, connection: &str) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| h.connection_id() == connection)
    }

    /// Swaps in a new signaling handle, hanging up the previous one.
    fn replace_handle(&mut self, handle: Arc<dyn MediaCall>) {
        if let Some(old) = self.handle.replace(handle) {
            old.close();
        }
    }

    fn release(mut self) {
        self.ringtone.stop();
        self.playback.take();
        if let Some(local) = self.local.take() {
            local.stop_all();
        }
        if let Some(handle) = self.handle.take() {
            handle.close();
        }
    }
}

enum CallState {
    Idle,
    Active(ActiveCall),
}

// ============================================================================
// Machine
// ============================================================================

pub struct CallMachine {
    partner: UserId,
    partner_address: String,
    state: CallState,
    api: Arc<dyn ChatApi>,
    bridge: Option<Arc<dyn SignalingBridge>>,
    devices: Arc<dyn MediaDevices>,
    output: Arc<dyn AudioOutput>,
    observer: Option<CallObserver>,
}

impl CallMachine {
    pub fn new(
        partner: UserId,
        partner_address: impl Into<String>,
        api: Arc<dyn ChatApi>,
        devices: Arc<dyn MediaDevices>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        Self {
            partner,
            partner_address: partner_address.into(),
            state: CallState::Idle,
            api,
            bridge: None,
            devices,
            output,
            observer: None,
        }
    }

    pub fn set_bridge(&mut self, bridge: Option<Arc<dyn SignalingBridge>>) {
        self.bridge = bridge;
    }

    /// Called with the current view whenever a transition pauses on I/O.
    pub fn set_observer(&mut self, observer: CallObserver) {
        self.observer = Some(observer);
    }

    pub fn phase(&self) -> CallPhase {
        match &self.state {
            CallState::Idle => CallPhase::Idle,
            CallState::Active(active) => active.phase,
        }
    }

    pub fn view(&self) -> CallView {
        match &self.state {
            CallState::Idle => CallView::default(),
            CallState::Active(active) => CallView {
                phase: active.phase,
                step: active.step.clone(),
                muted: active.muted,
                remote: Some(active.remote),
                server_id: active.server_id,
                ringing: active.ringtone.is_playing(),
            },
        }
    }

    fn notify(&self) {
        if let Some(observer) = &self.observer {
            observer(&self.view());
        }
    }

    fn active_mut(&mut self) -> Result<&mut ActiveCall> {
        match &mut self.state {
            CallState::Active(active) => Ok(active),
            CallState::Idle => Err(Error::Signaling("call already ended".into())),
        }
    }

    /// Returns to idle, releasing everything the call held. Idempotent.
    pub fn teardown(&mut self) {
        if let CallState::Active(active) = std::mem::replace(&mut self.state, CallState::Idle) {
            tracing::info!("Call with {} torn down", active.remote);
            active.release();
            self.notify();
        }
    }

    /// Applies one input. Returns a notice when the user should be told
    /// about a failure.
    pub async fn apply(&mut self, signal: CallSignal) -> Option<Notice> {
        tracing::debug!("Call signal {:?} in {:?}", signal, self.phase());
        match signal {
            CallSignal::Dial => self.dial().await,
            CallSignal::Accept => self.accept().await,
            CallSignal::Hangup => {
                self.hangup().await;
                None
            }
            CallSignal::ToggleMute => {
                self.toggle_mute();
                None
            }
            CallSignal::ResumePlayback => {
                self.resume_playback();
                None
            }
            CallSignal::PeerIncoming(call) => self.peer_incoming(call).await,
            CallSignal::PeerStream { connection, stream } => {
                self.peer_stream(&connection, stream);
                None
            }
            CallSignal::PeerClosed { connection } => {
                if self.owns(&connection) {
                    tracing::info!("Remote side closed {}", connection);
                    self.teardown();
                }
                None
            }
            CallSignal::PeerError { connection, kind } => self.peer_error(connection, kind),
            CallSignal::ServerIncoming(record) => {
                self.server_incoming(record);
                None
            }
            CallSignal::ServerUpdate(record) => {
                self.server_update(record);
                None
            }
        }
    }

    fn owns(&self, connection: &str) -> bool {
        match &self.state {
            CallState::Active(active) => active.owns(connection),
            CallState::Idle => false,
        }
    }

    // ------------------------------------------------------------------------
    // Local
    // ------------------------------------------------------------------------

    async fn dial(&mut self) -> Option<Notice> {
        if !matches!(self.state, CallState::Idle) {
            tracing::debug!("Dial ignored, call already in progress");
            return None;
        }

        let mut active = ActiveCall::new(CallPhase::Dialing, self.partner, self.output.clone());
        active.step = STEP_CALLING.to_string();
        active.ring(RingPattern::Outgoing);
        self.state = CallState::Active(active);
        self.notify();

        match self.place_call().await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!("Call to {} failed: {}", self.partner, e);
                self.teardown();
                Some(Notice::error(format!("Call failed: {}", e)))
            }
        }
    }

    async fn place_call(&mut self) -> Result<()> {
        let devices = self.devices.clone();
        let api = self.api.clone();
        let bridge = self.bridge.clone();
        let (partner, address) = (self.partner, self.partner_address.clone());

        let stream = devices.acquire_microphone(&AudioConstraints::default()).await?;
        self.active_mut()?.local = Some(stream.clone());

        let record = api.start_call(partner).await?;
        self.active_mut()?.server_id = Some(record.id);

        match bridge {
            Some(bridge) => {
                let handle = bridge.call(&address, stream).await?;
                self.active_mut()?.replace_handle(handle);
            }
            None => tracing::warn!("No signaling bridge, waiting for {} to dial back", partner),
        }
        Ok(())
    }

    async fn accept(&mut self) -> Option<Notice> {
        let Ok(active) = self.active_mut() else {
            return None;
        };
        if active.phase != CallPhase::Incoming {
            return None;
        }
        active.ringtone.stop();
        active.phase = CallPhase::Connecting;
        active.step = STEP_CONNECTING.to_string();
        self.notify();

        match self.answer().await {
            Ok(()) => None,
            Err(e) => {
                tracing::warn!("Answering {} failed: {}", self.partner, e);
                self.teardown();
                Some(Notice::error("Answer failed"))
            }
        }
    }

    async fn answer(&mut self) -> Result<()> {
        let devices = self.devices.clone();
        let api = self.api.clone();
        let bridge = self.bridge.clone();
        let address = self.partner_address.clone();

        let stream = devices.acquire_microphone(&AudioConstraints::default()).await?;
        let active = self.active_mut()?;
        active.local = Some(stream.clone());

        match active.handle.clone() {
            Some(handle) => handle.answer(stream).await?,
            None => {
                active.step = STEP_DIALING_BACK.to_string();
                self.notify();
                let bridge = bridge
                    .ok_or_else(|| Error::Signaling("calls are unavailable".into()))?;
                let handle = bridge.call(&address, stream).await?;
                self.active_mut()?.replace_handle(handle);
            }
        }

        if let Some(id) = self.active_mut()?.server_id {
            api.answer_call(id).await?;
        }
        let active = self.active_mut()?;
        if active.phase == CallPhase::Connecting {
            active.phase = CallPhase::Connected;
        }
        Ok(())
    }

    async fn hangup(&mut self) {
        let server_id = match &self.state {
            CallState::Active(active) => active.server_id,
            CallState::Idle => return,
        };
        self.teardown();
        if let Some(id) = server_id {
            if let Err(e) = self.api.end_call(id).await {
                tracing::debug!("Ending call {} on the server failed: {}", id, e);
            }
        }
    }

    fn toggle_mute(&mut self) {
        let Ok(active) = self.active_mut() else {
            return;
        };
        let Some(track) = active.local.as_ref().and_then(|l| l.audio_track()) else {
            return;
        };
        let enabled = !track.is_enabled();
        track.set_enabled(enabled);
        active.muted = !enabled;
    }

    fn resume_playback(&mut self) {
        let output = self.output.clone();
        let Ok(active) = self.active_mut() else {
            return;
        };
        if active.playback.is_some() {
            return;
        }
        let Some(stream) = &active.remote_stream else {
            return;
        };
        match output.play_remote(stream) {
            Ok(handle) => {
                active.playback = Some(handle);
                active.step = STEP_VOICE_ACTIVE.to_string();
            }
            Err(e) => tracing::warn!("Playback still blocked: {}", e),
        }
    }

    // ------------------------------------------------------------------------
    // Peer
    // ------------------------------------------------------------------------

    async fn peer_incoming(&mut self, call: Arc<dyn MediaCall>) -> Option<Notice> {
        if call.peer() != self.partner_address {
            tracing::info!("Declining call from {}, not this conversation", call.peer());
            call.close();
            return None;
        }

        if matches!(self.state, CallState::Idle) {
            let mut active =
                ActiveCall::new(CallPhase::Incoming, self.partner, self.output.clone());
            active.handle = Some(call);
            active.ring(RingPattern::Incoming);
            self.state = CallState::Active(active);
            return None;
        }
        let CallState::Active(active) = &mut self.state else {
            return None;
        };

        match active.phase {
            CallPhase::Incoming => {
                active.replace_handle(call);
                None
            }
            CallPhase::Dialing => {
                // Both sides dialed at once: take theirs, drop ours.
                tracing::info!("Crossed calls with {}, answering theirs", self.partner);
                active.ringtone.stop();
                let stream = match active.local.clone() {
                    Some(stream) => stream,
                    None => {
                        call.close();
                        return None;
                    }
                };
                active.replace_handle(call.clone());
                active.phase = CallPhase::Connected;
                active.step = STEP_CONNECTING.to_string();
                if let Err(e) = call.answer(stream).await {
                    tracing::warn!("Answering crossed call failed: {}", e);
                    self.teardown();
                    return Some(Notice::error("Answer failed"));
                }
                None
            }
            CallPhase::Connecting | CallPhase::Connected | CallPhase::Idle => {
                tracing::info!("Declining {}, busy", call.connection_id());
                call.close();
                None
            }
        }
    }

    fn peer_stream(&mut self, connection: &str, stream: RemoteStream) {
        let output = self.output.clone();
        let Ok(active) = self.active_mut() else {
            return;
        };
        if !active.owns(connection) {
            tracing::debug!("Remote stream for stale connection {}", connection);
            return;
        }

        active.ringtone.stop();
        active.phase = CallPhase::Connected;
        active.playback = None;
        match output.play_remote(&stream) {
            Ok(handle) => {
                active.playback = Some(handle);
                active.step = STEP_VOICE_ACTIVE.to_string();
            }
            Err(e) => {
                tracing::warn!("Remote playback refused: {}", e);
                active.step = STEP_TAP_TO_UNMUTE.to_string();
            }
        }
        active.remote_stream = Some(stream);
    }

    fn peer_error(&mut self, connection: Option<ConnectionId>, kind: String) -> Option<Notice> {
        let text = format!("Connection error: {}", kind);
        match connection {
            Some(connection) if self.owns(&connection) => {
                self.teardown();
                Some(Notice::error(text))
            }
            Some(_) => None,
            None => {
                if let Ok(active) = self.active_mut() {
                    active.step = text;
                }
                None
            }
        }
    }

    // ------------------------------------------------------------------------
    // Server
    // ------------------------------------------------------------------------

    fn server_incoming(&mut self, record: CallRecord) {
        if record.caller != self.partner || record.status.is_terminal() {
            return;
        }
        match &mut self.state {
            CallState::Active(active) => {
                if active.phase == CallPhase::Incoming && active.server_id.is_none() {
                    active.server_id = Some(record.id);
                }
            }
            CallState::Idle => {
                let mut active =
                    ActiveCall::new(CallPhase::Incoming, self.partner, self.output.clone());
                active.server_id = Some(record.id);
                active.ring(RingPattern::Incoming);
                self.state = CallState::Active(active);
            }
        }
    }

    fn server_update(&mut self, record: CallRecord) {
        let Ok(active) = self.active_mut() else {
            return;
        };
        if active.server_id != Some(record.id) {
            return;
        }
        if record.status.is_terminal() {
            tracing::info!("Call {} is {:?} on the server", record.id, record.status);
            self.teardown();
        } else if record.status == CallStatus::Active && active.phase == CallPhase::Dialing {
            active.step = STEP_CONNECTING_VOICE.to_string();
            active.ringtone.stop();
        }
    }
}

impl Drop for CallMachine {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;

    const ME: UserId = 1;
    const PARTNER: UserId = 2;

    struct Rig {
        api: Arc<FakeApi>,
        devices: Arc<FakeDevices>,
        bridge: Arc<LoopbackBridge>,
        machine: CallMachine,
    }

    fn setup() -> Rig {
        let api = Arc::new(FakeApi::new(ME));
        let devices = Arc::new(FakeDevices::default());
        let board = Switchboard::new();
        let (bridge, _events) = board.join(&address(ME));
        let mut machine = CallMachine::new(
            PARTNER,
            address(PARTNER),
            api.clone(),
            devices.clone(),
            devices.clone(),
        );
        machine.set_bridge(Some(bridge.clone()));
        Rig {
            api,
            devices,
            bridge,
            machine,
        }
    }

    fn record(id: CallId, caller: UserId, status: CallStatus) -> CallRecord {
        CallRecord {
            id,
            caller,
            receiver: if caller == ME { PARTNER } else { ME },
            status,
            caller_name: None,
            created_at: None,
            updated_at: None,
        }
    }

    fn assert_released(rig: &Rig) {
        assert_eq!(rig.machine.phase(), CallPhase::Idle);
        assert_eq!(rig.machine.view(), CallView::default());
        assert_eq!(rig.devices.live_tones(), 0);
        assert_eq!(rig.devices.live_playbacks(), 0);
        assert!(rig.devices.all_streams_stopped());
    }

    #[test]
    fn test_poll_answer_becomes_signals() {
        let poll = CallPoll {
            incoming: Some(record(13, PARTNER, CallStatus::Initiated)),
            my_call: Some(record(12, ME, CallStatus::Rejected)),
            incoming_update: Some(record(11, PARTNER, CallStatus::Ended)),
        };
        let signals: Vec<_> = signals_from_poll(poll)
            .into_iter()
            .map(|signal| match signal {
                CallSignal::ServerIncoming(r) => ("incoming", r.id),
                CallSignal::ServerUpdate(r) => ("update", r.id),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(signals, vec![("incoming", 13), ("update", 12), ("update", 11)]);

        assert!(signals_from_poll(CallPoll::default()).is_empty());
    }

    #[tokio::test]
    async fn test_dial_reaches_dialing() {
        let mut rig = setup();
        assert!(rig.machine.apply(CallSignal::Dial).await.is_none());

        let view = rig.machine.view();
        assert_eq!(view.phase, CallPhase::Dialing);
        assert_eq!(view.step, STEP_CALLING);
        assert_eq!(view.server_id, Some(100));
        assert!(view.ringing);
        assert_eq!(rig.api.started(), vec![PARTNER]);
        assert_eq!(rig.bridge.placed().len(), 1);
        assert_eq!(rig.bridge.placed()[0].peer(), address(PARTNER));
    }

    #[tokio::test]
    async fn test_dial_failure_tears_down_with_notice() {
        let mut rig = setup();
        rig.api.fail_start_call();

        let notice = rig.machine.apply(CallSignal::Dial).await.unwrap();
        assert!(notice.text.starts_with("Call failed: "));
        assert_released(&rig);
        assert_eq!(rig.devices.acquired(), 1);
    }

    #[tokio::test]
    async fn test_teardown_from_every_state() {
        // dialing
        let mut rig = setup();
        rig.machine.apply(CallSignal::Dial).await;
        rig.machine.apply(CallSignal::Hangup).await;
        assert_released(&rig);
        assert_eq!(rig.api.ended(), vec![100]);
        assert!(rig.bridge.placed()[0].is_closed());

        // incoming via peer
        let mut rig = setup();
        let call = LoopbackCall::detached("mc_in", &address(PARTNER));
        rig.machine.apply(CallSignal::PeerIncoming(call.clone())).await;
        assert_eq!(rig.machine.phase(), CallPhase::Incoming);
        rig.machine.apply(CallSignal::PeerClosed { connection: "mc_in".into() }).await;
        assert_released(&rig);
        assert!(call.is_closed());

        // incoming via server, ended remotely
        let mut rig = setup();
        rig.machine
            .apply(CallSignal::ServerIncoming(record(7, PARTNER, CallStatus::Initiated)))
            .await;
        rig.machine.apply(CallSignal::ServerUpdate(record(7, PARTNER, CallStatus::Ended))).await;
        assert_released(&rig);

        // connected
        let mut rig = setup();
        let call = LoopbackCall::detached("mc_c", &address(PARTNER));
        rig.machine.apply(CallSignal::PeerIncoming(call.clone())).await;
        rig.machine.apply(CallSignal::Accept).await;
        rig.machine
            .apply(CallSignal::PeerStream {
                connection: "mc_c".into(),
                stream: RemoteStream::new("r"),
            })
            .await;
        assert_eq!(rig.machine.phase(), CallPhase::Connected);
        assert_eq!(rig.devices.live_playbacks(), 1);
        rig.machine
            .apply(CallSignal::PeerError {
                connection: Some("mc_c".into()),
                kind: "negotiation-failed".into(),
            })
            .await;
        assert_released(&rig);

        // idle: repeated teardown inputs are no-ops
        rig.machine.apply(CallSignal::Hangup).await;
        rig.machine.apply(CallSignal::ServerUpdate(record(7, PARTNER, CallStatus::Ended))).await;
        rig.machine.apply(CallSignal::PeerClosed { connection: "mc_c".into() }).await;
        rig.machine.teardown();
        assert_released(&rig);
    }

    #[tokio::test]
    async fn test_crossed_calls_connect_directly() {
        let mut rig = setup();
        rig.machine.apply(CallSignal::Dial).await;
        let outgoing = rig.bridge.placed()[0].clone();

        let theirs = LoopbackCall::detached("mc_theirs", &address(PARTNER));
        assert!(rig.machine.apply(CallSignal::PeerIncoming(theirs.clone())).await.is_none());

        let view = rig.machine.view();
        assert_eq!(view.phase, CallPhase::Connected);
        assert!(!view.ringing);
        assert!(theirs.is_answered());
        assert!(outgoing.is_closed());
        assert_eq!(rig.devices.acquired(), 1);

        // The stream of the dropped outgoing call no longer counts.
        rig.machine
            .apply(CallSignal::PeerClosed {
                connection: outgoing.connection_id().to_string(),
            })
            .await;
        assert_eq!(rig.machine.phase(), CallPhase::Connected);
    }

    #[tokio::test]
    async fn test_foreign_server_update_is_ignored() {
        let mut rig = setup();
        rig.machine.apply(CallSignal::Dial).await;

        rig.machine.apply(CallSignal::ServerUpdate(record(999, ME, CallStatus::Ended))).await;
        assert_eq!(rig.machine.phase(), CallPhase::Dialing);

        rig.machine.apply(CallSignal::ServerUpdate(record(100, ME, CallStatus::Active))).await;
        let view = rig.machine.view();
        assert_eq!(view.phase, CallPhase::Dialing);
        assert_eq!(view.step, STEP_CONNECTING_VOICE);
        assert!(!view.ringing);

        rig.machine.apply(CallSignal::ServerUpdate(record(100, ME, CallStatus::Rejected))).await;
        assert_released(&rig);
    }

    #[tokio::test]
    async fn test_accept_without_handle_dials_back() {
        let mut rig = setup();
        rig.machine
            .apply(CallSignal::ServerIncoming(record(55, PARTNER, CallStatus::Initiated)))
            .await;
        let view = rig.machine.view();
        assert_eq!(view.phase, CallPhase::Incoming);
        assert!(view.ringing);

        assert!(rig.machine.apply(CallSignal::Accept).await.is_none());
        let view = rig.machine.view();
        assert_eq!(view.phase, CallPhase::Connected);
        assert_eq!(view.step, STEP_DIALING_BACK);
        assert!(!view.ringing);
        assert_eq!(rig.api.answered(), vec![55]);
        assert_eq!(rig.bridge.placed().len(), 1);
    }

    #[tokio::test]
    async fn test_accept_failure_notice() {
        let mut rig = setup();
        rig.devices.deny_microphone();
        rig.machine
            .apply(CallSignal::ServerIncoming(record(56, PARTNER, CallStatus::Initiated)))
            .await;

        let notice = rig.machine.apply(CallSignal::Accept).await.unwrap();
        assert_eq!(notice.text, "Answer failed");
        assert_released(&rig);
    }

    #[tokio::test]
    async fn test_late_inputs_attach_to_incoming_call() {
        let mut rig = setup();
        rig.machine
            .apply(CallSignal::ServerIncoming(record(60, PARTNER, CallStatus::Initiated)))
            .await;
        let call = LoopbackCall::detached("mc_late", &address(PARTNER));
        rig.machine.apply(CallSignal::PeerIncoming(call.clone())).await;
        rig.machine
            .apply(CallSignal::ServerIncoming(record(61, PARTNER, CallStatus::Initiated)))
            .await;

        assert_eq!(rig.machine.view().server_id, Some(60));
        rig.machine.apply(CallSignal::Accept).await;
        assert!(call.is_answered());
        assert_eq!(rig.api.answered(), vec![60]);
        assert!(rig.bridge.placed().is_empty());
    }

    #[tokio::test]
    async fn test_strangers_and_busy_calls_are_declined() {
        let mut rig = setup();
        let stranger = LoopbackCall::detached("mc_x", &address(9));
        rig.machine.apply(CallSignal::PeerIncoming(stranger.clone())).await;
        assert!(stranger.is_closed());
        assert_eq!(rig.machine.phase(), CallPhase::Idle);

        rig.machine.apply(CallSignal::ServerIncoming(record(70, 9, CallStatus::Initiated))).await;
        assert_eq!(rig.machine.phase(), CallPhase::Idle);

        let first = LoopbackCall::detached("mc_1", &address(PARTNER));
        rig.machine.apply(CallSignal::PeerIncoming(first.clone())).await;
        rig.machine.apply(CallSignal::Accept).await;
        let second = LoopbackCall::detached("mc_2", &address(PARTNER));
        rig.machine.apply(CallSignal::PeerIncoming(second.clone())).await;
        assert!(second.is_closed());
        assert!(!first.is_closed());
    }

    #[tokio::test]
    async fn test_mute_toggles_track() {
        let mut rig = setup();
        rig.machine.apply(CallSignal::ToggleMute).await;
        assert!(!rig.machine.view().muted);

        rig.machine.apply(CallSignal::Dial).await;
        rig.machine.apply(CallSignal::ToggleMute).await;
        assert!(rig.machine.view().muted);
        assert!(!rig.devices.last_track().unwrap().is_enabled());
        assert_eq!(rig.machine.phase(), CallPhase::Dialing);

        rig.machine.apply(CallSignal::ToggleMute).await;
        assert!(!rig.machine.view().muted);
        assert!(rig.devices.last_track().unwrap().is_enabled());

        rig.machine.apply(CallSignal::ToggleMute).await;
        rig.machine.apply(CallSignal::Hangup).await;
        assert!(!rig.machine.view().muted);
    }

    #[tokio::test]
    async fn test_blocked_playback_can_be_resumed() {
        let mut rig = setup();
        rig.devices.block_playback(true);
        rig.machine.apply(CallSignal::Dial).await;
        let connection = rig.bridge.placed()[0].connection_id().to_string();

        rig.machine
            .apply(CallSignal::PeerStream {
                connection,
                stream: RemoteStream::new("r"),
            })
            .await;
        let view = rig.machine.view();
        assert_eq!(view.phase, CallPhase::Connected);
        assert_eq!(view.step, STEP_TAP_TO_UNMUTE);
        assert!(!view.ringing);

        rig.machine.apply(CallSignal::ResumePlayback).await;
        assert_eq!(rig.machine.view().step, STEP_TAP_TO_UNMUTE);

        rig.devices.block_playback(false);
        rig.machine.apply(CallSignal::ResumePlayback).await;
        assert_eq!(rig.machine.view().step, STEP_VOICE_ACTIVE);
        assert_eq!(rig.devices.live_playbacks(), 1);
    }

    #[tokio::test]
    async fn test_bridge_error_sets_step_only() {
        let mut rig = setup();
        rig.machine.apply(CallSignal::Dial).await;
        let notice = rig
            .machine
            .apply(CallSignal::PeerError {
                connection: None,
                kind: "network".into(),
            })
            .await;
        assert!(notice.is_none());
        assert_eq!(rig.machine.view().step, "Connection error: network");
        assert_eq!(rig.machine.phase(), CallPhase::Dialing);
    }

    #[tokio::test]
    async fn test_a_calls_b() {
        let board = Switchboard::new();
        let api = Arc::new(FakeApi::new(ME));
        let (bridge_a, mut events_a) = board.join(&address(ME));
        let (bridge_b, mut events_b) = board.join(&address(PARTNER));
        let devices_a = Arc::new(FakeDevices::default());
        let devices_b = Arc::new(FakeDevices::default());

        let mut a = CallMachine::new(
            PARTNER,
            address(PARTNER),
            api.clone(),
            devices_a.clone(),
            devices_a.clone(),
        );
        a.set_bridge(Some(bridge_a));
        let mut b = CallMachine::new(
            ME,
            address(ME),
            api.clone(),
            devices_b.clone(),
            devices_b.clone(),
        );
        b.set_bridge(Some(bridge_b));

        a.apply(CallSignal::Dial).await;
        assert_eq!(a.phase(), CallPhase::Dialing);

        let incoming = events_b.recv().await.unwrap();
        b.apply(incoming.into()).await;
        assert_eq!(b.phase(), CallPhase::Incoming);
        assert!(b.view().ringing);

        b.apply(CallSignal::Accept).await;
        while let Ok(event) = events_b.try_recv() {
            b.apply(event.into()).await;
        }
        while let Ok(event) = events_a.try_recv() {
            a.apply(event.into()).await;
        }

        for machine in [&a, &b] {
            let view = machine.view();
            assert_eq!(view.phase, CallPhase::Connected);
            assert_eq!(view.step, STEP_VOICE_ACTIVE);
            assert!(!view.ringing);
        }

        a.apply(CallSignal::Hangup).await;
        while let Ok(event) = events_b.try_recv() {
            b.apply(event.into()).await;
        }
        assert_eq!(a.phase(), CallPhase::Idle);
        assert_eq!(b.phase(), CallPhase::Idle);
        assert!(devices_b.all_streams_stopped());
    }
}
