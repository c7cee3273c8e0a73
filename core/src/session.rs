//! Chat screen session
//!
//! One task per open conversation owns the [`ChatViewModel`] and the
//! [`CallMachine`]. It multiplexes user commands, pushed stream events,
//! signaling events and the poll tick, and publishes a [`Snapshot`] after
//! every step. Nothing else mutates either model.
//!
//! The loop itself never waits on the network. Requests run as futures
//! polled next to the other event sources and report back to it when done.
//! Call signals are applied in order by a driver future that owns the
//! machine, so a slow call request only delays later call signals.

use crate::auth::SessionContext;
use crate::call::{signals_from_poll, CallMachine, CallSignal, CallView};
use crate::chat::{ChatViewModel, Notice, PendingSend};
use crate::error::{Error, Result};
use crate::media::{AudioOutput, MediaDevices};
use crate::models::*;
use crate::peer::PeerConnector;
use crate::signaling::{BridgeEvent, BridgeEvents, SignalingBridge, SignalingConnector};
use crate::stream::{MessageStream, StreamEvent};
use crate::transport::{resolve_media_url, ChatApi};
use crate::ClientConfig;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// How long `close` waits for the task to finish an in-flight step.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Everything a session needs from the outside world.
pub struct SessionDeps {
    pub config: ClientConfig,
    pub session: SessionContext,
    pub api: Arc<dyn ChatApi>,
    /// `None` disables calling; chat keeps working.
    pub signaling: Option<Arc<dyn SignalingConnector>>,
    pub devices: Arc<dyn MediaDevices>,
    pub output: Arc<dyn AudioOutput>,
    pub push_stream: bool,
}

impl SessionDeps {
    pub fn new(config: ClientConfig, session: SessionContext, api: Arc<dyn ChatApi>) -> Self {
        let signaling: Arc<dyn SignalingConnector> = Arc::new(PeerConnector::new(config.clone()));
        let (devices, output) = default_devices();
        Self {
            config,
            session,
            api,
            signaling: Some(signaling),
            devices,
            output,
            push_stream: true,
        }
    }

    pub fn with_signaling(mut self, signaling: Option<Arc<dyn SignalingConnector>>) -> Self {
        self.signaling = signaling;
        self
    }

    pub fn with_devices(
        mut self,
        devices: Arc<dyn MediaDevices>,
        output: Arc<dyn AudioOutput>,
    ) -> Self {
        self.devices = devices;
        self.output = output;
        self
    }

    /// Skips the live stream and relies on polling alone.
    pub fn without_push_stream(mut self) -> Self {
        self.push_stream = false;
        self
    }
}

#[cfg(feature = "audio")]
fn default_devices() -> (Arc<dyn MediaDevices>, Arc<dyn AudioOutput>) {
    let audio = Arc::new(crate::media::SystemAudio);
    (audio.clone(), audio)
}

#[cfg(not(feature = "audio"))]
fn default_devices() -> (Arc<dyn MediaDevices>, Arc<dyn AudioOutput>) {
    let audio = Arc::new(crate::media::NullDevices);
    (audio.clone(), audio)
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// The composer text changed.
    Input(String),
    Send,
    ReplyTo(MessageId),
    CancelReply,
    Dial,
    Accept,
    Hangup,
    ToggleMute,
    /// User gesture that lets blocked remote audio start.
    ResumePlayback,
    Report {
        reason: ReportReason,
        explanation: String,
    },
    Block,
}

/// Render state of the chat screen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub me: UserId,
    pub partner: UserId,
    pub partner_name: Option<String>,
    pub partner_photo: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub partner_status: PartnerStatus,
    pub draft: String,
    pub reply_target: Option<ChatMessage>,
    pub call: CallView,
    /// True once the signaling bridge is registered.
    pub calls_available: bool,
    /// Most recent notices, oldest first. Ids only grow.
    pub notices: Vec<Notice>,
    /// The screen should go away.
    pub closed: bool,
}

// ============================================================================
// Session task
// ============================================================================

/// Answer to a request the loop started without waiting for it.
enum Outcome {
    Polled {
        history: Result<ConversationHistory>,
        /// Skipped when the history request was unauthorized.
        calls: Option<Result<CallPoll>>,
    },
    Sent {
        pending: PendingSend,
        result: Result<ChatMessage>,
    },
    Reported(Result<()>),
    Blocked(Result<()>),
}

pub struct ChatSession {
    config: ClientConfig,
    session: SessionContext,
    api: Arc<dyn ChatApi>,
    signaling: Option<Arc<dyn SignalingConnector>>,
    push_stream: bool,
    chat: ChatViewModel,
    /// Held here until the loop hands it to the call driver.
    call: Option<CallMachine>,
    call_signals: Option<mpsc::UnboundedSender<CallSignal>>,
    in_flight: FuturesUnordered<BoxFuture<'static, Outcome>>,
    polling: bool,
    stream: Option<MessageStream>,
    bridge: Option<Arc<dyn SignalingBridge>>,
    bridge_events: Option<BridgeEvents>,
    snapshots: Arc<watch::Sender<Snapshot>>,
    closed: bool,
}

impl ChatSession {
    /// Opens the chat screen with `partner`. Must be called inside a tokio
    /// runtime.
    pub fn open(deps: SessionDeps, partner: UserId) -> SessionHandle {
        let SessionDeps {
            config,
            session,
            api,
            signaling,
            devices,
            output,
            push_stream,
        } = deps;

        let me = session.user_id;
        let chat = ChatViewModel::new(me, partner, config.typing_interval);
        let mut call = CallMachine::new(
            partner,
            config.peer_address(partner),
            api.clone(),
            devices,
            output,
        );

        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot {
            me,
            partner,
            ..Default::default()
        });
        let snapshots = Arc::new(snapshot_tx);
        let observer = snapshots.clone();
        call.set_observer(Box::new(move |view: &CallView| {
            observer.send_modify(|s| s.call = view.clone());
        }));

        let session = Self {
            config,
            session,
            api,
            signaling,
            push_stream,
            chat,
            call: Some(call),
            call_signals: None,
            in_flight: FuturesUnordered::new(),
            polling: false,
            stream: None,
            bridge: None,
            bridge_events: None,
            snapshots,
            closed: false,
        };

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(session.run(command_rx, shutdown_rx));

        SessionHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        tracing::info!(
            "Chat session {} <-> {} opened",
            self.session.user_id,
            self.chat.partner()
        );
        self.enter().await;
        self.publish();

        let Some(call) = self.call.take() else {
            self.shutdown();
            return;
        };
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (notice_tx, mut notices) = mpsc::unbounded_channel();
        self.call_signals = Some(signal_tx);
        let calls = drive_calls(call, signal_rx, notice_tx, self.snapshots.clone());
        tokio::pin!(calls);
        let mut calls_done = false;

        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.reset();

        while !self.closed {
            tokio::select! {
                _ = &mut shutdown => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                event = next_stream_event(&mut self.stream) => match event {
                    Some(event) => self.chat.apply_stream(event),
                    None => self.stream = None,
                },
                event = next_bridge_event(&mut self.bridge_events) => match event {
                    Some(event) => self.signal_call(event.into()),
                    None => {
                        tracing::warn!("Signaling bridge went away");
                        self.bridge_events = None;
                    }
                },
                Some(outcome) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    self.on_outcome(outcome);
                }
                Some(notice) = notices.recv() => self.chat.push_notice(notice),
                _ = &mut calls, if !calls_done => calls_done = true,
                _ = tick.tick() => self.poll(),
            }
            self.publish();
        }

        // Without a sender the driver tears the call down and returns.
        self.call_signals = None;
        if !calls_done {
            calls.await;
        }
        self.shutdown();
        tracing::info!("Chat session with {} closed", self.chat.partner());
    }

    async fn enter(&mut self) {
        let partner = self.chat.partner();
        match self.api.history(partner).await {
            Ok(history) => self.chat.apply_history(history),
            Err(e) => self.transient_failure("History refresh", e),
        }
        if self.closed {
            return;
        }

        match self.api.profile(partner).await {
            Ok(profile) => {
                let photo = profile
                    .photos
                    .first()
                    .and_then(|p| p.image.as_deref())
                    .map(|path| resolve_media_url(&self.config, Some(path)));
                self.chat.set_profile(profile.first_name, photo);
            }
            Err(e) => tracing::debug!("Profile of {} unavailable: {}", partner, e),
        }

        if self.push_stream {
            match MessageStream::connect(&self.config, &self.session).await {
                Ok(stream) => self.stream = Some(stream),
                Err(e) => tracing::warn!("Message stream unavailable, polling only: {}", e),
            }
        }

        if let Some(signaling) = self.signaling.clone() {
            let address = self.config.peer_address(self.session.user_id);
            match signaling.register(&address).await {
                Ok((bridge, events)) => {
                    if let Some(call) = &mut self.call {
                        call.set_bridge(Some(bridge.clone()));
                    }
                    self.bridge = Some(bridge);
                    self.bridge_events = Some(events);
                }
                Err(e) => tracing::warn!("Calls unavailable: {}", e),
            }
        }
    }

    /// Starts a history refresh and call poll unless one is still running.
    fn poll(&mut self) {
        if self.polling {
            return;
        }
        self.polling = true;
        let api = self.api.clone();
        let partner = self.chat.partner();
        self.in_flight.push(
            async move {
                let history = api.history(partner).await;
                let calls = match history {
                    Err(Error::Unauthorized) => None,
                    _ => Some(api.poll_calls().await),
                };
                Outcome::Polled { history, calls }
            }
            .boxed(),
        );
    }

    fn transient_failure(&mut self, what: &str, error: Error) {
        if matches!(error, Error::Unauthorized) {
            tracing::warn!("{} rejected, leaving the chat", what);
            self.closed = true;
        } else {
            tracing::debug!("{} failed: {}", what, error);
        }
    }

    fn handle(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Input(text) => {
                if self.chat.set_draft(text, Instant::now()) {
                    let api = self.api.clone();
                    let partner = self.chat.partner();
                    tokio::spawn(async move {
                        if let Err(e) = api.send_typing(partner).await {
                            tracing::debug!("Typing signal failed: {}", e);
                        }
                    });
                }
            }
            SessionCommand::Send => self.send(),
            SessionCommand::ReplyTo(id) => {
                if !self.chat.reply_to(id) {
                    tracing::debug!("Reply target {} not in the conversation", id);
                }
            }
            SessionCommand::CancelReply => self.chat.cancel_reply(),
            SessionCommand::Dial => self.signal_call(CallSignal::Dial),
            SessionCommand::Accept => self.signal_call(CallSignal::Accept),
            SessionCommand::Hangup => self.signal_call(CallSignal::Hangup),
            SessionCommand::ToggleMute => self.signal_call(CallSignal::ToggleMute),
            SessionCommand::ResumePlayback => self.signal_call(CallSignal::ResumePlayback),
            SessionCommand::Report {
                reason,
                explanation,
            } => {
                let api = self.api.clone();
                let partner = self.chat.partner();
                self.in_flight.push(
                    async move {
                        Outcome::Reported(api.report(partner, reason, &explanation).await)
                    }
                    .boxed(),
                );
            }
            SessionCommand::Block => {
                let api = self.api.clone();
                let partner = self.chat.partner();
                self.in_flight
                    .push(async move { Outcome::Blocked(api.block(partner).await) }.boxed());
            }
        }
    }

    fn send(&mut self) {
        let Some(pending) = self.chat.begin_send() else {
            return;
        };
        let api = self.api.clone();
        self.in_flight.push(
            async move {
                let result = api.send_message(&pending.request).await;
                Outcome::Sent { pending, result }
            }
            .boxed(),
        );
    }

    fn on_outcome(&mut self, outcome: Outcome) {
        let partner = self.chat.partner();
        match outcome {
            Outcome::Polled { history, calls } => {
                self.polling = false;
                match history {
                    Ok(history) => self.chat.apply_history(history),
                    Err(e) => self.transient_failure("History refresh", e),
                }
                match calls {
                    Some(Ok(poll)) => {
                        for signal in signals_from_poll(poll) {
                            self.signal_call(signal);
                        }
                    }
                    Some(Err(e)) => self.transient_failure("Call poll", e),
                    None => {}
                }
            }
            Outcome::Sent { pending, result } => {
                let unauthorized = matches!(result, Err(Error::Unauthorized));
                self.chat.finish_send(pending, result);
                if unauthorized {
                    self.closed = true;
                }
            }
            Outcome::Reported(Ok(())) => self.chat.push_notice(Notice::success("User reported")),
            Outcome::Reported(Err(e)) => {
                tracing::warn!("Report of {} failed: {}", partner, e);
                self.chat.push_notice(Notice::error("Report failed"));
            }
            Outcome::Blocked(Ok(())) => {
                tracing::info!("Blocked {}", partner);
                self.chat.push_notice(Notice::success("User blocked"));
                self.closed = true;
            }
            Outcome::Blocked(Err(e)) => {
                tracing::warn!("Block of {} failed: {}", partner, e);
                self.chat.push_notice(Notice::error("Block failed"));
            }
        }
    }

    fn signal_call(&self, signal: CallSignal) {
        match &self.call_signals {
            Some(signals) => {
                if let Err(e) = signals.send(signal) {
                    tracing::debug!("Call machine gone, dropping {:?}", e.0);
                }
            }
            None => tracing::debug!("Call machine not running, dropping {:?}", signal),
        }
    }

    /// Publishes everything but the call, which the driver keeps current.
    fn publish(&self) {
        let chat = &self.chat;
        self.snapshots.send_modify(|s| {
            s.partner_name = chat.partner_name().map(str::to_string);
            s.partner_photo = chat.partner_photo().map(str::to_string);
            s.messages = chat.messages().to_vec();
            s.partner_status = chat.partner_status().clone();
            s.draft = chat.draft().to_string();
            s.reply_target = chat.reply_target().cloned();
            s.calls_available = self.bridge.is_some();
            s.notices = chat.notices().cloned().collect();
            s.closed = self.closed;
        });
    }

    /// Releases the call, the stream and the signaling registration.
    /// Idempotent.
    fn shutdown(&mut self) {
        self.call_signals = None;
        if let Some(mut call) = self.call.take() {
            call.teardown();
        }
        self.in_flight = FuturesUnordered::new();
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
        self.bridge_events = None;
        if let Some(bridge) = self.bridge.take() {
            bridge.shutdown();
        }
        self.closed = true;
        self.publish();
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Applies call signals in arrival order and mirrors the machine into the
/// snapshot. Returns once every sender is gone, leaving the call torn down.
async fn drive_calls(
    mut call: CallMachine,
    mut signals: mpsc::UnboundedReceiver<CallSignal>,
    notices: mpsc::UnboundedSender<Notice>,
    snapshots: Arc<watch::Sender<Snapshot>>,
) {
    while let Some(signal) = signals.recv().await {
        if let Some(notice) = call.apply(signal).await {
            let _ = notices.send(notice);
        }
        let view = call.view();
        snapshots.send_if_modified(|s| {
            if s.call == view {
                return false;
            }
            s.call = view;
            true
        });
    }
    call.set_bridge(None);
    call.teardown();
}

async fn next_stream_event(stream: &mut Option<MessageStream>) -> Option<StreamEvent> {
    match stream {
        Some(stream) => stream.next_event().await,
        None => futures::future::pending().await,
    }
}

async fn next_bridge_event(events: &mut Option<BridgeEvents>) -> Option<BridgeEvent> {
    match events {
        Some(events) => events.recv().await,
        None => futures::future::pending().await,
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Front end side of a session. Dropping it ends the session without
/// waiting.
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshots: watch::Receiver<Snapshot>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn command(&self, command: SessionCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::SessionClosed)
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshots.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshots.borrow().clone()
    }

    /// Navigates away: stops polling, drops the stream and tears down any
    /// call before returning.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(mut task) = self.task.take() else {
            return;
        };
        if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
            tracing::warn!("Session busy on close, aborting");
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
