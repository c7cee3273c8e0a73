//! Chat screen state
//!
//! Messages reach the screen from three places: the history poll, the push
//! stream and send acknowledgements. All of them go through
//! [`MessageLog::merge`], so the same message delivered twice from any mix
//! of sources is shown once.

use crate::error::Error;
use crate::models::*;
use crate::stream::StreamEvent;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

const NOTICE_BACKLOG: usize = 8;

// ============================================================================
// Notices
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// Transient message for the user. `id` increases with every notice pushed
/// to a view model, so a renderer can tell which ones it already showed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub id: u64,
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    fn new(level: NoticeLevel, text: impl Into<String>) -> Self {
        Self {
            id: 0,
            level,
            text: text.into(),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Info, text)
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Success, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Error, text)
    }
}

// ============================================================================
// Message log
// ============================================================================

/// Confirmed messages in `(timestamp, id)` order, followed by pending sends.
#[derive(Debug, Default, Clone)]
pub struct MessageLog {
    entries: Vec<ChatMessage>,
}

impl MessageLog {
    pub fn messages(&self) -> &[ChatMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<&ChatMessage> {
        self.entries.iter().find(|m| m.id == Some(id))
    }

    /// Merges confirmed messages. Returns true if anything visible changed.
    pub fn merge<I>(&mut self, messages: I) -> bool
    where
        I: IntoIterator<Item = ChatMessage>,
    {
        let mut changed = false;
        for message in messages {
            changed |= self.merge_one(message);
        }
        changed
    }

    fn merge_one(&mut self, message: ChatMessage) -> bool {
        let Some(id) = message.id else {
            tracing::debug!("Ignoring unconfirmed message in merge");
            return false;
        };

        if let Some(existing) = self.entries.iter_mut().find(|m| m.id == Some(id)) {
            if existing.is_read != message.is_read {
                existing.is_read = message.is_read;
                return true;
            }
            return false;
        }

        // The stream may echo our own send before the POST returns.
        if let Some(pos) = self.entries.iter().position(|m| {
            m.is_pending()
                && m.sender == message.sender
                && m.receiver == message.receiver
                && m.content == message.content
                && m.parent_message == message.parent_id()
        }) {
            self.entries.remove(pos);
        }

        let key = (message.timestamp, id);
        let at = self
            .entries
            .iter()
            .position(|m| match m.id {
                Some(other) => (m.timestamp, other) > key,
                None => true,
            })
            .unwrap_or(self.entries.len());
        self.entries.insert(at, message);
        true
    }

    pub fn add_pending(&mut self, message: ChatMessage) {
        self.entries.push(message);
    }

    pub fn withdraw(&mut self, local_key: u64) -> Option<ChatMessage> {
        let pos = self
            .entries
            .iter()
            .position(|m| m.is_pending() && m.local_key == Some(local_key))?;
        Some(self.entries.remove(pos))
    }

    /// Replaces the pending entry `local_key` with the server's copy.
    pub fn reconcile(&mut self, local_key: u64, confirmed: ChatMessage) {
        self.withdraw(local_key);
        self.merge_one(confirmed);
    }
}

// ============================================================================
// Typing throttle
// ============================================================================

/// Rate limit for outgoing typing signals.
#[derive(Debug, Clone)]
pub struct TypingThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl TypingThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    /// True when a signal should go out at `now`: the first keystroke, or
    /// more than the interval after the last emitted one.
    pub fn should_emit(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) <= self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

// ============================================================================
// View model
// ============================================================================

/// A send taken out of the composer and awaiting the server.
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub local_key: u64,
    pub request: SendMessageRequest,
    draft: String,
    reply_target: Option<ChatMessage>,
}

pub struct ChatViewModel {
    me: UserId,
    partner: UserId,
    log: MessageLog,
    status: PartnerStatus,
    partner_name: Option<String>,
    partner_photo: Option<String>,
    draft: String,
    reply_target: Option<ChatMessage>,
    typing: TypingThrottle,
    notices: VecDeque<Notice>,
    next_notice: u64,
    next_key: u64,
}

impl ChatViewModel {
    pub fn new(me: UserId, partner: UserId, typing_interval: Duration) -> Self {
        Self {
            me,
            partner,
            log: MessageLog::default(),
            status: PartnerStatus::default(),
            partner_name: None,
            partner_photo: None,
            draft: String::new(),
            reply_target: None,
            typing: TypingThrottle::new(typing_interval),
            notices: VecDeque::new(),
            next_notice: 1,
            next_key: 1,
        }
    }

    pub fn me(&self) -> UserId {
        self.me
    }

    pub fn partner(&self) -> UserId {
        self.partner
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.log.messages()
    }

    pub fn partner_status(&self) -> &PartnerStatus {
        &self.status
    }

    pub fn partner_name(&self) -> Option<&str> {
        self.partner_name.as_deref()
    }

    pub fn partner_photo(&self) -> Option<&str> {
        self.partner_photo.as_deref()
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn reply_target(&self) -> Option<&ChatMessage> {
        self.reply_target.as_ref()
    }

    pub fn notices(&self) -> impl Iterator<Item = &Notice> {
        self.notices.iter()
    }

    fn belongs_here(&self, message: &ChatMessage) -> bool {
        message.involves(self.partner) && message.involves(self.me)
    }

    fn observe_partner_message(&mut self, message: &ChatMessage) {
        if message.sender == self.partner {
            self.status.is_typing = false;
        }
    }

    pub fn apply_history(&mut self, history: ConversationHistory) {
        let ConversationHistory {
            messages,
            partner_status,
        } = history;
        if let Some(status) = partner_status {
            self.status = status;
        }
        let messages: Vec<_> = messages
            .into_iter()
            .filter(|m| self.belongs_here(m))
            .collect();
        for message in &messages {
            if self.log.get(message.id.unwrap_or_default()).is_none() {
                self.observe_partner_message(message);
            }
        }
        self.log.merge(messages);
    }

    pub fn apply_stream(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Message(message) => {
                if !self.belongs_here(&message) {
                    return;
                }
                self.observe_partner_message(&message);
                self.log.merge([message]);
            }
            StreamEvent::Typing { sender_id } => {
                if sender_id == self.partner {
                    self.status.is_typing = true;
                }
            }
            StreamEvent::Disconnected => {
                tracing::debug!("Push stream gone, relying on polling");
            }
        }
    }

    pub fn set_profile(&mut self, name: Option<String>, photo: Option<String>) {
        self.partner_name = name;
        self.partner_photo = photo;
    }

    /// Updates the composer. Returns true when a typing signal should be sent.
    pub fn set_draft(&mut self, text: impl Into<String>, now: Instant) -> bool {
        self.draft = text.into();
        self.typing.should_emit(now)
    }

    pub fn reply_to(&mut self, id: MessageId) -> bool {
        match self.log.get(id) {
            Some(message) => {
                self.reply_target = Some(message.clone());
                true
            }
            None => false,
        }
    }

    pub fn cancel_reply(&mut self) {
        self.reply_target = None;
    }

    /// Takes the composer content and shows it as pending. `None` when
    /// there is nothing to send.
    pub fn begin_send(&mut self) -> Option<PendingSend> {
        if self.draft.trim().is_empty() {
            return None;
        }
        let draft = std::mem::take(&mut self.draft);
        let reply_target = self.reply_target.take();
        let parent_message = reply_target.as_ref().and_then(|m| m.id);

        let local_key = self.next_key;
        self.next_key += 1;
        self.log.add_pending(ChatMessage::pending(
            local_key,
            self.me,
            self.partner,
            &draft,
            parent_message,
        ));

        Some(PendingSend {
            local_key,
            request: SendMessageRequest {
                receiver: self.partner,
                content: draft.clone(),
                message_type: MessageType::Text,
                parent_message,
            },
            draft,
            reply_target,
        })
    }

    pub fn finish_send(&mut self, pending: PendingSend, result: crate::Result<ChatMessage>) {
        let error = match result {
            Ok(message) => {
                self.log.reconcile(pending.local_key, message);
                return;
            }
            Err(e) => e,
        };

        self.log.withdraw(pending.local_key);
        if error.is_server_side() {
            // The server may have stored it anyway; the next poll will tell.
            tracing::warn!("Send failed on the server side: {}", error);
            return;
        }

        tracing::info!("Send rejected: {}", error);
        self.draft = pending.draft;
        self.reply_target = pending.reply_target;
        let text = match &error {
            Error::Http { .. } => error.server_message().unwrap_or("Send failed").to_string(),
            _ => "Send failed".to_string(),
        };
        self.push_notice(Notice::error(text));
    }

    pub fn push_notice(&mut self, mut notice: Notice) {
        notice.id = self.next_notice;
        self.next_notice += 1;
        self.notices.push_back(notice);
        while self.notices.len() > NOTICE_BACKLOG {
            self.notices.pop_front();
        }
    }
}
