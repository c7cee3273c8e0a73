//! Line-oriented chat screen
//!
//! Input lines become [`SessionCommand`]s; snapshots become printed lines.
//! Both halves are pure so they can be tested without a terminal.

use chrono::{DateTime, Local, Utc};
use mallu_core::{
    CallPhase, CallView, ChatMessage, LoginRedirect, MessageId, NoticeLevel, SessionCommand,
    Snapshot,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

pub const HELP: &str = "\
Commands:
  <text>                   send a message
  /reply <id>              reply to message <id> with the next message
  /cancel                  drop the reply target
  /call                    call your match
  /accept                  answer an incoming call
  /hangup                  end or decline the call
  /mute                    toggle the microphone
  /unmute-tap              start remote audio that was blocked
  /report <reason> [text]  fake_profile, harassment, abuse, scam, inappropriate, other
  /block                   block and leave
  /help                    this text
  /quit                    leave the chat";

#[derive(Debug, PartialEq)]
pub enum Input {
    Commands(Vec<SessionCommand>),
    Help,
    Quit,
    Empty,
    Invalid(String),
}

pub fn parse_line(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Input::Commands(vec![
            SessionCommand::Input(line.to_string()),
            SessionCommand::Send,
        ]);
    };

    let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();
    let one = |command| Input::Commands(vec![command]);
    match name {
        "call" => one(SessionCommand::Dial),
        "accept" => one(SessionCommand::Accept),
        "hangup" | "decline" => one(SessionCommand::Hangup),
        "mute" => one(SessionCommand::ToggleMute),
        "unmute-tap" => one(SessionCommand::ResumePlayback),
        "cancel" => one(SessionCommand::CancelReply),
        "block" => one(SessionCommand::Block),
        "reply" => match args.parse::<MessageId>() {
            Ok(id) => one(SessionCommand::ReplyTo(id)),
            Err(_) => Input::Invalid("usage: /reply <message id>".into()),
        },
        "report" => {
            let (reason, explanation) = args.split_once(' ').unwrap_or((args, ""));
            match reason.parse() {
                Ok(reason) => one(SessionCommand::Report {
                    reason,
                    explanation: explanation.trim().to_string(),
                }),
                Err(e) => Input::Invalid(e),
            }
        }
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => Input::Invalid(format!("unknown command /{}", other)),
    }
}

// ============================================================================
// Rendering
// ============================================================================

/// Remembers what was already printed so each snapshot only adds new lines.
#[derive(Default)]
pub struct Renderer {
    shown: HashSet<MessageId>,
    header: bool,
    status: String,
    call: CallView,
    last_notice: u64,
    reply_target: Option<MessageId>,
}

impl Renderer {
    pub fn render(&mut self, snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<String> {
        let mut out = Vec::new();
        let partner = snapshot
            .partner_name
            .clone()
            .unwrap_or_else(|| format!("User {}", snapshot.partner));

        if !self.header && snapshot.partner_name.is_some() {
            self.header = true;
            out.push(format!("--- Chat with {} ---", partner));
        }

        for message in &snapshot.messages {
            let Some(id) = message.id else {
                continue;
            };
            if self.shown.insert(id) {
                out.push(format_message(message, snapshot.me, &partner));
            }
        }

        let status = snapshot.partner_status.describe(now);
        if status != self.status {
            out.push(format!("({} is {})", partner, status));
            self.status = status;
        }

        let reply_target = snapshot.reply_target.as_ref().and_then(|m| m.id);
        if reply_target != self.reply_target {
            if let Some(target) = &snapshot.reply_target {
                out.push(format!("(replying to: {})", preview(&target.content)));
            }
            self.reply_target = reply_target;
        }

        if snapshot.call != self.call {
            if let Some(line) = describe_call(&snapshot.call, &self.call, &partner) {
                out.push(line);
            }
            self.call = snapshot.call.clone();
        }

        for notice in &snapshot.notices {
            if notice.id <= self.last_notice {
                continue;
            }
            self.last_notice = notice.id;
            let marker = match notice.level {
                NoticeLevel::Error => "!",
                NoticeLevel::Success => "+",
                NoticeLevel::Info => "*",
            };
            out.push(format!("{} {}", marker, notice.text));
        }

        if !snapshot.draft.is_empty() && out.iter().any(|l| l.starts_with('!')) {
            out.push(format!("(unsent: {})", snapshot.draft));
        }
        out
    }
}

fn format_message(message: &ChatMessage, me: i64, partner: &str) -> String {
    let time = message.timestamp.with_timezone(&Local).format("%H:%M");
    let author = if message.sender == me { "You" } else { partner };
    let id = message.id.unwrap_or_default();
    let mut line = format!("[{}] #{} {}: {}", time, id, author, message.content);
    if let Some(parent) = &message.reply_to {
        line.push_str(&format!("\n        > {}", preview(&parent.content)));
    }
    line
}

fn preview(content: &str) -> String {
    const MAX: usize = 40;
    if content.chars().count() <= MAX {
        content.to_string()
    } else {
        format!("{}...", content.chars().take(MAX).collect::<String>())
    }
}

fn describe_call(now: &CallView, before: &CallView, partner: &str) -> Option<String> {
    if now.phase == CallPhase::Idle {
        return (before.phase != CallPhase::Idle).then(|| "[call] ended".to_string());
    }
    let what = match now.phase {
        CallPhase::Dialing => format!("calling {}", partner),
        CallPhase::Incoming => format!("{} is calling, /accept or /hangup", partner),
        CallPhase::Connecting => "connecting".to_string(),
        CallPhase::Connected => format!("with {}", partner),
        CallPhase::Idle => return None,
    };
    let mut line = format!("[call] {}", what);
    if !now.step.is_empty() {
        line.push_str(&format!(" - {}", now.step));
    }
    if now.muted {
        line.push_str(" (muted)");
    }
    Some(line)
}

// ============================================================================
// Login redirect
// ============================================================================

/// Marks the session as expired; the chat loop exits and tells the user to
/// log in again.
#[derive(Default)]
pub struct TerminalRedirect {
    expired: AtomicBool,
}

impl TerminalRedirect {
    pub fn expired(&self) -> bool {
        self.expired.load(Ordering::SeqCst)
    }
}

impl LoginRedirect for TerminalRedirect {
    fn is_at_login(&self) -> bool {
        self.expired()
    }

    fn redirect_to_login(&self) {
        tracing::warn!("Credentials rejected, login required");
        self.expired.store(true, Ordering::SeqCst);
    }
}
