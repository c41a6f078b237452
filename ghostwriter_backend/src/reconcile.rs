//! Folds the external transcript into a conversation's AI history.
//!
//! Role attribution:
//! - received message -> user turn
//! - own message starting with the user marker (case-insensitive) -> user turn,
//!   marker stripped and trimmed
//! - any other own message -> assistant turn
//! - trimmed text equal to the reset command -> history restarts, no turn
//! - no text and no caption -> skipped
//!
//! Only messages above the sync cursor are folded in, and the cursor ends at
//! the highest id seen, so repeated passes over the same transcript are no-ops.
//! Replies that were recorded when they were sent are passed over the same way.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::conversation::{ConversationManager, MessageId, Role, SyncCursor, Turn};
use crate::transport::TranscriptMessage;

pub const DEFAULT_USER_MARKER: &str = "user:";
pub const DEFAULT_RESET_COMMAND: &str = "command: forgot history";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    Turn(Turn),
    Reset,
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fold messages above the cursor onto the existing history.
    #[default]
    Incremental,
    /// Rebuild the history from the given window, ignoring the cursor gate.
    Full,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions<'a> {
    pub mode: SyncMode,
    /// Messages older than this advance the cursor but produce no turn.
    pub not_before: Option<DateTime<Utc>>,
    /// Own messages already in the history. Incremental passes skip them.
    pub already_recorded: Option<&'a BTreeSet<MessageId>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub previous_cursor: MessageId,
    pub cursor: MessageId,
    pub turns_added: usize,
    pub reset: bool,
    /// The newest attributed message of the window was user input.
    pub needs_reply: bool,
    /// Date of the newest attributed message of the window.
    pub newest_at: Option<DateTime<Utc>>,
}

impl ReconcileOutcome {
    /// Whether the record or the cursor needs to be written.
    pub fn changed(&self) -> bool {
        self.cursor != self.previous_cursor || self.turns_added > 0 || self.reset
    }
}

#[derive(Debug, Clone)]
pub struct HistoryReconciler {
    user_marker: String,
    reset_command: String,
}

impl Default for HistoryReconciler {
    fn default() -> Self {
        Self::new(DEFAULT_USER_MARKER, DEFAULT_RESET_COMMAND)
    }
}

impl HistoryReconciler {
    pub fn new(user_marker: impl Into<String>, reset_command: impl Into<String>) -> Self {
        Self {
            user_marker: user_marker.into(),
            reset_command: reset_command.into(),
        }
    }

    pub fn attribute(&self, message: &TranscriptMessage) -> Attribution {
        let Some(body) = message.body() else {
            return Attribution::Skip;
        };

        if body.trim() == self.reset_command {
            return Attribution::Reset;
        }

        if !message.outgoing {
            return Attribution::Turn(Turn::user(body));
        }

        match self.strip_marker(body) {
            Some(content) if content.is_empty() => Attribution::Skip,
            Some(content) => Attribution::Turn(Turn::user(content)),
            None => Attribution::Turn(Turn::assistant(body)),
        }
    }

    fn strip_marker<'a>(&self, body: &'a str) -> Option<&'a str> {
        let marker_len = self.user_marker.len();
        let head = body.get(..marker_len)?;
        if head.eq_ignore_ascii_case(&self.user_marker) {
            Some(body[marker_len..].trim())
        } else {
            None
        }
    }

    /// Folds `messages` (oldest first) into `manager` and advances `cursor`.
    /// Persisting both is left to the caller.
    pub fn reconcile(
        &self,
        manager: &mut ConversationManager,
        cursor: &mut SyncCursor,
        messages: &[TranscriptMessage],
        options: ReconcileOptions<'_>,
    ) -> ReconcileOutcome {
        let previous_cursor = cursor.last_synced_message_id;
        let mut window: Vec<Turn> = Vec::new();
        let mut reset = false;
        let mut newest: Option<(Role, DateTime<Utc>)> = None;
        let mut high_water = previous_cursor;

        for message in messages {
            if options.mode == SyncMode::Incremental && cursor.covers(message.id) {
                continue;
            }
            high_water = high_water.max(message.id);

            if options.not_before.is_some_and(|cutoff| message.date < cutoff) {
                continue;
            }
            if options.mode == SyncMode::Incremental
                && message.outgoing
                && options.already_recorded.is_some_and(|ids| ids.contains(&message.id))
            {
                continue;
            }

            match self.attribute(message) {
                Attribution::Skip => {}
                Attribution::Reset => {
                    window.clear();
                    reset = true;
                    newest = None;
                }
                Attribution::Turn(turn) => {
                    newest = Some((turn.role, message.date));
                    window.push(turn);
                }
            }
        }

        let turns_added = window.len();
        match (options.mode, reset) {
            (SyncMode::Full, _) => manager.replace_turns(window),
            (SyncMode::Incremental, true) => {
                manager.reset_to_system_prompt();
                manager.replace_turns(window);
            }
            (SyncMode::Incremental, false) => {
                for turn in window {
                    manager.append(turn.role, turn.content);
                }
            }
        }
        cursor.advance(high_water);

        if reset {
            tracing::info!(
                "Conversation {}: reset command found, history restarted",
                manager.conversation_id()
            );
        }

        ReconcileOutcome {
            previous_cursor,
            cursor: cursor.last_synced_message_id,
            turns_added,
            reset,
            needs_reply: matches!(newest, Some((Role::User, _))),
            newest_at: newest.map(|(_, at)| at),
        }
    }
}
