//! File-backed persistence for conversation records and sync cursors.
//!
//! Layout under the history directory:
//! - `chat_<id>_history.json`: the conversation record
//! - `chat_<id>_last_synced.txt`: the sync cursor as decimal text
//! - `chat_<id>_sent.json`: ids of our own replies not yet passed by the cursor
//!
//! Records are written through a temp file + rename so a crash mid-write
//! never leaves a truncated JSON document behind.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::{ConversationId, ConversationRecord, MessageId, SyncCursor, Turn};
use crate::error::PersistenceError;

#[derive(Debug, Serialize, Deserialize)]
struct RecordFile {
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
    #[serde(default)]
    messages: Vec<Turn>,
}

#[derive(Debug, Clone)]
pub struct ConversationStore {
    root: PathBuf,
}

impl ConversationStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, conversation_id: ConversationId) -> PathBuf {
        self.root.join(format!("chat_{}_history.json", conversation_id))
    }

    pub fn cursor_path(&self, conversation_id: ConversationId) -> PathBuf {
        self.root.join(format!("chat_{}_last_synced.txt", conversation_id))
    }

    pub fn sent_path(&self, conversation_id: ConversationId) -> PathBuf {
        self.root.join(format!("chat_{}_sent.json", conversation_id))
    }

    pub fn ensure_dir(&self) -> Result<(), PersistenceError> {
        fs::create_dir_all(&self.root).map_err(|source| PersistenceError::Write {
            path: self.root.clone(),
            source,
        })
    }

    pub fn load_record(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<ConversationRecord>, PersistenceError> {
        let path = self.record_path(conversation_id);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistenceError::Read { path, source }),
        };

        if contents.trim().is_empty() {
            return Ok(None);
        }

        let file: RecordFile = serde_json::from_str(&contents)
            .map_err(|source| PersistenceError::Corrupt { path: path.clone(), source })?;

        let saved_at = file
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        Ok(Some(ConversationRecord {
            conversation_id,
            model: file.model.filter(|m| !m.trim().is_empty()),
            system_prompt: file.system_prompt.filter(|p| !p.trim().is_empty()),
            turns: file.messages,
            saved_at,
        }))
    }

    pub fn save_record(&self, record: &ConversationRecord) -> Result<(), PersistenceError> {
        let file = RecordFile {
            timestamp: Some(record.saved_at.to_rfc3339()),
            model: record.model.clone(),
            system_prompt: record.system_prompt.clone(),
            messages: record.turns.clone(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(PersistenceError::Serialize)?;
        self.write_atomic(&self.record_path(record.conversation_id), json.as_bytes())
    }

    /// Missing or unparsable cursor files read as zero so a damaged cursor
    /// only costs a redundant resync.
    pub fn load_cursor(
        &self,
        conversation_id: ConversationId,
    ) -> Result<SyncCursor, PersistenceError> {
        let path = self.cursor_path(conversation_id);
        let mut cursor = SyncCursor::new(conversation_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(cursor),
            Err(source) => return Err(PersistenceError::Read { path, source }),
        };

        match raw.trim().parse::<i64>() {
            Ok(id) => {
                cursor.advance(id);
            }
            Err(_) => {
                tracing::warn!(
                    "Ignoring malformed sync cursor {:?} for conversation {}",
                    path,
                    conversation_id
                );
            }
        }
        Ok(cursor)
    }

    pub fn save_cursor(&self, cursor: &SyncCursor) -> Result<(), PersistenceError> {
        let path = self.cursor_path(cursor.conversation_id);
        self.write_atomic(&path, cursor.last_synced_message_id.to_string().as_bytes())
    }

    /// Like the cursor, an unreadable list is logged and read as empty.
    pub fn load_sent_ids(
        &self,
        conversation_id: ConversationId,
    ) -> Result<BTreeSet<MessageId>, PersistenceError> {
        let path = self.sent_path(conversation_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(source) => return Err(PersistenceError::Read { path, source }),
        };

        match serde_json::from_str(&raw) {
            Ok(ids) => Ok(ids),
            Err(e) => {
                tracing::warn!(
                    "Ignoring malformed sent-id list {:?} for conversation {}: {}",
                    path,
                    conversation_id,
                    e
                );
                Ok(BTreeSet::new())
            }
        }
    }

    /// An empty set removes the file.
    pub fn save_sent_ids(
        &self,
        conversation_id: ConversationId,
        ids: &BTreeSet<MessageId>,
    ) -> Result<(), PersistenceError> {
        let path = self.sent_path(conversation_id);
        if ids.is_empty() {
            return match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(source) => Err(PersistenceError::Write { path, source }),
            };
        }
        let json = serde_json::to_string(ids).map_err(PersistenceError::Serialize)?;
        self.write_atomic(&path, json.as_bytes())
    }

    /// Conversation ids that have a record on disk.
    pub fn known_conversations(&self) -> Result<Vec<ConversationId>, PersistenceError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(PersistenceError::Read {
                    path: self.root.clone(),
                    source,
                })
            }
        };

        let mut ids: Vec<ConversationId> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let name = name.to_str()?;
                name.strip_prefix("chat_")?
                    .strip_suffix("_history.json")?
                    .parse()
                    .ok()
            })
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
        self.ensure_dir()?;

        let write_err = |source: std::io::Error| PersistenceError::Write {
            path: path.to_path_buf(),
            source,
        };

        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let mut tmp_file = File::create(&tmp_path).map_err(write_err)?;
        tmp_file.write_all(bytes).map_err(write_err)?;
        tmp_file.sync_all().map_err(write_err)?;
        drop(tmp_file);

        fs::rename(&tmp_path, path).map_err(write_err)
    }
}

/// Accepts RFC 3339 as well as the naive local `YYYY-MM-DDTHH:MM:SS[.ffffff]`
/// form older history files carry.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|ts| ts.with_timezone(&Utc))
}
