use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::conversation::ConversationId;
use crate::error::ConfigError;
use crate::reconcile::{DEFAULT_RESET_COMMAND, DEFAULT_USER_MARKER};
use crate::scheduler::ReplyDelay;
use crate::typing::TypingProfile;

/// Telegram's service-notification account. Never answered.
pub const SERVICE_NOTIFICATIONS_CHAT: ConversationId = 777000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Driver {
    /// React to the live message stream.
    #[default]
    Listen,
    /// Periodically reconcile every dialog.
    Poll,
}

impl FromStr for Driver {
    type Err = ConfigError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "listen" => Ok(Driver::Listen),
            "poll" => Ok(Driver::Poll),
            _ => Err(ConfigError::UnknownDriver(raw.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatchUpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_catch_up_max_messages")]
    pub max_messages: usize,
    #[serde(default = "default_catch_up_max_age_hours")]
    pub max_age_hours: u64,
}

impl Default for CatchUpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_messages: default_catch_up_max_messages(),
            max_age_hours: default_catch_up_max_age_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Messaging transport
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    #[serde(default = "default_telegram_url")]
    pub telegram_api_url: String,
    #[serde(default = "default_transcript_capacity")]
    pub transcript_capacity: usize,

    // LLM configuration (OpenAI-compatible)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_temperature: Option<f32>,
    #[serde(default)]
    pub llm_max_tokens: Option<u32>,

    // Conversation storage and prompt
    #[serde(default = "default_history_dir")]
    pub history_dir: PathBuf,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub system_prompt_file: Option<PathBuf>,
    #[serde(default = "default_user_marker")]
    pub user_marker: String,
    #[serde(default = "default_reset_command")]
    pub reset_command: String,

    // Which chats and how
    #[serde(default)]
    pub ignored_chats: Vec<ConversationId>,
    #[serde(default)]
    pub driver: Driver,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_dialogs_limit")]
    pub dialogs_limit: usize,
    #[serde(default = "default_history_fetch_limit")]
    pub history_fetch_limit: usize,

    // Pacing
    #[serde(default)]
    pub reply_delay: ReplyDelay,
    #[serde(default)]
    pub typing: TypingProfile,
    #[serde(default)]
    pub catch_up: CatchUpConfig,
}

fn default_true() -> bool {
    true
}

fn default_telegram_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_transcript_capacity() -> usize {
    500
}

fn default_llm_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_history_dir() -> PathBuf {
    PathBuf::from("history")
}

fn default_user_marker() -> String {
    DEFAULT_USER_MARKER.to_string()
}

fn default_reset_command() -> String {
    DEFAULT_RESET_COMMAND.to_string()
}

fn default_poll_interval() -> u64 {
    5
}

fn default_dialogs_limit() -> usize {
    100
}

fn default_history_fetch_limit() -> usize {
    100
}

fn default_catch_up_max_messages() -> usize {
    50
}

fn default_catch_up_max_age_hours() -> u64 {
    48
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            telegram_bot_token: None,
            telegram_api_url: default_telegram_url(),
            transcript_capacity: default_transcript_capacity(),
            llm_api_url: default_llm_url(),
            llm_api_key: None,
            llm_model: default_llm_model(),
            llm_temperature: None,
            llm_max_tokens: None,
            history_dir: default_history_dir(),
            system_prompt: None,
            system_prompt_file: None,
            user_marker: default_user_marker(),
            reset_command: default_reset_command(),
            ignored_chats: Vec::new(),
            driver: Driver::default(),
            poll_interval_secs: default_poll_interval(),
            dialogs_limit: default_dialogs_limit(),
            history_fetch_limit: default_history_fetch_limit(),
            reply_delay: ReplyDelay::default(),
            typing: TypingProfile::default(),
            catch_up: CatchUpConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// `GHOSTWRITER_CONFIG` if set, else ghostwriter.toml next to the executable.
    pub fn config_path() -> PathBuf {
        env::var("GHOSTWRITER_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::get_base_dir().join("ghostwriter.toml"))
    }

    /// File layer, then environment overrides, then validation.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = env::var_os("GHOSTWRITER_CONFIG").is_some();
        let path = Self::config_path();

        let mut config = match Self::from_file(&path) {
            Ok(Some(config)) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Ok(None) if explicit => {
                return Err(ConfigError::Parse {
                    path,
                    message: "file not found".to_string(),
                })
            }
            Ok(None) => {
                tracing::info!("No config file at {:?}, using defaults + env vars", path);
                Self::default()
            }
            Err(e) => return Err(e),
        };

        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML config file. A missing file is `Ok(None)`.
    pub fn from_file(path: &Path) -> Result<Option<Self>, ConfigError> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })
            }
        };
        toml::from_str::<AgentConfig>(&contents)
            .map(Some)
            .map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
    }

    /// Applies environment overrides read through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = get("TELEGRAM_BOT_TOKEN") {
            self.telegram_bot_token = Some(token);
        }

        if let Some(url) = get("TELEGRAM_API_URL") {
            self.telegram_api_url = url;
        }

        if let Some(url) = get("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Some(key) = get("LLM_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
            self.llm_api_key = Some(key);
        }

        if let Some(model) = get("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Some(dir) = get("GHOSTWRITER_HISTORY_DIR") {
            self.history_dir = PathBuf::from(dir);
        }

        if let Some(prompt) = get("GHOSTWRITER_SYSTEM_PROMPT") {
            self.system_prompt = Some(prompt);
        }

        if let Some(path) = get("GHOSTWRITER_SYSTEM_PROMPT_FILE") {
            self.system_prompt_file = Some(PathBuf::from(path));
        }

        if let Some(list) = get("GHOSTWRITER_IGNORED_CHATS") {
            self.ignored_chats = parse_ignored_chats(&list)?;
        }

        if let Some(driver) = get("GHOSTWRITER_DRIVER") {
            self.driver = driver.parse()?;
        }

        if let Some(interval) = get("GHOSTWRITER_POLL_INTERVAL_SECS") {
            self.poll_interval_secs =
                interval
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        field: "poll_interval_secs",
                        reason: format!("{:?} is not a whole number of seconds", interval),
                    })?;
        }

        if let Some(enabled) = get("GHOSTWRITER_CATCH_UP") {
            self.catch_up.enabled = parse_flag(&enabled);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self
            .telegram_bot_token
            .as_deref()
            .map_or(true, |t| t.trim().is_empty())
        {
            return Err(ConfigError::MissingCredential("TELEGRAM_BOT_TOKEN"));
        }

        let has_key = self
            .llm_api_key
            .as_deref()
            .is_some_and(|k| !k.trim().is_empty());
        if !has_key && !self.llm_is_local() {
            return Err(ConfigError::MissingCredential("LLM_API_KEY"));
        }

        if self.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }

        check_bounds(
            "reply_delay",
            self.reply_delay.min_secs,
            self.reply_delay.max_secs,
        )?;
        check_bounds(
            "typing",
            self.typing.min_per_word_secs,
            self.typing.max_per_word_secs,
        )?;

        if self.system_prompt.as_deref().map_or(true, |p| p.trim().is_empty()) {
            if let Some(path) = &self.system_prompt_file {
                fs::metadata(path).map_err(|source| ConfigError::PromptFile {
                    path: path.clone(),
                    source,
                })?;
            }
        }

        Ok(())
    }

    /// Inline prompt, else the trimmed prompt file. `None` leaves the choice to
    /// the stored record or the built-in default.
    pub fn resolve_system_prompt(&self) -> Result<Option<String>, ConfigError> {
        if let Some(prompt) = self.system_prompt.as_deref() {
            if !prompt.trim().is_empty() {
                return Ok(Some(prompt.to_string()));
            }
        }

        match &self.system_prompt_file {
            Some(path) => fs::read_to_string(path)
                .map(|raw| Some(raw.trim().to_string()))
                .map_err(|source| ConfigError::PromptFile {
                    path: path.clone(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Configured ignore list plus the built-in entries.
    pub fn ignored_chat_ids(&self) -> HashSet<ConversationId> {
        let mut ids: HashSet<ConversationId> = self.ignored_chats.iter().copied().collect();
        ids.insert(SERVICE_NOTIFICATIONS_CHAT);
        ids
    }

    /// Loopback endpoints (Ollama, LM Studio, ...) do not need a key.
    pub fn llm_is_local(&self) -> bool {
        let url = self.llm_api_url.to_ascii_lowercase();
        let host = url
            .split("://")
            .nth(1)
            .unwrap_or(&url)
            .split(['/', ':'])
            .next()
            .unwrap_or_default()
            .to_string();
        host == "localhost" || host == "127.0.0.1" || host.starts_with("127.") || url.contains("://[::1]")
    }
}

fn parse_flag(raw: &str) -> bool {
    let raw = raw.trim();
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

fn check_bounds(field: &'static str, min: f64, max: f64) -> Result<(), ConfigError> {
    if !min.is_finite() || !max.is_finite() || min < 0.0 || min > max {
        return Err(ConfigError::InvalidValue {
            field,
            reason: format!("bounds [{}, {}] are not a valid range", min, max),
        });
    }
    Ok(())
}

/// Comma-separated chat ids. Blank entries are ignored, anything else must be an integer.
pub fn parse_ignored_chats(raw: &str) -> Result<Vec<ConversationId>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .parse::<ConversationId>()
                .map_err(|_| ConfigError::InvalidIgnoreEntry {
                    entry: entry.to_string(),
                })
        })
        .collect()
}
