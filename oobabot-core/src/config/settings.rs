//! Settings configuration loaded from TOML files.
//!
//! This module handles non-sensitive configuration stored in TOML format
//! in the XDG config directory (~/.config/oobabot/config.toml).

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default TOML configuration file content
const DEFAULT_CONFIG_TOML: &str = r####"# oobabot configuration file
# Located at: ~/.config/oobabot/config.toml
#
# Secrets are loaded from environment variables:
#   - DISCORD_TOKEN
#   - OOBABOT_API_KEY (optional, bearer token for the text backend)
#   - OOBABOT_VISION_API_KEY (optional)

[persona]
ai_name = "oobabot"
persona = ""
wakewords = ["oobabot"]

[discord]
history_lines = 7
# Seconds to wait for follow-up messages before deciding to respond.
message_accumulation_period = 0.0
# Stop waiting early once this many additional messages arrived (0 = never).
continue_on_additional_messages = 0
respond_to_latest_only = false
skip_in_progress_responses = false
panic_duration = 30.0
ignore_dms = false
ignore_bots = true
ignore_prefixes = []
# Reactions that hide a message from the bot when its author (or a bot) adds them.
ignore_reactions = []
reply_in_thread = false
use_immersion_breaking_filter = true
stop_markers = ["<|im_end|>", "<|endoftext|>", "### Instruction:"]
# off | standard | aggressive | comprehensive
prevent_impersonation = "off"
# off | token | sentence
stream_responses = "off"
stream_responses_speed_limit = 0.7
dont_split_responses = false
message_character_limit = 2000
unsolicited_channel_cap = 3
disable_unsolicited_replies = false
time_vs_response_chance = [[180.0, 0.99], [300.0, 0.70], [600.0, 0.50]]
voice_time_vs_response_chance = [[30.0, 0.95], [60.0, 0.90], [180.0, 0.85]]
interrobang_bonus = 0.3
repetition_threshold = 1
# 0.0 only counts exact repeats.
repetition_similarity_threshold = 0.0
include_lobotomize_response = true
task_cleanup_timeout = 5.0
# Seconds without a response before showing as idle (0 = stay online).
idle_timeout = 300.0

[oobabooga]
base_url = "http://localhost:5000"
use_chat_completions = false
model = ""
retries = 0
message_regex = ""
log_all_the_things = false
request_timeout_seconds = 300

[oobabooga.request_params]
max_tokens = 300
truncation_length = 4096
temperature = 0.98
top_p = 0.37
top_k = 100
repetition_penalty = 1.18
stop = []

[stable_diffusion]
url = ""
image_words = ["draw", "sketch", "paint", "make", "generate", "post", "upload"]
# Substituted with avatar_prompt when it is set.
avatar_words = ["self-portrait", "self portrait", "your avatar", "your pfp", "your profile pic", "yourself", "you"]
avatar_prompt = ""
extra_prompt_text = ""
timeout_seconds = 180

[stable_diffusion.request_params]
steps = 30
width = 512
height = 512

[vision]
url = ""
model = "gpt-4-vision-preview"

[templates]
user_history_block = "{name}: {message}\n"
bot_history_block = "{name}: {message}\n"
prompt = "{persona}\n\n{history}"
image_coming = "{ai_name} is currently generating an image, as requested.\n"
# Used by /rewrite. {response} is the message being rewritten.
rewrite_request = "{ai_name}'s last message was:\n{response}\n{ai_name} will now rewrite it following this instruction: {instruction}\n"

[logging]
level = "info"
"####;

/// Settings loaded from TOML configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub persona: PersonaSettings,

    #[serde(default)]
    pub discord: DiscordSettings,

    /// Text-generation backend
    #[serde(default)]
    pub oobabooga: OobaboogaSettings,

    #[serde(default)]
    pub stable_diffusion: StableDiffusionSettings,

    #[serde(default)]
    pub vision: VisionSettings,

    /// Prompt and history templates
    #[serde(default)]
    pub templates: TemplateSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// How generated text is delivered while it is still being produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Wait for the full response, then post it.
    #[default]
    #[serde(alias = "")]
    Off,
    /// Edit a single message in place as tokens arrive.
    Token,
    /// Post each sentence as it completes.
    Sentence,
}

/// Extra stop sequences added so the model does not speak for other users.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImpersonationGuard {
    #[default]
    #[serde(alias = "")]
    Off,
    /// Stop on each participant's templated turn prefix.
    Standard,
    /// Stop on a newline followed by each participant's first name.
    Aggressive,
    /// Both of the above.
    Comprehensive,
}

impl ImpersonationGuard {
    pub fn uses_prefix(self) -> bool {
        matches!(self, Self::Standard | Self::Comprehensive)
    }

    pub fn uses_first_name(self) -> bool {
        matches!(self, Self::Aggressive | Self::Comprehensive)
    }
}

/// Calibration table of `(elapsed_seconds, response_chance)` pairs.
pub type ChanceTable = Vec<(f64, f64)>;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PersonaSettings {
    /// Name the bot uses for itself in prompts
    #[serde(default = "default_ai_name")]
    pub ai_name: String,

    /// Free-form persona text placed at the top of every prompt
    #[serde(default)]
    pub persona: String,

    /// Words that count as addressing the bot directly
    #[serde(default = "default_wakewords")]
    pub wakewords: Vec<String>,
}

/// Discord behaviour settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscordSettings {
    #[serde(default = "default_history_lines")]
    pub history_lines: usize,

    /// Debounce window in seconds (0 disables buffering)
    #[serde(default)]
    pub message_accumulation_period: f64,

    #[serde(default)]
    pub continue_on_additional_messages: usize,

    #[serde(default)]
    pub respond_to_latest_only: bool,

    #[serde(default)]
    pub skip_in_progress_responses: bool,

    /// Seconds a channel stays silenced after an unpoke
    #[serde(default = "default_panic_duration")]
    pub panic_duration: f64,

    #[serde(default)]
    pub ignore_dms: bool,

    #[serde(default = "default_true")]
    pub ignore_bots: bool,

    /// Messages starting with any of these are hidden from the bot
    #[serde(default)]
    pub ignore_prefixes: Vec<String>,

    /// Emoji that hide a message from history when its author reacts with them
    #[serde(default)]
    pub ignore_reactions: Vec<String>,

    #[serde(default)]
    pub reply_in_thread: bool,

    #[serde(default = "default_true")]
    pub use_immersion_breaking_filter: bool,

    #[serde(default = "default_stop_markers")]
    pub stop_markers: Vec<String>,

    #[serde(default)]
    pub prevent_impersonation: ImpersonationGuard,

    #[serde(default)]
    pub stream_responses: StreamMode,

    /// Minimum seconds between streamed updates
    #[serde(default = "default_stream_speed_limit")]
    pub stream_responses_speed_limit: f64,

    #[serde(default)]
    pub dont_split_responses: bool,

    #[serde(default = "default_message_character_limit")]
    pub message_character_limit: usize,

    /// Channels per guild tracked for unsolicited replies (0 = unlimited)
    #[serde(default = "default_unsolicited_channel_cap")]
    pub unsolicited_channel_cap: usize,

    #[serde(default)]
    pub disable_unsolicited_replies: bool,

    #[serde(default = "default_time_vs_response_chance")]
    pub time_vs_response_chance: ChanceTable,

    #[serde(default = "default_voice_time_vs_response_chance")]
    pub voice_time_vs_response_chance: ChanceTable,

    #[serde(default = "default_interrobang_bonus")]
    pub interrobang_bonus: f64,

    #[serde(default = "default_repetition_threshold")]
    pub repetition_threshold: u32,

    /// Token-set similarity (0..=1) counted as a repeat; 0 means exact only
    #[serde(default)]
    pub repetition_similarity_threshold: f64,

    #[serde(default = "default_true")]
    pub include_lobotomize_response: bool,

    /// Seconds to wait for a cancelled response task before giving up on it
    #[serde(default = "default_task_cleanup_timeout")]
    pub task_cleanup_timeout: f64,

    /// Seconds without a response before the presence turns idle, 0 disables
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: f64,
}

/// Text-generation backend settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OobaboogaSettings {
    #[serde(default = "default_ooba_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub use_chat_completions: bool,

    #[serde(default)]
    pub model: String,

    /// Extra attempts after an empty or failed response. Signed so that a
    /// negative value in the file is reported instead of silently wrapped.
    #[serde(default)]
    pub retries: i32,

    /// Optional regex whose first capture group delimits messages
    #[serde(default)]
    pub message_regex: String,

    /// Log request bodies and every received token at debug level
    #[serde(default)]
    pub log_all_the_things: bool,

    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,

    /// Forwarded verbatim into the completion request body
    #[serde(default = "default_ooba_request_params")]
    pub request_params: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StableDiffusionSettings {
    /// Empty disables image generation
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_image_words")]
    pub image_words: Vec<String>,

    #[serde(default = "default_avatar_words")]
    pub avatar_words: Vec<String>,

    #[serde(default)]
    pub avatar_prompt: String,

    #[serde(default)]
    pub extra_prompt_text: String,

    #[serde(default = "default_sd_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default = "default_sd_request_params")]
    pub request_params: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VisionSettings {
    /// Empty disables image descriptions
    #[serde(default)]
    pub url: String,

    #[serde(default = "default_vision_model")]
    pub model: String,

    #[serde(default)]
    pub request_params: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TemplateSettings {
    #[serde(default = "default_history_block")]
    pub user_history_block: String,

    #[serde(default = "default_history_block")]
    pub bot_history_block: String,

    #[serde(default = "default_prompt_template")]
    pub prompt: String,

    #[serde(default = "default_image_coming")]
    pub image_coming: String,

    #[serde(default = "default_rewrite_request")]
    pub rewrite_request: String,
}

/// Logging settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingSettings {
    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_ai_name() -> String {
    "oobabot".to_string()
}

fn default_wakewords() -> Vec<String> {
    vec!["oobabot".to_string()]
}

fn default_history_lines() -> usize {
    7
}

fn default_panic_duration() -> f64 {
    30.0
}

fn default_stop_markers() -> Vec<String> {
    ["<|im_end|>", "<|endoftext|>", "### Instruction:"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_stream_speed_limit() -> f64 {
    0.7
}

fn default_message_character_limit() -> usize {
    2000
}

fn default_unsolicited_channel_cap() -> usize {
    3
}

fn default_time_vs_response_chance() -> ChanceTable {
    vec![(180.0, 0.99), (300.0, 0.70), (600.0, 0.50)]
}

fn default_voice_time_vs_response_chance() -> ChanceTable {
    vec![(30.0, 0.95), (60.0, 0.90), (180.0, 0.85)]
}

fn default_interrobang_bonus() -> f64 {
    0.3
}

fn default_repetition_threshold() -> u32 {
    1
}

fn default_task_cleanup_timeout() -> f64 {
    5.0
}

fn default_idle_timeout() -> f64 {
    300.0
}

fn default_ooba_base_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_request_timeout_seconds() -> u64 {
    300
}

fn default_ooba_request_params() -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("max_tokens".into(), Value::from(300));
    params.insert("truncation_length".into(), Value::from(4096));
    params.insert("temperature".into(), Value::from(0.98));
    params.insert("top_p".into(), Value::from(0.37));
    params.insert("top_k".into(), Value::from(100));
    params.insert("repetition_penalty".into(), Value::from(1.18));
    params.insert("stop".into(), Value::Array(Vec::new()));
    params
}

fn default_image_words() -> Vec<String> {
    ["draw", "sketch", "paint", "make", "generate", "post", "upload"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_avatar_words() -> Vec<String> {
    [
        "self-portrait",
        "self portrait",
        "your avatar",
        "your pfp",
        "your profile pic",
        "yourself",
        "you",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_sd_timeout_seconds() -> u64 {
    180
}

fn default_sd_request_params() -> Map<String, Value> {
    let mut params = Map::new();
    params.insert("steps".into(), Value::from(30));
    params.insert("width".into(), Value::from(512));
    params.insert("height".into(), Value::from(512));
    params
}

fn default_vision_model() -> String {
    "gpt-4-vision-preview".to_string()
}

fn default_history_block() -> String {
    "{name}: {message}\n".to_string()
}

fn default_prompt_template() -> String {
    "{persona}\n\n{history}".to_string()
}

fn default_image_coming() -> String {
    "{ai_name} is currently generating an image, as requested.\n".to_string()
}

fn default_rewrite_request() -> String {
    "{ai_name}'s last message was:\n{response}\n\
     {ai_name} will now rewrite it following this instruction: {instruction}\n"
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for PersonaSettings {
    fn default() -> Self {
        Self {
            ai_name: default_ai_name(),
            persona: String::new(),
            wakewords: default_wakewords(),
        }
    }
}

impl Default for DiscordSettings {
    fn default() -> Self {
        Self {
            history_lines: default_history_lines(),
            message_accumulation_period: 0.0,
            continue_on_additional_messages: 0,
            respond_to_latest_only: false,
            skip_in_progress_responses: false,
            panic_duration: default_panic_duration(),
            ignore_dms: false,
            ignore_bots: true,
            ignore_prefixes: Vec::new(),
            ignore_reactions: Vec::new(),
            reply_in_thread: false,
            use_immersion_breaking_filter: true,
            stop_markers: default_stop_markers(),
            prevent_impersonation: ImpersonationGuard::Off,
            stream_responses: StreamMode::Off,
            stream_responses_speed_limit: default_stream_speed_limit(),
            dont_split_responses: false,
            message_character_limit: default_message_character_limit(),
            unsolicited_channel_cap: default_unsolicited_channel_cap(),
            disable_unsolicited_replies: false,
            time_vs_response_chance: default_time_vs_response_chance(),
            voice_time_vs_response_chance: default_voice_time_vs_response_chance(),
            interrobang_bonus: default_interrobang_bonus(),
            repetition_threshold: default_repetition_threshold(),
            repetition_similarity_threshold: 0.0,
            include_lobotomize_response: true,
            task_cleanup_timeout: default_task_cleanup_timeout(),
            idle_timeout: default_idle_timeout(),
        }
    }
}

impl Default for OobaboogaSettings {
    fn default() -> Self {
        Self {
            base_url: default_ooba_base_url(),
            use_chat_completions: false,
            model: String::new(),
            retries: 0,
            message_regex: String::new(),
            log_all_the_things: false,
            request_timeout_seconds: default_request_timeout_seconds(),
            request_params: default_ooba_request_params(),
        }
    }
}

impl Default for StableDiffusionSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            image_words: default_image_words(),
            avatar_words: default_avatar_words(),
            avatar_prompt: String::new(),
            extra_prompt_text: String::new(),
            timeout_seconds: default_sd_timeout_seconds(),
            request_params: default_sd_request_params(),
        }
    }
}

impl Default for VisionSettings {
    fn default() -> Self {
        Self {
            url: String::new(),
            model: default_vision_model(),
            request_params: Map::new(),
        }
    }
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            user_history_block: default_history_block(),
            bot_history_block: default_history_block(),
            prompt: default_prompt_template(),
            image_coming: default_image_coming(),
            rewrite_request: default_rewrite_request(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Errors that can occur when loading settings
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config directory not found")]
    ConfigDirNotFound,

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Checks a `(threshold, chance)` table: thresholds non-negative and
/// strictly increasing, chances within `[0, 1]`.
pub fn validate_chance_table(name: &str, table: &[(f64, f64)]) -> Result<(), SettingsError> {
    let mut previous: Option<f64> = None;
    for &(threshold, chance) in table {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(SettingsError::Invalid(format!(
                "{name}: threshold {threshold} must be a non-negative number"
            )));
        }
        if !(0.0..=1.0).contains(&chance) {
            return Err(SettingsError::Invalid(format!(
                "{name}: chance {chance} must be between 0 and 1"
            )));
        }
        if let Some(prev) = previous {
            if threshold <= prev {
                return Err(SettingsError::Invalid(format!(
                    "{name}: thresholds must be strictly increasing ({prev} then {threshold})"
                )));
            }
        }
        previous = Some(threshold);
    }
    Ok(())
}

fn non_negative(name: &str, value: f64) -> Result<(), SettingsError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(SettingsError::Invalid(format!(
            "{name} must be a non-negative number, got {value}"
        )))
    }
}

impl Settings {
    /// Load settings from the TOML configuration file.
    ///
    /// If the config file doesn't exist, creates it with default values.
    /// The file is located at `~/.config/oobabot/config.toml`.
    pub fn load() -> Result<Self, SettingsError> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            tracing::info!("Creating default configuration at {:?}", config_path);
            Self::create_default_config(&config_path)?;
        }

        let content = fs::read_to_string(&config_path)?;
        let settings = Self::from_toml(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from TOML content.
    pub fn from_toml(content: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(content)?;
        Ok(settings)
    }

    /// Serialize settings to TOML content.
    pub fn to_toml(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values that would only blow up later, at request time.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let discord = &self.discord;
        validate_chance_table("time_vs_response_chance", &discord.time_vs_response_chance)?;
        validate_chance_table(
            "voice_time_vs_response_chance",
            &discord.voice_time_vs_response_chance,
        )?;
        non_negative("message_accumulation_period", discord.message_accumulation_period)?;
        non_negative("panic_duration", discord.panic_duration)?;
        non_negative("stream_responses_speed_limit", discord.stream_responses_speed_limit)?;
        non_negative("interrobang_bonus", discord.interrobang_bonus)?;
        non_negative("task_cleanup_timeout", discord.task_cleanup_timeout)?;
        non_negative("idle_timeout", discord.idle_timeout)?;

        if !(0.0..=1.0).contains(&discord.repetition_similarity_threshold) {
            return Err(SettingsError::Invalid(format!(
                "repetition_similarity_threshold must be between 0 and 1, got {}",
                discord.repetition_similarity_threshold
            )));
        }
        if discord.message_character_limit == 0 {
            return Err(SettingsError::Invalid(
                "message_character_limit must be positive".to_string(),
            ));
        }
        if self.oobabooga.retries < 0 {
            return Err(SettingsError::Invalid(format!(
                "retries must not be negative, got {}",
                self.oobabooga.retries
            )));
        }
        if !self.oobabooga.message_regex.is_empty() {
            let re = regex::Regex::new(&self.oobabooga.message_regex).map_err(|e| {
                SettingsError::Invalid(format!("message_regex does not compile: {e}"))
            })?;
            if re.captures_len() < 2 {
                return Err(SettingsError::Invalid(
                    "message_regex needs a capture group".to_string(),
                ));
            }
        }
        for (name, template) in [
            ("user_history_block", &self.templates.user_history_block),
            ("bot_history_block", &self.templates.bot_history_block),
        ] {
            if !template.contains("{name}") || !template.contains("{message}") {
                return Err(SettingsError::Invalid(format!(
                    "{name} must contain {{name}} and {{message}}"
                )));
            }
        }
        if !self.templates.prompt.contains("{history}") {
            return Err(SettingsError::Invalid(
                "prompt template must contain {history}".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the configuration file path.
    ///
    /// Uses XDG config directory: `~/.config/oobabot/config.toml`
    pub fn config_path() -> Result<PathBuf, SettingsError> {
        if let Ok(override_dir) = std::env::var("OOBABOT_CONFIG_DIR") {
            let dir = PathBuf::from(override_dir);
            return Ok(dir.join("config.toml"));
        }

        let config_dir = dirs::config_dir()
            .ok_or(SettingsError::ConfigDirNotFound)?
            .join("oobabot");

        Ok(config_dir.join("config.toml"))
    }

    fn create_default_config(path: &PathBuf) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, DEFAULT_CONFIG_TOML)?;
        Ok(())
    }

    /// Save settings to the default configuration file path.
    pub fn save(&self) -> Result<(), SettingsError> {
        let config_path = Self::config_path()?;
        self.save_to_path(&config_path)
    }

    /// Save settings to a specific file path.
    pub fn save_to_path(&self, path: &PathBuf) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = self.to_toml()?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Upper bound on prompt size in characters, estimated from the token
    /// budget left after reserving room for the reply.
    pub fn prompt_char_budget(&self) -> usize {
        let params = &self.oobabooga.request_params;
        let truncation = params
            .get("truncation_length")
            .and_then(Value::as_u64)
            .unwrap_or(4096);
        let max_tokens = params.get("max_tokens").and_then(Value::as_u64).unwrap_or(300);
        (truncation.saturating_sub(max_tokens) * 3) as usize
    }
}
