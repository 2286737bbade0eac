use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::fs;
use std::time::Duration;

#[derive(Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub database_url: String,

    // Write-back cache
    pub flush_interval_secs: u64,
    pub message_buffer_cap: usize,
    pub index_shards: usize,

    // Recent message rings
    pub recent_messages_per_group: usize,
    pub recent_groups_capacity: usize,
    pub warm_recent_messages: usize,

    // Learning
    pub keyword_limit: usize,
    pub context_window_secs: i64,

    // Reply selection
    pub answer_threshold: i64,
    pub cross_group_threshold: i64,
    pub topicality_half_life_secs: i64,
    pub repeat_threshold: usize,

    // Moderation
    pub blacklist_policy: BlacklistPolicyKind,
    pub blacklist_reserve_strikes: usize,
    pub blacklist_refresh_secs: u64,

    // Startup
    pub hydrate_retries: u32,
    pub hydrate_retry_delay_secs: u64,
}

/// Which promotion rule governs a group's reserve blacklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlacklistPolicyKind {
    Immediate,
    Reserve,
}

impl std::str::FromStr for BlacklistPolicyKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "reserve" => Ok(Self::Reserve),
            other => Err(anyhow::anyhow!("unknown blacklist policy '{}'", other)),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "data/repeater.db".to_string(),
            flush_interval_secs: 60,
            message_buffer_cap: 50_000,
            index_shards: 16,
            recent_messages_per_group: 32,
            recent_groups_capacity: 10_000,
            warm_recent_messages: 2_000,
            keyword_limit: 2,
            context_window_secs: 300,
            answer_threshold: 1,
            cross_group_threshold: 0,
            topicality_half_life_secs: 86_400,
            repeat_threshold: 3,
            blacklist_policy: BlacklistPolicyKind::Immediate,
            blacklist_reserve_strikes: 2,
            blacklist_refresh_secs: 0,
            hydrate_retries: 3,
            hydrate_retry_delay_secs: 1,
        }
    }
}

impl Config {
    /// Loads `REPEATER_CONFIG` (default `repeater.toml`) if present, else the
    /// environment.
    pub fn load() -> anyhow::Result<Self> {
        dotenv().ok();
        let path = env::var("REPEATER_CONFIG").unwrap_or_else(|_| "repeater.toml".to_string());
        match fs::read_to_string(&path) {
            Ok(content) => Self::from_toml(&content)
                .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path, e)),
            Err(_) => Self::build(),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        dotenv().ok();
        Self::build()
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn build() -> anyhow::Result<Self> {
        let defaults = Config::default();
        let config = Config {
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            flush_interval_secs: env_secs("FLUSH_INTERVAL", defaults.flush_interval_secs)?,
            message_buffer_cap: env_parse("MESSAGE_BUFFER_CAP", defaults.message_buffer_cap),
            index_shards: env_parse("INDEX_SHARDS", defaults.index_shards),
            recent_messages_per_group: env_parse(
                "RECENT_MESSAGES_PER_GROUP",
                defaults.recent_messages_per_group,
            ),
            recent_groups_capacity: env_parse(
                "RECENT_GROUPS_CAPACITY",
                defaults.recent_groups_capacity,
            ),
            warm_recent_messages: env_parse("WARM_RECENT_MESSAGES", defaults.warm_recent_messages),
            keyword_limit: env_parse("KEYWORD_LIMIT", defaults.keyword_limit),
            context_window_secs: env_secs("CONTEXT_WINDOW", defaults.context_window_secs as u64)?
                as i64,
            answer_threshold: env_parse("ANSWER_THRESHOLD", defaults.answer_threshold),
            cross_group_threshold: env_parse(
                "CROSS_GROUP_THRESHOLD",
                defaults.cross_group_threshold,
            ),
            topicality_half_life_secs: env_secs(
                "TOPICALITY_HALF_LIFE",
                defaults.topicality_half_life_secs as u64,
            )? as i64,
            repeat_threshold: env_parse("REPEAT_THRESHOLD", defaults.repeat_threshold),
            blacklist_policy: match env::var("BLACKLIST_POLICY") {
                Ok(value) => value.parse()?,
                Err(_) => defaults.blacklist_policy,
            },
            blacklist_reserve_strikes: env_parse(
                "BLACKLIST_RESERVE_STRIKES",
                defaults.blacklist_reserve_strikes,
            ),
            blacklist_refresh_secs: env_secs("BLACKLIST_REFRESH", defaults.blacklist_refresh_secs)?,
            hydrate_retries: env_parse("HYDRATE_RETRIES", defaults.hydrate_retries),
            hydrate_retry_delay_secs: env_secs(
                "HYDRATE_RETRY_DELAY",
                defaults.hydrate_retry_delay_secs,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.flush_interval_secs == 0 {
            anyhow::bail!("FLUSH_INTERVAL must be greater than zero");
        }
        if self.index_shards == 0 {
            anyhow::bail!("INDEX_SHARDS must be greater than zero");
        }
        if self.topicality_half_life_secs <= 0 {
            anyhow::bail!("TOPICALITY_HALF_LIFE must be greater than zero");
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn blacklist_refresh_interval(&self) -> Option<Duration> {
        (self.blacklist_refresh_secs > 0).then(|| Duration::from_secs(self.blacklist_refresh_secs))
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Reads an interval as plain seconds or a humantime string such as `5m`.
fn env_secs(name: &str, default: u64) -> anyhow::Result<u64> {
    match env::var(name) {
        Ok(value) => parse_secs(&value).map_err(|e| anyhow::anyhow!("{} is invalid: {}", name, e)),
        Err(_) => Ok(default),
    }
}

fn parse_secs(value: &str) -> anyhow::Result<u64> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(secs);
    }
    Ok(humantime::parse_duration(value)?.as_secs())
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &self.database_url)
            .field(
                "flush_interval",
                &humantime::format_duration(self.flush_interval()).to_string(),
            )
            .field("message_buffer_cap", &self.message_buffer_cap)
            .field("index_shards", &self.index_shards)
            .field("recent_messages_per_group", &self.recent_messages_per_group)
            .field("recent_groups_capacity", &self.recent_groups_capacity)
            .field("warm_recent_messages", &self.warm_recent_messages)
            .field("keyword_limit", &self.keyword_limit)
            .field("context_window_secs", &self.context_window_secs)
            .field("answer_threshold", &self.answer_threshold)
            .field("cross_group_threshold", &self.cross_group_threshold)
            .field("topicality_half_life_secs", &self.topicality_half_life_secs)
            .field("repeat_threshold", &self.repeat_threshold)
            .field("blacklist_policy", &self.blacklist_policy)
            .field("blacklist_reserve_strikes", &self.blacklist_reserve_strikes)
            .field("blacklist_refresh_secs", &self.blacklist_refresh_secs)
            .field("hydrate_retries", &self.hydrate_retries)
            .finish()
    }
}
