use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `JOURNEY_ENGINE__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Limits for in-process waiting and welcome delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Step delays up to this many seconds are slept inline; longer ones are scheduled.
    #[serde(default = "default_inline_step_delay_max_secs")]
    pub inline_step_delay_max_secs: u32,
    /// Welcome delays up to this many seconds run in a background task.
    #[serde(default = "default_inline_welcome_delay_max_secs")]
    pub inline_welcome_delay_max_secs: u32,
    #[serde(default = "default_welcome_send_attempts")]
    pub welcome_send_attempts: u32,
    /// First retry backoff; each later retry waits three times longer.
    #[serde(default = "default_welcome_retry_base_secs")]
    pub welcome_retry_base_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_stale_delay_grace_secs")]
    pub stale_delay_grace_secs: i64,
    #[serde(default = "default_inactivity_interval_secs")]
    pub inactivity_interval_secs: u64,
    /// Rows left in `processing` longer than this are reconciled as failed.
    #[serde(default = "default_processing_lease_secs")]
    pub processing_lease_secs: i64,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_database_url() -> String {
    "postgres://localhost:5432/journeys".to_string()
}
fn default_max_connections() -> u32 {
    10
}
fn default_run_migrations() -> bool {
    true
}
fn default_inline_step_delay_max_secs() -> u32 {
    15
}
fn default_inline_welcome_delay_max_secs() -> u32 {
    60
}
fn default_welcome_send_attempts() -> u32 {
    3
}
fn default_welcome_retry_base_secs() -> u64 {
    5
}
fn default_scheduler_enabled() -> bool {
    true
}
fn default_tick_interval_secs() -> u64 {
    30
}
fn default_batch_size() -> usize {
    50
}
fn default_stale_delay_grace_secs() -> i64 {
    60
}
fn default_inactivity_interval_secs() -> u64 {
    3600
}
fn default_processing_lease_secs() -> i64 {
    600
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            inline_step_delay_max_secs: default_inline_step_delay_max_secs(),
            inline_welcome_delay_max_secs: default_inline_welcome_delay_max_secs(),
            welcome_send_attempts: default_welcome_send_attempts(),
            welcome_retry_base_secs: default_welcome_retry_base_secs(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            tick_interval_secs: default_tick_interval_secs(),
            batch_size: default_batch_size(),
            stale_delay_grace_secs: default_stale_delay_grace_secs(),
            inactivity_interval_secs: default_inactivity_interval_secs(),
            processing_lease_secs: default_processing_lease_secs(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            database: DatabaseConfig::default(),
            engine: EngineConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Backoff before the retry following `attempt` (1-based): 5s, 15s, 45s, ...
    pub fn welcome_backoff_secs(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(10);
        self.welcome_retry_base_secs.saturating_mul(3_u64.pow(exponent))
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("JOURNEY_ENGINE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
