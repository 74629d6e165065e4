use serde::Deserialize;
use std::time::Duration;

pub use config::ConfigError;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub fcm: FcmSettings,
    #[serde(default)]
    pub apns: ApnsSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default = "default_server_settings")]
    pub server: ServerSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FcmSettings {
    /// Send URL template; `{project_id}` is replaced per request.
    #[serde(default = "default_fcm_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_fcm_scope")]
    pub oauth_scope: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Refresh this much earlier than the provider-stated token lifetime.
    #[serde(default = "default_token_safety_margin_secs")]
    pub token_safety_margin_secs: u64,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ApnsSettings {
    #[serde(default)]
    pub sandbox: bool,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct RetrySettings {
    #[serde(default = "default_min_retry_delay_secs")]
    pub min_delay_secs: u64,
    #[serde(default = "default_max_retry_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Wall-clock horizon for one attempt, first try included.
    #[serde(default = "default_max_retry_window_secs")]
    pub max_retry_window_secs: u64,
    /// Jitter range as a fraction of the delay (0.5 = ±50%).
    #[serde(default = "default_jitter_range")]
    pub jitter_range: f64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_rate_limit_delay_secs")]
    pub rate_limit_delay_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchSettings {
    #[serde(default = "default_max_concurrent_sends")]
    pub max_concurrent_sends: usize,
    #[serde(default = "default_ingest_channel_capacity")]
    pub ingest_channel_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl RetrySettings {
    pub fn min_delay(&self) -> Duration {
        Duration::from_secs(self.min_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    pub fn max_retry_window(&self) -> Duration {
        Duration::from_secs(self.max_retry_window_secs)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_secs(self.rate_limit_delay_secs)
    }
}

fn default_fcm_endpoint() -> String {
    "https://fcm.googleapis.com/v1/projects/{project_id}/messages:send".to_string()
}

fn default_fcm_scope() -> String {
    "https://www.googleapis.com/auth/firebase.messaging".to_string()
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_token_safety_margin_secs() -> u64 {
    100
}

fn default_min_retry_delay_secs() -> u64 {
    10
}

fn default_max_retry_delay_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    5
}

fn default_max_retry_window_secs() -> u64 {
    3600
}

fn default_jitter_range() -> f64 {
    0.5
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_sweep_interval_secs() -> u64 {
    1
}

fn default_rate_limit_delay_secs() -> u64 {
    60
}

fn default_max_concurrent_sends() -> usize {
    64
}

fn default_ingest_channel_capacity() -> usize {
    1000
}

fn default_server_settings() -> ServerSettings {
    ServerSettings {
        listen_addr: default_listen_addr(),
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8000".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = std::env::current_dir()
            .map_err(|e| ConfigError::Message(format!("Failed to get current dir: {}", e)))?;
        let config_path = config_dir.join("config").join("settings.yaml");

        let s = config::Config::builder()
            .add_source(config::File::from(config_path).required(false))
            // E.g. `CAMPAIGN_PUSH__RETRY__MAX_RETRIES=3` overrides `retry.max_retries`
            .add_source(config::Environment::with_prefix("CAMPAIGN_PUSH").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}

impl Default for FcmSettings {
    fn default() -> Self {
        Self {
            endpoint: default_fcm_endpoint(),
            oauth_scope: default_fcm_scope(),
            request_timeout_secs: default_request_timeout_secs(),
            token_safety_margin_secs: default_token_safety_margin_secs(),
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_concurrent_sends: default_max_concurrent_sends(),
            ingest_channel_capacity: default_ingest_channel_capacity(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            min_delay_secs: default_min_retry_delay_secs(),
            max_delay_secs: default_max_retry_delay_secs(),
            max_retries: default_max_retries(),
            max_retry_window_secs: default_max_retry_window_secs(),
            jitter_range: default_jitter_range(),
            queue_capacity: default_queue_capacity(),
            sweep_interval_secs: default_sweep_interval_secs(),
            rate_limit_delay_secs: default_rate_limit_delay_secs(),
        }
    }
}
