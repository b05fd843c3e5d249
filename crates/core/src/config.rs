use serde::Deserialize;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `FEEDBACK__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
    #[serde(default)]
    pub rewards: RewardsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

// ─── Dispatch Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Interval of the tick driver; the floor for `message_delay_seconds = 0`.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_transport_timeout_ms")]
    pub transport_timeout_ms: u64,
    /// Total transport attempts per queue entry, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_tick_interval_ms() -> u64 { 1000 }
fn default_transport_timeout_ms() -> u64 { 10_000 }
fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff_ms() -> u64 { 2_000 }
fn default_max_backoff_ms() -> u64 { 60_000 }
fn default_backoff_multiplier() -> f64 { 2.0 }

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            transport_timeout_ms: default_transport_timeout_ms(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

// ─── WhatsApp Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct WhatsAppConfig {
    #[serde(default = "default_whatsapp_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub access_token: String,
}

fn default_whatsapp_api_base_url() -> String {
    "http://localhost:8081".to_string()
}

impl Default for WhatsAppConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_whatsapp_api_base_url(),
            access_token: String::new(),
        }
    }
}

// ─── Rewards Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct RewardsConfig {
    #[serde(default = "default_coupon_code_length")]
    pub coupon_code_length: usize,
    /// Days until an issued coupon expires; `None` never expires.
    #[serde(default = "default_coupon_validity_days")]
    pub coupon_validity_days: Option<u32>,
    /// How often issued coupons are checked for expiry.
    #[serde(default = "default_expiry_sweep_interval_secs")]
    pub expiry_sweep_interval_secs: u64,
}

fn default_coupon_code_length() -> usize { 8 }
fn default_coupon_validity_days() -> Option<u32> { Some(30) }
fn default_expiry_sweep_interval_secs() -> u64 { 300 }

impl Default for RewardsConfig {
    fn default() -> Self {
        Self {
            coupon_code_length: default_coupon_code_length(),
            coupon_validity_days: default_coupon_validity_days(),
            expiry_sweep_interval_secs: default_expiry_sweep_interval_secs(),
        }
    }
}

// ─── Metrics Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_host() -> String {
    "0.0.0.0".to_string()
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            host: default_metrics_host(),
            port: default_metrics_port(),
        }
    }
}

fn default_node_id() -> String {
    "node-01".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            dispatch: DispatchConfig::default(),
            whatsapp: WhatsAppConfig::default(),
            rewards: RewardsConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional config file and environment
    /// variables. Environment values win.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("FEEDBACK")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        config.try_deserialize()
    }
}
