use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::proto::DEFAULT_MAX_MESSAGE_SIZE;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointConfig {
    #[serde(default = "default_network")]
    pub network: String,
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Client-side bind address for dialing.
    #[serde(default)]
    pub local_address: Option<String>,
    #[serde(default = "default_body_codec")]
    pub default_body_codec: String,
    /// 0 means sessions never expire.
    #[serde(default)]
    pub default_session_age_ms: u64,
    /// 0 means handlers run without a deadline.
    #[serde(default)]
    pub default_context_age_ms: u64,
    /// 0 disables slow-call warnings.
    #[serde(default)]
    pub slow_comet_duration_ms: u64,
    /// Negative retries forever.
    #[serde(default)]
    pub redial_times: i32,
    #[serde(default = "default_redial_interval")]
    pub redial_interval_ms: u64,
    #[serde(default)]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u32,
    #[serde(default = "default_max_concurrent_handlers")]
    pub max_concurrent_handlers: usize,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
    #[serde(default)]
    pub print_detail: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            listen_address: default_listen_address(),
            local_address: None,
            default_body_codec: default_body_codec(),
            default_session_age_ms: 0,
            default_context_age_ms: 0,
            slow_comet_duration_ms: 0,
            redial_times: 0,
            redial_interval_ms: default_redial_interval(),
            dial_timeout_ms: 0,
            max_message_size: default_max_message_size(),
            max_concurrent_handlers: default_max_concurrent_handlers(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            print_detail: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn non_zero(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl EndpointConfig {
    pub fn session_age(&self) -> Option<Duration> {
        non_zero(self.default_session_age_ms)
    }

    pub fn context_age(&self) -> Option<Duration> {
        non_zero(self.default_context_age_ms)
    }

    pub fn slow_comet_duration(&self) -> Option<Duration> {
        non_zero(self.slow_comet_duration_ms)
    }

    pub fn redial_interval(&self) -> Duration {
        Duration::from_millis(self.redial_interval_ms)
    }

    pub fn dial_timeout(&self) -> Option<Duration> {
        non_zero(self.dial_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn default_network() -> String {
    "tcp".to_string()
}

fn default_listen_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_body_codec() -> String {
    "json".to_string()
}

fn default_redial_interval() -> u64 {
    100
}

fn default_max_message_size() -> u32 {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_max_concurrent_handlers() -> usize {
    1024 * num_cpus::get()
}

fn default_shutdown_timeout() -> u64 {
    10000
}

fn default_log_level() -> String {
    "info".to_string()
}
