use crate::errors::{Error, Result};
use crate::model::CustomerId;
use clap::Parser;
use std::time::Duration;

/// rover-hub: connection hub and state registry for remote rovers
#[derive(Parser, Debug, Clone)]
#[command(name = "rover-hub")]
#[command(about = "Accept rover connections and serve their live state", long_about = None)]
pub struct Config {
    /// Address the WebSocket and REST server listens on
    #[arg(long, env = "HTTP_ADDR", default_value = "0.0.0.0:5000")]
    pub http_addr: String,

    /// Postgres URL for the rover store; an in-memory store is used when unset
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,

    /// Customer assigned to rovers whose CONNECT carries none
    #[arg(long, env = "DEFAULT_CUSTOMER_ID", default_value_t = 1)]
    pub default_customer_id: CustomerId,

    /// How long a new connection may wait before sending CONNECT
    #[arg(long, env = "CONNECT_TIMEOUT_MS", default_value_t = 10_000)]
    pub connect_timeout_ms: u64,

    /// Close a bound connection after this long without any frame
    #[arg(long, env = "IDLE_TIMEOUT_MS", default_value_t = 60_000)]
    pub idle_timeout_ms: u64,

    #[arg(long, env = "PING_INTERVAL_MS", default_value_t = 15_000)]
    pub ping_interval_ms: u64,

    /// Rovers silent for longer than this are marked OFFLINE
    #[arg(long, env = "OFFLINE_THRESHOLD_MS", default_value_t = 30_000)]
    pub offline_threshold_ms: u64,

    #[arg(long, env = "MONITOR_PERIOD_MS", default_value_t = 5_000)]
    pub monitor_period_ms: u64,

    /// Consecutive undecodable frames before a rover is put in ERROR
    #[arg(long, env = "MAX_DECODE_FAILURES", default_value_t = 3)]
    pub max_decode_failures: u32,

    #[arg(long, env = "PERSIST_BATCH", default_value_t = 500)]
    pub persist_batch: usize,

    #[arg(long, env = "PERSIST_WAIT_MS", default_value_t = 250)]
    pub persist_wait_ms: u64,

    #[arg(long, env = "CHANNEL_CAPACITY", default_value_t = 10_000)]
    pub channel_capacity: usize,
}

/// Per-connection settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub default_customer_id: CustomerId,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    pub max_decode_failures: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_customer_id: 1,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(15),
            max_decode_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub period: Duration,
    pub offline_threshold: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            offline_threshold: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("idle_timeout_ms", self.idle_timeout_ms),
            ("ping_interval_ms", self.ping_interval_ms),
            ("offline_threshold_ms", self.offline_threshold_ms),
            ("monitor_period_ms", self.monitor_period_ms),
            ("persist_wait_ms", self.persist_wait_ms),
            ("persist_batch", self.persist_batch as u64),
            ("channel_capacity", self.channel_capacity as u64),
            ("max_decode_failures", u64::from(self.max_decode_failures)),
        ];

        for (name, value) in non_zero {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }

        if self.monitor_period_ms > self.offline_threshold_ms {
            return Err(Error::Config(format!(
                "monitor_period_ms ({}) must not exceed offline_threshold_ms ({})",
                self.monitor_period_ms, self.offline_threshold_ms
            )));
        }

        Ok(())
    }

    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            default_customer_id: self.default_customer_id,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            ping_interval: Duration::from_millis(self.ping_interval_ms),
            max_decode_failures: self.max_decode_failures,
        }
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            period: Duration::from_millis(self.monitor_period_ms),
            offline_threshold: Duration::from_millis(self.offline_threshold_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::try_parse_from(["rover-hub"]).unwrap();
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(config.offline_threshold_ms, 30_000);
        assert_eq!(config.max_decode_failures, 3);
        assert_eq!(config.default_customer_id, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_override_threshold() {
        let config = Config::try_parse_from([
            "rover-hub",
            "--offline-threshold-ms",
            "90000",
            "--monitor-period-ms",
            "1000",
        ])
        .unwrap();

        let monitor = config.monitor();
        assert_eq!(monitor.offline_threshold, Duration::from_secs(90));
        assert_eq!(monitor.period, Duration::from_secs(1));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = Config::try_parse_from(["rover-hub", "--connect-timeout-ms", "0"]).unwrap();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_period_longer_than_threshold_rejected() {
        let config = Config::try_parse_from([
            "rover-hub",
            "--offline-threshold-ms",
            "1000",
            "--monitor-period-ms",
            "5000",
        ])
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_config_from_flags() {
        let config = Config::try_parse_from(["rover-hub", "--default-customer-id", "9"]).unwrap();
        let session = config.session();
        assert_eq!(session.default_customer_id, 9);
        assert_eq!(session.connect_timeout, Duration::from_secs(10));
    }
}
