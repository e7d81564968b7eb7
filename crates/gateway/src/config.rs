//! Environment configuration.

use crate::consumer::ConsumerConfig;
use crate::error::{GatewayError, Result};
use crate::session::QueueLimits;
use nats_client::{ProvisionPolicy, RetryPolicy};
use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// HTTP/WebSocket listen port.
    pub service_port: u16,
    /// Prometheus exporter port.
    pub metrics_port: u16,
    pub nats_url: String,
    pub nats_stream: String,
    /// Prefix for durable consumer names.
    pub nats_durable: String,
    /// Root of the JSON Schema contracts.
    pub contracts_path: PathBuf,
    pub client_queue_capacity: usize,
    pub overflow_notice_interval: Duration,
    pub heartbeat_interval: Duration,
    pub connect: RetryPolicy,
    pub ack_wait: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            service_port: 8080,
            metrics_port: 9095,
            nats_url: "nats://localhost:4222".to_string(),
            nats_stream: "events".to_string(),
            nats_durable: "realtime-gateway".to_string(),
            contracts_path: PathBuf::from("./contracts/schemas"),
            client_queue_capacity: 200,
            overflow_notice_interval: Duration::from_millis(3000),
            heartbeat_interval: Duration::from_secs(30),
            connect: RetryPolicy::default(),
            ack_wait: Duration::from_secs(30),
        }
    }
}

impl GatewayConfig {
    /// Read configuration from the process environment, after loading `.env`.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read configuration through `lookup`, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let string = |key: &str, default: String| lookup(key).unwrap_or(default);

        let config = Self {
            service_port: parse(&lookup, "SERVICE_PORT", defaults.service_port)?,
            metrics_port: parse(&lookup, "METRICS_PORT", defaults.metrics_port)?,
            nats_url: string("NATS_URL", defaults.nats_url),
            nats_stream: string("NATS_STREAM", defaults.nats_stream),
            nats_durable: string("NATS_DURABLE", defaults.nats_durable),
            contracts_path: lookup("CONTRACTS_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.contracts_path),
            client_queue_capacity: parse(
                &lookup,
                "CLIENT_QUEUE_CAPACITY",
                defaults.client_queue_capacity,
            )?,
            overflow_notice_interval: Duration::from_millis(parse(
                &lookup,
                "OVERFLOW_NOTICE_INTERVAL_MS",
                3000u64,
            )?),
            heartbeat_interval: Duration::from_secs(parse(
                &lookup,
                "HEARTBEAT_INTERVAL_SECS",
                30u64,
            )?),
            connect: RetryPolicy {
                max_attempts: parse(&lookup, "NATS_CONNECT_ATTEMPTS", 5u32)?,
                base_delay: Duration::from_millis(parse(
                    &lookup,
                    "NATS_CONNECT_BASE_DELAY_MS",
                    500u64,
                )?),
                attempt_timeout: Duration::from_millis(parse(
                    &lookup,
                    "NATS_CONNECT_TIMEOUT_MS",
                    5000u64,
                )?),
            },
            ack_wait: Duration::from_secs(parse(&lookup, "NATS_ACK_WAIT_SECS", 30u64)?),
        };

        if config.client_queue_capacity == 0 {
            return Err(GatewayError::Config(
                "CLIENT_QUEUE_CAPACITY must be at least 1".to_string(),
            ));
        }
        if config.heartbeat_interval.is_zero() {
            return Err(GatewayError::Config(
                "HEARTBEAT_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        if config.connect.max_attempts == 0 {
            return Err(GatewayError::Config(
                "NATS_CONNECT_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn queue_limits(&self) -> QueueLimits {
        QueueLimits {
            capacity: self.client_queue_capacity,
            notice_interval: self.overflow_notice_interval,
        }
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            nats_url: self.nats_url.clone(),
            client_name: self.nats_durable.clone(),
            stream: self.nats_stream.clone(),
            durable_base: self.nats_durable.clone(),
            ack_wait: self.ack_wait,
            connect: self.connect.clone(),
            provision: ProvisionPolicy::default(),
        }
    }

    pub fn log_summary(&self) {
        info!("Configuration:");
        info!("  SERVICE_PORT: {}", self.service_port);
        info!("  METRICS_PORT: {}", self.metrics_port);
        info!("  NATS_URL: {}", self.nats_url);
        info!("  NATS_STREAM: {}", self.nats_stream);
        info!("  NATS_DURABLE: {}", self.nats_durable);
        info!("  CONTRACTS_PATH: {}", self.contracts_path.display());
        info!("  CLIENT_QUEUE_CAPACITY: {}", self.client_queue_capacity);
        info!("  HEARTBEAT_INTERVAL: {:?}", self.heartbeat_interval);
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| GatewayError::Config(format!("{} must be a number: {}", key, e))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<GatewayConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        GatewayConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.service_port, 8080);
        assert_eq!(config.metrics_port, 9095);
        assert_eq!(config.nats_url, "nats://localhost:4222");
        assert_eq!(config.nats_stream, "events");
        assert_eq!(config.nats_durable, "realtime-gateway");
        assert_eq!(config.contracts_path, PathBuf::from("./contracts/schemas"));
        assert_eq!(config.client_queue_capacity, 200);
        assert_eq!(config.overflow_notice_interval, Duration::from_secs(3));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.connect.max_attempts, 5);
        assert_eq!(config.connect.base_delay, Duration::from_millis(500));
        assert_eq!(config.connect.attempt_timeout, Duration::from_secs(5));
        assert_eq!(config.ack_wait, Duration::from_secs(30));
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("SERVICE_PORT", "9000"),
            ("NATS_URL", "nats://broker:4222"),
            ("NATS_DURABLE", "gw-test"),
            ("CONTRACTS_PATH", "/srv/contracts"),
            ("CLIENT_QUEUE_CAPACITY", " 50 "),
            ("OVERFLOW_NOTICE_INTERVAL_MS", "1000"),
        ])
        .unwrap();

        assert_eq!(config.service_port, 9000);
        assert_eq!(config.nats_url, "nats://broker:4222");
        assert_eq!(config.contracts_path, PathBuf::from("/srv/contracts"));

        let limits = config.queue_limits();
        assert_eq!(limits.capacity, 50);
        assert_eq!(limits.notice_interval, Duration::from_secs(1));

        let consumer = config.consumer_config();
        assert_eq!(consumer.durable_base, "gw-test");
        assert_eq!(consumer.stream, "events");
    }

    #[test]
    fn test_invalid_number_is_config_error() {
        let err = config_from(&[("SERVICE_PORT", "eighty")]).unwrap_err();
        match err {
            GatewayError::Config(msg) => assert!(msg.starts_with("SERVICE_PORT")),
            other => panic!("unexpected {:?}", other),
        }

        assert!(config_from(&[("SERVICE_PORT", "70000")]).is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            config_from(&[("CLIENT_QUEUE_CAPACITY", "0")]),
            Err(GatewayError::Config(_))
        ));
        assert!(matches!(
            config_from(&[("HEARTBEAT_INTERVAL_SECS", "0")]),
            Err(GatewayError::Config(_))
        ));
    }
}
