//! Agent configuration

use anyhow::{bail, Result};
use config::{Environment, File, FileFormat};
use metrics_lib::api::{normalize_metrics_path, DEFAULT_METRICS_PATH};
use metrics_lib::collector::{
    DEFAULT_COLLECTION_INTERVAL, DEFAULT_POD_RESOURCES_SOCKET, DUTY_CYCLE_WINDOW,
    METRICS_RESET_INTERVAL,
};
use metrics_lib::server::DEFAULT_METRICS_PORT;
use metrics_lib::{ServerConfig, GPU_RESOURCE_NAME};
use serde::Deserialize;
use std::time::Duration;

/// Environment variable holding the optional config file path
pub const CONFIG_PATH_ENV: &str = "GPU_METRICS_CONFIG";

const ENV_PREFIX: &str = "GPU_METRICS";

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Port the metrics and health endpoints listen on
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,

    /// Metrics collection interval in milliseconds
    #[serde(default = "default_collection_interval")]
    pub collection_interval_ms: u64,

    /// Seconds between full resets of the published gauges
    #[serde(default = "default_reset_interval")]
    pub reset_interval_secs: u64,

    /// Trailing window the duty cycle is averaged over
    #[serde(default = "default_duty_cycle_window")]
    pub duty_cycle_window_secs: u64,

    /// Per-device query timeout; unset means queries are never cut short
    #[serde(default)]
    pub device_query_timeout_ms: Option<u64>,

    #[serde(default = "default_pod_resources_socket")]
    pub pod_resources_socket: String,

    /// Extended resource name GPUs are requested under
    #[serde(default = "default_resource_name")]
    pub resource_name: String,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}

fn default_metrics_path() -> String {
    DEFAULT_METRICS_PATH.to_string()
}

fn default_collection_interval() -> u64 {
    DEFAULT_COLLECTION_INTERVAL.as_millis() as u64
}

fn default_reset_interval() -> u64 {
    METRICS_RESET_INTERVAL.as_secs()
}

fn default_duty_cycle_window() -> u64 {
    DUTY_CYCLE_WINDOW.as_secs()
}

fn default_pod_resources_socket() -> String {
    DEFAULT_POD_RESOURCES_SOCKET.to_string()
}

fn default_resource_name() -> String {
    GPU_RESOURCE_NAME.to_string()
}

impl AgentConfig {
    /// Load configuration from the optional config file and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok();
        Self::load_from(path.as_deref(), Environment::with_prefix(ENV_PREFIX))
    }

    fn load_from(path: Option<&str>, env: Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Toml).required(false));
        }

        let config: AgentConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.collection_interval_ms == 0 {
            bail!("collection_interval_ms must be greater than zero");
        }
        if self.reset_interval_secs == 0 {
            bail!("reset_interval_secs must be greater than zero");
        }
        if self.metrics_path.is_empty() {
            bail!("metrics_path must not be empty");
        }
        normalize_metrics_path(&self.metrics_path)?;
        Ok(())
    }

    /// Settings for the metric server
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            collection_interval: Duration::from_millis(self.collection_interval_ms),
            port: self.metrics_port,
            metrics_path: self.metrics_path.clone(),
            reset_interval: Duration::from_secs(self.reset_interval_secs),
            duty_cycle_window: Duration::from_secs(self.duty_cycle_window_secs),
            device_query_timeout: self.device_query_timeout_ms.map(Duration::from_millis),
            resource_name: self.resource_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(source))
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::load_from(None, env(&[])).unwrap();

        assert_eq!(config.metrics_port, 2112);
        assert_eq!(config.metrics_path, "/metrics");
        assert_eq!(config.collection_interval_ms, 30_000);
        assert_eq!(config.device_query_timeout_ms, None);
        assert_eq!(config.resource_name, "nvidia.com/gpu");
        assert_eq!(
            config.pod_resources_socket,
            "/var/lib/kubelet/pod-resources/kubelet.sock"
        );
    }

    #[test]
    fn test_defaults_match_server_defaults() {
        let server = AgentConfig::load_from(None, env(&[])).unwrap().server_config();
        let expected = ServerConfig::default();

        assert_eq!(server.port, expected.port);
        assert_eq!(server.metrics_path, expected.metrics_path);
        assert_eq!(server.collection_interval, expected.collection_interval);
        assert_eq!(server.reset_interval, expected.reset_interval);
        assert_eq!(server.duty_cycle_window, expected.duty_cycle_window);
        assert_eq!(server.device_query_timeout, expected.device_query_timeout);
        assert_eq!(server.resource_name, expected.resource_name);
    }

    #[test]
    fn test_environment_overrides() {
        let config = AgentConfig::load_from(
            None,
            env(&[
                ("GPU_METRICS_METRICS_PORT", "9400"),
                ("GPU_METRICS_COLLECTION_INTERVAL_MS", "5000"),
                ("GPU_METRICS_DEVICE_QUERY_TIMEOUT_MS", "2500"),
            ]),
        )
        .unwrap();

        assert_eq!(config.metrics_port, 9400);

        let server = config.server_config();
        assert_eq!(server.collection_interval, Duration::from_secs(5));
        assert_eq!(server.device_query_timeout, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_file_is_overlaid_by_environment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "node_name = \"gpu-node-1\"\nmetrics_path = \"/gpu\"\nmetrics_port = 9000"
        )
        .unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = AgentConfig::load_from(
            Some(&path),
            env(&[("GPU_METRICS_METRICS_PORT", "9100")]),
        )
        .unwrap();

        assert_eq!(config.node_name, "gpu-node-1");
        assert_eq!(config.metrics_path, "/gpu");
        assert_eq!(config.metrics_port, 9100);
    }

    #[test]
    fn test_missing_file_is_ignored() {
        let config =
            AgentConfig::load_from(Some("/nonexistent/gpu-metrics.toml"), env(&[])).unwrap();

        assert_eq!(config.metrics_port, 2112);
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let result = AgentConfig::load_from(
            None,
            env(&[("GPU_METRICS_COLLECTION_INTERVAL_MS", "0")]),
        );

        assert!(result.is_err());
    }

    #[test]
    fn test_metrics_path_colliding_with_health_endpoint_is_rejected() {
        for path in ["/healthz", "readyz", "/metrics/:node"] {
            let result =
                AgentConfig::load_from(None, env(&[("GPU_METRICS_METRICS_PATH", path)]));

            assert!(result.is_err(), "{} should be rejected", path);
        }
    }
}
