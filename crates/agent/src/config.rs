//! Agent configuration

use anyhow::Result;
use qos_agent_lib::cgroup::{CgroupDriver, DEFAULT_CGROUP_ROOT};
use qos_agent_lib::events::cpu_throttle::ThrottleConfig;
use qos_agent_lib::resource::MemoryQosTable;
use serde::Deserialize;

/// Agent configuration, loaded from `AGENT_`-prefixed environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Node name from the downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// Port for the health and metrics HTTP server
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Unix socket the event source publishes into
    #[serde(default = "default_event_socket")]
    pub event_socket: String,

    /// Mount point of the cgroup hierarchy
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: String,

    /// Extra root segment matching the kubelet `cgroup-root` flag
    #[serde(default)]
    pub kube_cgroup_root: Option<String>,

    /// Explicit cgroup driver; unset means detect
    #[serde(default)]
    pub cgroup_driver: Option<String>,

    /// CPU throttle tuning
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Memory QoS byte table override
    #[serde(default)]
    pub memory_qos: MemoryQosTable,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_event_socket() -> String {
    "/run/qos-agent/events.sock".to_string()
}

fn default_cgroup_root() -> String {
    DEFAULT_CGROUP_ROOT.to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: default_api_port(),
            event_socket: default_event_socket(),
            cgroup_root: default_cgroup_root(),
            kube_cgroup_root: None,
            cgroup_driver: None,
            throttle: ThrottleConfig::default(),
            memory_qos: MemoryQosTable::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("AGENT").separator("__"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }

    /// Parsed driver override, if configured
    pub fn driver_override(&self) -> Option<CgroupDriver> {
        self.cgroup_driver.as_deref().and_then(CgroupDriver::parse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.cgroup_root, "/sys/fs/cgroup");
        assert_eq!(config.driver_override(), None);
        assert_eq!(config.throttle, ThrottleConfig::default());
    }

    #[test]
    fn test_driver_override_parsing() {
        let config = AgentConfig {
            cgroup_driver: Some("systemd".to_string()),
            ..Default::default()
        };
        assert_eq!(config.driver_override(), Some(CgroupDriver::Systemd));

        let config = AgentConfig {
            cgroup_driver: Some("exotic".to_string()),
            ..Default::default()
        };
        assert_eq!(config.driver_override(), None);
    }
}
