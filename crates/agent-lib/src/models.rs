//! Core data models for the QoS enforcement agent

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Annotation carrying the agent-specific QoS level (-1, 0, 1, 2)
pub const QOS_LEVEL_ANNOTATION: &str = "qos-agent.io/qos-level";

/// Annotation enabling CPU burst for a pod ("true"/"false")
pub const CPU_BURST_ENABLED_ANNOTATION: &str = "qos-agent.io/cpu-burst-enabled";

/// Annotation carrying the requested CPU burst time in microseconds
pub const CPU_BURST_TIME_ANNOTATION: &str = "qos-agent.io/cpu-burst-time-us";

/// Orchestrator-assigned pod QoS class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
}

/// Per-container resource spec as delivered by the event source
///
/// `id` is the container runtime ID, which doubles as the name of the
/// container's cgroup directory under the pod cgroup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub id: String,
    /// CPU request in millicores
    pub cpu_request_millis: Option<i64>,
    /// CPU limit in millicores
    pub cpu_limit_millis: Option<i64>,
    /// Extended (oversold) CPU allocation in millicores
    pub batch_cpu_millis: Option<i64>,
    /// Extended (oversold) memory allocation in bytes
    pub batch_memory_bytes: Option<i64>,
}

/// Pod identity and spec subset the enforcement pipeline needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodInfo {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub qos_class: QosClass,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
}

impl PodInfo {
    /// QoS level carried on the pod annotation; absent or unparsable means 0
    pub fn qos_level(&self) -> i64 {
        self.annotations
            .get(QOS_LEVEL_ANNOTATION)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// `namespace/name` key for structured logs
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}
