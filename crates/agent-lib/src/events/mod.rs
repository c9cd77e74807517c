//! Event framework glue
//!
//! The external event source delivers pod lifecycle events and node pressure
//! events; this module defines those shapes, the handler contract, and a
//! dispatcher the composition root wires up explicitly at startup. Handlers
//! receive their dependencies as struct fields; there is no global registry.

pub mod cpu_burst;
pub mod cpu_qos;
pub mod cpu_throttle;
pub mod memory_qos;
pub mod resources;

use crate::models::{PodInfo, QosClass};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Event kinds handlers subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Pod,
    NodeCpuThrottle,
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventName::Pod => write!(f, "pod"),
            EventName::NodeCpuThrottle => write!(f, "node-cpu-throttle"),
        }
    }
}

/// Pod lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodEvent {
    pub pod: PodInfo,
    pub uid: String,
    pub qos_class: QosClass,
    pub qos_level: i64,
}

impl PodEvent {
    pub fn new(pod: PodInfo) -> Self {
        Self {
            uid: pod.uid.clone(),
            qos_class: pod.qos_class,
            qos_level: pod.qos_level(),
            pod,
        }
    }
}

/// Node resource a pressure event concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureResource {
    Cpu,
    Memory,
}

/// Direction of a throttle event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThrottleAction {
    Start,
    Stop,
}

/// Node-level CPU pressure event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCpuThrottleEvent {
    pub resource: PressureResource,
    pub action: ThrottleAction,
    /// Node CPU usage that triggered the event, in percent
    pub usage: f64,
}

/// Any event the dispatcher routes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentEvent {
    Pod(PodEvent),
    NodeCpuThrottle(NodeCpuThrottleEvent),
}

impl AgentEvent {
    pub fn name(&self) -> EventName {
        match self {
            AgentEvent::Pod(_) => EventName::Pod,
            AgentEvent::NodeCpuThrottle(_) => EventName::NodeCpuThrottle,
        }
    }
}

/// A feature handler invoked for the events it registered for
#[async_trait]
pub trait Handle: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &AgentEvent) -> Result<()>;
}

/// Supplies the pods currently active on the node
#[async_trait]
pub trait ActivePods: Send + Sync {
    async fn active_pods(&self) -> Result<Vec<PodInfo>>;
}

/// Fresh pod lookups by namespace and name
#[async_trait]
pub trait PodLister: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<PodInfo>;
}

/// Routes events to their subscribed handlers
///
/// A failing handler is logged and the remaining handlers still run; retries
/// are the event source's responsibility, not the dispatcher's.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<EventName, Vec<Arc<dyn Handle>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: EventName, handler: Arc<dyn Handle>) {
        debug!(event = %name, handler = handler.name(), "Registered event handler");
        self.handlers.entry(name).or_default().push(handler);
    }

    pub fn handler_count(&self, name: EventName) -> usize {
        self.handlers.get(&name).map_or(0, Vec::len)
    }

    pub async fn dispatch(&self, event: &AgentEvent) {
        let Some(handlers) = self.handlers.get(&event.name()) else {
            debug!(event = %event.name(), "No handlers registered for event");
            return;
        };

        for handler in handlers {
            if let Err(err) = handler.handle(event).await {
                warn!(
                    event = %event.name(),
                    handler = handler.name(),
                    error = %err,
                    "Event handler failed"
                );
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::resource::{ResourceError, ResourceHandler};
    use std::sync::Mutex;

    /// Resource handler that records every call it receives
    #[derive(Default)]
    pub(crate) struct RecordingResourceHandler {
        pub calls: Mutex<Vec<String>>,
        pub fail: bool,
    }

    impl RecordingResourceHandler {
        pub fn failing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn record(&self, call: String) -> Result<(), ResourceError> {
            self.calls.lock().unwrap().push(call);
            if self.fail {
                return Err(ResourceError::NotImplemented("mock failure".to_string()));
            }
            Ok(())
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ResourceHandler for RecordingResourceHandler {
        async fn set_cpu_qos_level(
            &self,
            pod_uid: &str,
            _qos_class: QosClass,
            qos_level: i64,
        ) -> Result<(), ResourceError> {
            self.record(format!("cpu_qos:{pod_uid}:{qos_level}"))
        }

        async fn set_memory_qos(
            &self,
            pod_uid: &str,
            _qos_class: QosClass,
            qos_level: i64,
        ) -> Result<(), ResourceError> {
            self.record(format!("memory_qos:{pod_uid}:{qos_level}"))
        }

        async fn set_cpu_burst(
            &self,
            _qos_class: QosClass,
            pod_uid: &str,
            burst_time_us: i64,
            _pod: &PodInfo,
        ) -> Result<(), ResourceError> {
            self.record(format!("cpu_burst:{pod_uid}:{burst_time_us}"))
        }

        async fn set_resource_limit(&self, pod: &PodInfo) -> Result<(), ResourceError> {
            self.record(format!("resource_limit:{}", pod.uid))
        }
    }

    pub(crate) fn pod(uid: &str, qos_class: QosClass, qos_level: i64) -> PodInfo {
        let mut annotations = HashMap::new();
        annotations.insert(
            crate::models::QOS_LEVEL_ANNOTATION.to_string(),
            qos_level.to_string(),
        );
        PodInfo {
            uid: uid.to_string(),
            name: format!("pod-{uid}"),
            namespace: "default".to_string(),
            qos_class,
            annotations,
            containers: vec![],
        }
    }
}
