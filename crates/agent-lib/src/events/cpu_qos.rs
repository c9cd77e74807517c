//! CPU QoS level enforcement on pod events

use super::{AgentEvent, Handle};
use crate::resource::ResourceHandler;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct CpuQosHandler {
    resource_handler: Arc<dyn ResourceHandler>,
}

impl CpuQosHandler {
    pub fn new(resource_handler: Arc<dyn ResourceHandler>) -> Self {
        Self { resource_handler }
    }
}

#[async_trait]
impl Handle for CpuQosHandler {
    fn name(&self) -> &str {
        "cpu-qos"
    }

    async fn handle(&self, event: &AgentEvent) -> Result<()> {
        let AgentEvent::Pod(pod_event) = event else {
            anyhow::bail!("cpu-qos handler received a non-pod event");
        };

        self.resource_handler
            .set_cpu_qos_level(&pod_event.uid, pod_event.qos_class, pod_event.qos_level)
            .await?;
        info!(
            pod = %pod_event.pod.key(),
            qos_level = pod_event.qos_level,
            "Applied CPU QoS level"
        );
        Ok(())
    }
}
