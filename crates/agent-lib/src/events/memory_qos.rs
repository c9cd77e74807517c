//! Memory QoS level enforcement on pod events

use super::{AgentEvent, Handle};
use crate::resource::ResourceHandler;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct MemoryQosHandler {
    resource_handler: Arc<dyn ResourceHandler>,
}

impl MemoryQosHandler {
    pub fn new(resource_handler: Arc<dyn ResourceHandler>) -> Self {
        Self { resource_handler }
    }
}

#[async_trait]
impl Handle for MemoryQosHandler {
    fn name(&self) -> &str {
        "memory-qos"
    }

    async fn handle(&self, event: &AgentEvent) -> Result<()> {
        let AgentEvent::Pod(pod_event) = event else {
            anyhow::bail!("memory-qos handler received a non-pod event");
        };

        self.resource_handler
            .set_memory_qos(&pod_event.uid, pod_event.qos_class, pod_event.qos_level)
            .await?;
        info!(
            pod = %pod_event.pod.key(),
            qos_level = pod_event.qos_level,
            "Applied memory QoS level"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::{pod, RecordingResourceHandler};
    use crate::events::PodEvent;
    use crate::models::QosClass;

    #[tokio::test]
    async fn test_pod_event_sets_memory_qos() {
        let recorder = Arc::new(RecordingResourceHandler::default());
        let handler = MemoryQosHandler::new(recorder.clone());

        let event = AgentEvent::Pod(PodEvent::new(pod("u2", QosClass::Guaranteed, 2)));
        handler.handle(&event).await.unwrap();

        assert_eq!(recorder.calls(), vec!["memory_qos:u2:2"]);
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces() {
        let recorder = Arc::new(RecordingResourceHandler::failing());
        let handler = MemoryQosHandler::new(recorder.clone());

        let event = AgentEvent::Pod(PodEvent::new(pod("u2", QosClass::Guaranteed, 2)));
        assert!(handler.handle(&event).await.is_err());
    }
}
