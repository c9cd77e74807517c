//! Extended resource limit enforcement on pod events

use super::{AgentEvent, Handle};
use crate::resource::ResourceHandler;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Highest QoS level allowed to use extended (oversold) resources
const MAX_EXT_RESOURCE_QOS_LEVEL: i64 = 1;

pub struct ResourcesHandler {
    resource_handler: Arc<dyn ResourceHandler>,
}

impl ResourcesHandler {
    pub fn new(resource_handler: Arc<dyn ResourceHandler>) -> Self {
        Self { resource_handler }
    }
}

#[async_trait]
impl Handle for ResourcesHandler {
    fn name(&self) -> &str {
        "resources"
    }

    async fn handle(&self, event: &AgentEvent) -> Result<()> {
        let AgentEvent::Pod(pod_event) = event else {
            anyhow::bail!("resources handler received a non-pod event");
        };

        if pod_event.qos_level > MAX_EXT_RESOURCE_QOS_LEVEL {
            debug!(
                pod = %pod_event.pod.key(),
                qos_level = pod_event.qos_level,
                "QoS level not eligible for extended resources"
            );
            return Ok(());
        }

        self.resource_handler.set_resource_limit(&pod_event.pod).await?;
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
    async fn test_eligible_levels_set_resource_limits() {
        let recorder = Arc::new(RecordingResourceHandler::default());
        let handler = ResourcesHandler::new(recorder.clone());

        for (uid, level) in [("u1", 1), ("u2", 0), ("u3", -1)] {
            let event = AgentEvent::Pod(PodEvent::new(pod(uid, QosClass::Burstable, level)));
            handler.handle(&event).await.unwrap();
        }

        assert_eq!(
            recorder.calls(),
            vec!["resource_limit:u1", "resource_limit:u2", "resource_limit:u3"]
        );
    }

    #[tokio::test]
    async fn test_high_qos_level_is_skipped() {
        let recorder = Arc::new(RecordingResourceHandler::default());
        let handler = ResourcesHandler::new(recorder.clone());

        let event = AgentEvent::Pod(PodEvent::new(pod("u4", QosClass::Guaranteed, 2)));
        handler.handle(&event).await.unwrap();

        assert!(recorder.calls().is_empty());
    }
}
