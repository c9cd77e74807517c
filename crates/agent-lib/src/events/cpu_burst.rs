//! CPU burst reconciliation on pod events
//!
//! Burst is opt-in per pod via annotations. The pod is re-fetched through
//! the lister so annotation edits made after the event was queued still take
//! effect.

use super::{AgentEvent, Handle, PodLister};
use crate::models::{CPU_BURST_ENABLED_ANNOTATION, CPU_BURST_TIME_ANNOTATION, PodInfo};
use crate::resource::ResourceHandler;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

pub struct CpuBurstHandler {
    resource_handler: Arc<dyn ResourceHandler>,
    pod_lister: Arc<dyn PodLister>,
}

impl CpuBurstHandler {
    pub fn new(resource_handler: Arc<dyn ResourceHandler>, pod_lister: Arc<dyn PodLister>) -> Self {
        Self {
            resource_handler,
            pod_lister,
        }
    }
}

/// Burst time requested by the pod, in microseconds; 0 means "use each
/// container's quota"
fn burst_time_us(pod: &PodInfo) -> i64 {
    let Some(raw) = pod.annotations.get(CPU_BURST_TIME_ANNOTATION) else {
        return 0;
    };
    match raw.parse::<i64>() {
        Ok(value) if value > 0 => value,
        _ => {
            warn!(pod = %pod.key(), value = %raw, "Invalid CPU burst time annotation, using container quotas");
            0
        }
    }
}

fn burst_enabled(pod: &PodInfo) -> bool {
    pod.annotations
        .get(CPU_BURST_ENABLED_ANNOTATION)
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false)
}

#[async_trait]
impl Handle for CpuBurstHandler {
    fn name(&self) -> &str {
        "cpu-burst"
    }

    async fn handle(&self, event: &AgentEvent) -> Result<()> {
        let AgentEvent::Pod(pod_event) = event else {
            anyhow::bail!("cpu-burst handler received a non-pod event");
        };

        let pod = match self
            .pod_lister
            .get(&pod_event.pod.namespace, &pod_event.pod.name)
            .await
        {
            Ok(fresh) => fresh,
            Err(err) => {
                warn!(pod = %pod_event.pod.key(), error = %err, "Failed to refresh pod from lister");
                pod_event.pod.clone()
            }
        };

        if !burst_enabled(&pod) {
            return Ok(());
        }

        self.resource_handler
            .set_cpu_burst(pod_event.qos_class, &pod_event.uid, burst_time_us(&pod), &pod)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::{pod, RecordingResourceHandler};
    use crate::events::PodEvent;
    use crate::models::QosClass;

    struct StaticLister {
        pod: Option<PodInfo>,
    }

    #[async_trait]
    impl PodLister for StaticLister {
        async fn get(&self, _namespace: &str, _name: &str) -> Result<PodInfo> {
            self.pod.clone().ok_or_else(|| anyhow::anyhow!("not found"))
        }
    }

    fn annotated_pod(uid: &str, enabled: &str, time: Option<&str>) -> PodInfo {
        let mut p = pod(uid, QosClass::Burstable, 0);
        p.annotations
            .insert(CPU_BURST_ENABLED_ANNOTATION.to_string(), enabled.to_string());
        if let Some(time) = time {
            p.annotations
                .insert(CPU_BURST_TIME_ANNOTATION.to_string(), time.to_string());
        }
        p
    }

    #[tokio::test]
    async fn test_burst_applied_with_annotation_time() {
        let recorder = Arc::new(RecordingResourceHandler::default());
        let fresh = annotated_pod("u1", "true", Some("30000"));
        let handler = CpuBurstHandler::new(
            recorder.clone(),
            Arc::new(StaticLister { pod: Some(fresh) }),
        );

        let event = AgentEvent::Pod(PodEvent::new(pod("u1", QosClass::Burstable, 0)));
        handler.handle(&event).await.unwrap();

        assert_eq!(recorder.calls(), vec!["cpu_burst:u1:30000"]);
    }

    #[tokio::test]
    async fn test_burst_skipped_without_enable_annotation() {
        let recorder = Arc::new(RecordingResourceHandler::default());
        let fresh = pod("u1", QosClass::Burstable, 0);
        let handler = CpuBurstHandler::new(
            recorder.clone(),
            Arc::new(StaticLister { pod: Some(fresh) }),
        );

        let event = AgentEvent::Pod(PodEvent::new(pod("u1", QosClass::Burstable, 0)));
        handler.handle(&event).await.unwrap();

        assert!(recorder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_burst_time_falls_back_to_quota() {
        let recorder = Arc::new(RecordingResourceHandler::default());
        let fresh = annotated_pod("u1", "true", Some("-5"));
        let handler = CpuBurstHandler::new(
            recorder.clone(),
            Arc::new(StaticLister { pod: Some(fresh) }),
        );

        let event = AgentEvent::Pod(PodEvent::new(pod("u1", QosClass::Burstable, 0)));
        handler.handle(&event).await.unwrap();

        assert_eq!(recorder.calls(), vec!["cpu_burst:u1:0"]);
    }

    #[tokio::test]
    async fn test_lister_failure_uses_event_pod() {
        let recorder = Arc::new(RecordingResourceHandler::default());
        let handler =
            CpuBurstHandler::new(recorder.clone(), Arc::new(StaticLister { pod: None }));

        let event_pod = annotated_pod("u1", "true", Some("10000"));
        let event = AgentEvent::Pod(PodEvent::new(event_pod));
        handler.handle(&event).await.unwrap();

        assert_eq!(recorder.calls(), vec!["cpu_burst:u1:10000"]);
    }
}
