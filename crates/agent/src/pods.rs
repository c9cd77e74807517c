//! Pod registry fed by the event stream
//!
//! Pod events carry full pod specs; recording them gives the agent an
//! in-memory view of the node's active pods, which backs the active-pod
//! provider and lister the event handlers consume.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use qos_agent_lib::events::{ActivePods, PodLister};
use qos_agent_lib::models::PodInfo;
use tracing::debug;

/// Registry of pods observed on this node, keyed by pod UID
#[derive(Default)]
pub struct PodRegistry {
    pods: DashMap<String, PodInfo>,
}

impl PodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record or refresh a pod
    pub fn record(&self, pod: &PodInfo) {
        debug!(pod = %pod.key(), uid = %pod.uid, "Recording pod");
        self.pods.insert(pod.uid.clone(), pod.clone());
    }

    /// Drop a pod by UID
    pub fn remove(&self, uid: &str) -> Option<PodInfo> {
        self.pods.remove(uid).map(|(_, pod)| pod)
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}

#[async_trait]
impl ActivePods for PodRegistry {
    async fn active_pods(&self) -> Result<Vec<PodInfo>> {
        Ok(self.pods.iter().map(|entry| entry.value().clone()).collect())
    }
}

#[async_trait]
impl PodLister for PodRegistry {
    async fn get(&self, namespace: &str, name: &str) -> Result<PodInfo> {
        self.pods
            .iter()
            .find(|entry| {
                let pod = entry.value();
                pod.namespace == namespace && pod.name == name
            })
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("pod {namespace}/{name} not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qos_agent_lib::models::QosClass;
    use std::collections::HashMap;

    fn pod(uid: &str, name: &str) -> PodInfo {
        PodInfo {
            uid: uid.to_string(),
            name: name.to_string(),
            namespace: "default".to_string(),
            qos_class: QosClass::Burstable,
            annotations: HashMap::new(),
            containers: vec![],
        }
    }

    #[tokio::test]
    async fn test_record_and_list() {
        let registry = PodRegistry::new();
        registry.record(&pod("u1", "a"));
        registry.record(&pod("u2", "b"));

        let pods = registry.active_pods().await.unwrap();
        assert_eq!(pods.len(), 2);

        registry.remove("u1");
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_lister_finds_by_namespace_and_name() {
        let registry = PodRegistry::new();
        registry.record(&pod("u1", "a"));

        let found = registry.get("default", "a").await.unwrap();
        assert_eq!(found.uid, "u1");

        assert!(registry.get("default", "missing").await.is_err());
        assert!(registry.get("other", "a").await.is_err());
    }

    #[tokio::test]
    async fn test_record_refreshes_existing_pod() {
        let registry = PodRegistry::new();
        registry.record(&pod("u1", "a"));

        let mut updated = pod("u1", "a");
        updated
            .annotations
            .insert("qos-agent.io/qos-level".to_string(), "-1".to_string());
        registry.record(&updated);

        assert_eq!(registry.len(), 1);
        let found = registry.get("default", "a").await.unwrap();
        assert_eq!(found.qos_level(), -1);
    }
}
