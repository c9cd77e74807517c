//! Adaptive CPU throttle controller
//!
//! Reacts to node CPU pressure events by stepping the CFS quota of
//! low-priority pods down, and back up when the pressure clears. A pod's
//! quota never drops below its protection watermark, derived from container
//! CPU requests. Only pods whose QoS level annotation is negative are
//! eligible; everything else is left alone.

use super::{ActivePods, AgentEvent, Handle, PressureResource, ThrottleAction};
use crate::cgroup::{
    CgroupManager, CgroupVersion, Subsystem, CPU_PERIOD_FILE, CPU_QUOTA_TOTAL_FILE,
    CPU_QUOTA_TOTAL_FILE_V2, UNLIMITED_TOKEN,
};
use crate::models::PodInfo;
use crate::resource::cgroupfs::write_tunable;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Smallest quota a throttled pod may hold, in microseconds. Keeps a pod
/// schedulable even when its watermark would otherwise compute to zero.
const MIN_QUOTA_FLOOR_US: i64 = 1_000;

/// Tuning surface for the stepwise throttle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Percentage of the current quota removed per throttle step
    pub throttle_step_percent: i64,
    /// Watermark fallback as a percentage of the original quota (or period)
    pub min_cpu_quota_percent: i64,
    /// Percentage of the original quota restored per recovery step
    pub recover_step_percent: i64,
    /// CFS period in microseconds
    pub cpu_period_us: i64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            throttle_step_percent: 10,
            min_cpu_quota_percent: 20,
            recover_step_percent: 15,
            cpu_period_us: 100_000,
        }
    }
}

/// Per-pod throttle state
#[derive(Debug, Clone, Copy)]
struct ThrottleRecord {
    original_quota: i64,
    current_quota: i64,
    active: bool,
}

pub struct CpuThrottleHandler {
    manager: CgroupManager,
    active_pods: Arc<dyn ActivePods>,
    config: ThrottleConfig,
    /// Throttle state keyed by pod UID; the lock is held across the whole
    /// per-pod iteration of one event, serializing steps per pod.
    records: RwLock<HashMap<String, ThrottleRecord>>,
}

impl CpuThrottleHandler {
    pub fn new(
        manager: CgroupManager,
        active_pods: Arc<dyn ActivePods>,
        config: ThrottleConfig,
    ) -> Self {
        Self {
            manager,
            active_pods,
            config,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of pods currently held below their original quota
    pub async fn throttled_pod_count(&self) -> usize {
        self.records.read().await.values().filter(|r| r.active).count()
    }

    fn quota_file(&self) -> &'static str {
        match self.manager.version() {
            CgroupVersion::V1 => CPU_QUOTA_TOTAL_FILE,
            CgroupVersion::V2 => CPU_QUOTA_TOTAL_FILE_V2,
        }
    }

    /// Current quota from the pod's cgroup; an unlimited or missing quota
    /// reads as the default derived from container CPU limits.
    async fn read_current_quota(&self, pod: &PodInfo) -> Result<i64> {
        let path = self
            .manager
            .pod_path(pod.qos_class, Subsystem::Cpu, &pod.uid)?
            .join(self.quota_file());

        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(self.default_quota(pod)),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", path.display()))
            }
        };

        let token = content.split_whitespace().next().unwrap_or_default();
        if token == "-1" || token == UNLIMITED_TOKEN {
            return Ok(self.default_quota(pod));
        }
        token
            .parse()
            .with_context(|| format!("unexpected quota {token:?} in {}", path.display()))
    }

    /// Quota assumed for an unlimited pod: the summed container CPU limits,
    /// or two full periods when no limit is set.
    fn default_quota(&self, pod: &PodInfo) -> i64 {
        let period = self.config.cpu_period_us;
        let from_limits: i64 = pod
            .containers
            .iter()
            .filter_map(|c| c.cpu_limit_millis)
            .map(|millis| millis * period / 1000)
            .sum();
        if from_limits > 0 {
            from_limits
        } else {
            2 * period
        }
    }

    /// Protection watermark: summed container CPU requests, falling back to
    /// a fraction of the original quota (or of the period), and never below
    /// the floor.
    fn min_quota(&self, pod: &PodInfo, original_quota: i64) -> i64 {
        let period = self.config.cpu_period_us;
        let mut min: i64 = pod
            .containers
            .iter()
            .filter_map(|c| c.cpu_request_millis)
            .map(|millis| millis * period / 1000)
            .sum();

        if min == 0 {
            min = if original_quota > 0 {
                original_quota * self.config.min_cpu_quota_percent / 100
            } else {
                period * self.config.min_cpu_quota_percent / 100
            };
        }
        min.max(MIN_QUOTA_FLOOR_US)
    }

    fn stepped_quota(&self, current: i64, min: i64) -> i64 {
        let new = current - current * self.config.throttle_step_percent / 100;
        new.max(min)
    }

    fn recovered_quota(&self, current: i64, original: i64) -> i64 {
        (current + original * self.config.recover_step_percent / 100).min(original)
    }

    async fn apply_quota(&self, pod: &PodInfo, quota: i64) -> Result<()> {
        let path = self
            .manager
            .pod_path(pod.qos_class, Subsystem::Cpu, &pod.uid)?;
        let period = self.config.cpu_period_us;

        match self.manager.version() {
            CgroupVersion::V1 => {
                write_tunable(&path.join(CPU_QUOTA_TOTAL_FILE), &quota.to_string()).await?;
                write_tunable(&path.join(CPU_PERIOD_FILE), &period.to_string()).await?;
            }
            CgroupVersion::V2 => {
                write_tunable(
                    &path.join(CPU_QUOTA_TOTAL_FILE_V2),
                    &format!("{quota} {period}"),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn step_throttle(&self, pods: &[PodInfo]) {
        let mut records = self.records.write().await;

        for pod in pods {
            if pod.qos_level() >= 0 {
                continue;
            }

            let current = match self.read_current_quota(pod).await {
                Ok(quota) => quota,
                Err(err) => {
                    warn!(pod = %pod.key(), error = %err, "Failed to read current CPU quota");
                    continue;
                }
            };

            // The first step snapshots the original quota for later recovery.
            let original = records
                .get(&pod.uid)
                .map(|r| r.original_quota)
                .unwrap_or(current);
            let min = self.min_quota(pod, original);
            let new_quota = self.stepped_quota(current, min);

            if new_quota == current {
                records.entry(pod.uid.clone()).or_insert(ThrottleRecord {
                    original_quota: original,
                    current_quota: current,
                    active: false,
                });
                continue;
            }

            if let Err(err) = self.apply_quota(pod, new_quota).await {
                warn!(pod = %pod.key(), quota = new_quota, error = %err, "Failed to apply CPU quota");
                continue;
            }

            let record = records.entry(pod.uid.clone()).or_insert(ThrottleRecord {
                original_quota: original,
                current_quota: current,
                active: false,
            });
            record.current_quota = new_quota;
            record.active = true;

            info!(
                pod = %pod.key(),
                original_quota = original,
                current_quota = current,
                new_quota,
                watermark = min,
                "Applied stepped CPU throttle"
            );
        }
    }

    async fn stop_throttle(&self, pods: &[PodInfo]) {
        let mut records = self.records.write().await;

        for pod in pods {
            if pod.qos_level() >= 0 {
                continue;
            }
            let Some(record) = records.get(&pod.uid).copied() else {
                continue;
            };
            if !record.active {
                continue;
            }

            let new_quota = self.recovered_quota(record.current_quota, record.original_quota);
            if let Err(err) = self.apply_quota(pod, new_quota).await {
                warn!(pod = %pod.key(), quota = new_quota, error = %err, "Failed to recover CPU quota");
                continue;
            }

            if new_quota >= record.original_quota {
                records.remove(&pod.uid);
                info!(pod = %pod.key(), quota = new_quota, "CPU quota fully restored");
            } else if let Some(record) = records.get_mut(&pod.uid) {
                record.current_quota = new_quota;
                info!(
                    pod = %pod.key(),
                    current_quota = record.current_quota,
                    original_quota = record.original_quota,
                    "Recovered CPU throttle step"
                );
            }
        }
    }
}

#[async_trait]
impl Handle for CpuThrottleHandler {
    fn name(&self) -> &str {
        "cpu-throttle"
    }

    async fn handle(&self, event: &AgentEvent) -> Result<()> {
        let AgentEvent::NodeCpuThrottle(throttle) = event else {
            anyhow::bail!("cpu-throttle handler received a non-throttle event");
        };
        if throttle.resource != PressureResource::Cpu {
            return Ok(());
        }

        let pods = self
            .active_pods
            .active_pods()
            .await
            .context("failed to list active pods")?;
        info!(
            action = ?throttle.action,
            usage = throttle.usage,
            pod_count = pods.len(),
            "Handling CPU throttle event"
        );

        match throttle.action {
            ThrottleAction::Start => self.step_throttle(&pods).await,
            ThrottleAction::Stop => self.stop_throttle(&pods).await,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::{CgroupDriver, RuntimeContext};
    use crate::events::testing;
    use crate::events::NodeCpuThrottleEvent;
    use crate::models::{ContainerSpec, QosClass};
    use std::path::Path;
    use tempfile::TempDir;

    struct StaticPods(Vec<PodInfo>);

    #[async_trait]
    impl ActivePods for StaticPods {
        async fn active_pods(&self) -> Result<Vec<PodInfo>> {
            Ok(self.0.clone())
        }
    }

    fn low_priority_pod(uid: &str, request_millis: Option<i64>, limit_millis: Option<i64>) -> PodInfo {
        let mut pod = testing::pod(uid, QosClass::Burstable, -1);
        pod.containers.push(ContainerSpec {
            name: "main".to_string(),
            id: "c1".to_string(),
            cpu_request_millis: request_millis,
            cpu_limit_millis: limit_millis,
            ..Default::default()
        });
        pod
    }

    fn throttle_handler(
        root: &Path,
        version: CgroupVersion,
        pods: Vec<PodInfo>,
    ) -> CpuThrottleHandler {
        let manager = CgroupManager::new(RuntimeContext {
            version,
            driver: CgroupDriver::Cgroupfs,
            cgroup_root: root.to_path_buf(),
            kube_cgroup_root: None,
        });
        CpuThrottleHandler::new(manager, Arc::new(StaticPods(pods)), ThrottleConfig::default())
    }

    async fn mock_pod_cgroup_v1(root: &Path, uid: &str, quota: &str) -> std::path::PathBuf {
        let dir = root.join(format!("cpu/kubepods/burstable/pod{uid}"));
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join(CPU_QUOTA_TOTAL_FILE), quota).await.unwrap();
        fs::write(dir.join(CPU_PERIOD_FILE), "100000").await.unwrap();
        dir
    }

    fn start_event() -> AgentEvent {
        AgentEvent::NodeCpuThrottle(NodeCpuThrottleEvent {
            resource: PressureResource::Cpu,
            action: ThrottleAction::Start,
            usage: 95.0,
        })
    }

    fn stop_event() -> AgentEvent {
        AgentEvent::NodeCpuThrottle(NodeCpuThrottleEvent {
            resource: PressureResource::Cpu,
            action: ThrottleAction::Stop,
            usage: 40.0,
        })
    }

    async fn read_quota(dir: &Path) -> String {
        fs::read_to_string(dir.join(CPU_QUOTA_TOTAL_FILE)).await.unwrap()
    }

    #[tokio::test]
    async fn test_step_reduces_quota_above_watermark() {
        let root = TempDir::new().unwrap();
        let dir = mock_pod_cgroup_v1(root.path(), "u1", "100000").await;

        // Request 200m: watermark = 200 * 100000 / 1000 = 20000.
        let pod = low_priority_pod("u1", Some(200), None);
        let handler = throttle_handler(root.path(), CgroupVersion::V1, vec![pod]);

        handler.handle(&start_event()).await.unwrap();

        assert_eq!(read_quota(&dir).await, "90000");
        assert_eq!(
            fs::read_to_string(dir.join(CPU_PERIOD_FILE)).await.unwrap(),
            "100000"
        );
        assert_eq!(handler.throttled_pod_count().await, 1);
    }

    #[tokio::test]
    async fn test_repeated_starts_are_monotone_and_floored_at_watermark() {
        let root = TempDir::new().unwrap();
        let dir = mock_pod_cgroup_v1(root.path(), "u2", "100000").await;

        let pod = low_priority_pod("u2", Some(200), None);
        let handler = throttle_handler(root.path(), CgroupVersion::V1, vec![pod]);

        let mut previous = 100_000i64;
        for _ in 0..30 {
            handler.handle(&start_event()).await.unwrap();
            let quota: i64 = read_quota(&dir).await.parse().unwrap();
            assert!(quota <= previous);
            assert!(quota >= 20_000);
            previous = quota;
        }
        assert_eq!(previous, 20_000);
    }

    #[tokio::test]
    async fn test_recovery_steps_up_and_deletes_record() {
        let root = TempDir::new().unwrap();
        let dir = mock_pod_cgroup_v1(root.path(), "u3", "100000").await;

        let pod = low_priority_pod("u3", Some(200), None);
        let handler = throttle_handler(root.path(), CgroupVersion::V1, vec![pod]);

        // Two starts: 100000 -> 90000 -> 81000.
        handler.handle(&start_event()).await.unwrap();
        handler.handle(&start_event()).await.unwrap();
        assert_eq!(read_quota(&dir).await, "81000");

        // Recovery adds 15% of the original per step, capped at the original.
        handler.handle(&stop_event()).await.unwrap();
        assert_eq!(read_quota(&dir).await, "96000");
        assert_eq!(handler.throttled_pod_count().await, 1);

        handler.handle(&stop_event()).await.unwrap();
        assert_eq!(read_quota(&dir).await, "100000");
        assert_eq!(handler.throttled_pod_count().await, 0);
    }

    #[tokio::test]
    async fn test_non_negative_qos_level_is_skipped() {
        let root = TempDir::new().unwrap();
        let dir = mock_pod_cgroup_v1(root.path(), "u4", "100000").await;

        let pod = {
            let mut p = testing::pod("u4", QosClass::Burstable, 0);
            p.containers.push(ContainerSpec {
                name: "main".to_string(),
                id: "c1".to_string(),
                cpu_request_millis: Some(100),
                ..Default::default()
            });
            p
        };
        let handler = throttle_handler(root.path(), CgroupVersion::V1, vec![pod]);

        handler.handle(&start_event()).await.unwrap();

        assert_eq!(read_quota(&dir).await, "100000");
        assert_eq!(handler.throttled_pod_count().await, 0);
    }

    #[tokio::test]
    async fn test_unlimited_quota_uses_container_limits_as_default() {
        let root = TempDir::new().unwrap();
        let dir = mock_pod_cgroup_v1(root.path(), "u5", "-1").await;

        // Limit 500m: default quota 50000; step lands at 45000.
        let pod = low_priority_pod("u5", Some(200), Some(500));
        let handler = throttle_handler(root.path(), CgroupVersion::V1, vec![pod]);

        handler.handle(&start_event()).await.unwrap();

        assert_eq!(read_quota(&dir).await, "45000");
    }

    #[tokio::test]
    async fn test_watermark_floor_prevents_zero_quota() {
        let root = TempDir::new().unwrap();
        let dir = mock_pod_cgroup_v1(root.path(), "u6", "1000").await;

        // No requests: fallback watermark is 20% of 1000 = 200, clamped to
        // the 1000 µs floor, so the step is a no-op.
        let pod = low_priority_pod("u6", None, None);
        let handler = throttle_handler(root.path(), CgroupVersion::V1, vec![pod]);

        handler.handle(&start_event()).await.unwrap();

        assert_eq!(read_quota(&dir).await, "1000");
        assert_eq!(handler.throttled_pod_count().await, 0);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_a_noop() {
        let root = TempDir::new().unwrap();
        let dir = mock_pod_cgroup_v1(root.path(), "u7", "70000").await;

        let pod = low_priority_pod("u7", Some(100), None);
        let handler = throttle_handler(root.path(), CgroupVersion::V1, vec![pod]);

        handler.handle(&stop_event()).await.unwrap();

        assert_eq!(read_quota(&dir).await, "70000");
    }

    #[tokio::test]
    async fn test_non_cpu_resource_is_ignored() {
        let root = TempDir::new().unwrap();
        let dir = mock_pod_cgroup_v1(root.path(), "u8", "100000").await;

        let pod = low_priority_pod("u8", Some(100), None);
        let handler = throttle_handler(root.path(), CgroupVersion::V1, vec![pod]);

        let event = AgentEvent::NodeCpuThrottle(NodeCpuThrottleEvent {
            resource: PressureResource::Memory,
            action: ThrottleAction::Start,
            usage: 95.0,
        });
        handler.handle(&event).await.unwrap();

        assert_eq!(read_quota(&dir).await, "100000");
    }

    #[tokio::test]
    async fn test_v2_writes_quota_and_period_together() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("kubepods/burstable/podu9");
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join(CPU_QUOTA_TOTAL_FILE_V2), "100000 100000")
            .await
            .unwrap();

        let pod = low_priority_pod("u9", Some(200), None);
        let handler = throttle_handler(root.path(), CgroupVersion::V2, vec![pod]);

        handler.handle(&start_event()).await.unwrap();

        assert_eq!(
            fs::read_to_string(dir.join(CPU_QUOTA_TOTAL_FILE_V2)).await.unwrap(),
            "90000 100000"
        );
    }
}
