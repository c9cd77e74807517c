//! Direct-write cgroupfs backend
//!
//! Programs pod and container cgroups by writing their tunable files. The
//! kubelet owns the directories; this handler only touches file contents.
//! Tunables a kernel does not provide are logged and skipped, never failed.

use super::values::{
    cpu_quota_for_level, cpu_weight_for_level, normalize_memory_qos_level, MemoryQosTable,
    CPU_PERIOD_US,
};
use super::{aggregate, ResourceError, ResourceHandler};
use crate::cgroup::{
    CgroupManager, CgroupVersion, Subsystem, CPU_IDLE_FILE_V2, CPU_QOS_LEVEL_FILE,
    CPU_QUOTA_BURST_FILE, CPU_QUOTA_BURST_FILE_V2, CPU_QUOTA_TOTAL_FILE, CPU_QUOTA_TOTAL_FILE_V2,
    CPU_WEIGHT_FILE_V2, MEMORY_HIGH_FILE_V2, MEMORY_LIMIT_FILE, MEMORY_LIMIT_FILE_V2,
    MEMORY_LOW_FILE_V2, MEMORY_MIN_FILE_V2, MEMORY_QOS_LEVEL_FILE, UNLIMITED_QUOTA,
    UNLIMITED_TOKEN,
};
use crate::models::{PodInfo, QosClass};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Overwrite a tunable in place. The file is never created: on cgroupfs a
/// missing file means the kernel lacks the feature, which is tolerated.
pub(crate) async fn write_tunable(path: &Path, value: &str) -> Result<(), ResourceError> {
    let mut file = match fs::OpenOptions::new().write(true).truncate(true).open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "Cgroup file not present, skipping");
            return Ok(());
        }
        Err(err) => return Err(ResourceError::io(path, err)),
    };
    file.write_all(value.as_bytes())
        .await
        .map_err(|err| ResourceError::io(path, err))?;
    debug!(path = %path.display(), value, "Wrote cgroup tunable");
    Ok(())
}

/// Backend writing cgroup tunables through the filesystem
pub struct CgroupfsHandler {
    manager: CgroupManager,
    memory_table: MemoryQosTable,
}

impl CgroupfsHandler {
    pub fn new(manager: CgroupManager) -> Self {
        Self::with_memory_table(manager, MemoryQosTable::default())
    }

    pub fn with_memory_table(manager: CgroupManager, memory_table: MemoryQosTable) -> Self {
        Self {
            manager,
            memory_table,
        }
    }

    pub fn manager(&self) -> &CgroupManager {
        &self.manager
    }

    async fn write_tunable(&self, path: &Path, value: &str) -> Result<(), ResourceError> {
        write_tunable(path, value).await
    }

    /// Read the CPU quota of a cgroup directory, normalizing the v1 `-1` and
    /// v2 `max` sentinels to [`UNLIMITED_QUOTA`].
    async fn read_cpu_quota(&self, cgroup_dir: &Path) -> Result<i64, ResourceError> {
        let file = match self.manager.version() {
            CgroupVersion::V1 => CPU_QUOTA_TOTAL_FILE,
            CgroupVersion::V2 => CPU_QUOTA_TOTAL_FILE_V2,
        };
        let path = cgroup_dir.join(file);
        let content = fs::read_to_string(&path)
            .await
            .map_err(|err| ResourceError::io(&path, err))?;

        // cpu.max carries "quota period"; only the quota token matters here.
        let quota = content.split_whitespace().next().unwrap_or_default();
        if quota == UNLIMITED_TOKEN || quota == "-1" {
            return Ok(UNLIMITED_QUOTA);
        }
        quota.parse().map_err(|_| {
            ResourceError::io(
                &path,
                std::io::Error::new(
                    ErrorKind::InvalidData,
                    format!("unexpected quota value {quota:?}"),
                ),
            )
        })
    }

    async fn set_cpu_weight_and_quota(
        &self,
        pod_path: &Path,
        qos_level: i64,
    ) -> Result<(), ResourceError> {
        if qos_level == -1 {
            // The idle class parks the pod entirely; weight and quota are
            // left alone so un-idling restores the previous shares.
            return self.write_tunable(&pod_path.join(CPU_IDLE_FILE_V2), "1").await;
        }

        let weight = cpu_weight_for_level(qos_level);
        self.write_tunable(&pod_path.join(CPU_WEIGHT_FILE_V2), &weight.to_string())
            .await?;

        let quota = cpu_quota_for_level(qos_level);
        if quota > 0 {
            self.write_tunable(&pod_path.join(CPU_QUOTA_TOTAL_FILE_V2), &quota.to_string())
                .await?;
        }
        Ok(())
    }

    async fn set_memory_bounds_v2(
        &self,
        pod_path: &Path,
        qos_level: i64,
    ) -> Result<(), ResourceError> {
        let bounds = self.memory_table.bounds_for_level(qos_level);

        let high = if bounds.high == 0 {
            UNLIMITED_TOKEN.to_string()
        } else {
            bounds.high.to_string()
        };
        self.write_tunable(&pod_path.join(MEMORY_HIGH_FILE_V2), &high)
            .await?;
        self.write_tunable(&pod_path.join(MEMORY_LOW_FILE_V2), &bounds.low.to_string())
            .await?;
        self.write_tunable(&pod_path.join(MEMORY_MIN_FILE_V2), &bounds.min.to_string())
            .await?;

        debug!(
            qos_level,
            high = %high,
            low = bounds.low,
            min = bounds.min,
            "Applied memory bounds"
        );
        Ok(())
    }

    /// Collect every descendant cgroup directory of `root`, depth-first
    async fn collect_child_cgroups(root: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
        let mut entries = fs::read_dir(root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                let path = entry.path();
                out.push(path.clone());
                Box::pin(Self::collect_child_cgroups(&path, out)).await?;
            }
        }
        Ok(())
    }

    fn burst_file(&self) -> &'static str {
        match self.manager.version() {
            CgroupVersion::V1 => CPU_QUOTA_BURST_FILE,
            CgroupVersion::V2 => CPU_QUOTA_BURST_FILE_V2,
        }
    }
}

#[async_trait]
impl ResourceHandler for CgroupfsHandler {
    async fn set_cpu_qos_level(
        &self,
        pod_uid: &str,
        qos_class: QosClass,
        qos_level: i64,
    ) -> Result<(), ResourceError> {
        let pod_path = self
            .manager
            .pod_path(qos_class, Subsystem::Cpu, pod_uid)
            .map_err(|err| ResourceError::address(pod_uid, err))?;

        match self.manager.version() {
            CgroupVersion::V1 => {
                self.write_tunable(&pod_path.join(CPU_QOS_LEVEL_FILE), &qos_level.to_string())
                    .await
            }
            CgroupVersion::V2 => self.set_cpu_weight_and_quota(&pod_path, qos_level).await,
        }
    }

    async fn set_memory_qos(
        &self,
        pod_uid: &str,
        qos_class: QosClass,
        qos_level: i64,
    ) -> Result<(), ResourceError> {
        let pod_path = self
            .manager
            .pod_path(qos_class, Subsystem::Memory, pod_uid)
            .map_err(|err| ResourceError::address(pod_uid, err))?;

        match self.manager.version() {
            CgroupVersion::V1 => {
                let level = normalize_memory_qos_level(qos_level);
                self.write_tunable(&pod_path.join(MEMORY_QOS_LEVEL_FILE), &level.to_string())
                    .await
            }
            CgroupVersion::V2 => self.set_memory_bounds_v2(&pod_path, qos_level).await,
        }
    }

    async fn set_cpu_burst(
        &self,
        qos_class: QosClass,
        pod_uid: &str,
        burst_time_us: i64,
        pod: &PodInfo,
    ) -> Result<(), ResourceError> {
        let pod_path = self
            .manager
            .pod_path(qos_class, Subsystem::Cpu, pod_uid)
            .map_err(|err| ResourceError::address(pod_uid, err))?;

        let mut children = Vec::new();
        Self::collect_child_cgroups(&pod_path, &mut children)
            .await
            .map_err(|err| ResourceError::io(&pod_path, err))?;

        let mut pod_burst_us = 0i64;
        for child in &children {
            let quota = self.read_cpu_quota(child).await?;
            // Unlimited (and any non-positive) quota has nothing to burst.
            if quota <= 0 {
                continue;
            }

            let mut burst = burst_time_us.clamp(0, quota);
            if burst_time_us == 0 {
                burst = quota;
            }
            if burst_time_us > quota {
                warn!(
                    requested = burst_time_us,
                    quota,
                    path = %child.display(),
                    "Burst time exceeds quota, clamping"
                );
            }

            pod_burst_us += burst;
            self.write_tunable(&child.join(self.burst_file()), &burst.to_string())
                .await?;
        }

        // The pod-level file is written last so the sum covers all containers.
        if self.read_cpu_quota(&pod_path).await? == UNLIMITED_QUOTA {
            return Ok(());
        }
        self.write_tunable(&pod_path.join(self.burst_file()), &pod_burst_us.to_string())
            .await?;

        info!(
            pod = %pod.key(),
            burst_us = pod_burst_us,
            containers = children.len(),
            "Applied CPU burst"
        );
        Ok(())
    }

    async fn set_resource_limit(&self, pod: &PodInfo) -> Result<(), ResourceError> {
        let entries = extended_resource_entries(pod, self.manager.version());

        let mut errs = Vec::new();
        for entry in entries {
            let pod_path = match self
                .manager
                .pod_path(pod.qos_class, entry.subsystem, &pod.uid)
            {
                Ok(path) => path,
                Err(err) => {
                    warn!(pod = %pod.key(), error = %err, "Failed to resolve pod cgroup");
                    errs.push(ResourceError::address(&pod.uid, err));
                    continue;
                }
            };

            let file = pod_path.join(&entry.container_id).join(entry.sub_path);
            let payload = entry.render(self.manager.version());
            if let Err(err) = self.write_tunable(&file, &payload).await {
                warn!(pod = %pod.key(), path = %file.display(), error = %err, "Failed to set resource limit");
                errs.push(err);
                continue;
            }
            debug!(pod = %pod.key(), path = %file.display(), value = %payload, "Set resource limit");
        }
        aggregate(errs)
    }
}

/// One `(subsystem, file, container, value)` write derived from the pod's
/// extended resources
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LimitEntry {
    pub subsystem: Subsystem,
    pub sub_path: &'static str,
    pub container_id: String,
    /// Limit value; [`UNLIMITED_QUOTA`] means "no limit"
    pub value: i64,
}

impl LimitEntry {
    /// File payload, expanding the v2 "max" sentinels
    fn render(&self, version: CgroupVersion) -> String {
        if version == CgroupVersion::V2 && self.value == UNLIMITED_QUOTA {
            if self.sub_path == CPU_QUOTA_TOTAL_FILE_V2 {
                return format!("{UNLIMITED_TOKEN} {CPU_PERIOD_US}");
            }
            return UNLIMITED_TOKEN.to_string();
        }
        self.value.to_string()
    }
}

/// Derive per-container limit writes from the pod's extended resources
pub(crate) fn extended_resource_entries(pod: &PodInfo, version: CgroupVersion) -> Vec<LimitEntry> {
    let (cpu_file, memory_file) = match version {
        CgroupVersion::V1 => (CPU_QUOTA_TOTAL_FILE, MEMORY_LIMIT_FILE),
        CgroupVersion::V2 => (CPU_QUOTA_TOTAL_FILE_V2, MEMORY_LIMIT_FILE_V2),
    };

    let mut entries = Vec::new();
    for container in &pod.containers {
        if container.id.is_empty() {
            continue;
        }
        if let Some(millis) = container.batch_cpu_millis {
            let value = if millis < 0 {
                UNLIMITED_QUOTA
            } else {
                millis * CPU_PERIOD_US / 1000
            };
            entries.push(LimitEntry {
                subsystem: Subsystem::Cpu,
                sub_path: cpu_file,
                container_id: container.id.clone(),
                value,
            });
        }
        if let Some(bytes) = container.batch_memory_bytes {
            let value = if bytes < 0 { UNLIMITED_QUOTA } else { bytes };
            entries.push(LimitEntry {
                subsystem: Subsystem::Memory,
                sub_path: memory_file,
                container_id: container.id.clone(),
                value,
            });
        }
    }
    entries
}
