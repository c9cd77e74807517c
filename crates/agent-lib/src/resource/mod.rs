//! Resource-handler dispatch
//!
//! One capability set, two backends: the cgroupfs handler writes tunables
//! directly, the systemd handler sets unit properties over D-Bus and embeds a
//! cgroupfs handler as its fallback. The factory picks by detected driver.

pub mod cgroupfs;
pub mod properties;
pub mod systemd;
pub mod values;


use crate::cgroup::{AddressError, CgroupDriver, CgroupManager};
use crate::models::{PodInfo, QosClass};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use cgroupfs::CgroupfsHandler;
pub use systemd::SystemdHandler;
pub use values::MemoryQosTable;

/// Categorized enforcement failure
///
/// A missing tunable file is not represented here: kernels without the
/// feature are tolerated inside the backends (logged, then treated as
/// success).
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("unsupported cgroup version: {0}")]
    NotImplemented(String),

    #[error("failed to resolve cgroup address for pod {pod}: {reason}")]
    AddressResolution { pod: String, reason: String },

    #[error("cgroup I/O on {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("service manager call failed: {0}")]
    Ipc(#[from] zbus::Error),

    #[error("{} enforcement operations failed", .0.len())]
    Aggregate(Vec<ResourceError>),
}

impl ResourceError {
    pub(crate) fn address(pod: &str, err: AddressError) -> Self {
        ResourceError::AddressResolution {
            pod: pod.to_string(),
            reason: err.to_string(),
        }
    }

    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        ResourceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Collapse per-item failures into a single result
pub(crate) fn aggregate(mut errs: Vec<ResourceError>) -> Result<(), ResourceError> {
    match errs.len() {
        0 => Ok(()),
        1 => Err(errs.remove(0)),
        _ => Err(ResourceError::Aggregate(errs)),
    }
}

/// The enforcement capability set shared by both backends
///
/// All operations are idempotent: writing an already-applied value changes
/// nothing in the kernel.
#[async_trait]
pub trait ResourceHandler: Send + Sync {
    /// Apply the CPU QoS level to the pod cgroup
    async fn set_cpu_qos_level(
        &self,
        pod_uid: &str,
        qos_class: QosClass,
        qos_level: i64,
    ) -> Result<(), ResourceError>;

    /// Apply the memory QoS level to the pod cgroup
    async fn set_memory_qos(
        &self,
        pod_uid: &str,
        qos_class: QosClass,
        qos_level: i64,
    ) -> Result<(), ResourceError>;

    /// Reconcile CPU burst across the pod's container cgroups
    async fn set_cpu_burst(
        &self,
        qos_class: QosClass,
        pod_uid: &str,
        burst_time_us: i64,
        pod: &PodInfo,
    ) -> Result<(), ResourceError>;

    /// Program the pod's extended resource limits into container cgroups
    async fn set_resource_limit(&self, pod: &PodInfo) -> Result<(), ResourceError>;
}

/// Build the resource handler matching the detected cgroup driver
pub async fn create_resource_handler(
    manager: CgroupManager,
    memory_table: MemoryQosTable,
) -> Arc<dyn ResourceHandler> {
    match manager.driver() {
        CgroupDriver::Cgroupfs => {
            Arc::new(CgroupfsHandler::with_memory_table(manager, memory_table))
        }
        CgroupDriver::Systemd => {
            Arc::new(SystemdHandler::connect(manager, memory_table).await)
        }
    }
}
