//! Cgroup addressing
//!
//! Resolves a pod identity plus QoS class into a concrete location in the
//! cgroup hierarchy, aware of cgroup v1 (split controllers) vs v2 (unified)
//! and of the cgroupfs vs systemd naming conventions. The agent never creates
//! pod cgroups; it only computes where the kubelet already put them.

mod detect;

pub use detect::{
    detect_cgroup_driver, detect_cgroup_version, CgroupDriver, CgroupVersion, DetectError,
    RuntimeContext, DEFAULT_CGROUP_ROOT,
};

use crate::models::QosClass;
use std::path::PathBuf;
use thiserror::Error;

/// Root of the pod hierarchy managed by the kubelet
pub const KUBE_CGROUP_ROOT: &str = "kubepods";

/// Suffix of systemd slice units
pub const SLICE_SUFFIX: &str = ".slice";

/// Prefix of pod-level cgroup directories
pub const POD_CGROUP_PREFIX: &str = "pod";

// cgroup v1 tunables
pub const CPU_QOS_LEVEL_FILE: &str = "cpu.qos_level";
pub const CPU_QUOTA_TOTAL_FILE: &str = "cpu.cfs_quota_us";
pub const CPU_PERIOD_FILE: &str = "cpu.cfs_period_us";
pub const CPU_QUOTA_BURST_FILE: &str = "cpu.cfs_burst_us";
pub const MEMORY_QOS_LEVEL_FILE: &str = "memory.qos_level";
pub const MEMORY_LIMIT_FILE: &str = "memory.limit_in_bytes";

// cgroup v2 tunables
pub const CPU_WEIGHT_FILE_V2: &str = "cpu.weight";
pub const CPU_IDLE_FILE_V2: &str = "cpu.idle";
pub const CPU_QUOTA_TOTAL_FILE_V2: &str = "cpu.max";
pub const CPU_QUOTA_BURST_FILE_V2: &str = "cpu.max.burst";
pub const MEMORY_HIGH_FILE_V2: &str = "memory.high";
pub const MEMORY_LOW_FILE_V2: &str = "memory.low";
pub const MEMORY_MIN_FILE_V2: &str = "memory.min";
pub const MEMORY_LIMIT_FILE_V2: &str = "memory.max";

/// Sentinel for "no quota" in `cpu.cfs_quota_us`
pub const UNLIMITED_QUOTA: i64 = -1;

/// Sentinel token for "no limit" in cgroup v2 files
pub const UNLIMITED_TOKEN: &str = "max";

/// Cgroup controller in the v1 split hierarchy
///
/// Under cgroup v2 all controllers share one directory, so the subsystem is
/// never a path component there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsystem {
    Cpu,
    Memory,
}

impl Subsystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Cpu => "cpu",
            Subsystem::Memory => "memory",
        }
    }
}

/// Failure to render a cgroup name under the active driver
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("invalid systemd slice name {name:?}: {reason}")]
    InvalidSlice { name: String, reason: String },
}

/// Hierarchical cgroup name, one element per level below the cgroup root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupName(Vec<String>);

impl CgroupName {
    pub fn new(segments: Vec<String>) -> Self {
        Self(segments)
    }

    /// Literal rendering used by the cgroupfs driver
    pub fn to_cgroupfs(&self) -> String {
        format!("/{}", self.0.join("/"))
    }

    /// Systemd rendering: escape `-` in each segment, join with `-`, append
    /// the slice suffix, then expand into the nested slice directory chain
    pub fn to_systemd(&self) -> Result<String, AddressError> {
        if self.0.is_empty() || (self.0.len() == 1 && self.0[0].is_empty()) {
            return Ok("/".to_string());
        }
        let escaped: Vec<String> = self.0.iter().map(|s| s.replace('-', "_")).collect();
        expand_slice(&format!("{}{}", escaped.join("-"), SLICE_SUFFIX))
    }
}

/// Expand a slice unit name into its directory path, e.g.
/// `kubepods-burstable-podu2.slice` becomes
/// `/kubepods.slice/kubepods-burstable.slice/kubepods-burstable-podu2.slice`.
pub fn expand_slice(name: &str) -> Result<String, AddressError> {
    let invalid = |reason: &str| AddressError::InvalidSlice {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let stem = name
        .strip_suffix(SLICE_SUFFIX)
        .ok_or_else(|| invalid("missing .slice suffix"))?;
    if name.contains('/') {
        return Err(invalid("slice name must not contain '/'"));
    }
    if stem.is_empty() {
        return Err(invalid("empty slice name"));
    }

    let mut path = String::new();
    let mut prefix = String::new();
    for component in stem.split('-') {
        if component.is_empty() {
            return Err(invalid("empty component in slice name"));
        }
        path.push('/');
        path.push_str(&prefix);
        path.push_str(component);
        path.push_str(SLICE_SUFFIX);
        prefix.push_str(component);
        prefix.push('-');
    }
    Ok(path)
}

/// Resolves `(qos class, subsystem, pod uid)` to absolute cgroup paths
///
/// Owns the detected runtime context; version and driver are fixed for the
/// agent's lifetime.
#[derive(Debug, Clone)]
pub struct CgroupManager {
    ctx: RuntimeContext,
}

impl CgroupManager {
    pub fn new(ctx: RuntimeContext) -> Self {
        Self { ctx }
    }

    pub fn version(&self) -> CgroupVersion {
        self.ctx.version
    }

    pub fn driver(&self) -> CgroupDriver {
        self.ctx.driver
    }

    /// Path of the kubepods root cgroup
    pub fn root_path(&self, subsystem: Subsystem) -> Result<PathBuf, AddressError> {
        self.join(subsystem, self.base_name())
    }

    /// Path of the QoS tier cgroup (the root itself for Guaranteed)
    pub fn qos_path(&self, qos: QosClass, subsystem: Subsystem) -> Result<PathBuf, AddressError> {
        self.join(subsystem, self.qos_name(qos))
    }

    /// Path of the pod-level cgroup
    pub fn pod_path(
        &self,
        qos: QosClass,
        subsystem: Subsystem,
        pod_uid: &str,
    ) -> Result<PathBuf, AddressError> {
        let mut segments = self.qos_name(qos);
        segments.push(format!("{POD_CGROUP_PREFIX}{pod_uid}"));
        self.join(subsystem, segments)
    }

    fn base_name(&self) -> Vec<String> {
        let mut segments = Vec::new();
        if let Some(kube_root) = &self.ctx.kube_cgroup_root {
            if !kube_root.is_empty() {
                segments.push(kube_root.clone());
            }
        }
        segments.push(KUBE_CGROUP_ROOT.to_string());
        segments
    }

    fn qos_name(&self, qos: QosClass) -> Vec<String> {
        let mut segments = self.base_name();
        match qos {
            QosClass::Burstable => segments.push("burstable".to_string()),
            QosClass::BestEffort => segments.push("besteffort".to_string()),
            QosClass::Guaranteed => {}
        }
        segments
    }

    fn join(&self, subsystem: Subsystem, segments: Vec<String>) -> Result<PathBuf, AddressError> {
        let name = CgroupName::new(segments);
        let rendered = match self.ctx.driver {
            CgroupDriver::Cgroupfs => name.to_cgroupfs(),
            CgroupDriver::Systemd => name.to_systemd()?,
        };

        // The subsystem is a path component only in the split v1 hierarchy.
        let mut path = self.ctx.cgroup_root.clone();
        if self.ctx.version == CgroupVersion::V1 {
            path.push(subsystem.as_str());
        }
        path.push(rendered.trim_start_matches('/'));
        Ok(path)
    }
}
