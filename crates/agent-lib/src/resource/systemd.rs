//! Service-manager backend
//!
//! Programs pod slices by setting unit properties on systemd over D-Bus.
//! The bus connection is established once; if it cannot be, every operation
//! degrades to the embedded cgroupfs handler for the handler's lifetime.

use super::cgroupfs::CgroupfsHandler;
use super::properties::{
    UnitProperty, CPU_QUOTA_PER_SEC_PROPERTY, CPU_QUOTA_PROPERTY, CPU_WEIGHT_PROPERTY,
    MEMORY_HIGH_PROPERTY, MEMORY_LOW_PROPERTY, MEMORY_MIN_PROPERTY,
};
use super::values::{
    cpu_quota_for_level, cpu_weight_for_level, MemoryBounds, MemoryQosTable, CPU_PERIOD_US,
};
use super::{ResourceError, ResourceHandler};
use crate::cgroup::{CgroupManager, Subsystem, SLICE_SUFFIX};
use crate::models::{PodInfo, QosClass};
use async_trait::async_trait;
use tracing::{debug, info, warn};
use zbus::zvariant::{OwnedObjectPath, Value};
use zbus::Connection;

/// QoS tier slices that must not be mistaken for a pod unit
const TIER_SLICES: &[&str] = &[
    "kubepods.slice",
    "kubepods-burstable.slice",
    "kubepods-besteffort.slice",
];

/// `CPUWeight` sentinel expressing the idle class
const CPU_WEIGHT_IDLE: u64 = 0;

#[zbus::proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1",
    gen_blocking = false
)]
trait SystemdManager {
    /// `SetUnitProperties(unit, runtime, [(name, variant)])`
    fn set_unit_properties(
        &self,
        name: &str,
        runtime: bool,
        properties: &[(&str, Value<'_>)],
    ) -> zbus::Result<()>;

    /// Existence probe; errors for units the manager does not know
    fn get_unit(&self, name: &str) -> zbus::Result<OwnedObjectPath>;
}

/// Backend setting cgroup tunables through systemd unit properties
pub struct SystemdHandler {
    proxy: Option<SystemdManagerProxy<'static>>,
    manager: CgroupManager,
    fallback: CgroupfsHandler,
    memory_table: MemoryQosTable,
}

impl SystemdHandler {
    /// Connect to the system bus. Connection failure is not fatal: the
    /// handler is built without a proxy and every operation falls through to
    /// the cgroupfs backend. No reconnection is attempted later.
    pub async fn connect(manager: CgroupManager, memory_table: MemoryQosTable) -> Self {
        let proxy = match Connection::system().await {
            Ok(conn) => match SystemdManagerProxy::new(&conn).await {
                Ok(proxy) => Some(proxy),
                Err(err) => {
                    warn!(error = %err, "Failed to build systemd manager proxy, using cgroupfs fallback");
                    None
                }
            },
            Err(err) => {
                warn!(error = %err, "System bus unavailable, using cgroupfs fallback");
                None
            }
        };
        Self::with_proxy(proxy, manager, memory_table)
    }

    /// Build a handler with no bus connection; all operations use the
    /// embedded cgroupfs backend.
    pub fn disconnected(manager: CgroupManager, memory_table: MemoryQosTable) -> Self {
        Self::with_proxy(None, manager, memory_table)
    }

    fn with_proxy(
        proxy: Option<SystemdManagerProxy<'static>>,
        manager: CgroupManager,
        memory_table: MemoryQosTable,
    ) -> Self {
        let fallback = CgroupfsHandler::with_memory_table(manager.clone(), memory_table.clone());
        Self {
            proxy,
            manager,
            fallback,
            memory_table,
        }
    }

    /// Extract the pod's slice unit from its cgroup path: skip the QoS tier
    /// slices and return the first remaining slice segment the manager
    /// confirms. Without a bus the probe is skipped and the first candidate
    /// wins.
    async fn service_unit_name(&self, pod_uid: &str, qos_class: QosClass) -> Option<String> {
        let path = self
            .manager
            .pod_path(qos_class, Subsystem::Cpu, pod_uid)
            .ok()?;

        for part in path.iter() {
            let part = part.to_string_lossy();
            if !part.ends_with(SLICE_SUFFIX) || TIER_SLICES.contains(&part.as_ref()) {
                continue;
            }
            if self.unit_exists(&part).await {
                return Some(part.into_owned());
            }
        }
        None
    }

    async fn unit_exists(&self, name: &str) -> bool {
        match &self.proxy {
            // Cannot probe without a bus; proceed optimistically.
            None => true,
            Some(proxy) => proxy.get_unit(name).await.is_ok(),
        }
    }

    async fn apply_properties(
        &self,
        unit: &str,
        props: &[UnitProperty],
    ) -> Result<(), ResourceError> {
        let proxy = self.proxy.as_ref().ok_or_else(|| {
            ResourceError::Ipc(zbus::Error::Failure("no bus connection".to_string()))
        })?;

        let boxed: Vec<(&str, Value<'_>)> =
            props.iter().map(|p| (p.name, p.to_value())).collect();
        proxy
            .set_unit_properties(unit, false, &boxed)
            .await
            .map_err(ResourceError::Ipc)?;
        debug!(unit, count = props.len(), "Applied unit properties");
        Ok(())
    }

    /// Send `base` plus a CPU quota property, probing the quota property
    /// names in order. A manager rejecting a name as unknown is a try-next
    /// signal; any other failure surfaces. If every name is rejected the
    /// base properties are applied alone.
    async fn apply_with_quota(
        &self,
        unit: &str,
        base: Vec<UnitProperty>,
        quota_per_sec_us: Option<u64>,
    ) -> Result<(), ResourceError> {
        let Some(quota) = quota_per_sec_us else {
            return self.apply_properties(unit, &base).await;
        };

        for name in [CPU_QUOTA_PER_SEC_PROPERTY, CPU_QUOTA_PROPERTY] {
            let mut attempt = base.clone();
            attempt.push(UnitProperty::u64(name, quota));
            match self.apply_properties(unit, &attempt).await {
                Ok(()) => return Ok(()),
                Err(ResourceError::Ipc(err)) if is_unknown_property(&err) => {
                    debug!(unit, property = name, "Quota property rejected, trying next name");
                }
                Err(err) => return Err(err),
            }
        }
        self.apply_properties(unit, &base).await
    }
}

/// CPU properties for a QoS level: the weight (0 parks the unit in the idle
/// class) and, when the level carries a quota, the quota in µs per second.
fn cpu_properties(qos_level: i64) -> (Vec<UnitProperty>, Option<u64>) {
    let weight = if qos_level == -1 {
        CPU_WEIGHT_IDLE
    } else {
        cpu_weight_for_level(qos_level)
    };
    let props = vec![UnitProperty::u64(CPU_WEIGHT_PROPERTY, weight)];

    let quota = cpu_quota_for_level(qos_level);
    let per_sec = (quota > 0).then(|| quota * (1_000_000 / CPU_PERIOD_US as u64));
    (props, per_sec)
}

/// Memory properties for a set of bounds; `high == 0` is sent as `u64::MAX`
/// to express "no limit".
fn memory_properties(bounds: MemoryBounds) -> Vec<UnitProperty> {
    let mut props = Vec::new();
    if bounds.high > 0 {
        props.push(UnitProperty::u64(MEMORY_HIGH_PROPERTY, bounds.high));
    } else {
        props.push(UnitProperty::u64(MEMORY_HIGH_PROPERTY, u64::MAX));
    }
    if bounds.low > 0 {
        props.push(UnitProperty::u64(MEMORY_LOW_PROPERTY, bounds.low));
    }
    if bounds.min > 0 {
        props.push(UnitProperty::u64(MEMORY_MIN_PROPERTY, bounds.min));
    }
    props
}

/// Coalesce the pod's extended resources into per-unit property values:
/// summed CPU µs per second and summed memory bytes. A negative entry means
/// "no limit" and wins over the sum.
fn extended_resource_totals(pod: &PodInfo) -> (Option<u64>, Option<u64>) {
    let mut cpu: Option<u64> = None;
    let mut memory: Option<u64> = None;

    for container in &pod.containers {
        if let Some(millis) = container.batch_cpu_millis {
            let add = if millis < 0 { u64::MAX } else { millis as u64 * 1000 };
            cpu = Some(match cpu {
                Some(u64::MAX) => u64::MAX,
                Some(prev) => prev.saturating_add(add),
                None => add,
            });
        }
        if let Some(bytes) = container.batch_memory_bytes {
            let add = if bytes < 0 { u64::MAX } else { bytes as u64 };
            memory = Some(match memory {
                Some(u64::MAX) => u64::MAX,
                Some(prev) => prev.saturating_add(add),
                None => add,
            });
        }
    }
    (cpu, memory)
}

fn is_unknown_property(err: &zbus::Error) -> bool {
    match err {
        zbus::Error::MethodError(name, _, _) => {
            let name = name.as_str();
            name.contains("UnknownProperty") || name.contains("InvalidArgs")
        }
        _ => false,
    }
}

#[async_trait]
impl ResourceHandler for SystemdHandler {
    async fn set_cpu_qos_level(
        &self,
        pod_uid: &str,
        qos_class: QosClass,
        qos_level: i64,
    ) -> Result<(), ResourceError> {
        if self.proxy.is_none() {
            return self.fallback.set_cpu_qos_level(pod_uid, qos_class, qos_level).await;
        }

        let unit = self.service_unit_name(pod_uid, qos_class).await.ok_or_else(|| {
            ResourceError::AddressResolution {
                pod: pod_uid.to_string(),
                reason: "no systemd unit found for pod cgroup".to_string(),
            }
        })?;

        let (props, quota_per_sec) = cpu_properties(qos_level);
        self.apply_with_quota(&unit, props, quota_per_sec).await?;
        info!(unit = %unit, qos_level, "Applied CPU QoS level via systemd");
        Ok(())
    }

    async fn set_memory_qos(
        &self,
        pod_uid: &str,
        qos_class: QosClass,
        qos_level: i64,
    ) -> Result<(), ResourceError> {
        if self.proxy.is_some() {
            if let Some(unit) = self.service_unit_name(pod_uid, qos_class).await {
                let props = memory_properties(self.memory_table.bounds_for_level(qos_level));
                self.apply_properties(&unit, &props).await?;
                info!(unit = %unit, qos_level, "Applied memory QoS via systemd");
                return Ok(());
            }
        }
        self.fallback.set_memory_qos(pod_uid, qos_class, qos_level).await
    }

    async fn set_cpu_burst(
        &self,
        qos_class: QosClass,
        pod_uid: &str,
        burst_time_us: i64,
        pod: &PodInfo,
    ) -> Result<(), ResourceError> {
        // systemd exposes no burst property; burst always goes through the
        // cgroup filesystem.
        self.fallback
            .set_cpu_burst(qos_class, pod_uid, burst_time_us, pod)
            .await
    }

    async fn set_resource_limit(&self, pod: &PodInfo) -> Result<(), ResourceError> {
        if self.proxy.is_none() {
            return self.fallback.set_resource_limit(pod).await;
        }

        let (cpu_per_sec, memory_bytes) = extended_resource_totals(pod);
        if cpu_per_sec.is_none() && memory_bytes.is_none() {
            return Ok(());
        }

        let unit = self.service_unit_name(&pod.uid, pod.qos_class).await.ok_or_else(|| {
            ResourceError::AddressResolution {
                pod: pod.uid.clone(),
                reason: "no systemd unit found for pod cgroup".to_string(),
            }
        })?;

        let mut base = Vec::new();
        if let Some(bytes) = memory_bytes {
            base.push(UnitProperty::u64(MEMORY_HIGH_PROPERTY, bytes));
        }
        self.apply_with_quota(&unit, base, cpu_per_sec).await?;
        info!(unit = %unit, pod = %pod.key(), "Applied extended resource limits via systemd");
        Ok(())
    }
}
