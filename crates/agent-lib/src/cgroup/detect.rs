//! One-shot cgroup version and driver detection
//!
//! Runs once at startup; the result is captured in a [`RuntimeContext`] value
//! handed to constructors. Probe roots are parameters so tests can point the
//! detectors at a scratch directory instead of the live system.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

/// Default mount point of the cgroup hierarchy
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Environment variable overriding driver detection
const CGROUP_DRIVER_ENV: &str = "CGROUP_DRIVER";

/// Well-known kubelet configuration locations, probed in order
const KUBELET_CONFIG_PATHS: &[&str] = &[
    "/var/lib/kubelet/config.yaml",
    "/etc/kubernetes/kubelet.conf",
    "/var/lib/kubelet/kubeadm-flags.env",
];

/// Cgroup hierarchy version mounted on the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl fmt::Display for CgroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgroupVersion::V1 => write!(f, "v1"),
            CgroupVersion::V2 => write!(f, "v2"),
        }
    }
}

/// How cgroups are manipulated on this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupDriver {
    /// Tunables written directly through the cgroup filesystem
    Cgroupfs,
    /// Tunables set as unit properties on systemd over D-Bus
    Systemd,
}

impl CgroupDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            CgroupDriver::Cgroupfs => "cgroupfs",
            CgroupDriver::Systemd => "systemd",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cgroupfs" => Some(CgroupDriver::Cgroupfs),
            "systemd" => Some(CgroupDriver::Systemd),
            _ => None,
        }
    }
}

impl fmt::Display for CgroupDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("unable to detect cgroup version under {0}")]
    UnknownVersion(PathBuf),
}

/// Detection state fixed for the agent's lifetime
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub version: CgroupVersion,
    pub driver: CgroupDriver,
    pub cgroup_root: PathBuf,
    /// Optional extra root segment matching the kubelet's `cgroup-root` flag
    pub kube_cgroup_root: Option<String>,
}

impl RuntimeContext {
    /// Detect version and driver once, honoring an explicit driver override
    /// from configuration.
    pub async fn detect(
        cgroup_root: impl Into<PathBuf>,
        kube_cgroup_root: Option<String>,
        driver_override: Option<CgroupDriver>,
    ) -> Result<Self, DetectError> {
        let cgroup_root = cgroup_root.into();
        let version = detect_cgroup_version(&cgroup_root).await?;
        let driver = match driver_override {
            Some(driver) => driver,
            None => detect_cgroup_driver(&cgroup_root, Path::new("/proc")).await,
        };
        info!(version = %version, driver = %driver, root = %cgroup_root.display(), "Detected cgroup runtime");
        Ok(Self {
            version,
            driver,
            cgroup_root,
            kube_cgroup_root,
        })
    }
}

async fn exists(path: &Path) -> bool {
    fs::metadata(path).await.is_ok()
}

/// Detect the mounted cgroup version.
///
/// The unified hierarchy always exposes `cgroup.controllers`; a bare `cpu`
/// controller directory means legacy v1; a `unified` mount means hybrid mode,
/// treated as v2.
pub async fn detect_cgroup_version(cgroup_root: &Path) -> Result<CgroupVersion, DetectError> {
    if exists(&cgroup_root.join("cgroup.controllers")).await {
        return Ok(CgroupVersion::V2);
    }
    if exists(&cgroup_root.join("cpu")).await {
        return Ok(CgroupVersion::V1);
    }
    if exists(&cgroup_root.join("unified")).await {
        return Ok(CgroupVersion::V2);
    }
    Err(DetectError::UnknownVersion(cgroup_root.to_path_buf()))
}

/// Detect the cgroup driver, in order of precedence: environment variable,
/// kubelet configuration files, the kubelet process command line, filesystem
/// heuristics, and finally the cgroupfs default.
pub async fn detect_cgroup_driver(cgroup_root: &Path, proc_root: &Path) -> CgroupDriver {
    if let Ok(value) = std::env::var(CGROUP_DRIVER_ENV) {
        if let Some(driver) = CgroupDriver::parse(&value) {
            debug!(driver = %driver, "Cgroup driver from environment");
            return driver;
        }
    }

    if let Some(driver) = driver_from_kubelet_config().await {
        debug!(driver = %driver, "Cgroup driver from kubelet configuration");
        return driver;
    }

    if let Some(driver) = driver_from_kubelet_process(proc_root).await {
        debug!(driver = %driver, "Cgroup driver from kubelet command line");
        return driver;
    }

    if let Some(driver) = driver_from_filesystem(cgroup_root).await {
        debug!(driver = %driver, "Cgroup driver from filesystem heuristic");
        return driver;
    }

    debug!("Cgroup driver detection inconclusive, defaulting to cgroupfs");
    CgroupDriver::Cgroupfs
}

async fn driver_from_kubelet_config() -> Option<CgroupDriver> {
    for path in KUBELET_CONFIG_PATHS {
        if let Ok(content) = fs::read_to_string(path).await {
            if let Some(driver) = parse_kubelet_config(&content) {
                return Some(driver);
            }
        }
    }
    None
}

/// Extract the cgroup driver from kubelet configuration content, accepting
/// both the `cgroupDriver:` YAML key and the `--cgroup-driver` flag forms.
fn parse_kubelet_config(content: &str) -> Option<CgroupDriver> {
    for line in content.lines() {
        let line = line.trim();
        if let Some(value) = line.strip_prefix("cgroupDriver:") {
            if let Some(driver) = CgroupDriver::parse(value.trim()) {
                return Some(driver);
            }
        }
        if line.contains("--cgroup-driver") {
            if let Some(driver) = parse_driver_flag(line.split_whitespace()) {
                return Some(driver);
            }
        }
    }
    None
}

/// Scan `--cgroup-driver systemd` and `--cgroup-driver=systemd` forms out of
/// an argument stream. The joined form may be glued to an env assignment
/// (`KUBELET_KUBEADM_ARGS="--cgroup-driver=systemd ..."`), so it is matched
/// as a substring.
fn parse_driver_flag<'a>(args: impl Iterator<Item = &'a str>) -> Option<CgroupDriver> {
    const JOINED_FLAG: &str = "--cgroup-driver=";

    let mut expect_value = false;
    for arg in args {
        let arg = arg.trim_matches('"');
        if expect_value {
            return CgroupDriver::parse(arg);
        }
        if let Some(pos) = arg.find(JOINED_FLAG) {
            let value = &arg[pos + JOINED_FLAG.len()..];
            return CgroupDriver::parse(value.trim_matches('"'));
        }
        if arg == "--cgroup-driver" {
            expect_value = true;
        }
    }
    None
}

/// Find the kubelet process in the process filesystem and read the driver off
/// its command line.
async fn driver_from_kubelet_process(proc_root: &Path) -> Option<CgroupDriver> {
    let mut entries = fs::read_dir(proc_root).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }

        let cmdline_path = entry.path().join("cmdline");
        let Ok(raw) = fs::read(&cmdline_path).await else {
            continue;
        };
        let cmdline = String::from_utf8_lossy(&raw);
        let mut args = cmdline.split('\0');
        let Some(argv0) = args.next() else {
            continue;
        };
        if !argv0.ends_with("kubelet") {
            continue;
        }
        return parse_driver_flag(args);
    }
    None
}

/// Heuristic fallback: a systemd-managed hierarchy carries `system.slice` (or
/// a `systemd` controller dir on v1); bare controller directories mean
/// cgroupfs.
async fn driver_from_filesystem(cgroup_root: &Path) -> Option<CgroupDriver> {
    if exists(&cgroup_root.join("system.slice")).await {
        return Some(CgroupDriver::Systemd);
    }
    if exists(&cgroup_root.join("systemd")).await {
        return Some(CgroupDriver::Systemd);
    }
    if exists(&cgroup_root.join("cpu")).await {
        return Some(CgroupDriver::Cgroupfs);
    }
    if exists(&cgroup_root.join("cgroup.controllers")).await {
        // Unified hierarchy not managed by systemd.
        return Some(CgroupDriver::Cgroupfs);
    }
    let unified = cgroup_root.join("unified");
    if exists(&unified).await {
        if exists(&unified.join("system.slice")).await {
            return Some(CgroupDriver::Systemd);
        }
        return Some(CgroupDriver::Cgroupfs);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_detect_version_v2() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cgroup.controllers"), "cpu memory\n")
            .await
            .unwrap();

        let version = detect_cgroup_version(dir.path()).await.unwrap();
        assert_eq!(version, CgroupVersion::V2);
    }

    #[tokio::test]
    async fn test_detect_version_v1() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("cpu")).await.unwrap();

        let version = detect_cgroup_version(dir.path()).await.unwrap();
        assert_eq!(version, CgroupVersion::V1);
    }

    #[tokio::test]
    async fn test_detect_version_hybrid_is_v2() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("unified")).await.unwrap();

        let version = detect_cgroup_version(dir.path()).await.unwrap();
        assert_eq!(version, CgroupVersion::V2);
    }

    #[tokio::test]
    async fn test_detect_version_unknown_errors() {
        let dir = TempDir::new().unwrap();
        assert!(detect_cgroup_version(dir.path()).await.is_err());
    }

    #[test]
    fn test_parse_kubelet_config_yaml_key() {
        let content = "kind: KubeletConfiguration\ncgroupDriver: systemd\n";
        assert_eq!(parse_kubelet_config(content), Some(CgroupDriver::Systemd));
    }

    #[test]
    fn test_parse_kubelet_config_flag_forms() {
        let spaced = "ExecStart=/usr/bin/kubelet --cgroup-driver cgroupfs --v=2";
        assert_eq!(parse_kubelet_config(spaced), Some(CgroupDriver::Cgroupfs));

        let joined = r#"KUBELET_KUBEADM_ARGS="--cgroup-driver=systemd --pod-infra-container-image=pause""#;
        assert_eq!(parse_kubelet_config(joined), Some(CgroupDriver::Systemd));
    }

    #[test]
    fn test_parse_kubelet_config_rejects_unknown_driver() {
        assert_eq!(parse_kubelet_config("cgroupDriver: exotic\n"), None);
    }

    #[tokio::test]
    async fn test_filesystem_heuristic_system_slice_means_systemd() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("system.slice")).await.unwrap();

        assert_eq!(
            driver_from_filesystem(dir.path()).await,
            Some(CgroupDriver::Systemd)
        );
    }

    #[tokio::test]
    async fn test_filesystem_heuristic_bare_controllers_mean_cgroupfs() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("cpu")).await.unwrap();

        assert_eq!(
            driver_from_filesystem(dir.path()).await,
            Some(CgroupDriver::Cgroupfs)
        );
    }

    #[tokio::test]
    async fn test_filesystem_heuristic_unified_without_systemd() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("cgroup.controllers"), "cpu\n")
            .await
            .unwrap();

        assert_eq!(
            driver_from_filesystem(dir.path()).await,
            Some(CgroupDriver::Cgroupfs)
        );
    }

    #[tokio::test]
    async fn test_kubelet_process_scan() {
        let proc_root = TempDir::new().unwrap();
        let pid_dir = proc_root.path().join("4242");
        fs::create_dir(&pid_dir).await.unwrap();
        fs::write(
            pid_dir.join("cmdline"),
            b"/usr/bin/kubelet\0--cgroup-driver=systemd\0--v=2\0".to_vec(),
        )
        .await
        .unwrap();

        // Non-numeric and non-kubelet entries are skipped.
        fs::create_dir(proc_root.path().join("self")).await.unwrap();
        let other = proc_root.path().join("99");
        fs::create_dir(&other).await.unwrap();
        fs::write(other.join("cmdline"), b"/usr/bin/bash\0".to_vec())
            .await
            .unwrap();

        assert_eq!(
            driver_from_kubelet_process(proc_root.path()).await,
            Some(CgroupDriver::Systemd)
        );
    }
}
