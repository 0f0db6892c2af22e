//! Typed configuration surface (spec §6). Parsing the YAML file into these
//! types is the caller's job (config loading is out of scope here); these
//! types only need to be `Deserialize` so a host daemon can hand them to us
//! already parsed.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

fn default_default_vcpus() -> u32 {
    1
}

fn default_default_memory_mb() -> u64 {
    128
}

fn default_max_vcpus() -> u32 {
    8
}

fn default_max_memory_mb() -> u64 {
    16 * 1024
}

fn default_init_grace_period() -> Duration {
    Duration::from_secs(10)
}

fn default_min_rootfs_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_rootfs_size_headroom() -> f64 {
    1.2
}

fn default_event_queue_capacity() -> usize {
    100
}

fn default_vmm_start_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_image_pull_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_bridge_creation_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Top-level configuration for an [`crate::executor::Executor`] instance,
/// matching the `executor.*` key table in spec §6.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Path to a Linux kernel image for guests.
    pub kernel_path: PathBuf,
    /// Optional initrd image.
    #[serde(default)]
    pub initrd_path: Option<PathBuf>,
    /// Directory holding committed rootfs images, named by task id.
    pub rootfs_dir: PathBuf,
    /// Directory holding Firecracker control sockets, named by task id.
    pub socket_dir: PathBuf,
    /// Directory used for scratch work (extraction, mounts) during image
    /// preparation; contents are transient and safe to purge on restart.
    pub work_dir: PathBuf,
    /// Explicit path to the hypervisor binary. When absent, resolved from
    /// `PATH` at the point of use (spec §9 Open Question; see DESIGN.md).
    #[serde(default)]
    pub firecracker_binary: Option<PathBuf>,
    /// Container runtime CLI to shell out to for image pull/export.
    pub container_runtime: ContainerRuntimeKind,
    /// Default vCPU count used when a task omits resource requirements.
    #[serde(default = "default_default_vcpus")]
    pub default_vcpus: u32,
    /// Default memory in MiB used when a task omits resource requirements.
    #[serde(default = "default_default_memory_mb")]
    pub default_memory_mb: u64,
    /// Host-declared ceiling a task's translated resources must not exceed.
    #[serde(default = "default_max_vcpus")]
    pub max_vcpus: u32,
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,
    /// Init system injected into the rootfs at `/sbin/<name>`.
    #[serde(default)]
    pub init_system: InitSystem,
    /// Seconds granted for graceful shutdown before SIGKILL.
    #[serde(default = "default_init_grace_period", with = "duration_secs")]
    pub init_grace_period: Duration,
    #[serde(default = "default_vmm_start_timeout", with = "duration_secs")]
    pub vmm_start_timeout: Duration,
    #[serde(default = "default_image_pull_timeout", with = "duration_secs")]
    pub image_pull_timeout: Duration,
    #[serde(default = "default_bridge_creation_timeout", with = "duration_secs")]
    pub bridge_creation_timeout: Duration,
    #[serde(default = "default_min_rootfs_bytes")]
    pub min_rootfs_bytes: u64,
    #[serde(default = "default_rootfs_size_headroom")]
    pub rootfs_size_headroom: f64,
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntimeKind {
    Docker,
    Podman,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitSystem {
    None,
    #[default]
    Tini,
    DumbInit,
}

impl InitSystem {
    /// The binary name injected at `/sbin/<name>` inside the rootfs, or
    /// `None` when no init system is configured.
    pub fn binary_name(self) -> Option<&'static str> {
        match self {
            InitSystem::None => None,
            InitSystem::Tini => Some("tini"),
            InitSystem::DumbInit => Some("dumb-init"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpMode {
    #[default]
    Static,
    Dhcp,
}

/// Host networking configuration (spec §4.4), matching the `network.*` key
/// table in spec §6.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkConfig {
    /// Name of the Linux bridge all task TAPs attach to.
    pub bridge_name: String,
    /// The bridge's gateway IPv4. Must lie within `subnet`.
    pub bridge_ip: Ipv4Addr,
    /// The subnet the bridge and per-task TAPs are addressed from.
    pub subnet: cidr::Ipv4Cidr,
    /// Whether to install MASQUERADE iptables rules and enable IPv4
    /// forwarding for this subnet.
    #[serde(default)]
    pub nat_enabled: bool,
    /// Whether to apply a `tc`-based ingress rate limit to each TAP.
    #[serde(default)]
    pub enable_rate_limit: bool,
    #[serde(default)]
    pub max_packets_per_sec: Option<u64>,
    /// This crate only implements static allocation (spec §4.4); `dhcp` is
    /// accepted for config-surface completeness but falls back to static
    /// allocation with a logged warning — see
    /// [`crate::network::NetworkManager::new`].
    #[serde(default)]
    pub ip_mode: IpMode,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
