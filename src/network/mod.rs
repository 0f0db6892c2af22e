//! Host networking (spec §4.4): a singleton bridge, one TAP per task with a
//! deterministic name, IP and MAC allocation, and optional NAT/rate-limit
//! rules. Per-task operations are driven through the [`crate::capability::CommandRunner`]
//! capability so bridge/TAP/iptables invocations can be faked in tests.

mod ip_allocator;
mod mac;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};

use crate::capability::CommandRunner;
use crate::config::NetworkConfig;
use crate::release::ReleaseStack;
use crate::task::TaskId;

pub use ip_allocator::IpExhaustedError;
use ip_allocator::IpAllocator;
pub use mac::derive_mac;

const MAX_TAP_NAME_LEN: usize = 15;
const TAP_NAME_PREFIX: &str = "tap";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error(transparent)]
    IpExhausted(#[from] IpExhaustedError),
    #[error("no network allocation found for task {0}")]
    NotFound(String),
    #[error("derived TAP name collided with an existing allocation")]
    TapNameCollision,
    #[error("host command failed: {0}")]
    CommandFailed(String),
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        NetworkError::CommandFailed(err.to_string())
    }
}

/// Per-task network allocation (spec §3), owned by [`NetworkManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAllocation {
    pub tap_name: String,
    pub ipv4: Ipv4Addr,
    pub mac: String,
    pub bridge_name: String,
}

/// Derive a TAP device name from a task id: a short hash prefixed with
/// `tap`, kept within the kernel's 15-character interface-name limit (spec
/// §4.4, §8 boundary behavior — task ids producing a name over 15 chars
/// must be hashed, not truncated).
pub fn derive_tap_name(task_id: &TaskId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(task_id.as_str().as_bytes());
    let digest = hasher.finalize();

    let hash_chars = MAX_TAP_NAME_LEN - TAP_NAME_PREFIX.len();
    let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("{TAP_NAME_PREFIX}{}", &hex[..hash_chars])
}

/// Singleton, process-wide host bridge state (spec §3). Created lazily on
/// the first [`NetworkManager::prepare_network`] call via a one-shot gate
/// (spec §4.4, §9: "one-shot initialization of the bridge").
pub struct HostBridge {
    config: NetworkConfig,
    allocator: OnceCell<Arc<Mutex<IpAllocator>>>,
}

impl HostBridge {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            allocator: OnceCell::new(),
        }
    }

    async fn ensure_initialized(&self, runner: &dyn CommandRunner) -> Result<Arc<Mutex<IpAllocator>>, NetworkError> {
        let allocator = self
            .allocator
            .get_or_try_init(|| async {
                self.create_or_reconcile(runner).await?;
                Ok::<_, NetworkError>(Arc::new(Mutex::new(IpAllocator::new(self.config.subnet, self.config.bridge_ip))))
            })
            .await?;
        Ok(Arc::clone(allocator))
    }

    async fn create_or_reconcile(&self, runner: &dyn CommandRunner) -> Result<(), NetworkError> {
        let bridge_name = self.config.bridge_name.as_str();

        let show = runner.run("ip", &["link", "show", bridge_name]).await?;
        if show.success() {
            info!(bridge = bridge_name, "host bridge already exists, reconciling");
            if !show.stdout_str().contains("UP") && !show.stderr_str().contains("UP") {
                runner
                    .run_checked("ip", &["link", "set", bridge_name, "up"])
                    .await?;
            }
            return Ok(());
        }

        info!(bridge = bridge_name, subnet = %self.config.subnet, "creating host bridge");
        runner
            .run_checked("ip", &["link", "add", "name", bridge_name, "type", "bridge"])
            .await?;
        let cidr_suffix = format!("{}/{}", self.config.bridge_ip, self.config.subnet.network_length());
        runner
            .run_checked("ip", &["addr", "add", &cidr_suffix, "dev", bridge_name])
            .await?;
        runner
            .run_checked("ip", &["link", "set", bridge_name, "up"])
            .await?;

        if self.config.nat_enabled {
            runner
                .run_checked("sysctl", &["-w", "net.ipv4.ip_forward=1"])
                .await?;
            let subnet_str = self.config.subnet.to_string();
            runner
                .run_checked(
                    "iptables",
                    &["-t", "nat", "-A", "POSTROUTING", "-s", &subnet_str, "-j", "MASQUERADE"],
                )
                .await?;
            runner
                .run_checked("iptables", &["-A", "FORWARD", "-i", bridge_name, "-j", "ACCEPT"])
                .await?;
            runner
                .run_checked("iptables", &["-A", "FORWARD", "-o", bridge_name, "-j", "ACCEPT"])
                .await?;
        }

        Ok(())
    }
}

/// Networking facade used by the executor (spec §4.4). Owns the singleton
/// [`HostBridge`] and the per-task [`NetworkAllocation`] table.
pub struct NetworkManager<R: CommandRunner> {
    runner: Arc<R>,
    bridge: HostBridge,
    allocations: RwLock<HashMap<TaskId, NetworkAllocation>>,
}

impl<R: CommandRunner> NetworkManager<R> {
    pub fn new(config: NetworkConfig, runner: Arc<R>) -> Self {
        if config.ip_mode == crate::config::IpMode::Dhcp {
            // recorded as an explicit deviation in DESIGN.md: only static
            // allocation is implemented.
            warn!("dhcp ip_mode configured but unsupported; falling back to static allocation");
        }
        Self {
            runner,
            bridge: HostBridge::new(config),
            allocations: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate a TAP, IPv4 and MAC for `task_id`, creating the host bridge
    /// first if this is the first call in the process (spec §4.4). A
    /// failure at any step after the IP is allocated — TAP creation,
    /// attaching it to the bridge, bringing it up, or applying the rate
    /// limit — releases every resource acquired so far (the IP and/or the
    /// TAP device) before returning, so invariant 3 (TAP name and IPv4
    /// uniqueness across live allocations) holds even under partial
    /// failure (spec §4.4, §5).
    pub async fn prepare_network(&self, task_id: &TaskId) -> Result<NetworkAllocation, NetworkError> {
        let allocator = self.bridge.ensure_initialized(self.runner.as_ref()).await?;

        {
            let existing = self.allocations.read().await.get(task_id).cloned();
            if let Some(allocation) = existing {
                debug!(task_id = %task_id, "prepare_network is idempotent, returning existing allocation");
                return Ok(allocation);
            }
        }

        let tap_name = derive_tap_name(task_id);
        {
            let existing_names: Vec<String> = self
                .allocations
                .read()
                .await
                .values()
                .map(|a| a.tap_name.clone())
                .collect();
            if existing_names.contains(&tap_name) {
                return Err(NetworkError::TapNameCollision);
            }
        }

        let mut release = ReleaseStack::new();
        let result = self.allocate_and_configure(task_id, &tap_name, &allocator, &mut release).await;

        match result {
            Ok(allocation) => {
                release.disarm();
                info!(task_id = %task_id, tap = %tap_name, ip = %allocation.ipv4, "network prepared");
                Ok(allocation)
            }
            Err(err) => {
                release.release_all().await;
                Err(err)
            }
        }
    }

    /// The fallible body of [`Self::prepare_network`] from IP allocation
    /// through recording the allocation. Every acquired resource is pushed
    /// onto `release` as it is acquired so the caller can unwind them on
    /// any `Err` return.
    async fn allocate_and_configure(
        &self,
        task_id: &TaskId,
        tap_name: &str,
        allocator: &Arc<Mutex<IpAllocator>>,
        release: &mut ReleaseStack,
    ) -> Result<NetworkAllocation, NetworkError> {
        let ipv4 = {
            let mut guard = allocator.lock().await;
            guard.allocate()?
        };
        {
            let allocator = Arc::clone(allocator);
            release.push("ip-allocation", async move {
                allocator.lock().await.release(ipv4);
            });
        }

        let mac = derive_mac(ipv4);

        self.runner
            .run_checked("ip", &["tuntap", "add", "dev", tap_name, "mode", "tap"])
            .await
            .map_err(NetworkError::from)?;
        {
            let runner = Arc::clone(&self.runner);
            let tap = tap_name.to_owned();
            release.push("tap-device", async move {
                let _ = runner.run("ip", &["link", "delete", &tap]).await;
            });
        }

        self.runner
            .run_checked("ip", &["link", "set", tap_name, "master", &self.bridge.config.bridge_name])
            .await
            .map_err(NetworkError::from)?;
        self.runner
            .run_checked("ip", &["link", "set", tap_name, "up"])
            .await
            .map_err(NetworkError::from)?;

        if self.bridge.config.enable_rate_limit {
            if let Some(pps) = self.bridge.config.max_packets_per_sec {
                self.runner
                    .run_checked("tc", &["qdisc", "add", "dev", tap_name, "root", "tbf", "rate", &format!("{pps}pps")])
                    .await
                    .map_err(NetworkError::from)?;
            }
        }

        let allocation = NetworkAllocation {
            tap_name: tap_name.to_owned(),
            ipv4,
            mac,
            bridge_name: self.bridge.config.bridge_name.clone(),
        };

        self.allocations.write().await.insert(task_id.clone(), allocation.clone());
        Ok(allocation)
    }

    /// Tear down the TAP and release the IP for `task_id`. Idempotent:
    /// cleanup of an unknown task id succeeds (spec §4.4).
    pub async fn cleanup_network(&self, task_id: &TaskId) -> Result<(), NetworkError> {
        let allocation = self.allocations.write().await.remove(task_id);
        let Some(allocation) = allocation else {
            debug!(task_id = %task_id, "cleanup_network on unknown task id, treating as success");
            return Ok(());
        };

        let _ = self
            .runner
            .run("ip", &["link", "delete", &allocation.tap_name])
            .await;

        if let Some(allocator) = self.bridge.allocator.get() {
            allocator.lock().await.release(allocation.ipv4);
        }

        info!(task_id = %task_id, tap = %allocation.tap_name, "network cleaned up");
        Ok(())
    }

    /// Return the full allocation record for `task_id`, if one exists.
    pub async fn allocation(&self, task_id: &TaskId) -> Option<NetworkAllocation> {
        self.allocations.read().await.get(task_id).cloned()
    }

    /// Return the allocated IPv4 for `task_id` as a string (spec §4.4).
    pub async fn get_tap_ip(&self, task_id: &TaskId) -> Result<String, NetworkError> {
        self.allocations
            .read()
            .await
            .get(task_id)
            .map(|a| a.ipv4.to_string())
            .ok_or_else(|| NetworkError::NotFound(task_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::capability::CommandOutput;
    use crate::config::IpMode;

    struct FakeCommandRunner {
        calls: StdMutex<Vec<String>>,
        bridge_exists: bool,
        /// When set, any `ip` invocation whose args contain this token fails.
        fail_on_arg: Option<&'static str>,
    }

    impl FakeCommandRunner {
        fn new(bridge_exists: bool) -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                bridge_exists,
                fail_on_arg: None,
            }
        }

        fn failing_on(bridge_exists: bool, fail_on_arg: &'static str) -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                bridge_exists,
                fail_on_arg: Some(fail_on_arg),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for FakeCommandRunner {
        async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, std::io::Error> {
            self.calls.lock().unwrap().push(format!("{program} {}", args.join(" ")));
            if program == "ip" && args.first() == Some(&"link") && args.get(1) == Some(&"show") {
                return Ok(CommandOutput {
                    status_code: if self.bridge_exists { Some(0) } else { Some(1) },
                    stdout: b"UP".to_vec(),
                    stderr: Vec::new(),
                });
            }
            if let Some(token) = self.fail_on_arg {
                if args.contains(&token) {
                    return Ok(CommandOutput {
                        status_code: Some(1),
                        stdout: Vec::new(),
                        stderr: b"simulated failure".to_vec(),
                    });
                }
            }
            Ok(CommandOutput {
                status_code: Some(0),
                stdout: Vec::new(),
                stderr: Vec::new(),
            })
        }
    }

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            bridge_name: "br-fc0".into(),
            bridge_ip: "192.168.127.1".parse().unwrap(),
            subnet: cidr::Ipv4Cidr::from_str("192.168.127.0/24").unwrap(),
            nat_enabled: true,
            enable_rate_limit: false,
            max_packets_per_sec: None,
            ip_mode: IpMode::Static,
        }
    }

    #[tokio::test]
    async fn prepare_network_allocates_tap_ip_and_mac() {
        let runner = Arc::new(FakeCommandRunner::new(false));
        let manager = NetworkManager::new(test_config(), runner);
        let task_id = TaskId::new("t1");

        let allocation = manager.prepare_network(&task_id).await.unwrap();
        assert_ne!(allocation.ipv4, Ipv4Addr::new(192, 168, 127, 1));
        assert_ne!(allocation.ipv4, Ipv4Addr::new(192, 168, 127, 255));
        assert!(allocation.tap_name.starts_with("tap"));
        assert!(allocation.tap_name.len() <= MAX_TAP_NAME_LEN);

        let ip_str = manager.get_tap_ip(&task_id).await.unwrap();
        assert_eq!(ip_str, allocation.ipv4.to_string());
    }

    #[tokio::test]
    async fn prepare_network_is_idempotent() {
        let runner = Arc::new(FakeCommandRunner::new(false));
        let manager = NetworkManager::new(test_config(), runner);
        let task_id = TaskId::new("t1");

        let first = manager.prepare_network(&task_id).await.unwrap();
        let second = manager.prepare_network(&task_id).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cleanup_network_on_unknown_task_succeeds() {
        let runner = Arc::new(FakeCommandRunner::new(false));
        let manager = NetworkManager::new(test_config(), runner);
        manager.cleanup_network(&TaskId::new("ghost")).await.unwrap();
    }

    #[tokio::test]
    async fn cleanup_releases_ip_for_reuse() {
        let runner = Arc::new(FakeCommandRunner::new(false));
        let manager = NetworkManager::new(test_config(), runner);
        let task_id = TaskId::new("t1");

        let allocation = manager.prepare_network(&task_id).await.unwrap();
        manager.cleanup_network(&task_id).await.unwrap();
        assert!(manager.get_tap_ip(&task_id).await.is_err());

        let second_task = TaskId::new("t2-different-id");
        let second_allocation = manager.prepare_network(&second_task).await.unwrap();
        assert_eq!(second_allocation.ipv4, allocation.ipv4);
    }

    #[test]
    fn derive_tap_name_is_within_kernel_interface_limit() {
        let long_id = TaskId::new("a-very-long-task-identifier-that-exceeds-fifteen-characters");
        let name = derive_tap_name(&long_id);
        assert!(name.len() <= MAX_TAP_NAME_LEN);
        assert!(name.starts_with("tap"));
    }

    #[test]
    fn derive_tap_name_is_deterministic() {
        let id = TaskId::new("t1");
        assert_eq!(derive_tap_name(&id), derive_tap_name(&id));
    }

    #[tokio::test]
    async fn a_failure_after_ip_and_tap_are_allocated_releases_both() {
        // A /30 subnet has exactly 2 usable addresses (spec §8 boundary
        // behavior). "master" is the `ip link set <tap> master <bridge>`
        // step, which runs after both the IP and the TAP device are
        // allocated, so every one of these calls fails there. If the
        // failure path didn't release the IP, the pool would exhaust after
        // 2 calls and the 3rd+ would fail with `IpExhausted` instead of the
        // simulated `CommandFailed`.
        let mut config = test_config();
        config.subnet = cidr::Ipv4Cidr::from_str("10.0.0.0/30").unwrap();
        config.bridge_ip = "10.0.0.1".parse().unwrap();

        let runner = Arc::new(FakeCommandRunner::failing_on(false, "master"));
        let manager = NetworkManager::new(config, runner);

        for i in 0..5 {
            let task_id = TaskId::new(format!("t{i}"));
            let err = manager.prepare_network(&task_id).await.unwrap_err();
            assert!(matches!(err, NetworkError::CommandFailed(_)), "call {i} got {err:?} instead");
            assert!(manager.allocation(&task_id).await.is_none());
        }
    }
}
