//! Pure translation from a [`Task`] to hypervisor configuration (spec
//! §4.2). No I/O, no allocation of external resources: the same task (plus
//! the network/rootfs facts Prepare already established) always yields the
//! same [`VmmConfig`].

use thiserror::Error;

use crate::config::{ExecutorConfig, InitSystem};
use crate::task::{ContainerRuntimeSpec, Task, TaskRuntime};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranslationError {
    #[error("task requests {requested} vCPUs, exceeding host limit of {limit}")]
    VcpusExceedHostLimit { requested: u32, limit: u32 },
    #[error("task requests {requested} MiB memory, exceeding host limit of {limit} MiB")]
    MemoryExceedsHostLimit { requested: u64, limit: u64 },
    #[error("task requires networking but declares no network attachments")]
    NoNetworkAttachments,
    #[error("task's image reference is empty")]
    EmptyImageReference,
}

/// A single boot drive. Only the root drive is modeled (spec §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveConfig {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

/// One guest network interface, bound to a host TAP by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterfaceConfig {
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSourceConfig {
    pub kernel_image_path: String,
    pub initrd_path: Option<String>,
    pub boot_args: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u64,
    pub smt: bool,
}

/// The full hypervisor configuration produced by [`Translator::translate`],
/// ready to be sent over the control socket by the VMM manager in the order
/// boot-source, machine-config, drives, network-interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmmConfig {
    pub boot_source: BootSourceConfig,
    pub machine_config: MachineConfig,
    pub drive: DriveConfig,
    pub network_interfaces: Vec<NetworkInterfaceConfig>,
}

/// Per-task facts established by Prepare that the translator needs but does
/// not itself produce: the rootfs path from `ImagePreparer` and, per network
/// attachment, the allocated TAP name and MAC from `NetworkManager`.
#[derive(Debug, Clone)]
pub struct PreparedResources {
    pub rootfs_path: String,
    pub network_interfaces: Vec<PreparedNetworkInterface>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedNetworkInterface {
    pub network_id: String,
    pub tap_name: String,
    pub mac: String,
}

pub struct Translator<'a> {
    config: &'a ExecutorConfig,
}

impl<'a> Translator<'a> {
    pub fn new(config: &'a ExecutorConfig) -> Self {
        Self { config }
    }

    /// Translate `task` into a [`VmmConfig`], given the resources Prepare
    /// already established. Deterministic: the same `(task, resources)`
    /// always yields the same `VmmConfig` (spec §8 invariant 5).
    pub fn translate(&self, task: &Task, resources: &PreparedResources) -> Result<VmmConfig, TranslationError> {
        let vcpu_count = self.vcpu_count(task)?;
        let mem_size_mib = self.mem_size_mib(task)?;

        if task.networks.is_empty() {
            return Err(TranslationError::NoNetworkAttachments);
        }
        if resources.network_interfaces.len() != task.networks.len() {
            return Err(TranslationError::NoNetworkAttachments);
        }

        let TaskRuntime::Container(ref spec) = task.runtime;
        if spec.image.trim().is_empty() {
            return Err(TranslationError::EmptyImageReference);
        }

        let boot_source = self.boot_source(spec);
        let machine_config = MachineConfig {
            vcpu_count,
            mem_size_mib,
            smt: false,
        };
        let drive = DriveConfig {
            drive_id: "rootfs".to_owned(),
            path_on_host: resources.rootfs_path.clone(),
            is_root_device: true,
            is_read_only: false,
        };
        let network_interfaces = resources
            .network_interfaces
            .iter()
            .enumerate()
            .map(|(i, iface)| NetworkInterfaceConfig {
                iface_id: format!("eth{i}"),
                host_dev_name: iface.tap_name.clone(),
                guest_mac: iface.mac.clone(),
            })
            .collect();

        Ok(VmmConfig {
            boot_source,
            machine_config,
            drive,
            network_interfaces,
        })
    }

    fn vcpu_count(&self, task: &Task) -> Result<u32, TranslationError> {
        let vcpus = if task.resources.nano_cpus == 0 {
            self.config.default_vcpus
        } else {
            // Round up to an integer vCPU count; 1 vCPU == 1_000_000_000 nanoCPUs.
            let nano_cpus_per_vcpu = 1_000_000_000u64;
            let ceil_div = task.resources.nano_cpus.div_ceil(nano_cpus_per_vcpu);
            u32::try_from(ceil_div).unwrap_or(u32::MAX).max(1)
        };

        if vcpus > self.config.max_vcpus {
            return Err(TranslationError::VcpusExceedHostLimit {
                requested: vcpus,
                limit: self.config.max_vcpus,
            });
        }
        Ok(vcpus)
    }

    fn mem_size_mib(&self, task: &Task) -> Result<u64, TranslationError> {
        let mib = if task.resources.memory_bytes == 0 {
            self.config.default_memory_mb
        } else {
            (task.resources.memory_bytes / (1024 * 1024)).max(128)
        };

        if mib > self.config.max_memory_mb {
            return Err(TranslationError::MemoryExceedsHostLimit {
                requested: mib,
                limit: self.config.max_memory_mb,
            });
        }
        Ok(mib)
    }

    fn boot_source(&self, spec: &ContainerRuntimeSpec) -> BootSourceConfig {
        let mut boot_args = "console=ttyS0 reboot=k panic=1 pci=off".to_owned();

        match self.config.init_system.binary_name() {
            Some(init_name) => {
                boot_args.push_str(&format!(" -- /sbin/{init_name} -- "));
                boot_args.push_str(&command_line(spec));
            }
            None => {
                boot_args.push(' ');
                boot_args.push_str(&command_line(spec));
            }
        }

        BootSourceConfig {
            kernel_image_path: self.config.kernel_path.to_string_lossy().into_owned(),
            initrd_path: self
                .config
                .initrd_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            boot_args,
        }
    }
}

fn command_line(spec: &ContainerRuntimeSpec) -> String {
    spec.command.iter().chain(spec.args.iter()).cloned().collect::<Vec<_>>().join(" ")
}
