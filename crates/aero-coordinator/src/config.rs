//! VM configuration and the restart policy.
//!
//! Configs arrive from outside as untrusted JSON-ish records; ingress
//! converts them into this plain struct, so later comparisons only ever see
//! own fields with known types. The differ ranks a transition into the
//! cheapest sufficient action: full restart, ring-ownership re-evaluation,
//! or an in-place mutation that touches no worker.

use serde::Deserialize;

use aero_devices::pci::contract::{ContractConfig, DeviceContract};
use aero_devices::pci::profile::VirtioTransportMode;

use crate::messages::{DiskKind, DiskMount, RingOwner};
use crate::worker::WorkerEntrypoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmRuntime {
    Legacy,
    Machine,
}

impl VmRuntime {
    /// What an absent `vmRuntime` means. An explicit absent -> default
    /// transition is not a restart-worthy change.
    pub const DEFAULT: VmRuntime = VmRuntime::Machine;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Modern,
    Legacy,
}

impl TransportMode {
    fn to_virtio(self) -> VirtioTransportMode {
        match self {
            Self::Modern => VirtioTransportMode::Modern,
            Self::Legacy => VirtioTransportMode::Legacy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Boot-disk-derived device mode; drives which worker consumes the audio
/// rings by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmMode {
    /// Boots from a hard disk; the IO worker runs the audio device models.
    Modern,
    /// No boot hard disk (install/live media); the CPU worker's legacy
    /// device emulation consumes audio directly.
    Legacy,
}

impl VmMode {
    pub fn default_ring_owner(self) -> RingOwner {
        match self {
            Self::Modern => RingOwner::Io,
            Self::Legacy => RingOwner::Cpu,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VmConfig {
    pub vm_runtime: Option<VmRuntime>,
    pub guest_ram_bytes: u64,
    pub vram_bytes: u64,
    pub framebuffer_width: u32,
    pub framebuffer_height: u32,
    pub framebuffer_tile_size: u32,
    pub virtio_net_mode: TransportMode,
    pub virtio_input_mode: TransportMode,
    pub virtio_snd_mode: TransportMode,
    pub disk_mounts: Vec<DiskMount>,
    /// Index into `disk_mounts`.
    pub boot_hdd: Option<usize>,
    pub boot_cd: Option<usize>,
    pub log_level: LogLevel,
    pub proxy_url: Option<String>,
    /// Deprecated; accepted so old configs still parse, ignored everywhere.
    pub active_disk_image: Option<String>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            vm_runtime: None,
            guest_ram_bytes: 64 * 1024 * 1024,
            vram_bytes: 32 * 1024 * 1024,
            framebuffer_width: 1024,
            framebuffer_height: 768,
            framebuffer_tile_size: 64,
            virtio_net_mode: TransportMode::Modern,
            virtio_input_mode: TransportMode::Modern,
            virtio_snd_mode: TransportMode::Modern,
            disk_mounts: Vec::new(),
            boot_hdd: None,
            boot_cd: None,
            log_level: LogLevel::Info,
            proxy_url: None,
            active_disk_image: None,
        }
    }
}

impl VmConfig {
    /// Ingress for untrusted config records. Unknown fields are dropped
    /// here, so nothing inherited or injected survives into the struct.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn effective_runtime(&self) -> VmRuntime {
        self.vm_runtime.unwrap_or(VmRuntime::DEFAULT)
    }

    pub fn cpu_entrypoint(&self) -> WorkerEntrypoint {
        match self.effective_runtime() {
            VmRuntime::Legacy => WorkerEntrypoint::CpuLegacy,
            VmRuntime::Machine => WorkerEntrypoint::CpuMachine,
        }
    }

    pub fn contract_config(&self) -> ContractConfig {
        ContractConfig {
            net_transport: self.virtio_net_mode.to_virtio(),
            input_transport: self.virtio_input_mode.to_virtio(),
            sound_transport: self.virtio_snd_mode.to_virtio(),
            vram_bytes: self.vram_bytes,
        }
    }

    /// Boot-disk-derived mode: a bootable hard disk means the modern device
    /// stack, otherwise the legacy path.
    pub fn vm_mode(&self) -> VmMode {
        let boots_from_hdd = self
            .boot_hdd
            .and_then(|idx| self.disk_mounts.get(idx))
            .map(|mount| mount.kind == DiskKind::Hdd)
            .unwrap_or(false);
        if boots_from_hdd {
            VmMode::Modern
        } else {
            VmMode::Legacy
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    VmRuntimeChanged,
    DeviceContractChanged,
    SharedMemoryLayoutChanged,
}

impl std::fmt::Display for RestartReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VmRuntimeChanged => f.write_str("vm runtime changed"),
            Self::DeviceContractChanged => f.write_str("device contract changed"),
            Self::SharedMemoryLayoutChanged => f.write_str("shared memory layout changed"),
        }
    }
}

/// Minimum-impact action for a config transition. Rules are ordered; the
/// first hit wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
    FullRestart(RestartReason),
    ReevaluateRingRouting,
    MutateInPlace,
}

pub fn plan_config_update(prev: &VmConfig, next: &VmConfig) -> ConfigAction {
    if prev.effective_runtime() != next.effective_runtime() {
        return ConfigAction::FullRestart(RestartReason::VmRuntimeChanged);
    }
    if !DeviceContract::is_stable_across(&prev.contract_config(), &next.contract_config()) {
        return ConfigAction::FullRestart(RestartReason::DeviceContractChanged);
    }
    if prev.guest_ram_bytes != next.guest_ram_bytes
        || (prev.framebuffer_width, prev.framebuffer_height, prev.framebuffer_tile_size)
            != (next.framebuffer_width, next.framebuffer_height, next.framebuffer_tile_size)
    {
        return ConfigAction::FullRestart(RestartReason::SharedMemoryLayoutChanged);
    }
    if prev.vm_mode() != next.vm_mode() {
        return ConfigAction::ReevaluateRingRouting;
    }
    ConfigAction::MutateInPlace
}
