//! PCI surface types: addresses, BARs, capabilities, canonical profiles and
//! the per-VM device contract.

pub mod contract;
pub mod profile;

use bitflags::bitflags;

/// bus:device.function address on the root bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciBdf {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciBdf {
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self { bus, device, function }
    }
}

impl std::fmt::Display for PciBdf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// (base class, sub class, programming interface).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PciClassCode {
    pub base: u8,
    pub sub: u8,
    pub prog_if: u8,
}

impl PciClassCode {
    pub const fn new(base: u8, sub: u8, prog_if: u8) -> Self {
        Self { base, sub, prog_if }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PciBarDefinition {
    Io { size: u32 },
    Mmio32 { size: u32, prefetchable: bool },
    Mmio64 { size: u64, prefetchable: bool },
}

bitflags! {
    /// PCI command register bits the supervisor cares about when it reasons
    /// about a profile (decode enables and INTx masking).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PciCommand: u16 {
        const IO_SPACE = 1 << 0;
        const MEMORY_SPACE = 1 << 1;
        const BUS_MASTER = 1 << 2;
        const INTX_DISABLE = 1 << 10;
    }
}

/// Virtio modern-transport structure types (`cfg_type` in the
/// vendor-specific capability).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VirtioCfgType {
    CommonCfg,
    NotifyCfg,
    IsrCfg,
    DeviceCfg,
}

impl VirtioCfgType {
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::CommonCfg => 1,
            Self::NotifyCfg => 2,
            Self::IsrCfg => 3,
            Self::DeviceCfg => 4,
        }
    }
}

/// One entry of a profile's config-space capability list. `cap_offset` is
/// the fixed offset of the structure inside config space; guest drivers have
/// been observed to cache these, so they are part of the contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PciCapability {
    VirtioVendor {
        cap_offset: u8,
        cfg_type: VirtioCfgType,
        bar: u8,
        bar_offset: u32,
        bar_len: u32,
        /// Only present for the notify structure.
        notify_off_multiplier: Option<u32>,
    },
    MsiX {
        cap_offset: u8,
        table_size: u16,
        table_bar: u8,
        table_offset: u32,
        pba_bar: u8,
        pba_offset: u32,
    },
}

impl PciCapability {
    pub fn cap_offset(&self) -> u8 {
        match *self {
            Self::VirtioVendor { cap_offset, .. } | Self::MsiX { cap_offset, .. } => cap_offset,
        }
    }
}

/// The command-register value a guest writes to bring a paravirtual device
/// up: memory decode plus bus mastering, INTx left enabled.
pub fn enabled_command() -> PciCommand {
    PciCommand::MEMORY_SPACE | PciCommand::BUS_MASTER
}
