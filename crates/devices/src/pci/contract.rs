//! The per-VM device contract: the ordered device list compiled from config
//! at start, and the structural diff the restart policy consumes.
//!
//! The contract is immutable for the lifetime of a VM instance. The differ
//! never mutates anything; it only classifies what *would* change, so the
//! supervisor can decide between mutating config in place and restarting the
//! whole VM.

use std::collections::BTreeSet;

use super::profile::{
    aerogpu, virtio_blk, virtio_input_keyboard, virtio_input_mouse, virtio_net, virtio_snd,
    PciDeviceProfile, VirtioTransportMode,
};
use super::PciBdf;

/// The slice of VM config the contract depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractConfig {
    pub net_transport: VirtioTransportMode,
    pub input_transport: VirtioTransportMode,
    pub sound_transport: VirtioTransportMode,
    pub vram_bytes: u64,
}

/// Classes of binding-visible change between two contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContractChange {
    /// A device appeared or disappeared.
    DeviceSet,
    /// Vendor/device/subsystem/revision/class/header changed for a device.
    PciIdentity,
    /// BAR count, type or size changed (VRAM resize lands here).
    BarLayout,
    /// Capability list layout changed.
    CapabilityLayout,
    /// A device moved between modern and legacy transport.
    TransportMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceContract {
    devices: Vec<PciDeviceProfile>,
}

impl DeviceContract {
    /// Compiles the ordered device list. Order is enumeration order and part
    /// of the contract.
    pub fn build(cfg: &ContractConfig) -> Self {
        let devices = vec![
            virtio_net(cfg.net_transport),
            virtio_blk(VirtioTransportMode::Modern),
            virtio_input_keyboard(cfg.input_transport),
            virtio_input_mouse(cfg.input_transport),
            virtio_snd(cfg.sound_transport),
            aerogpu(cfg.vram_bytes),
        ];
        Self { devices }
    }

    pub fn devices(&self) -> &[PciDeviceProfile] {
        &self.devices
    }

    pub fn device_at(&self, bdf: PciBdf) -> Option<&PciDeviceProfile> {
        self.devices.iter().find(|d| d.bdf == bdf)
    }

    /// Structural diff, classified. Empty means the contracts are identical.
    pub fn diff(prev: &Self, next: &Self) -> BTreeSet<ContractChange> {
        let mut changes = BTreeSet::new();

        let prev_bdfs: BTreeSet<PciBdf> = prev.devices.iter().map(|d| d.bdf).collect();
        let next_bdfs: BTreeSet<PciBdf> = next.devices.iter().map(|d| d.bdf).collect();
        if prev_bdfs != next_bdfs {
            changes.insert(ContractChange::DeviceSet);
        }

        for p in &prev.devices {
            let Some(n) = next.device_at(p.bdf) else {
                continue;
            };
            if (p.vendor_id, p.device_id, p.subsystem_vendor_id, p.subsystem_id)
                != (n.vendor_id, n.device_id, n.subsystem_vendor_id, n.subsystem_id)
                || p.revision_id != n.revision_id
                || p.class != n.class
                || p.header_type() != n.header_type()
            {
                changes.insert(ContractChange::PciIdentity);
            }
            if p.bars != n.bars {
                changes.insert(ContractChange::BarLayout);
            }
            if p.capabilities != n.capabilities {
                changes.insert(ContractChange::CapabilityLayout);
            }
            if p.transport != n.transport {
                changes.insert(ContractChange::TransportMode);
            }
        }

        changes
    }

    /// True when a config transition keeps every binding-visible field
    /// intact.
    pub fn is_stable_across(prev: &ContractConfig, next: &ContractConfig) -> bool {
        Self::diff(&Self::build(prev), &Self::build(next)).is_empty()
    }
}
