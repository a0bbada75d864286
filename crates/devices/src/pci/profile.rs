//! Canonical device profiles.
//!
//! A profile is the full binding-visible identity of one function: ids,
//! class, BAR layout and capability list. Profiles are compared structurally
//! by the contract differ, so any field change here is by definition a
//! guest-visible change.

use super::{PciBarDefinition, PciBdf, PciCapability, PciClassCode, VirtioCfgType};

pub const VIRTIO_VENDOR_ID: u16 = 0x1AF4;
/// Red Hat subsystem vendor id used by virtio devices.
pub const VIRTIO_SUBSYSTEM_VENDOR_ID: u16 = 0x1AF4;

pub const AEROGPU_VENDOR_ID: u16 = 0xA0A0;
pub const AEROGPU_DEVICE_ID: u16 = 0x0001;

/// Well-known slots. Guest driver installation matches on these, so they are
/// frozen.
pub const VIRTIO_NET_BDF: PciBdf = PciBdf::new(0, 3, 0);
pub const VIRTIO_BLK_BDF: PciBdf = PciBdf::new(0, 4, 0);
pub const VIRTIO_INPUT_KEYBOARD_BDF: PciBdf = PciBdf::new(0, 5, 0);
pub const VIRTIO_INPUT_MOUSE_BDF: PciBdf = PciBdf::new(0, 5, 1);
pub const VIRTIO_SND_BDF: PciBdf = PciBdf::new(0, 6, 0);
pub const AEROGPU_BDF: PciBdf = PciBdf::new(0, 7, 0);

/// How a paravirtual device is surfaced to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VirtioTransportMode {
    /// Modern (virtio 1.x) MMIO transport with the vendor capability chain.
    Modern,
    /// Transitional device with legacy I/O BAR transport.
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PciDeviceProfile {
    pub name: &'static str,
    pub bdf: PciBdf,
    pub vendor_id: u16,
    pub device_id: u16,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub revision_id: u8,
    pub class: PciClassCode,
    pub multi_function: bool,
    pub bars: Vec<PciBarDefinition>,
    pub capabilities: Vec<PciCapability>,
    /// `None` for non-virtio devices.
    pub transport: Option<VirtioTransportMode>,
}

impl PciDeviceProfile {
    /// Config-space header type byte (type 0, plus the multi-function bit).
    pub fn header_type(&self) -> u8 {
        if self.multi_function {
            0x80
        } else {
            0x00
        }
    }
}

/// Modern virtio vendor capability chain at fixed config-space offsets,
/// followed by MSI-X. The BAR0 window splits: common 0x0000, ISR 0x1000,
/// device cfg 0x2000, notify 0x3000.
fn modern_virtio_capabilities(msix_table_size: u16) -> Vec<PciCapability> {
    vec![
        PciCapability::VirtioVendor {
            cap_offset: 0x40,
            cfg_type: VirtioCfgType::CommonCfg,
            bar: 0,
            bar_offset: 0x0000,
            bar_len: 0x38,
            notify_off_multiplier: None,
        },
        PciCapability::VirtioVendor {
            cap_offset: 0x50,
            cfg_type: VirtioCfgType::NotifyCfg,
            bar: 0,
            bar_offset: 0x3000,
            bar_len: 0x1000,
            notify_off_multiplier: Some(4),
        },
        PciCapability::VirtioVendor {
            cap_offset: 0x64,
            cfg_type: VirtioCfgType::IsrCfg,
            bar: 0,
            bar_offset: 0x1000,
            bar_len: 0x20,
            notify_off_multiplier: None,
        },
        PciCapability::VirtioVendor {
            cap_offset: 0x74,
            cfg_type: VirtioCfgType::DeviceCfg,
            bar: 0,
            bar_offset: 0x2000,
            bar_len: 0x1000,
            notify_off_multiplier: None,
        },
        PciCapability::MsiX {
            cap_offset: 0x84,
            table_size: msix_table_size,
            table_bar: 1,
            table_offset: 0,
            pba_bar: 1,
            pba_offset: 0x800,
        },
    ]
}

fn modern_virtio_bars() -> Vec<PciBarDefinition> {
    vec![
        PciBarDefinition::Mmio64 { size: 0x4000, prefetchable: false },
        // MSI-X table + PBA.
        PciBarDefinition::Mmio32 { size: 0x1000, prefetchable: false },
    ]
}

fn legacy_virtio_bars() -> Vec<PciBarDefinition> {
    vec![PciBarDefinition::Io { size: 0x100 }]
}

struct VirtioIdentity {
    name: &'static str,
    bdf: PciBdf,
    modern_device_id: u16,
    transitional_device_id: u16,
    /// Virtio device type, exposed as the subsystem id.
    device_type: u16,
    class: PciClassCode,
    multi_function: bool,
    msix_table_size: u16,
}

fn virtio_profile(id: VirtioIdentity, mode: VirtioTransportMode) -> PciDeviceProfile {
    let (device_id, revision_id, bars, capabilities) = match mode {
        VirtioTransportMode::Modern => (
            id.modern_device_id,
            1,
            modern_virtio_bars(),
            modern_virtio_capabilities(id.msix_table_size),
        ),
        VirtioTransportMode::Legacy => {
            (id.transitional_device_id, 0, legacy_virtio_bars(), Vec::new())
        }
    };
    PciDeviceProfile {
        name: id.name,
        bdf: id.bdf,
        vendor_id: VIRTIO_VENDOR_ID,
        device_id,
        subsystem_vendor_id: VIRTIO_SUBSYSTEM_VENDOR_ID,
        subsystem_id: id.device_type,
        revision_id,
        class: id.class,
        multi_function: id.multi_function,
        bars,
        capabilities,
        transport: Some(mode),
    }
}

pub fn virtio_net(mode: VirtioTransportMode) -> PciDeviceProfile {
    virtio_profile(
        VirtioIdentity {
            name: "virtio-net",
            bdf: VIRTIO_NET_BDF,
            modern_device_id: 0x1041,
            transitional_device_id: 0x1000,
            device_type: 1,
            class: PciClassCode::new(0x02, 0x00, 0x00),
            multi_function: false,
            msix_table_size: 3,
        },
        mode,
    )
}

pub fn virtio_blk(mode: VirtioTransportMode) -> PciDeviceProfile {
    virtio_profile(
        VirtioIdentity {
            name: "virtio-blk",
            bdf: VIRTIO_BLK_BDF,
            modern_device_id: 0x1042,
            transitional_device_id: 0x1001,
            device_type: 2,
            class: PciClassCode::new(0x01, 0x00, 0x00),
            multi_function: false,
            msix_table_size: 2,
        },
        mode,
    )
}

/// Keyboard and mouse share slot 5; the slot is multi-function so the guest
/// enumerates both.
pub fn virtio_input_keyboard(mode: VirtioTransportMode) -> PciDeviceProfile {
    virtio_profile(
        VirtioIdentity {
            name: "virtio-input-keyboard",
            bdf: VIRTIO_INPUT_KEYBOARD_BDF,
            modern_device_id: 0x1052,
            transitional_device_id: 0x1052,
            device_type: 18,
            class: PciClassCode::new(0x09, 0x80, 0x00),
            multi_function: true,
            msix_table_size: 2,
        },
        mode,
    )
}

pub fn virtio_input_mouse(mode: VirtioTransportMode) -> PciDeviceProfile {
    virtio_profile(
        VirtioIdentity {
            name: "virtio-input-mouse",
            bdf: VIRTIO_INPUT_MOUSE_BDF,
            modern_device_id: 0x1052,
            transitional_device_id: 0x1052,
            device_type: 18,
            class: PciClassCode::new(0x09, 0x80, 0x00),
            multi_function: true,
            msix_table_size: 2,
        },
        mode,
    )
}

pub fn virtio_snd(mode: VirtioTransportMode) -> PciDeviceProfile {
    virtio_profile(
        VirtioIdentity {
            name: "virtio-snd",
            bdf: VIRTIO_SND_BDF,
            modern_device_id: 0x1059,
            transitional_device_id: 0x1059,
            device_type: 25,
            class: PciClassCode::new(0x04, 0x01, 0x00),
            multi_function: false,
            msix_table_size: 4,
        },
        mode,
    )
}

/// The paravirtual display adapter. BAR1 maps VRAM, so its size follows the
/// configured VRAM allocation.
pub fn aerogpu(vram_bytes: u64) -> PciDeviceProfile {
    PciDeviceProfile {
        name: "aerogpu",
        bdf: AEROGPU_BDF,
        vendor_id: AEROGPU_VENDOR_ID,
        device_id: AEROGPU_DEVICE_ID,
        subsystem_vendor_id: AEROGPU_VENDOR_ID,
        subsystem_id: AEROGPU_DEVICE_ID,
        revision_id: 1,
        class: PciClassCode::new(0x03, 0x00, 0x00),
        multi_function: false,
        bars: vec![
            PciBarDefinition::Mmio64 { size: 0x1_0000, prefetchable: false },
            PciBarDefinition::Mmio64 { size: vram_bytes, prefetchable: true },
        ],
        capabilities: vec![PciCapability::MsiX {
            cap_offset: 0x40,
            table_size: 2,
            table_bar: 0,
            table_offset: 0x8000,
            pba_bar: 0,
            pba_offset: 0x8800,
        }],
        transport: None,
    }
}
