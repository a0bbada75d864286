//! Static device model surface exposed to the guest.
//!
//! Guest drivers bind against PCI identity, so everything in here is
//! deliberately boring: pure data, fixed at VM start, compared structurally.

pub mod pci;
