//! Scanout-state header shared with the presenter.
//!
//! Names which device currently drives the display. The supervisor resets
//! this to the legacy source on VM reset; the GPU worker claims the AeroGPU
//! source when the guest driver takes over scanout.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanoutSource {
    /// VGA/VBE-era scanout driven by the CPU worker.
    Legacy,
    /// AeroGPU scanout driven by the GPU worker.
    AeroGpu,
}

impl ScanoutSource {
    pub const fn to_u32(self) -> u32 {
        match self {
            Self::Legacy => 0,
            Self::AeroGpu => 1,
        }
    }

    pub const fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Legacy),
            1 => Some(Self::AeroGpu),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct ScanoutState {
    source: AtomicU32,
    width: AtomicU32,
    height: AtomicU32,
}

impl Default for ScanoutState {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanoutState {
    pub fn new() -> Self {
        Self {
            source: AtomicU32::new(ScanoutSource::Legacy.to_u32()),
            width: AtomicU32::new(0),
            height: AtomicU32::new(0),
        }
    }

    pub fn publish(&self, source: ScanoutSource, width: u32, height: u32) {
        self.width.store(width, Ordering::Release);
        self.height.store(height, Ordering::Release);
        self.source.store(source.to_u32(), Ordering::Release);
    }

    /// Unknown stored values read as the legacy source.
    pub fn source(&self) -> ScanoutSource {
        ScanoutSource::from_u32(self.source.load(Ordering::Acquire))
            .unwrap_or(ScanoutSource::Legacy)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width.load(Ordering::Acquire), self.height.load(Ordering::Acquire))
    }

    pub fn reset(&self) {
        self.publish(ScanoutSource::Legacy, 0, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_returns_to_legacy() {
        let state = ScanoutState::new();
        state.publish(ScanoutSource::AeroGpu, 1024, 768);
        assert_eq!(state.source(), ScanoutSource::AeroGpu);
        assert_eq!(state.dimensions(), (1024, 768));
        state.reset();
        assert_eq!(state.source(), ScanoutSource::Legacy);
        assert_eq!(state.dimensions(), (0, 0));
    }
}
