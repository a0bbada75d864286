use aero_protocol::scanout::{SCANOUT_SOURCE_AEROGPU, SCANOUT_SOURCE_LEGACY};
use aero_shared::scanout::ScanoutSource;

// The shared header is read by the presenter using the protocol constants;
// the enum must stay in lockstep with them.
#[test]
fn scanout_enum_matches_wire_values() {
    assert_eq!(ScanoutSource::Legacy.to_u32(), SCANOUT_SOURCE_LEGACY);
    assert_eq!(ScanoutSource::AeroGpu.to_u32(), SCANOUT_SOURCE_AEROGPU);
    assert_eq!(ScanoutSource::from_u32(SCANOUT_SOURCE_LEGACY), Some(ScanoutSource::Legacy));
    assert_eq!(ScanoutSource::from_u32(SCANOUT_SOURCE_AEROGPU), Some(ScanoutSource::AeroGpu));
    assert_eq!(ScanoutSource::from_u32(7), None);
}
