//! Classification of nearby advertisers.

use std::collections::HashMap;

/// Apple's Bluetooth company identifier.
pub const APPLE_COMPANY_ID: u16 = 0x004c;

/// Kind of advertising device.
#[derive(strum::Display, PartialEq, Eq, Copy, Clone, Debug)]
pub enum TagKind {
    /// Apple iBeacon.
    #[strum(serialize = "iBeacon")]
    IBeacon,
    /// Apple Find My accessory, e.g. an AirTag.
    #[strum(serialize = "AirTag")]
    AirTag,
    /// Any other connectable device.
    #[strum(serialize = "BLE")]
    Ble,
}

/// Classifies a device from its advertised manufacturer data.
///
/// `connectable` is `None` if the platform does not report it, in which case
/// the device is assumed to be connectable. Returns `None` for
/// non-connectable devices that are neither iBeacons nor Find My
/// accessories.
#[must_use]
pub fn classify(
    manufacturer_data: &HashMap<u16, Vec<u8>>,
    connectable: Option<bool>,
) -> Option<TagKind> {
    match manufacturer_data.get(&APPLE_COMPANY_ID).map(Vec::as_slice) {
        Some([0x02, 0x15, ..]) => Some(TagKind::IBeacon),
        Some([0x12, 0x19, ..]) => Some(TagKind::AirTag),
        _ if connectable.unwrap_or(true) => Some(TagKind::Ble),
        _ => None,
    }
}
