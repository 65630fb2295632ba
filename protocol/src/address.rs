//! Hardware address of the target tag.

use crate::codec::{self, parse_mac};
use core::{
    fmt::{Display, Formatter},
    str::FromStr,
};

/// A 6-byte Bluetooth device address.
///
/// The canonical textual form is colon-separated uppercase hex,
/// e.g. `AA:BB:CC:DD:EE:FF`. Bytes are stored in textual order.
#[derive(PartialEq, Eq, Hash, Copy, Clone, Debug)]
pub struct DeviceAddress([u8; 6]);

impl DeviceAddress {
    /// Constructs an address from bytes in textual order.
    #[must_use]
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Returns the address bytes in textual order.
    #[must_use]
    pub const fn bytes(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for DeviceAddress {
    type Err = codec::Error;

    /// Parses `AA:BB:CC:DD:EE:FF` or `AABBCCDDEEFF`, ignoring case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_mac(s).map(Self)
    }
}

impl Display for DeviceAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let [a, b, c, d, e, g] = self.0;

        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl From<[u8; 6]> for DeviceAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let addr: DeviceAddress = "aa:bb:cc:dd:ee:0f".parse().expect("address should parse");

        assert_eq!(
            addr.bytes(),
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0x0f],
            "bytes should keep textual order"
        );
        assert_eq!(
            addr.to_string(),
            "AA:BB:CC:DD:EE:0F",
            "display should be canonical"
        );
        assert_eq!(
            "AABBCCDDEE0F".parse::<DeviceAddress>(),
            Ok(addr),
            "bare form should parse to the same address"
        );
    }

    #[test]
    fn reject_invalid() {
        assert!("AA:BB".parse::<DeviceAddress>().is_err(), "short address");
        assert!(
            "GG:BB:CC:DD:EE:FF".parse::<DeviceAddress>().is_err(),
            "non-hex address"
        );
    }
}
