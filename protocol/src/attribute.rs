//! Writable attributes exposed by the tag's control service.

use std::collections::HashSet;
use uuid::Uuid;

/// Control service exposing all configuration attributes.
pub const CONTROL_SERVICE: Uuid = Uuid::from_u128(0x5cfc_e313_a7e3_45c3_933d_418b_8100_da7f);

/// Builds an attribute UUID of the form `8c5debXX-ad8d-4810-a31f-53862e79ee77`.
const fn attribute_uuid(id: u8) -> Uuid {
    Uuid::from_u128(0x8c5d_eb00_ad8d_4810_a31f_5386_2e79_ee77 | (id as u128) << 96)
}

/// Identifier of a writable device attribute.
///
/// [`AttributeId::NewPassword`] is an alias of [`AttributeId::Password`]:
/// both resolve to the same UUID. Writing the password first unlocks the
/// device; writing it again later replaces it.
#[derive(strum::Display, PartialEq, Eq, Hash, Copy, Clone, Debug)]
#[strum(serialize_all = "kebab-case")]
pub enum AttributeId {
    /// Authentication password (8 ASCII bytes).
    Password,
    /// Replacement password, written to the password attribute.
    NewPassword,
    /// Transmit power (0 = low, 1 = normal, 2 = max).
    TxPower,
    /// Enables Apple Find My (AirTag) broadcasts.
    BroadcastAirtag,
    /// Enables Google Find My Device Network broadcasts.
    BroadcastFmdn,
    /// Public key file, written as a sequence of 14-byte chunks.
    Keyfile,
    /// Status byte behavior.
    Status,
    /// Interval between key rotations in seconds.
    KeyInterval,
    /// Movement detection threshold (0 disables the accelerometer).
    AccelThreshold,
    /// Broadcast period multiplier.
    BroadcastPeriod,
    /// FMDN key.
    FmdnKey,
    /// Address advertised in settings mode.
    ConfigMac,
}

impl AttributeId {
    /// Returns the UUID of the characteristic backing this attribute.
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::Password | Self::NewPassword => attribute_uuid(0xdf),
            Self::TxPower => attribute_uuid(0xe1),
            Self::BroadcastAirtag => attribute_uuid(0xdc),
            Self::BroadcastFmdn => attribute_uuid(0xdb),
            Self::Keyfile => attribute_uuid(0xde),
            Self::Status => attribute_uuid(0xe5),
            Self::KeyInterval => attribute_uuid(0xe0),
            Self::AccelThreshold => attribute_uuid(0xe6),
            Self::BroadcastPeriod => attribute_uuid(0xdd),
            Self::FmdnKey => attribute_uuid(0xe2),
            Self::ConfigMac => attribute_uuid(0xe4),
        }
    }
}

/// Attributes discovered on a connected peer.
#[derive(PartialEq, Eq, Clone, Default, Debug)]
pub struct AttributeTable(HashSet<Uuid>);

impl AttributeTable {
    /// Returns whether the peer exposes the given attribute.
    #[must_use]
    pub fn contains(&self, attribute: AttributeId) -> bool {
        self.0.contains(&attribute.uuid())
    }

    /// Returns the number of discovered attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether no attributes were discovered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Uuid> for AttributeTable {
    fn from_iter<I: IntoIterator<Item = Uuid>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromIterator<AttributeId> for AttributeTable {
    fn from_iter<I: IntoIterator<Item = AttributeId>>(iter: I) -> Self {
        Self(iter.into_iter().map(AttributeId::uuid).collect())
    }
}
