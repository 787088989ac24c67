//! Bluetooth UUIDs for the vendor smart-blind protocol.
//!
//! All vendor characteristics share the `-1212-efde-1600-785feabcd123`
//! suffix and differ only in the 32-bit prefix.

use uuid::{Uuid, uuid};

// --- Vendor characteristic UUIDs ---

/// Command acknowledgement characteristic.
pub const ACK: Uuid = uuid!("00001503-1212-efde-1600-785feabcd123");

/// Blind angle characteristic (u8 in [0, 200], notify + write).
pub const ANGLE: Uuid = uuid!("00001403-1212-efde-1600-785feabcd123");

/// Motor calibration characteristic.
pub const CALIBRATION: Uuid = uuid!("0000140a-1212-efde-1600-785feabcd123");

/// Device name characteristic.
pub const NAME: Uuid = uuid!("00001401-1212-efde-1600-785feabcd123");

/// Passkey characteristic used by the unlock handshake.
pub const PASSKEY: Uuid = uuid!("00001409-1212-efde-1600-785feabcd123");

/// Raw serial tunnel characteristic.
pub const RX_TX: Uuid = uuid!("00001407-1212-efde-1600-785feabcd123");

/// Movement schedule characteristic.
pub const SCHEDULE: Uuid = uuid!("00001501-1212-efde-1600-785feabcd123");

/// Sensor payload characteristic (battery, temperatures, illuminance).
pub const SENSORS: Uuid = uuid!("00001651-1212-efde-1600-785feabcd123");

/// Status bitfield characteristic (u32 LE).
pub const STATUS: Uuid = uuid!("00001402-1212-efde-1600-785feabcd123");

/// Wall-clock time characteristic.
pub const TIME: Uuid = uuid!("00001405-1212-efde-1600-785feabcd123");

/// Firmware/hardware version characteristic.
pub const VERSION_INFO: Uuid = uuid!("00001404-1212-efde-1600-785feabcd123");

/// The named characteristic slots a blind exposes.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new slots
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CharacteristicSlot {
    /// Command acknowledgement.
    Ack,
    /// Blind angle.
    Angle,
    /// Device name.
    Name,
    /// Unlock passkey.
    Passkey,
    /// Sensor payload.
    Sensors,
    /// Status bitfield.
    Status,
    /// Firmware/hardware version.
    VersionInfo,
}

impl CharacteristicSlot {
    /// The slots a blind device binds on connect, in binding order.
    pub const BOUND: [CharacteristicSlot; 7] = [
        CharacteristicSlot::Ack,
        CharacteristicSlot::Angle,
        CharacteristicSlot::Name,
        CharacteristicSlot::Passkey,
        CharacteristicSlot::Sensors,
        CharacteristicSlot::Status,
        CharacteristicSlot::VersionInfo,
    ];

    /// The slots that carry a live notification subscription.
    pub const NOTIFIED: [CharacteristicSlot; 4] = [
        CharacteristicSlot::Angle,
        CharacteristicSlot::Passkey,
        CharacteristicSlot::Sensors,
        CharacteristicSlot::Status,
    ];

    /// The UUID this slot matches against during characteristic discovery.
    pub fn uuid(&self) -> Uuid {
        match self {
            CharacteristicSlot::Ack => ACK,
            CharacteristicSlot::Angle => ANGLE,
            CharacteristicSlot::Name => NAME,
            CharacteristicSlot::Passkey => PASSKEY,
            CharacteristicSlot::Sensors => SENSORS,
            CharacteristicSlot::Status => STATUS,
            CharacteristicSlot::VersionInfo => VERSION_INFO,
        }
    }

    /// Match a discovered characteristic UUID to a slot, if it is one we bind.
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::BOUND.into_iter().find(|slot| slot.uuid() == uuid)
    }

    /// Short lowercase name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            CharacteristicSlot::Ack => "ack",
            CharacteristicSlot::Angle => "angle",
            CharacteristicSlot::Name => "name",
            CharacteristicSlot::Passkey => "passkey",
            CharacteristicSlot::Sensors => "sensors",
            CharacteristicSlot::Status => "status",
            CharacteristicSlot::VersionInfo => "version_info",
        }
    }
}

impl std::fmt::Display for CharacteristicSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
