//! Utilities for dealing with BLE UUIDs: the short 16/32-bit forms and parsing the string
//! forms hosts hand us.

use crate::{Error, Result};
use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

/// Convert a 32-bit BLE short UUID to a full 128-bit UUID by filling in the standard Bluetooth Base
/// UUID.
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Convert a 16-bit BLE short UUID to a full 128-bit UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    uuid_from_u32(short as u32)
}

/// Parses a UUID as a host would write it: the full hyphenated (or simple) form, or a 16/32-bit
/// short form with or without a `0x` prefix (`"180d"`, `"0x180D"`, `"0000180d"`).
pub fn parse_ble_uuid(text: &str) -> Result<Uuid> {
    let text = text.trim();
    let short = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    let invalid = || Error::InvalidArgument(format!("invalid short UUID {:?}", text));
    if matches!(short.len(), 4 | 8) && !short.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(invalid());
    }
    match short.len() {
        4 => u16::from_str_radix(short, 16)
            .map(uuid_from_u16)
            .map_err(|_| invalid()),
        8 => u32::from_str_radix(short, 16)
            .map(uuid_from_u32)
            .map_err(|_| invalid()),
        _ => Ok(Uuid::parse_str(text)?),
    }
}

/// An extension trait for `Uuid` which provides BLE-specific methods.
pub trait BleUuid {
    /// If the UUID is a valid 16-bit BLE short UUID then return its short form.
    fn to_ble_u16(&self) -> Option<u16>;

    /// Convert the UUID to a string, using the 16-bit short format if applicable. Used when
    /// logging GATT paths.
    fn to_short_string(&self) -> String;
}

impl BleUuid for Uuid {
    fn to_ble_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn to_short_string(&self) -> String {
        match self.to_ble_u16() {
            Some(uuid16) => format!("{:#06x}", uuid16),
            None if self.as_u128() & BLUETOOTH_BASE_MASK == BLUETOOTH_BASE_UUID => {
                format!("{:#010x}", (self.as_u128() >> 96) as u32)
            }
            None => self.to_string(),
        }
    }
}
