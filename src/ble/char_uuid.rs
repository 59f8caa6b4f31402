//! Characteristic identifiers
//!
//! A characteristic is addressed either by a 16-bit SIG-assigned number or
//! by a full 128-bit vendor UUID. Both are accepted at the boundary (config
//! files, CLI, API callers) and resolved into one 128-bit representation
//! before anything is sent to a transport.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The Bluetooth SIG base UUID that 16-bit identifiers expand into.
pub const BLUETOOTH_BASE_UUID: Uuid = Uuid::from_u128(0x0000_0000_0000_1000_8000_0080_5f9b_34fb);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UuidError {
    #[error("Invalid characteristic UUID {0:?}")]
    Malformed(String),
}

/// A characteristic identifier as supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "UuidRepr", into = "String")]
pub enum CharUuid {
    /// A 16-bit identifier on the Bluetooth base UUID.
    Standard(u16),
    /// A 128-bit vendor-specific identifier.
    Custom(Uuid),
}

impl CharUuid {
    /// The full 128-bit form handed to transports.
    pub fn resolve(&self) -> Uuid {
        match self {
            CharUuid::Standard(short) => {
                Uuid::from_u128(BLUETOOTH_BASE_UUID.as_u128() | ((*short as u128) << 96))
            }
            CharUuid::Custom(uuid) => *uuid,
        }
    }

    /// The 16-bit alias carried in octets 2..4 of the UUID.
    pub fn alias(&self) -> u16 {
        match self {
            CharUuid::Standard(short) => *short,
            CharUuid::Custom(uuid) => {
                let bytes = uuid.as_bytes();
                u16::from_be_bytes([bytes[2], bytes[3]])
            }
        }
    }

    /// The vendor base this identifier belongs to, with the alias octets
    /// zeroed. Standard identifiers need no registration and return `None`.
    pub fn vendor_base(&self) -> Option<Uuid> {
        match self {
            CharUuid::Standard(_) => None,
            CharUuid::Custom(uuid) => {
                let mut bytes = *uuid.as_bytes();
                bytes[2] = 0;
                bytes[3] = 0;
                Some(Uuid::from_bytes(bytes))
            }
        }
    }
}

impl From<u16> for CharUuid {
    fn from(short: u16) -> Self {
        CharUuid::Standard(short)
    }
}

impl From<Uuid> for CharUuid {
    fn from(uuid: Uuid) -> Self {
        // Long-form spellings of SIG identifiers collapse to the short form.
        let value = uuid.as_u128();
        let alias_mask = 0xffff_u128 << 96;
        if value & !alias_mask == BLUETOOTH_BASE_UUID.as_u128() {
            CharUuid::Standard((value >> 96) as u16)
        } else {
            CharUuid::Custom(uuid)
        }
    }
}

impl FromStr for CharUuid {
    type Err = UuidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let short = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if short.len() <= 4 && !short.is_empty() {
            return u16::from_str_radix(short, 16)
                .map(CharUuid::Standard)
                .map_err(|_| UuidError::Malformed(s.to_string()));
        }
        Uuid::parse_str(trimmed)
            .map(CharUuid::from)
            .map_err(|_| UuidError::Malformed(s.to_string()))
    }
}

impl fmt::Display for CharUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CharUuid::Standard(short) => write!(f, "0x{short:04X}"),
            CharUuid::Custom(uuid) => write!(f, "{}", uuid.hyphenated()),
        }
    }
}

impl From<CharUuid> for String {
    fn from(id: CharUuid) -> Self {
        id.to_string()
    }
}

/// Config files may spell an identifier as a number or as text.
#[derive(Deserialize)]
#[serde(untagged)]
enum UuidRepr {
    Short(u16),
    Text(String),
}

impl TryFrom<UuidRepr> for CharUuid {
    type Error = UuidError;

    fn try_from(repr: UuidRepr) -> Result<Self, Self::Error> {
        match repr {
            UuidRepr::Short(short) => Ok(CharUuid::Standard(short)),
            UuidRepr::Text(text) => text.parse(),
        }
    }
}
