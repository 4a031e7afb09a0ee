//! Bluetooth device address as carried in advertisements.

use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

/// Stores the 6 byte address used to identify Bluetooth devices.
///
/// `address[0]` is the most significant byte, which is also the first one printed.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct BDAddr {
    address: [u8; 6],
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ParseBDAddrError {
    #[error("Bluetooth address has to be 6 bytes long")]
    IncorrectByteCount,
    #[error("Invalid character in address: {0:?}")]
    InvalidCharacter(char),
    #[error("Invalid digit in address: {0}")]
    InvalidDigit(#[from] std::num::ParseIntError),
}

impl Display for BDAddr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let a = &self.address;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a[0], a[1], a[2], a[3], a[4], a[5]
        )
    }
}

impl Debug for BDAddr {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        <Self as Display>::fmt(self, f)
    }
}

impl From<[u8; 6]> for BDAddr {
    fn from(address: [u8; 6]) -> Self {
        Self { address }
    }
}

impl FromStr for BDAddr {
    type Err = ParseBDAddrError;

    /// Parses `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` or `aabbccddeeff`, in either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let delimited = digits.len() != s.len();
        if delimited && s.split([':', '-']).any(|part| part.len() != 2) {
            return Err(ParseBDAddrError::IncorrectByteCount);
        }
        if let Some(c) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(ParseBDAddrError::InvalidCharacter(c));
        }
        if digits.len() != 12 {
            return Err(ParseBDAddrError::IncorrectByteCount);
        }

        let mut address = [0; 6];
        for (i, byte) in address.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)?;
        }
        Ok(Self { address })
    }
}

impl BDAddr {
    pub fn into_inner(self) -> [u8; 6] {
        self.address
    }

    pub fn is_random_static(&self) -> bool {
        self.address[0] & 0b1100_0000 == 0b1100_0000
    }
}

#[cfg(feature = "serde")]
mod serde_impl {
    use super::BDAddr;
    use serde_cr::de::{Deserialize, Deserializer, Error};
    use serde_cr::ser::{Serialize, Serializer};
    use std::borrow::Cow;

    impl Serialize for BDAddr {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_str(self)
        }
    }

    impl<'de> Deserialize<'de> for BDAddr {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let text = <Cow<'de, str>>::deserialize(deserializer)?;
            text.parse().map_err(D::Error::custom)
        }
    }
}
