// nfc-rw-rs/nfc-rw/src/types.rs

use crate::Error;
use derive_more::Display;
use std::convert::TryFrom;

/// Tag protocol families a session can be asked to select.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Protocol {
    /// NFC Forum Type 1 (Topaz)
    #[display(fmt = "Type1")]
    Type1,
    /// NFC Forum Type 2
    #[display(fmt = "Type2")]
    Type2,
    /// NFC Forum Type 3 (FeliCa); no engine
    #[display(fmt = "Type3")]
    Type3,
    /// NFC Forum Type 4; no engine
    #[display(fmt = "Type4")]
    Type4,
    /// ISO 15693 (NFC Forum Type 5)
    #[display(fmt = "ISO15693")]
    Iso15693,
}

/// Type 1 header ROM (HR0, HR1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HeaderRom([u8; 2]);

impl HeaderRom {
    /// Build from HR0 and HR1.
    pub const fn new(hr0: u8, hr1: u8) -> Self {
        Self([hr0, hr1])
    }

    /// Header ROM byte 0.
    pub fn hr0(&self) -> u8 {
        self.0[0]
    }

    /// Header ROM byte 1.
    pub fn hr1(&self) -> u8 {
        self.0[1]
    }

    /// Both header bytes.
    pub fn as_bytes(&self) -> &[u8; 2] {
        &self.0
    }
}

/// Type 1 UID echo (first 4 bytes of the UID, appended to every command)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct T1tUid([u8; 4]);

impl T1tUid {
    /// Wrap the four UID bytes.
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Raw UID bytes.
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// UID as lowercase hex.
    pub fn to_hex(&self) -> String {
        crate::utils::bytes_to_hex(self.as_bytes())
    }
}

impl TryFrom<&[u8]> for T1tUid {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != 4 {
            return Err(Error::InvalidLength {
                expected: 4,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 4];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }
}

/// ISO 15693 UID - 8 バイト
///
/// Stored most-significant byte first (`E0` first), the way it is printed on
/// tags and reported in system information. On the air the bytes travel in
/// reverse order; [`I93Uid::to_wire`] and [`I93Uid::from_wire`] convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct I93Uid([u8; 8]);

impl I93Uid {
    /// Wrap UID bytes given MSB first.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Build from the LSB-first byte order used on the air.
    pub fn from_wire(wire: &[u8; 8]) -> Self {
        let mut arr = *wire;
        arr.reverse();
        Self(arr)
    }

    /// Bytes in on-air (LSB-first) order.
    pub fn to_wire(&self) -> [u8; 8] {
        let mut arr = self.0;
        arr.reverse();
        arr
    }

    /// UID bytes, MSB first.
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Manufacturer code (second UID byte).
    pub fn manufacturer(&self) -> u8 {
        self.0[1]
    }

    /// Manufacturer-specific product byte (third UID byte).
    pub fn product_byte(&self) -> u8 {
        self.0[2]
    }

    /// UID as lowercase hex, MSB first.
    pub fn to_hex(&self) -> String {
        crate::utils::bytes_to_hex(self.as_bytes())
    }
}

impl TryFrom<&[u8]> for I93Uid {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != 8 {
            return Err(Error::InvalidLength {
                expected: 8,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(Self(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i93_uid_wire_order() {
        let uid = I93Uid::from_bytes([0xE0, 0x04, 0x01, 0x00, 0x11, 0x22, 0x33, 0x44]);
        let wire = uid.to_wire();
        assert_eq!(wire[0], 0x44);
        assert_eq!(wire[7], 0xE0);
        assert_eq!(I93Uid::from_wire(&wire), uid);
        assert_eq!(uid.manufacturer(), 0x04);
        assert_eq!(uid.product_byte(), 0x01);
    }

    #[test]
    fn t1t_uid_try_from_rejects_wrong_len() {
        let err = T1tUid::try_from(&[1u8, 2, 3][..]).unwrap_err();
        match err {
            Error::InvalidLength { expected, actual } => {
                assert_eq!(expected, 4);
                assert_eq!(actual, 3);
            }
            other => panic!("expected InvalidLength, got: {:?}", other),
        }
    }

    #[test]
    fn protocol_display() {
        assert_eq!(Protocol::Iso15693.to_string(), "ISO15693");
        assert_eq!(Protocol::Type1.to_string(), "Type1");
    }

    #[test]
    fn header_rom_accessors() {
        let hr = HeaderRom::new(0x12, 0x4C);
        assert_eq!(hr.hr0(), 0x12);
        assert_eq!(hr.hr1(), 0x4C);
        assert_eq!(hr.as_bytes(), &[0x12, 0x4C]);
    }
}
