//! Advertising data parsing.
//!
//! Parses the vendor-specific advertising payload broadcast by BlueST
//! devices: protocol version, board identifier, exported feature mask and
//! an optional device address.

use crate::error::{Error, Result};
use crate::utils::format_address;

/// Board family identifier from advertising data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BoardFamily {
    /// Unknown or generic BlueST board.
    Generic = 0x00,
    /// STEVAL-WESU1 wearable sensor unit.
    Wesu1 = 0x01,
    /// SensorTile (STEVAL-STLKT01V1).
    SensorTile = 0x02,
    /// BlueCoin (STEVAL-BCNKT01V1).
    BlueCoin = 0x03,
    /// STEVAL-IDB008Vx evaluation board.
    IdB008 = 0x04,
    /// BlueNRG-Tile (STEVAL-BCN002V1).
    BlueNrgTile = 0x05,
    /// SensorTile.box (STEVAL-MKSBOX1V1).
    SensorTileBox = 0x06,
    /// Nucleo board with expansion shields.
    Nucleo = 0x80,
}

impl BoardFamily {
    /// Create from the raw board-id byte.
    ///
    /// Board ids with the high bit set are Nucleo boards; unknown ids map
    /// to `Generic`.
    pub fn from_raw(value: u8) -> Self {
        if value & 0x80 != 0 {
            return Self::Nucleo;
        }
        match value {
            0x01 => Self::Wesu1,
            0x02 => Self::SensorTile,
            0x03 => Self::BlueCoin,
            0x04 => Self::IdB008,
            0x05 => Self::BlueNrgTile,
            0x06 => Self::SensorTileBox,
            _ => Self::Generic,
        }
    }
}

impl std::fmt::Display for BoardFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Generic => "Generic",
            Self::Wesu1 => "STEVAL-WESU1",
            Self::SensorTile => "SensorTile",
            Self::BlueCoin => "BlueCoin",
            Self::IdB008 => "STEVAL-IDB008Vx",
            Self::BlueNrgTile => "BlueNRG-Tile",
            Self::SensorTileBox => "SensorTile.box",
            Self::Nucleo => "Nucleo",
        };
        write!(f, "{}", name)
    }
}

/// Supported BlueST advertising protocol versions.
const SUPPORTED_PROTOCOL_VERSIONS: std::ops::RangeInclusive<u8> = 0x01..=0x02;

/// Payload length without the optional device address.
const PAYLOAD_LEN_SHORT: usize = 6;
/// Payload length with the optional 6-byte device address.
const PAYLOAD_LEN_FULL: usize = 12;

/// Parsed BlueST advertising payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisingInfo {
    /// BlueST protocol version.
    pub protocol_version: u8,
    /// Raw board identifier byte.
    pub board_id: u8,
    /// Board family decoded from the board identifier.
    pub board: BoardFamily,
    /// Bitmask of the features the node exports.
    pub feature_mask: u32,
    /// Device address, if the payload carries one.
    pub address: Option<[u8; 6]>,
}

impl AdvertisingInfo {
    /// Parse a BlueST vendor-specific advertising payload.
    ///
    /// Layout: protocol version (1 byte), board id (1 byte), feature mask
    /// (4 bytes big-endian), optional device address (6 bytes).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidAdvertisement`] if the payload length is
    /// not 6 or 12 bytes, or the protocol version is unsupported.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() != PAYLOAD_LEN_SHORT && data.len() != PAYLOAD_LEN_FULL {
            return Err(Error::InvalidAdvertisement {
                context: format!("payload length {} (expected 6 or 12)", data.len()),
            });
        }

        let protocol_version = data[0];
        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&protocol_version) {
            return Err(Error::InvalidAdvertisement {
                context: format!("unsupported protocol version {:#04x}", protocol_version),
            });
        }

        let board_id = data[1];
        let feature_mask = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);

        let address = if data.len() == PAYLOAD_LEN_FULL {
            let mut addr = [0u8; 6];
            addr.copy_from_slice(&data[6..12]);
            Some(addr)
        } else {
            None
        };

        Ok(Self {
            protocol_version,
            board_id,
            board: BoardFamily::from_raw(board_id),
            feature_mask,
            address,
        })
    }

    /// Check whether the node advertises the given feature mask bits.
    pub fn exports_feature(&self, mask: u32) -> bool {
        self.feature_mask & mask == mask
    }

    /// Device address formatted as a colon-separated string, if present.
    pub fn address_string(&self) -> Option<String> {
        self.address.map(|a| format_address(&a))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_short_payload() {
        // v1, SensorTile, temperature | humidity
        let data = [0x01, 0x02, 0x00, 0x0C, 0x00, 0x00];
        let info = AdvertisingInfo::parse(&data).unwrap();
        assert_eq!(info.protocol_version, 0x01);
        assert_eq!(info.board, BoardFamily::SensorTile);
        assert_eq!(info.feature_mask, 0x000C_0000);
        assert_eq!(info.address, None);
    }

    #[test]
    fn test_parse_full_payload() {
        let data = [
            0x02, 0x06, 0x00, 0x1C, 0x00, 0x00, 0xC0, 0x4E, 0x30, 0x12, 0x34, 0x56,
        ];
        let info = AdvertisingInfo::parse(&data).unwrap();
        assert_eq!(info.board, BoardFamily::SensorTileBox);
        assert_eq!(info.address, Some([0xC0, 0x4E, 0x30, 0x12, 0x34, 0x56]));
        assert_eq!(info.address_string().unwrap(), "c0:4e:30:12:34:56");
    }

    #[test]
    fn test_parse_bad_length() {
        let err = AdvertisingInfo::parse(&[0x01, 0x02, 0x00]).unwrap_err();
        assert!(matches!(err, Error::InvalidAdvertisement { .. }));
    }

    #[test]
    fn test_parse_bad_protocol_version() {
        let data = [0x07, 0x02, 0x00, 0x0C, 0x00, 0x00];
        let err = AdvertisingInfo::parse(&data).unwrap_err();
        assert!(matches!(err, Error::InvalidAdvertisement { .. }));
    }

    #[test]
    fn test_nucleo_board_id_high_bit() {
        let data = [0x01, 0x81, 0x00, 0x04, 0x00, 0x00];
        let info = AdvertisingInfo::parse(&data).unwrap();
        assert_eq!(info.board, BoardFamily::Nucleo);
        assert_eq!(info.board_id, 0x81);
    }

    #[test]
    fn test_exports_feature() {
        let data = [0x01, 0x02, 0x00, 0x0C, 0x00, 0x00];
        let info = AdvertisingInfo::parse(&data).unwrap();
        assert!(info.exports_feature(0x0004_0000));
        assert!(info.exports_feature(0x000C_0000));
        assert!(!info.exports_feature(0x0010_0000));
    }
}
