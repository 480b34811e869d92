//! BLE Service and Characteristic UUIDs.
//!
//! BlueST devices expose each feature characteristic under a UUID of the
//! form `XXXXXXXX-0001-11e1-ac36-0002a5d5c51b`, where the leading 32 bits
//! carry the feature bitmask exported by that characteristic.

use uuid::Uuid;

/// Lower 96 bits shared by every BlueST feature characteristic UUID.
pub const BLUE_ST_FEATURE_UUID_SUFFIX: u128 = 0x0000_0000_0001_11e1_ac36_0002a5d5c51b;

/// BlueST common feature service UUID (`00000000-0001-11e1-9ab4-0002a5d5c51b`).
pub const BLUE_ST_FEATURE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_0000_0001_11e1_9ab4_0002a5d5c51b);

/// Build the characteristic UUID that exports the given feature mask.
pub fn feature_uuid(mask: u32) -> Uuid {
    Uuid::from_u128(((mask as u128) << 96) | BLUE_ST_FEATURE_UUID_SUFFIX)
}

/// Extract the feature mask from a characteristic UUID.
///
/// Returns `None` if the UUID does not carry the BlueST feature suffix.
pub fn feature_mask_from_uuid(uuid: &Uuid) -> Option<u32> {
    let raw = uuid.as_u128();
    if raw & ((1u128 << 96) - 1) != BLUE_ST_FEATURE_UUID_SUFFIX {
        return None;
    }
    let mask = (raw >> 96) as u32;
    if mask == 0 {
        return None;
    }
    Some(mask)
}

/// Check whether a characteristic UUID is a BlueST feature characteristic.
pub fn is_feature_characteristic(uuid: &Uuid) -> bool {
    feature_mask_from_uuid(uuid).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_feature_uuid_round_trip() {
        let mask = 0x0004_0000; // temperature
        let uuid = feature_uuid(mask);
        assert_eq!(uuid.to_string(), "00040000-0001-11e1-ac36-0002a5d5c51b");
        assert_eq!(feature_mask_from_uuid(&uuid), Some(mask));
    }

    #[test]
    fn test_non_bluest_uuid_rejected() {
        // Standard Device Information service UUID does not carry the suffix
        let uuid = Uuid::from_u128(0x0000_180a_0000_1000_8000_00805f9b34fb);
        assert_eq!(feature_mask_from_uuid(&uuid), None);
        assert!(!is_feature_characteristic(&uuid));
    }

    #[test]
    fn test_zero_mask_rejected() {
        let uuid = Uuid::from_u128(BLUE_ST_FEATURE_UUID_SUFFIX);
        assert_eq!(feature_mask_from_uuid(&uuid), None);
    }

    #[test]
    fn test_multi_feature_mask() {
        // A characteristic can export several features at once
        let mask = 0x00E0_0000; // accelerometer | gyroscope | magnetometer
        let uuid = feature_uuid(mask);
        assert_eq!(feature_mask_from_uuid(&uuid), Some(mask));
    }
}
