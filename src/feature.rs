//! Feature model.
//!
//! A feature is one exported data stream on a node (a sensor channel, the
//! battery gauge, an audio stream). Each feature maps to one bit of the
//! BlueST feature mask and decodes its slice of the characteristic payload
//! into a [`Sample`].

use bytes::Buf;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::node::CallbackHandle;

/// BlueST feature mask bits.
pub mod masks {
    /// 3-axis accelerometer.
    pub const ACCELEROMETER: u32 = 0x0080_0000;
    /// 3-axis gyroscope.
    pub const GYROSCOPE: u32 = 0x0040_0000;
    /// 3-axis magnetometer.
    pub const MAGNETOMETER: u32 = 0x0020_0000;
    /// Barometric pressure.
    pub const PRESSURE: u32 = 0x0010_0000;
    /// Relative humidity.
    pub const HUMIDITY: u32 = 0x0008_0000;
    /// Temperature.
    pub const TEMPERATURE: u32 = 0x0004_0000;
    /// Battery gauge.
    pub const BATTERY: u32 = 0x0002_0000;
    /// Second temperature sensor.
    pub const SECOND_TEMPERATURE: u32 = 0x0001_0000;
    /// Push-button / switch state.
    pub const SWITCH: u32 = 0x2000_0000;
    /// ADPCM-compressed audio stream.
    pub const AUDIO_ADPCM: u32 = 0x0800_0000;
    /// ADPCM audio synchronization stream.
    pub const AUDIO_ADPCM_SYNC: u32 = 0x4000_0000;
}

/// Description of one data field of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    /// Field name.
    pub name: &'static str,
    /// Unit of measure.
    pub unit: &'static str,
}

/// The kind of data stream a feature carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureKind {
    /// 3-axis accelerometer (mg).
    Accelerometer,
    /// 3-axis gyroscope (dps).
    Gyroscope,
    /// 3-axis magnetometer (mGa).
    Magnetometer,
    /// Barometric pressure (mBar).
    Pressure,
    /// Relative humidity (%).
    Humidity,
    /// Temperature (C).
    Temperature,
    /// Second temperature sensor (C).
    SecondTemperature,
    /// Battery level, voltage, current and status.
    Battery,
    /// Push-button / switch state.
    Switch,
    /// ADPCM-compressed audio; payload passes through undecoded.
    AudioAdpcm,
    /// ADPCM audio synchronization; payload passes through undecoded.
    AudioAdpcmSync,
    /// Unknown feature bit; payload passes through undecoded.
    Raw,
}

impl FeatureKind {
    /// Map a single feature-mask bit to its kind.
    pub fn from_mask_bit(bit: u32) -> Self {
        match bit {
            masks::ACCELEROMETER => Self::Accelerometer,
            masks::GYROSCOPE => Self::Gyroscope,
            masks::MAGNETOMETER => Self::Magnetometer,
            masks::PRESSURE => Self::Pressure,
            masks::HUMIDITY => Self::Humidity,
            masks::TEMPERATURE => Self::Temperature,
            masks::SECOND_TEMPERATURE => Self::SecondTemperature,
            masks::BATTERY => Self::Battery,
            masks::SWITCH => Self::Switch,
            masks::AUDIO_ADPCM => Self::AudioAdpcm,
            masks::AUDIO_ADPCM_SYNC => Self::AudioAdpcmSync,
            _ => Self::Raw,
        }
    }

    /// Human-readable feature name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Accelerometer => "Accelerometer",
            Self::Gyroscope => "Gyroscope",
            Self::Magnetometer => "Magnetometer",
            Self::Pressure => "Pressure",
            Self::Humidity => "Humidity",
            Self::Temperature => "Temperature",
            Self::SecondTemperature => "Temperature2",
            Self::Battery => "Battery",
            Self::Switch => "Switch",
            Self::AudioAdpcm => "ADPCM Audio",
            Self::AudioAdpcmSync => "ADPCM Sync",
            Self::Raw => "Raw",
        }
    }

    /// Field descriptions for the decoded values.
    pub fn fields(&self) -> &'static [Field] {
        match self {
            Self::Accelerometer => &[
                Field { name: "X", unit: "mg" },
                Field { name: "Y", unit: "mg" },
                Field { name: "Z", unit: "mg" },
            ],
            Self::Gyroscope => &[
                Field { name: "X", unit: "dps" },
                Field { name: "Y", unit: "dps" },
                Field { name: "Z", unit: "dps" },
            ],
            Self::Magnetometer => &[
                Field { name: "X", unit: "mGa" },
                Field { name: "Y", unit: "mGa" },
                Field { name: "Z", unit: "mGa" },
            ],
            Self::Pressure => &[Field {
                name: "Pressure",
                unit: "mBar",
            }],
            Self::Humidity => &[Field {
                name: "Humidity",
                unit: "%",
            }],
            Self::Temperature | Self::SecondTemperature => &[Field {
                name: "Temperature",
                unit: "C",
            }],
            Self::Battery => &[
                Field {
                    name: "Level",
                    unit: "%",
                },
                Field {
                    name: "Voltage",
                    unit: "V",
                },
                Field {
                    name: "Current",
                    unit: "mA",
                },
                Field {
                    name: "Status",
                    unit: "",
                },
            ],
            Self::Switch => &[Field {
                name: "Switch",
                unit: "",
            }],
            Self::AudioAdpcm | Self::AudioAdpcmSync | Self::Raw => &[],
        }
    }

    /// Audio-class payloads omit the 2-byte timestamp to save bandwidth.
    pub fn has_timestamp(&self) -> bool {
        !self.is_audio()
    }

    /// Check whether this is one of the two audio-class features.
    pub fn is_audio(&self) -> bool {
        matches!(self, Self::AudioAdpcm | Self::AudioAdpcmSync)
    }

    /// Decode this feature's slice of a characteristic payload.
    ///
    /// Returns the decoded values and the number of bytes consumed.
    /// Audio and unknown features consume the whole remaining payload and
    /// report no scalar values.
    fn decode(&self, data: &[u8]) -> Result<(Vec<f32>, usize)> {
        let mut buf = data;

        let need = |buf: &[u8], n: usize| -> Result<()> {
            if buf.remaining() < n {
                Err(Error::InvalidData {
                    context: format!(
                        "{}: need {} bytes, got {}",
                        self.name(),
                        n,
                        buf.remaining()
                    ),
                })
            } else {
                Ok(())
            }
        };

        match self {
            Self::Temperature | Self::SecondTemperature | Self::Humidity => {
                need(buf, 2)?;
                Ok((vec![buf.get_i16_le() as f32 / 10.0], 2))
            }
            Self::Pressure => {
                need(buf, 4)?;
                Ok((vec![buf.get_i32_le() as f32 / 100.0], 4))
            }
            Self::Battery => {
                need(buf, 7)?;
                let level = buf.get_u16_le() as f32 / 10.0;
                let voltage = buf.get_i16_le() as f32 / 1000.0;
                let current = buf.get_i16_le() as f32 / 10.0;
                let status = buf.get_u8() as f32;
                Ok((vec![level, voltage, current, status], 7))
            }
            Self::Accelerometer | Self::Magnetometer => {
                need(buf, 6)?;
                let x = buf.get_i16_le() as f32;
                let y = buf.get_i16_le() as f32;
                let z = buf.get_i16_le() as f32;
                Ok((vec![x, y, z], 6))
            }
            Self::Gyroscope => {
                need(buf, 6)?;
                let x = buf.get_i16_le() as f32 / 10.0;
                let y = buf.get_i16_le() as f32 / 10.0;
                let z = buf.get_i16_le() as f32 / 10.0;
                Ok((vec![x, y, z], 6))
            }
            Self::Switch => {
                need(buf, 1)?;
                Ok((vec![buf.get_u8() as f32], 1))
            }
            Self::AudioAdpcm | Self::AudioAdpcmSync | Self::Raw => Ok((Vec::new(), data.len())),
        }
    }
}

/// One decoded data sample from a feature.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Device-side timestamp from the notification payload.
    ///
    /// `None` for audio-class samples, which carry no timestamp.
    pub timestamp: Option<u32>,
    /// Decoded scalar values, ordered per the feature's field description.
    pub values: Vec<f32>,
    /// The raw bytes this sample was decoded from.
    pub raw: Vec<u8>,
    /// Local time the notification arrived.
    pub notification_time: DateTime<Utc>,
}

impl Sample {
    /// Values rendered as a bracketed list, e.g. `[23.4]`.
    pub fn values_string(&self) -> String {
        let joined = self
            .values
            .iter()
            .map(|v| format!("{}", v))
            .collect::<Vec<_>>()
            .join(", ");
        format!("[{}]", joined)
    }
}

impl std::fmt::Display for Sample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.timestamp {
            Some(ts) => write!(f, "Timestamp: {} Data: {}", ts, self.values_string()),
            None => write!(f, "Data: {} bytes", self.raw.len()),
        }
    }
}

/// Internal mutable state of a feature.
struct FeatureState {
    /// Last decoded sample.
    last_sample: Option<Sample>,
    /// Local time of the last update.
    last_update: Option<DateTime<Utc>>,
}

/// One exported data stream on a node.
///
/// Created by the node from the feature mask carried in the characteristic
/// UUIDs; updated by the node's notification dispatcher.
pub struct Feature {
    /// The kind of data this feature carries.
    kind: FeatureKind,
    /// The single mask bit identifying this feature.
    mask: u32,
    /// The characteristic that exports this feature.
    characteristic_uuid: Uuid,
    /// Mutable state.
    state: RwLock<FeatureState>,
    /// Whether the node exports data for this feature.
    is_enabled: AtomicBool,
    /// Whether notifications are currently enabled.
    is_notifying: AtomicBool,
    /// Sample fan-out channel.
    sample_tx: broadcast::Sender<Sample>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl Feature {
    /// Create a new feature bound to a characteristic.
    pub(crate) fn new(mask: u32, characteristic_uuid: Uuid) -> Self {
        let (sample_tx, _) = broadcast::channel(64);

        Self {
            kind: FeatureKind::from_mask_bit(mask),
            mask,
            characteristic_uuid,
            state: RwLock::new(FeatureState {
                last_sample: None,
                last_update: None,
            }),
            is_enabled: AtomicBool::new(true),
            is_notifying: AtomicBool::new(false),
            sample_tx,
            callback_counter: AtomicU64::new(0),
        }
    }

    /// Get the feature name.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Get the feature kind.
    pub fn kind(&self) -> FeatureKind {
        self.kind
    }

    /// Get the mask bit identifying this feature.
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Get the UUID of the characteristic that exports this feature.
    pub fn characteristic_uuid(&self) -> Uuid {
        self.characteristic_uuid
    }

    /// Get the description of the feature's data fields.
    pub fn fields(&self) -> &'static [Field] {
        self.kind.fields()
    }

    /// Get the last sample received, if any.
    pub fn last_sample(&self) -> Option<Sample> {
        self.state.read().last_sample.clone()
    }

    /// Get the local time of the last update.
    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_update
    }

    /// Check whether the node exports the data of this feature.
    pub fn is_enabled(&self) -> bool {
        self.is_enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, flag: bool) {
        self.is_enabled.store(flag, Ordering::SeqCst);
    }

    /// Check whether notifications for this feature are enabled.
    pub fn is_notifying(&self) -> bool {
        self.is_notifying.load(Ordering::SeqCst)
    }

    pub(crate) fn set_notifying(&self, flag: bool) {
        self.is_notifying.store(flag, Ordering::SeqCst);
    }

    /// Subscribe to decoded samples.
    pub fn subscribe_samples(&self) -> broadcast::Receiver<Sample> {
        self.sample_tx.subscribe()
    }

    /// Register a callback invoked on each decoded sample.
    pub fn on_update<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&Sample) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.sample_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(sample) = rx.recv().await {
                callback(&sample);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Update the feature from its slice of a notification payload.
    ///
    /// Decodes starting at the beginning of `data`, stores the sample,
    /// notifies subscribers and returns the number of bytes consumed so
    /// that the next feature sharing the characteristic can decode the
    /// remainder.
    pub(crate) fn update(&self, timestamp: Option<u32>, data: &[u8]) -> Result<usize> {
        let (values, read_bytes) = self.kind.decode(data)?;

        let sample = Sample {
            timestamp,
            values,
            raw: data[..read_bytes].to_vec(),
            notification_time: Utc::now(),
        };

        {
            let mut state = self.state.write();
            state.last_sample = Some(sample.clone());
            state.last_update = Some(sample.notification_time);
        }

        let _ = self.sample_tx.send(sample);

        Ok(read_bytes)
    }
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sample = match self.last_sample() {
            Some(s) => s,
            None => return write!(f, "{}: Unknown", self.name()),
        };

        // Audio-class samples have no timestamp and no scalar fields
        let ts = match sample.timestamp {
            Some(ts) => ts,
            None => return write!(f, "{} - {} bytes", self.name(), sample.raw.len()),
        };

        let fields = self.fields();
        if fields.len() == 1 && sample.values.len() == 1 {
            return write!(
                f,
                "{}({}): {} {}",
                self.name(),
                ts,
                sample.values[0],
                fields[0].unit
            );
        }

        const UNKNOWN_FIELD: Field = Field { name: "?", unit: "" };

        write!(f, "{}({}): ( ", self.name(), ts)?;
        for (i, value) in sample.values.iter().enumerate() {
            let field = fields.get(i).unwrap_or(&UNKNOWN_FIELD);
            let sep = if i < sample.values.len() - 1 {
                "    "
            } else {
                " )"
            };
            write!(f, "{}: {} {}{}", field.name, value, field.unit, sep)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feature")
            .field("name", &self.name())
            .field("mask", &format_args!("{:#010x}", self.mask))
            .field("characteristic_uuid", &self.characteristic_uuid)
            .field("is_notifying", &self.is_notifying())
            .finish()
    }
}

/// Expand a feature mask into its known single-bit features.
///
/// Bits are returned in descending order, which is also the order in which
/// features sharing a characteristic lay out their data in the payload.
pub fn expand_mask(mask: u32) -> Vec<u32> {
    (0..32)
        .rev()
        .map(|bit| 1u32 << bit)
        .filter(|bit| mask & bit != 0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::feature_uuid;
    use pretty_assertions::assert_eq;

    fn feature(mask: u32) -> Feature {
        Feature::new(mask, feature_uuid(mask))
    }

    #[test]
    fn test_temperature_decode() {
        let f = feature(masks::TEMPERATURE);
        // 23.4 C = 234 = 0x00EA little-endian
        let read = f.update(Some(100), &[0xEA, 0x00]).unwrap();
        assert_eq!(read, 2);

        let sample = f.last_sample().unwrap();
        assert_eq!(sample.timestamp, Some(100));
        assert_eq!(sample.values, vec![23.4]);
        assert_eq!(format!("{}", f), "Temperature(100): 23.4 C");
    }

    #[test]
    fn test_pressure_decode() {
        let f = feature(masks::PRESSURE);
        // 1013.25 mBar = 101325 = 0x00018BCD little-endian
        f.update(Some(7), &[0xCD, 0x8B, 0x01, 0x00]).unwrap();
        assert_eq!(f.last_sample().unwrap().values, vec![1013.25]);
    }

    #[test]
    fn test_battery_decode() {
        let f = feature(masks::BATTERY);
        // level 87.0%, voltage 3.712 V, current -12.3 mA, status 3
        let mut data = Vec::new();
        data.extend_from_slice(&870u16.to_le_bytes());
        data.extend_from_slice(&3712i16.to_le_bytes());
        data.extend_from_slice(&(-123i16).to_le_bytes());
        data.push(3);

        let read = f.update(Some(1), &data).unwrap();
        assert_eq!(read, 7);
        assert_eq!(f.last_sample().unwrap().values, vec![87.0, 3.712, -12.3, 3.0]);
    }

    #[test]
    fn test_gyroscope_decode_scaled() {
        let f = feature(masks::GYROSCOPE);
        let mut data = Vec::new();
        data.extend_from_slice(&100i16.to_le_bytes());
        data.extend_from_slice(&(-50i16).to_le_bytes());
        data.extend_from_slice(&0i16.to_le_bytes());

        f.update(Some(1), &data).unwrap();
        assert_eq!(f.last_sample().unwrap().values, vec![10.0, -5.0, 0.0]);
    }

    #[test]
    fn test_audio_no_timestamp_raw_passthrough() {
        let f = feature(masks::AUDIO_ADPCM);
        assert!(f.kind().is_audio());
        assert!(!f.kind().has_timestamp());

        let payload = vec![0xAA; 20];
        let read = f.update(None, &payload).unwrap();
        assert_eq!(read, 20);

        let sample = f.last_sample().unwrap();
        assert_eq!(sample.timestamp, None);
        assert!(sample.values.is_empty());
        assert_eq!(sample.raw, payload);
        assert_eq!(format!("{}", f), "ADPCM Audio - 20 bytes");
    }

    #[test]
    fn test_short_payload_is_error() {
        let f = feature(masks::TEMPERATURE);
        let err = f.update(Some(1), &[0xEA]).unwrap_err();
        assert!(matches!(err, Error::InvalidData { .. }));
        assert!(f.last_sample().is_none());
    }

    #[test]
    fn test_shared_characteristic_sequential_decode() {
        // Temperature and humidity exported by one characteristic: each
        // feature consumes its slice, the caller advances the offset.
        let payload = [0xEA, 0x00, 0x20, 0x03]; // 23.4 C then 80.0 %
        let temp = feature(masks::TEMPERATURE);
        let hum = feature(masks::HUMIDITY);

        let mut offset = 0;
        offset += temp.update(Some(5), &payload[offset..]).unwrap();
        offset += hum.update(Some(5), &payload[offset..]).unwrap();

        assert_eq!(offset, 4);
        assert_eq!(temp.last_sample().unwrap().values, vec![23.4]);
        assert_eq!(hum.last_sample().unwrap().values, vec![80.0]);
    }

    #[test]
    fn test_expand_mask_descending() {
        let mask = masks::TEMPERATURE | masks::ACCELEROMETER | masks::HUMIDITY;
        assert_eq!(
            expand_mask(mask),
            vec![masks::ACCELEROMETER, masks::HUMIDITY, masks::TEMPERATURE]
        );
    }

    #[test]
    fn test_unknown_mask_bit_is_raw() {
        assert_eq!(FeatureKind::from_mask_bit(0x0000_0001), FeatureKind::Raw);
        assert_eq!(
            FeatureKind::from_mask_bit(masks::SWITCH),
            FeatureKind::Switch
        );
    }

    #[test]
    fn test_sample_values_string() {
        let f = feature(masks::ACCELEROMETER);
        let mut data = Vec::new();
        data.extend_from_slice(&10i16.to_le_bytes());
        data.extend_from_slice(&(-20i16).to_le_bytes());
        data.extend_from_slice(&1000i16.to_le_bytes());
        f.update(Some(1), &data).unwrap();

        assert_eq!(f.last_sample().unwrap().values_string(), "[10, -20, 1000]");
    }
}
