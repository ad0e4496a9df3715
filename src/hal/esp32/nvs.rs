//! Settings and calibration persisted in the ESP-IDF NVS partition.
//!
//! Settings are stored one entry per key as a five-byte blob: the value's
//! type tag followed by its four big-endian bytes, the same encoding the
//! bus uses. NVS keys are limited to 15 characters, so entries are named
//! by wire id (`k11` for `control.kp`) rather than by dotted name.
//!
//! The calibration profile is a single JSON blob under `cal`.

use esp_idf_svc::nvs::{EspNvs, EspNvsPartition, NvsDefault};
use esp_idf_svc::sys::EspError;
use heapless::String;

use crate::calibration::CalibrationProfile;
use crate::config::{SettingKey, SettingValue};
use crate::traits::{CalibrationStore, ConfigService};

/// NVS namespace holding everything the feeder persists.
const NAMESPACE: &str = "feeder";

/// Key of the calibration profile.
const CALIBRATION_KEY: &str = "cal";

/// Buffer for the encoded profile.
const PROFILE_JSON_LEN: usize = 384;

/// Errors from the NVS-backed stores.
#[derive(Debug, thiserror::Error)]
pub enum NvsStoreError {
    /// The NVS driver failed.
    #[error("nvs: {0}")]
    Nvs(#[from] EspError),

    /// The profile did not fit the encode buffer.
    #[error("calibration profile encode failed")]
    Encode,

    /// The stored blob is not a profile.
    #[error("calibration profile decode failed")]
    Decode,
}

/// Feeder storage in the default NVS partition.
///
/// # Example
///
/// ```ignore
/// use esp_idf_svc::nvs::EspDefaultNvsPartition;
/// use gluon_feeder::hal::esp32::Esp32Nvs;
/// use gluon_feeder::FeederConfig;
///
/// let nvs = Esp32Nvs::new(EspDefaultNvsPartition::take()?)?;
/// let config = FeederConfig::load(&nvs)?;
/// ```
pub struct Esp32Nvs {
    nvs: EspNvs<NvsDefault>,
}

impl Esp32Nvs {
    /// Opens the feeder namespace read-write.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be opened.
    pub fn new(partition: EspNvsPartition<NvsDefault>) -> Result<Self, NvsStoreError> {
        Ok(Self {
            nvs: EspNvs::new(partition, NAMESPACE, true)?,
        })
    }

    /// Persists one setting.
    pub fn write_setting(&mut self, key: SettingKey, value: SettingValue) -> Result<(), NvsStoreError> {
        let (tag, bytes) = value.to_wire();
        let mut blob = [0u8; 5];
        blob[0] = tag;
        blob[1..].copy_from_slice(&bytes);
        self.nvs.set_raw(&setting_key(key), &blob)?;
        Ok(())
    }

    /// Removes a setting so the default applies again.
    pub fn clear_setting(&mut self, key: SettingKey) -> Result<(), NvsStoreError> {
        self.nvs.remove(&setting_key(key))?;
        Ok(())
    }
}

/// NVS entry name for a setting.
fn setting_key(key: SettingKey) -> String<4> {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let id = key as u8;
    let mut name = String::new();
    // Three ASCII characters always fit
    let _ = name.push('k');
    let _ = name.push(HEX[(id >> 4) as usize] as char);
    let _ = name.push(HEX[(id & 0x0F) as usize] as char);
    name
}

impl ConfigService for Esp32Nvs {
    fn read(&self, key: SettingKey) -> Option<SettingValue> {
        let mut blob = [0u8; 5];
        match self.nvs.get_raw(&setting_key(key), &mut blob) {
            Ok(Some(stored)) if stored.len() == 5 => {
                let value = SettingValue::from_wire(stored[0], [stored[1], stored[2], stored[3], stored[4]]);
                if value.is_none() {
                    tracing::warn!(key = key.name(), "ignoring stored setting with bad type tag");
                }
                value
            }
            Ok(Some(_)) => {
                tracing::warn!(key = key.name(), "ignoring stored setting with bad length");
                None
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(key = key.name(), ?err, "setting read failed");
                None
            }
        }
    }
}

impl CalibrationStore for Esp32Nvs {
    type Error = NvsStoreError;

    fn load(&mut self) -> Result<Option<CalibrationProfile>, Self::Error> {
        let mut buf = [0u8; PROFILE_JSON_LEN];
        match self.nvs.get_raw(CALIBRATION_KEY, &mut buf)? {
            Some(json) => CalibrationProfile::from_json(json)
                .map(Some)
                .map_err(|_| NvsStoreError::Decode),
            None => Ok(None),
        }
    }

    fn save(&mut self, profile: &CalibrationProfile) -> Result<(), Self::Error> {
        let json: String<PROFILE_JSON_LEN> = profile.to_json().map_err(|_| NvsStoreError::Encode)?;
        self.nvs.set_raw(CALIBRATION_KEY, json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setting_keys_fit_nvs_names() {
        for &key in SettingKey::ALL {
            let name = setting_key(key);
            assert!(name.len() <= 15);
        }
        assert_eq!(setting_key(SettingKey::Kp).as_str(), "k11");
    }
}
