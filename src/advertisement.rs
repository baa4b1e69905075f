//! Recognising tags from their advertisements.
//!
//! Tags advertise under a random static address starting `FF:FF` and carry
//! manufacturer data under company id 0x5053. Byte 1 of that data is the
//! battery voltage in tenths of a volt.

use std::collections::HashMap;

use serde::Serialize;

use crate::address::DeviceAddress;

/// Manufacturer id carried by tag advertisements.
pub const MANUFACTURER_ID: u16 = 0x5053;

/// Address prefix of tag advertisements.
pub const ADDRESS_PREFIX: [u8; 2] = [0xFF, 0xFF];

/// A tag seen during discovery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TagAdvertisement {
    /// Device address, as displayed.
    #[serde(serialize_with = "serialize_address")]
    pub address: DeviceAddress,
    /// Raw manufacturer data.
    pub data: Vec<u8>,
}

fn serialize_address<S: serde::Serializer>(
    address: &DeviceAddress,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(address)
}

impl TagAdvertisement {
    /// Recognise a tag from one advertisement.
    ///
    /// Returns `None` for anything that is not a tag.
    pub fn parse(address: DeviceAddress, manufacturer_data: &HashMap<u16, Vec<u8>>) -> Option<Self> {
        if !address.starts_with(&ADDRESS_PREFIX) {
            return None;
        }
        let data = manufacturer_data.get(&MANUFACTURER_ID)?;
        tracing::debug!(%address, ?data, "Found tag");

        Some(Self {
            address,
            data: data.clone(),
        })
    }

    /// Battery voltage, if the data carries it.
    pub fn battery_volts(&self) -> Option<f32> {
        self.data.get(1).map(|raw| f32::from(*raw) / 10.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(bytes: &[u8]) -> HashMap<u16, Vec<u8>> {
        HashMap::from([(MANUFACTURER_ID, bytes.to_vec())])
    }

    #[test]
    fn test_recognises_tag() {
        let address: DeviceAddress = "FF:FF:92:1A:0B:3C".parse().unwrap();
        let tag = TagAdvertisement::parse(address, &data(&[0x01, 29, 0x00])).unwrap();

        assert_eq!(tag.address, address);
        let volts = tag.battery_volts().unwrap();
        assert!((volts - 2.9).abs() < 1e-6);
    }

    #[test]
    fn test_ignores_other_addresses() {
        let address: DeviceAddress = "A4:C1:38:00:00:01".parse().unwrap();
        assert!(TagAdvertisement::parse(address, &data(&[0x01, 30])).is_none());
    }

    #[test]
    fn test_ignores_other_manufacturers() {
        let address: DeviceAddress = "FF:FF:00:00:00:01".parse().unwrap();
        let other = HashMap::from([(0x004C, vec![0x02, 0x15])]);
        assert!(TagAdvertisement::parse(address, &other).is_none());
    }

    #[test]
    fn test_short_data_has_no_battery() {
        let address: DeviceAddress = "FF:FF:00:00:00:01".parse().unwrap();
        let tag = TagAdvertisement::parse(address, &data(&[0x01])).unwrap();
        assert_eq!(tag.battery_volts(), None);
    }

    #[test]
    fn test_serializes_address_as_string() {
        let address: DeviceAddress = "FF:FF:00:00:00:01".parse().unwrap();
        let tag = TagAdvertisement::parse(address, &data(&[0x01, 30])).unwrap();
        let json = serde_json::to_value(&tag).unwrap();
        assert_eq!(json["address"], "FF:FF:00:00:00:01");
        assert_eq!(json["data"], serde_json::json!([1, 30]));
    }
}
