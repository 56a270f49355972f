//! Merges repeated sightings of the same address into one evolving record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::core::bluetooth::types::{AdvertisementData, Device, RawSighting};

/// Everything known about one address during the current scan session.
#[derive(Debug, Clone)]
pub struct AdvertisementRecord {
    pub device: Device,
    pub advertisement: AdvertisementData,
    pub sightings: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    order: u64,
}

/// Result of feeding one sighting into the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementUpdate {
    pub device: Device,
    pub advertisement: AdvertisementData,
    /// False when nothing but RSSI changed
    pub changed: bool,
}

#[derive(Debug, Default)]
pub struct AdvertisementAggregator {
    records: HashMap<String, AdvertisementRecord>,
    next_order: u64,
}

impl AdvertisementAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlays `raw` on the record for its address. Fields absent from the
    /// sighting keep their previous values.
    pub fn on_event(&mut self, raw: RawSighting) -> Option<AdvertisementUpdate> {
        let Some(address) = raw.address else {
            warn!("Dropping sighting without an address: {:?}", raw.name);
            return None;
        };

        let now = Utc::now();
        let next_order = &mut self.next_order;
        let record = self.records.entry(address.clone()).or_insert_with(|| {
            debug!("New device sighted: {}", address);
            let order = *next_order;
            *next_order += 1;
            AdvertisementRecord {
                device: Device::new(address.clone(), None, None),
                advertisement: AdvertisementData::default(),
                sightings: 0,
                first_seen: now,
                last_seen: now,
                order,
            }
        });

        let before = record.advertisement.clone();
        let is_first = record.sightings == 0;

        if let Some(name) = raw.name {
            record.device.name = Some(name.clone());
            record.advertisement.local_name = Some(name);
        }
        if let Some(rssi) = raw.rssi {
            record.device.rssi = Some(rssi);
        }
        if let Some(manufacturer_data) = raw.manufacturer_data {
            record.advertisement.manufacturer_data.extend(manufacturer_data);
        }
        if let Some(service_data) = raw.service_data {
            record.advertisement.service_data.extend(service_data);
        }
        if let Some(service_uuids) = raw.service_uuids {
            for uuid in service_uuids {
                if !record.advertisement.service_uuids.contains(&uuid) {
                    record.advertisement.service_uuids.push(uuid);
                }
            }
        }
        record.sightings += 1;
        record.last_seen = now;

        Some(AdvertisementUpdate {
            device: record.device.clone(),
            advertisement: record.advertisement.clone(),
            changed: is_first || before != record.advertisement,
        })
    }

    /// Forgets an address the stack reported as gone.
    pub fn remove(&mut self, address: &str) -> bool {
        self.records.remove(address).is_some()
    }

    /// Starts a new scan session.
    pub fn clear(&mut self) {
        self.records.clear();
        self.next_order = 0;
    }

    pub fn record(&self, address: &str) -> Option<&AdvertisementRecord> {
        self.records.get(address)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Current aggregate, ordered by first sighting.
    pub fn snapshot(&self) -> Vec<(Device, AdvertisementData)> {
        let mut records: Vec<&AdvertisementRecord> = self.records.values().collect();
        records.sort_by_key(|r| r.order);
        records
            .into_iter()
            .map(|r| (r.device.clone(), r.advertisement.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[test]
    fn test_overlay_keeps_fields_from_earlier_sightings() {
        let mut aggregator = AdvertisementAggregator::new();
        let mut first = RawSighting::for_address("AA:BB:CC:DD:EE:FF");
        first.name = Some("X".to_string());
        aggregator.on_event(first);

        let mut second = RawSighting::for_address("AA:BB:CC:DD:EE:FF");
        second.manufacturer_data = Some(HashMap::from([(1u16, vec![0x01])]));
        aggregator.on_event(second);

        let snapshot = aggregator.snapshot();
        assert_eq!(snapshot.len(), 1);
        let (device, adv) = &snapshot[0];
        assert_eq!(device.name.as_deref(), Some("X"));
        assert_eq!(adv.local_name.as_deref(), Some("X"));
        assert_eq!(adv.manufacturer_data.get(&1), Some(&vec![0x01]));
        assert_eq!(aggregator.record("AA:BB:CC:DD:EE:FF").unwrap().sightings, 2);
    }

    #[test]
    fn test_later_values_win() {
        let mut aggregator = AdvertisementAggregator::new();
        let mut first = RawSighting::for_address("11:22:33:44:55:66");
        first.manufacturer_data = Some(HashMap::from([(76u16, vec![1, 2])]));
        aggregator.on_event(first);
        let mut second = RawSighting::for_address("11:22:33:44:55:66");
        second.manufacturer_data = Some(HashMap::from([(76u16, vec![3])]));
        aggregator.on_event(second);

        let (_, adv) = &aggregator.snapshot()[0];
        assert_eq!(adv.manufacturer_data[&76], vec![3]);
    }

    #[test]
    fn test_rssi_only_update_is_not_a_change() {
        let mut aggregator = AdvertisementAggregator::new();
        let mut first = RawSighting::for_address("11:22:33:44:55:66");
        first.rssi = Some(-70);
        assert!(aggregator.on_event(first).unwrap().changed);

        let mut second = RawSighting::for_address("11:22:33:44:55:66");
        second.rssi = Some(-40);
        let update = aggregator.on_event(second).unwrap();
        assert!(!update.changed);
        assert_eq!(update.device.rssi, Some(-40));

        let mut third = RawSighting::for_address("11:22:33:44:55:66");
        third.service_uuids = Some(vec![Uuid::from_u128(0x180f)]);
        assert!(aggregator.on_event(third).unwrap().changed);
    }

    #[test]
    fn test_missing_address_is_dropped() {
        let mut aggregator = AdvertisementAggregator::new();
        let raw = RawSighting {
            name: Some("ghost".to_string()),
            ..Default::default()
        };
        assert!(aggregator.on_event(raw).is_none());
        assert!(aggregator.is_empty());
    }

    #[test]
    fn test_snapshot_order_and_clear() {
        let mut aggregator = AdvertisementAggregator::new();
        for address in ["C", "A", "B", "A"] {
            aggregator.on_event(RawSighting::for_address(address));
        }
        let order: Vec<String> = aggregator.snapshot().into_iter().map(|(d, _)| d.address).collect();
        assert_eq!(order, vec!["C", "A", "B"]);

        assert!(aggregator.remove("A"));
        assert_eq!(aggregator.len(), 2);
        aggregator.clear();
        assert!(aggregator.snapshot().is_empty());
    }
}
