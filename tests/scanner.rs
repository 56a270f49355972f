//! Integration tests for the scanner against the scripted scan transport.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use blebridge::config::scanner_config::ScannerConfig;
use blebridge::core::bluetooth::backends::fake::FakeScanner;
use blebridge::core::bluetooth::{AdvertisementData, Device, RawSighting, Scanner, UUID_BATTERY_SERVICE};

use common::*;

#[tokio::test]
async fn test_partial_sightings_merge_into_one_record() {
    let transport = Arc::new(FakeScanner::demo());
    let mut scanner = Scanner::new(transport.clone(), ScannerConfig::default());
    scanner.start_scan(|_, _| {}).await.unwrap();
    settle().await;

    let devices = scanner.get_discovered_devices();
    let addresses: Vec<&str> = devices.iter().map(|(d, _)| d.address.as_str()).collect();
    assert_eq!(addresses, vec!["C0:FF:EE:00:00:01", "C0:FF:EE:00:00:02"]);

    let (device, advertisement) = &devices[0];
    assert_eq!(device.name.as_deref(), Some("Fake Peripheral"));
    assert_eq!(device.rssi, Some(-55));
    assert_eq!(advertisement.service_uuids, vec![UUID_BATTERY_SERVICE]);

    let (_, beacon) = &devices[1];
    assert_eq!(beacon.manufacturer_data.get(&0x004c), Some(&vec![0x02, 0x15]));
    scanner.stop_scan().await.unwrap();
}

#[tokio::test]
async fn test_overlay_keeps_name_and_manufacturer_data() {
    let transport = Arc::new(FakeScanner::new());
    let mut scanner = Scanner::new(transport.clone(), ScannerConfig::default());
    let updates: Arc<Mutex<Vec<(Device, AdvertisementData)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = updates.clone();
    scanner
        .start_scan(move |device: &Device, advertisement: &AdvertisementData| {
            sink.lock().unwrap().push((device.clone(), advertisement.clone()));
        })
        .await
        .unwrap();

    let mut named = RawSighting::for_address("AA:00:00:00:00:01");
    named.name = Some("X".to_string());
    let mut with_data = RawSighting::for_address("AA:00:00:00:00:01");
    with_data.manufacturer_data = Some(HashMap::from([(1, vec![1])]));
    transport.emit(named);
    transport.emit(with_data);
    settle().await;

    let devices = scanner.get_discovered_devices();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].1.local_name.as_deref(), Some("X"));
    assert_eq!(devices[0].1.manufacturer_data.get(&1), Some(&vec![1]));

    let updates = updates.lock().unwrap();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[1].0.name.as_deref(), Some("X"));
    scanner.stop_scan().await.unwrap();
}

#[tokio::test]
async fn test_results_stay_readable_after_stop() {
    let transport = Arc::new(FakeScanner::demo());
    let mut scanner = Scanner::new(transport.clone(), ScannerConfig::default());
    scanner.start_scan(|_, _| {}).await.unwrap();
    settle().await;
    scanner.stop_scan().await.unwrap();

    assert!(!scanner.is_scanning());
    assert!(!transport.is_scanning());
    assert_eq!(scanner.get_discovered_devices().len(), 2);
    assert!(!transport.emit(RawSighting::for_address("AA:00:00:00:00:09")));
}

#[tokio::test]
async fn test_panicking_scan_callback_is_isolated() {
    let transport = Arc::new(FakeScanner::new());
    let mut scanner = Scanner::new(transport.clone(), ScannerConfig::default());
    scanner
        .start_scan(|device: &Device, _: &AdvertisementData| {
            if device.address.ends_with("01") {
                panic!("callback failure");
            }
        })
        .await
        .unwrap();

    transport.emit(RawSighting::for_address("AA:00:00:00:00:01"));
    transport.emit(RawSighting::for_address("AA:00:00:00:00:02"));
    settle().await;
    assert_eq!(scanner.get_discovered_devices().len(), 2);
    scanner.stop_scan().await.unwrap();
}

#[tokio::test]
async fn test_find_device_by_address_stops_on_first_match() {
    let transport = Arc::new(FakeScanner::demo());
    let mut scanner = Scanner::new(transport.clone(), ScannerConfig::default());

    let started = Instant::now();
    let found = scanner
        .find_device_by_address("c0:ff:ee:00:00:02", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    let (device, advertisement) = found.expect("beacon should be found");
    assert_eq!(device.address, "C0:FF:EE:00:00:02");
    assert_eq!(device.rssi, Some(-80));
    assert!(advertisement.manufacturer_data.contains_key(&0x004c));
    assert!(!scanner.is_scanning());
    assert!(!transport.is_scanning());
    assert_eq!(transport.stops(), 1);
}

#[tokio::test]
async fn test_find_device_by_address_gives_up_at_timeout() {
    let transport = Arc::new(FakeScanner::demo());
    let mut scanner = Scanner::new(transport.clone(), ScannerConfig::default());

    let found = scanner
        .find_device_by_address("C0:FF:EE:00:00:99", Duration::from_millis(50))
        .await
        .unwrap();
    assert!(found.is_none());
    assert!(!scanner.is_scanning());
    assert_eq!(transport.stops(), 1);
    assert_eq!(scanner.get_discovered_devices().len(), 2);
}
