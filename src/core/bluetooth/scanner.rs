use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::scanner_config::ScannerConfig;
use crate::core::bluetooth::aggregator::AdvertisementAggregator;
use crate::core::bluetooth::transport::{ScanSink, ScanTransport};
use crate::core::bluetooth::types::{AdvertisementData, Device, ScanEvent};
use crate::error::{BleError, Result};

/// Invoked for every accepted sighting with the merged device state.
pub type ScanCallback = Arc<dyn Fn(&Device, &AdvertisementData) + Send + Sync>;

type SharedAggregator = Arc<Mutex<AdvertisementAggregator>>;

pub struct Scanner {
    transport: Arc<dyn ScanTransport>,
    config: ScannerConfig,
    aggregator: SharedAggregator,
    cancel_token: CancellationToken,
    scan_task_handle: Option<JoinHandle<()>>,
}

impl Scanner {
    pub fn new(transport: Arc<dyn ScanTransport>, config: ScannerConfig) -> Self {
        Self {
            transport,
            config,
            aggregator: Arc::new(Mutex::new(AdvertisementAggregator::new())),
            cancel_token: CancellationToken::new(),
            scan_task_handle: None,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task_handle.is_some()
    }

    /// Starts a new scan session. Earlier results are discarded.
    pub async fn start_scan<F>(&mut self, callback: F) -> Result<()>
    where
        F: Fn(&Device, &AdvertisementData) + Send + Sync + 'static,
    {
        if self.scan_task_handle.is_some() {
            self.stop_scan().await?;
        }
        lock(&self.aggregator).clear();

        self.cancel_token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.config.scan_channel_capacity.max(1));
        let handle = tokio::spawn(Self::internal_scan_task(
            rx,
            self.aggregator.clone(),
            Arc::new(callback),
            self.config.clone(),
            self.cancel_token.clone(),
        ));

        if let Err(e) = self.transport.start_scan(ScanSink::new(tx)).await {
            error!("Failed to start scanning on {}: {}", self.transport.name(), e);
            self.cancel_token.cancel();
            if let Err(join) = handle.await {
                error!("Scan task ended abnormally: {:?}", join);
            }
            return Err(into_scan_error(e));
        }

        self.scan_task_handle = Some(handle);
        info!("Device scan started on {}.", self.transport.name());
        Ok(())
    }

    /// Stops the scan. The aggregate stays readable until the next `start_scan`.
    pub async fn stop_scan(&mut self) -> Result<()> {
        let Some(handle) = self.scan_task_handle.take() else {
            info!("No active scan to stop.");
            return Ok(());
        };
        info!("Stopping Bluetooth scan.");
        let stopped = self.transport.stop_scan().await;

        self.cancel_token.cancel();
        match handle.await {
            Ok(()) => debug!("Scan task finished after cancellation."),
            Err(e) if e.is_cancelled() => info!("Scan task was cancelled."),
            Err(e) => error!("Scan task finished with an unexpected join error: {:?}", e),
        }

        stopped.map_err(into_scan_error)
    }

    /// Scans until `address` is sighted or `timeout` elapses, then stops the
    /// scan. Addresses compare case-insensitively.
    pub async fn find_device_by_address(
        &mut self,
        address: &str,
        timeout: Duration,
    ) -> Result<Option<(Device, AdvertisementData)>> {
        let (found_tx, mut found_rx) = mpsc::channel(1);
        let target = address.to_string();
        self.start_scan(move |device: &Device, advertisement: &AdvertisementData| {
            if device.address.eq_ignore_ascii_case(&target) {
                let _ = found_tx.try_send((device.clone(), advertisement.clone()));
            }
        })
        .await?;

        let found = tokio::time::timeout(timeout, found_rx.recv()).await.ok().flatten();
        self.stop_scan().await?;
        match &found {
            Some((device, _)) => info!("Found device {} ({})", device.address, device.display_name()),
            None => info!("Device {} not found within {:?}", address, timeout),
        }
        Ok(found)
    }

    /// Current aggregate ordered by first sighting, whether or not a scan is running.
    pub fn get_discovered_devices(&self) -> Vec<(Device, AdvertisementData)> {
        lock(&self.aggregator).snapshot()
    }

    async fn internal_scan_task(
        mut events: mpsc::Receiver<ScanEvent>,
        aggregator: SharedAggregator,
        callback: ScanCallback,
        config: ScannerConfig,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel_token.cancelled() => break,
                event = events.recv() => match event {
                    Some(ScanEvent::Sighting(raw)) => {
                        if let Some(rssi) = raw.rssi {
                            if rssi < config.rssi_threshold {
                                debug!("Ignoring {:?} below RSSI threshold ({} dBm)", raw.address, rssi);
                                continue;
                            }
                        }
                        let update = lock(&aggregator).on_event(raw);
                        let Some(update) = update else { continue };
                        if !update.changed && config.suppress_unchanged {
                            continue;
                        }
                        debug!("Found device - {}: {:?}, RSSI: {:?}", update.device.address, update.device.name, update.device.rssi);
                        if catch_unwind(AssertUnwindSafe(|| callback(&update.device, &update.advertisement))).is_err() {
                            error!("Scan callback panicked on {}", update.device.address);
                        }
                    }
                    Some(ScanEvent::Removed(address)) => {
                        if lock(&aggregator).remove(&address) {
                            debug!("Device {} removed by the stack", address);
                        }
                    }
                    None => {
                        warn!("Scan event stream has ended.");
                        break;
                    }
                },
            }
        }
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn lock(aggregator: &SharedAggregator) -> MutexGuard<'_, AdvertisementAggregator> {
    aggregator.lock().unwrap_or_else(PoisonError::into_inner)
}

fn into_scan_error(e: BleError) -> BleError {
    match e {
        BleError::Scan(_) | BleError::NotSupported(_) => e,
        other => BleError::Scan(other.to_string()),
    }
}
