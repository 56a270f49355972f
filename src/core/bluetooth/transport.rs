//! Capability interface implemented once per native Bluetooth stack.
//! The session and scanner depend only on these traits.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::warn;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::types::{CharacteristicProperties, ScanEvent};
use crate::error::{BleError, Result};

/// Inclusive attribute handle range owned by a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub struct HandleRange {
    pub start: u16,
    pub end: u16,
}

impl HandleRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, handle: u16) -> bool {
        self.start <= handle && handle <= self.end
    }
}

/// A service as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawService {
    pub uuid: Uuid,
    /// Start handle, or a transport-assigned identifier on delegate stacks
    pub handle: u16,
    /// Present on handle-based transports
    pub range: Option<HandleRange>,
}

/// A characteristic as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCharacteristic {
    pub uuid: Uuid,
    pub handle: u16,
    pub properties: CharacteristicProperties,
    /// Owning service handle when the native stack reports containment directly
    pub service_handle: Option<u16>,
}

/// A descriptor as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDescriptor {
    pub uuid: Uuid,
    pub handle: u16,
    /// Owning characteristic handle, when the stack reports it
    pub characteristic_handle: Option<u16>,
}

/// What a transport can do beyond the mandatory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub descriptors: bool,
    pub notifications: bool,
    pub write_without_response: bool,
}

/// Why a connection ended from the stack's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer or the stack dropped the link
    Peer,
    /// The transport lost its own channel to the stack
    TransportClosed,
}

/// Unsolicited events pushed by a transport while connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Notification { handle: u16, value: Vec<u8> },
    ServicesChanged,
    Disconnected(DisconnectReason),
}

/// Sending half handed to a transport for push events.
/// Safe to use from foreign threads: it never blocks.
///
/// A disconnect also trips `link_lost`, so it reaches the session even when
/// the channel is saturated with notifications.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<TransportEvent>,
    link_lost: CancellationToken,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<TransportEvent>, link_lost: CancellationToken) -> Self {
        Self { tx, link_lost }
    }

    /// Hands an event to the session without blocking the delivery context.
    /// Returns false when the event was dropped.
    pub fn push(&self, event: TransportEvent) -> bool {
        if matches!(event, TransportEvent::Disconnected(_)) {
            self.link_lost.cancel();
        }
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Session event channel full, dropping {:?}", event);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Sending half handed to a scan transport.
#[derive(Debug, Clone)]
pub struct ScanSink {
    tx: mpsc::Sender<ScanEvent>,
}

impl ScanSink {
    pub fn new(tx: mpsc::Sender<ScanEvent>) -> Self {
        Self { tx }
    }

    pub fn push(&self, event: ScanEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Scan channel full, dropping sighting");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Numbers connect attempts so a native connect that completes after its
/// caller gave up can be told apart from the current one.
#[derive(Debug, Clone, Default)]
pub struct ConnectAttempts(Arc<AtomicU64>);

impl ConnectAttempts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Invalidates every attempt started so far.
    pub fn abandon(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_current(&self, attempt: u64) -> bool {
        self.0.load(Ordering::SeqCst) == attempt
    }

    /// Drives `connect` on its own task so it keeps running if the caller
    /// stops awaiting. A connect that succeeds after `attempt` was abandoned
    /// runs `release` and reports a connection error.
    pub async fn run<C, R>(&self, attempt: u64, connect: C, release: R) -> Result<()>
    where
        C: Future<Output = Result<()>> + Send + 'static,
        R: Future<Output = ()> + Send + 'static,
    {
        let attempts = self.clone();
        tokio::spawn(async move {
            connect.await?;
            if attempts.is_current(attempt) {
                return Ok(());
            }
            warn!("Connect finished after it was abandoned, releasing it");
            release.await;
            Err(BleError::Connection("connect abandoned".to_string()))
        })
        .await
        .map_err(|e| BleError::Connection(format!("connect task aborted: {}", e)))?
    }
}

/// Connection-oriented operations of one native stack.
///
/// A transport instance drives at most one connection at a time. Results of
/// the discovery calls may come back in any order; the resolver sorts out
/// containment.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> Capabilities;

    /// Establishes the link. Push events for this connection go to `events`.
    async fn connect(&self, address: &str, events: EventSender) -> Result<()>;

    /// Releases the link and every native resource held for it.
    /// Must tolerate being called after the peer already dropped the link.
    async fn disconnect(&self) -> Result<()>;

    async fn discover_services(&self) -> Result<Vec<RawService>>;

    async fn discover_characteristics(&self) -> Result<Vec<RawCharacteristic>>;

    async fn discover_descriptors(&self) -> Result<Vec<RawDescriptor>> {
        Err(BleError::NotSupported(format!("descriptor discovery on {}", self.name())))
    }

    async fn read(&self, handle: u16) -> Result<Vec<u8>>;

    async fn write(&self, handle: u16, data: &[u8], with_response: bool) -> Result<()>;

    async fn subscribe(&self, handle: u16) -> Result<()> {
        let _ = handle;
        Err(BleError::NotSupported(format!("notifications on {}", self.name())))
    }

    async fn unsubscribe(&self, handle: u16) -> Result<()> {
        let _ = handle;
        Err(BleError::NotSupported(format!("notifications on {}", self.name())))
    }

    async fn read_descriptor(&self, handle: u16) -> Result<Vec<u8>> {
        let _ = handle;
        Err(BleError::NotSupported(format!("descriptor read on {}", self.name())))
    }

    async fn write_descriptor(&self, handle: u16, data: &[u8]) -> Result<()> {
        let _ = (handle, data);
        Err(BleError::NotSupported(format!("descriptor write on {}", self.name())))
    }
}

/// Discovery side of a native stack.
#[async_trait]
pub trait ScanTransport: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Starts delivering sightings into `sink` until `stop_scan`.
    async fn start_scan(&self, sink: ScanSink) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;
}
