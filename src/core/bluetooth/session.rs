//! Session façade for one peripheral connection
//! This module ties a transport, the lifecycle state machine, the GATT tree
//! and the notification router together behind one async API.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::session_config::SessionConfig;
use crate::core::bluetooth::gatt::{Characteristic, GattTree, TreeResolver};
use crate::core::bluetooth::lifecycle::{ConnectionState, Lifecycle, LinkState};
use crate::core::bluetooth::notification::NotificationRouter;
use crate::core::bluetooth::transport::{
    DisconnectReason, EventSender, Transport, TransportEvent,
};
use crate::core::bluetooth::types::CharacteristicRef;
use crate::error::{BleError, Result};

/// Invoked with the peer address when the peer drops the link.
pub type DisconnectedCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TeardownOrigin {
    User,
    Peer,
    ConnectAborted,
}

struct EventPump {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Everything guarded by the session mutex.
struct Shared {
    lifecycle: Lifecycle,
    address: Option<String>,
    tree: Option<Arc<GattTree>>,
    /// Bumped whenever the cached tree becomes invalid
    tree_epoch: u64,
    router: NotificationRouter,
    pump: Option<EventPump>,
    on_disconnected: Option<DisconnectedCallback>,
}

struct SessionInner {
    transport: Arc<dyn Transport>,
    config: SessionConfig,
    shared: Mutex<Shared>,
    /// Serialises request/response operations in issuance order
    op_lock: tokio::sync::Mutex<()>,
    link: watch::Receiver<LinkState>,
}

/// A client session with one peripheral over one transport.
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let lifecycle = Lifecycle::new();
        let link = lifecycle.subscribe();
        Self {
            inner: Arc::new(SessionInner {
                transport,
                config,
                shared: Mutex::new(Shared {
                    lifecycle,
                    address: None,
                    tree: None,
                    tree_epoch: 0,
                    router: NotificationRouter::new(),
                    pump: None,
                    on_disconnected: None,
                }),
                op_lock: tokio::sync::Mutex::new(()),
                link,
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }

    /// Address of the current or most recent connection.
    pub fn address(&self) -> Option<String> {
        self.inner.shared().address.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared().lifecycle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observes lifecycle transitions.
    pub fn state_changes(&self) -> watch::Receiver<LinkState> {
        self.inner.link.clone()
    }

    /// Registers the callback run after the peer drops the link.
    pub fn set_disconnected_callback<F>(&self, callback: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.inner.shared().on_disconnected = Some(Arc::new(callback));
    }

    /// Connects to `address`. On failure or timeout the pending native
    /// connect is cancelled and the session is back at `Disconnected`.
    pub async fn connect(&self, address: &str, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;

        let (generation, events) = {
            let mut shared = inner.shared();
            if shared.lifecycle.state() == ConnectionState::Connected
                && shared.address.as_deref() == Some(address)
            {
                info!("Device {} already connected.", address);
                return Ok(());
            }
            let generation = shared.lifecycle.begin_connect()?;
            shared.address = Some(address.to_string());
            shared.tree = None;
            shared.router.clear();

            let (tx, rx) = mpsc::channel(inner.config.event_channel_capacity.max(1));
            let link_lost = CancellationToken::new();
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(run_event_pump(
                Arc::downgrade(inner),
                generation,
                rx,
                link_lost.clone(),
                cancel.clone(),
            ));
            shared.pump = Some(EventPump { cancel, handle });
            (generation, EventSender::new(tx, link_lost))
        };

        info!(
            "Initiating connection #{} to {} via {}...",
            generation,
            address,
            inner.transport.name()
        );
        let mut link = inner.link.clone();
        let outcome = tokio::select! {
            result = tokio::time::timeout(timeout, inner.transport.connect(address, events)) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(into_connection_error(e)),
                Err(_) => {
                    warn!("Connection to {} timed out after {:?}", address, timeout);
                    Err(BleError::Timeout)
                }
            },
            _ = wait_until(&mut link, |s| s.generation != generation || s.state != ConnectionState::Connecting) => {
                Err(BleError::Connection("connection was torn down while connecting".to_string()))
            }
        };

        match outcome {
            Ok(()) => {
                let connected = inner.shared().lifecycle.connect_succeeded(generation);
                if connected {
                    info!("Connected to {}", address);
                    return Ok(());
                }
                inner.wait_for_teardown(generation).await;
                Err(BleError::Connection("link dropped while connecting".to_string()))
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", address, e);
                if let Err(cleanup) = inner.teardown(generation, TeardownOrigin::ConnectAborted).await {
                    debug!("Cancelling the pending connect failed: {}", cleanup);
                }
                Err(e)
            }
        }
    }

    /// Tears the connection down. Concurrent calls, and a concurrent peer
    /// disconnect, share a single cleanup; every caller returns once the
    /// session is `Disconnected`.
    pub async fn disconnect(&self) -> Result<()> {
        let (generation, state) = {
            let shared = self.inner.shared();
            (shared.lifecycle.generation(), shared.lifecycle.state())
        };
        if state == ConnectionState::Disconnected {
            debug!("disconnect() on a session that is not connected");
            return Ok(());
        }
        self.inner.teardown(generation, TeardownOrigin::User).await
    }

    /// Returns the resolved GATT tree, running discovery on first use.
    /// Repeated calls return the same tree without touching the transport.
    pub async fn get_services(&self) -> Result<Arc<GattTree>> {
        let _op = self.inner.op_lock.lock().await;
        self.inner.resolve_tree().await
    }

    pub async fn read_characteristic(&self, reference: impl Into<CharacteristicRef>) -> Result<Vec<u8>> {
        let reference = reference.into();
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let (generation, characteristic) = inner.characteristic(reference).await?;

        let value = inner
            .guarded(
                generation,
                inner.config.operation_timeout(),
                inner.transport.read(characteristic.handle),
            )
            .await?;
        debug!("Read {} bytes from 0x{:04x}", value.len(), characteristic.handle);
        Ok(value)
    }

    /// Writes `data`. A characteristic that supports only one kind of write
    /// gets that kind regardless of `with_response`.
    pub async fn write_characteristic(
        &self,
        reference: impl Into<CharacteristicRef>,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let reference = reference.into();
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let (generation, characteristic) = inner.characteristic(reference).await?;

        let with_response = coerce_write_kind(&characteristic, with_response)?;
        if !with_response && !inner.transport.capabilities().write_without_response {
            return Err(BleError::NotSupported(format!(
                "write without response on {}",
                inner.transport.name()
            )));
        }

        inner
            .guarded(
                generation,
                inner.config.operation_timeout(),
                inner.transport.write(characteristic.handle, data, with_response),
            )
            .await?;
        debug!(
            "Wrote {} bytes to 0x{:04x} (response: {})",
            data.len(),
            characteristic.handle,
            with_response
        );
        Ok(())
    }

    /// Subscribes to value changes. The callback runs on the event pump and
    /// replaces any callback already registered for the characteristic.
    pub async fn start_notify<F>(&self, reference: impl Into<CharacteristicRef>, callback: F) -> Result<()>
    where
        F: Fn(u16, &[u8]) + Send + Sync + 'static,
    {
        let reference = reference.into();
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        inner.connected_generation()?;
        if !inner.transport.capabilities().notifications {
            return Err(BleError::NotSupported(format!(
                "notifications on {}",
                inner.transport.name()
            )));
        }

        let (generation, characteristic) = inner.characteristic(reference).await?;
        if !characteristic.properties.can_subscribe() {
            return Err(BleError::NotSupported(format!(
                "characteristic {} supports neither notify nor indicate",
                characteristic.uuid
            )));
        }
        let handle = characteristic.handle;

        // Registered before subscribing so the first value is not lost.
        {
            let mut shared = inner.shared();
            if !shared.lifecycle.is_connected(generation) {
                return Err(BleError::NotConnected);
            }
            shared.router.register(handle, Arc::new(callback));
        }

        let subscribed = inner
            .guarded(
                generation,
                inner.config.operation_timeout(),
                inner.transport.subscribe(handle),
            )
            .await;
        if let Err(e) = subscribed {
            inner.shared().router.unregister(handle);
            return Err(e);
        }
        info!("Notifications enabled on {} (0x{:04x})", characteristic.uuid, handle);
        Ok(())
    }

    pub async fn stop_notify(&self, reference: impl Into<CharacteristicRef>) -> Result<()> {
        let reference = reference.into();
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let (generation, characteristic) = inner.characteristic(reference).await?;

        let result = inner
            .guarded(
                generation,
                inner.config.operation_timeout(),
                inner.transport.unsubscribe(characteristic.handle),
            )
            .await;
        inner.shared().router.unregister(characteristic.handle);
        if result.is_ok() {
            info!("Notifications disabled on 0x{:04x}", characteristic.handle);
        }
        result
    }

    pub async fn read_descriptor(&self, handle: u16) -> Result<Vec<u8>> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let generation = inner.descriptor(handle).await?;
        inner
            .guarded(
                generation,
                inner.config.operation_timeout(),
                inner.transport.read_descriptor(handle),
            )
            .await
    }

    pub async fn write_descriptor(&self, handle: u16, data: &[u8]) -> Result<()> {
        let inner = &self.inner;
        let _op = inner.op_lock.lock().await;
        let generation = inner.descriptor(handle).await?;
        inner
            .guarded(
                generation,
                inner.config.operation_timeout(),
                inner.transport.write_descriptor(handle, data),
            )
            .await
    }
}

impl SessionInner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connected_generation(&self) -> Result<u64> {
        let shared = self.shared();
        if shared.lifecycle.state() == ConnectionState::Connected {
            Ok(shared.lifecycle.generation())
        } else {
            Err(BleError::NotConnected)
        }
    }

    /// Runs `operation` under `timeout`, aborting with `NotConnected` as soon
    /// as `generation` stops being connected.
    async fn guarded<T>(
        &self,
        generation: u64,
        timeout: Duration,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let mut link = self.link.clone();
        tokio::select! {
            result = tokio::time::timeout(timeout, operation) => result?,
            _ = wait_until(&mut link, |s| s.generation != generation || s.state != ConnectionState::Connected) => {
                Err(BleError::NotConnected)
            }
        }
    }

    /// Requires `op_lock` to be held.
    async fn resolve_tree(&self) -> Result<Arc<GattTree>> {
        let attempts = self.config.max_discovery_attempts.max(1);
        for attempt in 1..=attempts {
            let (generation, epoch) = {
                let shared = self.shared();
                if shared.lifecycle.state() != ConnectionState::Connected {
                    return Err(BleError::NotConnected);
                }
                if let Some(tree) = &shared.tree {
                    return Ok(tree.clone());
                }
                (shared.lifecycle.generation(), shared.tree_epoch)
            };

            let tree = self
                .guarded(
                    generation,
                    self.config.discovery_timeout(),
                    TreeResolver::resolve(self.transport.as_ref()),
                )
                .await?;

            {
                let mut shared = self.shared();
                if !shared.lifecycle.is_connected(generation) {
                    return Err(BleError::NotConnected);
                }
                if shared.tree_epoch == epoch {
                    let tree = Arc::new(tree);
                    shared.tree = Some(tree.clone());
                    return Ok(tree);
                }
            }
            warn!(
                "Services changed during discovery (attempt {}/{}), restarting",
                attempt, attempts
            );
        }
        Err(BleError::Discovery(format!(
            "services kept changing over {} discovery attempts",
            attempts
        )))
    }

    async fn characteristic(&self, reference: CharacteristicRef) -> Result<(u64, Characteristic)> {
        let tree = self.resolve_tree().await?;
        let generation = self.connected_generation()?;
        let characteristic = tree.find(reference)?.clone();
        Ok((generation, characteristic))
    }

    /// Checks that `handle` names a discovered descriptor.
    async fn descriptor(&self, handle: u16) -> Result<u64> {
        self.connected_generation()?;
        if !self.transport.capabilities().descriptors {
            return Err(BleError::NotSupported(format!(
                "descriptors on {}",
                self.transport.name()
            )));
        }
        let tree = self.resolve_tree().await?;
        if tree.descriptor_by_handle(handle).is_none() {
            return Err(BleError::NotFound(format!("descriptor handle 0x{:04x}", handle)));
        }
        self.connected_generation()
    }

    async fn wait_for_teardown(&self, generation: u64) {
        let mut link = self.link.clone();
        wait_until(&mut link, |s| {
            s.generation != generation || s.state == ConnectionState::Disconnected
        })
        .await;
    }

    /// Ends `generation`. Only the caller that wins the teardown claim runs
    /// cleanup; the others wait for it to finish, except the event pump,
    /// which just stops.
    async fn teardown(&self, generation: u64, origin: TeardownOrigin) -> Result<()> {
        let claimed = {
            let mut shared = self.shared();
            match shared.lifecycle.claim_teardown(generation) {
                Some(claim) => {
                    let dropped = shared.router.clear();
                    if !dropped.is_empty() {
                        debug!("Dropped notification callbacks for handles {:?}", dropped);
                    }
                    shared.tree = None;
                    shared.tree_epoch += 1;
                    let pump = shared.pump.take();
                    let on_disconnected = match origin {
                        TeardownOrigin::Peer => shared.on_disconnected.clone(),
                        _ => None,
                    };
                    let address = shared.address.clone().unwrap_or_default();
                    Some((claim, pump, on_disconnected, address))
                }
                None => None,
            }
        };

        let Some((claim, pump, on_disconnected, address)) = claimed else {
            if origin != TeardownOrigin::Peer {
                debug!("Teardown of connection #{} already in progress, waiting", generation);
                self.wait_for_teardown(generation).await;
            }
            return Ok(());
        };

        info!(
            "Tearing down connection #{} to {} ({:?})",
            claim.generation(),
            address,
            origin
        );
        if let Some(pump) = pump {
            pump.cancel.cancel();
            // The peer path runs on the pump itself.
            if origin != TeardownOrigin::Peer {
                if let Err(e) = pump.handle.await {
                    error!("Event pump for {} ended abnormally: {}", address, e);
                }
            }
        }

        let result = match tokio::time::timeout(
            self.config.operation_timeout(),
            self.transport.disconnect(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(BleError::Timeout),
        };
        if let Err(e) = &result {
            error!("Native disconnect for {} failed: {}", address, e);
        }

        self.shared().lifecycle.finish_teardown(claim);
        info!("Disconnected from {}", address);

        if let Some(callback) = on_disconnected {
            if catch_unwind(AssertUnwindSafe(|| callback(&address))).is_err() {
                error!("Disconnected callback for {} panicked", address);
            }
        }
        result
    }

    /// Returns false once the pump should stop.
    async fn handle_event(&self, generation: u64, event: TransportEvent) -> bool {
        match event {
            TransportEvent::Notification { handle, value } => {
                let delivery = {
                    let shared = self.shared();
                    if !shared.lifecycle.is_connected(generation) {
                        return true;
                    }
                    shared.router.route(handle)
                };
                if let Some(delivery) = delivery {
                    delivery.run(&value);
                }
                true
            }
            TransportEvent::ServicesChanged => {
                let mut shared = self.shared();
                if shared.lifecycle.generation() == generation {
                    shared.tree = None;
                    shared.tree_epoch += 1;
                    info!("Services changed on connection #{}, cached tree dropped", generation);
                }
                true
            }
            TransportEvent::Disconnected(reason) => {
                info!("Connection #{} lost ({:?})", generation, reason);
                if let Err(e) = self.teardown(generation, TeardownOrigin::Peer).await {
                    warn!("Cleanup after link loss reported: {}", e);
                }
                false
            }
        }
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let shared = self.shared.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(pump) = shared.pump.take() {
            pump.cancel.cancel();
        }
        if !matches!(
            shared.lifecycle.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }
        warn!("Session for {:?} dropped while connected, releasing the link", shared.address);
        let transport = self.transport.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = transport.disconnect().await {
                        error!("Releasing the link of a dropped session failed: {}", e);
                    }
                });
            }
            Err(_) => error!("No runtime available to release the link of a dropped session"),
        }
    }
}

/// One pump per connection. Delivers push events in arrival order until the
/// connection ends or the session cancels it.
async fn run_event_pump(
    inner: Weak<SessionInner>,
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
    link_lost: CancellationToken,
    cancel: CancellationToken,
) {
    debug!("Event pump for connection #{} started", generation);
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None if link_lost.is_cancelled() => TransportEvent::Disconnected(DisconnectReason::Peer),
                None => break,
            },
            // Reached when the disconnect event itself was dropped on a full channel.
            _ = link_lost.cancelled() => TransportEvent::Disconnected(DisconnectReason::Peer),
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !inner.handle_event(generation, event).await {
            break;
        }
    }
    debug!("Event pump for connection #{} stopped", generation);
}

async fn wait_until<F>(link: &mut watch::Receiver<LinkState>, predicate: F)
where
    F: FnMut(&LinkState) -> bool,
{
    let _ = link.wait_for(predicate).await.map(|_| ());
}

fn into_connection_error(e: BleError) -> BleError {
    match e {
        BleError::Connection(_) | BleError::Timeout | BleError::NotSupported(_) => e,
        other => BleError::Connection(other.to_string()),
    }
}

/// Picks the write kind the characteristic can actually perform.
fn coerce_write_kind(characteristic: &Characteristic, with_response: bool) -> Result<bool> {
    let props = characteristic.properties;
    if !props.can_write() {
        return Err(BleError::NotSupported(format!(
            "characteristic {} is not writable",
            characteristic.uuid
        )));
    }
    if with_response && !props.write {
        warn!(
            "Characteristic {} only supports write without response, dropping the response request",
            characteristic.uuid
        );
        return Ok(false);
    }
    if !with_response && !props.write_without_response {
        warn!(
            "Characteristic {} does not support write without response, writing with response",
            characteristic.uuid
        );
        return Ok(true);
    }
    Ok(with_response)
}
