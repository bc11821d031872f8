//! Simulated Peripheral
//!
//! In-memory implementation of the peripheral traits. Used by the tests and
//! by the binary when no hardware backend is compiled in.

use crate::domain::error::TransportError;
use crate::domain::models::{Capabilities, EndpointId, WriteMode};
use crate::infrastructure::bluetooth::peripheral::{
    DeviceFilter, DisconnectHandler, Endpoint, PeripheralDirectory, PeripheralHandle,
    ServiceGrouping, Subscription, ValueHandler,
};
use crate::infrastructure::bluetooth::protocol;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Directory that hands out a fixed device, or aborts like a cancelled chooser
#[derive(Default)]
pub struct SimulatedDirectory {
    device: Mutex<Option<Arc<SimulatedPeripheral>>>,
    filters: Mutex<Vec<DeviceFilter>>,
}

impl SimulatedDirectory {
    /// A directory whose chooser is always cancelled
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(device: Arc<SimulatedPeripheral>) -> Self {
        Self {
            device: Mutex::new(Some(device)),
            filters: Mutex::new(Vec::new()),
        }
    }

    pub fn set_device(&self, device: Option<Arc<SimulatedPeripheral>>) {
        *lock(&self.device) = device;
    }

    /// Filters received so far, oldest first
    pub fn filters(&self) -> Vec<DeviceFilter> {
        lock(&self.filters).clone()
    }
}

#[async_trait]
impl PeripheralDirectory for SimulatedDirectory {
    async fn select_device(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Arc<dyn PeripheralHandle>, TransportError> {
        lock(&self.filters).push(filter.clone());
        let device = lock(&self.device).clone();
        match device {
            Some(device) => {
                debug!(device = %device.name, "Simulated device selected");
                Ok(device as Arc<dyn PeripheralHandle>)
            }
            None => Err(TransportError::SelectionAborted),
        }
    }
}

/// A peripheral with a scripted service layout
pub struct SimulatedPeripheral {
    name: String,
    groupings: Vec<Arc<SimulatedGrouping>>,
    link_failure: Mutex<Option<String>>,
    connected: AtomicBool,
    link_attempts: AtomicUsize,
    disconnect_handlers: Mutex<Vec<DisconnectHandler>>,
}

impl SimulatedPeripheral {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groupings: Vec::new(),
            link_failure: Mutex::new(None),
            connected: AtomicBool::new(false),
            link_attempts: AtomicUsize::new(0),
            disconnect_handlers: Mutex::new(Vec::new()),
        }
    }

    /// A UART-style device: one vendor grouping whose write endpoint echoes
    /// every payload back on its notify endpoint
    pub fn echo_device(name: impl Into<String>) -> Arc<Self> {
        let rx = SimulatedEndpoint::new("fff1", Capabilities::notify());
        let tx = SimulatedEndpoint::new(
            "fff2",
            Capabilities::write().with_write_without_response(),
        );
        tx.echo_into(&rx);

        Self::new(name)
            .with_grouping(SimulatedGrouping::new("battery_service"))
            .with_grouping(
                SimulatedGrouping::new(protocol::VENDOR_SERVICE_UUID)
                    .with_endpoint(rx)
                    .with_endpoint(tx),
            )
            .into_shared()
    }

    pub fn with_grouping(mut self, grouping: SimulatedGrouping) -> Self {
        self.groupings.push(Arc::new(grouping));
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Make subsequent link attempts fail
    pub fn fail_link(&self, reason: Option<&str>) {
        *lock(&self.link_failure) = reason.map(str::to_string);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn link_attempts(&self) -> usize {
        self.link_attempts.load(Ordering::SeqCst)
    }

    pub fn disconnect_observers(&self) -> usize {
        lock(&self.disconnect_handlers).len()
    }

    /// Drop the link and notify every registered observer
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let handlers = lock(&self.disconnect_handlers).clone();
        debug!(device = %self.name, observers = handlers.len(), "Simulated disconnect");
        for handler in handlers {
            handler();
        }
    }
}

#[async_trait]
impl PeripheralHandle for SimulatedPeripheral {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        lock(&self.disconnect_handlers).push(handler);
    }

    async fn connect_link(&self) -> Result<(), TransportError> {
        self.link_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = lock(&self.link_failure).clone() {
            return Err(TransportError::LinkFailure(reason));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn service_groupings(&self) -> Result<Vec<Arc<dyn ServiceGrouping>>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        Ok(self
            .groupings
            .iter()
            .map(|g| g.clone() as Arc<dyn ServiceGrouping>)
            .collect())
    }
}

pub struct SimulatedGrouping {
    id: String,
    endpoints: Vec<Arc<SimulatedEndpoint>>,
}

impl SimulatedGrouping {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoints: Vec::new(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: Arc<SimulatedEndpoint>) -> Self {
        self.endpoints.push(endpoint);
        self
    }
}

#[async_trait]
impl ServiceGrouping for SimulatedGrouping {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn endpoints(&self) -> Result<Vec<Arc<dyn Endpoint>>, TransportError> {
        Ok(self
            .endpoints
            .iter()
            .map(|e| e.clone() as Arc<dyn Endpoint>)
            .collect())
    }
}

/// A write observed by a simulated endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub mode: WriteMode,
    pub data: Vec<u8>,
}

type Subscribers = Arc<Mutex<Vec<(u64, ValueHandler)>>>;

pub struct SimulatedEndpoint {
    id: EndpointId,
    capabilities: Capabilities,
    subscribers: Subscribers,
    next_token: AtomicU64,
    writes: Mutex<Vec<RecordedWrite>>,
    write_failure: Mutex<Option<String>>,
    echo_target: Mutex<Option<Weak<SimulatedEndpoint>>>,
}

impl SimulatedEndpoint {
    pub fn new(id: impl Into<String>, capabilities: Capabilities) -> Arc<Self> {
        Arc::new(Self {
            id: EndpointId::new(id),
            capabilities,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_token: AtomicU64::new(0),
            writes: Mutex::new(Vec::new()),
            write_failure: Mutex::new(None),
            echo_target: Mutex::new(None),
        })
    }

    /// Forward every successful write to `target` as a notification
    pub fn echo_into(&self, target: &Arc<SimulatedEndpoint>) {
        *lock(&self.echo_target) = Some(Arc::downgrade(target));
    }

    /// Make subsequent writes fail
    pub fn fail_writes(&self, reason: Option<&str>) {
        *lock(&self.write_failure) = reason.map(str::to_string);
    }

    /// Push a value-change event to every subscriber
    pub fn notify(&self, data: &[u8]) {
        // Handlers run outside the lock so they may cancel their own subscription.
        let handlers: Vec<ValueHandler> = lock(&self.subscribers)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(data.to_vec());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).len()
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        lock(&self.writes).clone()
    }

    fn record_write(&self, mode: WriteMode, data: &[u8]) -> Result<(), TransportError> {
        lock(&self.writes).push(RecordedWrite {
            mode,
            data: data.to_vec(),
        });
        if let Some(reason) = lock(&self.write_failure).clone() {
            return Err(TransportError::Write(reason));
        }

        let target = lock(&self.echo_target).as_ref().and_then(Weak::upgrade);
        if let Some(target) = target {
            target.notify(data);
        }
        Ok(())
    }
}

#[async_trait]
impl Endpoint for SimulatedEndpoint {
    fn id(&self) -> EndpointId {
        self.id.clone()
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn subscribe(&self, handler: ValueHandler) -> Result<Subscription, TransportError> {
        if !self.capabilities.notify {
            return Err(TransportError::Gatt(format!(
                "{} does not support notifications",
                self.id
            )));
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        lock(&self.subscribers).push((token, handler));

        let subscribers = Arc::downgrade(&self.subscribers);
        Ok(Subscription::new(move || {
            if let Some(subscribers) = subscribers.upgrade() {
                lock(&subscribers).retain(|(t, _)| *t != token);
            }
        }))
    }

    async fn write_acknowledged(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.capabilities.write {
            return Err(TransportError::Write(format!(
                "{} does not support acknowledged writes",
                self.id
            )));
        }
        self.record_write(WriteMode::WithResponse, data)
    }

    async fn write_unacknowledged(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.capabilities.write_without_response {
            return Err(TransportError::Write(format!(
                "{} does not support writes without response",
                self.id
            )));
        }
        self.record_write(WriteMode::WithoutResponse, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_directory_aborts_without_device() {
        let directory = SimulatedDirectory::new();
        let result = directory.select_device(&DeviceFilter::default()).await;
        assert!(matches!(result, Err(TransportError::SelectionAborted)));
        assert_eq!(directory.filters().len(), 1);
    }

    #[tokio::test]
    async fn test_groupings_require_link() {
        let peripheral = SimulatedPeripheral::new("dev").into_shared();
        assert!(matches!(
            peripheral.service_groupings().await,
            Err(TransportError::NotConnected)
        ));

        peripheral.fail_link(Some("out of range"));
        assert_eq!(
            peripheral.connect_link().await,
            Err(TransportError::LinkFailure("out of range".to_string()))
        );

        peripheral.fail_link(None);
        peripheral.connect_link().await.unwrap();
        assert!(peripheral.service_groupings().await.unwrap().is_empty());
        assert_eq!(peripheral.link_attempts(), 2);
    }

    #[tokio::test]
    async fn test_echo_and_unsubscribe() {
        let rx = SimulatedEndpoint::new("rx", Capabilities::notify());
        let tx = SimulatedEndpoint::new("tx", Capabilities::write());
        tx.echo_into(&rx);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let subscription = rx
            .subscribe(Arc::new(move |data: Vec<u8>| lock(&sink).push(data)))
            .await
            .unwrap();
        assert_eq!(rx.subscriber_count(), 1);

        tx.write_acknowledged(b"ping").await.unwrap();
        assert_eq!(*lock(&received), vec![b"ping".to_vec()]);
        assert_eq!(tx.writes()[0].mode, WriteMode::WithResponse);

        drop(subscription);
        assert_eq!(rx.subscriber_count(), 0);
        tx.write_acknowledged(b"pong").await.unwrap();
        assert_eq!(lock(&received).len(), 1);
    }

    #[tokio::test]
    async fn test_write_mode_must_be_supported() {
        let tx = SimulatedEndpoint::new("tx", Capabilities::write());
        assert!(tx.write_unacknowledged(b"x").await.is_err());
        assert!(tx.writes().is_empty());

        tx.fail_writes(Some("gatt busy"));
        assert_eq!(
            tx.write_acknowledged(b"x").await,
            Err(TransportError::Write("gatt busy".to_string()))
        );
        assert_eq!(tx.writes().len(), 1);
    }
}
