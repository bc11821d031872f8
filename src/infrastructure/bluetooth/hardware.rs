//! btleplug Backend
//!
//! Real BLE hardware behind the peripheral traits. There is no platform
//! chooser, so "selection" scans and takes the first peripheral whose name
//! matches the configured prefix (or any named peripheral without one).

use crate::domain::error::TransportError;
use crate::domain::models::{Capabilities, EndpointId};
use crate::infrastructure::bluetooth::peripheral::{
    DeviceFilter, DisconnectHandler, Endpoint, PeripheralDirectory, PeripheralHandle,
    ServiceGrouping, Subscription, ValueHandler,
};
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, Service, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Unsubscribe calls issued by dropped subscriptions, shared by every
/// peripheral the directory hands out
type PendingUnsubscribes = Arc<Mutex<Vec<JoinHandle<()>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn link_error(error: btleplug::Error) -> TransportError {
    TransportError::LinkFailure(error.to_string())
}

fn gatt_error(error: btleplug::Error) -> TransportError {
    match error {
        btleplug::Error::NotConnected => TransportError::NotConnected,
        other => TransportError::Gatt(other.to_string()),
    }
}

fn write_error(error: btleplug::Error) -> TransportError {
    match error {
        btleplug::Error::NotConnected => TransportError::NotConnected,
        other => TransportError::Write(other.to_string()),
    }
}

pub fn capabilities(properties: CharPropFlags) -> Capabilities {
    Capabilities {
        // Indicate-only characteristics (Service Changed) are not a data channel
        notify: properties.contains(CharPropFlags::NOTIFY),
        write: properties.contains(CharPropFlags::WRITE),
        write_without_response: properties.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
    }
}

pub fn matches_name_prefix(local_name: Option<&str>, prefix: Option<&str>) -> bool {
    match (local_name, prefix) {
        (Some(name), Some(prefix)) => name.starts_with(prefix),
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Let earlier unsubscribes finish so none lands after a new subscribe on
/// the same characteristic
async fn settle_unsubscribes(pending: &PendingUnsubscribes) {
    let tasks: Vec<JoinHandle<()>> = lock(pending).drain(..).collect();
    for task in tasks {
        if let Err(e) = task.await {
            debug!("Unsubscribe task ended abnormally: {}", e);
        }
    }
}

/// Scans the first adapter for a matching peripheral
pub struct HardwareDirectory {
    adapter: Adapter,
    name_prefix: Option<String>,
    scan_timeout: Duration,
    pending_unsubscribes: PendingUnsubscribes,
}

impl HardwareDirectory {
    pub async fn new(name_prefix: Option<String>, scan_timeout: Duration) -> anyhow::Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No Bluetooth adapter found"))?;
        info!("Using adapter: {}", adapter.adapter_info().await?);

        Ok(Self {
            adapter,
            name_prefix,
            scan_timeout,
            pending_unsubscribes: Arc::new(Mutex::new(Vec::new())),
        })
    }

    async fn find_peripheral(&self) -> Result<Option<(Peripheral, String)>, btleplug::Error> {
        let deadline = Instant::now() + self.scan_timeout;
        while Instant::now() < deadline {
            for peripheral in self.adapter.peripherals().await? {
                let Some(properties) = peripheral.properties().await? else {
                    continue;
                };
                let local_name = properties.local_name;
                if matches_name_prefix(local_name.as_deref(), self.name_prefix.as_deref()) {
                    return Ok(local_name.map(|name| (peripheral, name)));
                }
            }
            sleep(SCAN_POLL_INTERVAL).await;
        }
        Ok(None)
    }
}

#[async_trait]
impl PeripheralDirectory for HardwareDirectory {
    async fn select_device(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Arc<dyn PeripheralHandle>, TransportError> {
        debug!(
            accept_all = filter.accept_all_devices,
            optional_services = filter.optional_services.len(),
            "Scanning for peripherals"
        );
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(link_error)?;

        let found = self.find_peripheral().await;
        if let Err(e) = self.adapter.stop_scan().await {
            debug!("Failed to stop scan cleanly: {}", e);
        }

        match found.map_err(link_error)? {
            Some((peripheral, name)) => {
                info!(device = %name, "Selected peripheral");
                let device = HardwarePeripheral::new(
                    self.adapter.clone(),
                    peripheral,
                    name,
                    self.pending_unsubscribes.clone(),
                );
                Ok(Arc::new(device) as Arc<dyn PeripheralHandle>)
            }
            None => {
                warn!("No matching peripheral found within {:?}", self.scan_timeout);
                Err(TransportError::SelectionAborted)
            }
        }
    }
}

pub struct HardwarePeripheral {
    adapter: Adapter,
    peripheral: Peripheral,
    name: String,
    disconnect_handlers: Arc<Mutex<Vec<DisconnectHandler>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    pending_unsubscribes: PendingUnsubscribes,
}

impl HardwarePeripheral {
    fn new(
        adapter: Adapter,
        peripheral: Peripheral,
        name: String,
        pending_unsubscribes: PendingUnsubscribes,
    ) -> Self {
        Self {
            adapter,
            peripheral,
            name,
            pending_unsubscribes,
            disconnect_handlers: Arc::new(Mutex::new(Vec::new())),
            watcher: Mutex::new(None),
        }
    }

    /// Forward adapter disconnect events for this peripheral to the handlers
    async fn watch_disconnects(&self) -> Result<(), TransportError> {
        if lock(&self.watcher).is_some() {
            return Ok(());
        }

        let mut events = self.adapter.events().await.map_err(link_error)?;
        let id: PeripheralId = self.peripheral.id();
        let handlers = self.disconnect_handlers.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(disconnected) = event {
                    if disconnected == id {
                        info!("Peripheral disconnected");
                        let current = lock(&handlers).clone();
                        for handler in current {
                            handler();
                        }
                    }
                }
            }
        });
        *lock(&self.watcher) = Some(task);
        Ok(())
    }
}

impl Drop for HardwarePeripheral {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.watcher).take() {
            task.abort();
        }
    }
}

#[async_trait]
impl PeripheralHandle for HardwarePeripheral {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        lock(&self.disconnect_handlers).push(handler);
    }

    async fn connect_link(&self) -> Result<(), TransportError> {
        self.watch_disconnects().await?;
        if !self.peripheral.is_connected().await.map_err(link_error)? {
            self.peripheral.connect().await.map_err(link_error)?;
        }
        info!(device = %self.name, "Link established");
        Ok(())
    }

    async fn service_groupings(&self) -> Result<Vec<Arc<dyn ServiceGrouping>>, TransportError> {
        self.peripheral.discover_services().await.map_err(gatt_error)?;
        let groupings = self
            .peripheral
            .services()
            .into_iter()
            .map(|service| {
                Arc::new(HardwareGrouping {
                    peripheral: self.peripheral.clone(),
                    pending_unsubscribes: self.pending_unsubscribes.clone(),
                    service,
                }) as Arc<dyn ServiceGrouping>
            })
            .collect();
        Ok(groupings)
    }
}

struct HardwareGrouping {
    peripheral: Peripheral,
    pending_unsubscribes: PendingUnsubscribes,
    service: Service,
}

#[async_trait]
impl ServiceGrouping for HardwareGrouping {
    fn id(&self) -> String {
        self.service.uuid.to_string()
    }

    async fn endpoints(&self) -> Result<Vec<Arc<dyn Endpoint>>, TransportError> {
        let endpoints = self
            .service
            .characteristics
            .iter()
            .map(|characteristic| {
                Arc::new(HardwareEndpoint {
                    peripheral: self.peripheral.clone(),
                    pending_unsubscribes: self.pending_unsubscribes.clone(),
                    characteristic: characteristic.clone(),
                }) as Arc<dyn Endpoint>
            })
            .collect();
        Ok(endpoints)
    }
}

struct HardwareEndpoint {
    peripheral: Peripheral,
    pending_unsubscribes: PendingUnsubscribes,
    characteristic: Characteristic,
}

impl HardwareEndpoint {
    async fn write(&self, data: &[u8], write_type: WriteType) -> Result<(), TransportError> {
        self.peripheral
            .write(&self.characteristic, data, write_type)
            .await
            .map_err(write_error)
    }
}

#[async_trait]
impl Endpoint for HardwareEndpoint {
    fn id(&self) -> EndpointId {
        EndpointId::new(self.characteristic.uuid.to_string())
    }

    fn capabilities(&self) -> Capabilities {
        capabilities(self.characteristic.properties)
    }

    async fn subscribe(&self, handler: ValueHandler) -> Result<Subscription, TransportError> {
        settle_unsubscribes(&self.pending_unsubscribes).await;

        let mut notifications = self.peripheral.notifications().await.map_err(gatt_error)?;
        self.peripheral
            .subscribe(&self.characteristic)
            .await
            .map_err(gatt_error)?;

        let uuid = self.characteristic.uuid;
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == uuid {
                    handler(notification.value);
                }
            }
        });

        let peripheral = self.peripheral.clone();
        let characteristic = self.characteristic.clone();
        let pending = self.pending_unsubscribes.clone();
        Ok(Subscription::new(move || {
            forwarder.abort();
            // Best effort; the link may already be gone
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let task = runtime.spawn(async move {
                    if let Err(e) = peripheral.unsubscribe(&characteristic).await {
                        debug!("Unsubscribe failed: {}", e);
                    }
                });
                lock(&pending).push(task);
            }
        }))
    }

    async fn write_acknowledged(&self, data: &[u8]) -> Result<(), TransportError> {
        self.write(data, WriteType::WithResponse).await
    }

    async fn write_unacknowledged(&self, data: &[u8]) -> Result<(), TransportError> {
        self.write(data, WriteType::WithoutResponse).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::WriteMode;

    #[test]
    fn test_capabilities_from_properties() {
        let caps = capabilities(CharPropFlags::NOTIFY | CharPropFlags::WRITE);
        assert!(caps.notify);
        assert_eq!(caps.write_mode(), Some(WriteMode::WithResponse));

        // Service Changed (0x2A05) must not win first-match over a UART notify
        let caps = capabilities(CharPropFlags::INDICATE);
        assert!(!caps.notify);
        assert_eq!(caps, Capabilities::NONE);

        let caps = capabilities(CharPropFlags::READ);
        assert_eq!(caps, Capabilities::NONE);
    }

    #[tokio::test]
    async fn test_subscribe_waits_for_pending_unsubscribes() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let pending: PendingUnsubscribes = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let task = tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            flag.store(true, Ordering::SeqCst);
        });
        lock(&pending).push(task);

        settle_unsubscribes(&pending).await;

        assert!(finished.load(Ordering::SeqCst));
        assert!(lock(&pending).is_empty());
    }

    #[test]
    fn test_name_prefix_matching() {
        assert!(matches_name_prefix(Some("WCH-BLE"), Some("WCH")));
        assert!(!matches_name_prefix(Some("Other"), Some("WCH")));
        assert!(matches_name_prefix(Some("Other"), None));
        assert!(!matches_name_prefix(None, None));
    }
}
