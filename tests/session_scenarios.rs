use async_trait::async_trait;
use ble_auto_connect::domain::error::MissingEndpoint;
use ble_auto_connect::domain::models::{Alert, Capabilities, WriteMode};
use ble_auto_connect::infrastructure::bluetooth::peripheral::{
    DeviceFilter, DisconnectHandler, PeripheralDirectory, PeripheralHandle, ServiceGrouping,
};
use ble_auto_connect::infrastructure::bluetooth::simulator::{
    SimulatedDirectory, SimulatedEndpoint, SimulatedGrouping, SimulatedPeripheral,
};
use ble_auto_connect::{
    AppEvent, SendOutcome, SessionConfig, SessionError, SessionManager, SessionState,
    TransportError,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

fn manager_with(
    directory: Arc<dyn PeripheralDirectory>,
) -> (SessionManager, mpsc::UnboundedReceiver<AppEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SessionManager::new(directory, SessionConfig::default(), tx), rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<AppEvent>) -> Vec<AppEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// One vendor grouping holding `endpoints` in order
fn single_grouping_device(
    name: &str,
    endpoints: Vec<Arc<SimulatedEndpoint>>,
) -> Arc<SimulatedPeripheral> {
    let grouping = endpoints
        .into_iter()
        .fold(SimulatedGrouping::new("fff0"), |g, e| g.with_endpoint(e));
    SimulatedPeripheral::new(name).with_grouping(grouping).into_shared()
}

#[tokio::test]
async fn test_write_then_notify_endpoints_connect() {
    let e1 = SimulatedEndpoint::new("E1", Capabilities::write());
    let e2 = SimulatedEndpoint::new("E2", Capabilities::notify());
    let device = single_grouping_device("WCH-BLE", vec![e1.clone(), e2.clone()]);
    let (manager, _rx) = manager_with(Arc::new(SimulatedDirectory::with_device(device)));

    manager.connect().await.unwrap();

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.state, SessionState::Connected);
    assert_eq!(snapshot.status, "Connected & Listening");
    assert_eq!(snapshot.notify_endpoint.unwrap().as_str(), "E2");
    assert_eq!(snapshot.write_endpoint.unwrap().as_str(), "E1");
    assert_eq!(e2.subscriber_count(), 1);

    // Acknowledged write is the only mode E1 offers
    assert_eq!(
        manager.send("hi").await,
        Ok(SendOutcome::Sent(WriteMode::WithResponse))
    );
    assert_eq!(e1.writes()[0].mode, WriteMode::WithResponse);
    assert_eq!(e1.writes()[0].data, b"hi".to_vec());
}

#[tokio::test]
async fn test_write_only_device_fails_discovery() {
    let e1 = SimulatedEndpoint::new("E1", Capabilities::write());
    let device = single_grouping_device("write-only", vec![e1]);
    let (manager, _rx) = manager_with(Arc::new(SimulatedDirectory::with_device(device)));

    assert_eq!(
        manager.connect().await,
        Err(SessionError::DiscoveryIncomplete {
            missing: MissingEndpoint::Notify
        })
    );
    assert_eq!(manager.state(), SessionState::Error);
    assert_eq!(
        manager.status_label(),
        "Error: no notify characteristic found"
    );
}

#[tokio::test]
async fn test_disconnect_after_connected() {
    let device = SimulatedPeripheral::echo_device("WCH-BLE");
    let (manager, mut rx) =
        manager_with(Arc::new(SimulatedDirectory::with_device(device.clone())));
    manager.connect().await.unwrap();
    drain(&mut rx);

    device.disconnect();

    assert_eq!(manager.state(), SessionState::Disconnected);
    assert_eq!(manager.status_label(), "Disconnected");
    assert_eq!(manager.send("hello").await, Ok(SendOutcome::NotReady));

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, AppEvent::Alert(Alert::Disconnected))));

    let snapshot = manager.snapshot();
    assert!(snapshot.notify_endpoint.is_none());
    assert!(snapshot.write_endpoint.is_none());
}

#[tokio::test]
async fn test_unacknowledged_write_preferred() {
    let both = SimulatedEndpoint::new(
        "tx",
        Capabilities::write().with_write_without_response(),
    );
    let rx_endpoint = SimulatedEndpoint::new("rx", Capabilities::notify());
    let device = single_grouping_device("uart", vec![both.clone(), rx_endpoint]);
    let (manager, _rx) = manager_with(Arc::new(SimulatedDirectory::with_device(device)));
    manager.connect().await.unwrap();

    assert_eq!(
        manager.send("ping").await,
        Ok(SendOutcome::Sent(WriteMode::WithoutResponse))
    );
    assert_eq!(both.writes()[0].mode, WriteMode::WithoutResponse);
}

#[tokio::test]
async fn test_echo_round_trip_updates_inbound_text() {
    let device = SimulatedPeripheral::echo_device("echo");
    let (manager, mut rx) = manager_with(Arc::new(SimulatedDirectory::with_device(device)));

    assert_eq!(manager.latest_inbound(), "No Data");
    manager.connect().await.unwrap();
    drain(&mut rx);

    manager.send("héllo wörld").await.unwrap();

    assert_eq!(manager.latest_inbound(), "héllo wörld");
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, AppEvent::MessageReceived(text) if text == "héllo wörld")));
}

#[tokio::test]
async fn test_reconnect_leaves_no_stale_subscription() {
    let old_rx = SimulatedEndpoint::new("old-rx", Capabilities::notify());
    let old_tx = SimulatedEndpoint::new("old-tx", Capabilities::write());
    let old_device = single_grouping_device("old", vec![old_rx.clone(), old_tx]);
    let directory = Arc::new(SimulatedDirectory::with_device(old_device.clone()));
    let (manager, _rx) = manager_with(directory.clone());
    manager.connect().await.unwrap();
    assert_eq!(old_rx.subscriber_count(), 1);

    let new_device = SimulatedPeripheral::echo_device("new");
    directory.set_device(Some(new_device));
    manager.connect().await.unwrap();

    assert_eq!(old_rx.subscriber_count(), 0);
    assert_eq!(manager.snapshot().device_name.as_deref(), Some("new"));

    // Late events from the abandoned device change nothing
    old_rx.notify(b"stale");
    old_device.disconnect();
    assert_eq!(manager.latest_inbound(), "No Data");
    assert_eq!(manager.state(), SessionState::Connected);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum DropPoint {
    /// Right after the link comes up, before discovery starts
    Link,
    /// While the services are being enumerated
    Discovery,
}

/// Drops the link at a chosen point of the connect flow
struct FlakyPeripheral {
    inner: Arc<SimulatedPeripheral>,
    drop_at: DropPoint,
}

#[async_trait]
impl PeripheralHandle for FlakyPeripheral {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        self.inner.on_disconnect(handler);
    }

    async fn connect_link(&self) -> Result<(), TransportError> {
        self.inner.connect_link().await?;
        if self.drop_at == DropPoint::Link {
            self.inner.disconnect();
        }
        Ok(())
    }

    async fn service_groupings(&self) -> Result<Vec<Arc<dyn ServiceGrouping>>, TransportError> {
        if self.drop_at == DropPoint::Discovery {
            self.inner.disconnect();
        }
        self.inner.service_groupings().await
    }
}

struct FixedDirectory {
    device: Arc<dyn PeripheralHandle>,
}

#[async_trait]
impl PeripheralDirectory for FixedDirectory {
    async fn select_device(
        &self,
        _filter: &DeviceFilter,
    ) -> Result<Arc<dyn PeripheralHandle>, TransportError> {
        Ok(self.device.clone())
    }
}

async fn assert_drop_routes_to_disconnected(drop_at: DropPoint) {
    let device = Arc::new(FlakyPeripheral {
        inner: SimulatedPeripheral::echo_device("flaky"),
        drop_at,
    });
    let (manager, mut rx) = manager_with(Arc::new(FixedDirectory { device }));

    assert_eq!(
        manager.connect().await,
        Err(SessionError::UnexpectedDisconnect)
    );
    assert_eq!(manager.state(), SessionState::Disconnected);
    assert_eq!(manager.status_label(), "Disconnected");
    assert!(drain(&mut rx)
        .iter()
        .any(|e| matches!(e, AppEvent::Alert(Alert::Disconnected))));
    assert_eq!(manager.send("hello").await, Ok(SendOutcome::NotReady));
}

#[tokio::test]
async fn test_disconnect_while_connecting() {
    assert_drop_routes_to_disconnected(DropPoint::Link).await;
}

#[tokio::test]
async fn test_disconnect_during_discovery() {
    assert_drop_routes_to_disconnected(DropPoint::Discovery).await;
}

#[tokio::test]
async fn test_write_without_response_only_endpoint() {
    let tx = SimulatedEndpoint::new("tx", Capabilities::write_without_response());
    let rx_endpoint = SimulatedEndpoint::new("rx", Capabilities::notify());
    let device = single_grouping_device("uart", vec![rx_endpoint, tx.clone()]);
    let (manager, _rx) = manager_with(Arc::new(SimulatedDirectory::with_device(device)));
    manager.connect().await.unwrap();

    assert_eq!(
        manager.send("ping").await,
        Ok(SendOutcome::Sent(WriteMode::WithoutResponse))
    );
    assert_eq!(tx.writes()[0].mode, WriteMode::WithoutResponse);
}

/// Holds selection open until released
struct GatedDirectory {
    gate: Arc<Notify>,
    device: Arc<SimulatedPeripheral>,
}

#[async_trait]
impl PeripheralDirectory for GatedDirectory {
    async fn select_device(
        &self,
        _filter: &DeviceFilter,
    ) -> Result<Arc<dyn PeripheralHandle>, TransportError> {
        self.gate.notified().await;
        Ok(self.device.clone() as Arc<dyn PeripheralHandle>)
    }
}

#[tokio::test]
async fn test_second_connect_rejected_while_busy() {
    let gate = Arc::new(Notify::new());
    let directory = Arc::new(GatedDirectory {
        gate: gate.clone(),
        device: SimulatedPeripheral::echo_device("slow"),
    });
    let (manager, _rx) = manager_with(directory);

    let first = tokio::spawn({
        let manager = manager.clone();
        async move { manager.connect().await }
    });
    while manager.state() != SessionState::Scanning {
        tokio::task::yield_now().await;
    }

    assert_eq!(manager.connect().await, Err(SessionError::Busy));

    gate.notify_one();
    assert_eq!(first.await.unwrap(), Ok(()));
    assert_eq!(manager.state(), SessionState::Connected);
}
