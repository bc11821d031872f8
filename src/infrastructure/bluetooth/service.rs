//! Session Manager
//!
//! Drives one peripheral session from device selection to a live duplex
//! text channel and surfaces everything that happens on the event channel.

use crate::domain::error::{SessionError, SessionStep, TransportError};
use crate::domain::models::{
    Alert, AppEvent, MessageSeverity, SendOutcome, SessionSnapshot, SessionState, StatusMessage,
};
use crate::domain::settings::{DiscoveryPolicy, OutboxPolicy, Settings};
use crate::infrastructure::bluetooth::discovery;
use crate::infrastructure::bluetooth::peripheral::{
    DeviceFilter, DisconnectHandler, PeripheralDirectory, ValueHandler,
};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::session::Session;
use anyhow::Result;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Resolved session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Service groupings advertised to the device chooser
    pub optional_services: Vec<Uuid>,
    pub discovery_policy: DiscoveryPolicy,
    pub outbox_policy: OutboxPolicy,
    /// `None` lets a hung transport call block forever
    pub step_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            optional_services: protocol::DEFAULT_OPTIONAL_SERVICES
                .iter()
                .filter_map(|s| protocol::parse_service_identifier(s).ok())
                .collect(),
            discovery_policy: DiscoveryPolicy::default(),
            outbox_policy: OutboxPolicy::default(),
            step_timeout: None,
        }
    }
}

impl SessionConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self {
            optional_services: protocol::parse_service_identifiers(&settings.optional_services)?,
            discovery_policy: settings.discovery_policy,
            outbox_policy: settings.outbox_policy,
            step_timeout: settings.step_timeout_ms.map(Duration::from_millis),
        })
    }
}

struct Inner {
    directory: Arc<dyn PeripheralDirectory>,
    config: SessionConfig,
    session: Mutex<Session>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_state(&self) {
        let (state, status) = {
            let session = self.lock();
            (session.state(), session.status_label())
        };
        let _ = self
            .event_sender
            .send(AppEvent::StateChanged { state, status });
    }

    fn send_log(&self, message: impl Into<String>, severity: MessageSeverity) {
        let _ = self.event_sender.send(AppEvent::LogMessage(StatusMessage {
            message: message.into(),
            severity,
        }));
    }

    fn on_value(&self, generation: u64, payload: Vec<u8>) {
        let text = protocol::decode_text(&payload);
        let accepted = self.lock().handle_inbound(generation, text.clone());
        if !accepted {
            debug!(generation, "Dropping notification for inactive session");
            return;
        }

        debug!(bytes = payload.len(), "BLE Data: {}", text);
        let _ = self.event_sender.send(AppEvent::MessageReceived(text));
    }

    fn on_disconnect(&self, generation: u64) {
        if !self.lock().handle_disconnect(generation) {
            debug!(generation, "Ignoring disconnect for inactive session");
            return;
        }

        warn!("Peripheral disconnected");
        let _ = self.event_sender.send(AppEvent::Alert(Alert::Disconnected));
        self.send_log("Device disconnected", MessageSeverity::Warning);
        self.publish_state();
    }
}

/// Owns the session and runs connect, send and disconnect handling
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        directory: Arc<dyn PeripheralDirectory>,
        config: SessionConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                directory,
                config,
                session: Mutex::new(Session::new()),
                event_sender,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state()
    }

    pub fn status_label(&self) -> String {
        self.inner.lock().status_label()
    }

    pub fn latest_inbound(&self) -> String {
        self.inner.lock().latest_inbound().to_string()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.lock().snapshot()
    }

    /// Run the whole connect flow
    ///
    /// Rejected with [`SessionError::Busy`] while another attempt is in
    /// flight. Any other failure has already been reflected in the session
    /// state and logged when this returns.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let generation = match self.inner.lock().begin() {
            Ok(generation) => generation,
            Err(e) => {
                warn!("Ignoring connect request: {}", e);
                return Err(e);
            }
        };
        info!(generation, "Starting connection attempt");
        self.inner.publish_state();

        match self.run_connect(generation).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.inner.lock().fail(generation, &e) {
                    error!("Connection failed: {}", e);
                    self.inner
                        .send_log(format!("Connection failed: {}", e), MessageSeverity::Error);
                    self.inner.publish_state();
                } else {
                    debug!(generation, "Connection attempt ended: {}", e);
                }
                Err(e)
            }
        }
    }

    async fn run_connect(&self, generation: u64) -> Result<(), SessionError> {
        // Step 1: Let the user pick a device (no identity filter)
        self.inner
            .send_log("Scanning for devices...", MessageSeverity::Info);
        let filter = DeviceFilter::accept_all(self.inner.config.optional_services.clone());
        let peripheral = self
            .step(
                SessionStep::Selection,
                self.inner.directory.select_device(&filter),
            )
            .await?;
        info!(device = %peripheral.name(), "Device selected");

        // Step 2: Arm the disconnect observer, then bring up the link
        self.inner
            .lock()
            .attach_peripheral(generation, peripheral.clone())?;
        self.inner.publish_state();
        peripheral.on_disconnect(self.disconnect_handler(generation));

        self.step(SessionStep::Link, peripheral.connect_link())
            .await?;
        info!(device = %peripheral.name(), "Link established");

        // Step 3: Classify endpoints across all service groupings
        self.inner
            .lock()
            .advance(generation, SessionState::DiscoveringServices)?;
        self.inner.publish_state();
        self.inner
            .send_log("Discovering services...", MessageSeverity::Info);

        let discovered = self
            .step(
                SessionStep::Discovery,
                discovery::discover_endpoints(peripheral.as_ref()),
            )
            .await?;
        let endpoints = discovered.resolve(self.inner.config.discovery_policy)?;
        if endpoints.write.is_none() {
            warn!("No write endpoint found, continuing receive-only");
        }

        // Step 4: Subscribe to notifications
        self.inner.lock().check_current(generation)?;
        let subscription = self
            .step(
                SessionStep::Subscribe,
                endpoints.notify.subscribe(self.value_handler(generation)),
            )
            .await?;

        let state = self
            .inner
            .lock()
            .establish(generation, endpoints, subscription)?;
        info!(%state, "Session established");
        self.inner
            .send_log(state.label(), MessageSeverity::Success);
        self.inner.publish_state();
        Ok(())
    }

    /// Send text over the write endpoint
    ///
    /// Returns [`SendOutcome::NotReady`] instead of an error when the session
    /// is not connected. A transport failure is reported but leaves the
    /// session state untouched.
    pub async fn send(&self, text: &str) -> Result<SendOutcome, SessionError> {
        if text.is_empty() {
            return Ok(SendOutcome::Empty);
        }

        let target = {
            let mut session = self.inner.lock();
            let Some(target) = session.ready_write_target() else {
                debug!(state = %session.state(), "Send ignored, session not ready");
                return Ok(SendOutcome::NotReady);
            };
            session.stage_outbound(text, self.inner.config.outbox_policy);
            target
        };

        let payload = protocol::encode_text(text);
        match self.step(SessionStep::Write, target.write(&payload)).await {
            Ok(()) => {
                self.inner.lock().complete_outbound(text);
                info!(mode = %target.mode(), bytes = payload.len(), "TX: {}", text);
                Ok(SendOutcome::Sent(target.mode()))
            }
            Err(e) => {
                error!("Send error: {}", e);
                self.inner
                    .send_log(format!("Send failed: {}", e), MessageSeverity::Error);
                Err(e)
            }
        }
    }

    /// Retry the text kept after a failed send
    pub async fn send_pending(&self) -> Result<SendOutcome, SessionError> {
        let pending = self.inner.lock().pending_outbound().map(str::to_string);
        match pending {
            Some(text) => self.send(&text).await,
            None => Ok(SendOutcome::Empty),
        }
    }

    /// Await a transport call, applying the per-step timeout
    async fn step<T>(
        &self,
        step: SessionStep,
        operation: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, SessionError> {
        let result = match self.inner.config.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("{} timed out", step);
                    return Err(SessionError::Timeout {
                        step,
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            },
            None => operation.await,
        };
        result.map_err(|e| step.map_error(e))
    }

    fn value_handler(&self, generation: u64) -> ValueHandler {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move |payload: Vec<u8>| {
            if let Some(inner) = Weak::upgrade(&inner) {
                inner.on_value(generation, payload);
            }
        })
    }

    fn disconnect_handler(&self, generation: u64) -> DisconnectHandler {
        let inner = Arc::downgrade(&self.inner);
        Arc::new(move || {
            if let Some(inner) = Weak::upgrade(&inner) {
                inner.on_disconnect(generation);
            }
        })
    }
}
