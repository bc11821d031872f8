//! Session State
//!
//! The single mutable context of one connection attempt and the transition
//! functions that move it through its lifecycle. Every method runs under the
//! session lock held by [`SessionManager`](super::service::SessionManager);
//! nothing here awaits.
//!
//! Each attempt gets a new generation number. Flows and callbacks carry the
//! generation they were started with and are ignored once it is stale.

use crate::domain::error::SessionError;
use crate::domain::models::{SessionSnapshot, SessionState};
use crate::domain::settings::OutboxPolicy;
use crate::infrastructure::bluetooth::discovery::{ChannelEndpoints, WriteTarget};
use crate::infrastructure::bluetooth::peripheral::{Endpoint, PeripheralHandle, Subscription};
use std::sync::Arc;

/// Inbound text shown before the first notification arrives
pub const NO_DATA: &str = "No Data";

pub struct Session {
    generation: u64,
    state: SessionState,
    peripheral: Option<Arc<dyn PeripheralHandle>>,
    notify_endpoint: Option<Arc<dyn Endpoint>>,
    write_target: Option<WriteTarget>,
    subscription: Option<Subscription>,
    last_error: Option<String>,
    // Survive restarts: they belong to the channel, not to one attempt
    latest_inbound: String,
    pending_outbound: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            generation: 0,
            state: SessionState::Idle,
            peripheral: None,
            notify_endpoint: None,
            write_target: None,
            subscription: None,
            last_error: None,
            latest_inbound: NO_DATA.to_string(),
            pending_outbound: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn latest_inbound(&self) -> &str {
        &self.latest_inbound
    }

    pub fn pending_outbound(&self) -> Option<&str> {
        self.pending_outbound.as_deref()
    }

    pub fn has_subscription(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn status_label(&self) -> String {
        match (self.state, &self.last_error) {
            (SessionState::Error, Some(cause)) => format!("Error: {}", cause),
            (state, _) => state.label().to_string(),
        }
    }

    /// Start a brand-new attempt
    ///
    /// The previous peripheral handle is abandoned without releasing its
    /// link; only its endpoint references and subscription are dropped.
    pub fn begin(&mut self) -> Result<u64, SessionError> {
        if self.state.is_busy() {
            return Err(SessionError::Busy);
        }

        self.release_channel();
        self.peripheral = None;
        self.generation += 1;
        self.state = SessionState::Scanning;
        Ok(self.generation)
    }

    /// Fails when `generation` no longer owns the session
    pub fn check_current(&self, generation: u64) -> Result<(), SessionError> {
        if generation != self.generation {
            return Err(SessionError::Superseded);
        }
        match self.state {
            SessionState::Disconnected => Err(SessionError::UnexpectedDisconnect),
            SessionState::Idle | SessionState::Error => Err(SessionError::Superseded),
            _ => Ok(()),
        }
    }

    /// `Scanning -> Connecting` with the chosen device
    pub fn attach_peripheral(
        &mut self,
        generation: u64,
        peripheral: Arc<dyn PeripheralHandle>,
    ) -> Result<(), SessionError> {
        self.check_current(generation)?;
        self.peripheral = Some(peripheral);
        self.state = SessionState::Connecting;
        Ok(())
    }

    /// Move an in-flight attempt forward
    pub fn advance(&mut self, generation: u64, to: SessionState) -> Result<(), SessionError> {
        self.check_current(generation)?;
        self.state = to;
        Ok(())
    }

    /// `DiscoveringServices -> Connected | ReceiveOnly`
    pub fn establish(
        &mut self,
        generation: u64,
        endpoints: ChannelEndpoints,
        subscription: Subscription,
    ) -> Result<SessionState, SessionError> {
        self.check_current(generation)?;

        self.state = if endpoints.write.is_some() {
            SessionState::Connected
        } else {
            SessionState::ReceiveOnly
        };
        self.notify_endpoint = Some(endpoints.notify);
        self.write_target = endpoints.write;
        self.subscription = Some(subscription);
        self.last_error = None;
        Ok(self.state)
    }

    /// Record a failed attempt; returns false when the attempt is stale or
    /// the failure was already surfaced as a disconnect
    pub fn fail(&mut self, generation: u64, error: &SessionError) -> bool {
        if generation != self.generation || self.state == SessionState::Disconnected {
            return false;
        }
        if matches!(error, SessionError::Superseded) {
            return false;
        }

        self.release_channel();
        if matches!(error, SessionError::SelectionAborted) {
            self.peripheral = None;
        }
        self.last_error = Some(error.to_string());
        self.state = SessionState::Error;
        true
    }

    /// Peripheral dropped the link; returns false when there is nothing to do
    pub fn handle_disconnect(&mut self, generation: u64) -> bool {
        if generation != self.generation || !self.state.observes_disconnect() {
            return false;
        }

        // The handle stays until the next attempt: disconnected, pending cleanup.
        self.release_channel();
        self.state = SessionState::Disconnected;
        true
    }

    /// Store a decoded notification; returns false when it must be dropped
    pub fn handle_inbound(&mut self, generation: u64, text: String) -> bool {
        if generation != self.generation || !self.state.is_listening() {
            return false;
        }
        self.latest_inbound = text;
        true
    }

    /// Write endpoint, only while fully connected
    pub fn ready_write_target(&self) -> Option<WriteTarget> {
        if self.state != SessionState::Connected {
            return None;
        }
        self.write_target.clone()
    }

    /// Remember outbound text before it is written
    pub fn stage_outbound(&mut self, text: &str, policy: OutboxPolicy) {
        self.pending_outbound = match policy {
            OutboxPolicy::ClearOnSuccess => Some(text.to_string()),
            OutboxPolicy::ClearOptimistically => None,
        };
    }

    /// Write of `text` succeeded
    pub fn complete_outbound(&mut self, text: &str) {
        if self.pending_outbound.as_deref() == Some(text) {
            self.pending_outbound = None;
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            status: self.status_label(),
            device_name: self.peripheral.as_ref().map(|p| p.name()),
            notify_endpoint: self.notify_endpoint.as_ref().map(|e| e.id()),
            write_endpoint: self.write_target.as_ref().map(|w| w.id()),
            write_mode: self.write_target.as_ref().map(|w| w.mode()),
            latest_inbound: self.latest_inbound.clone(),
            pending_outbound: self.pending_outbound.clone(),
            last_error: self.last_error.clone(),
        }
    }

    fn release_channel(&mut self) {
        // Dropping the subscription stops delivery into this session.
        self.subscription = None;
        self.notify_endpoint = None;
        self.write_target = None;
    }
}
