//! Peripheral Abstraction
//!
//! The platform transport as the session core consumes it: a directory that
//! yields a device, the device's service groupings, and the endpoints inside
//! them. Implemented by the in-memory simulator and, with the `btleplug`
//! feature, by real hardware.

use crate::domain::error::TransportError;
use crate::domain::models::{Capabilities, EndpointId};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Called with the raw payload of every value-change notification
pub type ValueHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Called when the link to the peripheral drops
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Device chooser filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceFilter {
    pub accept_all_devices: bool,
    /// Services the session may access after connecting
    pub optional_services: Vec<Uuid>,
}

impl DeviceFilter {
    pub fn accept_all(optional_services: Vec<Uuid>) -> Self {
        Self {
            accept_all_devices: true,
            optional_services,
        }
    }
}

/// Active notification subscription; delivery stops when dropped
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to tear down
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[async_trait]
pub trait PeripheralDirectory: Send + Sync {
    /// Let the user (or the platform) pick a device
    ///
    /// Fails with [`TransportError::SelectionAborted`] when the chooser is cancelled.
    async fn select_device(
        &self,
        filter: &DeviceFilter,
    ) -> Result<Arc<dyn PeripheralHandle>, TransportError>;
}

#[async_trait]
pub trait PeripheralHandle: Send + Sync {
    fn name(&self) -> String;

    /// Register an observer for link loss; may be called before `connect_link`
    fn on_disconnect(&self, handler: DisconnectHandler);

    async fn connect_link(&self) -> Result<(), TransportError>;

    /// All service groupings, in the order the peripheral reports them
    async fn service_groupings(&self) -> Result<Vec<Arc<dyn ServiceGrouping>>, TransportError>;
}

#[async_trait]
pub trait ServiceGrouping: Send + Sync {
    fn id(&self) -> String;

    /// Endpoints of this grouping, in the order the peripheral reports them
    async fn endpoints(&self) -> Result<Vec<Arc<dyn Endpoint>>, TransportError>;
}

#[async_trait]
pub trait Endpoint: Send + Sync {
    fn id(&self) -> EndpointId;

    fn capabilities(&self) -> Capabilities;

    async fn subscribe(&self, handler: ValueHandler) -> Result<Subscription, TransportError>;

    async fn write_acknowledged(&self, data: &[u8]) -> Result<(), TransportError>;

    async fn write_unacknowledged(&self, data: &[u8]) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscription_cancels_once() {
        let cancelled = Arc::new(AtomicUsize::new(0));

        let counter = cancelled.clone();
        let sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.cancel();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);

        let counter = cancelled.clone();
        let sub = Subscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(sub);
        assert_eq!(cancelled.load(Ordering::SeqCst), 2);

        drop(Subscription::detached());
    }

    #[test]
    fn test_accept_all_filter() {
        let filter = DeviceFilter::accept_all(vec![Uuid::nil()]);
        assert!(filter.accept_all_devices);
        assert_eq!(filter.optional_services, vec![Uuid::nil()]);
    }
}
