//! Capability Discovery
//!
//! Walks every service grouping of a connected peripheral and picks the
//! first notify-capable and the first write-capable endpoint. The layout of
//! the peripheral is unknown up front, so this is greedy first-match, not
//! best-match.

use crate::domain::error::{MissingEndpoint, SessionError, TransportError};
use crate::domain::models::{EndpointId, WriteMode};
use crate::domain::settings::DiscoveryPolicy;
use crate::infrastructure::bluetooth::peripheral::{Endpoint, PeripheralHandle};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Write endpoint with its dispatch mode fixed at discovery time
#[derive(Clone)]
pub struct WriteTarget {
    endpoint: Arc<dyn Endpoint>,
    mode: WriteMode,
}

impl WriteTarget {
    /// `None` when the endpoint cannot be written
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Option<Self> {
        let mode = endpoint.capabilities().write_mode()?;
        Some(Self { endpoint, mode })
    }

    pub fn id(&self) -> EndpointId {
        self.endpoint.id()
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub async fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        match self.mode {
            WriteMode::WithoutResponse => self.endpoint.write_unacknowledged(data).await,
            WriteMode::WithResponse => self.endpoint.write_acknowledged(data).await,
        }
    }
}

impl fmt::Debug for WriteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteTarget")
            .field("endpoint", &self.endpoint.id())
            .field("mode", &self.mode)
            .finish()
    }
}

/// Greedy first-match classifier
#[derive(Default)]
pub struct EndpointSelector {
    notify: Option<Arc<dyn Endpoint>>,
    write: Option<WriteTarget>,
    offered: usize,
}

impl EndpointSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consider the next endpoint in enumeration order
    pub fn offer(&mut self, endpoint: &Arc<dyn Endpoint>) {
        self.offered += 1;
        let caps = endpoint.capabilities();

        if self.notify.is_none() && caps.notify {
            info!(endpoint = %endpoint.id(), "Notify endpoint found");
            self.notify = Some(endpoint.clone());
        }
        if self.write.is_none() {
            if let Some(target) = WriteTarget::new(endpoint.clone()) {
                info!(endpoint = %target.id(), mode = %target.mode(), "Write endpoint found");
                self.write = Some(target);
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.notify.is_some() && self.write.is_some()
    }

    pub fn finish(self) -> DiscoveredEndpoints {
        DiscoveredEndpoints {
            notify: self.notify,
            write: self.write,
            endpoints_scanned: self.offered,
        }
    }
}

/// What discovery found, before the policy decides whether it is usable
pub struct DiscoveredEndpoints {
    pub notify: Option<Arc<dyn Endpoint>>,
    pub write: Option<WriteTarget>,
    pub endpoints_scanned: usize,
}

impl DiscoveredEndpoints {
    pub fn resolve(self, policy: DiscoveryPolicy) -> Result<ChannelEndpoints, SessionError> {
        match (self.notify, self.write, policy) {
            (Some(notify), Some(write), _) => Ok(ChannelEndpoints {
                notify,
                write: Some(write),
            }),
            (Some(notify), None, DiscoveryPolicy::AllowReceiveOnly) => Ok(ChannelEndpoints {
                notify,
                write: None,
            }),
            (Some(_), None, DiscoveryPolicy::RequireBoth) => {
                Err(SessionError::DiscoveryIncomplete {
                    missing: MissingEndpoint::Write,
                })
            }
            (None, Some(_), _) => Err(SessionError::DiscoveryIncomplete {
                missing: MissingEndpoint::Notify,
            }),
            (None, None, _) => Err(SessionError::DiscoveryIncomplete {
                missing: MissingEndpoint::Both,
            }),
        }
    }
}

/// Endpoints the duplex channel runs over
pub struct ChannelEndpoints {
    pub notify: Arc<dyn Endpoint>,
    pub write: Option<WriteTarget>,
}

/// Enumerate all service groupings and classify their endpoints
pub async fn discover_endpoints(
    peripheral: &dyn PeripheralHandle,
) -> Result<DiscoveredEndpoints, TransportError> {
    let groupings = peripheral.service_groupings().await?;
    info!("Found {} service groupings", groupings.len());

    let mut selector = EndpointSelector::new();
    for grouping in &groupings {
        let endpoints = grouping.endpoints().await?;
        debug!(
            grouping = %grouping.id(),
            "Scanning {} endpoints",
            endpoints.len()
        );

        for endpoint in &endpoints {
            selector.offer(endpoint);
            if selector.is_complete() {
                break;
            }
        }
        if selector.is_complete() {
            break;
        }
    }

    let discovered = selector.finish();
    debug!(
        endpoints_scanned = discovered.endpoints_scanned,
        notify = discovered.notify.is_some(),
        write = discovered.write.is_some(),
        "Discovery finished"
    );
    Ok(discovered)
}
