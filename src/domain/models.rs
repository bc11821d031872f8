use std::fmt;

/// Lifecycle of a single peripheral session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    DiscoveringServices,
    Connected,
    /// Subscribed for notifications but no write endpoint was found
    ReceiveOnly,
    Disconnected,
    Error,
}

impl SessionState {
    /// A connect flow is in flight; new connect requests are rejected
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Self::Scanning | Self::Connecting | Self::DiscoveringServices
        )
    }

    /// The disconnect observer is armed and a drop must be surfaced
    pub fn observes_disconnect(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::DiscoveringServices | Self::Connected | Self::ReceiveOnly
        )
    }

    /// Inbound notifications are accepted
    pub fn is_listening(self) -> bool {
        matches!(
            self,
            Self::DiscoveringServices | Self::Connected | Self::ReceiveOnly
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Scanning => "Scanning...",
            Self::Connecting => "Connecting...",
            Self::DiscoveringServices => "Discovering services...",
            Self::Connected => "Connected & Listening",
            Self::ReceiveOnly => "Connected (receive only)",
            Self::Disconnected => "Disconnected",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Opaque, peripheral-assigned endpoint identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Capability flags reported by an endpoint at discovery time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub notify: bool,
    pub write: bool,
    pub write_without_response: bool,
}

impl Capabilities {
    pub const NONE: Self = Self {
        notify: false,
        write: false,
        write_without_response: false,
    };

    pub const fn notify() -> Self {
        Self::NONE.with_notify()
    }

    pub const fn write() -> Self {
        Self::NONE.with_write()
    }

    pub const fn write_without_response() -> Self {
        Self::NONE.with_write_without_response()
    }

    pub const fn with_notify(mut self) -> Self {
        self.notify = true;
        self
    }

    pub const fn with_write(mut self) -> Self {
        self.write = true;
        self
    }

    pub const fn with_write_without_response(mut self) -> Self {
        self.write_without_response = true;
        self
    }

    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }

    /// Preferred write mode: unacknowledged when supported
    pub fn write_mode(&self) -> Option<WriteMode> {
        if self.write_without_response {
            Some(WriteMode::WithoutResponse)
        } else if self.write {
            Some(WriteMode::WithResponse)
        } else {
            None
        }
    }
}

/// How outbound payloads are dispatched to the write endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Acknowledged write
    WithResponse,
    /// Write without acknowledgement
    WithoutResponse,
}

impl WriteMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::WithResponse => "with_response",
            Self::WithoutResponse => "without_response",
        }
    }
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of a send request that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(WriteMode),
    /// No usable write endpoint, or the session is not connected
    NotReady,
    /// Nothing to send
    Empty,
}

/// Signals for collaborators outside the session (sound, banners)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    Disconnected,
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    StateChanged {
        state: SessionState,
        status: String,
    },
    MessageReceived(String),
    LogMessage(StatusMessage),
    Alert(Alert),
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

/// Point-in-time view of the session for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub status: String,
    pub device_name: Option<String>,
    pub notify_endpoint: Option<EndpointId>,
    pub write_endpoint: Option<EndpointId>,
    pub write_mode: Option<WriteMode>,
    pub latest_inbound: String,
    pub pending_outbound: Option<String>,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_mode_prefers_unacknowledged() {
        let both = Capabilities::write().with_write_without_response();
        assert_eq!(both.write_mode(), Some(WriteMode::WithoutResponse));
        assert_eq!(
            Capabilities::write().write_mode(),
            Some(WriteMode::WithResponse)
        );
        assert_eq!(Capabilities::notify().write_mode(), None);
        assert!(!Capabilities::notify().can_write());
    }

    #[test]
    fn test_busy_states() {
        assert!(SessionState::Scanning.is_busy());
        assert!(SessionState::DiscoveringServices.is_busy());
        assert!(!SessionState::Connected.is_busy());
        assert!(!SessionState::Error.is_busy());
        assert!(!SessionState::Disconnected.observes_disconnect());
    }
}
