use std::fmt;
use thiserror::Error;

/// Failure reported by a platform transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("device selection aborted")]
    SelectionAborted,

    #[error("link failure: {0}")]
    LinkFailure(String),

    #[error("GATT operation failed: {0}")]
    Gatt(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error("peripheral not connected")]
    NotConnected,
}

/// Which required endpoint discovery could not find
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingEndpoint {
    Notify,
    Write,
    Both,
}

impl fmt::Display for MissingEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Notify => "notify",
            Self::Write => "write",
            Self::Both => "notify or write",
        })
    }
}

/// Step of the connect flow, used for timeouts and error mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStep {
    Selection,
    Link,
    Discovery,
    Subscribe,
    Write,
}

impl SessionStep {
    /// Map a transport failure to the session taxonomy for this step
    pub fn map_error(self, err: TransportError) -> SessionError {
        match (self, err) {
            (_, TransportError::SelectionAborted) => SessionError::SelectionAborted,
            (Self::Selection | Self::Link, TransportError::LinkFailure(msg)) => {
                SessionError::LinkFailure(msg)
            }
            (Self::Selection | Self::Link, other) => SessionError::LinkFailure(other.to_string()),
            (_, TransportError::NotConnected) => SessionError::UnexpectedDisconnect,
            (_, other) => SessionError::Transport(other.to_string()),
        }
    }
}

impl fmt::Display for SessionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Selection => "device selection",
            Self::Link => "link establishment",
            Self::Discovery => "service discovery",
            Self::Subscribe => "notification subscription",
            Self::Write => "write",
        })
    }
}

/// Error type for session operations.
///
/// Every variant is recoverable: the session stays usable and a new
/// connect request starts over from scratch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("device selection aborted")]
    SelectionAborted,

    #[error("link failure: {0}")]
    LinkFailure(String),

    #[error("no {missing} characteristic found")]
    DiscoveryIncomplete { missing: MissingEndpoint },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("peripheral disconnected unexpectedly")]
    UnexpectedDisconnect,

    #[error("a connection attempt is already in progress")]
    Busy,

    #[error("{step} timed out after {timeout_ms} ms")]
    Timeout { step: SessionStep, timeout_ms: u64 },

    #[error("session superseded by a newer connection attempt")]
    Superseded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_display() {
        let err = SessionError::DiscoveryIncomplete {
            missing: MissingEndpoint::Notify,
        };
        assert_eq!(err.to_string(), "no notify characteristic found");

        let err = SessionError::Timeout {
            step: SessionStep::Link,
            timeout_ms: 500,
        };
        assert_eq!(err.to_string(), "link establishment timed out after 500 ms");

        let err = SessionError::LinkFailure("radio off".to_string());
        assert_eq!(err.to_string(), "link failure: radio off");
    }

    #[test]
    fn test_step_error_mapping() {
        assert_eq!(
            SessionStep::Selection.map_error(TransportError::SelectionAborted),
            SessionError::SelectionAborted
        );
        assert_eq!(
            SessionStep::Link.map_error(TransportError::Gatt("busy".into())),
            SessionError::LinkFailure("GATT operation failed: busy".into())
        );
        assert_eq!(
            SessionStep::Discovery.map_error(TransportError::NotConnected),
            SessionError::UnexpectedDisconnect
        );
        assert_eq!(
            SessionStep::Write.map_error(TransportError::Write("nak".into())),
            SessionError::Transport("write failed: nak".into())
        );
    }
}
