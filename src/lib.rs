//! Auto-connecting BLE text terminal.
//!
//! Picks any peripheral, finds the first notify and write characteristics in
//! whatever services it exposes, and runs a UTF-8 text channel over them.

pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use domain::error::{SessionError, TransportError};
pub use domain::models::{AppEvent, SendOutcome, SessionSnapshot, SessionState};
pub use infrastructure::bluetooth::{SessionConfig, SessionManager};
