//! Bluetooth Module
//!
//! Session management for a BLE peripheral with an unknown service layout.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     SessionManager                       │
//! │  (connect flow, duplex channel, disconnect handling)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Session  │  │ Discovery  │  │ Protocol │
//! │           │  │            │  │          │
//! │ - State   │  │ - First    │  │ - UUIDs  │
//! │ - Endpoint│  │   match    │  │ - Text   │
//! │   refs    │  │ - Policy   │  │   codec  │
//! └───────────┘  └────────────┘  └──────────┘
//!                       │
//!                       ▼
//!        ┌──────────────────────────────┐
//!        │  Peripheral traits           │
//!        │  (simulator, btleplug)       │
//!        └──────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`peripheral`] - Transport traits consumed by the session
//! - [`protocol`] - Service identifiers and the text codec
//! - [`discovery`] - Endpoint classification across service groupings
//! - [`session`] - Session state and transition functions
//! - [`service`] - Main session manager
//! - [`simulator`] - In-memory peripheral
//! - `hardware` - btleplug-backed peripheral (`btleplug` feature)

pub mod discovery;
#[cfg(feature = "btleplug")]
pub mod hardware;
pub mod peripheral;
pub mod protocol;
pub mod service;
pub mod session;
pub mod simulator;

// Re-export main service for convenience
pub use service::{SessionConfig, SessionManager};
