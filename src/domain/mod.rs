//! Domain types shared by the session core and its collaborators.

pub mod error;
pub mod models;
pub mod settings;
