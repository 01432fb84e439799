//! Proctor Core - connection trust and instruction delivery for exam clients.
//!
//! This crate implements:
//! - Connection registry with per-connection session state
//! - App-signature trust verification with a statistical fallback
//! - At-most-one-pending instruction delivery over a stateless poll channel
//! - Real-time indicator engine driven by client-submitted events
//! - Collaborator storage abstractions with in-memory implementations

#![forbid(unsafe_code)]

// Core services
pub mod instruction;
pub mod security_key;

// Session state
pub mod indicator;
pub mod session;

// Infrastructure
pub mod service;
pub mod store;

// Supporting modules
pub mod event;
pub mod types;

pub use service::ClientSessionService;
pub use session::{ConnectionRegistry, ConnectionSession, ConnectionStatus};
