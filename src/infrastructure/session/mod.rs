//! Session Module
//!
//! Keeps a live control session with one peer and streams channel state to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      SessionManager                       │
//! │   (state machine, public API for the application)         │
//! └──────────┬──────────────────┬──────────────────┬─────────┘
//!            │                  │                  │
//!            ▼                  ▼                  ▼
//!    ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!    │  Keepalive   │   │  Transmitter │   │ CommandSender│
//!    │ - liveness   │   │ - tick loop  │   │ - one-shot   │
//!    │   checks     │   │ - X: frames  │   │   writes     │
//!    └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!           │                  └────────┬─────────┘
//!           │                           ▼
//!           │                  ┌─────────────────┐
//!           └─────────────────▶│      Link       │ (write lock)
//!                              └────────┬────────┘
//!                                       ▼
//!                                   Transport
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Line protocol encoding
//! - [`connection`] - Write-serialized link for one Connected period
//! - [`transmitter`] - Fixed-tick telemetry loop
//! - [`command`] - Discrete commands
//! - [`status`] - Status notifications and message transcript
//! - [`service`] - Session lifecycle manager

pub mod command;
pub mod connection;
mod keepalive;
pub mod protocol;
pub mod service;
pub mod status;
pub mod transmitter;

#[cfg(test)]
mod tests;

// Re-export main service for convenience
pub use command::CommandSender;
pub use service::SessionManager;
pub use status::StatusSubscription;
