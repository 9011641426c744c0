//! Remote control link for a serial-style peer.
//!
//! Keeps one control session alive against an unreliable byte-stream
//! transport and streams multi-channel touch input to the peer at a fixed
//! cadence.

pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use domain::channels::CoordinateAggregator;
pub use domain::errors::{SessionError, TransportError};
pub use domain::models::{Device, SessionState, StatusEvent};
pub use domain::touch::TouchSurface;
pub use infrastructure::session::{CommandSender, SessionManager};
pub use infrastructure::transport::Transport;
