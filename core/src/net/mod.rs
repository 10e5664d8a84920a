//! Networking layer for netplay
//!
//! - [`messages`] - host/client wire messages and RNET framing
//! - [`transport`] - the byte-oriented peer channel contract
//! - [`loopback`] - in-process transport with simulated latency
//! - [`backoff`] - signaling reconnect backoff
//!
//! ```text
//!          ┌────────────────────┐
//!          │  netplay core      │
//!          └─────────┬──────────┘
//!                    │ HostMessage / ClientMessage
//!          ┌─────────▼──────────┐
//!          │  RNET framing      │
//!          └─────────┬──────────┘
//!                    │ bytes
//!          ┌─────────▼──────────┐
//!          │  Transport         │
//!          │ (WebRTC, loopback) │
//!          └────────────────────┘
//! ```

pub mod backoff;
pub mod loopback;
pub mod messages;
pub mod transport;

pub use backoff::Backoff;
pub use loopback::{LinkProfile, LoopbackNetwork, LoopbackTransport};
pub use messages::{ClientMessage, DecodeError, HostMessage};
pub use transport::{Transport, TransportError, TransportEvent};
