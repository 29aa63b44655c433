//! The causeway engine: a WebRTC proxy for an upstream control plane
//! that does not speak WebRTC itself.
//!
//! This crate provides:
//! - `WebrtcState`, the reconciliation engine owning all peers and
//!   outbound track states
//! - The three-step HTTP signaling protocol (client and server sides)
//! - The localhost-UDP media bridge and data-channel fan-out
//! - The session supervisor bridging one framed control stream to one
//!   engine instance

#![forbid(unsafe_code)]

mod bridge;
mod client;
mod error;
pub mod http;
mod peer;
mod state;
pub mod supervisor;
mod track;

pub use error::{Error, Result};
pub use http::InterfaceServer;
pub use peer::{PeerRole, PeeringOffer};
pub use state::{WebrtcEvents, WebrtcState, WebrtcStateConfig};
pub use track::{LocalhostPort, NamedTrackKey};
