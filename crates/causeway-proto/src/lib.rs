//! Wire schema for the causeway daemon.
//!
//! This crate provides:
//! - The protobuf messages exchanged over HTTP signaling (`WebrtcOffer`)
//! - The control-plane messages (`Mutation`, `Event`, `State`)
//! - Length-prefixed framing for the control stream
//!
//! The bindings are hand-maintained (attributes match what `prost-build`
//! emits) so the build does not depend on `protoc`; `proto/causeway.proto`
//! is the language-neutral reference for non-Rust peers.

#![forbid(unsafe_code)]

mod messages;
pub mod framing;

pub use messages::*;
