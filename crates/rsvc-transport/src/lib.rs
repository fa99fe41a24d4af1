//! Transport abstractions for remote service calls.
//!
//! Framing and connection management live outside this workspace. This crate
//! only fixes the shape of the seam: a client-side [`RpcTransport`] that sends a
//! request and awaits its reply, and a server-side [`InboundCall`] that pairs a
//! request with the channel its reply must travel back on.

pub mod traits;
pub mod testing;

pub use traits::*;
pub use testing::*;
