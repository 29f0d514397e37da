//! Protocol crate shared between the driftline server and anything that
//! speaks its wire format.
//!
//! Holds the hand-rolled codec for the engine's binary value serialization
//! ([`wire`]), the gzip transport framing ([`framing`]) and the wire-facing
//! math types ([`math`]). Nothing in here touches the network; frames go in
//! and out as plain byte vectors.

pub mod framing;
pub mod math;
pub mod wire;

pub use framing::{CHANNEL_GAME, CHANNEL_PING};
pub use wire::WireValue;

/// Stable identifier of a remote participant on the peer-to-peer transport.
///
/// The transport hands these out and guarantees they stay stable for the
/// lifetime of a session; the server treats them as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl PeerId {
    /// Identity the server itself uses in host announcements.
    pub const SERVER: PeerId = PeerId(0);
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
