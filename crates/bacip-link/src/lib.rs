//! BACnet/IP data link.
//!
//! [`UdpEndpoint`] owns the datagram socket; the [`bip`] roles decide how
//! NPDUs are framed in BVLL and where broadcasts go. The roles are plain
//! state machines over `(endpoint, frame)` pairs so their forwarding rules
//! can be exercised without sockets; [`BipLink`](bip::BipLink) couples one of
//! them to an endpoint.

pub mod bip;
pub mod udp;

pub use bip::{Bbmd, BipForeign, BipLink, BipRole, BipSimple, Inbound, RegistrationState};
pub use udp::UdpEndpoint;

use bacip_core::DecodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] DecodeError),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("BVLC result code 0x{0:04x}")]
    BvlcResult(u16),
    #[error("no BBMD configured for this role")]
    NoBbmd,
    #[error("destination not reachable from this link: {0}")]
    BadDestination(bacip_core::address::Address),
}
