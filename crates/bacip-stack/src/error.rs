use bacip_core::address::Address;
use bacip_core::apdu::{AbortReason, RejectReason};
use bacip_core::{DecodeError, EncodeError};
use bacip_link::LinkError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StackError {
    #[error("configuration error: {0}")]
    Config(&'static str),
    #[error("link error: {0}")]
    Link(#[from] LinkError),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("all 256 invoke ids in use for {0}")]
    InvokeIdExhausted(Address),
    #[error("invoke id {1} already in use for {0}")]
    InvokeIdInUse(Address, u8),
    #[error("{0} is on a directly connected network; address it as a local station")]
    DirectlyConnected(Address),
    #[error("cannot send to {0}")]
    BadDestination(Address),
    #[error("stack is shut down")]
    ShutDown,
}

/// How a service handler declines a request. The dispatcher turns this into
/// the matching PDU on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceError {
    Reject(RejectReason),
    Abort(AbortReason),
    Execution { class: u32, code: u32 },
}

/// Error class `device`, code `operational-problem`; the catch-all for a
/// handler that failed without saying how.
pub const OPERATIONAL_PROBLEM: ServiceError = ServiceError::Execution {
    class: 0,
    code: 25,
};
