use crate::address::Address;
use alloc::vec::Vec;

/// A protocol data unit in flight between layers: where it came from, where
/// it is going, and the bytes the next layer should interpret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    pub source: Address,
    pub destination: Address,
    pub data: Vec<u8>,
}

impl Pdu {
    pub fn new(source: Address, destination: Address, data: Vec<u8>) -> Self {
        Self {
            source,
            destination,
            data,
        }
    }

    /// A PDU being sent by the local node; the source is filled in by the
    /// layer that knows it.
    pub fn outbound(destination: Address, data: Vec<u8>) -> Self {
        Self {
            source: Address::Null,
            destination,
            data,
        }
    }
}
