//! Network-layer protocol control information and network-layer messages.

use crate::address::{valid_network, Address, Mac};
use crate::encoding::{reader::Reader, writer::Writer};
use crate::{DecodeError, EncodeError};
use alloc::vec::Vec;

/// BACnet network layer protocol version.
pub const NPCI_VERSION: u8 = 0x01;

/// Initial hop count for any routed PDU.
pub const INITIAL_HOP_COUNT: u8 = 255;

pub const MSG_WHO_IS_ROUTER_TO_NETWORK: u8 = 0x00;
pub const MSG_I_AM_ROUTER_TO_NETWORK: u8 = 0x01;
pub const MSG_I_COULD_BE_ROUTER_TO_NETWORK: u8 = 0x02;
pub const MSG_REJECT_MESSAGE_TO_NETWORK: u8 = 0x03;
pub const MSG_ROUTER_BUSY_TO_NETWORK: u8 = 0x04;
pub const MSG_ROUTER_AVAILABLE_TO_NETWORK: u8 = 0x05;
pub const MSG_INITIALIZE_ROUTING_TABLE: u8 = 0x06;
pub const MSG_INITIALIZE_ROUTING_TABLE_ACK: u8 = 0x07;
pub const MSG_ESTABLISH_CONNECTION_TO_NETWORK: u8 = 0x08;
pub const MSG_DISCONNECT_CONNECTION_TO_NETWORK: u8 = 0x09;
pub const MSG_WHAT_IS_NETWORK_NUMBER: u8 = 0x12;
pub const MSG_NETWORK_NUMBER_IS: u8 = 0x13;

/// First vendor-proprietary network message type.
pub const MSG_VENDOR_BASE: u8 = 0x80;

/// The NPCI header: control flags plus optional routing fields.
///
/// `destination` may be a remote station, a remote broadcast, or the global
/// broadcast; `source` may only be a remote station. Both are absent for
/// plain local traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Npci {
    pub expecting_reply: bool,
    pub priority: u8,
    pub destination: Option<Address>,
    pub source: Option<Address>,
    pub hop_count: Option<u8>,
    pub message_type: Option<u8>,
    pub vendor_id: Option<u16>,
}

impl Npci {
    /// Header for an application-layer PDU with no routing.
    pub const fn application(expecting_reply: bool) -> Self {
        Self {
            expecting_reply,
            priority: 0,
            destination: None,
            source: None,
            hop_count: None,
            message_type: None,
            vendor_id: None,
        }
    }

    /// Header for a standard network-layer message.
    pub const fn network_message(message_type: u8) -> Self {
        Self {
            expecting_reply: false,
            priority: 0,
            destination: None,
            source: None,
            hop_count: None,
            message_type: Some(message_type),
            vendor_id: None,
        }
    }

    pub fn with_destination(mut self, destination: Address) -> Self {
        self.destination = Some(destination);
        self.hop_count = Some(INITIAL_HOP_COUNT);
        self
    }

    pub const fn is_network_message(&self) -> bool {
        self.message_type.is_some()
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        if self.priority > 3 {
            return Err(EncodeError::ValueOutOfRange);
        }

        w.write_u8(NPCI_VERSION)?;

        let mut control = self.priority;
        if self.message_type.is_some() {
            control |= 0x80;
        }
        if self.destination.is_some() {
            control |= 0x20;
        }
        if self.source.is_some() {
            control |= 0x08;
        }
        if self.expecting_reply {
            control |= 0x04;
        }
        w.write_u8(control)?;

        if let Some(dest) = &self.destination {
            match dest {
                Address::GlobalBroadcast => {
                    w.write_be_u16(0xFFFF)?;
                    w.write_u8(0)?;
                }
                Address::RemoteBroadcast(net) => {
                    w.write_be_u16(*net)?;
                    w.write_u8(0)?;
                }
                Address::RemoteStation(net, mac) => {
                    w.write_be_u16(*net)?;
                    w.write_u8(mac.len() as u8)?;
                    w.write_all(mac.as_bytes())?;
                }
                _ => return Err(EncodeError::Message("DADR must be a remote address")),
            }
        }

        if let Some(src) = &self.source {
            match src {
                Address::RemoteStation(net, mac) => {
                    w.write_be_u16(*net)?;
                    w.write_u8(mac.len() as u8)?;
                    w.write_all(mac.as_bytes())?;
                }
                _ => return Err(EncodeError::Message("SADR must be a remote station")),
            }
        }

        if self.destination.is_some() {
            w.write_u8(self.hop_count.unwrap_or(INITIAL_HOP_COUNT))?;
        }

        if let Some(message_type) = self.message_type {
            w.write_u8(message_type)?;
            if message_type >= MSG_VENDOR_BASE {
                w.write_be_u16(self.vendor_id.unwrap_or(0))?;
            }
        }
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        if r.read_u8()? != NPCI_VERSION {
            return Err(DecodeError::BadVersion);
        }

        let control = r.read_u8()?;
        let is_message = (control & 0x80) != 0;
        let has_dest = (control & 0x20) != 0;
        let has_src = (control & 0x08) != 0;
        let expecting_reply = (control & 0x04) != 0;
        let priority = control & 0x03;

        let destination = if has_dest {
            Some(decode_dadr(r)?)
        } else {
            None
        };
        let source = if has_src { Some(decode_sadr(r)?) } else { None };
        let hop_count = if has_dest { Some(r.read_u8()?) } else { None };

        let (message_type, vendor_id) = if is_message {
            let mt = r.read_u8()?;
            let vid = if mt >= MSG_VENDOR_BASE {
                Some(r.read_be_u16()?)
            } else {
                None
            };
            (Some(mt), vid)
        } else {
            (None, None)
        };

        Ok(Self {
            expecting_reply,
            priority,
            destination,
            source,
            hop_count,
            message_type,
            vendor_id,
        })
    }
}

fn decode_dadr(r: &mut Reader<'_>) -> Result<Address, DecodeError> {
    let net = r.read_be_u16()?;
    let len = r.read_u8()? as usize;
    if net == 0xFFFF {
        if len != 0 {
            return Err(DecodeError::InvalidLength);
        }
        return Ok(Address::GlobalBroadcast);
    }
    if !valid_network(net) {
        return Err(DecodeError::InvalidValue);
    }
    if len == 0 {
        return Ok(Address::RemoteBroadcast(net));
    }
    let mac = Mac::from_slice(r.read_exact(len)?).ok_or(DecodeError::InvalidLength)?;
    Ok(Address::RemoteStation(net, mac))
}

fn decode_sadr(r: &mut Reader<'_>) -> Result<Address, DecodeError> {
    let net = r.read_be_u16()?;
    let len = r.read_u8()? as usize;
    if !valid_network(net) || len == 0 {
        // a broadcast source is never legal
        return Err(DecodeError::InvalidValue);
    }
    let mac = Mac::from_slice(r.read_exact(len)?).ok_or(DecodeError::InvalidLength)?;
    Ok(Address::RemoteStation(net, mac))
}

/// Typed payloads for the network-layer messages the stack acts on; anything
/// else is carried through raw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkMessage {
    WhoIsRouterToNetwork { network: Option<u16> },
    IAmRouterToNetwork { networks: Vec<u16> },
    RejectMessageToNetwork { reason: u8, network: u16 },
    RouterBusyToNetwork { networks: Vec<u16> },
    RouterAvailableToNetwork { networks: Vec<u16> },
    Other { message_type: u8, data: Vec<u8> },
}

impl NetworkMessage {
    pub fn message_type(&self) -> u8 {
        match self {
            Self::WhoIsRouterToNetwork { .. } => MSG_WHO_IS_ROUTER_TO_NETWORK,
            Self::IAmRouterToNetwork { .. } => MSG_I_AM_ROUTER_TO_NETWORK,
            Self::RejectMessageToNetwork { .. } => MSG_REJECT_MESSAGE_TO_NETWORK,
            Self::RouterBusyToNetwork { .. } => MSG_ROUTER_BUSY_TO_NETWORK,
            Self::RouterAvailableToNetwork { .. } => MSG_ROUTER_AVAILABLE_TO_NETWORK,
            Self::Other { message_type, .. } => *message_type,
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            Self::WhoIsRouterToNetwork { network } => {
                if let Some(net) = network {
                    w.write_be_u16(*net)?;
                }
            }
            Self::IAmRouterToNetwork { networks }
            | Self::RouterBusyToNetwork { networks }
            | Self::RouterAvailableToNetwork { networks } => {
                for net in networks {
                    w.write_be_u16(*net)?;
                }
            }
            Self::RejectMessageToNetwork { reason, network } => {
                w.write_u8(*reason)?;
                w.write_be_u16(*network)?;
            }
            Self::Other { data, .. } => w.write_all(data)?,
        }
        Ok(())
    }

    pub fn decode(message_type: u8, r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        match message_type {
            MSG_WHO_IS_ROUTER_TO_NETWORK => {
                let network = if r.is_empty() {
                    None
                } else {
                    Some(r.read_be_u16()?)
                };
                Ok(Self::WhoIsRouterToNetwork { network })
            }
            MSG_I_AM_ROUTER_TO_NETWORK => Ok(Self::IAmRouterToNetwork {
                networks: decode_network_list(r)?,
            }),
            MSG_REJECT_MESSAGE_TO_NETWORK => Ok(Self::RejectMessageToNetwork {
                reason: r.read_u8()?,
                network: r.read_be_u16()?,
            }),
            MSG_ROUTER_BUSY_TO_NETWORK => Ok(Self::RouterBusyToNetwork {
                networks: decode_network_list(r)?,
            }),
            MSG_ROUTER_AVAILABLE_TO_NETWORK => Ok(Self::RouterAvailableToNetwork {
                networks: decode_network_list(r)?,
            }),
            _ => Ok(Self::Other {
                message_type,
                data: r.rest().to_vec(),
            }),
        }
    }
}

fn decode_network_list(r: &mut Reader<'_>) -> Result<Vec<u16>, DecodeError> {
    if r.remaining() % 2 != 0 {
        return Err(DecodeError::InvalidLength);
    }
    let mut networks = Vec::with_capacity(r.remaining() / 2);
    while !r.is_empty() {
        networks.push(r.read_be_u16()?);
    }
    Ok(networks)
}

#[cfg(test)]
mod tests {
    use super::{NetworkMessage, Npci};
    use crate::address::{Address, Mac};
    use crate::encoding::{reader::Reader, writer::Writer};
    use alloc::vec;

    fn roundtrip(npci: &Npci) -> Npci {
        let mut buf = [0u8; 64];
        let mut w = Writer::new(&mut buf);
        npci.encode(&mut w).unwrap();
        let mut r = Reader::new(w.as_written());
        let decoded = Npci::decode(&mut r).unwrap();
        assert!(r.is_empty());
        decoded
    }

    #[test]
    fn plain_application_header() {
        let npci = Npci::application(true);
        assert_eq!(roundtrip(&npci), npci);
    }

    #[test]
    fn global_broadcast_uses_reserved_net() {
        let npci = Npci::application(false).with_destination(Address::GlobalBroadcast);
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        npci.encode(&mut w).unwrap();
        assert_eq!(w.as_written(), &[0x01, 0x20, 0xFF, 0xFF, 0x00, 0xFF]);
        assert_eq!(roundtrip(&npci), npci);
    }

    #[test]
    fn routed_header_with_source() {
        let mut npci = Npci::application(true)
            .with_destination(Address::RemoteStation(12, Mac::from_octet(3)));
        npci.source = Some(Address::RemoteStation(7, Mac::from_octet(9)));
        npci.hop_count = Some(254);
        assert_eq!(roundtrip(&npci), npci);
    }

    #[test]
    fn broadcast_source_is_rejected() {
        // SADR with a zero-length MAC.
        let frame = [0x01, 0x08, 0x00, 0x07, 0x00];
        assert!(Npci::decode(&mut Reader::new(&frame)).is_err());
    }

    #[test]
    fn wrong_version_is_rejected() {
        let frame = [0x02, 0x00];
        assert!(Npci::decode(&mut Reader::new(&frame)).is_err());
    }

    #[test]
    fn vendor_message_carries_vendor_id() {
        let mut npci = Npci::network_message(0x90);
        npci.vendor_id = Some(260);
        assert_eq!(roundtrip(&npci), npci);
    }

    #[test]
    fn network_message_payloads_roundtrip() {
        let msgs = [
            NetworkMessage::WhoIsRouterToNetwork { network: Some(30) },
            NetworkMessage::WhoIsRouterToNetwork { network: None },
            NetworkMessage::IAmRouterToNetwork {
                networks: vec![10, 20, 30],
            },
            NetworkMessage::RejectMessageToNetwork {
                reason: 1,
                network: 44,
            },
        ];
        for msg in msgs {
            let mut buf = [0u8; 32];
            let mut w = Writer::new(&mut buf);
            msg.encode(&mut w).unwrap();
            let mut r = Reader::new(w.as_written());
            assert_eq!(
                NetworkMessage::decode(msg.message_type(), &mut r).unwrap(),
                msg
            );
        }
    }

    #[test]
    fn unknown_message_is_preserved() {
        let mut r = Reader::new(&[0xAA, 0xBB]);
        let msg = NetworkMessage::decode(0x12, &mut r).unwrap();
        assert_eq!(
            msg,
            NetworkMessage::Other {
                message_type: 0x12,
                data: vec![0xAA, 0xBB],
            }
        );
    }
}
