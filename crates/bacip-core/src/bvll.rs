//! BACnet Virtual Link Layer framing (Annex J).
//!
//! Every BACnet/IP datagram starts with `0x81`, a function octet, and a
//! big-endian length covering the whole frame. [`BvllMessage`] gives each of
//! the eleven functions a typed payload.

use crate::address::IpPort;
use crate::encoding::{reader::Reader, writer::Writer};
use crate::{DecodeError, EncodeError};
use alloc::vec::Vec;

/// BVLL type octet for BACnet/IP.
pub const BVLL_TYPE_BIP: u8 = 0x81;

/// Result code: Write-Broadcast-Distribution-Table NAK.
pub const RESULT_WRITE_BDT_NAK: u16 = 0x0010;
/// Result code: Read-Broadcast-Distribution-Table NAK.
pub const RESULT_READ_BDT_NAK: u16 = 0x0020;
/// Result code: Register-Foreign-Device NAK.
pub const RESULT_REGISTER_NAK: u16 = 0x0030;
/// Result code: Read-Foreign-Device-Table NAK.
pub const RESULT_READ_FDT_NAK: u16 = 0x0040;
/// Result code: Delete-Foreign-Device-Table-Entry NAK.
pub const RESULT_DELETE_FDT_NAK: u16 = 0x0050;
/// Result code: Distribute-Broadcast-To-Network NAK.
pub const RESULT_DISTRIBUTE_NAK: u16 = 0x0060;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BvlcFunction {
    Result,
    WriteBdt,
    ReadBdt,
    ReadBdtAck,
    ForwardedNpdu,
    RegisterForeignDevice,
    ReadFdt,
    ReadFdtAck,
    DeleteFdtEntry,
    DistributeBroadcastToNetwork,
    OriginalUnicastNpdu,
    OriginalBroadcastNpdu,
}

impl BvlcFunction {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Result),
            0x01 => Some(Self::WriteBdt),
            0x02 => Some(Self::ReadBdt),
            0x03 => Some(Self::ReadBdtAck),
            0x04 => Some(Self::ForwardedNpdu),
            0x05 => Some(Self::RegisterForeignDevice),
            0x06 => Some(Self::ReadFdt),
            0x07 => Some(Self::ReadFdtAck),
            0x08 => Some(Self::DeleteFdtEntry),
            0x09 => Some(Self::DistributeBroadcastToNetwork),
            0x0A => Some(Self::OriginalUnicastNpdu),
            0x0B => Some(Self::OriginalBroadcastNpdu),
            _ => None,
        }
    }

    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Result => 0x00,
            Self::WriteBdt => 0x01,
            Self::ReadBdt => 0x02,
            Self::ReadBdtAck => 0x03,
            Self::ForwardedNpdu => 0x04,
            Self::RegisterForeignDevice => 0x05,
            Self::ReadFdt => 0x06,
            Self::ReadFdtAck => 0x07,
            Self::DeleteFdtEntry => 0x08,
            Self::DistributeBroadcastToNetwork => 0x09,
            Self::OriginalUnicastNpdu => 0x0A,
            Self::OriginalBroadcastNpdu => 0x0B,
        }
    }
}

/// One Broadcast-Distribution-Table row: peer endpoint and broadcast mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BdtEntry {
    pub address: IpPort,
    pub mask: [u8; 4],
}

impl BdtEntry {
    /// The unicast (or directed-broadcast) endpoint this row forwards to.
    pub fn forward_to(&self) -> IpPort {
        let mut octets = self.address.octets;
        for (octet, mask) in octets.iter_mut().zip(self.mask) {
            *octet |= !mask;
        }
        IpPort::new(octets, self.address.port)
    }
}

/// One Foreign-Device-Table row as reported by Read-FDT-Ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FdtEntry {
    pub address: IpPort,
    pub ttl: u16,
    pub remaining: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BvllMessage {
    Result { code: u16 },
    WriteBdt { entries: Vec<BdtEntry> },
    ReadBdt,
    ReadBdtAck { entries: Vec<BdtEntry> },
    ForwardedNpdu { origin: IpPort, npdu: Vec<u8> },
    RegisterForeignDevice { ttl: u16 },
    ReadFdt,
    ReadFdtAck { entries: Vec<FdtEntry> },
    DeleteFdtEntry { address: IpPort },
    DistributeBroadcastToNetwork { npdu: Vec<u8> },
    OriginalUnicastNpdu { npdu: Vec<u8> },
    OriginalBroadcastNpdu { npdu: Vec<u8> },
}

impl BvllMessage {
    pub const fn function(&self) -> BvlcFunction {
        match self {
            Self::Result { .. } => BvlcFunction::Result,
            Self::WriteBdt { .. } => BvlcFunction::WriteBdt,
            Self::ReadBdt => BvlcFunction::ReadBdt,
            Self::ReadBdtAck { .. } => BvlcFunction::ReadBdtAck,
            Self::ForwardedNpdu { .. } => BvlcFunction::ForwardedNpdu,
            Self::RegisterForeignDevice { .. } => BvlcFunction::RegisterForeignDevice,
            Self::ReadFdt => BvlcFunction::ReadFdt,
            Self::ReadFdtAck { .. } => BvlcFunction::ReadFdtAck,
            Self::DeleteFdtEntry { .. } => BvlcFunction::DeleteFdtEntry,
            Self::DistributeBroadcastToNetwork { .. } => {
                BvlcFunction::DistributeBroadcastToNetwork
            }
            Self::OriginalUnicastNpdu { .. } => BvlcFunction::OriginalUnicastNpdu,
            Self::OriginalBroadcastNpdu { .. } => BvlcFunction::OriginalBroadcastNpdu,
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        let start = w.position();
        w.write_u8(BVLL_TYPE_BIP)?;
        w.write_u8(self.function().to_u8())?;
        let len_at = w.position();
        w.write_be_u16(0)?;

        match self {
            Self::Result { code } => w.write_be_u16(*code)?,
            Self::WriteBdt { entries } | Self::ReadBdtAck { entries } => {
                for entry in entries {
                    w.write_all(&entry.address.to_wire())?;
                    w.write_all(&entry.mask)?;
                }
            }
            Self::ReadBdt | Self::ReadFdt => {}
            Self::ForwardedNpdu { origin, npdu } => {
                w.write_all(&origin.to_wire())?;
                w.write_all(npdu)?;
            }
            Self::RegisterForeignDevice { ttl } => w.write_be_u16(*ttl)?,
            Self::ReadFdtAck { entries } => {
                for entry in entries {
                    w.write_all(&entry.address.to_wire())?;
                    w.write_be_u16(entry.ttl)?;
                    w.write_be_u16(entry.remaining)?;
                }
            }
            Self::DeleteFdtEntry { address } => w.write_all(&address.to_wire())?,
            Self::DistributeBroadcastToNetwork { npdu }
            | Self::OriginalUnicastNpdu { npdu }
            | Self::OriginalBroadcastNpdu { npdu } => w.write_all(npdu)?,
        }

        let total = w.position() - start;
        if total > usize::from(u16::MAX) {
            return Err(EncodeError::InvalidLength);
        }
        w.patch_be_u16(len_at, total as u16)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        if r.read_u8()? != BVLL_TYPE_BIP {
            return Err(DecodeError::InvalidValue);
        }
        let function =
            BvlcFunction::from_u8(r.read_u8()?).ok_or(DecodeError::Message("unknown function"))?;
        let length = r.read_be_u16()? as usize;
        if length < 4 || length - 4 > r.remaining() {
            return Err(DecodeError::InvalidLength);
        }
        let mut body = Reader::new(r.read_exact(length - 4)?);

        let msg = match function {
            BvlcFunction::Result => Self::Result {
                code: body.read_be_u16()?,
            },
            BvlcFunction::WriteBdt => Self::WriteBdt {
                entries: decode_bdt(&mut body)?,
            },
            BvlcFunction::ReadBdt => Self::ReadBdt,
            BvlcFunction::ReadBdtAck => Self::ReadBdtAck {
                entries: decode_bdt(&mut body)?,
            },
            BvlcFunction::ForwardedNpdu => Self::ForwardedNpdu {
                origin: read_ip_port(&mut body)?,
                npdu: body.rest().to_vec(),
            },
            BvlcFunction::RegisterForeignDevice => Self::RegisterForeignDevice {
                ttl: body.read_be_u16()?,
            },
            BvlcFunction::ReadFdt => Self::ReadFdt,
            BvlcFunction::ReadFdtAck => {
                let mut entries = Vec::with_capacity(body.remaining() / 10);
                while !body.is_empty() {
                    entries.push(FdtEntry {
                        address: read_ip_port(&mut body)?,
                        ttl: body.read_be_u16()?,
                        remaining: body.read_be_u16()?,
                    });
                }
                Self::ReadFdtAck { entries }
            }
            BvlcFunction::DeleteFdtEntry => Self::DeleteFdtEntry {
                address: read_ip_port(&mut body)?,
            },
            BvlcFunction::DistributeBroadcastToNetwork => Self::DistributeBroadcastToNetwork {
                npdu: body.rest().to_vec(),
            },
            BvlcFunction::OriginalUnicastNpdu => Self::OriginalUnicastNpdu {
                npdu: body.rest().to_vec(),
            },
            BvlcFunction::OriginalBroadcastNpdu => Self::OriginalBroadcastNpdu {
                npdu: body.rest().to_vec(),
            },
        };

        if !body.is_empty() {
            return Err(DecodeError::InvalidLength);
        }
        Ok(msg)
    }

    /// Encode into a fresh heap buffer.
    pub fn to_frame(&self) -> Result<Vec<u8>, EncodeError> {
        let mut buf = alloc::vec![0u8; self.frame_len()];
        let mut w = Writer::new(&mut buf);
        self.encode(&mut w)?;
        let written = w.position();
        buf.truncate(written);
        Ok(buf)
    }

    fn frame_len(&self) -> usize {
        4 + match self {
            Self::Result { .. } | Self::RegisterForeignDevice { .. } => 2,
            Self::WriteBdt { entries } | Self::ReadBdtAck { entries } => entries.len() * 10,
            Self::ReadBdt | Self::ReadFdt => 0,
            Self::ForwardedNpdu { npdu, .. } => 6 + npdu.len(),
            Self::ReadFdtAck { entries } => entries.len() * 10,
            Self::DeleteFdtEntry { .. } => 6,
            Self::DistributeBroadcastToNetwork { npdu }
            | Self::OriginalUnicastNpdu { npdu }
            | Self::OriginalBroadcastNpdu { npdu } => npdu.len(),
        }
    }
}

fn read_ip_port(r: &mut Reader<'_>) -> Result<IpPort, DecodeError> {
    IpPort::from_wire(r.read_exact(6)?).ok_or(DecodeError::InvalidLength)
}

fn decode_bdt(r: &mut Reader<'_>) -> Result<Vec<BdtEntry>, DecodeError> {
    if r.remaining() % 10 != 0 {
        return Err(DecodeError::InvalidLength);
    }
    let mut entries = Vec::with_capacity(r.remaining() / 10);
    while !r.is_empty() {
        let address = read_ip_port(r)?;
        let mask_bytes = r.read_exact(4)?;
        entries.push(BdtEntry {
            address,
            mask: [mask_bytes[0], mask_bytes[1], mask_bytes[2], mask_bytes[3]],
        });
    }
    Ok(entries)
}
