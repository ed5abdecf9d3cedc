//! Application-layer PDU codecs.

/// Confirmed-service headers and the ack/error/reject/abort PDUs.
pub mod confirmed;
/// APDU type nibble, sizing encodings, and reason codes.
pub mod types;
/// Unconfirmed-service request header.
pub mod unconfirmed;

pub use confirmed::{
    AbortPdu, ComplexAck, ConfirmedRequest, ErrorPdu, RejectPdu, SegmentAck, SimpleAck,
};
pub use types::{AbortReason, ApduType, MaxApdu, MaxSegments, RejectReason};
pub use unconfirmed::UnconfirmedRequest;

use crate::encoding::{reader::Reader, writer::Writer};
use crate::{DecodeError, EncodeError};
use alloc::vec::Vec;

/// A fully decoded APDU: header plus, where the type carries one, the raw
/// service payload. Service payloads are opaque at this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    ConfirmedRequest {
        header: ConfirmedRequest,
        data: Vec<u8>,
    },
    UnconfirmedRequest {
        service_choice: u8,
        data: Vec<u8>,
    },
    SimpleAck(SimpleAck),
    ComplexAck {
        header: ComplexAck,
        data: Vec<u8>,
    },
    SegmentAck(SegmentAck),
    Error(ErrorPdu),
    Reject(RejectPdu),
    Abort(AbortPdu),
}

impl Apdu {
    pub fn apdu_type(&self) -> ApduType {
        match self {
            Self::ConfirmedRequest { .. } => ApduType::ConfirmedRequest,
            Self::UnconfirmedRequest { .. } => ApduType::UnconfirmedRequest,
            Self::SimpleAck(_) => ApduType::SimpleAck,
            Self::ComplexAck { .. } => ApduType::ComplexAck,
            Self::SegmentAck(_) => ApduType::SegmentAck,
            Self::Error(_) => ApduType::Error,
            Self::Reject(_) => ApduType::Reject,
            Self::Abort(_) => ApduType::Abort,
        }
    }

    /// The invoke id, for every type that carries one.
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Self::ConfirmedRequest { header, .. } => Some(header.invoke_id),
            Self::UnconfirmedRequest { .. } => None,
            Self::SimpleAck(ack) => Some(ack.invoke_id),
            Self::ComplexAck { header, .. } => Some(header.invoke_id),
            Self::SegmentAck(ack) => Some(ack.invoke_id),
            Self::Error(e) => Some(e.invoke_id),
            Self::Reject(rej) => Some(rej.invoke_id),
            Self::Abort(abort) => Some(abort.invoke_id),
        }
    }

    /// True when the sender of this APDU was acting as the server side of
    /// the transaction. Meaningful for SegmentAck and Abort only.
    pub fn from_server(&self) -> bool {
        match self {
            Self::SegmentAck(ack) => ack.from_server,
            Self::Abort(abort) => abort.from_server,
            _ => false,
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            Self::ConfirmedRequest { header, data } => {
                header.encode(w)?;
                w.write_all(data)
            }
            Self::UnconfirmedRequest {
                service_choice,
                data,
            } => {
                UnconfirmedRequest {
                    service_choice: *service_choice,
                }
                .encode(w)?;
                w.write_all(data)
            }
            Self::SimpleAck(ack) => ack.encode(w),
            Self::ComplexAck { header, data } => {
                header.encode(w)?;
                w.write_all(data)
            }
            Self::SegmentAck(ack) => ack.encode(w),
            Self::Error(e) => e.encode(w),
            Self::Reject(rej) => rej.encode(w),
            Self::Abort(abort) => abort.encode(w),
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let apdu_type =
            ApduType::from_u8(r.peek_u8()? >> 4).ok_or(DecodeError::Message("bad APDU type"))?;
        match apdu_type {
            ApduType::ConfirmedRequest => {
                let header = ConfirmedRequest::decode(r)?;
                Ok(Self::ConfirmedRequest {
                    header,
                    data: r.rest().to_vec(),
                })
            }
            ApduType::UnconfirmedRequest => {
                let header = UnconfirmedRequest::decode(r)?;
                Ok(Self::UnconfirmedRequest {
                    service_choice: header.service_choice,
                    data: r.rest().to_vec(),
                })
            }
            ApduType::SimpleAck => Ok(Self::SimpleAck(SimpleAck::decode(r)?)),
            ApduType::ComplexAck => {
                let header = ComplexAck::decode(r)?;
                Ok(Self::ComplexAck {
                    header,
                    data: r.rest().to_vec(),
                })
            }
            ApduType::SegmentAck => Ok(Self::SegmentAck(SegmentAck::decode(r)?)),
            ApduType::Error => Ok(Self::Error(ErrorPdu::decode(r)?)),
            ApduType::Reject => Ok(Self::Reject(RejectPdu::decode(r)?)),
            ApduType::Abort => Ok(Self::Abort(AbortPdu::decode(r)?)),
        }
    }

    /// Encode into a fresh heap buffer.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        let payload_len = match self {
            Self::ConfirmedRequest { data, .. }
            | Self::UnconfirmedRequest { data, .. }
            | Self::ComplexAck { data, .. } => data.len(),
            _ => 0,
        };
        let mut buf = alloc::vec![0u8; payload_len + 16];
        let mut w = Writer::new(&mut buf);
        self.encode(&mut w)?;
        let written = w.position();
        buf.truncate(written);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::{Apdu, ApduType, ComplexAck, ConfirmedRequest, MaxApdu, MaxSegments, SimpleAck};
    use crate::encoding::reader::Reader;
    use alloc::vec;

    fn roundtrip(apdu: Apdu) {
        let bytes = apdu.to_bytes().unwrap();
        let mut r = Reader::new(&bytes);
        assert_eq!(Apdu::decode(&mut r).unwrap(), apdu);
        assert!(r.is_empty());
    }

    #[test]
    fn all_types_roundtrip() {
        roundtrip(Apdu::ConfirmedRequest {
            header: ConfirmedRequest::unsegmented(
                5,
                12,
                MaxSegments::Eight,
                MaxApdu::Octets1024,
                true,
            ),
            data: vec![0x0C, 0x00, 0x00, 0x00, 0x00, 0x19, 0x55],
        });
        roundtrip(Apdu::UnconfirmedRequest {
            service_choice: 8,
            data: vec![],
        });
        roundtrip(Apdu::SimpleAck(SimpleAck {
            invoke_id: 5,
            service_choice: 15,
        }));
        roundtrip(Apdu::ComplexAck {
            header: ComplexAck {
                segmented: true,
                more_follows: true,
                invoke_id: 5,
                sequence_number: Some(0),
                window_size: Some(4),
                service_choice: 14,
            },
            data: vec![1, 2, 3],
        });
        roundtrip(Apdu::SegmentAck(super::SegmentAck {
            negative_ack: false,
            from_server: true,
            invoke_id: 5,
            sequence_number: 3,
            actual_window_size: 4,
        }));
        roundtrip(Apdu::Error(super::ErrorPdu {
            invoke_id: 5,
            service_choice: 12,
            error_class: 1,
            error_code: 31,
        }));
        roundtrip(Apdu::Reject(super::RejectPdu {
            invoke_id: 5,
            reason: 9,
        }));
        roundtrip(Apdu::Abort(super::AbortPdu {
            from_server: false,
            invoke_id: 5,
            reason: 65,
        }));
    }

    #[test]
    fn decode_dispatches_on_high_nibble() {
        let mut r = Reader::new(&[0x20, 0x05, 0x0F]);
        let apdu = Apdu::decode(&mut r).unwrap();
        assert_eq!(apdu.apdu_type(), ApduType::SimpleAck);
        assert_eq!(apdu.invoke_id(), Some(5));
    }

    #[test]
    fn reserved_type_nibble_fails() {
        let mut r = Reader::new(&[0x80, 0x00]);
        assert!(Apdu::decode(&mut r).is_err());
    }
}
