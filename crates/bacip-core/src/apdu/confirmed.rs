use crate::apdu::types::{ApduType, MaxApdu, MaxSegments};
use crate::encoding::{
    primitives::{decode_unsigned, encode_app_enumerated},
    reader::Reader,
    tag::{AppTag, Tag},
    writer::Writer,
};
use crate::{DecodeError, EncodeError};

/// Confirmed-Request fixed header. When `segmented` is set the sequence
/// number and window size are present on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmedRequest {
    pub segmented: bool,
    pub more_follows: bool,
    pub segmented_response_accepted: bool,
    pub max_segments: MaxSegments,
    pub max_apdu: MaxApdu,
    pub invoke_id: u8,
    pub sequence_number: Option<u8>,
    pub window_size: Option<u8>,
    pub service_choice: u8,
}

impl ConfirmedRequest {
    /// Plain unsegmented request header.
    pub fn unsegmented(
        invoke_id: u8,
        service_choice: u8,
        max_segments: MaxSegments,
        max_apdu: MaxApdu,
        segmented_response_accepted: bool,
    ) -> Self {
        Self {
            segmented: false,
            more_follows: false,
            segmented_response_accepted,
            max_segments,
            max_apdu,
            invoke_id,
            sequence_number: None,
            window_size: None,
            service_choice,
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        let mut b0 = (ApduType::ConfirmedRequest as u8) << 4;
        if self.segmented {
            b0 |= 0x08;
        }
        if self.more_follows {
            b0 |= 0x04;
        }
        if self.segmented_response_accepted {
            b0 |= 0x02;
        }
        w.write_u8(b0)?;
        w.write_u8((self.max_segments.to_u8() << 4) | self.max_apdu.to_u8())?;
        w.write_u8(self.invoke_id)?;
        if self.segmented {
            w.write_u8(self.sequence_number.unwrap_or(0))?;
            w.write_u8(self.window_size.unwrap_or(1))?;
        }
        w.write_u8(self.service_choice)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let b0 = r.read_u8()?;
        if (b0 >> 4) != ApduType::ConfirmedRequest as u8 {
            return Err(DecodeError::InvalidValue);
        }
        let segmented = (b0 & 0x08) != 0;
        let more_follows = (b0 & 0x04) != 0;
        let segmented_response_accepted = (b0 & 0x02) != 0;
        let seg_resp = r.read_u8()?;
        let invoke_id = r.read_u8()?;
        let (sequence_number, window_size) = if segmented {
            (Some(r.read_u8()?), Some(r.read_u8()?))
        } else {
            (None, None)
        };
        let service_choice = r.read_u8()?;
        Ok(Self {
            segmented,
            more_follows,
            segmented_response_accepted,
            max_segments: MaxSegments::from_u8(seg_resp >> 4),
            max_apdu: MaxApdu::from_u8(seg_resp & 0x0F)?,
            invoke_id,
            sequence_number,
            window_size,
            service_choice,
        })
    }
}

/// Complex-Ack fixed header, segmented the same way as the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComplexAck {
    pub segmented: bool,
    pub more_follows: bool,
    pub invoke_id: u8,
    pub sequence_number: Option<u8>,
    pub window_size: Option<u8>,
    pub service_choice: u8,
}

impl ComplexAck {
    pub fn unsegmented(invoke_id: u8, service_choice: u8) -> Self {
        Self {
            segmented: false,
            more_follows: false,
            invoke_id,
            sequence_number: None,
            window_size: None,
            service_choice,
        }
    }

    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        let mut b0 = (ApduType::ComplexAck as u8) << 4;
        if self.segmented {
            b0 |= 0x08;
        }
        if self.more_follows {
            b0 |= 0x04;
        }
        w.write_u8(b0)?;
        w.write_u8(self.invoke_id)?;
        if self.segmented {
            w.write_u8(self.sequence_number.unwrap_or(0))?;
            w.write_u8(self.window_size.unwrap_or(1))?;
        }
        w.write_u8(self.service_choice)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let b0 = r.read_u8()?;
        if (b0 >> 4) != ApduType::ComplexAck as u8 {
            return Err(DecodeError::InvalidValue);
        }
        let segmented = (b0 & 0x08) != 0;
        let more_follows = (b0 & 0x04) != 0;
        let invoke_id = r.read_u8()?;
        let (sequence_number, window_size) = if segmented {
            (Some(r.read_u8()?), Some(r.read_u8()?))
        } else {
            (None, None)
        };
        let service_choice = r.read_u8()?;
        Ok(Self {
            segmented,
            more_follows,
            invoke_id,
            sequence_number,
            window_size,
            service_choice,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleAck {
    pub invoke_id: u8,
    pub service_choice: u8,
}

impl SimpleAck {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8((ApduType::SimpleAck as u8) << 4)?;
        w.write_u8(self.invoke_id)?;
        w.write_u8(self.service_choice)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let b0 = r.read_u8()?;
        if (b0 >> 4) != ApduType::SimpleAck as u8 {
            return Err(DecodeError::InvalidValue);
        }
        Ok(Self {
            invoke_id: r.read_u8()?,
            service_choice: r.read_u8()?,
        })
    }
}

/// Segment-Ack: `negative_ack` requests retransmission from the sequence
/// number after the one acknowledged here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAck {
    pub negative_ack: bool,
    pub from_server: bool,
    pub invoke_id: u8,
    pub sequence_number: u8,
    pub actual_window_size: u8,
}

impl SegmentAck {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        let mut b0 = (ApduType::SegmentAck as u8) << 4;
        if self.negative_ack {
            b0 |= 0x02;
        }
        if self.from_server {
            b0 |= 0x01;
        }
        w.write_u8(b0)?;
        w.write_u8(self.invoke_id)?;
        w.write_u8(self.sequence_number)?;
        w.write_u8(self.actual_window_size)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let b0 = r.read_u8()?;
        if (b0 >> 4) != ApduType::SegmentAck as u8 {
            return Err(DecodeError::InvalidValue);
        }
        Ok(Self {
            negative_ack: (b0 & 0x02) != 0,
            from_server: (b0 & 0x01) != 0,
            invoke_id: r.read_u8()?,
            sequence_number: r.read_u8()?,
            actual_window_size: r.read_u8()?,
        })
    }
}

/// Error PDU with the error class and code pair from the service payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPdu {
    pub invoke_id: u8,
    pub service_choice: u8,
    pub error_class: u32,
    pub error_code: u32,
}

impl ErrorPdu {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8((ApduType::Error as u8) << 4)?;
        w.write_u8(self.invoke_id)?;
        w.write_u8(self.service_choice)?;
        encode_app_enumerated(w, self.error_class)?;
        encode_app_enumerated(w, self.error_code)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let b0 = r.read_u8()?;
        if (b0 >> 4) != ApduType::Error as u8 {
            return Err(DecodeError::InvalidValue);
        }
        let invoke_id = r.read_u8()?;
        let service_choice = r.read_u8()?;
        if r.is_empty() {
            // Some devices omit the error payload entirely.
            return Ok(Self {
                invoke_id,
                service_choice,
                error_class: 0,
                error_code: 0,
            });
        }

        // Class and code arrive either bare or wrapped in a [0] constructed
        // element, and either application-enumerated or context-tagged.
        let first = Tag::decode(r)?;
        let (error_class, error_code) = match first {
            Tag::Opening { tag_num: 0 } => {
                let class_tag = Tag::decode(r)?;
                let class = decode_error_value(r, class_tag, 0)?;
                let code_tag = Tag::decode(r)?;
                let code = decode_error_value(r, code_tag, 1)?;
                match Tag::decode(r)? {
                    Tag::Closing { tag_num: 0 } => {}
                    _ => return Err(DecodeError::InvalidTag),
                }
                (class, code)
            }
            tag => {
                let class = decode_error_value(r, tag, 0)?;
                let code_tag = Tag::decode(r)?;
                let code = decode_error_value(r, code_tag, 1)?;
                (class, code)
            }
        };

        Ok(Self {
            invoke_id,
            service_choice,
            error_class,
            error_code,
        })
    }
}

fn decode_error_value(r: &mut Reader<'_>, tag: Tag, ctx: u8) -> Result<u32, DecodeError> {
    match tag {
        Tag::Context { tag_num, len } if tag_num == ctx => decode_unsigned(r, len as usize),
        Tag::Application {
            tag: AppTag::Enumerated,
            len,
        } => decode_unsigned(r, len as usize),
        _ => Err(DecodeError::InvalidTag),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejectPdu {
    pub invoke_id: u8,
    pub reason: u8,
}

impl RejectPdu {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        w.write_u8((ApduType::Reject as u8) << 4)?;
        w.write_u8(self.invoke_id)?;
        w.write_u8(self.reason)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let b0 = r.read_u8()?;
        if (b0 >> 4) != ApduType::Reject as u8 {
            return Err(DecodeError::InvalidValue);
        }
        Ok(Self {
            invoke_id: r.read_u8()?,
            reason: r.read_u8()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortPdu {
    pub from_server: bool,
    pub invoke_id: u8,
    pub reason: u8,
}

impl AbortPdu {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        let mut b0 = (ApduType::Abort as u8) << 4;
        if self.from_server {
            b0 |= 0x01;
        }
        w.write_u8(b0)?;
        w.write_u8(self.invoke_id)?;
        w.write_u8(self.reason)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let b0 = r.read_u8()?;
        if (b0 >> 4) != ApduType::Abort as u8 {
            return Err(DecodeError::InvalidValue);
        }
        Ok(Self {
            from_server: (b0 & 0x01) != 0,
            invoke_id: r.read_u8()?,
            reason: r.read_u8()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfirmedRequest, ErrorPdu, SegmentAck};
    use crate::apdu::types::{MaxApdu, MaxSegments};
    use crate::encoding::{reader::Reader, writer::Writer};

    #[test]
    fn segmented_request_header_roundtrip() {
        let hdr = ConfirmedRequest {
            segmented: true,
            more_follows: true,
            segmented_response_accepted: true,
            max_segments: MaxSegments::Four,
            max_apdu: MaxApdu::Octets480,
            invoke_id: 33,
            sequence_number: Some(2),
            window_size: Some(4),
            service_choice: 12,
        };
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        hdr.encode(&mut w).unwrap();
        assert_eq!(w.as_written()[0], 0x0E);
        assert_eq!(w.as_written()[1], 0x23);
        let mut r = Reader::new(w.as_written());
        assert_eq!(ConfirmedRequest::decode(&mut r).unwrap(), hdr);
    }

    #[test]
    fn out_of_range_max_apdu_is_rejected() {
        // Low nibble 7 is not a defined max-apdu encoding.
        let mut r = Reader::new(&[0x00, 0x07, 0x01, 0x0C]);
        assert!(ConfirmedRequest::decode(&mut r).is_err());
    }

    #[test]
    fn segment_ack_flags() {
        let ack = SegmentAck {
            negative_ack: true,
            from_server: true,
            invoke_id: 5,
            sequence_number: 7,
            actual_window_size: 4,
        };
        let mut buf = [0u8; 4];
        let mut w = Writer::new(&mut buf);
        ack.encode(&mut w).unwrap();
        assert_eq!(w.as_written(), &[0x43, 5, 7, 4]);
        let mut r = Reader::new(w.as_written());
        assert_eq!(SegmentAck::decode(&mut r).unwrap(), ack);
    }

    #[test]
    fn error_pdu_roundtrip() {
        let e = ErrorPdu {
            invoke_id: 9,
            service_choice: 12,
            error_class: 2,
            error_code: 32,
        };
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        e.encode(&mut w).unwrap();
        let mut r = Reader::new(w.as_written());
        assert_eq!(ErrorPdu::decode(&mut r).unwrap(), e);
    }

    #[test]
    fn error_pdu_accepts_context_tagged_details() {
        let mut r = Reader::new(&[0x50, 1, 15, 0x09, 0x02, 0x19, 0x20]);
        let e = ErrorPdu::decode(&mut r).unwrap();
        assert_eq!(e.error_class, 2);
        assert_eq!(e.error_code, 32);
    }

    #[test]
    fn error_pdu_accepts_wrapped_details() {
        let mut r = Reader::new(&[0x50, 1, 15, 0x0E, 0x91, 0x02, 0x91, 0x20, 0x0F]);
        let e = ErrorPdu::decode(&mut r).unwrap();
        assert_eq!(e.error_class, 2);
        assert_eq!(e.error_code, 32);
    }
}
