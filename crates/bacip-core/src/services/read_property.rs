use crate::encoding::{
    primitives::{decode_ctx_unsigned, decode_unsigned, encode_ctx_unsigned},
    reader::Reader,
    tag::Tag,
    writer::Writer,
};
use crate::object::ObjectId;
use crate::{DecodeError, EncodeError};
use alloc::vec::Vec;

// An object identifier is always four octets, never length-minimized.
fn encode_ctx_object_id(
    w: &mut Writer<'_>,
    tag_num: u8,
    object_id: ObjectId,
) -> Result<(), EncodeError> {
    Tag::Context { tag_num, len: 4 }.encode(w)?;
    w.write_be_u32(object_id.raw())
}

pub const SERVICE_READ_PROPERTY: u8 = 0x0C;

/// Present-value property identifier, used throughout the tests.
pub const PROP_PRESENT_VALUE: u32 = 85;
/// Object-name property identifier.
pub const PROP_OBJECT_NAME: u32 = 77;

/// ReadProperty-Request: object, property, optional array index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPropertyRequest {
    pub object_id: ObjectId,
    pub property_id: u32,
    pub array_index: Option<u32>,
}

impl ReadPropertyRequest {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        encode_ctx_object_id(w, 0, self.object_id)?;
        encode_ctx_unsigned(w, 1, self.property_id)?;
        if let Some(index) = self.array_index {
            encode_ctx_unsigned(w, 2, index)?;
        }
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let object_id = ObjectId::from_raw(decode_ctx_unsigned(r, 0)?);
        let property_id = decode_ctx_unsigned(r, 1)?;
        let array_index = if r.is_empty() {
            None
        } else {
            match Tag::decode(r)? {
                Tag::Context { tag_num: 2, len } => Some(decode_unsigned(r, len as usize)?),
                _ => return Err(DecodeError::InvalidTag),
            }
        };
        Ok(Self {
            object_id,
            property_id,
            array_index,
        })
    }
}

/// ReadProperty-ACK. The property value is kept as raw application-tagged
/// bytes; interpreting it is the application's business.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPropertyAck {
    pub object_id: ObjectId,
    pub property_id: u32,
    pub array_index: Option<u32>,
    pub value: Vec<u8>,
}

impl ReadPropertyAck {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        encode_ctx_object_id(w, 0, self.object_id)?;
        encode_ctx_unsigned(w, 1, self.property_id)?;
        if let Some(index) = self.array_index {
            encode_ctx_unsigned(w, 2, index)?;
        }
        Tag::Opening { tag_num: 3 }.encode(w)?;
        w.write_all(&self.value)?;
        Tag::Closing { tag_num: 3 }.encode(w)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let object_id = ObjectId::from_raw(decode_ctx_unsigned(r, 0)?);
        let property_id = decode_ctx_unsigned(r, 1)?;
        let mut array_index = None;

        let mut next = Tag::decode(r)?;
        if let Tag::Context { tag_num: 2, len } = next {
            array_index = Some(decode_unsigned(r, len as usize)?);
            next = Tag::decode(r)?;
        }
        if next != (Tag::Opening { tag_num: 3 }) {
            return Err(DecodeError::InvalidTag);
        }

        // The value runs to the matching closing bracket, which for the flat
        // values used here is the final octet.
        let body = r.rest();
        let Some((&last, value)) = body.split_last() else {
            return Err(DecodeError::UnexpectedEof);
        };
        let mut check = Reader::new(core::slice::from_ref(&last));
        match Tag::decode(&mut check)? {
            Tag::Closing { tag_num: 3 } => {}
            _ => return Err(DecodeError::InvalidTag),
        }

        Ok(Self {
            object_id,
            property_id,
            array_index,
            value: value.to_vec(),
        })
    }
}
