use crate::encoding::{
    reader::Reader,
    tag::{AppTag, Tag},
    writer::Writer,
};
use crate::{DecodeError, EncodeError};

/// Minimal big-endian encoding of an unsigned value, returning the number of
/// octets written (1..=4).
pub fn encode_unsigned(w: &mut Writer<'_>, value: u32) -> Result<usize, EncodeError> {
    let len = match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    };
    for i in (0..len).rev() {
        w.write_u8((value >> (i * 8)) as u8)?;
    }
    Ok(len)
}

pub fn decode_unsigned(r: &mut Reader<'_>, len: usize) -> Result<u32, DecodeError> {
    if len == 0 || len > 4 {
        return Err(DecodeError::InvalidLength);
    }
    let mut value = 0u32;
    for _ in 0..len {
        value = (value << 8) | u32::from(r.read_u8()?);
    }
    Ok(value)
}

fn unsigned_len(value: u32) -> u32 {
    match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

pub fn encode_ctx_unsigned(w: &mut Writer<'_>, tag_num: u8, value: u32) -> Result<(), EncodeError> {
    Tag::Context {
        tag_num,
        len: unsigned_len(value),
    }
    .encode(w)?;
    encode_unsigned(w, value)?;
    Ok(())
}

pub fn decode_ctx_unsigned(r: &mut Reader<'_>, tag_num: u8) -> Result<u32, DecodeError> {
    match Tag::decode(r)? {
        Tag::Context { tag_num: t, len } if t == tag_num => decode_unsigned(r, len as usize),
        _ => Err(DecodeError::InvalidTag),
    }
}

pub fn encode_app_unsigned(w: &mut Writer<'_>, value: u32) -> Result<(), EncodeError> {
    Tag::Application {
        tag: AppTag::UnsignedInt,
        len: unsigned_len(value),
    }
    .encode(w)?;
    encode_unsigned(w, value)?;
    Ok(())
}

pub fn decode_app_unsigned(r: &mut Reader<'_>) -> Result<u32, DecodeError> {
    match Tag::decode(r)? {
        Tag::Application {
            tag: AppTag::UnsignedInt,
            len,
        } => decode_unsigned(r, len as usize),
        _ => Err(DecodeError::InvalidTag),
    }
}

pub fn encode_app_enumerated(w: &mut Writer<'_>, value: u32) -> Result<(), EncodeError> {
    Tag::Application {
        tag: AppTag::Enumerated,
        len: unsigned_len(value),
    }
    .encode(w)?;
    encode_unsigned(w, value)?;
    Ok(())
}

pub fn decode_app_enumerated(r: &mut Reader<'_>) -> Result<u32, DecodeError> {
    match Tag::decode(r)? {
        Tag::Application {
            tag: AppTag::Enumerated,
            len,
        } => decode_unsigned(r, len as usize),
        _ => Err(DecodeError::InvalidTag),
    }
}

pub fn encode_app_object_id(w: &mut Writer<'_>, raw: u32) -> Result<(), EncodeError> {
    Tag::Application {
        tag: AppTag::ObjectId,
        len: 4,
    }
    .encode(w)?;
    w.write_be_u32(raw)
}

pub fn decode_app_object_id(r: &mut Reader<'_>) -> Result<u32, DecodeError> {
    match Tag::decode(r)? {
        Tag::Application {
            tag: AppTag::ObjectId,
            len: 4,
        } => r.read_be_u32(),
        _ => Err(DecodeError::InvalidTag),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{reader::Reader, writer::Writer};

    #[test]
    fn unsigned_uses_minimal_octets() {
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        assert_eq!(encode_unsigned(&mut w, 0x1234).unwrap(), 2);
        assert_eq!(w.as_written(), &[0x12, 0x34]);
    }

    #[test]
    fn ctx_unsigned_roundtrip() {
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        encode_ctx_unsigned(&mut w, 1, 47808).unwrap();
        let mut r = Reader::new(w.as_written());
        assert_eq!(decode_ctx_unsigned(&mut r, 1).unwrap(), 47808);
    }

    #[test]
    fn app_enumerated_roundtrip() {
        let mut buf = [0u8; 8];
        let mut w = Writer::new(&mut buf);
        encode_app_enumerated(&mut w, 3).unwrap();
        assert_eq!(w.as_written(), &[0x91, 0x03]);
        let mut r = Reader::new(w.as_written());
        assert_eq!(decode_app_enumerated(&mut r).unwrap(), 3);
    }
}
