use crate::encoding::{reader::Reader, writer::Writer};
use crate::{DecodeError, EncodeError};

/// Application tag numbers from clause 20.2.1.4.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppTag {
    Null = 0,
    Boolean = 1,
    UnsignedInt = 2,
    SignedInt = 3,
    Real = 4,
    Double = 5,
    OctetString = 6,
    CharacterString = 7,
    BitString = 8,
    Enumerated = 9,
    Date = 10,
    Time = 11,
    ObjectId = 12,
}

impl AppTag {
    pub fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::Null),
            1 => Ok(Self::Boolean),
            2 => Ok(Self::UnsignedInt),
            3 => Ok(Self::SignedInt),
            4 => Ok(Self::Real),
            5 => Ok(Self::Double),
            6 => Ok(Self::OctetString),
            7 => Ok(Self::CharacterString),
            8 => Ok(Self::BitString),
            9 => Ok(Self::Enumerated),
            10 => Ok(Self::Date),
            11 => Ok(Self::Time),
            12 => Ok(Self::ObjectId),
            _ => Err(DecodeError::InvalidTag),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    Application { tag: AppTag, len: u32 },
    Context { tag_num: u8, len: u32 },
    Opening { tag_num: u8 },
    Closing { tag_num: u8 },
}

impl Tag {
    pub fn encode(self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            Tag::Application { tag, len } => encode_numbered(w, tag as u8, false, len),
            Tag::Context { tag_num, len } => encode_numbered(w, tag_num, true, len),
            Tag::Opening { tag_num } => encode_bracket(w, tag_num, 6),
            Tag::Closing { tag_num } => encode_bracket(w, tag_num, 7),
        }
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let first = r.read_u8()?;
        let is_context = (first & 0b0000_1000) != 0;

        let mut tag_num = first >> 4;
        if tag_num == 0x0F {
            tag_num = r.read_u8()?;
        }

        let lvt = first & 0x07;
        if is_context && lvt == 6 {
            return Ok(Tag::Opening { tag_num });
        }
        if is_context && lvt == 7 {
            return Ok(Tag::Closing { tag_num });
        }

        let len = decode_extended_len(r, lvt)?;
        if is_context {
            Ok(Tag::Context { tag_num, len })
        } else {
            Ok(Tag::Application {
                tag: AppTag::from_u8(tag_num)?,
                len,
            })
        }
    }
}

fn encode_numbered(
    w: &mut Writer<'_>,
    tag_num: u8,
    is_context: bool,
    len: u32,
) -> Result<(), EncodeError> {
    let mut first = if tag_num <= 14 { tag_num << 4 } else { 0xF0 };
    if is_context {
        first |= 0b0000_1000;
    }
    first |= if len <= 4 { len as u8 } else { 5 };

    w.write_u8(first)?;
    if tag_num > 14 {
        w.write_u8(tag_num)?;
    }

    if len > 4 {
        if len <= 253 {
            w.write_u8(len as u8)?;
        } else if len <= 65535 {
            w.write_u8(254)?;
            w.write_be_u16(len as u16)?;
        } else {
            w.write_u8(255)?;
            w.write_be_u32(len)?;
        }
    }
    Ok(())
}

fn encode_bracket(w: &mut Writer<'_>, tag_num: u8, lvt: u8) -> Result<(), EncodeError> {
    let mut first = if tag_num <= 14 { tag_num << 4 } else { 0xF0 };
    first |= 0b0000_1000 | lvt;
    w.write_u8(first)?;
    if tag_num > 14 {
        w.write_u8(tag_num)?;
    }
    Ok(())
}

fn decode_extended_len(r: &mut Reader<'_>, lvt: u8) -> Result<u32, DecodeError> {
    match lvt {
        0..=4 => Ok(lvt as u32),
        5 => {
            let first = r.read_u8()?;
            match first {
                0..=253 => Ok(first as u32),
                254 => Ok(r.read_be_u16()? as u32),
                255 => r.read_be_u32(),
            }
        }
        _ => Err(DecodeError::InvalidLength),
    }
}
