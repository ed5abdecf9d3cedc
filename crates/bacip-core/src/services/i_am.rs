use crate::encoding::{
    primitives::{
        decode_app_enumerated, decode_app_object_id, decode_app_unsigned, encode_app_enumerated,
        encode_app_object_id, encode_app_unsigned,
    },
    reader::Reader,
    writer::Writer,
};
use crate::object::ObjectId;
use crate::{DecodeError, EncodeError};

pub const SERVICE_I_AM: u8 = 0x00;

/// Segmentation support advertised by a device (BACnetSegmentation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Segmentation {
    Both,
    Transmit,
    Receive,
    #[default]
    None,
}

impl Segmentation {
    pub const fn to_u32(self) -> u32 {
        match self {
            Self::Both => 0,
            Self::Transmit => 1,
            Self::Receive => 2,
            Self::None => 3,
        }
    }

    pub const fn from_u32(value: u32) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::Both),
            1 => Ok(Self::Transmit),
            2 => Ok(Self::Receive),
            3 => Ok(Self::None),
            _ => Err(DecodeError::InvalidValue),
        }
    }

    pub const fn can_transmit(self) -> bool {
        matches!(self, Self::Both | Self::Transmit)
    }

    pub const fn can_receive(self) -> bool {
        matches!(self, Self::Both | Self::Receive)
    }
}

/// I-Am announcement payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IAmRequest {
    pub device_id: ObjectId,
    pub max_apdu_length: u32,
    pub segmentation: Segmentation,
    pub vendor_id: u32,
}

impl IAmRequest {
    pub fn encode(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        encode_app_object_id(w, self.device_id.raw())?;
        encode_app_unsigned(w, self.max_apdu_length)?;
        encode_app_enumerated(w, self.segmentation.to_u32())?;
        encode_app_unsigned(w, self.vendor_id)
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            device_id: ObjectId::from_raw(decode_app_object_id(r)?),
            max_apdu_length: decode_app_unsigned(r)?,
            segmentation: Segmentation::from_u32(decode_app_enumerated(r)?)?,
            vendor_id: decode_app_unsigned(r)?,
        })
    }
}
