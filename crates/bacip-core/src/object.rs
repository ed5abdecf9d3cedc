use core::fmt;

/// Common object types; anything else is carried through as `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    AnalogInput,
    AnalogOutput,
    AnalogValue,
    BinaryInput,
    BinaryOutput,
    BinaryValue,
    Device,
    File,
    MultiStateInput,
    MultiStateOutput,
    Other(u16),
}

impl ObjectType {
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::AnalogInput => 0,
            Self::AnalogOutput => 1,
            Self::AnalogValue => 2,
            Self::BinaryInput => 3,
            Self::BinaryOutput => 4,
            Self::BinaryValue => 5,
            Self::Device => 8,
            Self::File => 10,
            Self::MultiStateInput => 13,
            Self::MultiStateOutput => 14,
            Self::Other(v) => v,
        }
    }

    pub const fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::AnalogInput,
            1 => Self::AnalogOutput,
            2 => Self::AnalogValue,
            3 => Self::BinaryInput,
            4 => Self::BinaryOutput,
            5 => Self::BinaryValue,
            8 => Self::Device,
            10 => Self::File,
            13 => Self::MultiStateInput,
            14 => Self::MultiStateOutput,
            v => Self::Other(v),
        }
    }
}

/// A BACnet object identifier: ten bits of type, twenty-two bits of instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectId(u32);

impl ObjectId {
    pub const MAX_INSTANCE: u32 = 0x3F_FFFF;

    pub fn new(object_type: ObjectType, instance: u32) -> Self {
        Self(((object_type.to_u16() as u32) << 22) | (instance & Self::MAX_INSTANCE))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn object_type(self) -> ObjectType {
        ObjectType::from_u16((self.0 >> 22) as u16)
    }

    pub const fn instance(self) -> u32 {
        self.0 & Self::MAX_INSTANCE
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.object_type(), self.instance())
    }
}

#[cfg(test)]
mod tests {
    use super::{ObjectId, ObjectType};

    #[test]
    fn packs_type_and_instance() {
        let id = ObjectId::new(ObjectType::Device, 881000);
        assert_eq!(id.object_type(), ObjectType::Device);
        assert_eq!(id.instance(), 881000);
        assert_eq!(ObjectId::from_raw(id.raw()), id);
    }

    #[test]
    fn device_zero_raw_form() {
        assert_eq!(ObjectId::new(ObjectType::Device, 0).raw(), 0x0200_0000);
    }
}
