use crate::DecodeError;

/// The eight APDU types, encoded in the high nibble of the first octet.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApduType {
    ConfirmedRequest = 0,
    UnconfirmedRequest = 1,
    SimpleAck = 2,
    ComplexAck = 3,
    SegmentAck = 4,
    Error = 5,
    Reject = 6,
    Abort = 7,
}

impl ApduType {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ConfirmedRequest),
            1 => Some(Self::UnconfirmedRequest),
            2 => Some(Self::SimpleAck),
            3 => Some(Self::ComplexAck),
            4 => Some(Self::SegmentAck),
            5 => Some(Self::Error),
            6 => Some(Self::Reject),
            7 => Some(Self::Abort),
            _ => None,
        }
    }
}

/// Maximum number of response segments the requester will accept, clause
/// 20.1.2.4: three bits, `0` unspecified, otherwise a power of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxSegments {
    #[default]
    Unspecified,
    Two,
    Four,
    Eight,
    Sixteen,
    ThirtyTwo,
    SixtyFour,
    MoreThanSixtyFour,
}

impl MaxSegments {
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Unspecified => 0,
            Self::Two => 1,
            Self::Four => 2,
            Self::Eight => 3,
            Self::Sixteen => 4,
            Self::ThirtyTwo => 5,
            Self::SixtyFour => 6,
            Self::MoreThanSixtyFour => 7,
        }
    }

    pub const fn from_u8(value: u8) -> Self {
        match value & 0x07 {
            0 => Self::Unspecified,
            1 => Self::Two,
            2 => Self::Four,
            3 => Self::Eight,
            4 => Self::Sixteen,
            5 => Self::ThirtyTwo,
            6 => Self::SixtyFour,
            _ => Self::MoreThanSixtyFour,
        }
    }

    /// Segment-count limit this value imposes, if any.
    pub const fn limit(self) -> Option<u32> {
        match self {
            Self::Unspecified | Self::MoreThanSixtyFour => None,
            Self::Two => Some(2),
            Self::Four => Some(4),
            Self::Eight => Some(8),
            Self::Sixteen => Some(16),
            Self::ThirtyTwo => Some(32),
            Self::SixtyFour => Some(64),
        }
    }

    /// Smallest encodable value that admits `count` segments.
    pub const fn from_count(count: u32) -> Self {
        match count {
            0 => Self::Unspecified,
            1..=2 => Self::Two,
            3..=4 => Self::Four,
            5..=8 => Self::Eight,
            9..=16 => Self::Sixteen,
            17..=32 => Self::ThirtyTwo,
            33..=64 => Self::SixtyFour,
            _ => Self::MoreThanSixtyFour,
        }
    }
}

/// Maximum APDU length the requester will accept, clause 20.1.2.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxApdu {
    Octets50,
    Octets128,
    Octets206,
    Octets480,
    Octets1024,
    Octets1476,
}

impl MaxApdu {
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Octets50 => 0,
            Self::Octets128 => 1,
            Self::Octets206 => 2,
            Self::Octets480 => 3,
            Self::Octets1024 => 4,
            Self::Octets1476 => 5,
        }
    }

    pub const fn from_u8(value: u8) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::Octets50),
            1 => Ok(Self::Octets128),
            2 => Ok(Self::Octets206),
            3 => Ok(Self::Octets480),
            4 => Ok(Self::Octets1024),
            5 => Ok(Self::Octets1476),
            _ => Err(DecodeError::InvalidValue),
        }
    }

    pub const fn octets(self) -> usize {
        match self {
            Self::Octets50 => 50,
            Self::Octets128 => 128,
            Self::Octets206 => 206,
            Self::Octets480 => 480,
            Self::Octets1024 => 1024,
            Self::Octets1476 => 1476,
        }
    }

    /// Largest encodable value not exceeding `octets`.
    pub const fn fitting(octets: usize) -> Self {
        match octets {
            0..=127 => Self::Octets50,
            128..=205 => Self::Octets128,
            206..=479 => Self::Octets206,
            480..=1023 => Self::Octets480,
            1024..=1475 => Self::Octets1024,
            _ => Self::Octets1476,
        }
    }
}

/// Abort reasons from clause 5.4.5.3; codes 64..=255 are vendor-specific.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Other = 0,
    BufferOverflow = 1,
    InvalidApduInThisState = 2,
    PreemptedByHigherPriorityTask = 3,
    SegmentationNotSupported = 4,
    SecurityError = 5,
    InsufficientSecurity = 6,
    WindowSizeOutOfRange = 7,
    ApplicationExceededReplyTime = 8,
    OutOfResources = 9,
    TsmTimeout = 10,
    ApduTooLong = 11,
    ServerTimeout = 64,
    NoResponse = 65,
}

impl AbortReason {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Other),
            1 => Some(Self::BufferOverflow),
            2 => Some(Self::InvalidApduInThisState),
            3 => Some(Self::PreemptedByHigherPriorityTask),
            4 => Some(Self::SegmentationNotSupported),
            5 => Some(Self::SecurityError),
            6 => Some(Self::InsufficientSecurity),
            7 => Some(Self::WindowSizeOutOfRange),
            8 => Some(Self::ApplicationExceededReplyTime),
            9 => Some(Self::OutOfResources),
            10 => Some(Self::TsmTimeout),
            11 => Some(Self::ApduTooLong),
            64 => Some(Self::ServerTimeout),
            65 => Some(Self::NoResponse),
            _ => None,
        }
    }
}

/// Reject reasons from clause 5.4.5.2.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Other = 0,
    BufferOverflow = 1,
    InconsistentParameters = 2,
    InvalidParameterDatatype = 3,
    InvalidTag = 4,
    MissingRequiredParameter = 5,
    ParameterOutOfRange = 6,
    TooManyArguments = 7,
    UndefinedEnumeration = 8,
    UnrecognizedService = 9,
}

impl RejectReason {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Other),
            1 => Some(Self::BufferOverflow),
            2 => Some(Self::InconsistentParameters),
            3 => Some(Self::InvalidParameterDatatype),
            4 => Some(Self::InvalidTag),
            5 => Some(Self::MissingRequiredParameter),
            6 => Some(Self::ParameterOutOfRange),
            7 => Some(Self::TooManyArguments),
            8 => Some(Self::UndefinedEnumeration),
            9 => Some(Self::UnrecognizedService),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MaxApdu, MaxSegments};
    use crate::DecodeError;

    #[test]
    fn max_segments_table() {
        for raw in 0..8 {
            assert_eq!(MaxSegments::from_u8(raw).to_u8(), raw);
        }
        assert_eq!(MaxSegments::from_count(5), MaxSegments::Eight);
        assert_eq!(MaxSegments::Eight.limit(), Some(8));
        assert_eq!(MaxSegments::MoreThanSixtyFour.limit(), None);
    }

    #[test]
    fn max_apdu_table() {
        let sizes = [50, 128, 206, 480, 1024, 1476];
        for (raw, size) in sizes.iter().enumerate() {
            let v = MaxApdu::from_u8(raw as u8).unwrap();
            assert_eq!(v.octets(), *size);
            assert_eq!(v.to_u8(), raw as u8);
        }
        assert_eq!(MaxApdu::from_u8(6), Err(DecodeError::InvalidValue));
        assert_eq!(MaxApdu::fitting(1497), MaxApdu::Octets1476);
        assert_eq!(MaxApdu::fitting(480), MaxApdu::Octets480);
    }
}
