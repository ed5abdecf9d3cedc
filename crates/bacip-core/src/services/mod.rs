//! Service payload codecs for the services the stack itself exercises.
//!
//! Everything else rides through the stack as opaque bytes; applications
//! bring their own payload codecs.

/// I-Am request payload.
pub mod i_am;
/// ReadProperty request and ack payloads.
pub mod read_property;
/// Who-Is request payload.
pub mod who_is;

pub use i_am::{IAmRequest, Segmentation, SERVICE_I_AM};
pub use read_property::{ReadPropertyAck, ReadPropertyRequest, SERVICE_READ_PROPERTY};
pub use who_is::{WhoIsRequest, SERVICE_WHO_IS};

/// Bit position of a confirmed service choice in the
/// protocol-services-supported bit string (clause 21, BACnetServicesSupported).
pub const fn confirmed_service_bit(service_choice: u8) -> Option<u8> {
    match service_choice {
        // acknowledgeAlarm .. readProperty share their choice value.
        0..=12 => Some(service_choice),
        // 13 (readPropertyConditional) was removed from the standard.
        14..=25 => Some(service_choice),
        26 => Some(35), // readRange
        27 => Some(37), // lifeSafetyOperation
        28 => Some(38), // subscribeCOVProperty
        29 => Some(39), // getEventInformation
        _ => None,
    }
}

/// Bit position of an unconfirmed service choice in the
/// protocol-services-supported bit string.
pub const fn unconfirmed_service_bit(service_choice: u8) -> Option<u8> {
    match service_choice {
        0..=8 => Some(service_choice + 26), // iAm .. whoIs
        9 => Some(36),                      // utcTimeSynchronization
        10 => Some(40),                     // writeGroup
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{confirmed_service_bit, unconfirmed_service_bit};

    #[test]
    fn bit_positions_match_clause_21() {
        assert_eq!(confirmed_service_bit(12), Some(12)); // readProperty
        assert_eq!(confirmed_service_bit(13), None);
        assert_eq!(confirmed_service_bit(26), Some(35)); // readRange
        assert_eq!(unconfirmed_service_bit(0), Some(26)); // iAm
        assert_eq!(unconfirmed_service_bit(8), Some(34)); // whoIs
        assert_eq!(unconfirmed_service_bit(11), None);
    }
}
