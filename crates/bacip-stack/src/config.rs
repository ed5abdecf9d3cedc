use crate::error::StackError;
use bacip_core::address::IpPort;
use bacip_core::apdu::MaxSegments;
use bacip_core::services::i_am::Segmentation;
use std::time::Duration;

/// Everything the stack needs to come up. Defaults follow the values common
/// BACnet devices ship with; only the bind address and device instance have
/// no sensible default.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StackConfig {
    /// Local bind address. Port 47808 unless told otherwise.
    pub local_address: IpPort,
    /// Instance number of the local device object.
    pub device_instance: u32,
    /// Vendor identifier advertised in I-Am.
    pub vendor_id: u32,
    /// Register with this BBMD as a foreign device.
    pub bbmd_address: Option<IpPort>,
    /// Registration time-to-live in seconds.
    pub bbmd_ttl: u16,
    /// Confirmed-request retry timer.
    pub apdu_timeout: Duration,
    /// Per-segment timer while a segmented exchange is in flight.
    pub apdu_segment_timeout: Duration,
    /// Retransmissions of a request (or a segment window) before giving up.
    pub number_of_apdu_retries: u8,
    /// What this node can do about segmentation.
    pub segmentation_supported: Segmentation,
    /// Segments we are willing to accept in a response, and the window size
    /// proposed when sending segmented.
    pub max_segments_accepted: u8,
    /// Largest APDU this node accepts.
    pub max_apdu_length_accepted: usize,
    /// How long a server transaction waits for the application to answer.
    pub application_timeout: Duration,
    /// Idle eviction for the per-peer transport table; zero disables it.
    pub peer_idle_timeout: Duration,
}

impl StackConfig {
    pub fn new(local_address: IpPort, device_instance: u32) -> Self {
        Self {
            local_address,
            device_instance,
            vendor_id: 0,
            bbmd_address: None,
            bbmd_ttl: 60,
            apdu_timeout: Duration::from_millis(3000),
            apdu_segment_timeout: Duration::from_millis(1500),
            number_of_apdu_retries: 3,
            segmentation_supported: Segmentation::None,
            max_segments_accepted: 8,
            max_apdu_length_accepted: 1024,
            application_timeout: Duration::from_millis(3000),
            peer_idle_timeout: Duration::ZERO,
        }
    }

    pub fn with_bbmd(mut self, bbmd: IpPort, ttl: u16) -> Self {
        self.bbmd_address = Some(bbmd);
        self.bbmd_ttl = ttl;
        self
    }

    pub fn with_segmentation(mut self, segmentation: Segmentation) -> Self {
        self.segmentation_supported = segmentation;
        self
    }

    pub fn validate(&self) -> Result<(), StackError> {
        if self.device_instance > bacip_core::object::ObjectId::MAX_INSTANCE {
            return Err(StackError::Config("device instance out of range"));
        }
        if self.bbmd_address.is_some() && self.bbmd_ttl == 0 {
            return Err(StackError::Config("foreign registration ttl must be non-zero"));
        }
        if self.max_segments_accepted == 0 {
            return Err(StackError::Config("max segments accepted must be non-zero"));
        }
        if self.max_apdu_length_accepted < 50 || self.max_apdu_length_accepted > 1476 {
            return Err(StackError::Config("max apdu length outside 50..=1476"));
        }
        if self.number_of_apdu_retries == 0 {
            return Err(StackError::Config("at least one apdu retry is required"));
        }
        Ok(())
    }

    /// The window size proposed on the first segment of anything we send.
    pub fn proposed_window_size(&self) -> u8 {
        self.max_segments_accepted.min(127)
    }

    /// The `max_segments_accepted` field as it goes on the wire.
    pub fn max_segments(&self) -> MaxSegments {
        MaxSegments::from_count(u32::from(self.max_segments_accepted))
    }
}

#[cfg(test)]
mod tests {
    use super::StackConfig;
    use bacip_core::address::IpPort;

    fn base() -> StackConfig {
        StackConfig::new(IpPort::new([192, 168, 0, 9], 47808), 599)
    }

    #[test]
    fn defaults_validate() {
        base().validate().unwrap();
    }

    #[test]
    fn zero_ttl_with_bbmd_is_fatal() {
        let cfg = base().with_bbmd(IpPort::new([10, 0, 0, 1], 47808), 0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn apdu_length_bounds() {
        let mut cfg = base();
        cfg.max_apdu_length_accepted = 2000;
        assert!(cfg.validate().is_err());
        cfg.max_apdu_length_accepted = 49;
        assert!(cfg.validate().is_err());
    }
}
