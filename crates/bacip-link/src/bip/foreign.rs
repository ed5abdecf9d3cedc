use crate::bip::simple::station_ip;
use crate::bip::Inbound;
use crate::LinkError;
use bacip_core::address::{Address, IpPort, Mac};
use bacip_core::bvll::BvllMessage;
use bacip_core::encoding::reader::Reader;
use bacip_core::pdu::Pdu;

/// Where a foreign device stands with its BBMD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    /// Registration sent; `error` holds a non-zero Result if the BBMD
    /// refused. A refused registration is not retried automatically.
    Pending { error: Option<u16> },
    Registered { ttl: u16 },
    Unregistering,
}

/// A device on a subnet with no BBMD of its own: it registers with a remote
/// BBMD and sends local broadcasts there as
/// Distribute-Broadcast-To-Network.
#[derive(Debug)]
pub struct BipForeign {
    bbmd: IpPort,
    ttl: u16,
    state: RegistrationState,
    refresh_in: u32,
}

impl BipForeign {
    pub fn new(bbmd: IpPort, ttl: u16) -> Self {
        Self {
            bbmd,
            ttl,
            state: RegistrationState::Unregistered,
            refresh_in: 0,
        }
    }

    pub fn state(&self) -> RegistrationState {
        self.state
    }

    pub fn bbmd_addr(&self) -> IpPort {
        self.bbmd
    }

    /// Kick off (or re-kick) registration with the BBMD.
    pub fn register(&mut self) -> Vec<(IpPort, Vec<u8>)> {
        self.state = RegistrationState::Pending { error: None };
        match (BvllMessage::RegisterForeignDevice { ttl: self.ttl }).to_frame() {
            Ok(frame) => vec![(self.bbmd, frame)],
            Err(_) => Vec::new(),
        }
    }

    /// Drop the registration: a zero-TTL registration tells the BBMD to
    /// forget us, and any later Result is ignored.
    pub fn unregister(&mut self) -> Vec<(IpPort, Vec<u8>)> {
        self.state = RegistrationState::Unregistering;
        match (BvllMessage::RegisterForeignDevice { ttl: 0 }).to_frame() {
            Ok(frame) => vec![(self.bbmd, frame)],
            Err(_) => Vec::new(),
        }
    }

    pub fn outbound(
        &mut self,
        destination: &Address,
        npdu: &[u8],
    ) -> Result<Vec<(IpPort, Vec<u8>)>, LinkError> {
        if !matches!(self.state, RegistrationState::Registered { .. }) {
            log::debug!("not registered with {}, dropping outbound", self.bbmd);
            return Ok(Vec::new());
        }
        match destination {
            Address::LocalStation(mac) => {
                let dest = station_ip(mac, destination)?;
                let frame = BvllMessage::OriginalUnicastNpdu {
                    npdu: npdu.to_vec(),
                }
                .to_frame()
                .map_err(|_| LinkError::FrameTooLarge)?;
                Ok(vec![(dest, frame)])
            }
            Address::LocalBroadcast => {
                let frame = BvllMessage::DistributeBroadcastToNetwork {
                    npdu: npdu.to_vec(),
                }
                .to_frame()
                .map_err(|_| LinkError::FrameTooLarge)?;
                Ok(vec![(self.bbmd, frame)])
            }
            other => Err(LinkError::BadDestination(*other)),
        }
    }

    pub fn inbound(&mut self, source: IpPort, frame: &[u8]) -> Result<Inbound, LinkError> {
        let msg = BvllMessage::decode(&mut Reader::new(frame))?;

        if let BvllMessage::Result { code } = msg {
            match self.state {
                RegistrationState::Unregistering => {}
                RegistrationState::Pending { .. } | RegistrationState::Registered { .. } => {
                    if source != self.bbmd {
                        log::debug!("result from {source} is not from our BBMD, dropped");
                    } else if code == 0 {
                        self.state = RegistrationState::Registered { ttl: self.ttl };
                        self.refresh_in = u32::from(self.ttl);
                    } else {
                        log::warn!("BBMD refused registration: 0x{code:04x}");
                        self.state = RegistrationState::Pending { error: Some(code) };
                    }
                }
                RegistrationState::Unregistered => {
                    log::debug!("unsolicited result from {source}, dropped");
                }
            }
            return Ok(Inbound::nothing());
        }

        if !matches!(self.state, RegistrationState::Registered { .. }) {
            log::debug!("not registered, dropping inbound from {source}");
            return Ok(Inbound::nothing());
        }

        Ok(match msg {
            BvllMessage::OriginalUnicastNpdu { npdu } => Inbound::deliver(Pdu::new(
                Address::LocalStation(Mac::from_ip(source)),
                Address::Null,
                npdu,
            )),
            BvllMessage::ForwardedNpdu { origin, npdu } => {
                if source != self.bbmd {
                    log::debug!("forwarded NPDU from {source} is not from our BBMD, dropped");
                    Inbound::nothing()
                } else {
                    Inbound::deliver(Pdu::new(
                        Address::LocalStation(Mac::from_ip(origin)),
                        Address::LocalBroadcast,
                        npdu,
                    ))
                }
            }
            other => {
                log::debug!("unexpected {:?} as a foreign device", other.function());
                Inbound::nothing()
            }
        })
    }

    /// One-second tick: re-register when the TTL window runs out.
    pub fn tick_second(&mut self) -> Vec<(IpPort, Vec<u8>)> {
        if !matches!(self.state, RegistrationState::Registered { .. }) {
            return Vec::new();
        }
        self.refresh_in = self.refresh_in.saturating_sub(1);
        if self.refresh_in > 0 {
            return Vec::new();
        }
        self.refresh_in = u32::from(self.ttl);
        match (BvllMessage::RegisterForeignDevice { ttl: self.ttl }).to_frame() {
            Ok(frame) => vec![(self.bbmd, frame)],
            Err(_) => Vec::new(),
        }
    }
}
