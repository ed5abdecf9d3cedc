//! The three BACnet/IP link roles.
//!
//! Each role is a sans-io state machine: `outbound` turns an NPDU and a
//! local destination into BVLL frames, `inbound` turns a received frame into
//! an optional upstream delivery plus reply frames, and `tick_second` drives
//! the role's timers. [`BipLink`] couples a role with a [`UdpEndpoint`].

/// Broadcast management device role.
pub mod bbmd;
/// Foreign device registered with a remote BBMD.
pub mod foreign;
/// Plain node on a subnet with no broadcast management.
pub mod simple;

pub use bbmd::Bbmd;
pub use foreign::{BipForeign, RegistrationState};
pub use simple::BipSimple;

use crate::udp::UdpEndpoint;
use crate::LinkError;
use bacip_core::address::{Address, IpPort};
use bacip_core::pdu::Pdu;

/// What a role wants done with one received frame.
#[derive(Debug, Default)]
pub struct Inbound {
    /// NPDU to hand up to the network layer.
    pub deliver: Option<Pdu>,
    /// Frames to transmit in response.
    pub sends: Vec<(IpPort, Vec<u8>)>,
}

impl Inbound {
    pub(crate) fn deliver(pdu: Pdu) -> Self {
        Self {
            deliver: Some(pdu),
            sends: Vec::new(),
        }
    }

    pub(crate) fn reply(dest: IpPort, frame: Vec<u8>) -> Self {
        Self {
            deliver: None,
            sends: vec![(dest, frame)],
        }
    }

    pub(crate) fn nothing() -> Self {
        Self::default()
    }
}

/// A link role of any flavor.
#[derive(Debug)]
pub enum BipRole {
    Simple(BipSimple),
    Foreign(BipForeign),
    Bbmd(Bbmd),
}

impl BipRole {
    pub fn outbound(
        &mut self,
        destination: &Address,
        npdu: &[u8],
    ) -> Result<Vec<(IpPort, Vec<u8>)>, LinkError> {
        match self {
            Self::Simple(role) => role.outbound(destination, npdu),
            Self::Foreign(role) => role.outbound(destination, npdu),
            Self::Bbmd(role) => role.outbound(destination, npdu),
        }
    }

    pub fn inbound(&mut self, source: IpPort, frame: &[u8]) -> Result<Inbound, LinkError> {
        match self {
            Self::Simple(role) => role.inbound(source, frame),
            Self::Foreign(role) => role.inbound(source, frame),
            Self::Bbmd(role) => role.inbound(source, frame),
        }
    }

    pub fn tick_second(&mut self) -> Vec<(IpPort, Vec<u8>)> {
        match self {
            Self::Simple(_) => Vec::new(),
            Self::Foreign(role) => role.tick_second(),
            Self::Bbmd(role) => {
                role.tick_second();
                Vec::new()
            }
        }
    }
}

/// A role bound to a socket.
#[derive(Debug)]
pub struct BipLink {
    endpoint: UdpEndpoint,
    role: BipRole,
}

impl BipLink {
    pub fn new(endpoint: UdpEndpoint, role: BipRole) -> Self {
        Self { endpoint, role }
    }

    pub fn local_addr(&self) -> IpPort {
        self.endpoint.local_addr()
    }

    pub fn role(&self) -> &BipRole {
        &self.role
    }

    pub fn role_mut(&mut self) -> &mut BipRole {
        &mut self.role
    }

    /// Put a pre-framed BVLL message on the wire, for traffic that does not
    /// carry an NPDU (registrations, table administration).
    pub async fn send_raw(&mut self, dest: IpPort, frame: &[u8]) {
        if let Err(err) = self.endpoint.send(dest, frame).await {
            log::warn!("send to {dest} failed: {err}");
        }
    }

    /// Frame an NPDU for `destination` and put it on the wire.
    pub async fn send_npdu(
        &mut self,
        destination: &Address,
        npdu: &[u8],
    ) -> Result<(), LinkError> {
        for (dest, frame) in self.role.outbound(destination, npdu)? {
            if let Err(err) = self.endpoint.send(dest, &frame).await {
                // Transport failures never bubble into transactions.
                log::warn!("send to {dest} failed: {err}");
            }
        }
        Ok(())
    }

    /// Wait for the next NPDU addressed to this node. Frames that only
    /// trigger replies (registrations, table reads) are handled inline.
    pub async fn recv_npdu(&mut self) -> Result<Pdu, LinkError> {
        let mut buf = [0u8; 1600];
        loop {
            let (n, src) = self.endpoint.recv(&mut buf).await?;
            let inbound = match self.role.inbound(src, &buf[..n]) {
                Ok(inbound) => inbound,
                Err(err) => {
                    log::warn!("dropping bad frame from {src}: {err}");
                    continue;
                }
            };
            for (dest, frame) in inbound.sends {
                if let Err(err) = self.endpoint.send(dest, &frame).await {
                    log::warn!("send to {dest} failed: {err}");
                }
            }
            if let Some(pdu) = inbound.deliver {
                return Ok(pdu);
            }
        }
    }

    /// One-second housekeeping: role timers plus peer eviction.
    pub async fn tick_second(&mut self) -> Result<(), LinkError> {
        for (dest, frame) in self.role.tick_second() {
            if let Err(err) = self.endpoint.send(dest, &frame).await {
                log::warn!("send to {dest} failed: {err}");
            }
        }
        self.endpoint.sweep_peers();
        Ok(())
    }
}
