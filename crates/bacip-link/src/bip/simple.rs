use crate::bip::Inbound;
use crate::LinkError;
use bacip_core::address::{Address, IpPort, Mac};
use bacip_core::bvll::{
    BvllMessage, RESULT_DELETE_FDT_NAK, RESULT_DISTRIBUTE_NAK, RESULT_READ_BDT_NAK,
    RESULT_READ_FDT_NAK, RESULT_REGISTER_NAK, RESULT_WRITE_BDT_NAK,
};
use bacip_core::encoding::reader::Reader;
use bacip_core::pdu::Pdu;

/// A node that neither manages nor needs broadcast distribution: unicasts go
/// out as Original-Unicast-NPDU, local broadcasts as Original-Broadcast-NPDU,
/// and BBMD administration gets a NAK.
#[derive(Debug)]
pub struct BipSimple {
    broadcast: IpPort,
}

impl BipSimple {
    /// `broadcast` is the subnet broadcast endpoint, normally
    /// 255.255.255.255 on the local port.
    pub fn new(broadcast: IpPort) -> Self {
        Self { broadcast }
    }

    pub fn outbound(
        &mut self,
        destination: &Address,
        npdu: &[u8],
    ) -> Result<Vec<(IpPort, Vec<u8>)>, LinkError> {
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
                let frame = BvllMessage::OriginalBroadcastNpdu {
                    npdu: npdu.to_vec(),
                }
                .to_frame()
                .map_err(|_| LinkError::FrameTooLarge)?;
                Ok(vec![(self.broadcast, frame)])
            }
            other => Err(LinkError::BadDestination(*other)),
        }
    }

    pub fn inbound(&mut self, source: IpPort, frame: &[u8]) -> Result<Inbound, LinkError> {
        let msg = BvllMessage::decode(&mut Reader::new(frame))?;
        Ok(match msg {
            BvllMessage::OriginalUnicastNpdu { npdu } => Inbound::deliver(Pdu::new(
                Address::LocalStation(Mac::from_ip(source)),
                Address::Null,
                npdu,
            )),
            BvllMessage::OriginalBroadcastNpdu { npdu } => Inbound::deliver(Pdu::new(
                Address::LocalStation(Mac::from_ip(source)),
                Address::LocalBroadcast,
                npdu,
            )),
            BvllMessage::ForwardedNpdu { origin, npdu } => Inbound::deliver(Pdu::new(
                Address::LocalStation(Mac::from_ip(origin)),
                Address::LocalBroadcast,
                npdu,
            )),
            BvllMessage::Result { code } => {
                if code != 0 {
                    log::warn!("unexpected BVLC result 0x{code:04x} from {source}");
                }
                Inbound::nothing()
            }
            // Not a BBMD; refuse the administrative functions.
            BvllMessage::WriteBdt { .. } => nak(source, RESULT_WRITE_BDT_NAK),
            BvllMessage::ReadBdt => nak(source, RESULT_READ_BDT_NAK),
            BvllMessage::RegisterForeignDevice { .. } => nak(source, RESULT_REGISTER_NAK),
            BvllMessage::ReadFdt => nak(source, RESULT_READ_FDT_NAK),
            BvllMessage::DeleteFdtEntry { .. } => nak(source, RESULT_DELETE_FDT_NAK),
            BvllMessage::DistributeBroadcastToNetwork { .. } => {
                nak(source, RESULT_DISTRIBUTE_NAK)
            }
            BvllMessage::ReadBdtAck { .. } | BvllMessage::ReadFdtAck { .. } => {
                log::debug!("ignoring table ack from {source}");
                Inbound::nothing()
            }
        })
    }
}

fn nak(source: IpPort, code: u16) -> Inbound {
    match (BvllMessage::Result { code }).to_frame() {
        Ok(frame) => Inbound::reply(source, frame),
        Err(_) => Inbound::nothing(),
    }
}

pub(crate) fn station_ip(mac: &Mac, full: &Address) -> Result<IpPort, LinkError> {
    mac.to_ip().ok_or(LinkError::BadDestination(*full))
}
