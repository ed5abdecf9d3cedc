use crate::bip::simple::station_ip;
use crate::bip::Inbound;
use crate::LinkError;
use bacip_core::address::{Address, IpPort, Mac};
use bacip_core::bvll::{BdtEntry, BvllMessage, FdtEntry, RESULT_DELETE_FDT_NAK, RESULT_WRITE_BDT_NAK};
use bacip_core::encoding::reader::Reader;
use bacip_core::pdu::Pdu;

/// Extra seconds of grace on top of a registration TTL.
const FDT_GRACE_SECONDS: u32 = 5;

#[derive(Debug, Clone)]
struct FdtSlot {
    address: IpPort,
    ttl: u16,
    remaining: u32,
}

/// A broadcast management device: re-distributes subnet broadcasts to the
/// peers in its Broadcast-Distribution-Table and to registered foreign
/// devices.
#[derive(Debug)]
pub struct Bbmd {
    own: IpPort,
    broadcast: IpPort,
    bdt: Vec<BdtEntry>,
    fdt: Vec<FdtSlot>,
}

impl Bbmd {
    /// `own` is this BBMD's address as it appears in peers' tables;
    /// `broadcast` is the local subnet broadcast endpoint.
    pub fn new(own: IpPort, broadcast: IpPort) -> Self {
        Self {
            own,
            broadcast,
            bdt: Vec::new(),
            fdt: Vec::new(),
        }
    }

    /// Add a distribution peer. The entry for this BBMD itself always sits
    /// first in the table.
    pub fn add_peer(&mut self, entry: BdtEntry) {
        if self.bdt.iter().any(|e| e.address == entry.address) {
            return;
        }
        if entry.address == self.own {
            self.bdt.insert(0, entry);
        } else {
            self.bdt.push(entry);
        }
    }

    pub fn delete_peer(&mut self, address: IpPort) {
        self.bdt.retain(|e| e.address != address);
    }

    pub fn bdt(&self) -> &[BdtEntry] {
        &self.bdt
    }

    pub fn fdt(&self) -> Vec<FdtEntry> {
        self.fdt
            .iter()
            .map(|slot| FdtEntry {
                address: slot.address,
                ttl: slot.ttl,
                remaining: slot.remaining.min(u32::from(u16::MAX)) as u16,
            })
            .collect()
    }

    fn register_foreign_device(&mut self, address: IpPort, ttl: u16) {
        let remaining = u32::from(ttl) + FDT_GRACE_SECONDS;
        if let Some(slot) = self.fdt.iter_mut().find(|slot| slot.address == address) {
            slot.ttl = ttl;
            slot.remaining = remaining;
        } else {
            self.fdt.push(FdtSlot {
                address,
                ttl,
                remaining,
            });
        }
    }

    /// Forwarded-NPDU copies for every BDT peer other than ourselves.
    fn peer_sends(&self, forwarded: &BvllMessage, sends: &mut Vec<(IpPort, Vec<u8>)>) {
        let Ok(frame) = forwarded.to_frame() else {
            return;
        };
        for entry in &self.bdt {
            if entry.address != self.own {
                sends.push((entry.forward_to(), frame.clone()));
            }
        }
    }

    /// Forwarded-NPDU copies for registered foreign devices, minus `except`.
    fn foreign_sends(
        &self,
        forwarded: &BvllMessage,
        except: Option<IpPort>,
        sends: &mut Vec<(IpPort, Vec<u8>)>,
    ) {
        let Ok(frame) = forwarded.to_frame() else {
            return;
        };
        for slot in &self.fdt {
            if Some(slot.address) != except {
                sends.push((slot.address, frame.clone()));
            }
        }
    }

    /// Whether our own entry leads the BDT, meaning forwarded traffic is
    /// re-broadcast on the local subnet.
    fn rebroadcasts_locally(&self) -> bool {
        self.bdt.first().is_some_and(|e| e.address == self.own)
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
                let mut sends = Vec::new();
                let frame = BvllMessage::OriginalBroadcastNpdu {
                    npdu: npdu.to_vec(),
                }
                .to_frame()
                .map_err(|_| LinkError::FrameTooLarge)?;
                sends.push((self.broadcast, frame));

                let forwarded = BvllMessage::ForwardedNpdu {
                    origin: self.own,
                    npdu: npdu.to_vec(),
                };
                self.peer_sends(&forwarded, &mut sends);
                self.foreign_sends(&forwarded, None, &mut sends);
                Ok(sends)
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
            BvllMessage::OriginalBroadcastNpdu { npdu } => {
                let mut inbound = Inbound::deliver(Pdu::new(
                    Address::LocalStation(Mac::from_ip(source)),
                    Address::LocalBroadcast,
                    npdu.clone(),
                ));
                let forwarded = BvllMessage::ForwardedNpdu {
                    origin: source,
                    npdu,
                };
                self.peer_sends(&forwarded, &mut inbound.sends);
                self.foreign_sends(&forwarded, None, &mut inbound.sends);
                inbound
            }
            BvllMessage::ForwardedNpdu { origin, npdu } => {
                let mut inbound = Inbound::deliver(Pdu::new(
                    Address::LocalStation(Mac::from_ip(origin)),
                    Address::LocalBroadcast,
                    npdu.clone(),
                ));
                let forwarded = BvllMessage::ForwardedNpdu { origin, npdu };
                if self.rebroadcasts_locally() {
                    if let Ok(frame) = forwarded.to_frame() {
                        inbound.sends.push((self.broadcast, frame));
                    }
                }
                self.foreign_sends(&forwarded, None, &mut inbound.sends);
                inbound
            }
            BvllMessage::DistributeBroadcastToNetwork { npdu } => {
                let mut inbound = Inbound::deliver(Pdu::new(
                    Address::LocalStation(Mac::from_ip(source)),
                    Address::LocalBroadcast,
                    npdu.clone(),
                ));
                let forwarded = BvllMessage::ForwardedNpdu {
                    origin: source,
                    npdu,
                };
                if let Ok(frame) = forwarded.to_frame() {
                    for entry in &self.bdt {
                        if entry.address == self.own {
                            inbound.sends.push((self.broadcast, frame.clone()));
                        } else {
                            inbound.sends.push((entry.forward_to(), frame.clone()));
                        }
                    }
                }
                self.foreign_sends(&forwarded, Some(source), &mut inbound.sends);
                inbound
            }
            BvllMessage::RegisterForeignDevice { ttl } => {
                self.register_foreign_device(source, ttl);
                result_reply(source, 0)
            }
            BvllMessage::ReadBdt => reply(
                source,
                BvllMessage::ReadBdtAck {
                    entries: self.bdt.clone(),
                },
            ),
            BvllMessage::WriteBdt { .. } => {
                // Table management stays with the local operator.
                result_reply(source, RESULT_WRITE_BDT_NAK)
            }
            BvllMessage::ReadFdt => reply(
                source,
                BvllMessage::ReadFdtAck {
                    entries: self.fdt(),
                },
            ),
            BvllMessage::DeleteFdtEntry { address } => {
                let before = self.fdt.len();
                self.fdt.retain(|slot| slot.address != address);
                if self.fdt.len() < before {
                    result_reply(source, 0)
                } else {
                    result_reply(source, RESULT_DELETE_FDT_NAK)
                }
            }
            BvllMessage::Result { code } => {
                if code != 0 {
                    log::warn!("BVLC result 0x{code:04x} from {source}");
                }
                Inbound::nothing()
            }
            BvllMessage::ReadBdtAck { .. } | BvllMessage::ReadFdtAck { .. } => {
                log::debug!("ignoring table ack from {source}");
                Inbound::nothing()
            }
        })
    }

    /// One-second tick: age out foreign devices whose TTL (plus grace) has
    /// lapsed.
    pub fn tick_second(&mut self) {
        self.fdt.retain_mut(|slot| {
            slot.remaining = slot.remaining.saturating_sub(1);
            if slot.remaining == 0 {
                log::debug!("foreign device {} expired", slot.address);
                false
            } else {
                true
            }
        });
    }
}

fn reply(dest: IpPort, msg: BvllMessage) -> Inbound {
    match msg.to_frame() {
        Ok(frame) => Inbound::reply(dest, frame),
        Err(_) => Inbound::nothing(),
    }
}

fn result_reply(dest: IpPort, code: u16) -> Inbound {
    reply(dest, BvllMessage::Result { code })
}

#[cfg(test)]
mod tests {
    use super::Bbmd;
    use bacip_core::address::{Address, IpPort};
    use bacip_core::bvll::{BdtEntry, BvllMessage};
    use bacip_core::encoding::reader::Reader;

    fn ip(last: u8) -> IpPort {
        IpPort::new([10, 0, 0, last], 47808)
    }

    fn full_mask(address: IpPort) -> BdtEntry {
        BdtEntry {
            address,
            mask: [255, 255, 255, 255],
        }
    }

    fn register(bbmd: &mut Bbmd, addr: IpPort, ttl: u16) {
        let frame = BvllMessage::RegisterForeignDevice { ttl }
            .to_frame()
            .unwrap();
        let inbound = bbmd.inbound(addr, &frame).unwrap();
        let reply = BvllMessage::decode(&mut Reader::new(&inbound.sends[0].1)).unwrap();
        assert_eq!(reply, BvllMessage::Result { code: 0 });
    }

    #[test]
    fn own_entry_is_kept_first() {
        let mut bbmd = Bbmd::new(ip(1), IpPort::new([10, 0, 0, 255], 47808));
        bbmd.add_peer(full_mask(ip(2)));
        bbmd.add_peer(full_mask(ip(1)));
        bbmd.add_peer(full_mask(ip(3)));
        assert_eq!(bbmd.bdt()[0].address, ip(1));
    }

    #[test]
    fn broadcast_fans_out_once_per_peer_and_foreign_device() {
        let mut bbmd = Bbmd::new(ip(1), IpPort::new([10, 0, 0, 255], 47808));
        bbmd.add_peer(full_mask(ip(1)));
        bbmd.add_peer(full_mask(ip(2)));
        bbmd.add_peer(full_mask(ip(3)));
        register(&mut bbmd, ip(100), 60);
        register(&mut bbmd, ip(101), 60);

        let frame = BvllMessage::OriginalBroadcastNpdu {
            npdu: vec![0x01, 0x00, 0x10, 0x08],
        }
        .to_frame()
        .unwrap();
        let inbound = bbmd.inbound(ip(50), &frame).unwrap();

        // Delivered locally exactly once.
        let pdu = inbound.deliver.unwrap();
        assert_eq!(pdu.destination, Address::LocalBroadcast);

        // One forwarded copy each to B, C, F1, F2.
        let mut dests: Vec<IpPort> = inbound.sends.iter().map(|(d, _)| *d).collect();
        dests.sort();
        assert_eq!(dests, vec![ip(2), ip(3), ip(100), ip(101)]);
        for (_, frame) in &inbound.sends {
            let msg = BvllMessage::decode(&mut Reader::new(frame)).unwrap();
            assert!(matches!(msg, BvllMessage::ForwardedNpdu { origin, .. } if origin == ip(50)));
        }
    }

    #[test]
    fn distribute_skips_the_originating_foreign_device() {
        let mut bbmd = Bbmd::new(ip(1), IpPort::new([10, 0, 0, 255], 47808));
        bbmd.add_peer(full_mask(ip(1)));
        register(&mut bbmd, ip(100), 60);
        register(&mut bbmd, ip(101), 60);

        let frame = BvllMessage::DistributeBroadcastToNetwork {
            npdu: vec![0x01, 0x00],
        }
        .to_frame()
        .unwrap();
        let inbound = bbmd.inbound(ip(100), &frame).unwrap();
        assert!(inbound.deliver.is_some());

        let dests: Vec<IpPort> = inbound.sends.iter().map(|(d, _)| *d).collect();
        // Own BDT entry becomes a local broadcast; F1 is skipped, F2 gets a copy.
        assert!(dests.contains(&IpPort::new([10, 0, 0, 255], 47808)));
        assert!(dests.contains(&ip(101)));
        assert!(!dests.contains(&ip(100)));
    }

    #[test]
    fn fdt_expires_after_ttl_plus_grace() {
        let mut bbmd = Bbmd::new(ip(1), IpPort::new([10, 0, 0, 255], 47808));
        register(&mut bbmd, ip(100), 10);
        assert_eq!(bbmd.fdt()[0].remaining, 15);

        for _ in 0..14 {
            bbmd.tick_second();
        }
        assert_eq!(bbmd.fdt().len(), 1);
        bbmd.tick_second();
        assert!(bbmd.fdt().is_empty());
    }

    #[test]
    fn reregistration_extends_the_deadline() {
        let mut bbmd = Bbmd::new(ip(1), IpPort::new([10, 0, 0, 255], 47808));
        register(&mut bbmd, ip(100), 10);
        for _ in 0..7 {
            bbmd.tick_second();
        }
        assert_eq!(bbmd.fdt()[0].remaining, 8);

        register(&mut bbmd, ip(100), 10);
        assert_eq!(bbmd.fdt()[0].remaining, 15);
        assert_eq!(bbmd.fdt().len(), 1);
    }

    #[test]
    fn delete_fdt_entry_reports_unknown_addresses() {
        let mut bbmd = Bbmd::new(ip(1), IpPort::new([10, 0, 0, 255], 47808));
        register(&mut bbmd, ip(100), 10);

        let frame = BvllMessage::DeleteFdtEntry { address: ip(100) }
            .to_frame()
            .unwrap();
        let inbound = bbmd.inbound(ip(9), &frame).unwrap();
        let reply = BvllMessage::decode(&mut Reader::new(&inbound.sends[0].1)).unwrap();
        assert_eq!(reply, BvllMessage::Result { code: 0 });

        let inbound = bbmd.inbound(ip(9), &frame).unwrap();
        let reply = BvllMessage::decode(&mut Reader::new(&inbound.sends[0].1)).unwrap();
        assert_eq!(
            reply,
            BvllMessage::Result {
                code: bacip_core::bvll::RESULT_DELETE_FDT_NAK
            }
        );
    }

    #[test]
    fn forwarded_rebroadcasts_only_with_own_entry_first() {
        let broadcast = IpPort::new([10, 0, 0, 255], 47808);
        let frame = BvllMessage::ForwardedNpdu {
            origin: ip(77),
            npdu: vec![0x01, 0x00],
        }
        .to_frame()
        .unwrap();

        let mut without_self = Bbmd::new(ip(1), broadcast);
        without_self.add_peer(full_mask(ip(2)));
        let inbound = without_self.inbound(ip(2), &frame).unwrap();
        assert!(inbound.sends.is_empty());

        let mut with_self = Bbmd::new(ip(1), broadcast);
        with_self.add_peer(full_mask(ip(1)));
        with_self.add_peer(full_mask(ip(2)));
        let inbound = with_self.inbound(ip(2), &frame).unwrap();
        assert_eq!(inbound.sends.len(), 1);
        assert_eq!(inbound.sends[0].0, broadcast);
    }
}
