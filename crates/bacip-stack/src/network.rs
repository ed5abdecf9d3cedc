//! Network service access point: adapter fan-out, the router table, and the
//! forwarding rules for routed NPDUs.

use crate::error::StackError;
use bacip_core::address::{Address, Mac};
use bacip_core::encoding::{reader::Reader, writer::Writer};
use bacip_core::npdu::{NetworkMessage, Npci};
use bacip_core::pdu::Pdu;
use std::collections::HashMap;

const MAX_NPDU_LEN: usize = 1600;

/// Identifies one directly connected network. Index 0 is always present.
pub type AdapterId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterStatus {
    Available,
    Busy,
    Disconnected,
    Unreachable,
}

/// The way to one remote network.
#[derive(Debug, Clone)]
pub struct RouterPath {
    pub adapter: AdapterId,
    pub router: Address,
    pub status: RouterStatus,
}

/// dnet → path, learned from I-Am-Router-To-Network.
#[derive(Debug, Default)]
pub struct RouterCache {
    networks: HashMap<u16, RouterPath>,
}

impl RouterCache {
    pub fn lookup(&self, dnet: u16) -> Option<&RouterPath> {
        self.networks.get(&dnet)
    }

    pub fn update(&mut self, adapter: AdapterId, router: Address, dnets: &[u16]) {
        for dnet in dnets {
            self.networks.insert(
                *dnet,
                RouterPath {
                    adapter,
                    router,
                    status: RouterStatus::Available,
                },
            );
        }
    }

    pub fn set_status(&mut self, adapter: AdapterId, router: &Address, status: RouterStatus) {
        for path in self.networks.values_mut() {
            if path.adapter == adapter && path.router == *router {
                path.status = status;
            }
        }
    }

    pub fn known_networks(&self) -> impl Iterator<Item = u16> + '_ {
        self.networks.keys().copied()
    }
}

/// What the network layer wants done after handling a PDU.
#[derive(Debug, PartialEq, Eq)]
pub enum NetAction {
    /// Hand this NPDU to the named adapter's link. `destination` is always
    /// a local station or the local broadcast.
    Send {
        adapter: AdapterId,
        destination: Address,
        npdu: Vec<u8>,
    },
    /// Hand this APDU up to the application layer.
    DeliverApdu { pdu: Pdu },
}

#[derive(Debug)]
struct Adapter {
    net: Option<u16>,
}

/// The routing brain. One adapter is the "local" one carrying the device's
/// own address; a stack with a single adapter never forwards.
#[derive(Debug)]
pub struct NetworkSap {
    adapters: Vec<Adapter>,
    local_adapter: AdapterId,
    local_address: Address,
    routers: RouterCache,
    pending: HashMap<u16, Vec<Vec<u8>>>,
}

impl NetworkSap {
    /// A single-adapter node (the common case).
    pub fn new(local_address: Address, net: Option<u16>) -> Self {
        Self {
            adapters: vec![Adapter { net }],
            local_adapter: 0,
            local_address,
            routers: RouterCache::default(),
            pending: HashMap::new(),
        }
    }

    /// Attach a further directly connected network, making this node a
    /// router. Returns the new adapter's id.
    pub fn add_adapter(&mut self, net: u16) -> AdapterId {
        self.adapters.push(Adapter { net: Some(net) });
        self.adapters.len() - 1
    }

    pub fn local_address(&self) -> &Address {
        &self.local_address
    }

    pub fn router_cache(&self) -> &RouterCache {
        &self.routers
    }

    fn adapter_for_net(&self, net: u16) -> Option<AdapterId> {
        self.adapters
            .iter()
            .position(|adapter| adapter.net == Some(net))
    }

    fn is_router(&self) -> bool {
        self.adapters.len() > 1
    }

    /// Take an application PDU downstream. `expecting_reply` sets the NPCI
    /// flag; the payload is a fully encoded APDU.
    pub fn outbound(&mut self, pdu: Pdu, expecting_reply: bool) -> Result<Vec<NetAction>, StackError> {
        match pdu.destination {
            Address::LocalStation(_) | Address::LocalBroadcast => {
                let npdu = encode_npdu(&Npci::application(expecting_reply), &pdu.data)?;
                Ok(vec![NetAction::Send {
                    adapter: self.local_adapter,
                    destination: pdu.destination,
                    npdu,
                }])
            }
            Address::GlobalBroadcast => {
                let npci = Npci::application(expecting_reply)
                    .with_destination(Address::GlobalBroadcast);
                let npdu = encode_npdu(&npci, &pdu.data)?;
                Ok(self
                    .adapters
                    .iter()
                    .enumerate()
                    .map(|(adapter, _)| NetAction::Send {
                        adapter,
                        destination: Address::LocalBroadcast,
                        npdu: npdu.clone(),
                    })
                    .collect())
            }
            Address::RemoteStation(dnet, _) | Address::RemoteBroadcast(dnet) => {
                // A directly connected network is addressed with local forms.
                if self.adapter_for_net(dnet).is_some() {
                    return Err(StackError::DirectlyConnected(pdu.destination));
                }
                let npci =
                    Npci::application(expecting_reply).with_destination(pdu.destination);
                let npdu = encode_npdu(&npci, &pdu.data)?;
                self.route_or_queue(dnet, npdu)
            }
            Address::Null => Err(StackError::BadDestination(pdu.destination)),
        }
    }

    fn route_or_queue(&mut self, dnet: u16, npdu: Vec<u8>) -> Result<Vec<NetAction>, StackError> {
        if let Some(path) = self.routers.lookup(dnet) {
            return Ok(vec![NetAction::Send {
                adapter: path.adapter,
                destination: path.router,
                npdu,
            }]);
        }

        // No route yet: park the NPDU and go looking. No timeout here; the
        // caller's transaction timer is the backstop.
        let first_for_net = !self.pending.contains_key(&dnet);
        self.pending.entry(dnet).or_default().push(npdu);
        if !first_for_net {
            return Ok(Vec::new());
        }

        let mut actions = Vec::new();
        let who_is = network_message_npdu(&NetworkMessage::WhoIsRouterToNetwork {
            network: Some(dnet),
        })?;
        for adapter in 0..self.adapters.len() {
            actions.push(NetAction::Send {
                adapter,
                destination: Address::LocalBroadcast,
                npdu: who_is.clone(),
            });
        }
        Ok(actions)
    }

    /// Take a PDU received on `adapter` upstream, forwarding or answering
    /// network-layer messages on the way.
    pub fn inbound(&mut self, adapter: AdapterId, pdu: Pdu) -> Vec<NetAction> {
        let mut r = Reader::new(&pdu.data);
        let npci = match Npci::decode(&mut r) {
            Ok(npci) => npci,
            Err(err) => {
                log::warn!("dropping NPDU from {}: {err}", pdu.source);
                return Vec::new();
            }
        };
        let payload = r.rest().to_vec();

        // Source routing: learn the path, unless someone claims to be on a
        // network we are directly connected to.
        if let Some(sadr) = &npci.source {
            if let Some(snet) = sadr.network() {
                if self.adapter_for_net(snet).is_some() {
                    log::warn!("spoofed source network {snet} from {}", pdu.source);
                    return Vec::new();
                }
                self.routers.update(adapter, pdu.source, &[snet]);
            }
        }

        let adapter_net = self.adapters[adapter].net;
        let local_net = self.adapters[self.local_adapter].net;

        let (process_locally, forward) = match &npci.destination {
            None => (
                self.local_adapter == adapter || npci.is_network_message(),
                false,
            ),
            Some(Address::RemoteBroadcast(dnet)) => {
                if adapter_net == Some(*dnet) {
                    log::warn!("remote-broadcast DADR names the receiving network {dnet}");
                    return Vec::new();
                }
                (local_net == Some(*dnet), true)
            }
            Some(Address::RemoteStation(dnet, mac)) => {
                if adapter_net == Some(*dnet) {
                    log::warn!("remote-station DADR names the receiving network {dnet}");
                    return Vec::new();
                }
                let ours = local_net == Some(*dnet)
                    && self.local_address.mac().is_some_and(|m| m == mac);
                (ours, !ours)
            }
            Some(Address::GlobalBroadcast) => (true, true),
            Some(other) => {
                log::warn!("invalid DADR {other}");
                return Vec::new();
            }
        };

        let mut actions = Vec::new();

        if process_locally {
            if npci.is_network_message() {
                self.process_network_message(adapter, &pdu, &npci, &payload, &mut actions);
            } else {
                actions.push(NetAction::DeliverApdu {
                    pdu: self.upstream_pdu(adapter, &pdu, &npci, payload.clone()),
                });
            }
        }

        if forward {
            self.forward(adapter, &pdu, &npci, &payload, &mut actions);
        }

        actions
    }

    /// Rebuild the logical source/destination a routed APDU should present
    /// to the application layer.
    fn upstream_pdu(&self, adapter: AdapterId, pdu: &Pdu, npci: &Npci, payload: Vec<u8>) -> Pdu {
        let source = match &npci.source {
            Some(sadr) => *sadr,
            None => {
                if self.is_router() && adapter != self.local_adapter {
                    synthesized_source(self.adapters[adapter].net, &pdu.source)
                } else {
                    pdu.source
                }
            }
        };
        let destination = match &npci.destination {
            Some(Address::GlobalBroadcast) => Address::GlobalBroadcast,
            Some(Address::RemoteBroadcast(_)) => Address::LocalBroadcast,
            Some(_) => self.local_address,
            None => pdu.destination,
        };
        Pdu::new(source, destination, payload)
    }

    fn process_network_message(
        &mut self,
        adapter: AdapterId,
        pdu: &Pdu,
        npci: &Npci,
        payload: &[u8],
        actions: &mut Vec<NetAction>,
    ) {
        let Some(message_type) = npci.message_type else {
            return;
        };
        let mut r = Reader::new(payload);
        let message = match NetworkMessage::decode(message_type, &mut r) {
            Ok(message) => message,
            Err(err) => {
                log::warn!("bad network message 0x{message_type:02x}: {err}");
                return;
            }
        };

        match message {
            NetworkMessage::IAmRouterToNetwork { networks } => {
                self.routers.update(adapter, pdu.source, &networks);
                for net in networks {
                    if let Some(queued) = self.pending.remove(&net) {
                        let path = self.routers.lookup(net).cloned();
                        if let Some(path) = path {
                            for npdu in queued {
                                actions.push(NetAction::Send {
                                    adapter: path.adapter,
                                    destination: path.router,
                                    npdu,
                                });
                            }
                        }
                    }
                }
            }
            NetworkMessage::WhoIsRouterToNetwork { network } => {
                self.answer_who_is_router(adapter, pdu, network, actions);
            }
            NetworkMessage::RouterBusyToNetwork { .. } => {
                self.routers
                    .set_status(adapter, &pdu.source, RouterStatus::Busy);
            }
            NetworkMessage::RouterAvailableToNetwork { .. } => {
                self.routers
                    .set_status(adapter, &pdu.source, RouterStatus::Available);
            }
            NetworkMessage::RejectMessageToNetwork { reason, network } => {
                log::warn!(
                    "router {} rejected a message for network {network}: reason {reason}",
                    pdu.source
                );
            }
            NetworkMessage::Other { message_type, .. } => {
                log::debug!("ignoring network message 0x{message_type:02x}");
            }
        }
    }

    fn answer_who_is_router(
        &mut self,
        adapter: AdapterId,
        pdu: &Pdu,
        network: Option<u16>,
        actions: &mut Vec<NetAction>,
    ) {
        if !self.is_router() {
            return;
        }

        let reachable: Vec<u16> = match network {
            Some(dnet) => {
                let direct = self
                    .adapter_for_net(dnet)
                    .is_some_and(|via| via != adapter);
                let routed = self
                    .routers
                    .lookup(dnet)
                    .is_some_and(|path| path.adapter != adapter);
                if direct || routed {
                    vec![dnet]
                } else {
                    Vec::new()
                }
            }
            None => {
                let mut nets: Vec<u16> = self
                    .adapters
                    .iter()
                    .enumerate()
                    .filter(|(id, a)| *id != adapter && a.net.is_some())
                    .filter_map(|(_, a)| a.net)
                    .collect();
                nets.extend(
                    self.routers
                        .networks
                        .iter()
                        .filter(|(_, path)| path.adapter != adapter)
                        .map(|(net, _)| *net),
                );
                nets.sort_unstable();
                nets.dedup();
                nets
            }
        };

        if reachable.is_empty() {
            return;
        }
        match network_message_npdu(&NetworkMessage::IAmRouterToNetwork {
            networks: reachable,
        }) {
            Ok(npdu) => actions.push(NetAction::Send {
                adapter,
                destination: pdu.source,
                npdu,
            }),
            Err(err) => log::warn!("could not encode I-Am-Router: {err}"),
        }
    }

    fn forward(
        &mut self,
        adapter: AdapterId,
        pdu: &Pdu,
        npci: &Npci,
        payload: &[u8],
        actions: &mut Vec<NetAction>,
    ) {
        if !self.is_router() {
            return;
        }
        let hop_count = npci.hop_count.unwrap_or(0);
        if hop_count == 0 {
            log::debug!("hop count exhausted, dropping");
            return;
        }

        let mut forwarded = npci.clone();
        forwarded.hop_count = Some(hop_count - 1);
        if forwarded.source.is_none() {
            forwarded.source = Some(synthesized_source(self.adapters[adapter].net, &pdu.source));
        }

        match npci.destination {
            Some(Address::GlobalBroadcast) => {
                for (other, _) in self.adapters.iter().enumerate() {
                    if other == adapter {
                        continue;
                    }
                    match encode_npdu(&forwarded, payload) {
                        Ok(npdu) => actions.push(NetAction::Send {
                            adapter: other,
                            destination: Address::LocalBroadcast,
                            npdu,
                        }),
                        Err(err) => log::warn!("forward encode failed: {err}"),
                    }
                }
            }
            Some(Address::RemoteStation(dnet, mac)) => {
                self.forward_to_net(adapter, dnet, Some(mac), forwarded, payload, actions);
            }
            Some(Address::RemoteBroadcast(dnet)) => {
                self.forward_to_net(adapter, dnet, None, forwarded, payload, actions);
            }
            _ => {}
        }
    }

    fn forward_to_net(
        &mut self,
        arrival: AdapterId,
        dnet: u16,
        station: Option<Mac>,
        mut forwarded: Npci,
        payload: &[u8],
        actions: &mut Vec<NetAction>,
    ) {
        // Last leg: the destination network hangs off one of our adapters.
        if let Some(out) = self.adapter_for_net(dnet) {
            if out == arrival {
                log::warn!("forwarding loop toward network {dnet}");
                return;
            }
            forwarded.destination = None;
            forwarded.hop_count = None;
            let destination = match station {
                Some(mac) => Address::LocalStation(mac),
                None => Address::LocalBroadcast,
            };
            match encode_npdu(&forwarded, payload) {
                Ok(npdu) => actions.push(NetAction::Send {
                    adapter: out,
                    destination,
                    npdu,
                }),
                Err(err) => log::warn!("forward encode failed: {err}"),
            }
            return;
        }

        // Another router knows the way.
        if let Some(path) = self.routers.lookup(dnet).cloned() {
            if self.adapters.get(path.adapter).is_none() {
                return;
            }
            match encode_npdu(&forwarded, payload) {
                Ok(npdu) => actions.push(NetAction::Send {
                    adapter: path.adapter,
                    destination: path.router,
                    npdu,
                }),
                Err(err) => log::warn!("forward encode failed: {err}"),
            }
            return;
        }

        // Unknown network: ask around, drop the PDU. The originator's
        // retries cover the gap once a path is learned.
        log::debug!("no route toward network {dnet}, soliciting routers");
        let who_is = match network_message_npdu(&NetworkMessage::WhoIsRouterToNetwork {
            network: Some(dnet),
        }) {
            Ok(npdu) => npdu,
            Err(err) => {
                log::warn!("could not encode Who-Is-Router: {err}");
                return;
            }
        };
        for (other, _) in self.adapters.iter().enumerate() {
            if other == arrival {
                continue;
            }
            actions.push(NetAction::Send {
                adapter: other,
                destination: Address::LocalBroadcast,
                npdu: who_is.clone(),
            });
        }
    }
}

fn synthesized_source(net: Option<u16>, source: &Address) -> Address {
    match (net, source.mac()) {
        (Some(net), Some(mac)) => Address::RemoteStation(net, *mac),
        _ => *source,
    }
}

fn encode_npdu(npci: &Npci, payload: &[u8]) -> Result<Vec<u8>, StackError> {
    let mut buf = vec![0u8; MAX_NPDU_LEN.min(32 + payload.len())];
    let mut w = Writer::new(&mut buf);
    npci.encode(&mut w)?;
    w.write_all(payload)?;
    let written = w.position();
    buf.truncate(written);
    Ok(buf)
}

fn network_message_npdu(message: &NetworkMessage) -> Result<Vec<u8>, StackError> {
    let npci = Npci::network_message(message.message_type());
    let mut buf = [0u8; 64];
    let mut w = Writer::new(&mut buf);
    npci.encode(&mut w)?;
    message.encode(&mut w)?;
    Ok(w.as_written().to_vec())
}
