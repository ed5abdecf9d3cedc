//! Transaction registry: owns every live segmentation state machine, hands
//! inbound APDUs to the right one, and allocates invoke ids.

use crate::device::DeviceInfoCache;
use crate::error::StackError;
use crate::ssm::{ClientSsm, ServerSsm, SsmAction, SsmHandle, SsmPolicy};
use bacip_core::address::Address;
use bacip_core::apdu::{AbortReason, Apdu};
use std::time::Duration;

/// What the registry wants the stack to do after absorbing an event.
#[derive(Debug)]
pub enum TsmAction {
    /// Encode and transmit toward a peer.
    SendApdu { destination: Address, apdu: Apdu },
    /// Final outcome of a client transaction.
    ClientResult {
        peer: Address,
        invoke_id: u8,
        apdu: Apdu,
    },
    /// A (reassembled) confirmed request ready for the dispatcher.
    ServerRequest {
        peer: Address,
        invoke_id: u8,
        apdu: Apdu,
    },
    /// A server transaction died before the dispatcher answered.
    ServerAbort {
        peer: Address,
        invoke_id: u8,
        reason: u8,
    },
    /// An unconfirmed request; no transaction state involved.
    DeliverUnconfirmed {
        peer: Address,
        service_choice: u8,
        data: Vec<u8>,
    },
    /// (Re)arm the handle's timer.
    Schedule { handle: SsmHandle, delay: Duration },
    /// Disarm the handle's timer.
    Cancel { handle: SsmHandle },
}

#[derive(Debug)]
pub struct TransactionSap {
    policy: SsmPolicy,
    cache: DeviceInfoCache,
    next_invoke_id: u8,
    next_handle: SsmHandle,
    clients: Vec<ClientSsm>,
    servers: Vec<ServerSsm>,
}

impl TransactionSap {
    pub fn new(policy: SsmPolicy) -> Self {
        Self {
            policy,
            cache: DeviceInfoCache::new(),
            next_invoke_id: 1,
            next_handle: 1,
            clients: Vec::new(),
            servers: Vec::new(),
        }
    }

    pub fn device_cache(&self) -> &DeviceInfoCache {
        &self.cache
    }

    pub fn device_cache_mut(&mut self) -> &mut DeviceInfoCache {
        &mut self.cache
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    fn alloc_handle(&mut self) -> SsmHandle {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    /// An unused invoke id for `peer`, or an error when all 256 are taken.
    fn next_invoke_id(&mut self, peer: &Address) -> Result<u8, StackError> {
        for _ in 0..=255 {
            let candidate = self.next_invoke_id;
            self.next_invoke_id = self.next_invoke_id.wrapping_add(1);
            let in_use = self
                .clients
                .iter()
                .any(|t| t.core.invoke_id == candidate && t.core.peer == *peer);
            if !in_use {
                return Ok(candidate);
            }
        }
        Err(StackError::InvokeIdExhausted(*peer))
    }

    /// Start a confirmed request toward `destination`.
    pub fn submit_request(
        &mut self,
        destination: Address,
        service_choice: u8,
        data: Vec<u8>,
        invoke_id: Option<u8>,
    ) -> Result<(u8, Vec<TsmAction>), StackError> {
        if !destination.is_station() {
            return Err(StackError::BadDestination(destination));
        }
        let invoke_id = match invoke_id {
            Some(id) => {
                let in_use = self
                    .clients
                    .iter()
                    .any(|t| t.core.invoke_id == id && t.core.peer == destination);
                if in_use {
                    return Err(StackError::InvokeIdInUse(destination, id));
                }
                id
            }
            None => self.next_invoke_id(&destination)?,
        };

        let peer_info = self.cache.acquire(destination);
        let handle = self.alloc_handle();
        let mut ssm = ClientSsm::new(handle, destination, peer_info, invoke_id, self.policy.clone());

        let mut raw = Vec::new();
        ssm.start(service_choice, data, &mut raw);
        self.clients.push(ssm);

        let mut actions = Vec::new();
        self.finish_client(self.clients.len() - 1, raw, &mut actions);
        Ok((invoke_id, actions))
    }

    /// An APDU arrived from `peer`; route it to the owning transaction.
    pub fn handle_apdu(&mut self, peer: Address, apdu: Apdu) -> Vec<TsmAction> {
        let mut actions = Vec::new();
        match &apdu {
            Apdu::UnconfirmedRequest {
                service_choice,
                data,
            } => {
                actions.push(TsmAction::DeliverUnconfirmed {
                    peer,
                    service_choice: *service_choice,
                    data: data.clone(),
                });
            }
            Apdu::ConfirmedRequest { header, .. } => {
                // A retry of a live transaction goes to its machine; anything
                // else starts a fresh server transaction.
                let invoke_id = header.invoke_id;
                let idx = match self.find_server(&peer, invoke_id) {
                    Some(idx) => idx,
                    None => {
                        if header.segmented_response_accepted {
                            self.cache.note_segmented_response_accepted(peer);
                        }
                        let peer_info = self.cache.acquire(peer);
                        let handle = self.alloc_handle();
                        self.servers.push(ServerSsm::new(
                            handle,
                            peer,
                            peer_info,
                            self.policy.clone(),
                        ));
                        self.servers.len() - 1
                    }
                };
                let mut raw = Vec::new();
                self.servers[idx].indication(&apdu, &mut raw);
                self.finish_server(idx, raw, &mut actions);
            }
            Apdu::SimpleAck(_) | Apdu::ComplexAck { .. } | Apdu::Error(_) | Apdu::Reject(_) => {
                let invoke_id = apdu.invoke_id().unwrap_or_default();
                match self.find_client(&peer, invoke_id) {
                    Some(idx) => {
                        let mut raw = Vec::new();
                        self.clients[idx].confirmation(&apdu, &mut raw);
                        self.finish_client(idx, raw, &mut actions);
                    }
                    None => log::debug!(
                        "no client transaction for {:?} invoke {invoke_id} from {peer}",
                        apdu.apdu_type()
                    ),
                }
            }
            Apdu::SegmentAck(_) | Apdu::Abort(_) => {
                let invoke_id = apdu.invoke_id().unwrap_or_default();
                if apdu.from_server() {
                    match self.find_client(&peer, invoke_id) {
                        Some(idx) => {
                            let mut raw = Vec::new();
                            self.clients[idx].confirmation(&apdu, &mut raw);
                            self.finish_client(idx, raw, &mut actions);
                        }
                        None => log::debug!("stray server-side {:?}", apdu.apdu_type()),
                    }
                } else {
                    match self.find_server(&peer, invoke_id) {
                        Some(idx) => {
                            let mut raw = Vec::new();
                            self.servers[idx].indication(&apdu, &mut raw);
                            self.finish_server(idx, raw, &mut actions);
                        }
                        None => log::debug!("stray client-side {:?}", apdu.apdu_type()),
                    }
                }
            }
        }
        actions
    }

    /// The application's answer to a server transaction.
    pub fn handle_response(&mut self, peer: Address, apdu: Apdu) -> Vec<TsmAction> {
        let mut actions = Vec::new();
        let invoke_id = apdu.invoke_id().unwrap_or_default();
        match self.find_server(&peer, invoke_id) {
            Some(idx) => {
                let mut raw = Vec::new();
                self.servers[idx].confirmation(apdu, &mut raw);
                self.finish_server(idx, raw, &mut actions);
            }
            None => log::debug!("response for unknown transaction {peer} invoke {invoke_id}"),
        }
        actions
    }

    /// A transaction timer fired.
    pub fn handle_timeout(&mut self, handle: SsmHandle) -> Vec<TsmAction> {
        let mut actions = Vec::new();
        if let Some(idx) = self.clients.iter().position(|t| t.core.handle == handle) {
            let mut raw = Vec::new();
            self.clients[idx].handle_timeout(&mut raw);
            self.finish_client(idx, raw, &mut actions);
        } else if let Some(idx) = self.servers.iter().position(|t| t.core.handle == handle) {
            let mut raw = Vec::new();
            self.servers[idx].handle_timeout(&mut raw);
            self.finish_server(idx, raw, &mut actions);
        }
        actions
    }

    /// Tear everything down with synthetic aborts, for shutdown.
    pub fn shutdown(&mut self) -> Vec<TsmAction> {
        let mut actions = Vec::new();
        for mut ssm in std::mem::take(&mut self.clients) {
            let abort = ssm.core.make_abort(false, AbortReason::Other);
            actions.push(TsmAction::SendApdu {
                destination: ssm.core.peer,
                apdu: abort.clone(),
            });
            actions.push(TsmAction::ClientResult {
                peer: ssm.core.peer,
                invoke_id: ssm.core.invoke_id,
                apdu: abort,
            });
            actions.push(TsmAction::Cancel {
                handle: ssm.core.handle,
            });
            self.cache.release(&ssm.core.peer);
        }
        for mut ssm in std::mem::take(&mut self.servers) {
            let abort = ssm.core.make_abort(true, AbortReason::Other);
            actions.push(TsmAction::SendApdu {
                destination: ssm.core.peer,
                apdu: abort,
            });
            actions.push(TsmAction::Cancel {
                handle: ssm.core.handle,
            });
            self.cache.release(&ssm.core.peer);
        }
        actions
    }

    fn find_client(&self, peer: &Address, invoke_id: u8) -> Option<usize> {
        self.clients
            .iter()
            .position(|t| t.core.invoke_id == invoke_id && t.core.peer == *peer)
    }

    fn find_server(&self, peer: &Address, invoke_id: u8) -> Option<usize> {
        self.servers
            .iter()
            .position(|t| t.core.invoke_id == invoke_id && t.core.peer == *peer)
    }

    fn finish_client(&mut self, idx: usize, raw: Vec<SsmAction>, out: &mut Vec<TsmAction>) {
        let (peer, invoke_id, handle) = {
            let core = &self.clients[idx].core;
            (core.peer, core.invoke_id, core.handle)
        };
        for action in raw {
            match action {
                SsmAction::SendApdu(apdu) => out.push(TsmAction::SendApdu {
                    destination: peer,
                    apdu,
                }),
                SsmAction::Deliver(apdu) => out.push(TsmAction::ClientResult {
                    peer,
                    invoke_id,
                    apdu,
                }),
                SsmAction::StartTimer(delay) => out.push(TsmAction::Schedule { handle, delay }),
            }
        }
        if self.clients[idx].core.finished() {
            out.push(TsmAction::Cancel { handle });
            self.cache.release(&peer);
            self.clients.swap_remove(idx);
        }
    }

    fn finish_server(&mut self, idx: usize, raw: Vec<SsmAction>, out: &mut Vec<TsmAction>) {
        let (peer, invoke_id, handle) = {
            let core = &self.servers[idx].core;
            (core.peer, core.invoke_id, core.handle)
        };
        for action in raw {
            match action {
                SsmAction::SendApdu(apdu) => out.push(TsmAction::SendApdu {
                    destination: peer,
                    apdu,
                }),
                SsmAction::Deliver(apdu) => match apdu {
                    Apdu::Abort(abort) => out.push(TsmAction::ServerAbort {
                        peer,
                        invoke_id,
                        reason: abort.reason,
                    }),
                    request => out.push(TsmAction::ServerRequest {
                        peer,
                        invoke_id,
                        apdu: request,
                    }),
                },
                SsmAction::StartTimer(delay) => out.push(TsmAction::Schedule { handle, delay }),
            }
        }
        if self.servers[idx].core.finished() {
            out.push(TsmAction::Cancel { handle });
            self.cache.release(&peer);
            self.servers.swap_remove(idx);
        }
    }
}
