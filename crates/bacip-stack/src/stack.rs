//! The assembled stack: one task owning the link, the routing SAP, the
//! transaction registry, the dispatcher, and every timer.

use crate::app::ApplicationDispatcher;
use crate::config::StackConfig;
use crate::error::StackError;
use crate::network::{NetAction, NetworkSap};
use crate::ssm::{SsmHandle, SsmPolicy};
use crate::tsm::{TransactionSap, TsmAction};
use crate::timer::TimerWheel;
use bacip_core::address::{Address, IpPort};
use bacip_core::apdu::Apdu;
use bacip_core::bvll::BdtEntry;
use bacip_core::encoding::{reader::Reader, writer::Writer};
use bacip_core::pdu::Pdu;
use bacip_core::services::i_am::IAmRequest;
use bacip_core::services::who_is::WhoIsRequest;
use bacip_core::services::{SERVICE_I_AM, SERVICE_WHO_IS};
use bacip_link::udp::UdpEndpoint;
use bacip_link::{Bbmd, BipForeign, BipLink, BipRole, BipSimple};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddrV4;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};

/// Outcome of a confirmed request, as seen by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    SimpleAck {
        service_choice: u8,
    },
    ComplexAck {
        service_choice: u8,
        data: Vec<u8>,
    },
    Error {
        service_choice: u8,
        class: u32,
        code: u32,
    },
    Reject {
        reason: u8,
    },
    Abort {
        reason: u8,
        from_server: bool,
    },
}

enum Command {
    Request {
        destination: Address,
        service_choice: u8,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<Confirmation, StackError>>,
    },
    Unconfirmed {
        destination: Address,
        service_choice: u8,
        data: Vec<u8>,
    },
    Shutdown,
}

/// Cheap cloneable handle for talking to a running [`Stack`].
#[derive(Clone)]
pub struct StackHandle {
    commands: mpsc::Sender<Command>,
    local: IpPort,
}

impl StackHandle {
    pub fn local_addr(&self) -> IpPort {
        self.local
    }

    /// Issue a confirmed request and wait for its outcome. Timeouts surface
    /// as [`Confirmation::Abort`] with reason `no-response`.
    pub async fn confirmed_request(
        &self,
        destination: Address,
        service_choice: u8,
        data: Vec<u8>,
    ) -> Result<Confirmation, StackError> {
        let (reply, result) = oneshot::channel();
        self.commands
            .send(Command::Request {
                destination,
                service_choice,
                data,
                reply,
            })
            .await
            .map_err(|_| StackError::ShutDown)?;
        result.await.map_err(|_| StackError::ShutDown)?
    }

    /// Fire-and-forget an unconfirmed request.
    pub async fn unconfirmed_request(
        &self,
        destination: Address,
        service_choice: u8,
        data: Vec<u8>,
    ) -> Result<(), StackError> {
        self.commands
            .send(Command::Unconfirmed {
                destination,
                service_choice,
                data,
            })
            .await
            .map_err(|_| StackError::ShutDown)
    }

    /// Broadcast a Who-Is, optionally bounded to an instance range.
    pub async fn who_is(
        &self,
        destination: Address,
        range: Option<(u32, u32)>,
    ) -> Result<(), StackError> {
        let request = match range {
            Some((low, high)) => WhoIsRequest::range(low, high),
            None => WhoIsRequest::global(),
        };
        let mut buf = [0u8; 16];
        let mut w = Writer::new(&mut buf);
        request.encode(&mut w)?;
        self.unconfirmed_request(destination, SERVICE_WHO_IS, w.as_written().to_vec())
            .await
    }

    /// Stop the stack; in-flight transactions get synthetic aborts.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

enum LoopEvent {
    Inbound(Result<Pdu, bacip_link::LinkError>),
    Command(Option<Command>),
    SecondTick,
    TimersDue,
}

/// A running BACnet/IP node.
pub struct Stack {
    link: BipLink,
    nsap: NetworkSap,
    tsm: TransactionSap,
    dispatcher: ApplicationDispatcher,
    timers: TimerWheel<SsmHandle>,
    commands: mpsc::Receiver<Command>,
    pending: HashMap<(Address, u8), oneshot::Sender<Result<Confirmation, StackError>>>,
    config: StackConfig,
    decode_errors: u64,
}

impl Stack {
    /// Bind as a simple node, or as a foreign device when the configuration
    /// names a BBMD.
    pub async fn bind(
        config: StackConfig,
        dispatcher: ApplicationDispatcher,
    ) -> Result<(Self, StackHandle), StackError> {
        config.validate()?;
        let endpoint = UdpEndpoint::bind(
            SocketAddrV4::from(config.local_address),
            config.peer_idle_timeout,
        )
        .await?;
        let broadcast = endpoint.broadcast_addr();

        match config.bbmd_address {
            Some(bbmd) => {
                let mut foreign = BipForeign::new(bbmd, config.bbmd_ttl);
                let registration = foreign.register();
                let mut link = BipLink::new(endpoint, BipRole::Foreign(foreign));
                // Registration frames bypass the NPDU path.
                for (dest, frame) in registration {
                    link.send_raw(dest, &frame).await;
                }
                Self::finish_bind(config, dispatcher, link)
            }
            None => {
                let link = BipLink::new(endpoint, BipRole::Simple(BipSimple::new(broadcast)));
                Self::finish_bind(config, dispatcher, link)
            }
        }
    }

    /// Bind as a BBMD with the given distribution table.
    pub async fn bind_bbmd(
        config: StackConfig,
        dispatcher: ApplicationDispatcher,
        bdt: Vec<BdtEntry>,
    ) -> Result<(Self, StackHandle), StackError> {
        config.validate()?;
        let endpoint = UdpEndpoint::bind(
            SocketAddrV4::from(config.local_address),
            config.peer_idle_timeout,
        )
        .await?;
        let broadcast = endpoint.broadcast_addr();
        let mut bbmd = Bbmd::new(endpoint.local_addr(), broadcast);
        for entry in bdt {
            bbmd.add_peer(entry);
        }
        let link = BipLink::new(endpoint, BipRole::Bbmd(bbmd));
        Self::finish_bind(config, dispatcher, link)
    }

    fn finish_bind(
        config: StackConfig,
        dispatcher: ApplicationDispatcher,
        link: BipLink,
    ) -> Result<(Self, StackHandle), StackError> {
        let local = link.local_addr();
        let (tx, rx) = mpsc::channel(64);
        let stack = Self {
            link,
            nsap: NetworkSap::new(Address::local_ip(local), None),
            tsm: TransactionSap::new(SsmPolicy::from_config(&config)),
            dispatcher,
            timers: TimerWheel::new(),
            commands: rx,
            pending: HashMap::new(),
            config,
            decode_errors: 0,
        };
        let handle = StackHandle {
            commands: tx,
            local,
        };
        Ok((stack, handle))
    }

    pub fn dispatcher(&self) -> &ApplicationDispatcher {
        &self.dispatcher
    }

    /// Inbound frames dropped for being undecodable.
    pub fn decode_error_count(&self) -> u64 {
        self.decode_errors
    }

    /// Drive the stack until shutdown.
    pub async fn run(mut self) -> Result<(), StackError> {
        let mut second = tokio::time::interval(Duration::from_secs(1));
        second.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let deadline = self.timers.next_deadline();
            let event = tokio::select! {
                result = self.link.recv_npdu() => LoopEvent::Inbound(result),
                command = self.commands.recv() => LoopEvent::Command(command),
                _ = second.tick() => LoopEvent::SecondTick,
                _ = tokio::time::sleep_until(
                    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
                ), if deadline.is_some() => LoopEvent::TimersDue,
            };

            match event {
                LoopEvent::Inbound(Ok(pdu)) => self.handle_inbound(pdu).await,
                LoopEvent::Inbound(Err(err)) => {
                    log::warn!("receive failed: {err}");
                }
                LoopEvent::Command(Some(command)) => {
                    if self.handle_command(command).await {
                        break;
                    }
                }
                LoopEvent::Command(None) => break,
                LoopEvent::SecondTick => {
                    if let Err(err) = self.link.tick_second().await {
                        log::warn!("link tick failed: {err}");
                    }
                }
                LoopEvent::TimersDue => {
                    for handle in self.timers.pop_due(Instant::now()) {
                        let actions = self.tsm.handle_timeout(handle);
                        self.process_tsm_actions(actions).await;
                    }
                }
            }
        }

        // Teardown: every open transaction gets a synthetic abort.
        let actions = self.tsm.shutdown();
        self.process_tsm_actions(actions).await;
        Ok(())
    }

    /// Returns true when the stack should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Request {
                destination,
                service_choice,
                data,
                reply,
            } => match self
                .tsm
                .submit_request(destination, service_choice, data, None)
            {
                Ok((invoke_id, actions)) => {
                    self.pending.insert((destination, invoke_id), reply);
                    self.process_tsm_actions(actions).await;
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Command::Unconfirmed {
                destination,
                service_choice,
                data,
            } => {
                let apdu = Apdu::UnconfirmedRequest {
                    service_choice,
                    data,
                };
                self.send_apdu(destination, &apdu).await;
            }
            Command::Shutdown => return true,
        }
        false
    }

    async fn handle_inbound(&mut self, pdu: Pdu) {
        let actions = self.nsap.inbound(0, pdu);
        self.process_net_actions(actions).await;
    }

    async fn process_net_actions(&mut self, actions: Vec<NetAction>) {
        for action in actions {
            match action {
                NetAction::Send {
                    destination, npdu, ..
                } => {
                    if let Err(err) = self.link.send_npdu(&destination, &npdu).await {
                        log::warn!("send to {destination} failed: {err}");
                    }
                }
                NetAction::DeliverApdu { pdu } => {
                    let mut r = Reader::new(&pdu.data);
                    match Apdu::decode(&mut r) {
                        Ok(apdu) => {
                            let actions = self.tsm.handle_apdu(pdu.source, apdu);
                            self.process_tsm_actions(actions).await;
                        }
                        Err(err) => {
                            self.decode_errors += 1;
                            log::warn!("dropping undecodable APDU from {}: {err}", pdu.source);
                        }
                    }
                }
            }
        }
    }

    async fn process_tsm_actions(&mut self, actions: Vec<TsmAction>) {
        let mut queue: VecDeque<TsmAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                TsmAction::SendApdu { destination, apdu } => {
                    self.send_apdu(destination, &apdu).await;
                }
                TsmAction::ClientResult {
                    peer,
                    invoke_id,
                    apdu,
                } => {
                    let confirmation = confirmation_from_apdu(apdu);
                    match self.pending.remove(&(peer, invoke_id)) {
                        Some(reply) => {
                            let _ = reply.send(Ok(confirmation));
                        }
                        None => log::debug!(
                            "no waiter for invoke {invoke_id} from {peer}: {confirmation:?}"
                        ),
                    }
                }
                TsmAction::ServerRequest {
                    peer,
                    invoke_id,
                    apdu,
                } => {
                    if let Apdu::ConfirmedRequest { header, data } = apdu {
                        let response = self.dispatcher.handle_confirmed(
                            &peer,
                            invoke_id,
                            header.service_choice,
                            &data,
                        );
                        queue.extend(self.tsm.handle_response(peer, response));
                    }
                }
                TsmAction::ServerAbort {
                    peer,
                    invoke_id,
                    reason,
                } => {
                    log::debug!("server transaction {peer}/{invoke_id} aborted: reason {reason}");
                }
                TsmAction::DeliverUnconfirmed {
                    peer,
                    service_choice,
                    data,
                } => {
                    self.deliver_unconfirmed(peer, service_choice, &data).await;
                }
                TsmAction::Schedule { handle, delay } => {
                    self.timers.schedule(handle, Instant::now() + delay);
                }
                TsmAction::Cancel { handle } => {
                    self.timers.cancel(&handle);
                }
            }
        }
    }

    async fn deliver_unconfirmed(&mut self, peer: Address, service_choice: u8, data: &[u8]) {
        match service_choice {
            SERVICE_I_AM => match IAmRequest::decode(&mut Reader::new(data)) {
                Ok(i_am) => {
                    self.tsm.device_cache_mut().observe_i_am(peer, &i_am);
                }
                Err(err) => {
                    self.decode_errors += 1;
                    log::warn!("bad I-Am from {peer}: {err}");
                    return;
                }
            },
            SERVICE_WHO_IS => match WhoIsRequest::decode(&mut Reader::new(data)) {
                Ok(who_is) => {
                    if who_is.matches(self.dispatcher.device_id().instance()) {
                        self.announce_to(peer).await;
                    }
                }
                Err(err) => {
                    self.decode_errors += 1;
                    log::warn!("bad Who-Is from {peer}: {err}");
                    return;
                }
            },
            _ => {}
        }
        self.dispatcher
            .handle_unconfirmed(&peer, service_choice, data);
    }

    /// Answer a Who-Is with a unicast I-Am.
    async fn announce_to(&mut self, destination: Address) {
        let i_am = IAmRequest {
            device_id: self.dispatcher.device_id(),
            max_apdu_length: self.config.max_apdu_length_accepted as u32,
            segmentation: self.config.segmentation_supported,
            vendor_id: self.config.vendor_id,
        };
        let mut buf = [0u8; 32];
        let mut w = Writer::new(&mut buf);
        if let Err(err) = i_am.encode(&mut w) {
            log::warn!("could not encode I-Am: {err}");
            return;
        }
        let apdu = Apdu::UnconfirmedRequest {
            service_choice: SERVICE_I_AM,
            data: w.as_written().to_vec(),
        };
        self.send_apdu(destination, &apdu).await;
    }

    async fn send_apdu(&mut self, destination: Address, apdu: &Apdu) {
        let bytes = match apdu.to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                log::warn!("could not encode {:?}: {err}", apdu.apdu_type());
                return;
            }
        };
        let expecting_reply = matches!(apdu, Apdu::ConfirmedRequest { .. });
        // Downstream traffic only ever produces sends, so this stays out of
        // the inbound delivery path.
        match self
            .nsap
            .outbound(Pdu::outbound(destination, bytes), expecting_reply)
        {
            Ok(actions) => {
                for action in actions {
                    if let NetAction::Send {
                        destination, npdu, ..
                    } = action
                    {
                        if let Err(err) = self.link.send_npdu(&destination, &npdu).await {
                            log::warn!("send to {destination} failed: {err}");
                        }
                    }
                }
            }
            Err(err) => log::warn!("cannot route to {destination}: {err}"),
        }
    }
}

fn confirmation_from_apdu(apdu: Apdu) -> Confirmation {
    match apdu {
        Apdu::SimpleAck(ack) => Confirmation::SimpleAck {
            service_choice: ack.service_choice,
        },
        Apdu::ComplexAck { header, data } => Confirmation::ComplexAck {
            service_choice: header.service_choice,
            data,
        },
        Apdu::Error(e) => Confirmation::Error {
            service_choice: e.service_choice,
            class: e.error_class,
            code: e.error_code,
        },
        Apdu::Reject(rej) => Confirmation::Reject { reason: rej.reason },
        Apdu::Abort(abort) => Confirmation::Abort {
            reason: abort.reason,
            from_server: abort.from_server,
        },
        other => {
            log::warn!("unexpected client result {:?}", other.apdu_type());
            Confirmation::Abort {
                reason: 0,
                from_server: false,
            }
        }
    }
}
