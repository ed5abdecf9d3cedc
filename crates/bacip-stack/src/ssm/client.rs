use crate::device::DeviceInfo;
use crate::ssm::{SegmentKind, SsmAction, SsmCore, SsmHandle, SsmPolicy, SsmState};
use bacip_core::address::Address;
use bacip_core::apdu::{AbortReason, Apdu, ComplexAck, SegmentAck};

/// Client side of a confirmed transaction: transmits the request (segmented
/// if need be), then collects the confirmation.
#[derive(Debug)]
pub struct ClientSsm {
    pub core: SsmCore,
    retry_count: u8,
}

impl ClientSsm {
    pub fn new(
        handle: SsmHandle,
        peer: Address,
        peer_info: DeviceInfo,
        invoke_id: u8,
        policy: SsmPolicy,
    ) -> Self {
        Self {
            core: SsmCore::new(handle, peer, peer_info, invoke_id, policy),
            retry_count: 0,
        }
    }

    /// Kick the transaction off with the application's request.
    pub fn start(&mut self, service_choice: u8, data: Vec<u8>, out: &mut Vec<SsmAction>) {
        self.core
            .set_segmentation_context(SegmentKind::Request, service_choice, data);

        // The segment size is the least of what we may transmit, what the
        // internetwork can carry to the peer, and what the peer accepts.
        self.core.segment_size = self
            .core
            .policy
            .max_apdu_length
            .min(self.core.peer_info.max_npdu_length)
            .min(self.core.peer_info.max_apdu_length);
        self.core.compute_segment_count();

        if self.core.is_segmented() {
            if !self.core.policy.segmentation.can_transmit() {
                // Local refusal: nothing reaches the wire.
                let abort = self.core.make_abort(false, AbortReason::SegmentationNotSupported);
                out.push(SsmAction::Deliver(abort));
                return;
            }
            if !self.core.peer_info.segmentation.can_receive() {
                let abort = self.core.make_abort(false, AbortReason::SegmentationNotSupported);
                out.push(SsmAction::Deliver(abort));
                return;
            }
        }

        self.transmit_request(out);
    }

    /// First transmission and every full retransmission share this path.
    fn transmit_request(&mut self, out: &mut Vec<SsmAction>) {
        if self.core.is_segmented() {
            self.core.sent_all_segments = false;
            self.core.segment_retry_count = 0;
            self.core.initial_sequence_number = 0;
            self.core.actual_window_size = 1;
            self.core.state = SsmState::SegmentedRequest;
            out.push(SsmAction::SendApdu(self.core.get_segment(0)));
            out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
        } else {
            self.core.sent_all_segments = true;
            self.core.state = SsmState::AwaitConfirmation;
            out.push(SsmAction::SendApdu(self.core.get_segment(0)));
            out.push(SsmAction::StartTimer(self.core.policy.retry_timeout));
        }
    }

    /// An APDU from the peer, already matched to this transaction.
    pub fn confirmation(&mut self, apdu: &Apdu, out: &mut Vec<SsmAction>) {
        match self.core.state {
            SsmState::SegmentedRequest => self.segmented_request(apdu, out),
            SsmState::AwaitConfirmation => self.await_confirmation(apdu, out),
            SsmState::SegmentedConfirmation => self.segmented_confirmation(apdu, out),
            state => log::debug!("client ssm ignoring {:?} in {state:?}", apdu.apdu_type()),
        }
    }

    /// The transaction's timer fired.
    pub fn handle_timeout(&mut self, out: &mut Vec<SsmAction>) {
        match self.core.state {
            SsmState::SegmentedRequest => {
                if self.core.segment_retry_count < self.core.policy.retries {
                    self.core.segment_retry_count += 1;
                    let initial = self.core.initial_sequence_number;
                    self.core.fill_window(initial, out);
                    out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
                } else {
                    let abort = self.core.make_abort(false, AbortReason::NoResponse);
                    out.push(SsmAction::Deliver(abort));
                }
            }
            SsmState::AwaitConfirmation => {
                if self.retry_count < self.core.policy.retries {
                    self.retry_count += 1;
                    self.transmit_request(out);
                } else {
                    let abort = self.core.make_abort(false, AbortReason::NoResponse);
                    out.push(SsmAction::Deliver(abort));
                }
            }
            SsmState::SegmentedConfirmation => {
                let abort = self.core.make_abort(false, AbortReason::NoResponse);
                out.push(SsmAction::Deliver(abort));
            }
            state => log::debug!("client ssm timer in {state:?}"),
        }
    }

    fn complete(&mut self, apdu: Apdu, out: &mut Vec<SsmAction>) {
        self.core.state = SsmState::Completed;
        out.push(SsmAction::Deliver(apdu));
    }

    /// Abort on a protocol violation: the peer hears about it and so does
    /// the application.
    fn abort_both_ways(&mut self, reason: AbortReason, out: &mut Vec<SsmAction>) {
        let abort = self.core.make_abort(false, reason);
        out.push(SsmAction::SendApdu(abort.clone()));
        out.push(SsmAction::Deliver(abort));
    }

    fn segmented_request(&mut self, apdu: &Apdu, out: &mut Vec<SsmAction>) {
        match apdu {
            Apdu::SegmentAck(ack) => {
                if !self.core.in_window(ack.sequence_number) {
                    // Duplicate ack; hold course.
                    out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
                } else if self.core.sent_all_segments {
                    self.core.state = SsmState::AwaitConfirmation;
                    out.push(SsmAction::StartTimer(self.core.policy.retry_timeout));
                } else {
                    self.core.initial_sequence_number = ack.sequence_number.wrapping_add(1);
                    self.core.actual_window_size = ack.actual_window_size.max(1);
                    self.core.segment_retry_count = 0;
                    let initial = self.core.initial_sequence_number;
                    self.core.fill_window(initial, out);
                    out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
                }
            }
            Apdu::SimpleAck(_) => {
                if !self.core.sent_all_segments {
                    self.abort_both_ways(AbortReason::InvalidApduInThisState, out);
                } else {
                    self.complete(apdu.clone(), out);
                }
            }
            Apdu::ComplexAck { header, data } => {
                if !self.core.sent_all_segments {
                    self.abort_both_ways(AbortReason::InvalidApduInThisState, out);
                } else if !header.segmented {
                    self.complete(apdu.clone(), out);
                } else {
                    self.begin_segmented_confirmation(header, data, out);
                }
            }
            Apdu::Error(_) | Apdu::Reject(_) | Apdu::Abort(_) => {
                self.complete(apdu.clone(), out);
            }
            other => log::debug!(
                "client ssm: unexpected {:?} while sending segments",
                other.apdu_type()
            ),
        }
    }

    fn await_confirmation(&mut self, apdu: &Apdu, out: &mut Vec<SsmAction>) {
        match apdu {
            Apdu::Abort(_) => {
                self.core.state = SsmState::Aborted;
                out.push(SsmAction::Deliver(apdu.clone()));
            }
            Apdu::SimpleAck(_) | Apdu::Error(_) | Apdu::Reject(_) => {
                self.complete(apdu.clone(), out);
            }
            Apdu::ComplexAck { header, data } => {
                if !header.segmented {
                    self.complete(apdu.clone(), out);
                } else {
                    self.begin_segmented_confirmation(header, data, out);
                }
            }
            Apdu::SegmentAck(_) => {
                // The peer is still chewing on our segments; give it time.
                out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
            }
            other => log::debug!(
                "client ssm: unexpected {:?} awaiting confirmation",
                other.apdu_type()
            ),
        }
    }

    /// First segment of a segmented ComplexAck: adopt the window and ack it.
    fn begin_segmented_confirmation(
        &mut self,
        header: &ComplexAck,
        data: &[u8],
        out: &mut Vec<SsmAction>,
    ) {
        if !self.core.policy.segmentation.can_receive() {
            let abort = self.core.make_abort(false, AbortReason::SegmentationNotSupported);
            out.push(SsmAction::Deliver(abort));
            return;
        }
        if header.sequence_number != Some(0) {
            self.abort_both_ways(AbortReason::InvalidApduInThisState, out);
            return;
        }

        self.core.set_segmentation_context(
            SegmentKind::Response,
            header.service_choice,
            data.to_vec(),
        );
        self.core.actual_window_size = header
            .window_size
            .unwrap_or(1)
            .min(self.core.policy.window_size)
            .max(1);
        self.core.last_sequence_number = 0;
        self.core.initial_sequence_number = 0;
        self.core.state = SsmState::SegmentedConfirmation;
        out.push(SsmAction::SendApdu(Apdu::SegmentAck(SegmentAck {
            negative_ack: false,
            from_server: false,
            invoke_id: self.core.invoke_id,
            sequence_number: 0,
            actual_window_size: self.core.actual_window_size,
        })));
        out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
    }

    fn segmented_confirmation(&mut self, apdu: &Apdu, out: &mut Vec<SsmAction>) {
        let Apdu::ComplexAck { header, data } = apdu else {
            self.abort_both_ways(AbortReason::InvalidApduInThisState, out);
            return;
        };
        if !header.segmented {
            self.abort_both_ways(AbortReason::InvalidApduInThisState, out);
            return;
        }

        let expected = self.core.last_sequence_number.wrapping_add(1);
        if header.sequence_number != Some(expected) {
            // Out of order: tell the peer where we really are.
            out.push(SsmAction::SendApdu(Apdu::SegmentAck(SegmentAck {
                negative_ack: true,
                from_server: false,
                invoke_id: self.core.invoke_id,
                sequence_number: self.core.last_sequence_number,
                actual_window_size: self.core.actual_window_size,
            })));
            out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
            return;
        }

        self.core.append_segment(data);
        self.core.last_sequence_number = expected;

        if !header.more_follows {
            out.push(SsmAction::SendApdu(Apdu::SegmentAck(SegmentAck {
                negative_ack: false,
                from_server: false,
                invoke_id: self.core.invoke_id,
                sequence_number: self.core.last_sequence_number,
                actual_window_size: self.core.actual_window_size,
            })));
            let assembled = Apdu::ComplexAck {
                header: ComplexAck::unsegmented(self.core.invoke_id, self.core.service_choice),
                data: std::mem::take(&mut self.core.segment_data),
            };
            self.complete(assembled, out);
        } else if header.sequence_number
            == Some(
                self.core
                    .initial_sequence_number
                    .wrapping_add(self.core.actual_window_size),
            )
        {
            // Window exhausted: ack it to open the next one.
            self.core.initial_sequence_number = self.core.last_sequence_number;
            out.push(SsmAction::SendApdu(Apdu::SegmentAck(SegmentAck {
                negative_ack: false,
                from_server: false,
                invoke_id: self.core.invoke_id,
                sequence_number: self.core.last_sequence_number,
                actual_window_size: self.core.actual_window_size,
            })));
            out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
        } else {
            out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
        }
    }
}
