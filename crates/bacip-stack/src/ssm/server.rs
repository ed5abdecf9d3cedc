use crate::device::DeviceInfo;
use crate::ssm::{SegmentKind, SsmAction, SsmCore, SsmHandle, SsmPolicy, SsmState};
use bacip_core::address::Address;
use bacip_core::apdu::{AbortReason, Apdu, ConfirmedRequest, SegmentAck};

/// Server side of a confirmed transaction: reassembles the request, hands it
/// to the application, and transmits the response (segmented if need be).
#[derive(Debug)]
pub struct ServerSsm {
    pub core: SsmCore,
    /// Header of the original request, for rebuilding the reassembled APDU.
    request_header: Option<ConfirmedRequest>,
    /// Largest response APDU the requester can take.
    effective_max_apdu: usize,
    /// Response segment budget granted by the request, if bounded.
    response_segment_limit: Option<u32>,
}

impl ServerSsm {
    pub fn new(
        handle: SsmHandle,
        peer: Address,
        peer_info: DeviceInfo,
        policy: SsmPolicy,
    ) -> Self {
        let max_apdu = peer_info.max_apdu_length;
        Self {
            core: SsmCore::new(handle, peer, peer_info, 0, policy),
            request_header: None,
            effective_max_apdu: max_apdu,
            response_segment_limit: None,
        }
    }

    /// A downstream APDU from the peer for this transaction.
    pub fn indication(&mut self, apdu: &Apdu, out: &mut Vec<SsmAction>) {
        match self.core.state {
            SsmState::Idle => self.idle(apdu, out),
            SsmState::SegmentedRequest => self.segmented_request(apdu, out),
            SsmState::AwaitResponse => self.await_response(apdu, out),
            SsmState::SegmentedResponse => self.segmented_response(apdu, out),
            state => log::debug!("server ssm ignoring {:?} in {state:?}", apdu.apdu_type()),
        }
    }

    /// The application's answer, ready to go back to the peer.
    pub fn confirmation(&mut self, apdu: Apdu, out: &mut Vec<SsmAction>) {
        if self.core.state != SsmState::AwaitResponse {
            log::debug!("response arrived in {:?}", self.core.state);
        }
        match apdu {
            Apdu::Abort(_) => {
                self.core.state = SsmState::Aborted;
                out.push(SsmAction::SendApdu(apdu));
            }
            Apdu::SimpleAck(_) | Apdu::Error(_) | Apdu::Reject(_) => {
                self.core.state = SsmState::Completed;
                out.push(SsmAction::SendApdu(apdu));
            }
            Apdu::ComplexAck { header, data } => {
                self.send_complex_ack(header.service_choice, data, out);
            }
            other => log::warn!(
                "application answered with {:?}, which is not a response",
                other.apdu_type()
            ),
        }
    }

    pub fn handle_timeout(&mut self, out: &mut Vec<SsmAction>) {
        match self.core.state {
            SsmState::SegmentedRequest => {
                // The client stopped sending segments; quietly give up.
                self.core.state = SsmState::Aborted;
            }
            SsmState::AwaitResponse => {
                // The application never answered. The client has long since
                // started retrying; let it know what happened to us.
                let abort = self.core.make_abort(true, AbortReason::ServerTimeout);
                out.push(SsmAction::Deliver(abort));
            }
            SsmState::SegmentedResponse => {
                if self.core.segment_retry_count < self.core.policy.retries {
                    self.core.segment_retry_count += 1;
                    let initial = self.core.initial_sequence_number;
                    self.core.fill_window(initial, out);
                    out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
                } else {
                    self.core.state = SsmState::Aborted;
                }
            }
            state => log::debug!("server ssm timer in {state:?}"),
        }
    }

    fn abort_to_peer(&mut self, reason: AbortReason, out: &mut Vec<SsmAction>) {
        let abort = self.core.make_abort(true, reason);
        out.push(SsmAction::SendApdu(abort));
    }

    fn segment_ack(&self, negative: bool, sequence_number: u8) -> Apdu {
        Apdu::SegmentAck(SegmentAck {
            negative_ack: negative,
            from_server: true,
            invoke_id: self.core.invoke_id,
            sequence_number,
            actual_window_size: self.core.actual_window_size,
        })
    }

    fn idle(&mut self, apdu: &Apdu, out: &mut Vec<SsmAction>) {
        let Apdu::ConfirmedRequest { header, data } = apdu else {
            log::debug!("fresh transaction started by {:?}", apdu.apdu_type());
            return;
        };
        self.core.invoke_id = header.invoke_id;
        self.request_header = Some(*header);

        // The requester names a size in the request; the cache may know a
        // smaller one from an I-Am. Take the conservative minimum.
        self.effective_max_apdu = header
            .max_apdu
            .octets()
            .min(self.core.peer_info.max_apdu_length);
        self.response_segment_limit = header.max_segments.limit();

        if !header.segmented {
            self.core.state = SsmState::AwaitResponse;
            out.push(SsmAction::Deliver(apdu.clone()));
            out.push(SsmAction::StartTimer(self.core.policy.application_timeout));
            return;
        }

        if !self.core.policy.segmentation.can_receive() {
            self.abort_to_peer(AbortReason::SegmentationNotSupported, out);
            return;
        }
        if header.sequence_number != Some(0) {
            // Mid-stream segment of a transaction we never saw the start of.
            self.abort_to_peer(AbortReason::InvalidApduInThisState, out);
            return;
        }

        self.core.set_segmentation_context(
            SegmentKind::Request,
            header.service_choice,
            data.clone(),
        );
        self.core.actual_window_size = header
            .window_size
            .unwrap_or(1)
            .min(self.core.proposed_window_size)
            .max(1);
        self.core.last_sequence_number = 0;
        self.core.initial_sequence_number = 0;
        self.core.state = SsmState::SegmentedRequest;
        out.push(SsmAction::SendApdu(self.segment_ack(false, 0)));
        out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
    }

    fn segmented_request(&mut self, apdu: &Apdu, out: &mut Vec<SsmAction>) {
        let (header, data) = match apdu {
            Apdu::Abort(_) => {
                self.core.state = SsmState::Completed;
                return;
            }
            Apdu::ConfirmedRequest { header, data } if header.segmented => (header, data),
            _ => {
                self.abort_to_peer(AbortReason::InvalidApduInThisState, out);
                return;
            }
        };

        let expected = self.core.last_sequence_number.wrapping_add(1);
        if header.sequence_number != Some(expected) {
            out.push(SsmAction::SendApdu(
                self.segment_ack(true, self.core.last_sequence_number),
            ));
            out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
            return;
        }

        self.core.append_segment(data);
        self.core.last_sequence_number = expected;

        if !header.more_follows {
            out.push(SsmAction::SendApdu(
                self.segment_ack(false, self.core.last_sequence_number),
            ));
            let assembled = Apdu::ConfirmedRequest {
                header: ConfirmedRequest {
                    segmented: false,
                    more_follows: false,
                    sequence_number: None,
                    window_size: None,
                    ..self.request_header.unwrap_or_else(|| {
                        ConfirmedRequest::unsegmented(
                            self.core.invoke_id,
                            self.core.service_choice,
                            bacip_core::apdu::MaxSegments::Unspecified,
                            bacip_core::apdu::MaxApdu::Octets1024,
                            false,
                        )
                    })
                },
                data: std::mem::take(&mut self.core.segment_data),
            };
            self.core.state = SsmState::AwaitResponse;
            out.push(SsmAction::Deliver(assembled));
            out.push(SsmAction::StartTimer(self.core.policy.application_timeout));
        } else if header.sequence_number
            == Some(
                self.core
                    .initial_sequence_number
                    .wrapping_add(self.core.actual_window_size),
            )
        {
            self.core.initial_sequence_number = self.core.last_sequence_number;
            out.push(SsmAction::SendApdu(
                self.segment_ack(false, self.core.last_sequence_number),
            ));
            out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
        } else {
            out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
        }
    }

    fn await_response(&mut self, apdu: &Apdu, out: &mut Vec<SsmAction>) {
        match apdu {
            Apdu::ConfirmedRequest { .. } => {
                log::debug!("client is retrying invoke id {}", self.core.invoke_id);
            }
            Apdu::Abort(_) => {
                // Client gave up; let the application know to stop working.
                self.core.state = SsmState::Aborted;
                out.push(SsmAction::Deliver(apdu.clone()));
            }
            other => log::debug!(
                "server ssm: unexpected {:?} awaiting the application",
                other.apdu_type()
            ),
        }
    }

    fn send_complex_ack(&mut self, service_choice: u8, data: Vec<u8>, out: &mut Vec<SsmAction>) {
        self.core
            .set_segmentation_context(SegmentKind::Response, service_choice, data);
        self.core.segment_size = self
            .core
            .policy
            .max_apdu_length
            .min(self.core.peer_info.max_npdu_length)
            .min(self.effective_max_apdu);
        self.core.compute_segment_count();

        if self.core.is_segmented() {
            if !self.core.policy.segmentation.can_transmit() {
                self.abort_to_peer(AbortReason::SegmentationNotSupported, out);
                return;
            }
            if !self.core.peer_info.segmentation.can_receive() {
                self.abort_to_peer(AbortReason::SegmentationNotSupported, out);
                return;
            }
            if self
                .response_segment_limit
                .is_some_and(|limit| self.core.segment_count > limit)
            {
                self.abort_to_peer(AbortReason::ApduTooLong, out);
                return;
            }

            self.core.sent_all_segments = false;
            self.core.segment_retry_count = 0;
            self.core.initial_sequence_number = 0;
            self.core.actual_window_size = 1;
            self.core.state = SsmState::SegmentedResponse;
            out.push(SsmAction::SendApdu(self.core.get_segment(0)));
            out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
        } else {
            self.core.state = SsmState::Completed;
            out.push(SsmAction::SendApdu(self.core.get_segment(0)));
        }
    }

    fn segmented_response(&mut self, apdu: &Apdu, out: &mut Vec<SsmAction>) {
        match apdu {
            Apdu::SegmentAck(ack) => {
                if !self.core.in_window(ack.sequence_number) {
                    out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
                } else if self.core.sent_all_segments {
                    self.core.state = SsmState::Completed;
                } else {
                    self.core.initial_sequence_number = ack.sequence_number.wrapping_add(1);
                    self.core.actual_window_size = ack.actual_window_size.max(1);
                    self.core.segment_retry_count = 0;
                    let initial = self.core.initial_sequence_number;
                    self.core.fill_window(initial, out);
                    out.push(SsmAction::StartTimer(self.core.policy.segment_timeout));
                }
            }
            Apdu::Abort(_) => {
                self.core.state = SsmState::Completed;
            }
            other => log::debug!(
                "server ssm: unexpected {:?} while sending the response",
                other.apdu_type()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ServerSsm;
    use crate::device::DeviceInfo;
    use crate::ssm::testing::{capable_peer, delivered, peer_addr, policy, sent};
    use crate::ssm::{SsmAction, SsmState};
    use bacip_core::apdu::{
        AbortPdu, AbortReason, Apdu, ComplexAck, ConfirmedRequest, MaxApdu, MaxSegments,
        SegmentAck, SimpleAck,
    };
    use bacip_core::services::i_am::Segmentation;

    const SERVICE: u8 = 14;

    fn server(peer_info: DeviceInfo, segmentation: Segmentation) -> ServerSsm {
        ServerSsm::new(2, peer_addr(), peer_info, policy(segmentation))
    }

    fn request(data: Vec<u8>) -> Apdu {
        Apdu::ConfirmedRequest {
            header: ConfirmedRequest::unsegmented(
                9,
                SERVICE,
                MaxSegments::Eight,
                MaxApdu::Octets480,
                true,
            ),
            data,
        }
    }

    fn request_segment(seq: u8, more: bool, window: Option<u8>, byte: u8) -> Apdu {
        Apdu::ConfirmedRequest {
            header: ConfirmedRequest {
                segmented: true,
                more_follows: more,
                segmented_response_accepted: true,
                max_segments: MaxSegments::Eight,
                max_apdu: MaxApdu::Octets480,
                invoke_id: 9,
                sequence_number: Some(seq),
                window_size: window,
                service_choice: SERVICE,
            },
            data: vec![byte; 16],
        }
    }

    fn client_ack(seq: u8, window: u8) -> Apdu {
        Apdu::SegmentAck(SegmentAck {
            negative_ack: false,
            from_server: false,
            invoke_id: 9,
            sequence_number: seq,
            actual_window_size: window,
        })
    }

    #[test]
    fn unsegmented_request_reaches_the_application() {
        let mut ssm = server(capable_peer(), Segmentation::Both);
        let mut out = Vec::new();
        ssm.indication(&request(vec![1, 2]), &mut out);

        assert_eq!(ssm.core.state, SsmState::AwaitResponse);
        assert_eq!(ssm.core.invoke_id, 9);
        assert_eq!(delivered(&out).len(), 1);
        assert!(matches!(out.last(), Some(SsmAction::StartTimer(_))));
    }

    #[test]
    fn unsegmented_response_completes() {
        let mut ssm = server(capable_peer(), Segmentation::Both);
        ssm.indication(&request(vec![1, 2]), &mut Vec::new());

        let mut out = Vec::new();
        ssm.confirmation(
            Apdu::ComplexAck {
                header: ComplexAck::unsegmented(9, SERVICE),
                data: vec![7; 100],
            },
            &mut out,
        );
        assert_eq!(ssm.core.state, SsmState::Completed);
        match sent(&out)[0] {
            Apdu::ComplexAck { header, data } => {
                assert!(!header.segmented);
                assert_eq!(header.invoke_id, 9);
                assert_eq!(data.len(), 100);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn segmented_request_is_acked_and_reassembled() {
        let mut ssm = server(capable_peer(), Segmentation::Both);

        // First segment proposes window 8; we counter with our limit 4.
        let mut out = Vec::new();
        ssm.indication(&request_segment(0, true, Some(8), 0xB0), &mut out);
        assert_eq!(ssm.core.state, SsmState::SegmentedRequest);
        match sent(&out)[0] {
            Apdu::SegmentAck(ack) => {
                assert!(ack.from_server);
                assert_eq!(ack.sequence_number, 0);
                assert_eq!(ack.actual_window_size, 4);
            }
            other => panic!("unexpected {other:?}"),
        }

        for seq in 1..=3 {
            let mut out = Vec::new();
            ssm.indication(&request_segment(seq, true, None, 0xB0 + seq), &mut out);
            assert!(sent(&out).is_empty());
        }

        // Window boundary at seq 4.
        let mut out = Vec::new();
        ssm.indication(&request_segment(4, true, None, 0xB4), &mut out);
        match sent(&out)[0] {
            Apdu::SegmentAck(ack) => assert_eq!(ack.sequence_number, 4),
            other => panic!("unexpected {other:?}"),
        }

        // Final segment: ack, reassemble, deliver.
        let mut out = Vec::new();
        ssm.indication(&request_segment(5, false, None, 0xB5), &mut out);
        assert_eq!(ssm.core.state, SsmState::AwaitResponse);
        match delivered(&out)[0] {
            Apdu::ConfirmedRequest { header, data } => {
                assert!(!header.segmented);
                assert_eq!(header.invoke_id, 9);
                assert_eq!(data.len(), 96);
                assert_eq!(&data[..16], &[0xB0; 16]);
                assert_eq!(&data[80..], &[0xB5; 16]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn out_of_order_request_segment_gets_a_nak() {
        let mut ssm = server(capable_peer(), Segmentation::Both);
        ssm.indication(&request_segment(0, true, Some(4), 0xB0), &mut Vec::new());

        let mut out = Vec::new();
        ssm.indication(&request_segment(2, true, None, 0xB2), &mut out);
        match sent(&out)[0] {
            Apdu::SegmentAck(ack) => {
                assert!(ack.negative_ack);
                assert_eq!(ack.sequence_number, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(ssm.core.segment_data.len(), 16);
    }

    #[test]
    fn lost_segment_recovers_within_the_retry_budget() {
        // Segment 1 of three goes missing; the NAK names seq 0 and the
        // retransmission picks up from there.
        let mut ssm = server(capable_peer(), Segmentation::Both);
        ssm.indication(&request_segment(0, true, Some(4), 0xC0), &mut Vec::new());

        let mut out = Vec::new();
        ssm.indication(&request_segment(2, true, None, 0xC2), &mut out);
        match sent(&out)[0] {
            Apdu::SegmentAck(ack) => {
                assert!(ack.negative_ack);
                assert_eq!(ack.sequence_number, 0);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Sender retransmits seq 1 then 2; reassembly completes.
        ssm.indication(&request_segment(1, true, None, 0xC1), &mut Vec::new());
        let mut out = Vec::new();
        ssm.indication(&request_segment(2, false, None, 0xC2), &mut out);
        assert_eq!(ssm.core.state, SsmState::AwaitResponse);
        match delivered(&out)[0] {
            Apdu::ConfirmedRequest { data, .. } => {
                assert_eq!(data.len(), 48);
                assert_eq!(&data[16..32], &[0xC1; 16]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn segmented_request_without_receive_support_is_aborted() {
        let mut ssm = server(capable_peer(), Segmentation::Transmit);
        let mut out = Vec::new();
        ssm.indication(&request_segment(0, true, Some(4), 0xB0), &mut out);
        assert_eq!(ssm.core.state, SsmState::Aborted);
        match sent(&out)[0] {
            Apdu::Abort(AbortPdu {
                from_server,
                reason,
                ..
            }) => {
                assert!(*from_server);
                assert_eq!(*reason, AbortReason::SegmentationNotSupported as u8);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn segmented_response_respects_window_and_acks() {
        let mut ssm = server(capable_peer(), Segmentation::Both);
        ssm.indication(&request(vec![1]), &mut Vec::new());

        // 2400 bytes at segment size 480: five segments.
        let mut out = Vec::new();
        ssm.confirmation(
            Apdu::ComplexAck {
                header: ComplexAck::unsegmented(9, SERVICE),
                data: vec![0xD0; 2400],
            },
            &mut out,
        );
        assert_eq!(ssm.core.state, SsmState::SegmentedResponse);
        let first = sent(&out);
        assert_eq!(first.len(), 1);
        match first[0] {
            Apdu::ComplexAck { header, data } => {
                assert!(header.segmented);
                assert_eq!(header.sequence_number, Some(0));
                assert_eq!(header.window_size, Some(4));
                assert_eq!(data.len(), 480);
            }
            other => panic!("unexpected {other:?}"),
        }

        // Client grants window 4: segments 1..=4 go out, which is all of them.
        let mut out = Vec::new();
        ssm.indication(&client_ack(0, 4), &mut out);
        assert_eq!(sent(&out).len(), 4);
        assert!(ssm.core.sent_all_segments);

        // Final ack closes the transaction.
        let mut out = Vec::new();
        ssm.indication(&client_ack(4, 4), &mut out);
        assert_eq!(ssm.core.state, SsmState::Completed);
    }

    #[test]
    fn response_exceeding_the_request_budget_is_aborted() {
        let mut ssm = server(capable_peer(), Segmentation::Both);
        // Requester accepts at most two segments of at most 480 octets.
        ssm.indication(
            &Apdu::ConfirmedRequest {
                header: ConfirmedRequest::unsegmented(
                    9,
                    SERVICE,
                    MaxSegments::Two,
                    MaxApdu::Octets480,
                    true,
                ),
                data: vec![],
            },
            &mut Vec::new(),
        );

        let mut out = Vec::new();
        ssm.confirmation(
            Apdu::ComplexAck {
                header: ComplexAck::unsegmented(9, SERVICE),
                data: vec![0; 2400],
            },
            &mut out,
        );
        assert_eq!(ssm.core.state, SsmState::Aborted);
        match sent(&out)[0] {
            Apdu::Abort(AbortPdu { reason, .. }) => {
                assert_eq!(*reason, AbortReason::ApduTooLong as u8)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn response_to_peer_without_receive_support_is_aborted() {
        let peer = DeviceInfo {
            segmentation: Segmentation::Transmit,
            ..DeviceInfo::unknown(peer_addr())
        };
        let mut ssm = server(peer, Segmentation::Both);
        ssm.indication(&request(vec![1]), &mut Vec::new());

        let mut out = Vec::new();
        ssm.confirmation(
            Apdu::ComplexAck {
                header: ComplexAck::unsegmented(9, SERVICE),
                data: vec![0; 2400],
            },
            &mut out,
        );
        assert_eq!(ssm.core.state, SsmState::Aborted);
    }

    #[test]
    fn simple_ack_response_goes_out_unchanged() {
        let mut ssm = server(capable_peer(), Segmentation::Both);
        ssm.indication(&request(vec![1]), &mut Vec::new());

        let mut out = Vec::new();
        ssm.confirmation(
            Apdu::SimpleAck(SimpleAck {
                invoke_id: 9,
                service_choice: SERVICE,
            }),
            &mut out,
        );
        assert_eq!(ssm.core.state, SsmState::Completed);
        assert_eq!(sent(&out).len(), 1);
    }

    #[test]
    fn application_timeout_surfaces_as_server_timeout() {
        let mut ssm = server(capable_peer(), Segmentation::Both);
        ssm.indication(&request(vec![1]), &mut Vec::new());

        let mut out = Vec::new();
        ssm.handle_timeout(&mut out);
        assert_eq!(ssm.core.state, SsmState::Aborted);
        match delivered(&out)[0] {
            Apdu::Abort(AbortPdu { reason, .. }) => {
                assert_eq!(*reason, AbortReason::ServerTimeout as u8)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn response_segment_timeout_retries_then_gives_up() {
        let mut ssm = server(capable_peer(), Segmentation::Both);
        ssm.indication(&request(vec![1]), &mut Vec::new());
        ssm.confirmation(
            Apdu::ComplexAck {
                header: ComplexAck::unsegmented(9, SERVICE),
                data: vec![0; 2400],
            },
            &mut Vec::new(),
        );

        for _ in 0..3 {
            let mut out = Vec::new();
            ssm.handle_timeout(&mut out);
            assert!(!sent(&out).is_empty());
            assert_eq!(ssm.core.state, SsmState::SegmentedResponse);
        }
        let mut out = Vec::new();
        ssm.handle_timeout(&mut out);
        assert_eq!(ssm.core.state, SsmState::Aborted);
        assert!(out.is_empty());
    }

    #[test]
    fn client_abort_while_waiting_is_passed_up() {
        let mut ssm = server(capable_peer(), Segmentation::Both);
        ssm.indication(&request(vec![1]), &mut Vec::new());

        let abort = Apdu::Abort(AbortPdu {
            from_server: false,
            invoke_id: 9,
            reason: 3,
        });
        let mut out = Vec::new();
        ssm.indication(&abort, &mut out);
        assert_eq!(ssm.core.state, SsmState::Aborted);
        assert_eq!(delivered(&out), vec![&abort]);
    }
}
