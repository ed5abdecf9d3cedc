//! Segmentation state machines for confirmed transactions.
//!
//! [`ClientSsm`] initiates a confirmed request, [`ServerSsm`] answers one.
//! Both are pure state machines: every input (an APDU from the peer, a
//! response from the application, a timer firing) appends [`SsmAction`]s to
//! a sink, and the transaction registry turns those into wire traffic and
//! timer updates. Nothing in here does I/O.

/// Client side: initiator of a confirmed request.
pub mod client;
/// Server side: responder to a confirmed request.
pub mod server;

pub use client::ClientSsm;
pub use server::ServerSsm;

use crate::config::StackConfig;
use crate::device::DeviceInfo;
use bacip_core::address::Address;
use bacip_core::apdu::{
    AbortPdu, AbortReason, Apdu, ComplexAck, ConfirmedRequest, MaxApdu, MaxSegments,
};
use bacip_core::services::i_am::Segmentation;
use std::time::Duration;

/// Opaque identity of one state machine, used to key its timer.
pub type SsmHandle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsmState {
    Idle,
    SegmentedRequest,
    AwaitConfirmation,
    AwaitResponse,
    SegmentedResponse,
    SegmentedConfirmation,
    Completed,
    Aborted,
}

/// One effect of a state transition.
#[derive(Debug, PartialEq, Eq)]
pub enum SsmAction {
    /// Transmit to the transaction's peer.
    SendApdu(Apdu),
    /// Hand to the application layer: the final outcome on the client side,
    /// the reassembled request (or an abort) on the server side.
    Deliver(Apdu),
    /// (Re)arm the transaction's single timer.
    StartTimer(Duration),
}

/// Local policy for one transaction, frozen at creation so a configuration
/// change cannot skew a transaction midway.
#[derive(Debug, Clone)]
pub struct SsmPolicy {
    pub retries: u8,
    pub retry_timeout: Duration,
    pub segment_timeout: Duration,
    pub application_timeout: Duration,
    pub segmentation: Segmentation,
    pub max_apdu_length: usize,
    /// Segment count we accept in a response, and the window size we propose.
    pub window_size: u8,
}

impl SsmPolicy {
    pub fn from_config(cfg: &StackConfig) -> Self {
        Self {
            retries: cfg.number_of_apdu_retries,
            retry_timeout: cfg.apdu_timeout,
            segment_timeout: cfg.apdu_segment_timeout,
            application_timeout: cfg.application_timeout,
            segmentation: cfg.segmentation_supported,
            max_apdu_length: cfg.max_apdu_length_accepted,
            window_size: cfg.proposed_window_size(),
        }
    }
}

/// Which of the two segmentable APDU types the working buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentKind {
    Request,
    Response,
}

/// State shared by both machine flavors: the working APDU, the window
/// bookkeeping, and the per-transaction snapshots of local policy and peer
/// capability.
#[derive(Debug)]
pub struct SsmCore {
    pub handle: SsmHandle,
    pub peer: Address,
    pub peer_info: DeviceInfo,
    pub invoke_id: u8,
    pub state: SsmState,
    pub(crate) policy: SsmPolicy,
    pub(crate) kind: SegmentKind,
    pub(crate) service_choice: u8,
    pub(crate) segment_data: Vec<u8>,
    pub(crate) segment_size: usize,
    pub(crate) segment_count: u32,
    pub(crate) sent_all_segments: bool,
    pub(crate) last_sequence_number: u8,
    pub(crate) initial_sequence_number: u8,
    pub(crate) actual_window_size: u8,
    pub(crate) proposed_window_size: u8,
    pub(crate) segment_retry_count: u8,
}

impl SsmCore {
    pub(crate) fn new(
        handle: SsmHandle,
        peer: Address,
        peer_info: DeviceInfo,
        invoke_id: u8,
        policy: SsmPolicy,
    ) -> Self {
        let proposed = policy.window_size.max(1);
        Self {
            handle,
            peer,
            peer_info,
            invoke_id,
            state: SsmState::Idle,
            policy,
            kind: SegmentKind::Request,
            service_choice: 0,
            segment_data: Vec::new(),
            segment_size: 0,
            segment_count: 0,
            sent_all_segments: false,
            last_sequence_number: 0,
            initial_sequence_number: 0,
            actual_window_size: 1,
            proposed_window_size: proposed,
            segment_retry_count: 0,
        }
    }

    pub fn finished(&self) -> bool {
        matches!(self.state, SsmState::Completed | SsmState::Aborted)
    }

    pub(crate) fn set_segmentation_context(
        &mut self,
        kind: SegmentKind,
        service_choice: u8,
        data: Vec<u8>,
    ) {
        self.kind = kind;
        self.service_choice = service_choice;
        self.segment_data = data;
    }

    pub(crate) fn append_segment(&mut self, data: &[u8]) {
        self.segment_data.extend_from_slice(data);
    }

    /// Segment count for the current context and segment size.
    pub(crate) fn compute_segment_count(&mut self) {
        self.segment_count = if self.segment_data.is_empty() {
            1
        } else {
            self.segment_data.len().div_ceil(self.segment_size) as u32
        };
    }

    pub(crate) fn is_segmented(&self) -> bool {
        self.segment_count > 1
    }

    /// `seq` counts as acknowledged progress iff it falls inside the current
    /// window, starting at `initial_sequence_number`, modulo 256.
    pub(crate) fn in_window(&self, seq: u8) -> bool {
        let offset = seq.wrapping_sub(self.initial_sequence_number);
        u32::from(offset) < u32::from(self.actual_window_size)
    }

    /// Build the APDU for segment `index` of the working buffer.
    pub(crate) fn get_segment(&self, index: u32) -> Apdu {
        debug_assert!(index < self.segment_count.max(1));
        let segmented = self.is_segmented();
        let more_follows = index + 1 < self.segment_count;
        let sequence_number = segmented.then_some((index % 256) as u8);
        let window_size = segmented.then_some(if index == 0 {
            self.proposed_window_size
        } else {
            self.actual_window_size
        });

        let offset = index as usize * self.segment_size;
        let end = (offset + self.segment_size).min(self.segment_data.len());
        let data = self.segment_data[offset.min(end)..end].to_vec();

        match self.kind {
            SegmentKind::Request => Apdu::ConfirmedRequest {
                header: ConfirmedRequest {
                    segmented,
                    more_follows,
                    segmented_response_accepted: self.policy.segmentation.can_receive(),
                    max_segments: MaxSegments::from_count(u32::from(self.policy.window_size)),
                    max_apdu: MaxApdu::fitting(self.policy.max_apdu_length),
                    invoke_id: self.invoke_id,
                    sequence_number,
                    window_size,
                    service_choice: self.service_choice,
                },
                data,
            },
            SegmentKind::Response => Apdu::ComplexAck {
                header: ComplexAck {
                    segmented,
                    more_follows,
                    invoke_id: self.invoke_id,
                    sequence_number,
                    window_size,
                    service_choice: self.service_choice,
                },
                data,
            },
        }
    }

    /// Transmit up to a window of segments starting at `start_seq`, flagging
    /// completion when the last one goes out.
    pub(crate) fn fill_window(&mut self, start_seq: u8, out: &mut Vec<SsmAction>) {
        for ix in 0..u32::from(self.actual_window_size) {
            let index = u32::from(start_seq) + ix;
            if index >= self.segment_count {
                break;
            }
            let apdu = self.get_segment(index);
            let last = index + 1 == self.segment_count;
            out.push(SsmAction::SendApdu(apdu));
            if last {
                self.sent_all_segments = true;
                break;
            }
        }
    }

    /// Transition into `Aborted` and produce the abort PDU to account for it.
    pub(crate) fn make_abort(&mut self, from_server: bool, reason: AbortReason) -> Apdu {
        self.state = SsmState::Aborted;
        Apdu::Abort(AbortPdu {
            from_server,
            invoke_id: self.invoke_id,
            reason: reason as u8,
        })
    }
}
