use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::bail;
use tracing::{debug, trace, warn};

use crate::config::LinkConfig;
use crate::flow_control::{decode_reason, flow_control_frame, FlowControlReason};
use crate::frame::{Direction, Frame, FLOW_CONTROL_OPCODE, MAX_PAYLOAD_LEN};
use crate::fragment::split;
use crate::slot_pool::SlotPool;

/// Number of recently sent data frames the initiator keeps for retransmission
///  after the peer announces a problem.
const RETRANSMIT_DEPTH: usize = 2;

/// The two ends of a link are not symmetric: the initiator drives recovery
///  (retransmission, presumed-dead escalation), the responder only ever reacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Initiator,
    Responder,
}

/// What happened to one received frame. Everything except `Accepted` leaves the
///  receive queue untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// The frame sits in the receive queue, ready for reassembly.
    Accepted,
    /// A keepalive; carries no content.
    FlowControlNop,
    /// The one stale in-flight frame after a self-initiated reset.
    DroppedResetWindow,
    /// Phase mismatch: the peer retransmitted something already accepted.
    DuplicateSuppressed,
    /// The link reset, either self-initiated (to be announced) or following a
    ///  peer announcement.
    Reset(FlowControlReason),
    /// Too many consecutive corruption events: the peer is presumed dead or
    ///  rebooted and everything including the retransmit cache was dropped.
    PeerPresumedDead,
}

/// One end of the frame link: the transmit and receive slot pools, the phase
///  tracking on both, and the reset bookkeeping. Fully synchronous; one
///  `next_frame` plus one `receive` per tick make up the frame exchange.
pub struct Link {
    config: Arc<LinkConfig>,
    role: LinkRole,
    tx: SlotPool,
    rx: SlotPool,
    /// Set between a self-initiated reset and the next received frame, which is
    ///  the stale one still in flight and gets dropped.
    resetting: bool,
    /// Reason still to be announced to the peer after a self-initiated reset.
    announce: Option<FlowControlReason>,
    /// Last data frames sent, initiator only.
    retransmit_cache: VecDeque<Frame>,
    /// Cached frames scheduled for resending after a peer announcement.
    pending_retransmit: VecDeque<Frame>,
    corruption_run: u32,
}

impl Link {
    pub fn new(config: Arc<LinkConfig>, role: LinkRole) -> Link {
        let slot_count = config.slot_count;
        Link {
            config,
            role,
            tx: SlotPool::new(slot_count),
            rx: SlotPool::new(slot_count),
            resetting: false,
            announce: None,
            retransmit_cache: VecDeque::with_capacity(RETRANSMIT_DEPTH),
            pending_retransmit: VecDeque::with_capacity(RETRANSMIT_DEPTH),
            corruption_run: 0,
        }
    }

    /// Queue a message for transmission, splitting it into frames. Either the
    ///  whole message is queued or nothing is: a message that does not fit into
    ///  the free transmit slots right now is rejected, and the caller retries
    ///  on a later tick.
    pub fn enqueue(&mut self, opcode: u8, dir: Direction, payload: &[u8]) -> anyhow::Result<()> {
        if opcode == FLOW_CONTROL_OPCODE {
            bail!("opcode {} is reserved for flow control", FLOW_CONTROL_OPCODE);
        }
        let frames_needed = payload.len().div_ceil(MAX_PAYLOAD_LEN).max(1);
        if self.tx.free_count() < frames_needed {
            bail!("transmit pool has {} free slots, message of {} bytes needs {}", self.tx.free_count(), payload.len(), frames_needed);
        }

        split(opcode, dir, payload, |frame| {
            let slot = self.tx.acquire()
                .expect("free slots were counted before splitting");
            *self.tx.frame_mut(slot) = frame;
            self.tx.enqueue(slot)
        })
    }

    /// The frame to put on the wire this tick. The link never goes quiet: with
    ///  nothing to announce, retransmit or send, it emits a NOP keepalive. Every
    ///  outgoing frame is phase-stamped here, retransmitted ones included.
    pub fn next_frame(&mut self) -> Frame {
        let mut frame = if let Some(reason) = self.announce.take() {
            debug!("announcing {:?} to the peer", reason);
            flow_control_frame(reason)
        }
        else if let Some(cached) = self.pending_retransmit.pop_front() {
            debug!("retransmitting cached frame for opcode {}", cached.opcode());
            cached
        }
        else if let Some(queued) = self.tx.pop_queued() {
            if self.role == LinkRole::Initiator {
                if self.retransmit_cache.len() == RETRANSMIT_DEPTH {
                    self.retransmit_cache.pop_front();
                }
                self.retransmit_cache.push_back(queued);
            }
            queued
        }
        else {
            flow_control_frame(FlowControlReason::Nop)
        };

        frame.set_phase(self.tx.phase_switch());
        trace!("sending {:?}", frame);
        frame
    }

    /// Run one received frame through the protocol checks, in order: reset
    ///  window, validation, flow control, duplicate suppression, receive-pool
    ///  admission.
    pub fn receive(&mut self, frame: &Frame) -> ReceiveOutcome {
        if self.resetting {
            self.resetting = false;
            // the peer restarts its phase sequence once it sees the announcement
            self.rx.set_phase(false);
            debug!("dropping the in-flight frame of the reset window");
            return ReceiveOutcome::DroppedResetWindow;
        }

        if let Err(e) = frame.validate() {
            warn!("received corrupt frame: {}", e);
            return self.on_corruption();
        }

        if frame.opcode() == FLOW_CONTROL_OPCODE {
            return match decode_reason(frame) {
                Err(e) => {
                    warn!("received malformed flow-control frame: {}", e);
                    self.on_corruption()
                }
                Ok(FlowControlReason::Nop) => {
                    if frame.phase() != self.rx.phase() {
                        self.rx.set_phase(!frame.phase());
                        return ReceiveOutcome::DuplicateSuppressed;
                    }
                    self.rx.phase_switch();
                    self.corruption_run = 0;
                    ReceiveOutcome::FlowControlNop
                }
                Ok(reason) => self.on_peer_reset(reason, frame),
            };
        }

        if frame.phase() != self.rx.phase() {
            debug!("suppressing duplicate {:?}: expected phase {}", frame, self.rx.phase());
            self.rx.set_phase(!frame.phase());
            return ReceiveOutcome::DuplicateSuppressed;
        }

        match self.rx.acquire() {
            None => {
                warn!("receive pool exhausted, resetting");
                self.reset_announcing(FlowControlReason::Overflow);
                ReceiveOutcome::Reset(FlowControlReason::Overflow)
            }
            Some(slot) => {
                *self.rx.frame_mut(slot) = *frame;
                self.rx.enqueue(slot)
                    .expect("slot was acquired in this very call");
                self.rx.phase_switch();
                self.corruption_run = 0;
                ReceiveOutcome::Accepted
            }
        }
    }

    /// The next accepted frame, in receive order.
    pub fn pop_received(&mut self) -> Option<Frame> {
        self.rx.pop_queued()
    }

    /// Reset because the layer above rejected reassembled content. Announced to
    ///  the peer like any self-detected problem.
    pub fn reset_bad_content(&mut self) {
        self.reset_announcing(FlowControlReason::BadContent);
    }

    /// Drop everything, the retransmit cache and corruption bookkeeping
    ///  included. Fired when the peer is presumed dead; the link starts over as
    ///  if freshly constructed.
    pub fn total_reset(&mut self) {
        self.clear_pools();
        self.resetting = false;
        self.announce = None;
        self.retransmit_cache.clear();
        self.pending_retransmit.clear();
        self.corruption_run = 0;
    }

    fn on_corruption(&mut self) -> ReceiveOutcome {
        self.corruption_run += 1;
        if self.role == LinkRole::Initiator && self.corruption_run > self.config.corruption_reset_threshold {
            warn!("{} consecutive corruption events, presuming the peer dead", self.corruption_run);
            self.total_reset();
            return ReceiveOutcome::PeerPresumedDead;
        }
        self.reset_announcing(FlowControlReason::Corruption);
        ReceiveOutcome::Reset(FlowControlReason::Corruption)
    }

    /// The peer announced a problem and already reset on its side, so no
    ///  re-announcement and no reset window here. The initiator schedules its
    ///  cached frames for resending when the problem was transient line
    ///  corruption; for anything else the sessions above recover by timeout.
    fn on_peer_reset(&mut self, reason: FlowControlReason, frame: &Frame) -> ReceiveOutcome {
        debug!("peer announced {:?}, resetting", reason);
        if reason == FlowControlReason::Corruption {
            self.corruption_run += 1;
            if self.role == LinkRole::Initiator && self.corruption_run > self.config.corruption_reset_threshold {
                warn!("{} consecutive corruption events, presuming the peer dead", self.corruption_run);
                self.total_reset();
                return ReceiveOutcome::PeerPresumedDead;
            }
        }

        self.clear_pools();
        self.resetting = false;
        self.announce = None;
        // the announcement itself consumed a phase of the peer's restarted sequence
        self.rx.set_phase(!frame.phase());

        if self.role == LinkRole::Initiator && reason == FlowControlReason::Corruption {
            self.pending_retransmit = self.retransmit_cache.iter().copied().collect();
        }
        ReceiveOutcome::Reset(reason)
    }

    fn reset_announcing(&mut self, reason: FlowControlReason) {
        debug!("link reset: {:?}", reason);
        self.clear_pools();
        self.resetting = true;
        self.announce = Some(reason);
    }

    fn clear_pools(&mut self) {
        self.tx.clear();
        self.rx.clear();
        self.tx.set_phase(false);
        self.rx.set_phase(false);
        self.pending_retransmit.clear();
    }
}
