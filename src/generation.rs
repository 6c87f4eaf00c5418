//! # Generation
//!
//! A [`CodedBlock`] plus the bookkeeping that decides when it is finished.
//!
//! ## Pivot ranges
//!
//! The block's `N` pivots are split between the two flows of a session:
//!
//! ```text
//!              0            N/2             N
//!              |  I -> R     |    R -> I    |
//! Initiator    |  encoder    |   decoder    |
//! Responder    |  decoder    |   encoder    |
//! Relay        |  decoder (whole range)     |
//! ```
//!
//! ## Flow states
//!
//! Each direction carries a [`FlowState`]: how many source packets exist
//! (`source_dim`), how many the receiver has decoded (`dest_dim`) and whether
//! the sender will add no more (`locked`). Endpoints own one direction as the
//! local flow and learn the other from feedback; relays only learn both.
//!
//! ```text
//! NotLocked --(encoder full | peer locked)--> Locked
//! NotDecoded --(dest_dim == source_dim)--> Decoded
//!
//! Active --(both Locked and Decoded)--> Complete --(all drained)--> Returned
//! ```
//!
//! Only Complete and Returned generations are recycled by the window.

use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::block::CodedBlock;
use crate::config::NcConfig;
use crate::error::GenerationError;
use crate::protocol::FeedbackRecord;
use crate::timer::Timer;

// =============================================================================
// Roles and flows
// =============================================================================

/// Position of this node in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Endpoint with the smaller address.
    Initiator,
    /// Endpoint with the larger address.
    Responder,
    /// Third party that re-encodes and forwards, never originates.
    Relay,
}

impl Role {
    #[inline]
    pub fn is_relay(self) -> bool {
        self == Role::Relay
    }

    /// Direction of the flow this node originates.
    pub fn local_direction(self) -> Option<Direction> {
        match self {
            Role::Initiator => Some(Direction::InitiatorToResponder),
            Role::Responder => Some(Direction::ResponderToInitiator),
            Role::Relay => None,
        }
    }
}

/// One of the two flows of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    InitiatorToResponder,
    ResponderToInitiator,
}

impl Direction {
    #[inline]
    pub fn reverse(self) -> Self {
        match self {
            Self::InitiatorToResponder => Self::ResponderToInitiator,
            Self::ResponderToInitiator => Self::InitiatorToResponder,
        }
    }

    #[inline]
    fn index(self) -> usize {
        match self {
            Self::InitiatorToResponder => 0,
            Self::ResponderToInitiator => 1,
        }
    }
}

/// Delivery state of one flow within one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowState {
    /// Source packets the sender has inserted.
    pub source_dim: u8,
    /// Packets the receiver has decoded.
    pub dest_dim: u8,
    /// The sender will insert no more packets.
    pub locked: bool,
}

impl FlowState {
    #[inline]
    pub fn is_decoded(&self) -> bool {
        self.source_dim == self.dest_dim
    }

    /// Raise dimensions and lock to at least `other`'s.
    fn merge(&mut self, other: &FlowState) {
        self.source_dim = self.source_dim.max(other.source_dim);
        self.dest_dim = self.dest_dim.max(other.dest_dim);
        self.locked |= other.locked;
    }
}

/// Per-generation traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GenerationCounters {
    pub tx_data: u32,
    pub tx_redundant: u32,
    pub tx_ack: u32,
    pub rx_data: u32,
    pub rx_ack: u32,
}

/// Timer and redundancy parameters shared by a session's generations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacing {
    /// Coded packets owed per source packet.
    pub redundancy: f64,
    pub rtx_min: Duration,
    pub rtx_max: Duration,
    pub ack_min: Duration,
    pub ack_interval: Duration,
}

impl Pacing {
    pub fn from_config(config: &NcConfig) -> Self {
        Self {
            redundancy: config.redundancy,
            rtx_min: Duration::from_millis(config.rtx_min_ms),
            rtx_max: Duration::from_millis(config.rtx_max_ms),
            ack_min: config.ack_min(),
            ack_interval: config.ack_interval(),
        }
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self::from_config(&NcConfig::default())
    }
}

/// Half-open pivot range `[min, end)` with a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PivotRange {
    min: usize,
    cursor: usize,
    end: usize,
}

impl PivotRange {
    const fn new(min: usize, end: usize) -> Self {
        Self {
            min,
            cursor: min,
            end,
        }
    }
}

/// Encoder and decoder ranges for a role in a block of `n` pivots.
fn pivot_ranges(role: Role, n: usize) -> (PivotRange, PivotRange) {
    let half = n / 2;
    match role {
        Role::Initiator => (PivotRange::new(0, half), PivotRange::new(half, n)),
        Role::Responder => (PivotRange::new(half, n), PivotRange::new(0, half)),
        Role::Relay => (PivotRange::new(0, n), PivotRange::new(0, n)),
    }
}

// =============================================================================
// Generation
// =============================================================================

/// One coded batch with its delivery state and timers.
#[derive(Debug)]
pub struct Generation {
    seq: u16,
    role: Role,
    block: CodedBlock,

    encoder: PivotRange,
    decoder: PivotRange,
    flows: [FlowState; 2],

    counters: GenerationCounters,

    // Retransmission debt: source packets owed (<= 0) plus redundant share.
    tx_src: i32,
    tx_red: f64,

    rtx: Timer,
    ack: Timer,
}

impl Generation {
    pub fn new(role: Role, seq: u16, block: CodedBlock) -> Self {
        let (encoder, decoder) = pivot_ranges(role, block.capacity());
        Self {
            seq,
            role,
            block,
            encoder,
            decoder,
            flows: [FlowState::default(); 2],
            counters: GenerationCounters::default(),
            tx_src: 0,
            tx_red: 0.0,
            rtx: Timer::new(),
            ack: Timer::new(),
        }
    }

    // =========================================================================
    // State queries
    // =========================================================================

    #[inline]
    pub fn seq(&self) -> u16 {
        self.seq
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn block(&self) -> &CodedBlock {
        &self.block
    }

    #[inline]
    pub fn counters(&self) -> &GenerationCounters {
        &self.counters
    }

    #[inline]
    pub fn flow(&self, direction: Direction) -> FlowState {
        self.flows[direction.index()]
    }

    /// Flow this node originates. `None` for relays.
    pub fn local_flow(&self) -> Option<FlowState> {
        self.role.local_direction().map(|d| self.flow(d))
    }

    /// Flow this node receives. `None` for relays.
    pub fn remote_flow(&self) -> Option<FlowState> {
        self.role.local_direction().map(|d| self.flow(d.reverse()))
    }

    fn local_mut(&mut self) -> Option<&mut FlowState> {
        let d = self.role.local_direction()?;
        Some(&mut self.flows[d.index()])
    }

    fn remote_mut(&mut self) -> Option<&mut FlowState> {
        let d = self.role.local_direction()?;
        Some(&mut self.flows[d.reverse().index()])
    }

    /// Free encoder slots. Relays never originate and report none.
    pub fn encoder_space(&self) -> usize {
        if self.role.is_relay() {
            return 0;
        }
        self.encoder.end.saturating_sub(self.encoder.cursor)
    }

    pub fn is_locked(&self) -> bool {
        self.flows.iter().all(|f| f.locked)
    }

    pub fn is_decoded(&self) -> bool {
        self.flows.iter().all(FlowState::is_decoded)
    }

    pub fn is_complete(&self) -> bool {
        self.is_locked() && self.is_decoded()
    }

    /// Every packet of the remote flow has been handed upstream.
    pub fn is_returned(&self) -> bool {
        match self.remote_flow() {
            None => true,
            Some(remote) => remote.source_dim as usize == self.decoder.cursor - self.decoder.min,
        }
    }

    /// The flows this node is responsible for pushing are decoded.
    ///
    /// Endpoints only care about their local flow, relays about both.
    pub fn is_settled(&self) -> bool {
        match self.local_flow() {
            Some(local) => local.is_decoded(),
            None => self.is_decoded(),
        }
    }

    /// Whether a retransmit timer expiry should put a frame on the air.
    pub fn needs_retransmit(&self) -> bool {
        if self.role.is_relay() {
            !self.is_decoded() && self.block.decode_rank() > 0
        } else {
            !self.is_settled()
        }
    }

    /// No further payload can be drained from this generation.
    #[inline]
    pub fn decoder_exhausted(&self) -> bool {
        self.decoder.cursor >= self.decoder.end
    }

    // =========================================================================
    // Coding
    // =========================================================================

    fn lock(&mut self) {
        if let Some(local) = self.local_mut() {
            local.locked = true;
        }
        self.encoder.end = self.encoder.cursor;
    }

    /// Insert a source packet at the encoder cursor.
    ///
    /// Locks the local flow once the encoder range is used up, and schedules
    /// the packet for transmission.
    ///
    /// # Errors
    ///
    /// [`GenerationError::InvalidRole`] for relays,
    /// [`GenerationError::Locked`] if the local flow is locked, block errors
    /// for oversized payloads.
    pub fn encoder_add(
        &mut self,
        payload: &[u8],
        index: usize,
        pacing: &Pacing,
        now: Instant,
    ) -> Result<(), GenerationError> {
        let seq = self.seq;
        let locked = self
            .local_flow()
            .ok_or(GenerationError::InvalidRole)?
            .locked;
        if locked || self.encoder.cursor >= self.encoder.end {
            return Err(GenerationError::Locked { seq });
        }

        self.block.insert(self.encoder.cursor, payload)?;
        self.encoder.cursor += 1;
        if let Some(local) = self.local_mut() {
            local.source_dim += 1;
        }
        if self.encoder.cursor >= self.encoder.end {
            self.lock();
            trace!(seq, "generation locked by encoder");
        }

        self.rtx_dec(pacing.redundancy);
        self.arm_retransmit(now, index, pacing);
        Ok(())
    }

    /// Produce the next coded frame. Endpoints send systematic rows first.
    pub fn encoder_get(&mut self, out: &mut [u8]) -> Result<usize, GenerationError> {
        let structured = !self.role.is_relay();
        Ok(self.block.encode(out, structured)?)
    }

    /// Absorb a coded data frame.
    ///
    /// Returns whether the frame was innovative. Relays take on one
    /// forwarding obligation per received frame.
    pub fn decoder_add(&mut self, payload: &[u8], pacing: &Pacing) -> Result<bool, GenerationError> {
        let innovative = self.block.decode(payload)?;
        let rank = self.block.decode_rank() as u8;
        if let Some(remote) = self.remote_mut() {
            remote.dest_dim = rank;
        }

        self.counters.rx_data += 1;
        if self.role.is_relay() {
            self.rtx_dec(pacing.redundancy);
        }
        Ok(innovative)
    }

    /// Count a received pure acknowledgement.
    #[inline]
    pub fn record_ack(&mut self) {
        self.counters.rx_ack += 1;
    }

    /// Count a sent pure acknowledgement.
    #[inline]
    pub fn record_ack_sent(&mut self) {
        self.counters.tx_ack += 1;
    }

    /// Next decoded payload in pivot order, if it is resolved.
    pub fn decoder_get(&mut self) -> Option<Bytes> {
        if self.decoder_exhausted() {
            return None;
        }
        let payload = Bytes::copy_from_slice(self.block.get(self.decoder.cursor)?);
        self.decoder.cursor += 1;
        Some(payload)
    }

    // =========================================================================
    // Feedback
    // =========================================================================

    /// This generation's state as seen by this node.
    pub fn feedback_record(&self) -> FeedbackRecord {
        FeedbackRecord {
            forward: self.flow(Direction::InitiatorToResponder),
            backward: self.flow(Direction::ResponderToInitiator),
        }
    }

    /// Merge a peer's report. Dimensions and locks only ever grow.
    ///
    /// Once the remote flow is locked its final size is known, which bounds
    /// the decoder range. When that flow is also fully decoded the local flow
    /// locks too.
    pub fn apply_feedback(&mut self, record: &FeedbackRecord) {
        self.flows[0].merge(&record.forward);
        self.flows[1].merge(&record.backward);

        let Some(remote) = self.remote_flow() else {
            return;
        };
        if remote.locked {
            self.bound_decoder(remote.source_dim);
            if remote.is_decoded() {
                self.lock();
            }
        }
    }

    fn bound_decoder(&mut self, source_dim: u8) {
        let (_, full) = pivot_ranges(self.role, self.block.capacity());
        self.decoder.end = (self.decoder.min + source_dim as usize).min(full.end);
    }

    /// Force the generation to Complete after the peer moved past it.
    ///
    /// # Errors
    ///
    /// [`GenerationError::RemoteNotDecoded`] if this endpoint has not decoded
    /// the remote flow; the peer cannot have retired a generation it still
    /// owed us, so this indicates corrupted state.
    pub fn assume_complete(&mut self) -> Result<(), GenerationError> {
        let seq = self.seq;
        let Some(direction) = self.role.local_direction() else {
            for flow in &mut self.flows {
                flow.locked = true;
                flow.dest_dim = flow.source_dim;
            }
            return Ok(());
        };

        let local = &mut self.flows[direction.index()];
        local.dest_dim = local.source_dim;
        let remote = &mut self.flows[direction.reverse().index()];
        remote.locked = true;
        let remote = *remote;
        self.bound_decoder(remote.source_dim);

        if !remote.is_decoded() {
            return Err(GenerationError::RemoteNotDecoded {
                seq,
                source_dim: remote.source_dim,
                dest_dim: remote.dest_dim,
            });
        }
        self.lock();

        if !self.is_returned() {
            debug!(seq, "generation forced complete with undelivered payloads");
        }
        Ok(())
    }

    // =========================================================================
    // Retransmission debt
    // =========================================================================

    /// Outstanding debt. Negative means frames are owed.
    #[inline]
    pub fn debt(&self) -> f64 {
        f64::from(self.tx_src) + self.tx_red
    }

    /// Owe one more source packet (endpoints) or `redundancy` coded packets
    /// (relays).
    pub fn rtx_dec(&mut self, redundancy: f64) {
        if self.debt() >= 0.0 {
            self.rtx_reset();
        }
        if self.role.is_relay() {
            self.tx_red -= redundancy;
        } else {
            self.tx_src -= 1;
            self.tx_red -= redundancy - 1.0;
        }
    }

    /// Pay off one frame: a source packet while any is owed, otherwise a
    /// redundant one.
    pub fn rtx_inc(&mut self) {
        if self.tx_src < 0 {
            self.tx_src += 1;
            self.counters.tx_data += 1;
        } else {
            self.tx_red += 1.0;
            self.counters.tx_redundant += 1;
        }
    }

    #[inline]
    pub fn rtx_reset(&mut self) {
        self.tx_src = 0;
        self.tx_red = 0.0;
    }

    /// Delay until the next retransmission.
    ///
    /// Zero while at least one whole frame is owed. Otherwise grows with the
    /// generation's position in the window and with surplus sent, capped at
    /// `rtx_max`.
    pub fn rtx_timeout(&self, index: usize, pacing: &Pacing) -> Duration {
        let debt = self.debt();
        if debt > -1.0 {
            let ms = pacing.rtx_min.as_secs_f64() * 1000.0 + index as f64 + debt + 1.0;
            let ms = ms.min(pacing.rtx_max.as_secs_f64() * 1000.0);
            Duration::from_millis(ms.max(0.0) as u64)
        } else {
            Duration::ZERO
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Schedule a retransmission, only ever moving the deadline earlier.
    ///
    /// The timer repeats at the same interval so that late polls report
    /// missed periods as overrun. A zero interval fires once.
    pub fn arm_retransmit(&mut self, now: Instant, index: usize, pacing: &Pacing) {
        let after = self.rtx_timeout(index, pacing);
        self.rtx.arm_shorten(now, after, Some(after));
    }

    /// Schedule a retransmission unconditionally.
    pub fn rearm_retransmit(&mut self, now: Instant, after: Duration) {
        self.rtx.arm(now, after, Some(after));
    }

    #[inline]
    pub fn disarm_retransmit(&mut self) {
        self.rtx.disarm();
    }

    #[inline]
    pub fn retransmit_armed(&self) -> bool {
        self.rtx.is_armed()
    }

    /// Schedule an acknowledgement unless one is pending.
    pub fn arm_ack(&mut self, now: Instant, pacing: &Pacing) {
        self.ack
            .arm_if_inactive(now, pacing.ack_min, Some(pacing.ack_interval));
    }

    #[inline]
    pub fn disarm_ack(&mut self) {
        self.ack.disarm();
    }

    #[inline]
    pub fn ack_armed(&self) -> bool {
        self.ack.is_armed()
    }

    pub fn poll_retransmit(&mut self, now: Instant) -> Option<u32> {
        self.rtx.poll(now)
    }

    pub fn poll_ack(&mut self, now: Instant) -> Option<u32> {
        self.ack.poll(now)
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.rtx.deadline(), self.ack.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Recycle in place under a new sequence number.
    pub fn reset(&mut self, seq: u16) {
        if self.tx_src > 0 {
            debug!(seq = self.seq, tx_src = self.tx_src, "positive source debt at reset");
        }
        if let Some(local) = self.local_flow() {
            if self.counters.tx_data != u32::from(local.source_dim) {
                debug!(
                    seq = self.seq,
                    tx_data = self.counters.tx_data,
                    source_dim = local.source_dim,
                    "source packets sent differ from inserted"
                );
            }
        }

        self.block.reset();
        self.seq = seq;
        self.rtx_reset();
        self.flows = [FlowState::default(); 2];
        self.counters = GenerationCounters::default();
        (self.encoder, self.decoder) = pivot_ranges(self.role, self.block.capacity());
        self.rtx.disarm();
        self.ack.disarm();
    }

    /// Dump flow state at debug level.
    pub fn log_state(&self) {
        let fwd = self.flow(Direction::InitiatorToResponder);
        let bwd = self.flow(Direction::ResponderToInitiator);
        debug!(
            seq = self.seq,
            role = ?self.role,
            ir = ?(fwd.source_dim, fwd.dest_dim, fwd.locked),
            ri = ?(bwd.source_dim, bwd.dest_dim, bwd.locked),
            encode_rank = self.block.encode_rank(),
            decode_rank = self.block.decode_rank(),
            "generation state"
        );
    }
}
