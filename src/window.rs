//! # Generation Window
//!
//! The fixed set of generations a session keeps in flight, ordered by
//! sequence number:
//!
//! ```text
//!   head                               tail
//!  ┌──────┬──────┬──────┬──────┐
//!  │ s    │ s+1  │ s+2  │ s+3  │   lseq = s
//!  └──────┴──────┴──────┴──────┘
//!     │ Complete and Returned
//!     ▼
//!  ┌──────┬──────┬──────┬──────┐
//!  │ s+1  │ s+2  │ s+3  │ s+4  │   head recycled as s+4
//!  └──────┴──────┴──────┴──────┘
//! ```
//!
//! Generations are allocated once and recycled in place; retiring the head is
//! a rotation of the ring.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::block::CodedBlock;
use crate::config::NcConfig;
use crate::error::{BlockError, GenerationError};
use crate::field::Field;
use crate::generation::{Generation, Pacing, Role};
use crate::protocol::{CodedHeader, FeedbackRecord};
use crate::stats::SessionStats;

/// Outcome of an inbound coded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// The frame's generation is live.
    Accepted { seq: u16, innovative: bool },
    /// The frame's generation is no longer, or not yet, in the window.
    Late,
}

/// Ring of generations for one session.
#[derive(Debug)]
pub struct GenerationWindow {
    role: Role,
    generations: VecDeque<Generation>,
    pacing: Pacing,
    max_sequence_distance: u16,
    stats: SessionStats,
}

impl GenerationWindow {
    /// Allocate `config.window_size` generations numbered from zero.
    pub fn new(role: Role, config: &NcConfig) -> Result<Self, BlockError> {
        let field = Field::new(config.field);
        let mut generations = VecDeque::with_capacity(config.window_size);

        for i in 0..config.window_size {
            let block = match config.rng_seed {
                Some(seed) => CodedBlock::with_seed(
                    field,
                    config.generation_size,
                    config.max_payload,
                    seed.wrapping_add(i as u64),
                )?,
                None => CodedBlock::new(field, config.generation_size, config.max_payload)?,
            };
            generations.push_back(Generation::new(role, i as u16, block));
        }

        Ok(Self {
            role,
            generations,
            pacing: Pacing::from_config(config),
            max_sequence_distance: config.max_sequence_distance,
            stats: SessionStats::new(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.generations.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
    }

    /// Sequence number of the head generation.
    #[inline]
    pub fn lseq(&self) -> u16 {
        self.generations.front().map_or(0, Generation::seq)
    }

    #[inline]
    pub fn pacing(&self) -> &Pacing {
        &self.pacing
    }

    pub fn set_redundancy(&mut self, redundancy: f64) {
        self.pacing.redundancy = redundancy;
    }

    #[inline]
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    #[inline]
    pub fn stats_mut(&mut self) -> &mut SessionStats {
        &mut self.stats
    }

    pub fn iter(&self) -> impl Iterator<Item = &Generation> {
        self.generations.iter()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Generation> {
        self.generations.get(index)
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Generation> {
        self.generations.get_mut(index)
    }

    /// Position of generation `seq` counted from the head.
    pub fn index_of(&self, seq: u16) -> Option<usize> {
        self.generations.iter().position(|g| g.seq() == seq)
    }

    pub fn find_by_sequence(&self, seq: u16) -> Option<&Generation> {
        self.generations.iter().find(|g| g.seq() == seq)
    }

    /// Free encoder slots across the window.
    pub fn remaining_space(&self) -> usize {
        self.generations.iter().map(Generation::encoder_space).sum()
    }

    // =========================================================================
    // Window movement
    // =========================================================================

    /// Retire every leading generation that is Complete and Returned.
    ///
    /// Returns the number retired. When anything moved, retransmissions of
    /// the remaining generations are rescheduled for their new positions.
    pub fn advance(&mut self, now: Instant) -> usize {
        let mut retired = 0;

        while let Some(head) = self.generations.front() {
            if !head.is_complete() || !head.is_returned() {
                break;
            }
            let next = self
                .generations
                .back()
                .map_or(0, |tail| tail.seq().wrapping_add(1));

            if let Some(mut head) = self.generations.pop_front() {
                self.stats.commit(&head);
                debug!(seq = head.seq(), next, "generation retired");
                head.reset(next);
                self.generations.push_back(head);
            }
            retired += 1;
        }

        if retired > 0 {
            let pacing = self.pacing;
            for (index, g) in self.generations.iter_mut().enumerate() {
                let reschedule = match g.role() {
                    Role::Relay => g.needs_retransmit(),
                    _ => g.needs_retransmit() && g.retransmit_armed(),
                };
                if reschedule {
                    g.arm_retransmit(now, index, &pacing);
                }
            }
        }

        retired
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Insert into the first generation with encoder space.
    ///
    /// Returns the sequence number used, or `None` when the window is full.
    pub fn encoder_add(&mut self, payload: &[u8], now: Instant) -> Result<Option<u16>, GenerationError> {
        let pacing = self.pacing;
        let Some(index) = self.generations.iter().position(|g| g.encoder_space() > 0) else {
            return Ok(None);
        };
        let g = &mut self.generations[index];
        g.encoder_add(payload, index, &pacing, now)?;
        Ok(Some(g.seq()))
    }

    /// Feedback for every generation, head first.
    ///
    /// Every outbound frame carries this, so pending acknowledgements are
    /// cancelled.
    pub fn feedback(&mut self) -> Vec<FeedbackRecord> {
        self.generations
            .iter_mut()
            .map(|g| {
                g.disarm_ack();
                g.feedback_record()
            })
            .collect()
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Merge feedback records, record `i` describing generation `lseq + i`.
    pub fn apply_feedback(&mut self, lseq: u16, records: &[FeedbackRecord]) {
        for (i, record) in records.iter().enumerate() {
            let seq = lseq.wrapping_add(i as u16);
            let Some(g) = self.generations.iter_mut().find(|g| g.seq() == seq) else {
                continue;
            };
            g.apply_feedback(record);
            if g.is_settled() {
                g.disarm_retransmit();
                g.rtx_reset();
            }
        }
    }

    /// Process the header and payload of an inbound coded frame.
    ///
    /// Generations the peer has already moved past are forced complete, the
    /// window advances, the payload is decoded into its generation and the
    /// header's feedback is merged. Decoded payloads are left for
    /// [`decoder_get`](Self::decoder_get).
    ///
    /// # Errors
    ///
    /// Block errors for malformed payloads (non-fatal), or
    /// [`GenerationError::RemoteNotDecoded`] when a skipped generation still
    /// had undecoded packets.
    pub fn handle_inbound(
        &mut self,
        header: &CodedHeader,
        payload: &[u8],
        now: Instant,
    ) -> Result<Inbound, GenerationError> {
        let pacing = self.pacing;

        let mut delta = header.lseq.wrapping_sub(self.lseq());
        if delta > self.max_sequence_distance {
            trace!(lseq = header.lseq, local = self.lseq(), delta, "implausible window distance ignored");
            delta = 0;
        }
        let skipped = (delta as usize).min(self.generations.len());
        for g in self.generations.iter_mut().take(skipped) {
            g.assume_complete()?;
        }

        self.advance(now);

        let Some(index) = self.index_of(header.seq) else {
            if !payload.is_empty() {
                if let Some(head) = self.generations.front_mut() {
                    head.arm_ack(now, &pacing);
                }
            }
            return Ok(Inbound::Late);
        };

        let innovative = {
            let g = &mut self.generations[index];
            if payload.is_empty() {
                g.record_ack();
                false
            } else {
                g.decoder_add(payload, &pacing)?
            }
        };

        self.apply_feedback(header.lseq, &header.feedback);

        if !payload.is_empty() {
            let g = &mut self.generations[index];
            match self.role {
                Role::Relay if g.is_decoded() => g.arm_ack(now, &pacing),
                Role::Relay => g.arm_retransmit(now, index, &pacing),
                _ => {
                    if g.remote_flow().is_some_and(|r| r.is_decoded()) {
                        g.arm_ack(now, &pacing);
                    }
                }
            }
        }

        Ok(Inbound::Accepted {
            seq: header.seq,
            innovative,
        })
    }

    /// Next decoded payload in order, retiring drained generations.
    pub fn decoder_get(&mut self, now: Instant) -> Option<Bytes> {
        loop {
            let head = self.generations.front_mut()?;
            if let Some(payload) = head.decoder_get() {
                return Some(payload);
            }
            if !head.decoder_exhausted() || self.advance(now) == 0 {
                return None;
            }
        }
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Earliest pending timer across the window.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.generations.iter().filter_map(Generation::next_deadline).min()
    }

    /// Dump per-generation state at debug level.
    pub fn log_state(&self) {
        for g in &self.generations {
            g.log_state();
        }
    }
}
