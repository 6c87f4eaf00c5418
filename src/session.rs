//! # Session
//!
//! A session couples one [`GenerationWindow`] to a pair of endpoints and turns
//! window state into frames:
//!
//! ```text
//!   application ──encoder_add──▶ ┌─────────┐ ──transmit──▶ radio
//!                                │ Session │
//!   application ◀──deliver────── └─────────┘ ◀─decoder_add── radio
//!                                     ▲
//!                                   poll(now)
//!                          retransmit / ack / expiry timers
//! ```
//!
//! The session is driven entirely by its caller: inbound frames, application
//! payloads and [`poll`](Session::poll) calls. Nothing runs in the background.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use tracing::{debug, error, info, trace, warn};

use crate::config::NcConfig;
use crate::error::{GenerationError, SessionError};
use crate::field::FieldType;
use crate::generation::Role;
use crate::protocol::{CodedHeader, HwAddr, SessionId};
use crate::stats::SessionStats;
use crate::timer::Timer;
use crate::transport::Upstream;
use crate::window::{GenerationWindow, Inbound};

/// Result of offering a payload to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Inserted into generation `seq`.
    Accepted { seq: u16 },
    /// Every generation in the window is full. The payload was not taken.
    Backpressure,
}

/// One coded conversation between two endpoints, seen from one node.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    role: Role,
    peer: Option<HwAddr>,
    field: FieldType,
    window: GenerationWindow,

    expiry: Timer,
    idle_timeout: Duration,
    max_rtx_burst: u32,

    /// Scratch row for encoder output.
    row: Vec<u8>,
}

impl Session {
    /// Create the session `id` as seen by the node at `local`.
    ///
    /// The role follows from where `local` sits in the id; a node that is
    /// neither endpoint relays.
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid.
    pub fn new(id: SessionId, local: HwAddr, config: &NcConfig, now: Instant) -> Result<Self, SessionError> {
        config.validate()?;
        let role = id.role_for(local);
        let window = GenerationWindow::new(role, config)?;
        let row_len = window.get(0).map_or(0, |g| g.block().row_len());

        let mut expiry = Timer::new();
        expiry.arm(now, config.session_timeout(), None);

        info!(session = %id, ?role, "session created");

        Ok(Self {
            id,
            role,
            peer: id.peer_of(local),
            field: config.field,
            window,
            expiry,
            idle_timeout: config.session_timeout(),
            max_rtx_burst: config.max_rtx_burst,
            row: vec![0u8; row_len],
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// The other endpoint, `None` for relays.
    #[inline]
    pub fn peer(&self) -> Option<HwAddr> {
        self.peer
    }

    #[inline]
    pub fn window(&self) -> &GenerationWindow {
        &self.window
    }

    #[inline]
    pub fn stats(&self) -> &SessionStats {
        self.window.stats()
    }

    /// Free encoder slots; gates application admission.
    #[inline]
    pub fn remaining_space(&self) -> usize {
        self.window.remaining_space()
    }

    #[inline]
    pub fn redundancy(&self) -> f64 {
        self.window.pacing().redundancy
    }

    /// Change the redundancy target for packets inserted from now on.
    pub fn set_redundancy(&mut self, redundancy: f64) {
        debug!(session = %self.id, redundancy, "redundancy updated");
        self.window.set_redundancy(redundancy);
    }

    // =========================================================================
    // Data path
    // =========================================================================

    /// Offer an application payload.
    ///
    /// The payload is scheduled for immediate transmission; the frame leaves
    /// on the next [`poll`](Self::poll).
    ///
    /// # Errors
    ///
    /// [`GenerationError::InvalidRole`] on relays, block errors for oversized
    /// payloads.
    pub fn encoder_add(&mut self, payload: &[u8], now: Instant) -> Result<Admission, SessionError> {
        if self.role.is_relay() {
            return Err(GenerationError::InvalidRole.into());
        }

        match self.window.encoder_add(payload, now)? {
            Some(seq) => {
                trace!(session = %self.id, seq, len = payload.len(), "payload admitted");
                self.touch(now);
                Ok(Admission::Accepted { seq })
            }
            None => {
                warn!(session = %self.id, lseq = self.window.lseq(), "window full, payload refused");
                Ok(Admission::Backpressure)
            }
        }
    }

    /// Process an inbound coded frame already split into header and payload.
    ///
    /// Endpoints hand every payload that became deliverable to `up` in order.
    ///
    /// # Errors
    ///
    /// [`SessionError::FieldMismatch`] if the header names another field.
    /// Errors from the window; see [`SessionError::is_fatal`].
    pub fn decoder_add<U: Upstream + ?Sized>(
        &mut self,
        header: &CodedHeader,
        payload: &[u8],
        now: Instant,
        up: &mut U,
    ) -> Result<Inbound, SessionError> {
        if header.field != self.field {
            return Err(SessionError::FieldMismatch {
                expected: self.field,
                got: header.field,
            });
        }
        self.touch(now);

        trace!(
            session = %self.id,
            seq = header.seq,
            lseq = header.lseq,
            len = payload.len(),
            "coded frame received"
        );

        let result = self.window.handle_inbound(header, payload, now)?;
        if result == Inbound::Late {
            let stats = self.window.stats_mut();
            if payload.is_empty() {
                stats.on_late_ack();
            } else {
                stats.on_late_data();
            }
            trace!(session = %self.id, seq = header.seq, "frame for retired generation");
        }

        if let Some(peer) = self.peer {
            while let Some(decoded) = self.window.decoder_get(now) {
                up.deliver(peer, decoded);
            }
        }

        Ok(result)
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Fire every timer that is due at `now`.
    ///
    /// # Errors
    ///
    /// Fails if a coded frame cannot be produced.
    pub fn poll<U: Upstream + ?Sized>(&mut self, now: Instant, up: &mut U) -> Result<(), SessionError> {
        for index in 0..self.window.len() {
            let Some(g) = self.window.get_mut(index) else {
                break;
            };
            if let Some(overrun) = g.poll_retransmit(now) {
                self.on_retransmit(index, overrun, now, up)?;
            }

            let Some(g) = self.window.get_mut(index) else {
                break;
            };
            if g.poll_ack(now).is_some() {
                self.on_ack(index, now, up)?;
            }
        }
        Ok(())
    }

    /// Earliest instant at which [`poll`](Self::poll) has work.
    pub fn next_timeout(&self) -> Option<Instant> {
        match (self.window.next_deadline(), self.expiry.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// No traffic in either direction for the idle timeout.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expiry.deadline().map_or(true, |deadline| now >= deadline)
    }

    fn touch(&mut self, now: Instant) {
        self.expiry.arm(now, self.idle_timeout, None);
    }

    fn on_retransmit<U: Upstream + ?Sized>(
        &mut self,
        index: usize,
        overrun: u32,
        now: Instant,
        up: &mut U,
    ) -> Result<(), SessionError> {
        let pacing = *self.window.pacing();
        match self.window.get_mut(index) {
            Some(g) if g.needs_retransmit() => {}
            Some(g) => {
                g.disarm_retransmit();
                return Ok(());
            }
            None => return Ok(()),
        }

        if overrun > 0 {
            error!(session = %self.id, index, overrun, "retransmit timer overrun");
        }

        let mut remaining = overrun;
        let mut sent = 0u32;
        let timeout = loop {
            self.send_frame(index, true, now, up)?;
            let Some(g) = self.window.get_mut(index) else {
                return Ok(());
            };
            g.rtx_inc();
            sent += 1;

            let timeout = g.rtx_timeout(index, &pacing);
            let more = if timeout < pacing.rtx_min {
                true
            } else if remaining > 0 {
                remaining -= 1;
                true
            } else {
                false
            };
            if !more || sent >= self.max_rtx_burst {
                break timeout;
            }
        };

        if let Some(g) = self.window.get_mut(index) {
            trace!(seq = g.seq(), sent, debt = g.debt(), ?timeout, "retransmit burst");
            g.rearm_retransmit(now, timeout);
            g.disarm_ack();
        }
        Ok(())
    }

    fn on_ack<U: Upstream + ?Sized>(
        &mut self,
        index: usize,
        now: Instant,
        up: &mut U,
    ) -> Result<(), SessionError> {
        self.send_frame(index, false, now, up)?;
        if let Some(g) = self.window.get_mut(index) {
            g.record_ack_sent();
            g.disarm_ack();
        }
        Ok(())
    }

    /// Build and transmit a frame for the generation at `index`, carrying a
    /// coded row or, for acknowledgements, feedback only.
    fn send_frame<U: Upstream + ?Sized>(
        &mut self,
        index: usize,
        with_payload: bool,
        now: Instant,
        up: &mut U,
    ) -> Result<(), SessionError> {
        let Some(g) = self.window.get_mut(index) else {
            return Ok(());
        };
        let seq = g.seq();
        let len = if with_payload {
            g.encoder_get(&mut self.row)?
        } else {
            0
        };

        let header = CodedHeader {
            session: self.id,
            field: self.field,
            seq,
            lseq: self.window.lseq(),
            feedback: self.window.feedback(),
        };

        let mut frame = BytesMut::with_capacity(header.encoded_len() + len);
        header.encode(&mut frame)?;
        frame.extend_from_slice(&self.row[..len]);

        trace!(session = %self.id, seq, len, "coded frame sent");
        up.transmit(frame.freeze());
        self.touch(now);
        Ok(())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    /// Log session totals and per-generation state.
    pub fn log_state(&self) {
        let s = self.stats();
        info!(
            session = %self.id,
            role = ?self.role,
            lseq = self.window.lseq(),
            generations = s.generations,
            tx_data = s.per_generation(s.tx_data),
            tx_redundant = s.per_generation(s.tx_redundant),
            tx_ack = s.per_generation(s.tx_ack),
            rx_data = s.per_generation(s.rx_data),
            rx_ack = s.per_generation(s.rx_ack),
            rx_late_data = s.rx_late_data,
            rx_late_ack = s.rx_late_ack,
            rx_excess_data = s.rx_excess_data,
            "session state (per generation averages)"
        );
        self.window.log_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryUpstream;

    const A: HwAddr = HwAddr::new([2, 0, 0, 0, 0, 1]);
    const B: HwAddr = HwAddr::new([2, 0, 0, 0, 0, 2]);
    const R: HwAddr = HwAddr::new([2, 0, 0, 0, 0, 3]);

    fn config() -> NcConfig {
        NcConfig {
            generation_size: 4,
            window_size: 2,
            max_payload: 64,
            rng_seed: Some(7),
            ..NcConfig::default()
        }
    }

    fn pair(now: Instant) -> (Session, Session) {
        let id = SessionId::new(A, B).unwrap();
        let a = Session::new(id, A, &config(), now).unwrap();
        let b = Session::new(id, B, &config(), now).unwrap();
        (a, b)
    }

    /// Feed every frame `from` has queued to `to`.
    fn relay_frames(from: &mut MemoryUpstream, to: &mut Session, now: Instant, up: &mut MemoryUpstream) {
        for frame in from.take_transmitted() {
            let (header, payload) = CodedHeader::decode(&frame).unwrap();
            to.decoder_add(&header, payload, now, up).unwrap();
        }
    }

    #[test]
    fn test_roles_from_addresses() {
        let now = Instant::now();
        let (a, b) = pair(now);
        assert_eq!(a.role(), Role::Initiator);
        assert_eq!(b.role(), Role::Responder);
        assert_eq!(a.peer(), Some(B));
        assert_eq!(b.peer(), Some(A));

        let relay = Session::new(a.id(), R, &config(), now).unwrap();
        assert_eq!(relay.role(), Role::Relay);
        assert_eq!(relay.peer(), None);
        assert_eq!(relay.remaining_space(), 0);
    }

    #[test]
    fn test_relay_refuses_payloads() {
        let now = Instant::now();
        let id = SessionId::new(A, B).unwrap();
        let mut relay = Session::new(id, R, &config(), now).unwrap();
        let err = relay.encoder_add(b"x", now).unwrap_err();
        assert_eq!(err, SessionError::Generation(GenerationError::InvalidRole));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_admission_and_backpressure() {
        let now = Instant::now();
        let (mut a, _) = pair(now);
        // Two generations of two source slots each.
        assert_eq!(a.remaining_space(), 4);
        assert_eq!(a.encoder_add(b"0", now).unwrap(), Admission::Accepted { seq: 0 });
        assert_eq!(a.encoder_add(b"1", now).unwrap(), Admission::Accepted { seq: 0 });
        assert_eq!(a.encoder_add(b"2", now).unwrap(), Admission::Accepted { seq: 1 });
        assert_eq!(a.encoder_add(b"3", now).unwrap(), Admission::Accepted { seq: 1 });
        assert_eq!(a.encoder_add(b"4", now).unwrap(), Admission::Backpressure);
        assert_eq!(a.remaining_space(), 0);
    }

    #[test]
    fn test_oversized_payload_is_not_fatal() {
        let now = Instant::now();
        let (mut a, _) = pair(now);
        let err = a.encoder_add(&[0u8; 65], now).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(a.remaining_space(), 4);
    }

    #[test]
    fn test_payload_sent_on_next_poll() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        let mut up_a = MemoryUpstream::new();
        let mut up_b = MemoryUpstream::new();

        a.encoder_add(b"hello", now).unwrap();
        assert_eq!(a.next_timeout(), Some(now));
        a.poll(now, &mut up_a).unwrap();
        assert_eq!(up_a.transmitted.len(), 1);
        assert_eq!(a.stats().tx_data, 0, "committed only on retirement");

        relay_frames(&mut up_a, &mut b, now, &mut up_b);
        assert_eq!(up_b.take_delivered(), vec![(A, bytes::Bytes::from_static(b"hello"))]);
    }

    #[test]
    fn test_ack_after_decode() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        let mut up_a = MemoryUpstream::new();
        let mut up_b = MemoryUpstream::new();

        a.encoder_add(b"x", now).unwrap();
        a.poll(now, &mut up_a).unwrap();
        relay_frames(&mut up_a, &mut b, now, &mut up_b);

        // Responder decoded the flow and acknowledges after ack_min.
        b.poll(now, &mut up_b).unwrap();
        assert!(up_b.transmitted.is_empty());
        let later = now + Duration::from_millis(1);
        b.poll(later, &mut up_b).unwrap();
        let frames = up_b.take_transmitted();
        assert_eq!(frames.len(), 1);
        let (header, payload) = CodedHeader::decode(&frames[0]).unwrap();
        assert!(payload.is_empty());
        assert_eq!(header.feedback[0].forward.dest_dim, 1);

        // The initiator stops retransmitting once it sees the ack.
        a.decoder_add(&header, payload, later, &mut up_a).unwrap();
        let g = a.window().get(0).unwrap();
        assert!(g.is_settled());
        assert!(!g.retransmit_armed());
    }

    #[test]
    fn test_redundant_retransmit_until_acked() {
        let now = Instant::now();
        let (mut a, _) = pair(now);
        let mut up = MemoryUpstream::new();

        a.encoder_add(b"x", now).unwrap();
        a.poll(now, &mut up).unwrap();
        assert_eq!(up.take_transmitted().len(), 1);

        // Debt paid: next send is redundant, min + index + 1 ms later.
        let next = a.next_timeout().unwrap();
        assert_eq!(next, now + Duration::from_millis(11));
        a.poll(next, &mut up).unwrap();
        assert_eq!(up.take_transmitted().len(), 1);
        assert_eq!(a.window().get(0).unwrap().counters().tx_redundant, 1);

        // Surplus pushes the interval out by a millisecond per frame.
        assert_eq!(a.next_timeout().unwrap(), next + Duration::from_millis(12));
    }

    #[test]
    fn test_overrun_sends_extra_frames() {
        let now = Instant::now();
        let (mut a, _) = pair(now);
        let mut up = MemoryUpstream::new();

        a.encoder_add(b"x", now).unwrap();
        a.poll(now, &mut up).unwrap();
        up.take_transmitted();

        // Three intervals late: two overruns on top of the regular frame.
        let late = now + Duration::from_millis(11 * 3);
        a.poll(late, &mut up).unwrap();
        assert_eq!(up.take_transmitted().len(), 3);
    }

    #[test]
    fn test_overrun_clamped_by_burst_limit() {
        let now = Instant::now();
        let id = SessionId::new(A, B).unwrap();
        let cfg = NcConfig {
            max_rtx_burst: 2,
            ..config()
        };
        let mut a = Session::new(id, A, &cfg, now).unwrap();
        let mut up = MemoryUpstream::new();

        a.encoder_add(b"x", now).unwrap();
        a.poll(now, &mut up).unwrap();
        up.take_transmitted();

        a.poll(now + Duration::from_secs(1), &mut up).unwrap();
        assert_eq!(up.take_transmitted().len(), 2);
    }

    #[test]
    fn test_field_mismatch_rejected() {
        let now = Instant::now();
        let (mut a, mut b) = pair(now);
        let mut up = MemoryUpstream::new();

        a.encoder_add(b"x", now).unwrap();
        a.poll(now, &mut up).unwrap();
        let frame = up.take_transmitted().remove(0);
        let (mut header, payload) = CodedHeader::decode(&frame).unwrap();
        header.field = FieldType::Gf16;

        let err = b.decoder_add(&header, payload, now, &mut up).unwrap_err();
        assert!(matches!(err, SessionError::FieldMismatch { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_late_frames_counted() {
        let now = Instant::now();
        let (_, mut b) = pair(now);
        let mut up = MemoryUpstream::new();

        let header = CodedHeader {
            session: b.id(),
            field: FieldType::Gf256,
            seq: 40,
            lseq: 0,
            feedback: vec![Default::default(); 2],
        };
        assert_eq!(b.decoder_add(&header, b"junk", now, &mut up).unwrap(), Inbound::Late);
        assert_eq!(b.decoder_add(&header, &[], now, &mut up).unwrap(), Inbound::Late);
        assert_eq!(b.stats().rx_late_data, 1);
        assert_eq!(b.stats().rx_late_ack, 1);
    }

    #[test]
    fn test_idle_expiry() {
        let now = Instant::now();
        let (mut a, _) = pair(now);
        let timeout = config().session_timeout();

        assert!(!a.is_expired(now + timeout - Duration::from_millis(1)));
        assert!(a.is_expired(now + timeout));

        // Activity pushes the deadline out.
        let later = now + Duration::from_secs(30);
        a.encoder_add(b"x", later).unwrap();
        assert!(!a.is_expired(now + timeout));
        assert!(a.is_expired(later + timeout));
    }

    #[test]
    fn test_set_redundancy() {
        let now = Instant::now();
        let (mut a, _) = pair(now);
        assert_eq!(a.redundancy(), 1.0);
        a.set_redundancy(2.0);
        assert_eq!(a.redundancy(), 2.0);

        // One source packet now owes a redundant one as well.
        a.encoder_add(b"x", now).unwrap();
        assert_eq!(a.window().get(0).unwrap().debt(), -2.0);
    }
}
