//! # Session Registry
//!
//! Owns every session a node takes part in, keyed by [`SessionId`]. One
//! registry exists per node; it is created at startup and torn down with
//! [`shutdown`](SessionRegistry::shutdown).
//!
//! ```text
//!   outbound(dst, payload) ──▶ SessionId(local, dst) ──▶ Session::encoder_add
//!   inbound(frame)         ──▶ CodedHeader::decode   ──▶ Session::decoder_add
//!   poll(now)              ──▶ every Session::poll, then idle expiry
//! ```
//!
//! Sessions are created on demand in both directions. A frame for a session
//! this node is not an endpoint of creates a relay session.
//!
//! A session that reports a fatal error is dropped; the rest of the registry
//! is unaffected.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use crate::config::NcConfig;
use crate::error::{ConfigError, SessionError};
use crate::protocol::{CodedHeader, HwAddr, SessionId};
use crate::session::{Admission, Session};
use crate::transport::Upstream;
use crate::window::Inbound;

/// All sessions of one node.
#[derive(Debug)]
pub struct SessionRegistry {
    local: HwAddr,
    config: NcConfig,
    sessions: HashMap<SessionId, Session>,
}

impl SessionRegistry {
    /// Create an empty registry for the node at `local`.
    ///
    /// # Errors
    ///
    /// Fails if `config` is invalid.
    pub fn new(local: HwAddr, config: NcConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        info!(%local, "session registry started");
        Ok(Self {
            local,
            config,
            sessions: HashMap::new(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    #[inline]
    pub fn local(&self) -> HwAddr {
        self.local
    }

    #[inline]
    pub fn config(&self) -> &NcConfig {
        &self.config
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn session(&self, id: &SessionId) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn session_mut(&mut self, id: &SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Remove a session without waiting for it to expire.
    pub fn remove(&mut self, id: &SessionId) -> Option<Session> {
        let session = self.sessions.remove(id)?;
        info!(session = %id, "session removed");
        Some(session)
    }

    /// Admission budget across originating sessions.
    ///
    /// The smallest free encoder space of any endpoint session, or one
    /// generation's worth when there are none.
    pub fn min_remaining_space(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| !s.role().is_relay())
            .map(Session::remaining_space)
            .min()
            .unwrap_or(self.config.generation_size)
    }

    // =========================================================================
    // Data path
    // =========================================================================

    fn get_or_create(&mut self, id: SessionId, now: Instant) -> Result<&mut Session, SessionError> {
        use std::collections::hash_map::Entry;

        match self.sessions.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let session = Session::new(id, self.local, &self.config, now)?;
                Ok(entry.insert(session))
            }
        }
    }

    /// Send an application payload to `dst`, creating the session if needed.
    ///
    /// Accepted payloads go on the air before this returns.
    ///
    /// # Errors
    ///
    /// Fails if `dst` is this node, the payload is too large, or the session
    /// breaks. A broken session is dropped.
    pub fn outbound<U: Upstream + ?Sized>(
        &mut self,
        dst: HwAddr,
        payload: &[u8],
        now: Instant,
        up: &mut U,
    ) -> Result<Admission, SessionError> {
        let id = SessionId::new(self.local, dst)?;
        let session = self.get_or_create(id, now)?;

        let result = session.encoder_add(payload, now).and_then(|admission| {
            if matches!(admission, Admission::Accepted { .. }) {
                session.poll(now, up)?;
            }
            Ok(admission)
        });
        self.settle(id, result)
    }

    /// Process a frame received from the radio.
    ///
    /// # Errors
    ///
    /// Malformed frames and frames the session rejects. A session reporting a
    /// fatal error is dropped.
    pub fn inbound<U: Upstream + ?Sized>(
        &mut self,
        frame: &[u8],
        now: Instant,
        up: &mut U,
    ) -> Result<Inbound, SessionError> {
        let (header, payload) = match CodedHeader::decode(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(len = frame.len(), error = %e, "malformed frame dropped");
                return Err(e.into());
            }
        };

        let id = header.session;
        let session = self.get_or_create(id, now)?;
        let result = session.decoder_add(&header, payload, now, up);
        self.settle(id, result)
    }

    /// Fire due timers of every session and tear down idle ones.
    ///
    /// Returns the number of sessions removed.
    pub fn poll<U: Upstream + ?Sized>(&mut self, now: Instant, up: &mut U) -> usize {
        let before = self.sessions.len();

        let mut broken = Vec::new();
        for (id, session) in &mut self.sessions {
            if let Err(e) = session.poll(now, up) {
                if e.is_fatal() {
                    broken.push(*id);
                } else {
                    warn!(session = %id, error = %e, "timer handler failed");
                }
            }
        }
        for id in broken {
            error!(session = %id, "fatal error in timer handler, session dropped");
            self.sessions.remove(&id);
        }

        self.sessions.retain(|id, session| {
            if session.is_expired(now) {
                info!(session = %id, "session expired");
                session.log_state();
                false
            } else {
                true
            }
        });

        before - self.sessions.len()
    }

    /// Earliest instant at which [`poll`](Self::poll) has work.
    pub fn next_timeout(&self) -> Option<Instant> {
        self.sessions.values().filter_map(Session::next_timeout).min()
    }

    fn settle<T>(&mut self, id: SessionId, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(session = %id, error = %e, "fatal session error, session dropped");
                if let Some(session) = self.sessions.remove(&id) {
                    session.log_state();
                }
            } else {
                debug!(session = %id, error = %e, "frame dropped");
            }
        }
        result
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn log_state(&self) {
        info!(local = %self.local, sessions = self.sessions.len(), "registry state");
        for session in self.sessions.values() {
            session.log_state();
        }
    }

    /// Drop every session.
    pub fn shutdown(&mut self) {
        for (id, session) in self.sessions.drain() {
            session.log_state();
            info!(session = %id, "session closed");
        }
    }
}
