//! # Async Driver
//!
//! Runs a [`SessionRegistry`] as a tokio task. The driver owns the registry
//! and multiplexes three event sources:
//!
//! ```text
//!   radio_tx ──frames heard──▶ ┌────────────┐ ──frames to send──▶ transmit_rx
//!   app_tx ──(dst, payload)──▶ │ LinkDriver │ ──(src, payload)──▶ deliver_rx
//!                              └────────────┘
//!                                   ▲ sleep until registry.next_timeout()
//! ```
//!
//! Application payloads refused for backpressure are held and retried; the
//! application channel is not read while one is held.
//!
//! Requires the `tokio` feature.
//!
//! ## Example
//!
//! ```rust,ignore
//! use nclink::driver::LinkDriver;
//! use nclink::{HwAddr, NcConfig, SessionRegistry};
//!
//! let registry = SessionRegistry::new(HwAddr::new([2, 0, 0, 0, 0, 1]), NcConfig::default())?;
//! let (driver, handle) = LinkDriver::new(registry);
//! let task = tokio::spawn(driver.run());
//! ```

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::protocol::{HwAddr, SessionId};
use crate::registry::SessionRegistry;
use crate::session::Admission;
use crate::transport::ChannelUpstream;

/// Caller's side of a [`LinkDriver`].
#[derive(Debug)]
pub struct LinkHandle {
    /// Frames received from the radio.
    pub radio_tx: mpsc::UnboundedSender<Bytes>,
    /// Frames to put on the radio.
    pub transmit_rx: mpsc::UnboundedReceiver<Bytes>,
    /// Payloads to send, with their destination.
    pub app_tx: mpsc::UnboundedSender<(HwAddr, Bytes)>,
    /// Decoded payloads, with their source.
    pub deliver_rx: mpsc::UnboundedReceiver<(HwAddr, Bytes)>,
    /// Send or drop to stop the driver.
    pub shutdown: oneshot::Sender<()>,
}

/// Event loop around a [`SessionRegistry`].
#[derive(Debug)]
pub struct LinkDriver {
    registry: SessionRegistry,
    radio_rx: mpsc::UnboundedReceiver<Bytes>,
    app_rx: mpsc::UnboundedReceiver<(HwAddr, Bytes)>,
    shutdown: oneshot::Receiver<()>,
    upstream: ChannelUpstream,
    pending: Option<(HwAddr, Bytes)>,
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

impl LinkDriver {
    pub fn new(registry: SessionRegistry) -> (Self, LinkHandle) {
        let (radio_tx, radio_rx) = mpsc::unbounded_channel();
        let (transmit_tx, transmit_rx) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let driver = Self {
            registry,
            radio_rx,
            app_rx,
            shutdown: shutdown_rx,
            upstream: ChannelUpstream::new(transmit_tx, deliver_tx),
            pending: None,
        };
        let handle = LinkHandle {
            radio_tx,
            transmit_rx,
            app_tx,
            deliver_rx,
            shutdown: shutdown_tx,
        };
        (driver, handle)
    }

    /// Run until shutdown or until both input channels close.
    ///
    /// Returns the registry with whatever sessions are still live.
    pub async fn run(mut self) -> SessionRegistry {
        let local = self.registry.local();
        info!(%local, "link driver started");

        let mut radio_open = true;
        let mut app_open = true;

        while radio_open || app_open {
            let deadline = self.registry.next_timeout();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = &mut self.shutdown => {
                    info!(%local, "link driver shutting down");
                    break;
                }

                frame = self.radio_rx.recv(), if radio_open => match frame {
                    Some(frame) => {
                        // Errors are logged by the registry.
                        let _ = self.registry.inbound(&frame, now(), &mut self.upstream);
                    }
                    None => {
                        debug!(%local, "radio channel closed");
                        radio_open = false;
                    }
                },

                msg = self.app_rx.recv(), if app_open && self.pending.is_none() => match msg {
                    Some((dst, payload)) => self.offer(dst, payload),
                    None => {
                        debug!(%local, "application channel closed");
                        app_open = false;
                    }
                },

                _ = timer => {
                    self.registry.poll(now(), &mut self.upstream);
                }
            }

            self.retry_pending();
        }

        self.registry
    }

    fn offer(&mut self, dst: HwAddr, payload: Bytes) {
        match self.registry.outbound(dst, &payload, now(), &mut self.upstream) {
            Ok(Admission::Accepted { .. }) => {}
            Ok(Admission::Backpressure) => self.pending = Some((dst, payload)),
            Err(e) => warn!(%dst, error = %e, "payload dropped"),
        }
    }

    fn retry_pending(&mut self) {
        let Some((dst, _)) = &self.pending else {
            return;
        };
        let has_space = SessionId::new(self.registry.local(), *dst)
            .ok()
            .and_then(|id| self.registry.session(&id))
            .map_or(true, |s| s.remaining_space() > 0);
        if !has_space {
            return;
        }
        if let Some((dst, payload)) = self.pending.take() {
            self.offer(dst, payload);
        }
    }
}
