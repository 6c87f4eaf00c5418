//! # Upstream Sink
//!
//! Sessions never own a socket. Everything they produce is handed to an
//! [`Upstream`] implementation supplied by the caller:
//!
//! - coded frames for the radio, via [`Upstream::transmit`]
//! - decoded payloads for the local application, via [`Upstream::deliver`]
//!
//! Both calls must not block.
//!
//! ## Implementations
//!
//! - [`MemoryUpstream`]: collects both streams in memory
//! - [`LossyUpstream`]: wraps another sink and drops transmitted frames
//! - `ChannelUpstream`: forwards to tokio channels (requires `tokio` feature)
//!
//! ## Example
//!
//! ```rust
//! use bytes::Bytes;
//! use nclink::protocol::HwAddr;
//! use nclink::transport::Upstream;
//!
//! struct Printer;
//!
//! impl Upstream for Printer {
//!     fn transmit(&mut self, frame: Bytes) {
//!         println!("radio <- {} bytes", frame.len());
//!     }
//!
//!     fn deliver(&mut self, from: HwAddr, payload: Bytes) {
//!         println!("app <- {} bytes from {from}", payload.len());
//!     }
//! }
//! ```

use std::collections::VecDeque;

use bytes::Bytes;

use crate::protocol::HwAddr;

// =============================================================================
// Trait
// =============================================================================

/// Destination for everything a session emits.
pub trait Upstream {
    /// Queue a coded frame for transmission.
    fn transmit(&mut self, frame: Bytes);

    /// Hand a decoded payload sent by `from` to the application.
    fn deliver(&mut self, from: HwAddr, payload: Bytes);
}

impl<T: Upstream + ?Sized> Upstream for &mut T {
    fn transmit(&mut self, frame: Bytes) {
        (**self).transmit(frame);
    }

    fn deliver(&mut self, from: HwAddr, payload: Bytes) {
        (**self).deliver(from, payload);
    }
}

// =============================================================================
// In-Memory Sink (for testing)
// =============================================================================

/// Collects transmitted frames and delivered payloads.
#[derive(Debug, Default)]
pub struct MemoryUpstream {
    pub transmitted: VecDeque<Bytes>,
    pub delivered: Vec<(HwAddr, Bytes)>,
}

impl MemoryUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return every frame queued for the radio.
    pub fn take_transmitted(&mut self) -> Vec<Bytes> {
        self.transmitted.drain(..).collect()
    }

    /// Remove and return every payload delivered so far.
    pub fn take_delivered(&mut self) -> Vec<(HwAddr, Bytes)> {
        std::mem::take(&mut self.delivered)
    }
}

impl Upstream for MemoryUpstream {
    fn transmit(&mut self, frame: Bytes) {
        self.transmitted.push_back(frame);
    }

    fn deliver(&mut self, from: HwAddr, payload: Bytes) {
        self.delivered.push((from, payload));
    }
}

// =============================================================================
// Lossy Sink (for testing recovery)
// =============================================================================

/// A wrapper that simulates radio loss on transmitted frames.
///
/// Delivered payloads always pass through.
#[derive(Debug)]
pub struct LossyUpstream<U> {
    inner: U,
    counter: u64,
    dropped: u64,
    /// Drop every Nth frame (0 = no loss)
    drop_every_n: u64,
    /// Random loss probability (0-100)
    random_loss_percent: u8,
}

impl<U> LossyUpstream<U> {
    /// Drop every `drop_every_n`-th frame, starting with the first.
    pub fn with_pattern(inner: U, drop_every_n: u64) -> Self {
        Self {
            inner,
            counter: 0,
            dropped: 0,
            drop_every_n,
            random_loss_percent: 0,
        }
    }

    /// Drop frames with probability `loss_percent` (0-100), reproducibly.
    pub fn with_random_loss(inner: U, loss_percent: u8) -> Self {
        Self {
            inner,
            counter: 0,
            dropped: 0,
            drop_every_n: 0,
            random_loss_percent: loss_percent.min(100),
        }
    }

    #[inline]
    pub fn inner(&self) -> &U {
        &self.inner
    }

    #[inline]
    pub fn inner_mut(&mut self) -> &mut U {
        &mut self.inner
    }

    pub fn into_inner(self) -> U {
        self.inner
    }

    /// Frames discarded so far.
    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn should_drop(&self, counter: u64) -> bool {
        if self.drop_every_n > 0 && counter % self.drop_every_n == 0 {
            return true;
        }

        if self.random_loss_percent > 0 {
            // Top bits of a golden-ratio multiplicative hash of the counter.
            let hash = counter.wrapping_mul(0x9E3779B97F4A7C15);
            let roll = ((hash >> 56) as u8) % 100;
            if roll < self.random_loss_percent {
                return true;
            }
        }

        false
    }
}

impl<U: Upstream> Upstream for LossyUpstream<U> {
    fn transmit(&mut self, frame: Bytes) {
        let count = self.counter;
        self.counter += 1;
        if self.should_drop(count) {
            self.dropped += 1;
            return;
        }
        self.inner.transmit(frame);
    }

    fn deliver(&mut self, from: HwAddr, payload: Bytes) {
        self.inner.deliver(from, payload);
    }
}

// =============================================================================
// Tokio Channel Sink
// =============================================================================

/// Forwards frames and payloads into unbounded tokio channels.
///
/// Sends to a closed channel are discarded.
#[cfg(feature = "tokio")]
#[derive(Debug, Clone)]
pub struct ChannelUpstream {
    radio: tokio::sync::mpsc::UnboundedSender<Bytes>,
    app: tokio::sync::mpsc::UnboundedSender<(HwAddr, Bytes)>,
}

#[cfg(feature = "tokio")]
impl ChannelUpstream {
    pub fn new(
        radio: tokio::sync::mpsc::UnboundedSender<Bytes>,
        app: tokio::sync::mpsc::UnboundedSender<(HwAddr, Bytes)>,
    ) -> Self {
        Self { radio, app }
    }
}

#[cfg(feature = "tokio")]
impl Upstream for ChannelUpstream {
    fn transmit(&mut self, frame: Bytes) {
        if self.radio.send(frame).is_err() {
            tracing::trace!("radio channel closed, frame discarded");
        }
    }

    fn deliver(&mut self, from: HwAddr, payload: Bytes) {
        if self.app.send((from, payload)).is_err() {
            tracing::trace!(%from, "application channel closed, payload discarded");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: HwAddr = HwAddr::new([2, 0, 0, 0, 0, 9]);

    #[test]
    fn test_memory_upstream() {
        let mut up = MemoryUpstream::new();
        up.transmit(Bytes::from_static(b"frame"));
        up.deliver(PEER, Bytes::from_static(b"payload"));

        assert_eq!(up.take_transmitted(), vec![Bytes::from_static(b"frame")]);
        assert!(up.transmitted.is_empty());
        assert_eq!(up.take_delivered(), vec![(PEER, Bytes::from_static(b"payload"))]);
        assert!(up.delivered.is_empty());
    }

    #[test]
    fn test_through_mut_reference() {
        fn emit(mut up: impl Upstream) {
            up.transmit(Bytes::from_static(b"x"));
        }

        let mut up = MemoryUpstream::new();
        emit(&mut up);
        assert_eq!(up.transmitted.len(), 1);
    }

    #[test]
    fn test_lossy_upstream_pattern() {
        let mut lossy = LossyUpstream::with_pattern(MemoryUpstream::new(), 3);

        for i in 0..10u8 {
            lossy.transmit(Bytes::copy_from_slice(&[i]));
        }
        lossy.deliver(PEER, Bytes::from_static(b"kept"));

        assert_eq!(lossy.dropped(), 4);
        let up = lossy.into_inner();
        let received: Vec<u8> = up.transmitted.iter().map(|f| f[0]).collect();
        // Frames 0, 3, 6, 9 are dropped.
        assert_eq!(received, vec![1, 2, 4, 5, 7, 8]);
        assert_eq!(up.delivered.len(), 1);
    }

    #[test]
    fn test_lossy_upstream_random() {
        let mut lossy = LossyUpstream::with_random_loss(MemoryUpstream::new(), 50);

        for i in 0..100u8 {
            lossy.transmit(Bytes::copy_from_slice(&[i]));
        }

        let count = lossy.inner().transmitted.len();
        assert!((25..=75).contains(&count), "received {count} frames");
        assert_eq!(lossy.dropped() as usize, 100 - count);
    }

    #[cfg(feature = "tokio")]
    #[tokio::test]
    async fn test_channel_upstream() {
        let (radio_tx, mut radio_rx) = tokio::sync::mpsc::unbounded_channel();
        let (app_tx, mut app_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut up = ChannelUpstream::new(radio_tx, app_tx);

        up.transmit(Bytes::from_static(b"frame"));
        up.deliver(PEER, Bytes::from_static(b"payload"));

        assert_eq!(radio_rx.recv().await.unwrap(), Bytes::from_static(b"frame"));
        assert_eq!(app_rx.recv().await.unwrap(), (PEER, Bytes::from_static(b"payload")));

        // Closed receivers are tolerated.
        drop(radio_rx);
        up.transmit(Bytes::from_static(b"lost"));
    }
}
