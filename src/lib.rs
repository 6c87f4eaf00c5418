//! nclink - Random Linear Network Coding Link Layer
//!
//! A data plane for lossy radio links. Packets between two endpoints are
//! grouped into generations, sent as random linear combinations over
//! GF(2), GF(4), GF(16) or GF(256), and decoded by Gauss-Jordan elimination.
//! Both directions of a session share one coded block per generation, and
//! every frame carries feedback for the whole window so that
//! acknowledgements piggyback on data. Relays overhear both endpoints and
//! re-encode what they have received without decoding.
//!
//! # Layers
//!
//! ```text
//! SessionRegistry   sessions by id, created on demand, idle expiry
//!   └─ Session      frames in and out, retransmit / ack timers
//!        └─ GenerationWindow   ring of generations, feedback, retirement
//!             └─ Generation    flows, locks, pivot ranges, debt
//!                  └─ CodedBlock   rows, encode, Gauss-Jordan decode
//! ```
//!
//! All state is driven by the caller: feed frames and payloads in, call
//! `poll` when [`SessionRegistry::next_timeout`] is reached, and collect
//! output through an [`Upstream`] sink. With the `tokio` feature,
//! `driver::LinkDriver` does this on a task.
//!
//! # Example
//!
//! ```rust
//! use std::time::Instant;
//! use nclink::transport::MemoryUpstream;
//! use nclink::{HwAddr, NcConfig, SessionRegistry};
//!
//! let a = HwAddr::new([2, 0, 0, 0, 0, 1]);
//! let b = HwAddr::new([2, 0, 0, 0, 0, 2]);
//! let mut node_a = SessionRegistry::new(a, NcConfig::default())?;
//! let mut node_b = SessionRegistry::new(b, NcConfig::default())?;
//! let mut radio_a = MemoryUpstream::new();
//! let mut radio_b = MemoryUpstream::new();
//!
//! let now = Instant::now();
//! node_a.outbound(b, b"hello", now, &mut radio_a)?;
//! for frame in radio_a.take_transmitted() {
//!     node_b.inbound(&frame, now, &mut radio_b)?;
//! }
//!
//! assert_eq!(radio_b.delivered[0].0, a);
//! assert_eq!(radio_b.delivered[0].1, &b"hello"[..]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod block;
pub mod config;
pub mod error;
pub mod field;
pub mod generation;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod stats;
pub mod timer;
pub mod transport;
pub mod window;

#[cfg(feature = "tokio")]
pub mod driver;


pub use block::CodedBlock;
pub use config::NcConfig;
pub use error::{BlockError, ConfigError, GenerationError, ProtocolError, SessionError};
pub use field::{Field, FieldType, Gf256};
pub use generation::{Direction, FlowState, Generation, Role};
pub use protocol::{CodedHeader, FeedbackRecord, HwAddr, SessionId};
pub use registry::SessionRegistry;
pub use session::{Admission, Session};
pub use stats::SessionStats;
pub use transport::{LossyUpstream, MemoryUpstream, Upstream};
pub use window::{GenerationWindow, Inbound};
