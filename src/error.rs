//! Error types, one enum per layer.
//!
//! Capacity problems are plain errors the caller recovers from by dropping the
//! unit of work. Protocol-state errors signal a broken invariant; the session
//! layer reports them through [`SessionError::is_fatal`].

use thiserror::Error;

use crate::field::FieldType;

/// Coded block failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    #[error("invalid block capacity {0}: must be even and within 2..=256")]
    InvalidCapacity(usize),

    #[error("invalid payload limit {0}: must be within 1..=65535")]
    InvalidPayloadLimit(usize),

    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },

    #[error("block rank exceeded")]
    RankExceeded,

    #[error("pivot {0} already in use")]
    PivotExists(usize),

    #[error("pivot {pivot} out of range for capacity {capacity}")]
    PivotOutOfRange { pivot: usize, capacity: usize },

    #[error("block is empty")]
    Empty,

    #[error("buffer too small: have {have} bytes, need {need} bytes")]
    BufferTooSmall { have: usize, need: usize },
}

/// Generation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerationError {
    #[error("generation {seq}: local flow is locked")]
    Locked { seq: u16 },

    #[error("operation not permitted for relay generations")]
    InvalidRole,

    #[error("generation {seq}: remote flow forced complete but not decoded (source {source_dim}, dest {dest_dim})")]
    RemoteNotDecoded {
        seq: u16,
        source_dim: u8,
        dest_dim: u8,
    },

    #[error(transparent)]
    Block(#[from] BlockError),
}

impl GenerationError {
    /// Whether the error breaks a protocol invariant rather than a capacity limit.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Locked { .. } | Self::InvalidRole | Self::RemoteNotDecoded { .. } => true,
            Self::Block(_) => false,
        }
    }
}

/// Wire format failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("frame truncated: have {have} bytes, need {need} bytes")]
    Truncated { have: usize, need: usize },

    #[error("invalid window size {0}: must be within 1..=63")]
    InvalidWindow(usize),

    #[error("session id requires two distinct addresses")]
    IdenticalAddresses,
}

/// Configuration failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("generation size {0} must be even and within 2..=254")]
    GenerationSize(usize),

    #[error("window size {0} must be within 1..=63")]
    WindowSize(usize),

    #[error("max payload {0} must be within 1..=65535")]
    MaxPayload(usize),

    #[error("redundancy {0} must be finite and at least 1.0")]
    Redundancy(f64),

    #[error("retransmit bounds invalid: min {min_ms}ms, max {max_ms}ms")]
    RetransmitBounds { min_ms: u64, max_ms: u64 },

    #[error("{0} must be nonzero")]
    Zero(&'static str),
}

/// Session-level failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("header field {got} does not match session field {expected}")]
    FieldMismatch { expected: FieldType, got: FieldType },

    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SessionError {
    /// Fatal errors leave the session in an unusable state; the registry
    /// tears such sessions down.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Generation(e) => e.is_fatal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SessionError::from(GenerationError::InvalidRole).is_fatal());
        assert!(SessionError::from(GenerationError::Locked { seq: 3 }).is_fatal());
        assert!(!SessionError::from(GenerationError::Block(BlockError::RankExceeded)).is_fatal());
        assert!(!SessionError::from(ProtocolError::IdenticalAddresses).is_fatal());
    }

    #[test]
    fn test_messages() {
        let e = BlockError::BufferTooSmall { have: 4, need: 9 };
        assert_eq!(e.to_string(), "buffer too small: have 4 bytes, need 9 bytes");

        let e = SessionError::FieldMismatch {
            expected: FieldType::Gf256,
            got: FieldType::Gf4,
        };
        assert_eq!(e.to_string(), "header field GF(4) does not match session field GF(256)");
    }
}
