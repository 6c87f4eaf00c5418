//! Session configuration.

use std::time::Duration;

use crate::error::ConfigError;
use crate::field::FieldType;

/// Largest generation size. Pivots and dimensions travel as single bytes.
pub const MAX_GENERATION_SIZE: usize = 254;

/// Largest window, bounded by the 6-bit header field.
pub const MAX_WINDOW_SIZE: usize = 63;

/// Configuration shared by every session of a registry.
#[derive(Debug, Clone, PartialEq)]
pub struct NcConfig {
    // === Coding ===
    /// Packets per generation, split evenly between the two flows.
    pub generation_size: usize,

    /// Generations in flight per session.
    pub window_size: usize,

    /// Coding field.
    pub field: FieldType,

    /// Largest application payload in bytes.
    pub max_payload: usize,

    /// Initial redundancy target (coded packets per source packet).
    pub redundancy: f64,

    // === Timers ===
    /// Retransmit interval floor in milliseconds.
    pub rtx_min_ms: u64,

    /// Retransmit interval ceiling in milliseconds.
    pub rtx_max_ms: u64,

    /// Delay before the first acknowledgement in milliseconds.
    pub ack_min_ms: u64,

    /// Acknowledgement repeat interval in milliseconds.
    pub ack_interval_ms: u64,

    /// Idle time after which a session is torn down, in milliseconds.
    pub session_timeout_ms: u64,

    // === Guards ===
    /// Largest plausible forward distance between the peer's window start
    /// and ours. Larger distances are treated as zero.
    pub max_sequence_distance: u16,

    /// Upper bound on frames sent by a single retransmit timer expiry.
    pub max_rtx_burst: u32,

    /// Seed for coefficient generation. `None` draws from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for NcConfig {
    fn default() -> Self {
        Self {
            generation_size: 32,
            window_size: 4,
            field: FieldType::Gf256,
            max_payload: 1600,
            redundancy: 1.0,

            rtx_min_ms: 10,
            rtx_max_ms: 100,
            ack_min_ms: 1,
            ack_interval_ms: 10,
            session_timeout_ms: 60_000,

            max_sequence_distance: 128,
            max_rtx_burst: 64,
            rng_seed: None,
        }
    }
}

impl NcConfig {
    /// Small generations and tight timers.
    pub fn low_latency() -> Self {
        Self {
            generation_size: 8,
            window_size: 8,
            rtx_min_ms: 5,
            rtx_max_ms: 50,
            ack_interval_ms: 5,
            ..Self::default()
        }
    }

    /// Extra redundancy and a wider window for poor links.
    pub fn lossy_link() -> Self {
        Self {
            generation_size: 64,
            window_size: 8,
            redundancy: 1.5,
            rtx_max_ms: 200,
            ..Self::default()
        }
    }

    /// Check every constraint.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generation_size < 2
            || self.generation_size % 2 != 0
            || self.generation_size > MAX_GENERATION_SIZE
        {
            return Err(ConfigError::GenerationSize(self.generation_size));
        }
        if self.window_size == 0 || self.window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::WindowSize(self.window_size));
        }
        if self.max_payload == 0 || self.max_payload > u16::MAX as usize {
            return Err(ConfigError::MaxPayload(self.max_payload));
        }
        if !self.redundancy.is_finite() || self.redundancy < 1.0 {
            return Err(ConfigError::Redundancy(self.redundancy));
        }
        if self.rtx_min_ms > self.rtx_max_ms {
            return Err(ConfigError::RetransmitBounds {
                min_ms: self.rtx_min_ms,
                max_ms: self.rtx_max_ms,
            });
        }
        if self.ack_interval_ms == 0 {
            return Err(ConfigError::Zero("ack_interval_ms"));
        }
        if self.session_timeout_ms == 0 {
            return Err(ConfigError::Zero("session_timeout_ms"));
        }
        if self.max_sequence_distance == 0 {
            return Err(ConfigError::Zero("max_sequence_distance"));
        }
        if self.max_rtx_burst == 0 {
            return Err(ConfigError::Zero("max_rtx_burst"));
        }
        Ok(())
    }

    #[inline]
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    #[inline]
    pub fn ack_min(&self) -> Duration {
        Duration::from_millis(self.ack_min_ms)
    }

    #[inline]
    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        NcConfig::default().validate().unwrap();
        NcConfig::low_latency().validate().unwrap();
        NcConfig::lossy_link().validate().unwrap();
    }

    #[test]
    fn test_generation_size_constraints() {
        for bad in [0, 1, 7, 256] {
            let cfg = NcConfig {
                generation_size: bad,
                ..NcConfig::default()
            };
            assert_eq!(cfg.validate(), Err(ConfigError::GenerationSize(bad)));
        }
        let cfg = NcConfig {
            generation_size: 254,
            ..NcConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_window_and_timers() {
        let cfg = NcConfig {
            window_size: 64,
            ..NcConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::WindowSize(64)));

        let cfg = NcConfig {
            rtx_min_ms: 200,
            ..NcConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::RetransmitBounds { .. })));

        let cfg = NcConfig {
            redundancy: 0.5,
            ..NcConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::Redundancy(0.5)));

        let cfg = NcConfig {
            max_sequence_distance: 0,
            ..NcConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::Zero("max_sequence_distance")));
    }
}
