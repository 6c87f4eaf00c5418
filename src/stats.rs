//! Session statistics.
//!
//! Each generation keeps its own counters while it is live. On retirement the
//! counters are folded into the session totals here.

use crate::generation::Generation;

/// Cumulative counters for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Generations retired so far.
    pub generations: u64,

    /// Source packets sent (first transmission of each inserted packet).
    pub tx_data: u64,

    /// Redundant coded packets sent.
    pub tx_redundant: u64,

    /// Pure acknowledgements sent.
    pub tx_ack: u64,

    /// Coded data frames received for live generations.
    pub rx_data: u64,

    /// Pure acknowledgements received for live generations.
    pub rx_ack: u64,

    /// Data frames that arrived for generations no longer in the window.
    pub rx_late_data: u64,

    /// Acknowledgements that arrived for generations no longer in the window.
    pub rx_late_ack: u64,

    /// Data frames received beyond what was needed to decode.
    pub rx_excess_data: i64,
}

impl SessionStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a retiring generation's counters into the totals.
    pub fn commit(&mut self, generation: &Generation) {
        let c = generation.counters();
        self.generations += 1;
        self.tx_data += u64::from(c.tx_data);
        self.tx_redundant += u64::from(c.tx_redundant);
        self.tx_ack += u64::from(c.tx_ack);
        self.rx_data += u64::from(c.rx_data);
        self.rx_ack += u64::from(c.rx_ack);

        if let Some(remote) = generation.remote_flow() {
            self.rx_excess_data += i64::from(c.rx_data) - i64::from(remote.source_dim);
        }
    }

    #[inline]
    pub fn on_late_data(&mut self) {
        self.rx_late_data += 1;
    }

    #[inline]
    pub fn on_late_ack(&mut self) {
        self.rx_late_ack += 1;
    }

    /// Average of `total` per retired generation.
    pub fn per_generation(&self, total: u64) -> f64 {
        if self.generations == 0 {
            0.0
        } else {
            total as f64 / self.generations as f64
        }
    }

    /// Redundant packets per source packet sent, 0 if nothing was sent.
    pub fn redundancy_ratio(&self) -> f64 {
        if self.tx_data == 0 {
            0.0
        } else {
            self.tx_redundant as f64 / self.tx_data as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_averages_on_empty() {
        let stats = SessionStats::new();
        assert_eq!(stats.per_generation(10), 0.0);
        assert_eq!(stats.redundancy_ratio(), 0.0);
    }

    #[test]
    fn test_late_counters() {
        let mut stats = SessionStats::new();
        stats.on_late_data();
        stats.on_late_data();
        stats.on_late_ack();
        assert_eq!(stats.rx_late_data, 2);
        assert_eq!(stats.rx_late_ack, 1);
    }

    #[test]
    fn test_per_generation() {
        let stats = SessionStats {
            generations: 4,
            tx_data: 10,
            tx_redundant: 5,
            ..SessionStats::default()
        };
        assert_eq!(stats.per_generation(stats.tx_data), 2.5);
        assert_eq!(stats.redundancy_ratio(), 0.5);
    }
}
