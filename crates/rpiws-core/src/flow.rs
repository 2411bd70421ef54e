//! Windowed flow control shared by every streaming hop.
//!
//! A sender starts with zero credit, spends one per frame, and stops once
//! it has reached [`WINDOW_FLOOR`]. The receiver counts absorbed frames and
//! grants them back in batches of [`ACK_BATCH`], so at most
//! `-WINDOW_FLOOR` frames are ever in flight.

pub const WINDOW_FLOOR: i32 = -10;
pub const ACK_BATCH: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckWindow {
    credit: i32,
}

impl AckWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credit(&self) -> i32 {
        self.credit
    }

    pub fn is_open(&self) -> bool {
        self.credit > WINDOW_FLOOR
    }

    /// Spends one credit. Returns false (and spends nothing) when closed.
    pub fn try_consume(&mut self) -> bool {
        if !self.is_open() {
            return false;
        }
        self.credit -= 1;
        true
    }

    pub fn grant(&mut self, count: i32) {
        self.credit = self.credit.saturating_add(count);
    }

    pub fn reset(&mut self) {
        self.credit = 0;
    }
}

/// Receiver half: counts frames and reports when a credit batch is due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckCounter {
    received: u32,
    batch: u32,
}

impl Default for AckCounter {
    fn default() -> Self {
        Self::new(ACK_BATCH)
    }
}

impl AckCounter {
    pub fn new(batch: u32) -> Self {
        Self {
            received: 0,
            batch: batch.max(1),
        }
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    /// Records one frame; yields the credit to grant once a batch is full.
    pub fn record(&mut self) -> Option<i32> {
        self.received += 1;
        if self.received < self.batch {
            return None;
        }
        let grant = i32::try_from(self.received).unwrap_or(i32::MAX);
        self.received = 0;
        Some(grant)
    }
}

/// Result of one cooperative sender tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame went out; run again on the next tick.
    Sent,
    /// Nothing to send right now.
    Idle,
    /// Paused or out of credit; wait for an external kick.
    Halted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn window_closes_after_ten_frames() {
        let mut window = AckWindow::new();
        let mut sent = 0;
        while window.try_consume() {
            sent += 1;
        }
        assert_eq!(sent, 10);
        assert_eq!(window.credit(), WINDOW_FLOOR);
        assert!(!window.is_open());

        window.grant(5);
        assert_eq!(window.credit(), -5);
        assert!(window.is_open());
    }

    #[test]
    fn counter_emits_batch_and_resets() {
        let mut counter = AckCounter::default();
        for _ in 0..4 {
            assert_eq!(counter.record(), None);
        }
        assert_eq!(counter.record(), Some(5));
        assert_eq!(counter.received(), 0);
    }

    proptest! {
        #[test]
        fn window_never_drops_below_floor(ops in proptest::collection::vec(prop_oneof![Just(None), (1i32..=5).prop_map(Some)], 0..200)) {
            let mut window = AckWindow::new();
            for op in ops {
                match op {
                    None => {
                        window.try_consume();
                    }
                    Some(k) => {
                        let before = window.credit();
                        window.grant(k);
                        prop_assert_eq!(window.credit(), before + k);
                    }
                }
                prop_assert!(window.credit() >= WINDOW_FLOOR);
            }
        }
    }
}
