//! Combined progress of a stream pair.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::catalog::percentage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Primary,
    Child,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Primary => 0,
            Side::Child => 1,
        }
    }
}

/// Byte counters of both sides; the unified percentage is
/// `(primary + child downloaded) / (primary + child total)`, floored.
#[derive(Debug, Default)]
pub struct PairProgress {
    downloaded: [AtomicU64; 2],
    total: [AtomicU64; 2],
}

impl PairProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self, side: Side, downloaded: u64, total: u64) {
        self.downloaded[side.index()].store(downloaded, Ordering::SeqCst);
        self.total[side.index()].store(total, Ordering::SeqCst);
    }

    /// Add `bytes` to `side` and return the new unified percentage.
    pub fn advance(&self, side: Side, bytes: u64) -> u8 {
        self.downloaded[side.index()].fetch_add(bytes, Ordering::SeqCst);
        self.percentage()
    }

    /// Mark `side` fully downloaded at `total` bytes.
    pub fn complete(&self, side: Side, total: u64) -> u8 {
        let known = self.total[side.index()].fetch_max(total, Ordering::SeqCst).max(total);
        self.downloaded[side.index()].store(known, Ordering::SeqCst);
        self.percentage()
    }

    pub fn percentage(&self) -> u8 {
        let downloaded = self.downloaded[0].load(Ordering::SeqCst) + self.downloaded[1].load(Ordering::SeqCst);
        let total = self.total[0].load(Ordering::SeqCst) + self.total[1].load(Ordering::SeqCst);
        percentage(downloaded, total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unified_percentage_tracks_both_sides() {
        let progress = PairProgress::new();
        progress.reset(Side::Primary, 100, 100);
        progress.reset(Side::Child, 50, 100);
        assert_eq!(progress.percentage(), 75);

        assert_eq!(progress.advance(Side::Child, 25), 87);
        assert_eq!(progress.complete(Side::Child, 100), 100);
    }

    #[test]
    fn test_unified_percentage_floors() {
        let progress = PairProgress::new();
        progress.reset(Side::Primary, 1, 2);
        progress.reset(Side::Child, 1, 1);
        assert_eq!(progress.percentage(), 66);
    }

    #[test]
    fn test_complete_fills_unknown_total() {
        let progress = PairProgress::new();
        progress.reset(Side::Primary, 0, 0);
        progress.reset(Side::Child, 0, 0);
        assert_eq!(progress.percentage(), 0);
        assert_eq!(progress.complete(Side::Primary, 40), 100);
    }
}
