//! # Eviction Policies
//!
//! Victim selection for the buffer pool. The set of policies is closed,
//! so the dispatch is a sum type rather than a trait object: a new policy
//! adds a variant and a match arm.
//!
//! ## Clock
//!
//! One reference bit per frame and a monotonic hand. The first sweep
//! gives referenced frames a second chance (clear the bit, advance); the
//! first unpinned, non-empty frame with a clear bit is the victim. If the
//! sweep finds nothing, a second sweep takes the first unpinned non-empty
//! frame regardless of its bit, clearing it.
//!
//! ## LRU
//!
//! Every access stamps the frame with a microsecond timestamp; the victim
//! is the unpinned, non-empty frame with the smallest stamp.
//!
//! Both policies receive `access_frame` on every successful fetch (hit or
//! miss) and on every pin.
//!
//! ## Thread Safety
//!
//! The clock hand is an atomic; frame bits and timestamps live in the
//! frames themselves. Victim selection runs under the pool's page-table
//! write lock, so at most one eviction is in flight at a time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::pool::Frame;

/// Policy selector carried by `StorageConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionKind {
    #[default]
    Clock,
    Lru,
}

/// Stateful policy instance owned by one pool.
#[derive(Debug)]
pub(crate) enum EvictionPolicy {
    Clock { hand: AtomicUsize },
    Lru,
}

impl EvictionPolicy {
    pub(crate) fn new(kind: EvictionKind) -> Self {
        match kind {
            EvictionKind::Clock => EvictionPolicy::Clock {
                hand: AtomicUsize::new(0),
            },
            EvictionKind::Lru => EvictionPolicy::Lru,
        }
    }

    /// Marks a frame as recently used.
    pub(crate) fn access_frame(&self, index: usize, frames: &[Frame]) {
        let frame = &frames[index];
        frame.stamp_access(now_micros());
        if matches!(self, EvictionPolicy::Clock { .. }) {
            frame.set_ref_bit();
        }
    }

    /// Picks an evictable frame, or `None` when every candidate is pinned
    /// or empty.
    pub(crate) fn select_victim(&self, frames: &[Frame]) -> Option<usize> {
        match self {
            EvictionPolicy::Clock { hand } => Self::clock_sweep(hand, frames),
            EvictionPolicy::Lru => Self::lru_min(frames),
        }
    }

    pub(crate) fn reset(&self) {
        if let EvictionPolicy::Clock { hand } = self {
            hand.store(0, Ordering::Release);
        }
    }

    fn clock_sweep(hand: &AtomicUsize, frames: &[Frame]) -> Option<usize> {
        let n = frames.len();
        if n == 0 {
            return None;
        }

        for _ in 0..n {
            let index = hand.fetch_add(1, Ordering::AcqRel) % n;
            let frame = &frames[index];
            if !frame.holds_page() || frame.is_pinned() {
                continue;
            }
            if frame.clear_ref_bit() {
                continue;
            }
            return Some(index);
        }

        // Second pass: every candidate had its bit set on the first pass.
        for _ in 0..n {
            let index = hand.fetch_add(1, Ordering::AcqRel) % n;
            let frame = &frames[index];
            if !frame.holds_page() || frame.is_pinned() {
                continue;
            }
            frame.clear_ref_bit();
            return Some(index);
        }

        None
    }

    fn lru_min(frames: &[Frame]) -> Option<usize> {
        frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.holds_page() && !f.is_pinned())
            .min_by_key(|(_, f)| f.last_access())
            .map(|(index, _)| index)
    }
}

pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
