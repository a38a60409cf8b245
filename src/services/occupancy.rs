//! Facility occupancy counter
//!
//! Single source of truth for how many spaces are taken. Mutated only by the
//! coordinator when an ENTRY or EXIT completes; read by statistics and the
//! display path. Both mutations are bounded CAS loops, so `0 <= occupied <= total`
//! holds under any interleaving.

use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct OccupancyCounter {
    total: u32,
    occupied: AtomicU32,
}

impl OccupancyCounter {
    pub fn new(total: u32) -> Self {
        Self { total, occupied: AtomicU32::new(0) }
    }

    /// Counter seeded from persisted state (clamped to capacity)
    pub fn with_occupied(total: u32, occupied: u32) -> Self {
        Self { total, occupied: AtomicU32::new(occupied.min(total)) }
    }

    /// Take one space. Returns false when the facility is full.
    pub fn try_occupy(&self) -> bool {
        let mut current = self.occupied.load(Ordering::Acquire);
        while current < self.total {
            match self.occupied.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    /// Free one space. Returns false when nothing was occupied.
    pub fn release(&self) -> bool {
        let mut current = self.occupied.load(Ordering::Acquire);
        while current > 0 {
            match self.occupied.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
        false
    }

    #[inline]
    pub fn occupied(&self) -> u32 {
        self.occupied.load(Ordering::Acquire)
    }

    #[inline]
    pub fn free(&self) -> u32 {
        self.total.saturating_sub(self.occupied())
    }

    #[inline]
    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn is_full(&self) -> bool {
        self.occupied() >= self.total
    }
}
