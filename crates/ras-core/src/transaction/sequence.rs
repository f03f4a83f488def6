use std::sync::atomic::{AtomicU16, Ordering};

use crate::message::SequenceNumber;

/// Hands out RAS sequence numbers: a randomly seeded 16-bit counter that
/// wraps and never yields zero.
#[derive(Debug)]
pub struct SequenceAllocator {
    next: AtomicU16,
}

impl SequenceAllocator {
    pub fn new() -> Self {
        Self::starting_at(rand::random::<u16>())
    }

    pub fn starting_at(first: SequenceNumber) -> Self {
        Self {
            next: AtomicU16::new(first),
        }
    }

    pub fn next(&self) -> SequenceNumber {
        loop {
            let seq = self.next.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraps_and_skips_zero() {
        let allocator = SequenceAllocator::starting_at(u16::MAX - 1);
        assert_eq!(allocator.next(), u16::MAX - 1);
        assert_eq!(allocator.next(), u16::MAX);
        assert_eq!(allocator.next(), 1);
        assert_eq!(allocator.next(), 2);
    }

    #[test]
    fn test_never_zero() {
        let allocator = SequenceAllocator::new();
        for _ in 0..70_000 {
            assert_ne!(allocator.next(), 0);
        }
    }
}
