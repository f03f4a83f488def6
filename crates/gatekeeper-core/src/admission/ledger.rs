use h323_ras_core::message::Bandwidth;
use parking_lot::Mutex;
use tracing::trace;

use crate::config::BandwidthPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LedgerState {
    total: Bandwidth,
    used: Bandwidth,
}

/// Bandwidth budget shared by every call.
///
/// All changes happen under one lock, so `used <= total` holds at every
/// observable point and concurrent requests cannot double-spend.
#[derive(Debug)]
pub struct BandwidthLedger {
    state: Mutex<LedgerState>,
}

impl BandwidthLedger {
    pub fn new(total: Bandwidth) -> Self {
        Self {
            state: Mutex::new(LedgerState { total, used: 0 }),
        }
    }

    pub fn total(&self) -> Bandwidth {
        self.state.lock().total
    }

    pub fn used(&self) -> Bandwidth {
        self.state.lock().used
    }

    pub fn available(&self) -> Bandwidth {
        let state = self.state.lock();
        state.total - state.used
    }

    /// Reserve `requested`. On success returns the amount granted, which is
    /// less than requested only under [`BandwidthPolicy::CapToRemaining`].
    /// On failure returns what is still available.
    pub fn reserve(&self, requested: Bandwidth, policy: BandwidthPolicy) -> Result<Bandwidth, Bandwidth> {
        let mut state = self.state.lock();
        let granted = grant(&state, requested, policy)?;
        state.used += granted;
        trace!("Reserved {} of {} requested, {}/{} used", granted, requested, state.used, state.total);
        Ok(granted)
    }

    /// Replace a reservation of `current` with one of `requested` in one
    /// step. On failure the original reservation is untouched and the error
    /// carries the most that could have been granted.
    pub fn adjust(
        &self,
        current: Bandwidth,
        requested: Bandwidth,
        policy: BandwidthPolicy,
    ) -> Result<Bandwidth, Bandwidth> {
        let mut state = self.state.lock();
        let held = current.min(state.used);
        let without = LedgerState {
            total: state.total,
            used: state.used - held,
        };
        let granted = grant(&without, requested, policy)?;
        state.used = without.used + granted;
        trace!("Adjusted {} -> {}, {}/{} used", current, granted, state.used, state.total);
        Ok(granted)
    }

    pub fn release(&self, amount: Bandwidth) {
        let mut state = self.state.lock();
        state.used = state.used.saturating_sub(amount);
        trace!("Released {}, {}/{} used", amount, state.used, state.total);
    }
}

fn grant(state: &LedgerState, requested: Bandwidth, policy: BandwidthPolicy) -> Result<Bandwidth, Bandwidth> {
    let available = state.total - state.used;
    if requested <= available {
        return Ok(requested);
    }
    match policy {
        BandwidthPolicy::CapToRemaining if available > 0 => Ok(available),
        _ => Err(available),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_reject_when_request_exceeds_remaining() {
        let ledger = BandwidthLedger::new(1000);
        assert_eq!(ledger.reserve(500, BandwidthPolicy::Reject), Ok(500));
        assert_eq!(ledger.reserve(640, BandwidthPolicy::Reject), Err(500));
        assert_eq!(ledger.used(), 500);
    }

    #[test]
    fn test_cap_to_remaining() {
        let ledger = BandwidthLedger::new(1000);
        ledger.reserve(500, BandwidthPolicy::CapToRemaining).unwrap();
        assert_eq!(ledger.reserve(640, BandwidthPolicy::CapToRemaining), Ok(500));
        assert_eq!(ledger.reserve(1, BandwidthPolicy::CapToRemaining), Err(0));
        assert_eq!(ledger.used(), 1000);
    }

    #[test]
    fn test_adjust_is_atomic() {
        let ledger = BandwidthLedger::new(1000);
        ledger.reserve(400, BandwidthPolicy::Reject).unwrap();
        ledger.reserve(400, BandwidthPolicy::Reject).unwrap();

        // Growing one call to 700 would need 1100 in total
        assert_eq!(ledger.adjust(400, 700, BandwidthPolicy::Reject), Err(600));
        assert_eq!(ledger.used(), 800);

        assert_eq!(ledger.adjust(400, 600, BandwidthPolicy::Reject), Ok(600));
        assert_eq!(ledger.used(), 1000);
        assert_eq!(ledger.adjust(600, 100, BandwidthPolicy::Reject), Ok(100));
        assert_eq!(ledger.used(), 500);
    }

    #[test]
    fn test_concurrent_reservations_never_overspend() {
        let ledger = std::sync::Arc::new(BandwidthLedger::new(1000));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || ledger.reserve(100, BandwidthPolicy::Reject).is_ok())
            })
            .collect();
        let granted = handles.into_iter().map(|h| h.join()).filter(|r| matches!(r, Ok(true))).count();
        assert_eq!(granted, 10);
        assert_eq!(ledger.used(), 1000);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(Bandwidth),
        Adjust(usize, Bandwidth),
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0..600u32).prop_map(Op::Reserve),
            (any::<usize>(), 0..600u32).prop_map(|(i, bw)| Op::Adjust(i, bw)),
            any::<usize>().prop_map(Op::Release),
        ]
    }

    proptest! {
        #[test]
        fn prop_used_matches_holdings_and_stays_in_budget(
            total in 0..3000u32,
            cap in any::<bool>(),
            ops in proptest::collection::vec(op(), 1..64),
        ) {
            let policy = if cap { BandwidthPolicy::CapToRemaining } else { BandwidthPolicy::Reject };
            let ledger = BandwidthLedger::new(total);
            let mut held: Vec<Bandwidth> = Vec::new();

            for op in ops {
                match op {
                    Op::Reserve(bw) => {
                        if let Ok(granted) = ledger.reserve(bw, policy) {
                            prop_assert!(granted <= bw);
                            held.push(granted);
                        }
                    }
                    Op::Adjust(i, bw) if !held.is_empty() => {
                        let i = i % held.len();
                        if let Ok(granted) = ledger.adjust(held[i], bw, policy) {
                            held[i] = granted;
                        }
                    }
                    Op::Release(i) if !held.is_empty() => {
                        let amount = held.remove(i % held.len());
                        ledger.release(amount);
                    }
                    _ => {}
                }
                prop_assert!(ledger.used() <= ledger.total());
                prop_assert_eq!(ledger.used(), held.iter().sum::<Bandwidth>());
            }
        }
    }
}
