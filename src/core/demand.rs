//! The demand counter behind [`super::transfer::TransferService`].
//!
//! A 64-bit cell with three logical regions: a `FINISHED` sentinel, an
//! `UNBOUNDED` sentinel (saturation point for `Long.MAX`-style requests),
//! or a non-negative count. All mutation is CAS; there is no lock.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::CoreError;

/// No real count ever reaches this value: it's one below [`DemandCell::FINISHED`]
/// and acts as the saturation ceiling for [`DemandCell::increase`].
pub(crate) struct DemandCell(AtomicU64);

impl DemandCell {
    pub(crate) const FINISHED: u64 = u64::MAX;
    pub(crate) const UNBOUNDED: u64 = u64::MAX - 1;

    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Adds `n` to the outstanding demand, saturating at [`Self::UNBOUNDED`].
    /// A no-op once [`Self::FINISHED`]. `n < 1` is the caller's mistake, not
    /// ours to silently ignore.
    pub(crate) fn increase(&self, n: u64) -> Result<(), CoreError> {
        if n < 1 {
            return Err(CoreError::InvalidDemand(n));
        }
        loop {
            let cur = self.0.load(Ordering::Acquire);
            if cur == Self::FINISHED || cur == Self::UNBOUNDED {
                return Ok(());
            }
            let next = match cur.checked_add(n) {
                Some(sum) if sum < Self::UNBOUNDED => sum,
                _ => Self::UNBOUNDED,
            };
            if self
                .0
                .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Consumes one unit of demand for a delivered item. No-op if
    /// `FINISHED`, `UNBOUNDED`, or already at zero.
    pub(crate) fn decrement_one_after_delivery(&self) {
        loop {
            let cur = self.0.load(Ordering::Acquire);
            if cur == Self::FINISHED || cur == Self::UNBOUNDED || cur == 0 {
                return;
            }
            if self
                .0
                .compare_exchange(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// CAS to `FINISHED`. Returns `true` only for the single caller whose
    /// CAS actually performed the transition.
    pub(crate) fn finish(&self) -> bool {
        loop {
            let cur = self.0.load(Ordering::Acquire);
            if cur == Self::FINISHED {
                return false;
            }
            if self
                .0
                .compare_exchange(cur, Self::FINISHED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.0.load(Ordering::Acquire) == Self::FINISHED
    }

    /// Whether a transfer step may currently proceed: not finished and
    /// strictly positive (`UNBOUNDED` counts as positive).
    pub(crate) fn has_demand(&self) -> bool {
        let cur = self.0.load(Ordering::Acquire);
        cur != Self::FINISHED && cur != 0
    }

    #[cfg(test)]
    pub(crate) fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increase_rejects_zero() {
        let d = DemandCell::new();
        match d.increase(0) {
            Err(CoreError::InvalidDemand(0)) => {}
            other => panic!("expected InvalidDemand(0), got {other:?}"),
        }
    }

    #[test]
    fn test_increase_saturates_at_unbounded() {
        let d = DemandCell::new();
        d.increase(u64::MAX).unwrap();
        assert_eq!(d.current(), DemandCell::UNBOUNDED);
        // a second huge request does not overflow or change anything
        d.increase(u64::MAX).unwrap();
        assert_eq!(d.current(), DemandCell::UNBOUNDED);
    }

    #[test]
    fn test_two_consecutive_large_increases_saturate_not_overflow() {
        let d = DemandCell::new();
        d.increase(u64::MAX - 10).unwrap();
        d.increase(u64::MAX - 10).unwrap();
        assert_eq!(d.current(), DemandCell::UNBOUNDED);
    }

    #[test]
    fn test_finish_transitions_once() {
        let d = DemandCell::new();
        assert!(d.finish());
        assert!(!d.finish());
        assert!(d.is_finished());
    }

    #[test]
    fn test_increase_after_finish_is_noop() {
        let d = DemandCell::new();
        d.finish();
        d.increase(5).unwrap();
        assert!(d.is_finished());
    }

    #[test]
    fn test_decrement_never_goes_negative() {
        let d = DemandCell::new();
        d.decrement_one_after_delivery();
        assert_eq!(d.current(), 0);
        d.increase(1).unwrap();
        d.decrement_one_after_delivery();
        assert_eq!(d.current(), 0);
        d.decrement_one_after_delivery();
        assert_eq!(d.current(), 0);
    }

    #[test]
    fn test_unbounded_never_decrements() {
        let d = DemandCell::new();
        d.increase(u64::MAX).unwrap();
        d.decrement_one_after_delivery();
        assert_eq!(d.current(), DemandCell::UNBOUNDED);
    }
}
