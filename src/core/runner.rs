//! Serial runner: collapses concurrent or recursive invocations of a
//! delegate into strictly serial runs.
//!
//! ## Protocol
//!
//! ```text
//! END  --run()-->             BEGIN_1 (sync) | BEGIN_2 (async)
//! BEGIN_1/BEGIN_2 --run()-->  AGAIN_1/AGAIN_2   (re-run scheduled, no-op otherwise)
//! AGAIN_1/AGAIN_2 --run()-->  (already scheduled, returns immediately)
//! ```
//!
//! `BEGIN_1`/`AGAIN_1` (sync mode) resolve back to `END` as soon as the
//! delegate returns. `BEGIN_2`/`AGAIN_2` (async mode) require one more
//! completion beyond the delegate's return — an explicit call to
//! [`Runner::complete`] — before the state resolves. A pending re-run
//! collapsed into `AGAIN_2` is driven by whichever thread's `complete()`
//! call brings the outstanding-completions counter to zero; the original
//! caller of `run()` never blocks waiting for it.
//!
//! `run()`/`complete()` take `&self`: every field but the delegate itself is
//! a plain atomic, and the delegate sits behind an [`UnsafeCell`] whose
//! exclusive access is proven by the CAS protocol below, not by the borrow
//! checker — only the thread that wins the transition into `BEGIN_x` (or
//! that resolves `outstanding` to zero) may touch it, and the `Acquire`
//! CAS that wins always synchronizes-with the `Release` CAS that last left
//! it.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};

use crossbeam_utils::CachePadded;

const END: u8 = 0;
const BEGIN_1: u8 = 1;
const BEGIN_2: u8 = 2;
const AGAIN_1: u8 = 3;
const AGAIN_2: u8 = 4;

/// Outstanding-completions counter for async mode. Only meaningful while
/// `state` is `BEGIN_2` or `AGAIN_2`; unused in sync mode.
const ASYNC_OUTSTANDING: u8 = 2;

/// Error raised by [`Runner::complete`], or a delegate failure surfaced
/// while resolving a pending re-run from within `complete()`.
pub enum RunnerError<E> {
    /// `complete()` called on a sync-mode runner, or with no run active.
    InvalidState(&'static str),
    /// The delegate itself failed while `complete()` drove a pending re-run.
    Delegate(E),
}

impl<E: std::fmt::Display> std::fmt::Display for RunnerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::InvalidState(reason) => write!(f, "invalid runner state: {reason}"),
            RunnerError::Delegate(e) => write!(f, "delegate failed: {e}"),
        }
    }
}

impl<E: std::fmt::Display + std::fmt::Debug> std::error::Error for RunnerError<E> {}

impl<E: std::fmt::Debug> std::fmt::Debug for RunnerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerError::InvalidState(s) => write!(f, "InvalidState({s:?})"),
            RunnerError::Delegate(e) => write!(f, "Delegate({e:?})"),
        }
    }
}

/// Wraps a delegate `FnMut() -> Result<(), E>` so that concurrent or
/// recursive calls to [`run`](Runner::run) never overlap.
pub struct Runner<F, E> {
    state: CachePadded<AtomicU8>,
    outstanding: CachePadded<AtomicU8>,
    is_async: bool,
    delegate: UnsafeCell<F>,
    _error: std::marker::PhantomData<fn() -> E>,
}

impl<F, E> Runner<F, E>
where
    F: FnMut() -> Result<(), E>,
{
    /// Sync mode: one logical run ends as soon as the delegate returns.
    pub fn new(delegate: F) -> Self {
        Self {
            state: CachePadded::new(AtomicU8::new(END)),
            outstanding: CachePadded::new(AtomicU8::new(0)),
            is_async: false,
            delegate: UnsafeCell::new(delegate),
            _error: std::marker::PhantomData,
        }
    }

    /// Async mode: one logical run ends only once the delegate has both
    /// returned *and* [`complete`](Runner::complete) has been called once.
    pub fn new_async(delegate: F) -> Self {
        Self {
            state: CachePadded::new(AtomicU8::new(END)),
            outstanding: CachePadded::new(AtomicU8::new(0)),
            is_async: true,
            delegate: UnsafeCell::new(delegate),
            _error: std::marker::PhantomData,
        }
    }

    /// Attempts to start a run, schedules a re-run if one is already in
    /// progress, or is a no-op if a re-run is already scheduled. Never
    /// blocks. Propagates the delegate's error, if any, to the caller that
    /// actually drove the failing invocation.
    pub fn run(&self) -> Result<(), E> {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            let target = match cur {
                END => {
                    if self.is_async {
                        BEGIN_2
                    } else {
                        BEGIN_1
                    }
                }
                BEGIN_1 => AGAIN_1,
                BEGIN_2 => AGAIN_2,
                AGAIN_1 | AGAIN_2 => return Ok(()), // already scheduled
                _ => unreachable!("invalid runner state"),
            };
            if self
                .state
                .compare_exchange(cur, target, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if cur == END {
                    break; // we won the race to run now
                }
                return Ok(()); // we scheduled a re-run for the current runner
            }
            // lost the race, retry with a fresh read
        }

        if self.is_async {
            self.outstanding.store(ASYNC_OUTSTANDING, Ordering::Release);
        }

        loop {
            // Safety: we just won the END->BEGIN_x (or AGAIN_x->BEGIN_x, via
            // `resolve_after_completion`) CAS, which is the sole admission
            // point to this critical section; no other thread can be here
            // concurrently until we CAS state away from BEGIN_x/AGAIN_x.
            match unsafe { (*self.delegate.get())() } {
                Ok(()) => {
                    if self.is_async {
                        // Consumes exactly the "return" completion. In async
                        // mode this can never reach zero here: it starts at
                        // 2 and only this decrement happens on the run()
                        // path, so `complete()` is always the one that
                        // resolves state.
                        self.outstanding.fetch_sub(1, Ordering::AcqRel);
                        return Ok(());
                    }
                }
                Err(e) => {
                    self.clear_pending_rerun_after_error();
                    return Err(e);
                }
            }

            match self.resolve_after_completion() {
                Resolution::Done => return Ok(()),
                Resolution::RunAgain => continue,
            }
        }
    }

    /// Async mode only: records one of the two completions a logical run
    /// needs. If this is the completion that brings the count to zero and a
    /// re-run was scheduled in the meantime, drives that re-run on the
    /// calling thread.
    pub fn complete(&self) -> Result<(), RunnerError<E>> {
        if !self.is_async {
            return Err(RunnerError::InvalidState(
                "complete() called on a sync-mode runner",
            ));
        }
        let cur = self.state.load(Ordering::Acquire);
        if cur == END {
            return Err(RunnerError::InvalidState("no run active"));
        }

        let remaining = self.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining > 0 {
            return Ok(()); // still waiting on the delegate's own return
        }

        loop {
            match self.resolve_after_completion() {
                Resolution::Done => return Ok(()),
                // Safety: see `run()` — `resolve_after_completion` only
                // returns `RunAgain` to the single thread that just won the
                // AGAIN_x->BEGIN_x CAS, so this is the new sole owner.
                Resolution::RunAgain => match unsafe { (*self.delegate.get())() } {
                    Ok(()) => {
                        self.outstanding.fetch_sub(1, Ordering::AcqRel);
                        return Ok(());
                    }
                    Err(e) => {
                        self.clear_pending_rerun_after_error();
                        return Err(RunnerError::Delegate(e));
                    }
                },
            }
        }
    }

    /// Resolves state once a completion has landed: clears to `END` if no
    /// re-run is pending, or collapses `AGAIN_x` back into `BEGIN_x` and
    /// reports that the delegate must run again.
    fn resolve_after_completion(&self) -> Resolution {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            let target = match cur {
                BEGIN_1 | BEGIN_2 => END,
                AGAIN_1 => BEGIN_1,
                AGAIN_2 => {
                    if self.is_async {
                        self.outstanding.store(ASYNC_OUTSTANDING, Ordering::Release);
                    }
                    BEGIN_2
                }
                _ => unreachable!("invalid runner state"),
            };
            if self
                .state
                .compare_exchange(cur, target, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return if target == END {
                    Resolution::Done
                } else {
                    Resolution::RunAgain
                };
            }
        }
    }

    fn clear_pending_rerun_after_error(&self) {
        loop {
            let cur = self.state.load(Ordering::Acquire);
            let target = match cur {
                BEGIN_1 | AGAIN_1 | BEGIN_2 | AGAIN_2 => END,
                _ => unreachable!("invalid runner state"),
            };
            if self
                .state
                .compare_exchange(cur, target, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        self.state.load(Ordering::Acquire) == END
    }
}

enum Resolution {
    Done,
    RunAgain,
}

// Safety: `delegate` is only ever touched from within the CAS-guarded
// critical section in `run`/`complete`, which admits exactly one thread at
// a time; every other field is a plain atomic.
unsafe impl<F: Send, E> Sync for Runner<F, E> {}
unsafe impl<F: Send, E> Send for Runner<F, E> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    /// A single call to `run()` drives the delegate exactly once.
    #[test]
    fn test_single_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let runner: Runner<_, ()> = Runner::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        runner.run().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(runner.is_idle());
    }

    /// A recursive call to `run()` from inside the delegate collapses into
    /// exactly one extra re-run, not an unbounded recursion.
    #[test]
    fn test_reentrant_run_collapses_to_one_rerun() {
        struct Shared<E> {
            count: AtomicUsize,
            runner: Runner<Box<dyn FnMut() -> Result<(), E> + Send>, E>,
        }

        let shared: Arc<Shared<()>> = Arc::new_cyclic(|weak: &std::sync::Weak<Shared<()>>| {
            let weak = weak.clone();
            let delegate: Box<dyn FnMut() -> Result<(), ()> + Send> = Box::new(move || {
                let shared = weak.upgrade().unwrap();
                let n = shared.count.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    // Recurse exactly once: this must be collapsed into a
                    // single scheduled re-run, not executed inline.
                    shared.runner.run().unwrap();
                }
                Ok(())
            });
            Shared {
                count: AtomicUsize::new(0),
                runner: Runner::new(delegate),
            }
        });

        shared.runner.run().unwrap();
        assert_eq!(shared.count.load(Ordering::SeqCst), 2);
    }

    /// Async mode: the run doesn't resolve to idle until `complete()` is
    /// called, even though the delegate has already returned.
    #[test]
    fn test_async_waits_for_complete() {
        let runner: Runner<_, ()> = Runner::new_async(|| Ok(()));
        runner.run().unwrap();
        assert!(!runner.is_idle());
        runner.complete().unwrap();
        assert!(runner.is_idle());
    }

    /// Async mode: a run() arriving while the delegate is outstanding
    /// schedules a re-run that only fires once complete() resolves the
    /// first run, and that rerun executes on the completing thread.
    #[test]
    fn test_async_rerun_runs_on_completer() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let runner: Runner<_, ()> = Runner::new_async(move || {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        runner.run().unwrap();
        runner.run().unwrap(); // collapses into AGAIN_2
        assert_eq!(count.load(Ordering::SeqCst), 1);
        runner.complete().unwrap(); // resolves + immediately drives the rerun
        assert_eq!(count.load(Ordering::SeqCst), 2);
        // the rerun is itself async and awaits its own complete()
        assert!(!runner.is_idle());
        runner.complete().unwrap();
        assert!(runner.is_idle());
    }

    /// An error from the delegate clears any pending re-run rather than
    /// retrying, and propagates to the caller that observed the failure.
    #[test]
    fn test_error_clears_pending_rerun() {
        let runner: Runner<_, &'static str> = Runner::new(|| Err("boom"));
        let err = runner.run().unwrap_err();
        assert_eq!(err, "boom");
        assert!(runner.is_idle());
    }

    /// `complete()` on a sync-mode runner is a contract violation.
    #[test]
    fn test_complete_on_sync_runner_is_invalid_state() {
        let runner: Runner<_, ()> = Runner::new(|| Ok(()));
        runner.run().unwrap();
        match runner.complete() {
            Err(RunnerError::InvalidState(_)) => {}
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    /// `complete()` with no run active at all is also a contract violation.
    #[test]
    fn test_complete_with_no_run_active() {
        let runner: Runner<_, ()> = Runner::new_async(|| Ok(()));
        match runner.complete() {
            Err(RunnerError::InvalidState(_)) => {}
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    /// Concurrent callers racing `run()` never overlap delegate execution,
    /// and every call is eventually observed (either directly or via a
    /// collapsed re-run).
    #[test]
    fn test_concurrent_run_never_overlaps() {
        let overlapping = Arc::new(AtomicUsize::new(0));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let in_flight_d = in_flight.clone();
        let overlapping_d = overlapping.clone();
        let completed_d = completed.clone();
        let runner: Arc<Runner<_, ()>> = Arc::new(Runner::new(move || {
            if in_flight_d.fetch_add(1, Ordering::SeqCst) != 0 {
                overlapping_d.fetch_add(1, Ordering::SeqCst);
            }
            std::thread::yield_now();
            in_flight_d.fetch_sub(1, Ordering::SeqCst);
            completed_d.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let runner = runner.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        runner.run().unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(overlapping.load(Ordering::SeqCst), 0);
        assert!(completed.load(Ordering::SeqCst) >= 1);
    }
}
