//! Serial transfer service: moves items one at a time from a producer
//! function to a consumer function, gated by a [`DemandCell`], using
//! [`Runner`] as the mutual-exclusion primitive so producer and consumer
//! are never invoked concurrently or recursively.

use std::cell::UnsafeCell;
use std::sync::{Arc, Weak};

use crate::core::demand::DemandCell;
use crate::core::runner::Runner;
use crate::error::{ConsumeFailure, CoreError};

pub(crate) type Producer<T> = Box<dyn FnMut() -> Result<Option<T>, CoreError> + Send>;
pub(crate) type Consumer<T> = Box<dyn FnMut(T) -> Result<(), ConsumeFailure<T>> + Send>;
pub(crate) type OnConsumerError<T> = Box<dyn FnMut(T) + Send>;
pub(crate) type PostTransfer = Box<dyn FnOnce() + Send>;

struct Cells<T> {
    producer: UnsafeCell<Producer<T>>,
    consumer: UnsafeCell<Consumer<T>>,
    on_consumer_error: UnsafeCell<OnConsumerError<T>>,
    /// Written at most once, by whichever `finish_with` call wins the
    /// demand cell's `FINISHED` CAS (see `DemandCell::finish`); every other
    /// path only ever reads it after observing `FINISHED`. Single-writer,
    /// so the plain `UnsafeCell` access below never races.
    post_transfer: UnsafeCell<Option<PostTransfer>>,
}

// Safety: every field is touched only from within the runner-guarded
// critical section (`transfer_step`), except `post_transfer`, whose
// single-writer property is documented above.
unsafe impl<T: Send> Send for Cells<T> {}
unsafe impl<T: Send> Sync for Cells<T> {}

pub struct TransferService<T> {
    demand: DemandCell,
    cells: Cells<T>,
    runner: Runner<Box<dyn FnMut() -> Result<(), CoreError> + Send>, CoreError>,
}

impl<T: 'static> TransferService<T> {
    pub fn new(
        producer: Producer<T>,
        consumer: Consumer<T>,
        on_consumer_error: OnConsumerError<T>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let delegate: Box<dyn FnMut() -> Result<(), CoreError> + Send> =
                Box::new(move || {
                    // `weak` always upgrades here: the delegate only ever
                    // runs while called from a live `&Arc<Self>` method.
                    let this = weak.upgrade().expect("transfer service dropped mid-run");
                    this.transfer_step()
                });
            Self {
                demand: DemandCell::new(),
                cells: Cells {
                    producer: UnsafeCell::new(producer),
                    consumer: UnsafeCell::new(consumer),
                    on_consumer_error: UnsafeCell::new(on_consumer_error),
                    post_transfer: UnsafeCell::new(None),
                },
                runner: Runner::new(delegate),
            }
        })
    }

    /// Adds `n` to outstanding demand, then immediately attempts a
    /// transfer. `n < 1` is a terminal invalid-demand error.
    pub fn increase_demand(&self, n: u64) -> Result<(), CoreError> {
        self.demand.increase(n)?;
        self.try_transfer()
    }

    /// Runs the transfer step under the serial runner. Callable from any
    /// thread at any time; never blocks.
    pub fn try_transfer(&self) -> Result<(), CoreError> {
        self.runner.run()
    }

    /// CAS demand to finished. Returns `true` only if this call performed
    /// the transition.
    pub fn finish(&self) -> bool {
        self.demand.finish()
    }

    /// Same as [`Self::finish`], but if the transition succeeds the given
    /// callback is recorded and a transfer is re-signalled so it runs
    /// serially, under the runner, after the last real transfer.
    pub fn finish_with(&self, callback: PostTransfer) -> Result<(), CoreError> {
        if self.demand.finish() {
            // Safety: we are the single winner of the FINISHED CAS above;
            // no other thread can reach this write.
            unsafe { *self.cells.post_transfer.get() = Some(callback) };
            self.try_transfer()
        } else {
            Ok(())
        }
    }

    pub fn is_finished(&self) -> bool {
        self.demand.is_finished()
    }

    /// Runs the post-transfer callback if finished, otherwise produces and
    /// delivers at most one item, re-signalling itself if demand remains.
    /// Exclusive access is guaranteed by the enclosing `Runner`.
    fn transfer_step(&self) -> Result<(), CoreError> {
        if self.demand.is_finished() {
            // Safety: single-writer as documented on `Cells::post_transfer`;
            // we're also the sole reader, since only one thread is ever
            // inside this runner-guarded section at a time.
            let callback = unsafe { (*self.cells.post_transfer.get()).take() };
            if let Some(cb) = callback {
                cb();
            }
            return Ok(());
        }

        if !self.demand.has_demand() {
            return Ok(());
        }

        // Safety: exclusive access to producer/consumer/on_consumer_error
        // is guaranteed by the Runner that invokes this closure.
        let produced = unsafe { (*self.cells.producer.get())() };
        let item = match produced {
            Ok(Some(item)) => item,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.demand.finish();
                return Err(e);
            }
        };

        let consumed = unsafe { (*self.cells.consumer.get())(item) };
        if let Err(ConsumeFailure { item, cause }) = consumed {
            self.demand.finish();
            unsafe { (*self.cells.on_consumer_error.get())(item) };
            // The item was semantically consumed even though delivery failed.
            self.demand.decrement_one_after_delivery();
            return Err(cause);
        }

        self.demand.decrement_one_after_delivery();

        if self.demand.has_demand() {
            // Re-entrant call: collapses into a single scheduled re-run of
            // this very delegate, driven inline once this invocation
            // returns (see `core::runner`).
            self.try_transfer()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn producer_from(items: Vec<i32>) -> Producer<i32> {
        let items = Mutex::new(items.into_iter());
        Box::new(move || Ok(items.lock().unwrap().next()))
    }

    /// With demand satisfied up front, an ordered producer drains fully and
    /// consumer sees every item exactly once, in order.
    #[test]
    fn test_drains_in_order_under_sufficient_demand() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_c = received.clone();
        let consumer: Consumer<i32> = Box::new(move |item| {
            received_c.lock().unwrap().push(item);
            Ok(())
        });
        let svc = TransferService::new(
            producer_from(vec![1, 2, 3]),
            consumer,
            Box::new(|_| {}),
        );
        svc.increase_demand(10).unwrap();
        assert_eq!(*received.lock().unwrap(), vec![1, 2, 3]);
    }

    /// Demand of exactly 1 delivers exactly one item per increase.
    #[test]
    fn test_demand_gates_delivery_one_at_a_time() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let received_c = received.clone();
        let consumer: Consumer<i32> = Box::new(move |item| {
            received_c.lock().unwrap().push(item);
            Ok(())
        });
        let svc = TransferService::new(
            producer_from(vec![1, 2, 3]),
            consumer,
            Box::new(|_| {}),
        );
        svc.increase_demand(1).unwrap();
        assert_eq!(*received.lock().unwrap(), vec![1]);
        svc.increase_demand(1).unwrap();
        assert_eq!(*received.lock().unwrap(), vec![1, 2]);
    }

    /// `increase_demand(0)` is rejected before any transfer is attempted.
    #[test]
    fn test_increase_demand_zero_rejected() {
        let svc = TransferService::new(
            producer_from(vec![1]),
            Box::new(|_| Ok(())),
            Box::new(|_| {}),
        );
        match svc.increase_demand(0) {
            Err(CoreError::InvalidDemand(0)) => {}
            other => panic!("expected InvalidDemand(0), got {other:?}"),
        }
    }

    /// A consumer failure finishes demand, routes the failed item to the
    /// on-consumer-error hook, and propagates the original cause.
    #[test]
    fn test_consumer_failure_routes_to_recycler_and_propagates() {
        let recycled = Arc::new(Mutex::new(Vec::new()));
        let recycled_c = recycled.clone();
        let consumer: Consumer<i32> =
            Box::new(|item| Err(ConsumeFailure { item, cause: CoreError::InvalidState("boom") }));
        let svc = TransferService::new(
            producer_from(vec![1]),
            consumer,
            Box::new(move |item| recycled_c.lock().unwrap().push(item)),
        );
        let err = svc.increase_demand(1).unwrap_err();
        assert!(matches!(err, CoreError::InvalidState("boom")));
        assert_eq!(*recycled.lock().unwrap(), vec![1]);
        assert!(svc.is_finished());
    }

    /// A producer failure finishes demand and propagates.
    #[test]
    fn test_producer_failure_finishes_and_propagates() {
        let producer: Producer<i32> = Box::new(|| Err(CoreError::InvalidState("producer broke")));
        let svc = TransferService::new(producer, Box::new(|_| Ok(())), Box::new(|_| {}));
        let err = svc.increase_demand(1).unwrap_err();
        assert!(matches!(err, CoreError::InvalidState("producer broke")));
        assert!(svc.is_finished());
    }

    /// `finish_with` runs its callback exactly once, serially, after the
    /// last real transfer.
    #[test]
    fn test_finish_with_runs_callback_once() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_c = ran.clone();
        let svc = TransferService::new(
            producer_from(vec![]),
            Box::new(|_| Ok(())),
            Box::new(|_| {}),
        );
        svc.finish_with(Box::new(move || {
            ran_c.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        // further transfer attempts don't re-run the callback
        svc.try_transfer().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    /// An empty producer (returns `None` immediately) never calls the
    /// consumer and does not touch demand.
    #[test]
    fn test_empty_producer_never_consumes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_c = calls.clone();
        let consumer: Consumer<i32> = Box::new(move |_item| {
            calls_c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let svc = TransferService::new(producer_from(vec![]), consumer, Box::new(|_| {}));
        svc.increase_demand(5).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
