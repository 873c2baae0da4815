//! Single-subscriber slot registry: the installation handshake, termination
//! signalling, and the reuse/non-reuse policy that decides where a
//! terminated slot goes next.

use std::sync::{Arc, Mutex};

use crate::core::subscription::{CancelOnlySubscription, DeferredSubscription};
use crate::error::{ConsumeFailure, CoreError, OpaqueError};
use crate::subscriber::{Subscriber, Subscription};

enum Slot<T> {
    Accepting,
    Installing,
    /// Checked out for the duration of a single `on_next` call; never
    /// observed outside [`UnicastCore::signal_next`] and the ops that wait
    /// past it. The `bool` records whether a cancel landed while the
    /// subscriber was checked out, so the put-back in `signal_next` knows to
    /// clear the slot instead of restoring it to `Active`.
    Delivering(u64, bool),
    Active(u64, Box<dyn Subscriber<T>>),
    NotReusable,
    Closed,
}

fn classify_rejection<T>(slot: &Slot<T>) -> &'static str {
    match slot {
        Slot::Accepting => unreachable!("Accepting is never a rejection witness"),
        Slot::Installing | Slot::Delivering(..) | Slot::Active(..) => "already has a subscriber",
        Slot::NotReusable => "already subscribed, not reusable",
        Slot::Closed => "publisher shut down",
    }
}

/// Owns the single subscriber slot described in the data model: at most one
/// `Active` subscriber exists at a time, and once `Closed` nothing leaves
/// `Closed`.
pub struct UnicastCore<T> {
    slot: Mutex<Slot<T>>,
    reusable: bool,
    next_id: std::sync::atomic::AtomicU64,
}

impl<T: Send + 'static> UnicastCore<T> {
    pub fn new(reusable: bool) -> Self {
        Self {
            slot: Mutex::new(Slot::Accepting),
            reusable,
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn cleared_tag(&self) -> Slot<T> {
        if self.reusable {
            Slot::Accepting
        } else {
            Slot::NotReusable
        }
    }

    /// Atomically replaces the slot, giving `f` the previous value and
    /// letting it compute the next one plus a result. The single mutex is
    /// this type's rendering of the data model's "all atomic, CAS" rule:
    /// one critical section, no half-observed states.
    fn transition<R>(&self, f: impl FnOnce(Slot<T>) -> (Slot<T>, R)) -> R {
        let mut guard = self.slot.lock().unwrap();
        let old = std::mem::replace(&mut *guard, Slot::Closed);
        let (new, result) = f(old);
        *guard = new;
        result
    }

    /// Like [`Self::transition`], but if the slot is currently `Delivering`
    /// (an `on_next` call is in flight on another thread) it spins until
    /// that resolves before handing `f` the result. Used by every operation
    /// that needs the real subscriber reference to fire a terminal callback,
    /// so it never fires against a slot whose subscriber is mid-callback.
    fn transition_past_delivery<R>(&self, mut f: impl FnMut(Slot<T>) -> (Slot<T>, R)) -> R {
        loop {
            let mut guard = self.slot.lock().unwrap();
            if matches!(&*guard, Slot::Delivering(..)) {
                drop(guard);
                std::hint::spin_loop();
                continue;
            }
            let old = std::mem::replace(&mut *guard, Slot::Closed);
            let (new, result) = f(old);
            *guard = new;
            return result;
        }
    }

    pub fn active_id(&self) -> Option<u64> {
        match &*self.slot.lock().unwrap() {
            Slot::Active(id, _) | Slot::Delivering(id, _) => Some(*id),
            _ => None,
        }
    }

    /// Runs the four-step subscribe protocol. `make_subscription` is called
    /// exactly once, after the slot commits to `Active`, and builds the real
    /// delegate subscription (and whatever private per-subscription state it
    /// needs) now that the assigned id is known.
    pub fn subscribe<S, M>(&self, subscriber: S, make_subscription: M)
    where
        S: Subscriber<T> + 'static,
        M: FnOnce(u64) -> Arc<dyn Subscription>,
    {
        let mut subscriber: Box<dyn Subscriber<T>> = Box::new(subscriber);

        // Step 1: CAS Accepting -> Installing.
        let reject_reason = self.transition(|old| match old {
            Slot::Accepting => (Slot::Installing, None),
            other => {
                let reason = classify_rejection(&other);
                (other, Some(reason))
            }
        });
        if let Some(reason) = reject_reason {
            self.reject(subscriber, reason);
            return;
        }

        // Step 2: hand the subscriber a deferred proxy. A subscriber that
        // cancels synchronously here takes effect immediately and the slot
        // rolls back without ever reaching `Active`.
        let proxy = DeferredSubscription::new();
        subscriber.on_subscribe(Box::new(DeferredSubscriptionHandle(proxy.clone())));

        if proxy.cancelled_before_activation() {
            self.transition(|old| match old {
                Slot::Installing => (self.cleared_tag(), ()),
                other => (other, ()),
            });
            return;
        }

        // Step 3: CAS Installing -> Active(id, subscriber).
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let commit_failed_subscriber = self.transition(|old| match old {
            Slot::Installing => (Slot::Active(id, subscriber), None),
            Slot::Closed => (Slot::Closed, Some(subscriber)),
            _ => {
                tracing::error!(
                    target: "unicast_pipe::core::unicast",
                    "contract violation: slot left Installing unexpectedly"
                );
                unreachable!("contract violation: slot left Installing unexpectedly")
            }
        });

        if let Some(mut subscriber) = commit_failed_subscriber {
            // Shutdown raced us during initialization (scenario 6).
            if !proxy.cancelled_before_activation() {
                subscriber.on_error(CoreError::InvalidState(
                    "publisher shut down during initialization",
                ));
            }
            return;
        }

        // Step 4: activate, draining buffered demand to the real delegate.
        let delegate = make_subscription(id);
        proxy.activate(delegate);
    }

    fn reject(&self, mut subscriber: Box<dyn Subscriber<T>>, reason: &'static str) {
        let cancel_only = CancelOnlySubscription::new();
        subscriber.on_subscribe(Box::new(CancelOnlySubscriptionHandle(cancel_only.clone())));
        if !cancel_only.is_cancelled() {
            subscriber.on_error(CoreError::InvalidState(reason));
        }
    }

    /// Delivers `item` to the active subscriber iff the slot is `Active`
    /// (and matches `expected` when given). Returns `Ok(false)` if nothing
    /// was delivered. If `on_next` fails, the slot is cleared per the reuse
    /// policy and the error is both reported to the subscriber's `on_error`
    /// and returned to the caller.
    pub fn signal_next(&self, item: T, expected: Option<u64>) -> Result<bool, ConsumeFailure<T>> {
        let checkout = self.transition(|old| match old {
            Slot::Active(id, sub) if expected.map_or(true, |e| e == id) => {
                (Slot::Delivering(id, false), Some((id, sub)))
            }
            other => (other, None),
        });
        let Some((id, mut sub)) = checkout else {
            return Ok(false);
        };

        match sub.on_next(item) {
            Ok(()) => {
                self.transition(|old| match old {
                    // A cancel landed while on_next was running: honor it
                    // now instead of resurrecting the subscriber.
                    Slot::Delivering(cur, true) if cur == id => (self.cleared_tag(), ()),
                    Slot::Delivering(cur, false) if cur == id => (Slot::Active(cur, sub), ()),
                    // Slot moved elsewhere while delivery was in flight
                    // (concurrent shutdown): drop the subscriber we were
                    // holding, the terminal path already ran.
                    other => (other, ()),
                });
                Ok(true)
            }
            Err(ConsumeFailure { item, cause }) => {
                self.transition(|old| match old {
                    Slot::Delivering(cur, _) if cur == id => (self.cleared_tag(), ()),
                    other => (other, ()),
                });
                let rethrown = CoreError::subscriber_failure(OpaqueError::new(cause.to_string()));
                sub.on_error(cause);
                Err(ConsumeFailure { item, cause: rethrown })
            }
        }
    }

    /// Clears the slot and calls `on_complete` outside any lock.
    pub fn signal_complete(&self, expected: Option<u64>) {
        let checkout = self.transition_past_delivery(|old| match old {
            Slot::Active(id, sub) if expected.map_or(true, |e| e == id) => {
                (self.cleared_tag(), Some(sub))
            }
            other => (other, None),
        });
        if let Some(mut sub) = checkout {
            sub.on_complete();
        }
    }

    /// Clears the slot and calls `on_error` outside any lock. Failures from
    /// the subscriber's own `on_error` are not this core's concern to
    /// propagate; they are caught and logged instead, per the policy that
    /// the subscriber's error handler is the one place a failure is only
    /// ever logged (the alternative risks an infinite error cascade).
    /// Returns whether a subscriber actually received the error.
    pub fn signal_error(&self, error: CoreError, expected: Option<u64>) -> bool {
        let checkout = self.transition_past_delivery(|old| match old {
            Slot::Active(id, sub) if expected.map_or(true, |e| e == id) => {
                (self.cleared_tag(), Some(sub))
            }
            other => (other, None),
        });
        match checkout {
            Some(mut sub) => {
                let message = error.to_string();
                if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| sub.on_error(error)))
                    .is_err()
                {
                    tracing::warn!(
                        target: "unicast_pipe::core::unicast",
                        error = %message,
                        "subscriber's on_error panicked; swallowing"
                    );
                }
                true
            }
            None => false,
        }
    }

    /// CAS any non-`Active` state to `Closed`. Returns whether the slot is
    /// `Closed` afterward (true even if it already was).
    pub fn try_shutdown(&self) -> bool {
        self.transition(|old| match old {
            Slot::Active(..) | Slot::Delivering(..) => (old, false),
            _ => (Slot::Closed, true),
        })
    }

    /// Unconditional CAS to `Closed`. Returns the previously-active
    /// subscriber, if any, so the caller can signal it a terminal event.
    pub fn shutdown(&self) -> Option<Box<dyn Subscriber<T>>> {
        self.transition_past_delivery(|old| match old {
            Slot::Active(_, sub) => (Slot::Closed, Some(sub)),
            _ => (Slot::Closed, None),
        })
    }

    /// Drops the slot back to available without calling any subscriber
    /// callback, matching a cancel that won the race against a terminal
    /// signal (scenario 5: the subscriber observes no terminal at all).
    ///
    /// If a cancel lands while the subscriber is mid-`on_next`
    /// (`Delivering`), it cannot clear the slot directly — the subscriber is
    /// checked out and `signal_next` still needs to put it back somewhere.
    /// Instead it flags the in-flight delivery as cancelled; `signal_next`'s
    /// put-back honors that flag by clearing the slot instead of restoring
    /// `Active`, so the cancel still takes effect exactly once, just
    /// slightly deferred.
    pub fn clear_on_cancel(&self, expected: u64) {
        self.transition(|old| match old {
            Slot::Active(id, _) if id == expected => (self.cleared_tag(), ()),
            Slot::Delivering(id, _) if id == expected => (Slot::Delivering(id, true), ()),
            other => (other, ()),
        });
    }
}

struct DeferredSubscriptionHandle(Arc<DeferredSubscription>);

impl Subscription for DeferredSubscriptionHandle {
    fn request(&self, n: u64) {
        self.0.request(n);
    }

    fn cancel(&self) {
        self.0.cancel();
    }
}

struct CancelOnlySubscriptionHandle(Arc<CancelOnlySubscription>);

impl Subscription for CancelOnlySubscriptionHandle {
    fn request(&self, n: u64) {
        self.0.request(n);
    }

    fn cancel(&self) {
        self.0.cancel();
    }
}
