//! The two interfaces a caller implements to sit on either end of the pipe:
//! a [`Subscriber`] receives items, and the [`Subscription`] it is handed
//! back lets it ask for more or walk away.

use crate::error::{ConsumeFailure, CoreError};

/// Receives the lifecycle callbacks of a single subscription.
///
/// `on_subscribe` is always the first callback observed, and at most one of
/// `on_complete`/`on_error` is the last; `on_next` may occur zero or more
/// times strictly in between, never overlapping with any other callback for
/// the same subscription.
pub trait Subscriber<T>: Send {
    /// Called exactly once, before any other callback. `subscription` is a
    /// deferred proxy: `request`/`cancel` calls made here are buffered and
    /// replayed in order once installation completes.
    fn on_subscribe(&mut self, subscription: Box<dyn Subscription>);

    /// Called with each delivered item. Never overlaps with another
    /// `on_next`, nor with `on_subscribe`, nor with the terminal event.
    ///
    /// Returning `Err` is this trait's replacement for the source's
    /// exception-driven failure path: the item is handed back (it was
    /// never actually consumed), reported to this same subscriber's
    /// `on_error`, and the failure propagates to the caller that drove the
    /// delivery (`announce`/`subscribe`), exactly once each.
    fn on_next(&mut self, item: T) -> Result<(), ConsumeFailure<T>>;

    /// Called once, at most, as the terminal event, unless `on_complete`
    /// already fired for this subscription.
    fn on_error(&mut self, error: CoreError);

    /// Called once, at most, as the terminal event, unless `on_error`
    /// already fired for this subscription.
    fn on_complete(&mut self);
}

/// Handed to a [`Subscriber`] so it can control demand and walk away.
pub trait Subscription: Send {
    /// Requests up to `n` further items. `n < 1` is a terminal
    /// [`CoreError::InvalidDemand`] delivered to the subscriber's
    /// `on_error`, never a panic.
    fn request(&self, n: u64);

    /// Idempotent; guaranteed to reach the delegate at most once.
    fn cancel(&self);
}
