use std::fmt;

/// Errors surfaced by the core pipeline.
///
/// `SubscriberOnErrorFailure` deliberately has no variant here: per the
/// propagation policy a failure raised from inside a subscriber's own
/// `on_error` is only ever logged, never returned to a caller.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// `request(n)` was called with `n < 1`.
    #[error("invalid demand: requested {0}, demand must be >= 1")]
    InvalidDemand(u64),

    /// A caller observed (or caused) a state transition the contract forbids,
    /// e.g. `complete()` on a sync-mode runner, or a rebind during install.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// The publisher has no slot to subscribe into (closed, or non-reusable
    /// and already spent).
    #[error("publisher closed: {0}")]
    PublisherClosed(&'static str),

    /// The subscriber's `on_subscribe` or `on_next` raised.
    #[error("subscriber failed: {0}")]
    SubscriberFailure(Box<dyn std::error::Error + Send + Sync>),

    /// The generator raised; wraps the original cause so a subscriber's
    /// `on_error` can still see it even though the failure didn't come
    /// from the subscriber itself.
    #[error("generator failed: {cause}")]
    GeneratorFailure {
        cause: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl CoreError {
    pub fn generator_failure<E>(cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CoreError::GeneratorFailure {
            cause: Box::new(cause),
        }
    }

    pub fn subscriber_failure<E>(cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CoreError::SubscriberFailure(Box::new(cause))
    }
}

/// Carries a value back to its caller alongside the reason its consumption
/// failed — the same "give the value back on failure" idiom a bounded
/// channel uses for a rejected send (`TrySendErr::Full(value)`). Used both
/// by the transfer service's consumer callback and by `Subscriber::on_next`.
pub struct ConsumeFailure<T> {
    pub item: T,
    pub cause: CoreError,
}

/// A boxed, opaque cause used where callers pass arbitrary panics/errors
/// across the generator/consumer boundary.
#[derive(Debug)]
pub struct OpaqueError(pub String);

impl fmt::Display for OpaqueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for OpaqueError {}

impl OpaqueError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
