//! Push-pull publisher: the end-user façade that wires a user-supplied
//! generator and lifecycle hooks to [`UnicastCore`] via a per-subscription
//! [`TransferService`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::core::transfer::TransferService;
use crate::core::unicast::UnicastCore;
use crate::error::{ConsumeFailure, CoreError};
use crate::subscriber::{Subscriber, Subscription};

type Generator<T> = Box<dyn FnMut() -> Result<Option<T>, Box<dyn std::error::Error + Send + Sync>> + Send>;
type Recycler<T> = Box<dyn FnMut(T) + Send>;
type OnGeneratorError<T> = Box<dyn FnMut(&Arc<Publisher<T>>) + Send>;
type OnNextError<T> = Box<dyn FnMut(&Arc<Publisher<T>>) + Send>;
type OnEachCancel<T> = Box<dyn FnMut(&Arc<Publisher<T>>) + Send>;
type PostMortem<T> = Box<dyn FnMut(&Arc<Publisher<T>>) + Send>;

fn no_op_hook<T>() -> Box<dyn FnMut(&Arc<Publisher<T>>) + Send> {
    Box::new(|_| {})
}

/// End-user façade composing [`UnicastCore`] (one active subscriber at a
/// time) with a per-subscription [`TransferService`] whose producer is the
/// user's generator and whose consumer delivers to that subscriber.
pub struct Publisher<T> {
    core: UnicastCore<T>,
    generator: Mutex<Generator<T>>,
    recycler: Mutex<Recycler<T>>,
    on_generator_error: Mutex<OnGeneratorError<T>>,
    on_next_error: Mutex<OnNextError<T>>,
    on_each_cancel: Mutex<OnEachCancel<T>>,
    post_mortem: Mutex<PostMortem<T>>,
    current_transfer: Mutex<Option<Arc<TransferService<T>>>>,
}

impl<T: Send + 'static> Publisher<T> {
    /// Runs the subscribe protocol for `subscriber`, building this
    /// subscription's private [`TransferService`] once the slot commits.
    pub fn subscribe<S: Subscriber<T> + 'static>(self: &Arc<Self>, subscriber: S) {
        let weak = Arc::downgrade(self);
        self.core.subscribe(subscriber, move |id| {
            let transfer = new_transfer_for(weak.clone(), id);
            if let Some(publisher) = weak.upgrade() {
                *publisher.current_transfer.lock().unwrap() = Some(transfer.clone());
            }
            Arc::new(SubscriptionHandle { publisher: weak, id, transfer }) as Arc<dyn Subscription>
        });
    }

    /// Push hint: re-attempts the currently active subscription's transfer,
    /// if any. A generator failure that no active subscriber received is
    /// propagated to this call's caller.
    pub fn announce(self: &Arc<Self>) -> Result<(), CoreError> {
        let transfer = self.current_transfer.lock().unwrap().clone();
        match transfer {
            Some(t) => t.try_transfer(),
            None => Ok(()),
        }
    }

    /// Delivers `error` to the active subscription without closing the
    /// publisher as a whole (the slot returns to `Accepting`/`NotReusable`
    /// per the reuse policy, exactly as an on-next failure would).
    pub fn error(self: &Arc<Self>, error: CoreError) {
        let Some(transfer) = self.current_transfer.lock().unwrap().clone() else {
            return;
        };
        let expected = self.core.active_id();
        let weak = Arc::downgrade(self);
        let _ = transfer.finish_with(Box::new(move || {
            if let Some(publisher) = weak.upgrade() {
                publisher.core.signal_error(error, expected);
            }
        }));
    }

    /// Completes the active subscription normally.
    pub fn complete(self: &Arc<Self>) {
        let Some(transfer) = self.current_transfer.lock().unwrap().clone() else {
            return;
        };
        let expected = self.core.active_id();
        let weak = Arc::downgrade(self);
        let _ = transfer.finish_with(Box::new(move || {
            if let Some(publisher) = weak.upgrade() {
                publisher.core.signal_complete(expected);
            }
        }));
    }

    /// Shuts the whole publisher down with a default invalid-state cause.
    pub fn stop(self: &Arc<Self>) {
        self.stop_with(CoreError::InvalidState("publisher stopped"));
    }

    /// Shuts the whole publisher down, delivering `error` to the
    /// formerly-active subscriber if there was one.
    pub fn stop_with(self: &Arc<Self>, error: CoreError) {
        if let Some(mut sub) = self.core.shutdown() {
            sub.on_error(error);
        }
        *self.current_transfer.lock().unwrap() = None;
    }
}

/// Builds a [`TransferService`] whose producer wraps the publisher's
/// generator, self-stopping the publisher on failure, completing early if
/// the generator never yields a single item, and whose consumer delivers to
/// the subscriber installed at `id`.
fn new_transfer_for<T: Send + 'static>(weak: Weak<Publisher<T>>, id: u64) -> Arc<TransferService<T>> {
    let ever_produced = Arc::new(AtomicBool::new(false));

    let producer_weak = weak.clone();
    let ever_produced_for_producer = ever_produced.clone();
    let producer: crate::core::transfer::Producer<T> = Box::new(move || {
        let Some(publisher) = producer_weak.upgrade() else {
            return Ok(None);
        };
        let produced = (publisher.generator.lock().unwrap())();
        match produced {
            Ok(Some(item)) => {
                ever_produced_for_producer.store(true, Ordering::Release);
                Ok(Some(item))
            }
            // An empty producer: if it has never yielded anything for this
            // subscription, the stream is empty, not merely quiescent —
            // complete it now rather than waiting on a push hint that will
            // never come. Once at least one item has been delivered, `None`
            // instead means "nothing ready yet" and is a normal no-op.
            Ok(None) => {
                if !ever_produced_for_producer.load(Ordering::Acquire) {
                    if let Some(transfer) = publisher.current_transfer.lock().unwrap().take() {
                        transfer.finish();
                    }
                    publisher.core.signal_complete(Some(id));
                    (publisher.post_mortem.lock().unwrap())(&publisher);
                }
                Ok(None)
            }
            Err(cause) => {
                let shutdown_result = publisher.core.shutdown();
                (publisher.on_generator_error.lock().unwrap())(&publisher);
                if let Some(transfer) = publisher.current_transfer.lock().unwrap().take() {
                    transfer.finish();
                }
                match shutdown_result {
                    Some(mut sub) => {
                        sub.on_error(CoreError::GeneratorFailure { cause });
                        Ok(None)
                    }
                    None => Err(CoreError::GeneratorFailure { cause }),
                }
            }
        }
    });

    let consumer_weak = weak.clone();
    let consumer: crate::core::transfer::Consumer<T> = Box::new(move |item| {
        let Some(publisher) = consumer_weak.upgrade() else {
            return Ok(());
        };
        match publisher.core.signal_next(item, Some(id)) {
            Ok(_delivered) => Ok(()),
            Err(core_failure) => {
                (publisher.on_next_error.lock().unwrap())(&publisher);
                Err(ConsumeFailure { item: core_failure.item, cause: core_failure.cause })
            }
        }
    });

    let recycler_weak = weak;
    let on_consumer_error: crate::core::transfer::OnConsumerError<T> = Box::new(move |item| {
        if let Some(publisher) = recycler_weak.upgrade() {
            (publisher.recycler.lock().unwrap())(item);
        }
    });

    TransferService::new(producer, consumer, on_consumer_error)
}

struct SubscriptionHandle<T> {
    publisher: Weak<Publisher<T>>,
    id: u64,
    transfer: Arc<TransferService<T>>,
}

impl<T: Send + 'static> Subscription for SubscriptionHandle<T> {
    fn request(&self, n: u64) {
        if let Err(e) = self.transfer.increase_demand(n) {
            if let Some(publisher) = self.publisher.upgrade() {
                publisher.core.signal_error(e, Some(self.id));
            }
        }
    }

    fn cancel(&self) {
        self.transfer.finish();
        self.transfer.try_transfer().ok();
        let Some(publisher) = self.publisher.upgrade() else {
            return;
        };
        publisher.core.clear_on_cancel(self.id);
        {
            let mut guard = publisher.current_transfer.lock().unwrap();
            if guard.as_ref().is_some_and(|t| Arc::ptr_eq(t, &self.transfer)) {
                *guard = None;
            }
        }
        (publisher.on_each_cancel.lock().unwrap())(&publisher);
    }
}

/// Configures and builds a [`Publisher`], the idiomatic single entry point
/// replacing the three ad-hoc factory functions implied by the variant
/// table: one typed builder, three presets for its defaults.
pub struct PushPullPublisherBuilder<T> {
    reusable: bool,
    generator: Generator<T>,
    recycler: Recycler<T>,
    on_generator_error: OnGeneratorError<T>,
    on_next_error: OnNextError<T>,
    on_each_cancel: OnEachCancel<T>,
    post_mortem: PostMortem<T>,
}

impl<T: Send + 'static> PushPullPublisherBuilder<T> {
    fn blank(reusable: bool) -> Self {
        Self {
            reusable,
            generator: Box::new(|| Ok(None)),
            recycler: Box::new(|_| {}),
            on_generator_error: no_op_hook(),
            on_next_error: no_op_hook(),
            on_each_cancel: no_op_hook(),
            post_mortem: no_op_hook(),
        }
    }

    /// Reusable variant: a terminated subscription returns the slot to
    /// `Accepting`; every lifecycle hook defaults to a no-op.
    pub fn reusable() -> Self {
        Self::blank(true)
    }

    /// Hybrid variant: reusable until the first on-next failure, at which
    /// point the publisher stops for good and runs post-mortem.
    pub fn hybrid() -> Self {
        let mut b = Self::blank(true);
        b.on_next_error = Box::new(|publisher| {
            publisher.stop();
            (publisher.post_mortem.lock().unwrap())(publisher);
        });
        b.on_generator_error = Box::new(|publisher| {
            (publisher.post_mortem.lock().unwrap())(publisher);
        });
        b
    }

    /// Non-reusable variant: the slot never returns to `Accepting`, and
    /// every unplanned end-of-life runs post-mortem.
    pub fn non_reusable() -> Self {
        let mut b = Self::blank(false);
        b.on_each_cancel = Box::new(|publisher| {
            (publisher.post_mortem.lock().unwrap())(publisher);
        });
        b.on_next_error = Box::new(|publisher| {
            (publisher.post_mortem.lock().unwrap())(publisher);
        });
        b.on_generator_error = Box::new(|publisher| {
            (publisher.post_mortem.lock().unwrap())(publisher);
        });
        b
    }

    pub fn generator(
        mut self,
        generator: impl FnMut() -> Result<Option<T>, Box<dyn std::error::Error + Send + Sync>> + Send + 'static,
    ) -> Self {
        self.generator = Box::new(generator);
        self
    }

    pub fn recycler(mut self, recycler: impl FnMut(T) + Send + 'static) -> Self {
        self.recycler = Box::new(recycler);
        self
    }

    pub fn on_generator_error(mut self, hook: impl FnMut(&Arc<Publisher<T>>) + Send + 'static) -> Self {
        self.on_generator_error = Box::new(hook);
        self
    }

    pub fn on_next_error(mut self, hook: impl FnMut(&Arc<Publisher<T>>) + Send + 'static) -> Self {
        self.on_next_error = Box::new(hook);
        self
    }

    pub fn on_each_cancel(mut self, hook: impl FnMut(&Arc<Publisher<T>>) + Send + 'static) -> Self {
        self.on_each_cancel = Box::new(hook);
        self
    }

    pub fn post_mortem(mut self, hook: impl FnMut(&Arc<Publisher<T>>) + Send + 'static) -> Self {
        self.post_mortem = Box::new(hook);
        self
    }

    pub fn build(self) -> Arc<Publisher<T>> {
        Arc::new(Publisher {
            core: UnicastCore::new(self.reusable),
            generator: Mutex::new(self.generator),
            recycler: Mutex::new(self.recycler),
            on_generator_error: Mutex::new(self.on_generator_error),
            on_next_error: Mutex::new(self.on_next_error),
            on_each_cancel: Mutex::new(self.on_each_cancel),
            post_mortem: Mutex::new(self.post_mortem),
            current_transfer: Mutex::new(None),
        })
    }
}
