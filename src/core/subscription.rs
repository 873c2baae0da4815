//! The two concrete [`Subscription`] implementations the unicast core hands
//! out: one that buffers demand until a real delegate exists, and one that
//! only ever accepts a cancel (used for rejected or already-finished
//! subscribers).

use std::sync::{Arc, Mutex};

use crate::subscriber::Subscription;

struct ProxyState {
    delegate: Option<Arc<dyn Subscription>>,
    cancelled: bool,
    pending: Vec<u64>,
}

/// Handed to a subscriber's `on_subscribe` before the installation handshake
/// commits. Buffers `request`/`cancel` until [`Self::activate`] supplies the
/// real delegate, then forwards directly.
pub(crate) struct DeferredSubscription {
    state: Mutex<ProxyState>,
}

impl DeferredSubscription {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ProxyState {
                delegate: None,
                cancelled: false,
                pending: Vec::new(),
            }),
        })
    }

    /// Binds the real delegate and drains any buffered `request` calls to it
    /// in order. If the subscriber already cancelled during its own
    /// `on_subscribe`, the delegate is cancelled once instead and the
    /// buffered demand is dropped.
    pub(crate) fn activate(&self, delegate: Arc<dyn Subscription>) {
        let (pending, already_cancelled) = {
            let mut st = self.state.lock().unwrap();
            st.delegate = Some(delegate.clone());
            (std::mem::take(&mut st.pending), st.cancelled)
        };
        if already_cancelled {
            delegate.cancel();
            return;
        }
        for n in pending {
            delegate.request(n);
        }
    }

    /// Whether `cancel()` was observed before [`Self::activate`] ran.
    pub(crate) fn cancelled_before_activation(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.delegate.is_none() && st.cancelled
    }
}

impl Subscription for DeferredSubscription {
    fn request(&self, n: u64) {
        let delegate = {
            let mut st = self.state.lock().unwrap();
            if st.cancelled {
                return;
            }
            match &st.delegate {
                Some(d) => Some(d.clone()),
                None => {
                    st.pending.push(n);
                    None
                }
            }
        };
        if let Some(d) = delegate {
            d.request(n);
        }
    }

    fn cancel(&self) {
        let delegate = {
            let mut st = self.state.lock().unwrap();
            if st.cancelled {
                return;
            }
            st.cancelled = true;
            st.delegate.clone()
        };
        if let Some(d) = delegate {
            d.cancel();
        }
    }
}

/// A subscription that only ever accepts a cancel: used both for the reject
/// path (slot unavailable) and for early-completion sentinels. `request` is
/// always a NOP.
pub(crate) struct CancelOnlySubscription {
    cancelled: std::sync::atomic::AtomicBool,
}

impl CancelOnlySubscription {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            cancelled: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::Acquire)
    }
}

impl Subscription for CancelOnlySubscription {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::Release);
    }
}
