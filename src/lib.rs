//! A thread-safe, non-blocking, single-subscriber publish/consume pipeline
//! with pull-based backpressure.
//!
//! A [`core::pushpull::Publisher`] wraps a user-supplied generator function
//! and hands items to at most one [`subscriber::Subscriber`] at a time, one
//! at a time, only as fast as that subscriber asks for them via
//! [`subscriber::Subscription::request`]. No thread ever blocks: every
//! operation either makes progress immediately or is a no-op.
//!
//! ```
//! use unicast_pipe::core::pushpull::PushPullPublisherBuilder;
//! use unicast_pipe::subscriber::{Subscriber, Subscription};
//! use unicast_pipe::error::{ConsumeFailure, CoreError};
//!
//! struct PrintingSubscriber;
//!
//! impl Subscriber<i32> for PrintingSubscriber {
//!     fn on_subscribe(&mut self, subscription: Box<dyn Subscription>) {
//!         subscription.request(3);
//!     }
//!     fn on_next(&mut self, item: i32) -> Result<(), ConsumeFailure<i32>> {
//!         println!("{item}");
//!         Ok(())
//!     }
//!     fn on_error(&mut self, error: CoreError) {
//!         eprintln!("{error}");
//!     }
//!     fn on_complete(&mut self) {}
//! }
//!
//! let mut n = 0;
//! let publisher = PushPullPublisherBuilder::reusable()
//!     .generator(move || {
//!         n += 1;
//!         Ok((n <= 3).then_some(n))
//!     })
//!     .build();
//! publisher.subscribe(PrintingSubscriber);
//! ```

pub mod core;
pub mod error;
pub mod subscriber;
