//! An async throttle that coalesces bursts of calls into at most one
//! in-flight execution.
//!
//! # Concepts
//!
//! The primary type of this crate is [`Throttle`]. It wraps one async
//! operation and hands out call futures; however many calls arrive
//! concurrently, the wrapped operation never runs more than once at a time,
//! and consecutive runs are spaced by a configurable cooldown `interval`.
//!
//! Each call settles on its own with an [`Outcome`]: either the operation
//! ran for it, or the call was discarded because a [`QueuePolicy`] dropped
//! it in favor of another. Discarding is a normal outcome, not an error;
//! operation failures are errors and reach only the one call that triggered
//! them.
//!
//! Here is a running chart of a burst of four calls against a throttle with
//! `leading == true` and `QueuePolicy::Latest`:
//!
//! ```text
//! calls:    c1  c2  c3  c4
//!           |   |   |   |
//!           |   x   x   +----------------+
//!           |                            |
//! driver:   |run(c1)---|cooldown-------|run(c4)---|cooldown-------| idle
//!           |  interval starts after   |
//!           |  each run finishes       |
//!
//! c1: executed    c2, c3: discarded (superseded by c4)    c4: executed
//!
//! time pass ----->
//! ```
//!
//! The driver is a background task owned by the [`Throttle`]; callers are
//! never blocked. A call arriving while everything is idle starts a burst
//! (immediately, or after one interval with `leading` off); calls arriving
//! while the driver is busy wait or are discarded according to the
//! [`QueuePolicy`]. Waiters run oldest-first, and when a bound forces a
//! discard it is always the oldest waiter that goes, so the most recent
//! calls are the ones that eventually run.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
//! use std::time::Duration;
//!
//! use quottle::{Outcome, QueuePolicy, Throttle};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let fetches = Arc::new(AtomicU32::new(0));
//!     let counter = Arc::clone(&fetches);
//!
//!     // Pretend this hits some rate-limited backend.
//!     let throttle = Throttle::builder()
//!         .interval(Duration::from_millis(10))
//!         .queue(QueuePolicy::Latest)
//!         .build(move |query: String| {
//!             let counter = Arc::clone(&counter);
//!             async move {
//!                 let n = counter.fetch_add(1, SeqCst) + 1;
//!                 Ok::<_, std::convert::Infallible>(format!("{query}#{n}"))
//!             }
//!         })
//!         .unwrap();
//!
//!     // A burst of redundant refreshes: the first goes out immediately,
//!     // the stale middle ones are dropped, the newest goes out once the
//!     // cooldown has elapsed.
//!     let calls: Vec<_> = ["a", "b", "c", "d"]
//!         .into_iter()
//!         .map(|q| throttle.call(q.to_owned()))
//!         .collect();
//!     let results = futures::future::join_all(calls).await;
//!
//!     assert_eq!(results[0], Ok(Outcome::Executed("a#1".into())));
//!     assert_eq!(results[1], Ok(Outcome::Discarded));
//!     assert_eq!(results[2], Ok(Outcome::Discarded));
//!     assert_eq!(results[3], Ok(Outcome::Executed("d#2".into())));
//!     assert_eq!(fetches.load(SeqCst), 2);
//! }
//! ```
//!
//! To wait for a whole burst to drain without tracking individual calls,
//! use [`Throttle::ready()`]; to drop everything still waiting, use
//! [`Throttle::clear()`].
//!
//! # Crate Naming
//!
//! Crate name `quottle` is the abbr of "queued throttle": one throttle, one
//! queue of pending calls.

mod throttle;

#[doc(inline)]
pub use throttle::{BuildError, Outcome, QueuePolicy, Throttle, ThrottleBuilder};
