/// How a [`Throttle`](crate::Throttle) treats calls that arrive while it is
/// busy (an execution in flight, or a cooldown still elapsing).
///
/// The policy only governs *waiting* calls. The call that opened the burst is
/// never replaced or discarded by a later arrival.
///
/// # Example
///
/// ```
/// use quottle::{Outcome, QueuePolicy, Throttle};
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() {
///     let throttle = Throttle::builder()
///         .queue(QueuePolicy::Latest)
///         .build(|x: u32| async move { Ok::<_, std::convert::Infallible>(x * 2) })
///         .unwrap();
///
///     let calls: Vec<_> = (1..=4).map(|x| throttle.call(x)).collect();
///     let results = futures::future::join_all(calls).await;
///
///     // The first call runs, the middle two are superseded, the last runs.
///     assert_eq!(results[0], Ok(Outcome::Executed(2)));
///     assert_eq!(results[1], Ok(Outcome::Discarded));
///     assert_eq!(results[2], Ok(Outcome::Discarded));
///     assert_eq!(results[3], Ok(Outcome::Executed(8)));
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueuePolicy {
    /// Discard every call that arrives while busy. Nothing is ever queued.
    ///
    /// This is the default.
    #[default]
    Reject,

    /// Keep only the most recent waiting call. A new arrival replaces the
    /// queued one, which settles as [`Outcome::Discarded`].
    Latest,

    /// Keep every waiting call, in arrival order. Each surviving call runs
    /// exactly once, one cooldown apart.
    Fifo,

    /// Keep at most `n` waiting calls, in arrival order. When a new arrival
    /// would exceed the bound, waiters are discarded from the oldest end, so
    /// the most recent arrivals are the ones that eventually run.
    ///
    /// `Bounded(0)` queues nothing and behaves like [`QueuePolicy::Reject`].
    Bounded(usize),
}

impl QueuePolicy {
    /// Number of waiting calls this policy retains, if bounded.
    pub(crate) fn capacity(self) -> Option<usize> {
        match self {
            QueuePolicy::Reject => Some(0),
            QueuePolicy::Latest => Some(1),
            QueuePolicy::Fifo => None,
            QueuePolicy::Bounded(n) => Some(n),
        }
    }
}

/// What became of one call to a throttled operation.
///
/// A discarded call is not an error: it settles with `Ok(Outcome::Discarded)`.
/// An execution failure is an error: the call settles with `Err(e)` carrying
/// the operation's own error value. The two are deliberately distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome<R> {
    /// The operation ran for this call and returned `R`.
    Executed(R),
    /// The call was superseded or rejected by the queue policy (or by
    /// [`Throttle::clear`](crate::Throttle::clear)) and never ran.
    Discarded,
}

impl<R> Outcome<R> {
    /// Whether the operation ran for this call.
    pub fn is_executed(&self) -> bool {
        matches!(self, Outcome::Executed(_))
    }

    /// Whether the call was discarded without running.
    pub fn is_discarded(&self) -> bool {
        matches!(self, Outcome::Discarded)
    }

    /// The operation's return value, or `None` for a discarded call.
    pub fn into_executed(self) -> Option<R> {
        match self {
            Outcome::Executed(value) => Some(value),
            Outcome::Discarded => None,
        }
    }
}
