use std::{
    fmt::{self, Debug},
    future::Future,
    marker::PhantomData,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{
    runtime,
    sync::{watch, Notify},
    time,
};
use tokio_util::sync::{CancellationToken, DropGuard};

mod policy;
mod state;

pub use policy::{Outcome, QueuePolicy};

use state::{PendingCall, Phase, State};

/// Immutable configuration shared by the call entry point and the driver.
#[derive(Debug, Clone, Copy)]
struct Config {
    interval: Duration,
    leading: bool,
    queue: QueuePolicy,
}

/// Everything the call entry point, the driver task, and `clear()` share.
struct Shared<A, R, E> {
    config: Config,
    state: Mutex<State<A, R, E>>,
    /// Wakes the driver when a call opens a new burst.
    work: Notify,
    /// `true` whenever the coordinator is idle with an empty queue.
    idle: watch::Sender<bool>,
}

impl<A, R, E> Shared<A, R, E> {
    /// Lock the coordinator state. Held for synchronous bookkeeping only,
    /// never across an await.
    fn state(&self) -> MutexGuard<'_, State<A, R, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An async operation wrapped so that at most one execution is ever in
/// flight, with a configurable cooldown between executions and a
/// [`QueuePolicy`] for calls that arrive in the meantime.
///
/// Build one with [`Throttle::builder()`], handing `build()` the operation to
/// wrap. Every [`call()`](Throttle::call) gets its own future which settles
/// exactly once: `Ok(Outcome::Executed(_))` if the operation ran for it,
/// `Ok(Outcome::Discarded)` if the queue policy (or [`clear()`]) dropped it,
/// or `Err(_)` carrying the operation's own error if its execution failed.
///
/// `Throttle` is not `Clone`; wrap it in an [`Arc`] to share it. Dropping the
/// last handle stops the driver task after the current burst step: an
/// execution already in flight finishes and settles its call, everything
/// still waiting settles as [`Outcome::Discarded`].
///
/// [`clear()`]: Throttle::clear
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
///
/// use quottle::{Outcome, QueuePolicy, Throttle};
///
/// #[tokio::main(flavor = "current_thread")]
/// async fn main() {
///     let counter = Arc::new(AtomicU32::new(0));
///     let throttle = Throttle::builder()
///         .queue(QueuePolicy::Latest)
///         .build(move |(): ()| {
///             let counter = Arc::clone(&counter);
///             async move {
///                 let n = counter.fetch_add(1, SeqCst) + 1;
///                 Ok::<_, std::convert::Infallible>(format!("done{n}"))
///             }
///         })
///         .unwrap();
///
///     // Four calls in one burst: the first one runs, the middle two are
///     // superseded, the survivor runs as a follow-up.
///     let calls: Vec<_> = (0..4).map(|_| throttle.call(())).collect();
///     let results = futures::future::join_all(calls).await;
///
///     assert_eq!(results[0], Ok(Outcome::Executed("done1".into())));
///     assert_eq!(results[1], Ok(Outcome::Discarded));
///     assert_eq!(results[2], Ok(Outcome::Discarded));
///     assert_eq!(results[3], Ok(Outcome::Executed("done2".into())));
/// }
/// ```
pub struct Throttle<A, R, E> {
    shared: Arc<Shared<A, R, E>>,
    /// Cancels the driver task when the handle is dropped.
    _driver: DropGuard,
}

impl<A, R, E> Throttle<A, R, E>
where
    A: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    /// Initialize a builder to create a throttle.
    pub fn builder() -> ThrottleBuilder<A, R, E> {
        ThrottleBuilder::default()
    }

    /// Submit one call.
    ///
    /// The call is registered before this method returns; the returned
    /// future only waits for the call's settlement and can be dropped
    /// without un-registering it. The caller is never blocked: if the
    /// coordinator is idle a new burst is scheduled, otherwise the
    /// [`QueuePolicy`] decides whether this call waits or is discarded.
    ///
    /// # Example
    ///
    /// ```
    /// use quottle::{Outcome, Throttle};
    ///
    /// #[tokio::main(flavor = "current_thread")]
    /// async fn main() {
    ///     let throttle = Throttle::builder()
    ///         .build(|x: u32| async move { Ok::<_, std::convert::Infallible>(x * 2) })
    ///         .unwrap();
    ///
    ///     assert_eq!(throttle.call(21).await, Ok(Outcome::Executed(42)));
    /// }
    /// ```
    pub fn call(&self, args: A) -> impl Future<Output = Result<Outcome<R>, E>> + Send + 'static {
        let (call, rx) = PendingCall::new(args);
        let mut state = self.shared.state();
        if state.phase == Phase::Idle {
            state.phase = Phase::Scheduled;
            // A leftover `cleared` marker belongs to the previous burst.
            state.cleared = false;
            if self.shared.config.leading {
                state.lead = Some(call);
            } else {
                state.queue.push_back(call);
            }
            self.shared.idle.send_replace(false);
            drop(state);
            self.shared.work.notify_one();
        } else {
            state.admit(self.shared.config.queue, call);
        }
        async move {
            match rx.await {
                Ok(settled) => settled,
                // The driver is gone (last handle dropped, or the operation
                // panicked); this call can no longer run.
                Err(_) => Ok(Outcome::Discarded),
            }
        }
    }

    /// Wait until the coordinator is idle with nothing queued.
    ///
    /// Resolves immediately when there is nothing pending. Useful to let a
    /// whole burst drain without tracking the individual call futures.
    ///
    /// # Example
    ///
    /// ```
    /// use quottle::{QueuePolicy, Throttle};
    ///
    /// #[tokio::main(flavor = "current_thread")]
    /// async fn main() {
    ///     let throttle = Throttle::builder()
    ///         .queue(QueuePolicy::Fifo)
    ///         .build(|x: u32| async move { Ok::<_, std::convert::Infallible>(x) })
    ///         .unwrap();
    ///
    ///     let _calls: Vec<_> = (0..3).map(|x| throttle.call(x)).collect();
    ///     throttle.ready().await;
    ///     assert!(throttle.is_idle());
    /// }
    /// ```
    pub fn ready(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shared.idle.subscribe();
        async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
    }

    /// Whether the coordinator is idle with nothing queued.
    pub fn is_idle(&self) -> bool {
        *self.shared.idle.borrow()
    }

    /// Number of calls currently waiting to run, the committed burst opener
    /// included.
    pub fn pending(&self) -> usize {
        let state = self.shared.state();
        state.queue.len() + usize::from(state.lead.is_some())
    }

    /// Discard every waiting call and cancel the cooldown in progress.
    ///
    /// Each discarded call settles as [`Outcome::Discarded`]. An execution
    /// already in flight is not aborted; it settles its own call normally.
    /// Calling this while idle has no effect.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use quottle::{Outcome, QueuePolicy, Throttle};
    ///
    /// #[tokio::main(flavor = "current_thread")]
    /// async fn main() {
    ///     let throttle = Throttle::builder()
    ///         .interval(Duration::from_secs(3600))
    ///         .queue(QueuePolicy::Fifo)
    ///         .build(|x: u32| async move { Ok::<_, std::convert::Infallible>(x) })
    ///         .unwrap();
    ///
    ///     let calls: Vec<_> = (0..4).map(|x| throttle.call(x)).collect();
    ///     throttle.clear();
    ///
    ///     // The burst opener still runs; the waiters are discarded instead
    ///     // of sitting out the hour-long cooldown.
    ///     let results = futures::future::join_all(calls).await;
    ///     assert_eq!(results[0], Ok(Outcome::Executed(0)));
    ///     assert_eq!(results[1], Ok(Outcome::Discarded));
    ///     assert_eq!(results[2], Ok(Outcome::Discarded));
    ///     assert_eq!(results[3], Ok(Outcome::Discarded));
    /// }
    /// ```
    pub fn clear(&self) {
        let discarded = self.shared.state().flush();
        if discarded > 0 {
            tracing::debug!(discarded, "cleared waiting calls");
        }
    }
}

impl<A, R, E> Debug for Throttle<A, R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state();
        f.debug_struct("Throttle")
            .field("phase", &state.phase)
            .field("waiting", &state.queue.len())
            .finish()
    }
}

/// Use to build a [`Throttle`].
///
/// Created by [`Throttle::builder()`] API. The type parameters are pinned
/// down by the operation handed to [`build()`](ThrottleBuilder::build), so
/// the whole chain is usually written in one expression.
pub struct ThrottleBuilder<A, R, E> {
    config: Config,
    phantom: PhantomData<fn(A) -> (R, E)>,
}

impl<A, R, E> Default for ThrottleBuilder<A, R, E> {
    fn default() -> Self {
        Self {
            config: Config {
                interval: Duration::ZERO,
                leading: true,
                queue: QueuePolicy::default(),
            },
            phantom: PhantomData,
        }
    }
}

impl<A, R, E> ThrottleBuilder<A, R, E>
where
    A: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    /// Set the cooldown observed after each execution, default
    /// `Duration::ZERO`.
    ///
    /// A zero interval inserts no timed delay anywhere; executions still
    /// never overlap and the run loop still yields between them.
    pub fn interval(&mut self, interval: Duration) -> &mut Self {
        self.config.interval = interval;
        self
    }

    /// Whether a call arriving while idle runs immediately (`true`, the
    /// default) or only after one interval has elapsed (`false`).
    ///
    /// With `leading` off, the burst-opening call waits in the queue like
    /// any other, so under [`QueuePolicy::Latest`] a later arrival within
    /// the interval supersedes it.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::{Duration, Instant};
    ///
    /// use quottle::{Outcome, Throttle};
    ///
    /// #[tokio::main(flavor = "current_thread")]
    /// async fn main() {
    ///     let throttle = Throttle::builder()
    ///         .interval(Duration::from_millis(20))
    ///         .leading(false)
    ///         .build(|x: u32| async move { Ok::<_, std::convert::Infallible>(x) })
    ///         .unwrap();
    ///
    ///     let start = Instant::now();
    ///     assert_eq!(throttle.call(7).await, Ok(Outcome::Executed(7)));
    ///     assert!(start.elapsed() >= Duration::from_millis(20));
    /// }
    /// ```
    pub fn leading(&mut self, leading: bool) -> &mut Self {
        self.config.leading = leading;
        self
    }

    /// Set the policy for calls arriving while busy, default
    /// [`QueuePolicy::Reject`].
    pub fn queue(&mut self, queue: QueuePolicy) -> &mut Self {
        self.config.queue = queue;
        self
    }

    /// Create a new [`Throttle`] wrapping `operation` with the current
    /// configuration.
    ///
    /// The operation receives each surviving call's argument and its result
    /// is routed to that call's future, `Err` included, verbatim. A failed
    /// execution never wedges the throttle; the next waiter runs regardless.
    ///
    /// Spawns the driver task, so this must be called within a tokio
    /// runtime; otherwise it fails fast with [`BuildError::NoRuntime`].
    pub fn build<F, Fut>(&self, operation: F) -> Result<Throttle<A, R, E>, BuildError>
    where
        F: FnMut(A) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let handle = runtime::Handle::try_current().map_err(BuildError::NoRuntime)?;
        let (idle, _) = watch::channel(true);
        let shared = Arc::new(Shared {
            config: self.config,
            state: Mutex::new(State::new()),
            work: Notify::new(),
            idle,
        });
        let shutdown = CancellationToken::new();
        handle.spawn(drive(Arc::clone(&shared), operation, shutdown.clone()));
        Ok(Throttle {
            shared,
            _driver: shutdown.drop_guard(),
        })
    }
}

impl<A, R, E> Debug for ThrottleBuilder<A, R, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThrottleBuilder")
            .field("interval", &self.config.interval)
            .field("leading", &self.config.leading)
            .field("queue", &self.config.queue)
            .finish()
    }
}

/// Error of [`ThrottleBuilder::build()`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BuildError {
    /// The driver task needs a runtime to be spawned on.
    ///
    /// ```
    /// use quottle::{BuildError, Throttle};
    ///
    /// // No runtime here.
    /// let result = Throttle::builder()
    ///     .build(|x: u32| async move { Ok::<_, std::convert::Infallible>(x) });
    /// assert!(matches!(result, Err(BuildError::NoRuntime(_))));
    /// ```
    #[error("building a throttle requires a current tokio runtime")]
    NoRuntime(#[source] runtime::TryCurrentError),
}

/// The run loop. One iteration of the outer loop serves one burst: the
/// committed opener (or the initial cooldown when `leading` is off), then
/// waiters popped oldest-first with a cooldown after every execution, until
/// the queue drains.
///
/// Shutdown is observed between burst steps: an execution already in flight
/// finishes, everything after it is abandoned.
///
/// This is an explicit loop on purpose; a long burst must not grow the
/// stack.
async fn drive<A, R, E, F, Fut>(
    shared: Arc<Shared<A, R, E>>,
    mut operation: F,
    shutdown: CancellationToken,
) where
    F: FnMut(A) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let _teardown = Teardown {
        shared: Arc::clone(&shared),
    };

    loop {
        tokio::select! {
            _ = shared.work.notified() => {}
            _ = shutdown.cancelled() => break,
        }

        // Bind before awaiting so the state lock is released first.
        let lead = shared.state().lead.take();
        if let Some(call) = lead {
            run_one(&shared, &mut operation, call).await;
        }
        cool_down(&shared, &shutdown).await;

        while !shutdown.is_cancelled() {
            let next = {
                let mut state = shared.state();
                let next = state.next_or_idle();
                if next.is_none() {
                    // Under the same lock as the phase flip, so `ready()`
                    // never reports idle while a new burst is scheduled.
                    shared.idle.send_replace(true);
                }
                next
            };
            let Some(call) = next else { break };
            run_one(&shared, &mut operation, call).await;
            cool_down(&shared, &shutdown).await;
        }
        if shutdown.is_cancelled() {
            break;
        }
    }
}

/// Settles whatever the driver leaves behind when it stops, panic unwind
/// out of the operation included: pending calls discard, `ready()` resolves.
struct Teardown<A, R, E> {
    shared: Arc<Shared<A, R, E>>,
}

impl<A, R, E> Drop for Teardown<A, R, E> {
    fn drop(&mut self) {
        let mut state = self.shared.state();
        if let Some(call) = state.lead.take() {
            call.discard();
        }
        state.flush();
        state.phase = Phase::Idle;
        self.shared.idle.send_replace(true);
    }
}

/// Run the operation for one call and route the result to that call alone.
async fn run_one<A, R, E, F, Fut>(
    shared: &Shared<A, R, E>,
    operation: &mut F,
    call: PendingCall<A, R, E>,
) where
    F: FnMut(A) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    shared.state().phase = Phase::Running;
    let (args, tx) = call.into_parts();
    tracing::trace!("executing");
    let result = operation(args).await;
    // The caller may have dropped its future; the result then has nowhere to
    // go.
    let _ = tx.send(result.map(Outcome::Executed));
}

/// Let the configured interval elapse, or return early when `clear()` or a
/// dropped handle cancels it. A zero interval only yields back to the
/// scheduler.
async fn cool_down<A, R, E>(shared: &Shared<A, R, E>, shutdown: &CancellationToken) {
    let interval = shared.config.interval;
    if interval.is_zero() {
        // Nothing timed. Only yield when more work is waiting, so a burst
        // that just finished flips to idle before its caller resumes; a
        // sequence of awaited calls then behaves like plain awaits.
        let more_waiting = !shared.state().queue.is_empty();
        if more_waiting {
            tokio::task::yield_now().await;
        }
        return;
    }
    let token = CancellationToken::new();
    {
        let mut state = shared.state();
        // A `clear()` that beat us here already cancelled this cooldown;
        // observe it unless new waiters have arrived since.
        if std::mem::take(&mut state.cleared) && state.queue.is_empty() {
            return;
        }
        state.phase = Phase::CoolingDown;
        state.cooldown = Some(token.clone());
    }
    tracing::trace!(?interval, "cooling down");
    tokio::select! {
        _ = time::sleep(interval) => {}
        _ = token.cancelled() => tracing::trace!("cooldown cancelled"),
        _ = shutdown.cancelled() => {}
    }
    shared.state().cooldown = None;
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::{
        atomic::{AtomicUsize, Ordering::SeqCst},
        Arc,
    };

    use futures::future::{join_all, BoxFuture};
    use futures::FutureExt;
    use tokio::time::{advance, Instant};

    use super::*;

    /// Counting operation in the style of the classic throttle exercises:
    /// each execution bumps a shared counter and reports "done{n}".
    fn counting_op(
        counter: &Arc<AtomicUsize>,
    ) -> impl FnMut(()) -> BoxFuture<'static, Result<String, Infallible>> {
        let counter = Arc::clone(counter);
        move |()| {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, SeqCst) + 1;
                Ok(format!("done{n}"))
            }
            .boxed()
        }
    }

    fn executed(s: &str) -> Result<Outcome<String>, Infallible> {
        Ok(Outcome::Executed(s.to_owned()))
    }

    fn discarded() -> Result<Outcome<String>, Infallible> {
        Ok(Outcome::Discarded)
    }

    #[tokio::test]
    async fn awaited_calls_act_like_plain_awaits() {
        let counter = Arc::new(AtomicUsize::new(0));
        let throttle = Throttle::builder().build(counting_op(&counter)).unwrap();

        assert_eq!(throttle.call(()).await, executed("done1"));
        assert_eq!(throttle.call(()).await, executed("done2"));
        assert_eq!(throttle.call(()).await, executed("done3"));
        assert_eq!(counter.load(SeqCst), 3);
    }

    #[tokio::test]
    async fn latest_burst_runs_first_and_most_recent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let throttle = Throttle::builder()
            .queue(QueuePolicy::Latest)
            .build(counting_op(&counter))
            .unwrap();

        let calls: Vec<_> = (0..4).map(|_| throttle.call(())).collect();
        let results = join_all(calls).await;

        assert_eq!(results[0], executed("done1"));
        assert_eq!(results[1], discarded());
        assert_eq!(results[2], discarded());
        assert_eq!(results[3], executed("done2"));
        assert_eq!(counter.load(SeqCst), 2);
    }

    #[tokio::test]
    async fn reject_burst_runs_only_the_opener() {
        let counter = Arc::new(AtomicUsize::new(0));
        let throttle = Throttle::builder().build(counting_op(&counter)).unwrap();

        let calls: Vec<_> = (0..4).map(|_| throttle.call(())).collect();
        let results = join_all(calls).await;

        assert_eq!(results[0], executed("done1"));
        assert_eq!(results[1], discarded());
        assert_eq!(results[2], discarded());
        assert_eq!(results[3], discarded());

        // A fresh burst afterwards runs again.
        throttle.ready().await;
        assert_eq!(throttle.call(()).await, executed("done2"));
    }

    #[tokio::test]
    async fn fifo_burst_preserves_arrival_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let op = {
            let order = Arc::clone(&order);
            move |i: usize| {
                let order = Arc::clone(&order);
                async move {
                    order.lock().unwrap().push(i);
                    Ok::<_, Infallible>(i)
                }
            }
        };
        let throttle = Throttle::builder()
            .queue(QueuePolicy::Fifo)
            .build(op)
            .unwrap();

        let calls: Vec<_> = (0..6).map(|i| throttle.call(i)).collect();
        let results = join_all(calls).await;

        for (i, result) in results.into_iter().enumerate() {
            assert_eq!(result, Ok(Outcome::Executed(i)));
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn bounded_burst_discards_oldest_waiters() {
        let counter = Arc::new(AtomicUsize::new(0));
        let throttle = Throttle::builder()
            .queue(QueuePolicy::Bounded(1))
            .build(counting_op(&counter))
            .unwrap();

        let calls: Vec<_> = (0..4).map(|_| throttle.call(())).collect();
        let results = join_all(calls).await;

        assert_eq!(results[0], executed("done1"));
        assert_eq!(results[1], discarded());
        assert_eq!(results[2], discarded());
        assert_eq!(results[3], executed("done2"));
    }

    #[tokio::test]
    async fn bounded_zero_never_queues() {
        let counter = Arc::new(AtomicUsize::new(0));
        let throttle = Throttle::builder()
            .queue(QueuePolicy::Bounded(0))
            .build(counting_op(&counter))
            .unwrap();

        let calls: Vec<_> = (0..3).map(|_| throttle.call(())).collect();
        let results = join_all(calls).await;

        assert_eq!(results[0], executed("done1"));
        assert_eq!(results[1], discarded());
        assert_eq!(results[2], discarded());
        assert_eq!(counter.load(SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn executions_never_overlap() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let op = {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            move |i: usize| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, SeqCst) + 1;
                    peak.fetch_max(now, SeqCst);
                    time::sleep(Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, SeqCst);
                    Ok::<_, Infallible>(i)
                }
            }
        };
        let throttle = Throttle::builder()
            .queue(QueuePolicy::Fifo)
            .build(op)
            .unwrap();

        let calls: Vec<_> = (0..8).map(|i| throttle.call(i)).collect();
        let results = join_all(calls).await;

        assert!(results.iter().all(|r| matches!(r, Ok(Outcome::Executed(_)))));
        assert_eq!(peak.load(SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_spaces_executions() {
        let counter = Arc::new(AtomicUsize::new(0));
        let throttle = Throttle::builder()
            .interval(Duration::from_millis(500))
            .queue(QueuePolicy::Latest)
            .build(counting_op(&counter))
            .unwrap();

        let start = Instant::now();
        let first = throttle.call(());
        let second = throttle.call(());

        assert_eq!(first.await, executed("done1"));
        assert!(start.elapsed() < Duration::from_millis(500));

        assert_eq!(second.await, executed("done2"));
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_start_waits_out_the_interval() {
        let counter = Arc::new(AtomicUsize::new(0));
        let throttle = Throttle::builder()
            .interval(Duration::from_millis(500))
            .leading(false)
            .queue(QueuePolicy::Latest)
            .build(counting_op(&counter))
            .unwrap();

        let start = Instant::now();
        let first = throttle.call(());
        let second = throttle.call(());

        // Within the window the earlier call is superseded; only the most
        // recent one queued before the window elapsed runs.
        assert_eq!(first.await, discarded());
        assert_eq!(second.await, executed("done1"));
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(counter.load(SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn one_execution_per_window() {
        let counter = Arc::new(AtomicUsize::new(0));
        let throttle = Throttle::builder()
            .interval(Duration::from_millis(500))
            .queue(QueuePolicy::Latest)
            .build(counting_op(&counter))
            .unwrap();

        let mut calls = Vec::new();
        for _ in 0..4 {
            calls.push(throttle.call(()));
            // Let the driver catch up before and after moving the clock, so
            // each call lands at a well-defined point of the timeline.
            tokio::task::yield_now().await;
            advance(Duration::from_millis(200)).await;
            tokio::task::yield_now().await;
        }
        // Calls land at 0ms, 200ms, 400ms, 600ms: the opener runs at once,
        // the next two coalesce into the follow-up at 500ms, the last one
        // lands during the window after that.
        let results = join_all(calls).await;
        throttle.ready().await;

        assert_eq!(results[0], executed("done1"));
        assert_eq!(results[1], discarded());
        assert_eq!(results[2], executed("done2"));
        assert_eq!(results[3], executed("done3"));
        assert_eq!(counter.load(SeqCst), 3);
    }

    #[derive(Debug, PartialEq, Eq, thiserror::Error)]
    #[error("negative input: {0}")]
    struct NegativeInput(i64);

    #[tokio::test]
    async fn a_failure_settles_only_its_own_call() {
        let op = |i: i64| async move {
            if i < 0 {
                Err(NegativeInput(i))
            } else {
                Ok(i * 10)
            }
        };
        let throttle = Throttle::builder()
            .queue(QueuePolicy::Fifo)
            .build(op)
            .unwrap();

        let failing = throttle.call(-1);
        let healthy = throttle.call(4);

        assert_eq!(failing.await, Err(NegativeInput(-1)));
        assert_eq!(healthy.await, Ok(Outcome::Executed(40)));
    }

    #[tokio::test(start_paused = true)]
    async fn clear_discards_waiters_and_cancels_the_cooldown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let throttle = Throttle::builder()
            .interval(Duration::from_secs(3600))
            .queue(QueuePolicy::Fifo)
            .build(counting_op(&counter))
            .unwrap();

        let start = Instant::now();
        let first = throttle.call(());
        assert_eq!(first.await, executed("done1"));
        tokio::task::yield_now().await;

        // The driver is now sitting out the hour-long cooldown.
        let waiter = throttle.call(());
        throttle.clear();

        assert_eq!(waiter.await, discarded());
        throttle.ready().await;
        assert!(start.elapsed() < Duration::from_secs(3600));
        assert_eq!(counter.load(SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_before_the_cooldown_starts_skips_it() {
        let counter = Arc::new(AtomicUsize::new(0));
        let throttle = Throttle::builder()
            .interval(Duration::from_secs(3600))
            .queue(QueuePolicy::Fifo)
            .build(counting_op(&counter))
            .unwrap();

        let start = Instant::now();
        let first = throttle.call(());
        // The driver has not begun the cooldown yet; the clear must still
        // cover it.
        throttle.clear();
        assert_eq!(first.await, executed("done1"));

        throttle.ready().await;
        assert!(start.elapsed() < Duration::from_secs(3600));
        assert_eq!(counter.load(SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_while_idle_changes_nothing() {
        let counter = Arc::new(AtomicUsize::new(0));
        let throttle = Throttle::builder().build(counting_op(&counter)).unwrap();

        throttle.clear();
        throttle.clear();
        assert!(throttle.is_idle());
        assert_eq!(throttle.call(()).await, executed("done1"));
    }

    #[tokio::test]
    async fn ready_resolves_after_the_burst_drains() {
        let counter = Arc::new(AtomicUsize::new(0));
        let throttle = Throttle::builder()
            .queue(QueuePolicy::Latest)
            .build(counting_op(&counter))
            .unwrap();

        assert!(throttle.is_idle());
        let calls: Vec<_> = (0..3).map(|_| throttle.call(())).collect();
        assert!(!throttle.is_idle());

        throttle.ready().await;
        assert!(throttle.is_idle());
        assert_eq!(throttle.pending(), 0);
        assert_eq!(counter.load(SeqCst), 2);
        drop(calls);
    }

    #[tokio::test]
    async fn pending_counts_the_opener_and_waiters() {
        let counter = Arc::new(AtomicUsize::new(0));
        let throttle = Throttle::builder()
            .interval(Duration::from_secs(3600))
            .queue(QueuePolicy::Fifo)
            .build(counting_op(&counter))
            .unwrap();

        let _calls: Vec<_> = (0..3).map(|_| throttle.call(())).collect();
        // The opener may or may not have started yet; the two waiters are
        // definitely queued.
        assert!(throttle.pending() >= 2);
        throttle.clear();
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_the_burst() {
        let counter = Arc::new(AtomicUsize::new(0));
        let throttle = Throttle::builder()
            .interval(Duration::from_secs(3600))
            .queue(QueuePolicy::Fifo)
            .build(counting_op(&counter))
            .unwrap();

        let start = Instant::now();
        let first = throttle.call(());
        let second = throttle.call(());
        assert_eq!(first.await, executed("done1"));

        // The waiter must not sit out the hour-long cooldown and run for
        // nobody; it settles as discarded instead.
        drop(throttle);
        assert_eq!(second.await, discarded());
        assert!(start.elapsed() < Duration::from_secs(3600));
        assert_eq!(counter.load(SeqCst), 1);
    }

    #[tokio::test]
    async fn a_panicking_operation_still_releases_waiters() {
        let op = |i: u32| async move {
            assert!(i > 0, "input must be positive");
            Ok::<_, Infallible>(i)
        };
        let throttle = Throttle::builder()
            .queue(QueuePolicy::Fifo)
            .build(op)
            .unwrap();

        let failing = throttle.call(0);
        let waiter = throttle.call(1);

        assert_eq!(failing.await, Ok(Outcome::Discarded));
        assert_eq!(waiter.await, Ok(Outcome::Discarded));
        throttle.ready().await;
        assert!(throttle.is_idle());
    }

    #[tokio::test]
    async fn instances_are_independent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = Throttle::builder().build(counting_op(&counter)).unwrap();
        let b = Throttle::builder().build(counting_op(&counter)).unwrap();

        assert_eq!(a.call(()).await, executed("done1"));
        assert_eq!(b.call(()).await, executed("done2"));
    }

    #[test]
    fn build_outside_a_runtime_fails_fast() {
        let result = Throttle::builder().build(|x: u32| async move { Ok::<_, Infallible>(x) });
        assert!(matches!(result, Err(BuildError::NoRuntime(_))));
    }
}
