use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::policy::{Outcome, QueuePolicy};

/// Where the coordinator currently is in its burst cycle.
///
/// `Scheduled` covers the window between a call opening a burst and the
/// driver picking it up; arrivals during that window already take the busy
/// path, so a re-entrant caller never observes a half-opened burst.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Scheduled,
    Running,
    CoolingDown,
}

/// One caller's invocation awaiting execution: the argument value plus the
/// single-shot settlement handle for that caller's future.
///
/// Every `PendingCall` is settled exactly once, by [`execute`] routing the
/// operation's result through it or by [`discard`] resolving it as
/// [`Outcome::Discarded`]. Consuming `self` makes double settlement
/// unrepresentable.
///
/// [`execute`]: PendingCall::into_parts
/// [`discard`]: PendingCall::discard
pub(crate) struct PendingCall<A, R, E> {
    args: A,
    tx: oneshot::Sender<Result<Outcome<R>, E>>,
}

impl<A, R, E> PendingCall<A, R, E> {
    pub(crate) fn new(args: A) -> (Self, oneshot::Receiver<Result<Outcome<R>, E>>) {
        let (tx, rx) = oneshot::channel();
        (Self { args, tx }, rx)
    }

    /// Settle this call as never having run.
    pub(crate) fn discard(self) {
        // The caller may have dropped its future already; nothing to do then.
        let _ = self.tx.send(Ok(Outcome::Discarded));
    }

    /// Hand the argument to the executor along with the settlement handle.
    pub(crate) fn into_parts(self) -> (A, oneshot::Sender<Result<Outcome<R>, E>>) {
        (self.args, self.tx)
    }
}

/// The single mutable object per throttle instance.
///
/// Guarded by a `Mutex` that is only ever held for synchronous bookkeeping,
/// never across a suspension point, so call entry, the driver, and `clear`
/// each observe a consistent snapshot.
pub(crate) struct State<A, R, E> {
    pub(crate) phase: Phase,
    /// The call that opened a leading burst. It is committed to run and is
    /// not subject to queue-policy replacement or `clear`.
    pub(crate) lead: Option<PendingCall<A, R, E>>,
    /// Calls waiting to run, oldest first.
    pub(crate) queue: VecDeque<PendingCall<A, R, E>>,
    /// Cancellation handle for the cooldown currently elapsing, if any.
    pub(crate) cooldown: Option<CancellationToken>,
    /// Set when a flush landed before the burst's cooldown began; the driver
    /// consumes it and skips that cooldown.
    pub(crate) cleared: bool,
}

impl<A, R, E> State<A, R, E> {
    pub(crate) fn new() -> Self {
        Self {
            phase: Phase::Idle,
            lead: None,
            queue: VecDeque::new(),
            cooldown: None,
            cleared: false,
        }
    }

    /// Admit a call that arrived while busy, applying the queue policy.
    ///
    /// The call is appended, then the queue is trimmed from the oldest end
    /// down to the policy's capacity; each trimmed entry settles as
    /// discarded. With a capacity of zero the new call itself is the one
    /// trimmed away.
    pub(crate) fn admit(&mut self, policy: QueuePolicy, call: PendingCall<A, R, E>) {
        self.queue.push_back(call);
        if let Some(capacity) = policy.capacity() {
            while self.queue.len() > capacity {
                if let Some(oldest) = self.queue.pop_front() {
                    tracing::trace!(waiting = self.queue.len(), "discarding oldest waiter");
                    oldest.discard();
                }
            }
        }
    }

    /// Pop the next waiter, or report the burst as over.
    ///
    /// The phase flip happens under the same lock as the emptiness check so
    /// a call arriving in between either joins this burst or opens a new one,
    /// never neither.
    pub(crate) fn next_or_idle(&mut self) -> Option<PendingCall<A, R, E>> {
        match self.queue.pop_front() {
            Some(call) => {
                self.phase = Phase::Running;
                Some(call)
            }
            None => {
                self.phase = Phase::Idle;
                None
            }
        }
    }

    /// Discard every waiter and cancel the active cooldown, if any.
    ///
    /// When no cooldown is elapsing yet, `cleared` is set instead so the
    /// driver skips the one this burst would still observe.
    ///
    /// Returns how many waiters were discarded.
    pub(crate) fn flush(&mut self) -> usize {
        let discarded = self.queue.len();
        while let Some(call) = self.queue.pop_front() {
            call.discard();
        }
        match self.cooldown.take() {
            Some(token) => token.cancel(),
            None => self.cleared = true,
        }
        discarded
    }
}
