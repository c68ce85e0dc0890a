//! FIFO Rendezvous Queue
//!
//! Matches producers of values with consumers waiting for them. A push either
//! satisfies the oldest waiting consumer or is buffered; a pull either takes the
//! oldest buffered value or registers a new waiter. At any instant at most one
//! of the two sequences is non-empty.
//!
//! ## Waiter Identity
//!
//! Each waiter is registered with a unique id. A waiter that gives up (its
//! [`Pull`] future is dropped, e.g. by a timeout) is removed by looking that id
//! up at removal time, never by a position remembered from registration. Earlier
//! waiters may have been resolved in the meantime, so a stored position would
//! point at somebody else.
//!
//! ## Locking
//!
//! The buffer and the waiter list share one `std::sync::Mutex`. Every mutation
//! runs to completion under that lock and never awaits, so the queue can be
//! used from any tokio task or thread.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::trace;

/// A side effect attached to a pushed value, run exactly once when a consumer
/// claims that value.
///
/// The effect runs while the queue is being mutated, so it must not call back
/// into the same queue.
pub type OnClaim = Box<dyn FnOnce() + Send + 'static>;

/// A buffered value that no consumer has claimed yet.
struct Entry<T> {
    value: T,
    on_claim: Option<OnClaim>,
}

/// What a waiter receives through its channel.
enum Delivery<T> {
    /// A value handed over by `push`
    Value(T),
    /// The terminal value handed over by `destroy`
    Sentinel(T),
}

impl<T> Delivery<T> {
    fn into_inner(self) -> T {
        match self {
            Delivery::Value(value) | Delivery::Sentinel(value) => value,
        }
    }
}

/// A consumer suspended in `pull`.
struct Waiter<T> {
    id: u64,
    tx: oneshot::Sender<Delivery<T>>,
}

struct Inner<T> {
    /// Values pushed while nobody was waiting, oldest first
    buffered: VecDeque<Entry<T>>,
    /// Suspended consumers, oldest first
    waiting: VecDeque<Waiter<T>>,
    next_waiter_id: u64,
}

impl<T> Inner<T> {
    /// Hands `value` to the oldest live waiter.
    ///
    /// Gives the value back if there is nobody to hand it to.
    fn hand_off(&mut self, value: T, mut on_claim: Option<OnClaim>) -> Option<(T, Option<OnClaim>)> {
        let mut delivery = Delivery::Value(value);

        while let Some(waiter) = self.waiting.pop_front() {
            if waiter.tx.is_closed() {
                continue;
            }

            if let Some(effect) = on_claim.take() {
                effect();
            }

            match waiter.tx.send(delivery) {
                Ok(()) => {
                    trace!(waiter = waiter.id, "value handed to waiter");
                    return None;
                }
                Err(returned) => delivery = returned,
            }
        }

        Some((delivery.into_inner(), on_claim))
    }
}

fn lock<T>(inner: &Mutex<Inner<T>>) -> MutexGuard<'_, Inner<T>> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A FIFO hand-off point between producers and consumers of `T`.
///
/// Cloning the queue produces another handle to the same queue.
///
/// # Example
///
/// ```
/// use docpool::queue::RendezvousQueue;
///
/// # tokio_test::block_on(async {
/// let queue = RendezvousQueue::new();
/// queue.push("first");
/// queue.push("second");
///
/// assert_eq!(queue.pull().await, "first");
/// assert_eq!(queue.pull().await, "second");
/// # });
/// ```
pub struct RendezvousQueue<T> {
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> RendezvousQueue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buffered: VecDeque::new(),
                waiting: VecDeque::new(),
                next_waiter_id: 0,
            })),
        }
    }

    /// Pushes a value.
    ///
    /// If a consumer is waiting, the oldest one receives the value immediately.
    /// Otherwise the value is buffered.
    pub fn push(&self, value: T) {
        self.enqueue(value, None);
    }

    /// Pushes a value with a side effect that runs when the value is claimed.
    ///
    /// When the push satisfies a waiting consumer, `on_claim` completes before
    /// that consumer can observe the value.
    pub fn push_with<F>(&self, value: T, on_claim: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(value, Some(Box::new(on_claim)));
    }

    fn enqueue(&self, value: T, on_claim: Option<OnClaim>) {
        let mut inner = lock(&self.inner);
        if let Some((value, on_claim)) = inner.hand_off(value, on_claim) {
            inner.buffered.push_back(Entry { value, on_claim });
        }
    }

    /// Takes the next value, waiting for a producer if none is buffered.
    ///
    /// The waiter is registered when `pull` is called, not when the returned
    /// future is first polled, so FIFO order follows call order. Dropping the
    /// future before it resolves withdraws the waiter.
    pub fn pull(&self) -> Pull<T> {
        let mut inner = lock(&self.inner);

        if let Some(entry) = inner.buffered.pop_front() {
            drop(inner);
            if let Some(effect) = entry.on_claim {
                effect();
            }
            return Pull {
                state: PullState::Ready(Some(entry.value)),
            };
        }

        let id = inner.next_waiter_id;
        inner.next_waiter_id = inner.next_waiter_id.wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        inner.waiting.push_back(Waiter { id, tx });
        trace!(waiter = id, waiting = inner.waiting.len(), "registered waiter");

        Pull {
            state: PullState::Waiting {
                id,
                rx,
                queue: Arc::clone(&self.inner),
            },
        }
    }

    /// Takes the oldest buffered value without waiting.
    pub fn try_pull(&self) -> Option<T> {
        let entry = lock(&self.inner).buffered.pop_front()?;
        if let Some(effect) = entry.on_claim {
            effect();
        }
        Some(entry.value)
    }

    /// Like [`pull`](Self::pull), but gives up after `timeout`.
    ///
    /// On timeout the waiter is withdrawn and `None` is returned.
    pub async fn pull_timeout(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.pull()).await.ok()
    }

    /// Resolves every waiting consumer with `sentinel`.
    ///
    /// Buffered values are left untouched and remain available to later pulls.
    /// The queue stays usable afterwards. Returns the number of waiters resolved.
    pub fn destroy(&self, sentinel: T) -> usize
    where
        T: Clone,
    {
        let mut inner = lock(&self.inner);
        let mut resolved = 0;

        while let Some(waiter) = inner.waiting.pop_front() {
            if waiter.tx.send(Delivery::Sentinel(sentinel.clone())).is_ok() {
                resolved += 1;
            }
        }

        if resolved > 0 {
            trace!(resolved, "flushed waiters with sentinel");
        }
        resolved
    }

    /// Number of buffered, unclaimed values.
    pub fn len(&self) -> usize {
        lock(&self.inner).buffered.len()
    }

    /// Returns true if no value is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of consumers currently waiting.
    pub fn waiting(&self) -> usize {
        lock(&self.inner).waiting.len()
    }
}

impl<T> Default for RendezvousQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for RendezvousQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for RendezvousQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        f.debug_struct("RendezvousQueue")
            .field("buffered", &inner.buffered.len())
            .field("waiting", &inner.waiting.len())
            .finish()
    }
}

/// Future returned by [`RendezvousQueue::pull`].
///
/// # Panics
///
/// Polling again after the future has returned `Poll::Ready` panics.
#[must_use = "a pull registers a waiter; dropping it withdraws the waiter"]
pub struct Pull<T> {
    state: PullState<T>,
}

enum PullState<T> {
    Ready(Option<T>),
    Waiting {
        id: u64,
        rx: oneshot::Receiver<Delivery<T>>,
        queue: Arc<Mutex<Inner<T>>>,
    },
    Done,
}

// No field is ever pinned structurally.
impl<T> Unpin for Pull<T> {}

impl<T> Pull<T> {
    /// Returns true if the pull was satisfied from the buffer without waiting.
    pub fn is_immediate(&self) -> bool {
        matches!(self.state, PullState::Ready(_))
    }
}

impl<T> Future for Pull<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = &mut *self;
        let value = match &mut this.state {
            PullState::Ready(value) => match value.take() {
                Some(value) => value,
                None => panic!("Pull polled after completion"),
            },
            PullState::Waiting { rx, .. } => match Pin::new(rx).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(delivery)) => delivery.into_inner(),
                // The waiter keeps the queue alive, and the queue only drops a
                // sender after sending through it.
                Poll::Ready(Err(_)) => unreachable!("waiter sender dropped without a value"),
            },
            PullState::Done => panic!("Pull polled after completion"),
        };

        this.state = PullState::Done;
        Poll::Ready(value)
    }
}

impl<T> Drop for Pull<T> {
    fn drop(&mut self) {
        let PullState::Waiting { id, rx, queue } = &mut self.state else {
            return;
        };

        let mut inner = lock(queue);

        if let Some(pos) = inner.waiting.iter().position(|w| w.id == *id) {
            inner.waiting.remove(pos);
            trace!(waiter = *id, "withdrew waiter");
            return;
        }

        // Resolved by a push but never observed: hand the value back so it is
        // not lost. Sentinels from `destroy` are not re-queued.
        if let Ok(Delivery::Value(value)) = rx.try_recv() {
            trace!(waiter = *id, "returning unobserved value to the queue");
            if let Some((value, on_claim)) = inner.hand_off(value, None) {
                inner.buffered.push_front(Entry { value, on_claim });
            }
        }
    }
}
