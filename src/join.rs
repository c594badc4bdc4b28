//! Ordered fan-in over independent asynchronous producers.
//!
//! A [`Join`] hands out single-use [`JoinSlot`]s, each bound to the position
//! at which it was requested. Once the join is awaited and every slot has
//! completed successfully it resolves with the values in slot order. The
//! first failure resolves it immediately; every later completion is
//! discarded, so a join produces exactly one outcome.
//!
//! ```
//! # use armada::join::Join;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let join = Join::<u32, String>::new();
//! let first = join.slot();
//! let second = join.slot();
//! second.complete(Ok(2));
//! first.complete(Ok(1));
//! assert_eq!(join.wait().await, Ok(vec![1, 2]));
//! # }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

type Outcome<T, E> = Result<Vec<T>, JoinError<E>>;

/// Reasons a [`Join`] resolves without a full set of values.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JoinError<E> {
    /// A producer reported an error; it is returned verbatim.
    #[error("{0}")]
    Failed(E),
    /// A slot was dropped before completing, typically because its task
    /// panicked or was cancelled.
    #[error("join slot {index} was dropped before completing")]
    Abandoned {
        /// Position of the abandoned slot.
        index: usize,
    },
}

struct State<T, E> {
    values: Vec<Option<T>>,
    remaining: usize,
    sealed: bool,
    deliver: Option<oneshot::Sender<Outcome<T, E>>>,
    tasks: Vec<AbortHandle>,
}

struct Shared<T, E> {
    resolved: AtomicBool,
    state: Mutex<State<T, E>>,
}

impl<T, E> Shared<T, E> {
    fn lock(&self) -> MutexGuard<'_, State<T, E>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate(&self) -> usize {
        let mut state = self.lock();
        let index = state.values.len();
        state.values.push(None);
        state.remaining += 1;
        index
    }

    fn track(&self, task: AbortHandle) {
        if self.resolved.load(Ordering::Acquire) {
            task.abort();
            return;
        }
        self.lock().tasks.push(task);
    }

    fn succeed(&self, index: usize, value: T) {
        if self.resolved.load(Ordering::Acquire) {
            return;
        }
        let mut state = self.lock();
        if let Some(slot) = state.values.get_mut(index) {
            *slot = Some(value);
            state.remaining = state.remaining.saturating_sub(1);
        }
        if state.sealed && state.remaining == 0 {
            self.deliver_values(&mut state);
        }
    }

    fn fail(&self, error: JoinError<E>) {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut state = self.lock();
        if let Some(sender) = state.deliver.take() {
            sender.send(Err(error)).ok();
        }
        for task in state.tasks.drain(..) {
            task.abort();
        }
    }

    fn seal(&self) {
        let mut state = self.lock();
        state.sealed = true;
        if state.remaining == 0 {
            self.deliver_values(&mut state);
        }
    }

    fn deliver_values(&self, state: &mut State<T, E>) {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return;
        }
        let values = state.values.drain(..).flatten().collect();
        state.tasks.clear();
        if let Some(sender) = state.deliver.take() {
            sender.send(Ok(values)).ok();
        }
    }
}

/// Collects results from independent producers in the order their slots
/// were requested.
pub struct Join<T, E> {
    shared: Arc<Shared<T, E>>,
    outcome: oneshot::Receiver<Outcome<T, E>>,
}

impl<T, E> Default for Join<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> Join<T, E> {
    /// Creates an empty join.
    #[must_use]
    pub fn new() -> Self {
        let (sender, outcome) = oneshot::channel();
        Self {
            shared: Arc::new(Shared {
                resolved: AtomicBool::new(false),
                state: Mutex::new(State {
                    values: Vec::new(),
                    remaining: 0,
                    sealed: false,
                    deliver: Some(sender),
                    tasks: Vec::new(),
                }),
            }),
            outcome,
        }
    }

    /// Requests the next completion slot.
    #[must_use]
    pub fn slot(&self) -> JoinSlot<T, E> {
        let index = self.shared.allocate();
        JoinSlot {
            shared: Some(Arc::clone(&self.shared)),
            index,
        }
    }

    /// Waits for the outcome. Awaiting seals the join: no further slots can
    /// be requested, and a join without slots resolves to an empty vector.
    ///
    /// # Errors
    ///
    /// Returns the first [`JoinError`] reported by any slot.
    pub async fn wait(self) -> Outcome<T, E> {
        let Self { shared, outcome } = self;
        shared.seal();
        drop(shared);
        match outcome.await {
            Ok(result) => result,
            Err(_) => Err(JoinError::Abandoned { index: 0 }),
        }
    }
}

impl<T, E> Join<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Runs `future` on the runtime and binds its result to a fresh slot.
    ///
    /// When the join resolves with an error, tasks spawned through this
    /// method that are still running are aborted.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let slot = self.slot();
        let task = tokio::spawn(async move { slot.complete(future.await) });
        self.shared.track(task.abort_handle());
    }
}

/// Single-use completion handle for one producer.
///
/// Dropping a slot without completing it resolves the join with
/// [`JoinError::Abandoned`].
pub struct JoinSlot<T, E> {
    shared: Option<Arc<Shared<T, E>>>,
    index: usize,
}

impl<T, E> JoinSlot<T, E> {
    /// Position of this slot within the join.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Reports this producer's result.
    pub fn complete(mut self, result: Result<T, E>) {
        let Some(shared) = self.shared.take() else {
            return;
        };
        match result {
            Ok(value) => shared.succeed(self.index, value),
            Err(error) => shared.fail(JoinError::Failed(error)),
        }
    }
}

impl<T, E> Drop for JoinSlot<T, E> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.fail(JoinError::Abandoned { index: self.index });
        }
    }
}
