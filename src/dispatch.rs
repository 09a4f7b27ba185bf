//! Off-engine callback delivery.
//!
//! User completions never run on the engine's processing context. They are
//! queued to a small pool of worker threads, so a slow callback only delays
//! other callbacks, never the engine itself.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Deserialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Configuration for the callback worker pool.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of worker threads.
    /// Default: 4
    pub workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

struct Inner {
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_ids: Vec<ThreadId>,
}

/// Worker pool that runs user callbacks.
///
/// Cheap to clone; all clones feed the same queue.
#[derive(Clone)]
pub struct CallbackDispatch {
    inner: Arc<Inner>,
}

impl CallbackDispatch {
    /// Spawn the worker pool.
    pub fn new(config: &DispatchConfig) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let count = config.workers.max(1);

        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let receiver = receiver.clone();
            let spawned = thread::Builder::new()
                .name(format!("callback-dispatch-{}", i))
                .spawn(move || worker_loop(receiver));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => error!(error = %e, "failed to spawn callback worker"),
            }
        }

        let worker_ids = workers.iter().map(|w| w.thread().id()).collect();
        debug!(workers = workers.len(), "callback dispatch started");

        Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(Some(sender)),
                workers: Mutex::new(workers),
                worker_ids,
            }),
        }
    }

    /// Queue `job` for execution on a worker.
    ///
    /// After [`shutdown`](Self::shutdown), jobs run on a detached thread so
    /// that accepted completions are still delivered.
    pub fn submit<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(job);
        let job = match self.inner.sender.lock().as_ref() {
            Some(sender) => match sender.send(job) {
                Ok(()) => return,
                Err(crossbeam_channel::SendError(job)) => job,
            },
            None => job,
        };

        debug!("callback pool closed, running job on detached thread");
        let spawned = thread::Builder::new()
            .name("callback-detached".to_string())
            .spawn(move || run_job(job));
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn detached callback thread");
        }
    }

    /// Whether the caller is one of this pool's workers.
    pub fn on_worker(&self) -> bool {
        self.inner.worker_ids.contains(&thread::current().id())
    }

    /// Close the queue and wait for queued callbacks to finish.
    ///
    /// Called from a worker, the queue is closed but not joined.
    pub fn shutdown(&self) {
        drop(self.inner.sender.lock().take());
        if self.on_worker() {
            return;
        }
        let workers: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                error!("callback worker exited abnormally");
            }
        }
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        run_job(job);
    }
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("user callback panicked");
    }
}

/// A value that can stand in for a result the engine never produced.
pub trait Abandon {
    /// Terminal value delivered when a request is dropped uncompleted.
    fn abandoned() -> Self;
}

struct CompletionState<T> {
    callback: Option<Box<dyn FnOnce(T) + Send + 'static>>,
    accepted: bool,
    abandoned: bool,
}

/// One-shot completion handed to the engine with an asynchronous request.
///
/// Completing it consumes it. Dropping it without completing (for example
/// when the engine tears down with requests in flight) delivers
/// [`Abandon::abandoned`] instead, so an accepted request always sees exactly
/// one terminal callback.
pub struct Completion<T: Abandon + Send + 'static> {
    state: Arc<Mutex<CompletionState<T>>>,
    dispatch: CallbackDispatch,
}

/// Caller-side half of a [`Completion`]: records whether the engine accepted
/// the request.
pub struct PendingRpc<T: Abandon + Send + 'static> {
    state: Arc<Mutex<CompletionState<T>>>,
    dispatch: CallbackDispatch,
}

impl<T: Abandon + Send + 'static> Completion<T> {
    /// Pair a callback with the dispatch pool it will run on.
    pub fn new<F>(dispatch: &CallbackDispatch, callback: F) -> (Completion<T>, PendingRpc<T>)
    where
        F: FnOnce(T) + Send + 'static,
    {
        let state = Arc::new(Mutex::new(CompletionState {
            callback: Some(Box::new(callback)),
            accepted: false,
            abandoned: false,
        }));
        (
            Completion {
                state: Arc::clone(&state),
                dispatch: dispatch.clone(),
            },
            PendingRpc {
                state,
                dispatch: dispatch.clone(),
            },
        )
    }

    /// Deliver the result. The callback runs on a dispatch worker.
    pub fn complete(self, value: T) {
        let callback = self.state.lock().callback.take();
        if let Some(callback) = callback {
            self.dispatch.submit(move || callback(value));
        }
    }
}

impl<T: Abandon + Send + 'static> Drop for Completion<T> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.callback.is_none() {
            return;
        }
        if state.accepted {
            if let Some(callback) = state.callback.take() {
                drop(state);
                debug!("completion dropped uncompleted, delivering abandoned status");
                self.dispatch.submit(move || callback(T::abandoned()));
            }
        } else {
            state.abandoned = true;
        }
    }
}

impl<T: Abandon + Send + 'static> PendingRpc<T> {
    /// The engine accepted the request: a terminal callback is now owed.
    pub fn accept(self) {
        let mut state = self.state.lock();
        state.accepted = true;
        if state.abandoned {
            if let Some(callback) = state.callback.take() {
                drop(state);
                self.dispatch.submit(move || callback(T::abandoned()));
            }
        }
    }

    /// The request was rejected synchronously: the callback must never run.
    pub fn reject(self) {
        drop(self.state.lock().callback.take());
    }
}

impl<T: Abandon + Send + 'static> Drop for PendingRpc<T> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if !state.accepted {
            drop(state.callback.take());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum Outcome {
        Done(u32),
        Gone,
    }

    impl Abandon for Outcome {
        fn abandoned() -> Self {
            Outcome::Gone
        }
    }

    fn pool() -> CallbackDispatch {
        CallbackDispatch::new(&DispatchConfig { workers: 2 })
    }

    #[test]
    fn test_submit_runs_off_caller_thread() {
        let dispatch = pool();
        let caller = thread::current().id();
        let (tx, rx) = bounded(1);

        dispatch.submit(move || {
            tx.send(thread::current().id()).unwrap();
        });

        let worker = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_ne!(worker, caller);
        dispatch.shutdown();
    }

    #[test]
    fn test_panicking_callback_keeps_worker_alive() {
        let dispatch = CallbackDispatch::new(&DispatchConfig { workers: 1 });
        let (tx, rx) = bounded(1);

        dispatch.submit(|| panic!("user bug"));
        dispatch.submit(move || tx.send(()).unwrap());

        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        dispatch.shutdown();
    }

    #[test]
    fn test_complete_delivers_once() {
        let dispatch = pool();
        let (tx, rx) = bounded(4);
        let (completion, pending) = Completion::new(&dispatch, move |o: Outcome| {
            tx.send(o).unwrap();
        });
        pending.accept();
        completion.complete(Outcome::Done(7));

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Outcome::Done(7));
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_dropped_after_accept_delivers_abandoned() {
        let dispatch = pool();
        let (tx, rx) = bounded(4);
        let (completion, pending) = Completion::new(&dispatch, move |o: Outcome| {
            tx.send(o).unwrap();
        });
        pending.accept();
        drop(completion);

        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Outcome::Gone);
    }

    #[test]
    fn test_dropped_before_accept_delivers_on_accept() {
        let dispatch = pool();
        let (tx, rx) = bounded(4);
        let (completion, pending) = Completion::new(&dispatch, move |o: Outcome| {
            tx.send(o).unwrap();
        });
        drop(completion);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        pending.accept();
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Outcome::Gone);
    }

    #[test]
    fn test_rejected_never_fires() {
        let dispatch = pool();
        let (tx, rx) = bounded(4);
        let (completion, pending) = Completion::new(&dispatch, move |o: Outcome| {
            tx.send(o).unwrap();
        });
        pending.reject();
        drop(completion);

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_submit_after_shutdown_still_runs() {
        let dispatch = pool();
        dispatch.shutdown();

        let (tx, rx) = bounded(1);
        dispatch.submit(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
    }
}
