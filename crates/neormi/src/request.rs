//! # Correlation Cell
//!
//! A `Request` is a single-assignment result slot shared between the side
//! that will eventually produce an outcome and any number of observers.
//!
//! ## Invariants
//!
//! - An outcome is set at most once; later attempts return `false` and change nothing.
//! - Callbacks registered before completion run on the completing thread, in
//!   registration order, after the lock is released.
//! - Callbacks registered after completion run immediately on the caller's thread.
//! - `synchronize` timing out means "still pending", never "failed".

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::fault::Fault;
use crate::fault::panic_message;
use crate::value::Value;

/// The settled state of a request.
pub type Outcome<T> = std::result::Result<T, Fault>;

type Callback<T> = Box<dyn FnOnce(&Outcome<T>) + Send + 'static>;

/// Failure of a blocking wait on a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The request completed with a failure cause.
    Remote(Fault),
    /// The request did not complete in time. It may still complete later.
    Timeout(Duration),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Remote(fault) => write!(f, "{}", fault),
            Self::Timeout(after) => write!(f, "Request still pending after {:?}", after),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Remote(fault) => Some(fault),
            Self::Timeout(_) => None,
        }
    }
}

impl From<Fault> for Error {
    fn from(fault: Fault) -> Self {
        Self::Remote(fault)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

enum State<T> {
    Pending(Vec<Callback<T>>),
    Done(Outcome<T>),
}

struct Cell<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

/// A "send now, resolve later" slot.
///
/// Cloning yields another handle to the same slot.
pub struct Request<T = Value> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self { cell: Arc::clone(&self.cell) }
    }
}

impl<T: Clone + Send + 'static> Request<T> {
    /// Creates a pending request.
    pub fn new() -> Self {
        Self::with_state(State::Pending(Vec::new()))
    }

    /// Creates a request that already succeeded.
    pub fn completed(value: T) -> Self {
        Self::with_state(State::Done(Ok(value)))
    }

    /// Creates a request that already failed.
    pub fn failed(fault: Fault) -> Self {
        Self::with_state(State::Done(Err(fault)))
    }

    fn with_state(state: State<T>) -> Self {
        Self {
            cell: Arc::new(Cell {
                state: Mutex::new(state),
                done: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.cell.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets the outcome if none is set yet. Returns whether this call won.
    pub fn complete(&self, outcome: Outcome<T>) -> bool {
        let mut state = self.lock();
        if let State::Done(_) = *state {
            return false;
        }
        let previous = std::mem::replace(&mut *state, State::Done(outcome.clone()));
        drop(state);
        self.cell.done.notify_all();

        let State::Pending(callbacks) = previous else {
            return false;
        };
        for callback in callbacks {
            run_callback(callback, &outcome);
        }
        true
    }

    pub fn succeed(&self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(&self, fault: Fault) -> bool {
        self.complete(Err(fault))
    }

    /// Registers a callback for the outcome.
    pub fn on_complete(&self, callback: impl FnOnce(&Outcome<T>) + Send + 'static) {
        let outcome = {
            let mut state = self.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Done(outcome) => outcome.clone(),
            }
        };
        run_callback(Box::new(callback), &outcome);
    }

    /// Blocks until the request completes or the timeout elapses.
    ///
    /// `None` waits without a deadline. Returns `true` if the request is complete.
    pub fn synchronize(&self, timeout: Option<Duration>) -> bool {
        let state = self.lock();
        let pending = |s: &mut State<T>| matches!(s, State::Pending(_));
        let state = match timeout {
            None => self
                .cell
                .done
                .wait_while(state, pending)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                self.cell
                    .done
                    .wait_timeout_while(state, timeout, pending)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
        };
        matches!(*state, State::Done(_))
    }

    /// Blocks for the outcome, turning a missed deadline into `Error::Timeout`.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<T> {
        if !self.synchronize(timeout) {
            return Err(Error::Timeout(timeout.unwrap_or_default()));
        }
        match self.outcome() {
            Some(Ok(value)) => Ok(value),
            Some(Err(fault)) => Err(Error::Remote(fault)),
            None => Err(Error::Timeout(timeout.unwrap_or_default())),
        }
    }

    /// Resolves once the request completes, without blocking a thread.
    pub async fn completion(&self) -> Outcome<T> {
        let (tx, rx) = oneshot::channel();
        self.on_complete(move |outcome| {
            let _ = tx.send(outcome.clone());
        });
        rx.await
            .unwrap_or_else(|_| Err(Fault::IllegalState("request dropped while pending".into())))
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.lock(), State::Done(_))
    }

    pub fn is_successful(&self) -> bool {
        matches!(*self.lock(), State::Done(Ok(_)))
    }

    /// The outcome, if the request is complete.
    pub fn outcome(&self) -> Option<Outcome<T>> {
        match &*self.lock() {
            State::Done(outcome) => Some(outcome.clone()),
            State::Pending(_) => None,
        }
    }

    /// The result value, if the request succeeded.
    pub fn attachment(&self) -> Option<T> {
        self.outcome().and_then(|o| o.ok())
    }

    /// The failure cause, if the request failed.
    pub fn cause(&self) -> Option<Fault> {
        self.outcome().and_then(|o| o.err())
    }
}

impl<T: Clone + Send + 'static> Default for Request<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.cell.state.lock().unwrap_or_else(PoisonError::into_inner);
        let label = match &*state {
            State::Pending(callbacks) => format!("Pending({} callbacks)", callbacks.len()),
            State::Done(Ok(_)) => "Succeeded".to_string(),
            State::Done(Err(fault)) => format!("Failed({})", fault),
        };
        f.debug_tuple("Request").field(&label).finish()
    }
}

fn run_callback<T>(callback: Callback<T>, outcome: &Outcome<T>) {
    if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
        tracing::warn!(reason = %panic_message(payload.as_ref()), "request callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_second_completion_is_noop() {
        let req: Request<u32> = Request::new();
        assert!(req.succeed(1));
        assert!(!req.succeed(2));
        assert!(!req.fail(Fault::ConnectionClosed));
        assert_eq!(req.attachment(), Some(1));
        assert_eq!(req.cause(), None);
    }

    #[test]
    fn test_concurrent_completion_single_outcome() {
        for _ in 0..50 {
            let req: Request<u32> = Request::new();
            let observed = Arc::new(Mutex::new(Vec::new()));
            for _ in 0..4 {
                let observed = observed.clone();
                req.on_complete(move |o| observed.lock().unwrap().push(o.clone()));
            }

            let barrier = Arc::new(Barrier::new(8));
            let wins = Arc::new(AtomicUsize::new(0));
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let req = req.clone();
                    let barrier = barrier.clone();
                    let wins = wins.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        let won = if i % 2 == 0 {
                            req.succeed(i)
                        } else {
                            req.fail(Fault::Application(format!("loser {}", i)))
                        };
                        if won {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }

            assert_eq!(wins.load(Ordering::SeqCst), 1);
            let final_outcome = req.outcome().unwrap();
            let observed = observed.lock().unwrap();
            assert_eq!(observed.len(), 4);
            assert!(observed.iter().all(|o| *o == final_outcome));
        }
    }

    #[test]
    fn test_callback_after_completion_runs_inline() {
        let req = Request::completed(7u32);
        let caller = thread::current().id();
        let ran_on = Arc::new(Mutex::new(None));
        let slot = ran_on.clone();
        req.on_complete(move |o| {
            assert_eq!(*o, Ok(7));
            *slot.lock().unwrap() = Some(thread::current().id());
        });
        assert_eq!(*ran_on.lock().unwrap(), Some(caller));
    }

    #[test]
    fn test_synchronize_times_out_while_pending() {
        let req: Request<u32> = Request::new();
        let start = Instant::now();
        assert!(!req.synchronize(Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(!req.is_done());
        assert_eq!(
            req.wait(Some(Duration::from_millis(1))),
            Err(Error::Timeout(Duration::from_millis(1)))
        );
    }

    #[test]
    fn test_synchronize_wakes_on_completion() {
        let req: Request<u32> = Request::new();
        let completer = req.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            completer.fail(Fault::ConnectionClosed);
        });
        assert!(req.synchronize(None));
        assert_eq!(req.wait(None), Err(Error::Remote(Fault::ConnectionClosed)));
        handle.join().unwrap();
    }

    #[test]
    fn test_panicking_callback_does_not_block_others() {
        let req: Request<u32> = Request::new();
        let count = Arc::new(AtomicUsize::new(0));
        req.on_complete(|_| panic!("bad observer"));
        let c = count.clone();
        req.on_complete(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(req.succeed(3));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_async_completion() {
        let req: Request<u32> = Request::new();
        let completer = req.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            completer.succeed(42);
        });
        assert_eq!(req.completion().await, Ok(42));
    }
}
