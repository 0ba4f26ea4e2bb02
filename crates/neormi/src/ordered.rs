//! # Ordered Execution Queue
//!
//! Serializes the invocations of one method on one binding. Any number of
//! threads may `submit`; only the submitter that found the queue empty has to
//! schedule a `run`, so at most one execution context drains the queue at a
//! time no matter how the executor spreads work across threads.
//!
//! ## Invariants
//!
//! - At most one task from a queue is running at any instant.
//! - Tasks run strictly in submission order.
//! - The running task stays at the head of the queue until it finishes, so the
//!   queue is never observed empty while work is in flight.
//! - The lock is never held while a task runs.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use crate::executor::Task;
use crate::fault::panic_message;

#[derive(Default)]
pub struct OrderedQueue {
    // The head slot is emptied while its task runs and popped afterwards.
    tasks: Mutex<VecDeque<Option<Task>>>,
}

impl OrderedQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Option<Task>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a task. Returns `true` if the caller must now arrange one `run`.
    pub fn submit(&self, task: Task) -> bool {
        let mut tasks = self.lock();
        let needs_scheduling = tasks.is_empty();
        tasks.push_back(Some(task));
        needs_scheduling
    }

    /// Drains the queue on the current thread, returning once it is empty.
    pub fn run(&self) {
        loop {
            let task = {
                let mut tasks = self.lock();
                match tasks.front_mut() {
                    Some(slot) => slot.take(),
                    None => return,
                }
            };

            if let Some(task) = task {
                if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(task)) {
                    let reason = panic_message(payload.as_ref());
                    tracing::warn!(%reason, "ordered task panicked");
                }
            }

            let mut tasks = self.lock();
            tasks.pop_front();
            if tasks.is_empty() {
                return;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
