//! # Method-Invocation Executors
//!
//! Decides where invocation work runs. Inbound messages arrive on the
//! connection's pump task; handing execution to an executor keeps that task
//! free to read the next message.

use tokio::runtime::Handle;

/// A unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

pub trait Executor: Send + Sync + 'static {
    fn execute(&self, task: Task);
}

/// Runs tasks on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct Inline;

impl Executor for Inline {
    fn execute(&self, task: Task) {
        task()
    }
}

/// Runs tasks on a tokio runtime's blocking thread pool.
///
/// Targets are synchronous and may block (including on nested remote calls),
/// so they never run on async worker threads.
#[derive(Clone, Debug)]
pub struct BlockingPool {
    handle: Handle,
}

impl BlockingPool {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Uses the runtime of the calling context, if there is one.
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl Executor for BlockingPool {
    fn execute(&self, task: Task) {
        // Detached; the task reports through its own correlation cell.
        drop(self.handle.spawn_blocking(task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_inline_runs_immediately() {
        let (tx, rx) = mpsc::channel();
        Inline.execute(Box::new(move || tx.send(std::thread::current().id()).unwrap()));
        assert_eq!(rx.try_recv().unwrap(), std::thread::current().id());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_blocking_pool_runs_off_thread() {
        let pool = BlockingPool::try_current().expect("inside a runtime");
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move || tx.send(42).unwrap()));
        let got = tokio::task::spawn_blocking(move || rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(got, Ok(42));
    }

    #[test]
    fn test_no_runtime_no_pool() {
        assert!(BlockingPool::try_current().is_none());
    }
}
