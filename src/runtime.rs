//! Event-Loop Task Plumbing
//! ========================
//! The owning process runs a single-threaded cooperative event loop; scan
//! workers never run completion callbacks themselves. They post boxed
//! closures here and the loop executes them in arrival order.

use tokio::sync::mpsc;
use tracing::warn;

/// A deferred unit of work destined for the event-loop thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cloneable handle used by worker threads to post deferred tasks.
#[derive(Clone)]
pub struct TaskRemote {
    tx: mpsc::UnboundedSender<Task>,
}

impl TaskRemote {
    /// Post a task for the event loop. Tasks posted after the loop has shut
    /// down are dropped with a warning; there is nowhere left to run them.
    pub fn post(&self, task: Task) {
        if self.tx.send(task).is_err() {
            warn!("event loop has shut down, dropping deferred task");
        }
    }
}

/// Receiving half held by the event-loop thread.
pub struct EventLoop {
    rx: mpsc::UnboundedReceiver<Task>,
}

impl EventLoop {
    pub fn new() -> (EventLoop, TaskRemote) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventLoop { rx }, TaskRemote { tx })
    }

    /// Await the next deferred task. Returns `None` once every remote has
    /// been dropped and the queue is drained.
    pub async fn next(&mut self) -> Option<Task> {
        self.rx.recv().await
    }

    /// Run every task currently queued without blocking. Returns the number
    /// executed. Used during shutdown and by tests.
    pub fn run_until_idle(&mut self) -> usize {
        let mut count = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            count += 1;
        }
        count
    }
}
