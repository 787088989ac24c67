//! Serialized command execution for the shared adapter.
//!
//! Every GATT operation goes through one [`CommandQueue`]: a FIFO drained by
//! a single worker task, so no two bus commands are ever in flight at once.
//! A command that fails with a transport loss is dropped (reconnect logic
//! owns recovery); any other failure retries at the *head* of the queue until
//! the command's retry cap is exhausted.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::Result;

/// A named unit of work waiting behind the queue.
pub struct QueuedCommand {
    name: String,
    max_retries: u32,
    retry_count: u32,
    invoke: Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>,
}

impl QueuedCommand {
    /// Create a command.
    ///
    /// `max_retries` is the number of *additional* attempts after the first;
    /// `0` means a single attempt with no retry.
    pub fn new<F, Fut>(name: impl Into<String>, max_retries: u32, invoke: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            max_retries,
            retry_count: 0,
            invoke: Box::new(move || Box::pin(invoke())),
        }
    }

    /// The command name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times this command has been attempted.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }
}

impl fmt::Debug for QueuedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedCommand")
            .field("name", &self.name)
            .field("max_retries", &self.max_retries)
            .field("retry_count", &self.retry_count)
            .finish_non_exhaustive()
    }
}

/// FIFO of [`QueuedCommand`]s with single-flight execution.
pub struct CommandQueue {
    pending: Mutex<VecDeque<QueuedCommand>>,
    wakeup: Notify,
    executing: AtomicBool,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CommandQueue {
    /// Create a queue. Call [`CommandQueue::start`] to spawn the worker.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            executing: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker task that drains the queue. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        let queue = Arc::clone(self);
        *worker = Some(tokio::spawn(async move { queue.run().await }));
    }

    /// Enqueue a command and kick the worker.
    ///
    /// Dropped silently (with a log line) once the queue is disposed.
    pub async fn execute(&self, command: QueuedCommand) {
        if self.cancel.is_cancelled() {
            debug!(command = %command.name, "Queue disposed, dropping command");
            return;
        }
        self.pending.lock().await.push_back(command);
        self.wakeup.notify_one();
    }

    /// Whether a command is currently in flight.
    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::SeqCst)
    }

    /// Number of commands waiting (excluding any in flight).
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Stop the worker and clear the queue. Idempotent.
    ///
    /// Waits for the in-flight command (commands are uncancellable), then
    /// discards everything still pending.
    pub async fn dispose(&self) {
        self.cancel.cancel();
        self.wakeup.notify_one();
        if let Some(handle) = self.worker.lock().await.take() {
            let _ = handle.await;
        }
        let dropped = {
            let mut pending = self.pending.lock().await;
            let count = pending.len();
            pending.clear();
            count
        };
        if dropped > 0 {
            debug!(dropped, "Cleared command queue on dispose");
        }
    }

    async fn run(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.wakeup.notified() => {}
            }

            while let Some(command) = self.pop_next().await {
                self.execute_one(command).await;
                // Yield between commands so notification handling and other
                // I/O interleave with a busy queue.
                tokio::task::yield_now().await;
                if self.cancel.is_cancelled() {
                    return;
                }
            }
        }
    }

    async fn pop_next(&self) -> Option<QueuedCommand> {
        self.pending.lock().await.pop_front()
    }

    async fn execute_one(&self, mut command: QueuedCommand) {
        command.retry_count += 1;
        debug!(
            command = %command.name,
            attempt = command.retry_count,
            "Executing command"
        );

        self.executing.store(true, Ordering::SeqCst);
        let result = (command.invoke)().await;
        self.executing.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                debug!(command = %command.name, "Command succeeded");
            }
            Err(e) if e.is_not_connected() => {
                // The connection is gone; reconnect logic re-establishes it
                // and re-enqueues whatever still matters.
                warn!(command = %command.name, "Dropping command: {e}");
            }
            Err(e) if command.retry_count <= command.max_retries => {
                warn!(
                    command = %command.name,
                    attempt = command.retry_count,
                    "Command failed, retrying at head: {e}"
                );
                self.pending.lock().await.push_front(command);
            }
            Err(e) => {
                warn!(
                    command = %command.name,
                    attempts = command.retry_count,
                    "Command failed, retry cap reached, dropping: {e}"
                );
            }
        }
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("executing", &self.is_executing())
            .field("disposed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn drain_until_idle(queue: &Arc<CommandQueue>) {
        // Commands settle quickly; poll instead of sleeping a fixed time.
        for _ in 0..200 {
            if queue.pending_count().await == 0 && !queue.is_executing() {
                // One extra yield lets a retry re-enqueue before we re-check.
                tokio::task::yield_now().await;
                if queue.pending_count().await == 0 && !queue.is_executing() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue did not settle");
    }

    #[tokio::test]
    async fn test_commands_run_in_fifo_order() {
        let queue = Arc::new(CommandQueue::new());
        queue.start().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        for name in ["first", "second", "third"] {
            let tx = tx.clone();
            queue
                .execute(QueuedCommand::new(name, 0, move || {
                    let tx = tx.clone();
                    async move {
                        tx.send(name).unwrap();
                        Ok(())
                    }
                }))
                .await;
        }

        drain_until_idle(&queue).await;
        assert_eq!(rx.recv().await, Some("first"));
        assert_eq!(rx.recv().await, Some("second"));
        assert_eq!(rx.recv().await, Some("third"));
    }

    #[tokio::test]
    async fn test_retry_at_head_before_later_commands() {
        let queue = Arc::new(CommandQueue::new());
        queue.start().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let failures = Arc::new(AtomicU32::new(0));

        // Fails twice with a retryable error, then succeeds.
        {
            let tx = tx.clone();
            let failures = Arc::clone(&failures);
            queue
                .execute(QueuedCommand::new("flaky", 2, move || {
                    let tx = tx.clone();
                    let failures = Arc::clone(&failures);
                    async move {
                        tx.send("flaky").unwrap();
                        if failures.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(Error::Bus(zbus::Error::Failure("Device busy".into())))
                        } else {
                            Ok(())
                        }
                    }
                }))
                .await;
        }
        {
            let tx = tx.clone();
            queue
                .execute(QueuedCommand::new("after", 0, move || {
                    let tx = tx.clone();
                    async move {
                        tx.send("after").unwrap();
                        Ok(())
                    }
                }))
                .await;
        }

        drain_until_idle(&queue).await;
        // Retries stay at the head: all three flaky attempts precede "after".
        assert_eq!(rx.recv().await, Some("flaky"));
        assert_eq!(rx.recv().await, Some("flaky"));
        assert_eq!(rx.recv().await, Some("flaky"));
        assert_eq!(rx.recv().await, Some("after"));
    }

    #[tokio::test]
    async fn test_not_connected_drops_without_retry() {
        let queue = Arc::new(CommandQueue::new());
        queue.start().await;

        let attempts = Arc::new(AtomicU32::new(0));
        {
            let attempts = Arc::clone(&attempts);
            queue
                .execute(QueuedCommand::new("lost", 5, move || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(Error::NotConnected)
                    }
                }))
                .await;
        }

        drain_until_idle(&queue).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_cap_drops_command() {
        let queue = Arc::new(CommandQueue::new());
        queue.start().await;

        let attempts = Arc::new(AtomicU32::new(0));
        {
            let attempts = Arc::clone(&attempts);
            queue
                .execute(QueuedCommand::new("doomed", 2, move || {
                    let attempts = Arc::clone(&attempts);
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(Error::Bus(zbus::Error::Failure("Device busy".into())))
                    }
                }))
                .await;
        }

        drain_until_idle(&queue).await;
        // Initial attempt plus two retries.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_flight_under_concurrent_enqueue() {
        let queue = Arc::new(CommandQueue::new());
        queue.start().await;

        let in_flight = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));

        for i in 0..10 {
            let in_flight = Arc::clone(&in_flight);
            let overlapped = Arc::clone(&overlapped);
            queue
                .execute(QueuedCommand::new(format!("cmd-{i}"), 0, move || {
                    let in_flight = Arc::clone(&in_flight);
                    let overlapped = Arc::clone(&overlapped);
                    async move {
                        if in_flight.swap(true, Ordering::SeqCst) {
                            overlapped.store(true, Ordering::SeqCst);
                        }
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        in_flight.store(false, Ordering::SeqCst);
                        Ok(())
                    }
                }))
                .await;
        }

        drain_until_idle(&queue).await;
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dispose_clears_pending_and_is_idempotent() {
        let queue = Arc::new(CommandQueue::new());
        queue.start().await;

        let ran = Arc::new(AtomicU32::new(0));
        // Never start the worker on these: block it with a slow first command.
        {
            let ran = Arc::clone(&ran);
            queue
                .execute(QueuedCommand::new("slow", 0, move || {
                    let ran = Arc::clone(&ran);
                    async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    }
                }))
                .await;
        }
        for i in 0..3 {
            let ran = Arc::clone(&ran);
            queue
                .execute(QueuedCommand::new(format!("queued-{i}"), 0, move || {
                    let ran = Arc::clone(&ran);
                    async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }))
                .await;
        }

        // Let the slow command start, then dispose mid-flight.
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.dispose().await;
        queue.dispose().await;

        // Only the in-flight command ran; dispose waited for it.
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_count().await, 0);

        // Enqueue after dispose is a no-op.
        queue
            .execute(QueuedCommand::new("late", 0, || async { Ok(()) }))
            .await;
        assert_eq!(queue.pending_count().await, 0);
    }
}
