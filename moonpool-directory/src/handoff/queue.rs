//! Per-target-silo serial operation queues.
//!
//! Each target silo gets one unbounded channel drained by one worker task.
//! Operations for the same target run strictly in enqueue order; different
//! targets drain in parallel. A failing operation is retried in place with a
//! fixed delay, so it never falls behind operations queued after it, and is
//! dropped with a warning once its attempts are used up.
//!
//! The mutex only guards the sender map. Operations run on the workers.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::DirectoryError;
use crate::model::SiloAddress;

type Action = Box<dyn FnMut() -> BoxFuture<'static, Result<(), DirectoryError>> + Send>;

/// A re-runnable unit of handoff work.
///
/// The action is called once per attempt and must build a fresh future
/// each time.
pub struct PendingOperation {
    name: String,
    action: Action,
}

impl PendingOperation {
    /// Wrap a re-runnable action.
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: FnMut() -> BoxFuture<'static, Result<(), DirectoryError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(action),
        }
    }

    /// Operation name, for logs.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

enum QueueItem {
    Run(PendingOperation),
    Barrier(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy)]
struct RetryBudget {
    delay: Duration,
    max_attempts: u32,
}

/// Serial operation queues keyed by target silo.
#[derive(Debug)]
pub struct SiloOperationQueues {
    senders: Mutex<HashMap<SiloAddress, mpsc::UnboundedSender<QueueItem>>>,
    budget: RetryBudget,
    enqueued: AtomicU64,
    dropped: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run(op) => write!(f, "Run({})", op.name),
            Self::Barrier(_) => write!(f, "Barrier"),
        }
    }
}

impl SiloOperationQueues {
    /// Create the queue set. Workers stop when `shutdown` is cancelled.
    pub fn new(retry_delay: Duration, max_attempts: u32, shutdown: CancellationToken) -> Self {
        Self {
            senders: Mutex::new(HashMap::new()),
            budget: RetryBudget {
                delay: retry_delay,
                max_attempts: max_attempts.max(1),
            },
            enqueued: AtomicU64::new(0),
            dropped: Arc::new(AtomicU64::new(0)),
            shutdown,
        }
    }

    /// Append an operation to `target`'s queue, starting its worker if needed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, target: &SiloAddress, operation: PendingOperation) {
        if self.shutdown.is_cancelled() {
            tracing::debug!(target_silo = %target, op = operation.name(), "Handoff: queue stopped, operation discarded");
            return;
        }
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        let mut senders = self.senders.lock();
        let sender = senders
            .entry(target.clone())
            .or_insert_with(|| self.spawn_worker(target.clone()));
        if let Err(mpsc::error::SendError(item)) = sender.send(QueueItem::Run(operation)) {
            tracing::debug!(target_silo = %target, ?item, "Handoff: worker gone, operation discarded");
        }
    }

    fn spawn_worker(&self, target: SiloAddress) -> mpsc::UnboundedSender<QueueItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        let budget = self.budget;
        let shutdown = self.shutdown.clone();
        let dropped = Arc::clone(&self.dropped);
        tokio::spawn(drain(target, rx, budget, shutdown, dropped));
        tx
    }

    /// Close `target`'s queue. Already queued operations still run.
    pub fn forget(&self, target: &SiloAddress) {
        self.senders.lock().remove(target);
    }

    /// Number of operations dropped after exhausting their attempts.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    /// Wait until every queue is drained, including operations enqueued by
    /// running operations while waiting.
    pub async fn quiesce(&self) {
        loop {
            let before = self.enqueued.load(Ordering::SeqCst);
            let senders: Vec<_> = self.senders.lock().values().cloned().collect();
            let barriers = senders.into_iter().filter_map(|sender| {
                let (tx, rx) = oneshot::channel();
                sender.send(QueueItem::Barrier(tx)).ok().map(|_| rx)
            });
            join_all(barriers.collect::<Vec<_>>()).await;
            if self.enqueued.load(Ordering::SeqCst) == before || self.shutdown.is_cancelled() {
                return;
            }
        }
    }
}

async fn drain(
    target: SiloAddress,
    mut rx: mpsc::UnboundedReceiver<QueueItem>,
    budget: RetryBudget,
    shutdown: CancellationToken,
    dropped: Arc<AtomicU64>,
) {
    loop {
        let item = tokio::select! {
            _ = shutdown.cancelled() => break,
            item = rx.recv() => item,
        };
        match item {
            None => break,
            Some(QueueItem::Barrier(done)) => {
                let _ = done.send(());
            }
            Some(QueueItem::Run(operation)) => {
                if !run_with_retry(&target, operation, budget, &shutdown).await {
                    dropped.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }
    tracing::trace!(target_silo = %target, "Handoff: queue worker stopped");
}

async fn run_with_retry(
    target: &SiloAddress,
    mut operation: PendingOperation,
    budget: RetryBudget,
    shutdown: &CancellationToken,
) -> bool {
    for attempt in 1..=budget.max_attempts {
        match (operation.action)().await {
            Ok(()) => return true,
            Err(e) if attempt < budget.max_attempts => {
                tracing::warn!(
                    target_silo = %target,
                    op = operation.name(),
                    attempt,
                    error = %e,
                    "Handoff: operation failed, retrying"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return false,
                    _ = tokio::time::sleep(budget.delay) => {}
                }
            }
            Err(e) => {
                tracing::warn!(
                    target_silo = %target,
                    op = operation.name(),
                    attempts = attempt,
                    error = %e,
                    "Handoff: operation dropped"
                );
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use futures::FutureExt;

    use super::*;

    fn silo(n: u8) -> SiloAddress {
        SiloAddress::parse(&format!("10.0.0.{n}:100@1")).expect("silo")
    }

    fn record(log: &Arc<Mutex<Vec<u32>>>, value: u32) -> PendingOperation {
        let log = Arc::clone(log);
        PendingOperation::new(format!("record {value}"), move || {
            let log = Arc::clone(&log);
            async move {
                log.lock().push(value);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_operations_run_in_order() {
        let queues = SiloOperationQueues::new(Duration::from_millis(1), 2, CancellationToken::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        for n in 0..20 {
            queues.enqueue(&silo(1), record(&log, n));
        }
        queues.quiesce().await;
        assert_eq!(*log.lock(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_retried_in_place() {
        let queues = SiloOperationQueues::new(Duration::from_millis(250), 2, CancellationToken::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicU32::new(0));

        let flaky = {
            let calls = Arc::clone(&calls);
            let log = Arc::clone(&log);
            PendingOperation::new("flaky", move || {
                let calls = Arc::clone(&calls);
                let log = Arc::clone(&log);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(DirectoryError::Transport("boom".into()));
                    }
                    log.lock().push(1);
                    Ok(())
                }
                .boxed()
            })
        };

        queues.enqueue(&silo(1), flaky);
        queues.enqueue(&silo(1), record(&log, 2));
        queues.quiesce().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*log.lock(), vec![1, 2], "retry happens before later operations");
        assert_eq!(queues.dropped(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_after_max_attempts() {
        let queues = SiloOperationQueues::new(Duration::from_millis(250), 2, CancellationToken::new());
        let calls = Arc::new(AtomicU32::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));

        let failing = {
            let calls = Arc::clone(&calls);
            PendingOperation::new("always fails", move || {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(DirectoryError::Transport("down".into()))
                }
                .boxed()
            })
        };

        queues.enqueue(&silo(1), failing);
        queues.enqueue(&silo(1), record(&log, 7));
        queues.quiesce().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(queues.dropped(), 1);
        assert_eq!(*log.lock(), vec![7], "pipeline keeps going after a drop");
    }

    #[tokio::test]
    async fn test_quiesce_waits_for_chained_operations() {
        let queues = Arc::new(SiloOperationQueues::new(
            Duration::from_millis(1),
            2,
            CancellationToken::new(),
        ));
        let log = Arc::new(Mutex::new(Vec::new()));

        let chained = {
            let queues = Arc::downgrade(&queues);
            let log = Arc::clone(&log);
            PendingOperation::new("chain", move || {
                let queues = queues.clone();
                let log = Arc::clone(&log);
                async move {
                    if let Some(queues) = queues.upgrade() {
                        queues.enqueue(&silo(2), record(&log, 2));
                    }
                    Ok(())
                }
                .boxed()
            })
        };

        queues.enqueue(&silo(1), chained);
        queues.quiesce().await;
        assert_eq!(*log.lock(), vec![2]);
    }

    #[tokio::test]
    async fn test_cancelled_queues_discard() {
        let shutdown = CancellationToken::new();
        let queues = SiloOperationQueues::new(Duration::from_millis(1), 2, shutdown.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        shutdown.cancel();
        queues.enqueue(&silo(1), record(&log, 1));
        queues.quiesce().await;
        assert!(log.lock().is_empty());
    }
}
