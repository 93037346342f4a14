//! Per-queue serialized dispatch.
//!
//! Work submitted under the same queue name runs strictly one item at a
//! time in submission order; different queues run concurrently on the tokio
//! worker pool.
//!
//! # Architecture
//!
//! ```text
//! submit("a", w1) ─┐                      ┌─► drain task "a": w1, w2, ...
//! submit("a", w2) ─┼─► queue "a" (FIFO) ──┘
//! submit("b", w3) ───► queue "b" (FIFO) ────► drain task "b": w3
//! ```
//!
//! Each queue holds a FIFO and a one-permit semaphore. Whoever acquires the
//! permit spawns a drain task that owns it until the FIFO is empty; other
//! submitters only enqueue. `submit` never waits.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::{AggError, Result};
use crate::handler::BoxFuture;

/// Unit of work run by the dispatcher.
pub type Task = BoxFuture<'static, Result<()>>;

struct CommandQueue {
    /// FIFO of tickets and work; the ticket lets a rejected submitter find
    /// its own item again.
    pending: Mutex<VecDeque<(u64, Task)>>,
    tickets: AtomicU64,
    activity: Arc<Semaphore>,
}

impl CommandQueue {
    fn new(closed: bool) -> Self {
        let activity = Semaphore::new(1);
        if closed {
            activity.close();
        }
        Self {
            pending: Mutex::new(VecDeque::new()),
            tickets: AtomicU64::new(0),
            activity: Arc::new(activity),
        }
    }

    fn ticket(&self) -> u64 {
        self.tickets.fetch_add(1, Ordering::Relaxed)
    }

    fn close(&self) {
        // Under the FIFO lock so no submitter pushes past a closed check.
        let _pending = self.pending.lock();
        self.activity.close();
    }
}

pub struct QueueDispatcher {
    queues: DashMap<String, Arc<CommandQueue>>,
    closed: AtomicBool,
    runtime: Handle,
}

impl QueueDispatcher {
    /// Dispatcher on the current tokio runtime.
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| AggError::Usage(format!("Dispatcher needs a tokio runtime: {}", e)))?;
        Ok(Self::with_handle(runtime))
    }

    pub fn with_handle(runtime: Handle) -> Self {
        Self {
            queues: DashMap::new(),
            closed: AtomicBool::new(false),
            runtime,
        }
    }

    /// Submit `work` to `queue_name`.
    ///
    /// Returns immediately. Fails once the dispatcher has been closed; work
    /// rejected this way never runs.
    pub fn submit<F>(&self, queue_name: &str, work: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if self.is_closed() {
            return Err(AggError::QueueClosed(queue_name.to_string()));
        }
        let queue = self
            .queues
            .entry(queue_name.to_string())
            .or_insert_with(|| Arc::new(CommandQueue::new(self.is_closed())))
            .clone();
        let work: Task = Box::pin(work);

        match queue.activity.clone().try_acquire_owned() {
            Ok(permit) => {
                self.spawn_drain(queue_name, queue, permit, Some(work));
                Ok(())
            }
            Err(TryAcquireError::NoPermits) => {
                let ticket = queue.ticket();
                {
                    let mut pending = queue.pending.lock();
                    if queue.activity.is_closed() {
                        return Err(AggError::QueueClosed(queue_name.to_string()));
                    }
                    pending.push_back((ticket, work));
                }
                // The drainer may have released the permit between our failed
                // acquire and the push.
                match queue.activity.clone().try_acquire_owned() {
                    Ok(permit) => self.spawn_drain(queue_name, queue, permit, None),
                    Err(TryAcquireError::NoPermits) => {}
                    Err(TryAcquireError::Closed) => {
                        // Closed after the push. If no drainer took the item
                        // it would never run, so withdraw it.
                        let mut pending = queue.pending.lock();
                        if let Some(pos) = pending.iter().position(|(t, _)| *t == ticket) {
                            pending.remove(pos);
                            return Err(AggError::QueueClosed(queue_name.to_string()));
                        }
                    }
                }
                Ok(())
            }
            Err(TryAcquireError::Closed) => Err(AggError::QueueClosed(queue_name.to_string())),
        }
    }

    fn spawn_drain(
        &self,
        queue_name: &str,
        queue: Arc<CommandQueue>,
        permit: OwnedSemaphorePermit,
        first: Option<Task>,
    ) {
        // Earlier submissions still waiting in the FIFO go first.
        let first = match first {
            Some(work) => {
                let mut pending = queue.pending.lock();
                if pending.is_empty() {
                    Some(work)
                } else {
                    pending.push_back((queue.ticket(), work));
                    None
                }
            }
            None => None,
        };

        let name = queue_name.to_string();
        let runtime = self.runtime.clone();
        self.runtime
            .spawn(drain(name, queue, permit, first, runtime));
    }

    /// Number of queues created so far.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Items waiting (not running) in `queue_name`.
    pub fn pending_count(&self, queue_name: &str) -> usize {
        self.queues
            .get(queue_name)
            .map_or(0, |q| q.pending.lock().len())
    }

    /// Stop accepting work on every queue, including ones not created yet.
    ///
    /// Items already queued are still drained by a running drain task.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for queue in self.queues.iter() {
            queue.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for QueueDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDispatcher")
            .field("queues", &self.queues.len())
            .finish()
    }
}

async fn drain(
    name: String,
    queue: Arc<CommandQueue>,
    permit: OwnedSemaphorePermit,
    first: Option<Task>,
    runtime: Handle,
) {
    let mut permit = Some(permit);

    if let Some(work) = first {
        run_isolated(&name, work, &runtime).await;
    }

    loop {
        let next = queue.pending.lock().pop_front();
        match next {
            Some((_, work)) => run_isolated(&name, work, &runtime).await,
            None => {
                drop(permit.take());
                if queue.pending.lock().is_empty() {
                    return;
                }
                // Work arrived after the last pop; take the permit back unless
                // a submitter already did.
                match queue.activity.clone().try_acquire_owned() {
                    Ok(p) => permit = Some(p),
                    Err(_) => return,
                }
            }
        }
    }
}

/// Run one item in its own task so errors and panics stay contained.
async fn run_isolated(queue: &str, work: Task, runtime: &Handle) {
    match runtime.spawn(work).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) if e.is_disconnection() => {
            tracing::debug!("Queued work on '{}' failed: {}", queue, e);
        }
        Ok(Err(e)) => tracing::warn!("Queued work on '{}' failed: {}", queue, e),
        Err(e) => tracing::error!("Queued work on '{}' panicked: {}", queue, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::{Barrier, Notify};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_queue_runs_in_submission_order() {
        let dispatcher = QueueDispatcher::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Notify::new());

        for i in 0..100 {
            let order = order.clone();
            let done = done.clone();
            dispatcher
                .submit("q", async move {
                    if i % 7 == 0 {
                        tokio::task::yield_now().await;
                    }
                    order.lock().push(i);
                    if i == 99 {
                        done.notify_one();
                    }
                    Ok(())
                })
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), done.notified())
            .await
            .unwrap();
        assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_queue_never_overlaps() {
        let dispatcher = QueueDispatcher::new().unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let running = running.clone();
            let max_seen = max_seen.clone();
            let finished = finished.clone();
            dispatcher
                .submit("serial", async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }

        for _ in 0..500 {
            if finished.load(Ordering::SeqCst) == 20 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(finished.load(Ordering::SeqCst), 20);
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_queues_run_concurrently() {
        let dispatcher = QueueDispatcher::new().unwrap();
        // Both items must be inside their work at the same time to pass.
        let barrier = Arc::new(Barrier::new(3));

        for name in ["a", "b"] {
            let barrier = barrier.clone();
            dispatcher
                .submit(name, async move {
                    barrier.wait().await;
                    Ok(())
                })
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), barrier.wait())
            .await
            .expect("queues did not overlap");
        assert_eq!(dispatcher.queue_count(), 2);
    }

    fn ran_before_panic() -> bool {
        true
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_and_panic_do_not_stop_drain() {
        let dispatcher = QueueDispatcher::new().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Notify::new());

        dispatcher
            .submit("q", async { Err(AggError::Context("boom".into())) })
            .unwrap();
        dispatcher
            .submit("q", async {
                if ran_before_panic() {
                    panic!("work item panicked");
                }
                Ok(())
            })
            .unwrap();
        {
            let ran = ran.clone();
            let done = done.clone();
            dispatcher
                .submit("q", async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    done.notify_one();
                    Ok(())
                })
                .unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), done.notified())
            .await
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_submit_does_not_block_while_busy() {
        let dispatcher = QueueDispatcher::new().unwrap();
        let gate = Arc::new(Notify::new());
        let released = gate.clone();

        dispatcher
            .submit("q", async move {
                released.notified().await;
                Ok(())
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        for _ in 0..3 {
            dispatcher.submit("q", async { Ok(()) }).unwrap();
        }
        assert_eq!(dispatcher.pending_count("q"), 3);

        gate.notify_one();
        for _ in 0..200 {
            if dispatcher.pending_count("q") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(dispatcher.pending_count("q"), 0);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_work() {
        let dispatcher = QueueDispatcher::new().unwrap();
        dispatcher.submit("q", async { Ok(()) }).unwrap();
        dispatcher.close();

        let err = dispatcher.submit("q", async { Ok(()) }).unwrap_err();
        assert!(matches!(err, AggError::QueueClosed(name) if name == "q"));
    }

    #[tokio::test]
    async fn test_closed_dispatcher_rejects_new_queue() {
        let dispatcher = QueueDispatcher::new().unwrap();
        dispatcher.submit("existing", async { Ok(()) }).unwrap();
        dispatcher.close();
        assert!(dispatcher.is_closed());

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let err = dispatcher
            .submit("fresh", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, AggError::QueueClosed(name) if name == "fresh"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_work_rejected_on_busy_queue_never_runs() {
        let dispatcher = QueueDispatcher::new().unwrap();
        let gate = Arc::new(Notify::new());
        let released = gate.clone();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        dispatcher
            .submit("q", async move {
                released.notified().await;
                let _ = done_tx.send(());
                Ok(())
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.close();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let err = dispatcher
            .submit("q", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, AggError::QueueClosed(_)));
        assert_eq!(dispatcher.pending_count("q"), 0);

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), done_rx)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submitters_keep_their_order() {
        const SUBMITTERS: usize = 4;
        const PER_SUBMITTER: usize = 50;

        let dispatcher = Arc::new(QueueDispatcher::new().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let busy = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicUsize::new(0));

        let mut submitters = Vec::new();
        for submitter in 0..SUBMITTERS {
            let dispatcher = dispatcher.clone();
            let seen = seen.clone();
            let busy = busy.clone();
            let overlapped = overlapped.clone();
            let finished = finished.clone();
            submitters.push(tokio::spawn(async move {
                for seq in 0..PER_SUBMITTER {
                    let seen = seen.clone();
                    let busy = busy.clone();
                    let overlapped = overlapped.clone();
                    let finished = finished.clone();
                    dispatcher
                        .submit("shared", async move {
                            if busy.swap(true, Ordering::SeqCst) {
                                overlapped.store(true, Ordering::SeqCst);
                            }
                            seen.lock().push((submitter, seq));
                            tokio::task::yield_now().await;
                            busy.store(false, Ordering::SeqCst);
                            finished.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                    if seq % 5 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }
        for submitter in submitters {
            submitter.await.unwrap();
        }

        for _ in 0..1000 {
            if finished.load(Ordering::SeqCst) == SUBMITTERS * PER_SUBMITTER {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(finished.load(Ordering::SeqCst), SUBMITTERS * PER_SUBMITTER);
        assert!(!overlapped.load(Ordering::SeqCst));

        let seen = seen.lock();
        for submitter in 0..SUBMITTERS {
            let sequence: Vec<usize> = seen
                .iter()
                .filter(|(s, _)| *s == submitter)
                .map(|(_, seq)| *seq)
                .collect();
            assert_eq!(sequence, (0..PER_SUBMITTER).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        assert!(matches!(QueueDispatcher::new(), Err(AggError::Usage(_))));
    }
}
