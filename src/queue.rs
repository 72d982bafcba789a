//! Serialized outbound writes with priority, heartbeat and dedup.
//!
//! All writes to the device funnel through one queue drained by a single
//! worker, one write in flight at a time with a fixed gap between writes;
//! the radio module drops back-to-back writes, so the gap is a correctness
//! requirement, not a nicety.

use crate::transport::WriteTarget;
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Pause between consecutive writes.
pub const WRITE_GAP: Duration = Duration::from_millis(50);
/// Ceiling on a single characteristic write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default heartbeat interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Scheduling class of a queued write.
///
/// `High` tasks go to the head of the queue (after any high tasks already
/// there), `Normal` and `Low` are appended in arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Completion handle for one queued write. Resolves exactly once: `true` on
/// a confirmed write, `false` on failure, timeout or queue disposal.
#[derive(Debug)]
pub struct WriteReceipt(oneshot::Receiver<bool>);

impl WriteReceipt {
    pub async fn wait(self) -> bool {
        self.0.await.unwrap_or(false)
    }

    fn resolved(result: bool) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self(rx)
    }
}

struct WriteTask {
    payload: Vec<u8>,
    priority: Priority,
    done: oneshot::Sender<bool>,
}

struct Shared {
    queue: VecDeque<WriteTask>,
    target: Option<Arc<dyn WriteTarget>>,
    worker_running: bool,
    heartbeat: Option<JoinHandle<()>>,
}

/// The priority write queue. Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct WriteQueue {
    shared: Arc<Mutex<Shared>>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                queue: VecDeque::new(),
                target: None,
                worker_running: false,
                heartbeat: None,
            })),
        }
    }

    /// Bind the queue to a write characteristic. Any tasks queued against a
    /// previous characteristic are discarded (they are not transferable
    /// across reconnects; their receipts resolve `false`) and the heartbeat
    /// is stopped.
    pub fn set_target(&self, target: Arc<dyn WriteTarget>) {
        let mut shared = self.shared.lock().unwrap();
        let dropped = shared.queue.len();
        if dropped > 0 {
            warn!("discarding {dropped} queued writes on characteristic change");
        }
        shared.queue.clear();
        stop_heartbeat(&mut shared);
        shared.target = Some(target);
    }

    pub fn has_target(&self) -> bool {
        self.shared.lock().unwrap().target.is_some()
    }

    /// Queue a payload for writing and return its completion receipt.
    pub fn enqueue(&self, payload: Vec<u8>, priority: Priority) -> WriteReceipt {
        enqueue_shared(&self.shared, payload, priority)
    }

    /// Queue a payload and wait for its outcome.
    pub async fn write(&self, payload: Vec<u8>, priority: Priority) -> bool {
        self.enqueue(payload, priority).wait().await
    }

    /// Arm (or with `None`, disarm) the recurring heartbeat, which enqueues
    /// `payload` at high priority every `interval`.
    pub fn set_heartbeat(&self, payload: Option<Vec<u8>>, interval: Duration) {
        let mut shared = self.shared.lock().unwrap();
        stop_heartbeat(&mut shared);
        let Some(payload) = payload else { return };

        let weak = Arc::downgrade(&self.shared);
        shared.heartbeat = Some(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                debug!("heartbeat: {}", hex::encode(&payload));
                // Outcome intentionally ignored; the next tick retries.
                drop(enqueue_shared(&shared, payload.clone(), Priority::High));
            }
        }));
        debug!("heartbeat armed at {interval:?}");
    }

    /// Drain the queue (resolving every pending receipt `false`), stop the
    /// heartbeat and unbind the characteristic. Called on disconnect; after
    /// this no timer fires and no queued task starts.
    pub fn dispose(&self) {
        let mut shared = self.shared.lock().unwrap();
        stop_heartbeat(&mut shared);
        let pending = shared.queue.len();
        for task in shared.queue.drain(..) {
            let _ = task.done.send(false);
        }
        if pending > 0 {
            debug!("disposed write queue with {pending} pending tasks");
        }
        shared.target = None;
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        stop_heartbeat(self);
    }
}

fn stop_heartbeat(shared: &mut Shared) {
    if let Some(handle) = shared.heartbeat.take() {
        handle.abort();
        debug!("heartbeat stopped");
    }
}

fn enqueue_shared(
    shared: &Arc<Mutex<Shared>>,
    payload: Vec<u8>,
    priority: Priority,
) -> WriteReceipt {
    let mut guard = shared.lock().unwrap();

    if guard.target.is_none() {
        warn!("write characteristic not set; dropping write");
        return WriteReceipt::resolved(false);
    }

    // Heartbeat dedup: when the head of the queue already holds this exact
    // payload, a high-priority duplicate would only flood the queue while
    // the link is briefly slow. It will be sent momentarily anyway, so the
    // duplicate resolves true without entering the queue.
    if priority == Priority::High {
        if let Some(head) = guard.queue.front() {
            if head.payload == payload {
                return WriteReceipt::resolved(true);
            }
        }
    }

    let (tx, rx) = oneshot::channel();
    let task = WriteTask { payload, priority, done: tx };
    if priority == Priority::High {
        // Behind any high tasks already queued, ahead of everything else.
        let at = guard
            .queue
            .iter()
            .take_while(|t| t.priority == Priority::High)
            .count();
        guard.queue.insert(at, task);
    } else {
        guard.queue.push_back(task);
    }
    debug!("enqueued {priority:?} write ({} queued)", guard.queue.len());

    if !guard.worker_running {
        guard.worker_running = true;
        let shared = Arc::clone(shared);
        tokio::spawn(drain(shared));
    }

    WriteReceipt(rx)
}

/// The single in-flight worker: dequeue, write with timeout, resolve the
/// receipt, wait the inter-write gap, repeat until the queue is empty.
async fn drain(shared: Arc<Mutex<Shared>>) {
    loop {
        let (task, target) = {
            let mut guard = shared.lock().unwrap();
            let Some(task) = guard.queue.pop_front() else {
                guard.worker_running = false;
                return;
            };
            match &guard.target {
                Some(target) => (task, Arc::clone(target)),
                None => {
                    // Disposed between iterations with a task racing in.
                    let _ = task.done.send(false);
                    guard.worker_running = false;
                    return;
                }
            }
        };

        let result = tokio::time::timeout(WRITE_TIMEOUT, target.write(&task.payload)).await;
        let success = match result {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!("write failed ({}): {err}", hex::encode(&task.payload));
                false
            }
            Err(_) => {
                warn!("write timed out ({})", hex::encode(&task.payload));
                false
            }
        };
        // A failed write resolves its own task only; later tasks proceed.
        let _ = task.done.send(success);

        tokio::time::sleep(WRITE_GAP).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    /// Write target that records payloads, optionally failing or hanging.
    #[derive(Default)]
    struct Recorder {
        written: StdMutex<Vec<Vec<u8>>>,
        fail: bool,
        hang: bool,
    }

    #[async_trait]
    impl WriteTarget for Recorder {
        async fn write(&self, payload: &[u8]) -> crate::error::Result<()> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.written.lock().unwrap().push(payload.to_vec());
            if self.fail {
                return Err(Error::WriteFailed("simulated".into()));
            }
            Ok(())
        }
    }

    fn queue_with(target: Arc<Recorder>) -> WriteQueue {
        let queue = WriteQueue::new();
        queue.set_target(target);
        queue
    }

    #[tokio::test(start_paused = true)]
    async fn writes_resolve_true_in_order() {
        let target = Arc::new(Recorder::default());
        let queue = queue_with(target.clone());
        let a = queue.enqueue(b"a".to_vec(), Priority::Normal);
        let b = queue.enqueue(b"b".to_vec(), Priority::Normal);
        assert!(a.wait().await);
        assert!(b.wait().await);
        assert_eq!(*target.written.lock().unwrap(), vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn high_priority_preempts_queued_normals() {
        let target = Arc::new(Recorder::default());
        let queue = queue_with(target.clone());
        let n1 = queue.enqueue(b"n1".to_vec(), Priority::Normal);
        let n2 = queue.enqueue(b"n2".to_vec(), Priority::Normal);
        let h1 = queue.enqueue(b"h1".to_vec(), Priority::High);
        let h2 = queue.enqueue(b"h2".to_vec(), Priority::High);
        for receipt in [n1, n2, h1, h2] {
            assert!(receipt.wait().await);
        }
        // n1 may start before the highs arrive; every high must start
        // before n2, and highs stay FIFO among themselves.
        let written = target.written.lock().unwrap().clone();
        let pos = |p: &[u8]| written.iter().position(|w| w == p).unwrap();
        assert!(pos(b"h1") < pos(b"h2"));
        assert!(pos(b"h2") < pos(b"n2"));
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_high_payload_at_head_is_deduped() {
        let target = Arc::new(Recorder::default());
        let queue = queue_with(target.clone());
        let first = queue.enqueue(b"re".to_vec(), Priority::High);
        let dup = queue.enqueue(b"re".to_vec(), Priority::High);
        // The duplicate resolves immediately without a second write.
        assert!(dup.wait().await);
        assert!(first.wait().await);
        assert_eq!(target.written.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_resolves_false_without_blocking_queue() {
        let target = Arc::new(Recorder { fail: true, ..Recorder::default() });
        let queue = queue_with(target.clone());
        let a = queue.enqueue(b"a".to_vec(), Priority::Normal);
        let b = queue.enqueue(b"b".to_vec(), Priority::Normal);
        assert!(!a.wait().await);
        assert!(!b.wait().await);
        assert_eq!(target.written.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_write_times_out_false() {
        let target = Arc::new(Recorder { hang: true, ..Recorder::default() });
        let queue = queue_with(target);
        let receipt = queue.enqueue(b"a".to_vec(), Priority::Normal);
        assert!(!receipt.wait().await);
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_without_target_resolves_false() {
        let queue = WriteQueue::new();
        assert!(!queue.enqueue(b"a".to_vec(), Priority::Normal).wait().await);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_drains_all_pending_tasks_false() {
        let target = Arc::new(Recorder { hang: true, ..Recorder::default() });
        let queue = queue_with(target);
        let receipts: Vec<_> = (0..3)
            .map(|i| queue.enqueue(vec![i], Priority::Normal))
            .collect();
        queue.dispose();
        for receipt in receipts {
            assert!(!receipt.wait().await);
        }
        assert!(!queue.has_target());
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_enqueues_periodically() {
        let target = Arc::new(Recorder::default());
        let queue = queue_with(target.clone());
        queue.set_heartbeat(Some(b"re".to_vec()), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(5200)).await;
        assert_eq!(target.written.lock().unwrap().len(), 1);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(target.written.lock().unwrap().len(), 2);
        queue.set_heartbeat(None, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(target.written.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_before_first_tick_silences_heartbeat() {
        let target = Arc::new(Recorder::default());
        let queue = queue_with(target.clone());
        queue.set_heartbeat(Some(b"re".to_vec()), Duration::from_secs(5));
        queue.dispose();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(target.written.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn changing_target_discards_queued_tasks() {
        let target = Arc::new(Recorder { hang: true, ..Recorder::default() });
        let queue = queue_with(target);
        let stale = queue.enqueue(b"a".to_vec(), Priority::Normal);
        let fresh_target = Arc::new(Recorder::default());
        queue.set_target(fresh_target.clone());
        assert!(!stale.wait().await);
        assert!(queue.enqueue(b"b".to_vec(), Priority::Normal).wait().await);
        assert_eq!(*fresh_target.written.lock().unwrap(), vec![b"b".to_vec()]);
    }
}
