use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;

use foreman_common::ids::{ConversationId, TaskId};
use foreman_common::types::{TaskKind, TaskPriority};

/// A task parked for later dispatch.
#[derive(Clone, Debug)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub task_type: TaskKind,
    pub description: String,
    pub context: Option<String>,
    pub priority: TaskPriority,
    /// When set, the task waits for this specific worker to come free.
    pub bound_worker: Option<String>,
    pub conversation_id: Option<ConversationId>,
    pub attempt: u32,
}

/// Bounded priority queue shared between the router and the drain loop.
///
/// Higher priority (lower value) drains first; FIFO within equal priority.
/// `dequeue` suspends until an entry arrives or the deadline passes;
/// `enqueue` wakes one waiter. Enqueue beyond capacity is a hard failure
/// returned to the caller.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

struct QueueInner {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    cancelled: HashSet<TaskId>,
    seq: u64,
}

struct HeapEntry {
    priority: TaskPriority,
    seq: u64,
    enqueued_at: Instant,
    task: QueuedTask,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is full ({0} entries)")]
    Full(usize),
}

impl From<QueueError> for foreman_common::ForemanError {
    fn from(_: QueueError) -> Self {
        foreman_common::ForemanError::QueueFull
    }
}

/// Queue observability snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
    pub by_priority: Vec<(TaskPriority, usize)>,
    pub oldest_age_seconds: u64,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                cancelled: HashSet::new(),
                seq: 0,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    pub fn enqueue(&self, task: QueuedTask) -> Result<(), QueueError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.heap.len() >= self.capacity {
                metrics::counter!("queue.rejected").increment(1);
                return Err(QueueError::Full(inner.heap.len()));
            }

            let seq = inner.seq;
            inner.seq += 1;
            inner.heap.push(Reverse(HeapEntry {
                priority: task.priority,
                seq,
                enqueued_at: Instant::now(),
                task,
            }));
            metrics::gauge!("queue.depth").set(inner.heap.len() as f64);
        }

        self.notify.notify_one();
        Ok(())
    }

    /// Pop the highest-priority live entry, waiting up to `deadline`.
    /// Cancelled entries are discarded as they surface.
    pub async fn dequeue(&self, deadline: Duration) -> Option<QueuedTask> {
        let start = Instant::now();

        loop {
            if let Some(task) = self.try_pop() {
                return Some(task);
            }

            let remaining = deadline.checked_sub(start.elapsed())?;
            if tokio::time::timeout(remaining, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_pop();
            }
        }
    }

    fn try_pop(&self) -> Option<QueuedTask> {
        let mut inner = self.inner.lock().unwrap();
        while let Some(Reverse(entry)) = inner.heap.pop() {
            if inner.cancelled.remove(&entry.task.task_id) {
                tracing::debug!(task_id = %entry.task.task_id, "Dropping cancelled queue entry");
                continue;
            }
            metrics::gauge!("queue.depth").set(inner.heap.len() as f64);
            return Some(entry.task);
        }
        None
    }

    /// Mark a queued task cancelled; it is dropped instead of dispatched.
    /// Returns false when the id is already tombstoned.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.cancelled.insert(task_id)
    }

    /// Wake one waiting drain loop. Called when a worker turns idle so
    /// parked work is picked up immediately.
    pub fn nudge(&self) {
        self.notify.notify_one();
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        let mut by_priority: Vec<(TaskPriority, usize)> = Vec::new();
        for p in [
            TaskPriority::Critical,
            TaskPriority::High,
            TaskPriority::Normal,
            TaskPriority::Low,
        ] {
            let count = inner.heap.iter().filter(|Reverse(e)| e.priority == p).count();
            by_priority.push((p, count));
        }
        let oldest_age_seconds = inner
            .heap
            .iter()
            .map(|Reverse(e)| e.enqueued_at.elapsed().as_secs())
            .max()
            .unwrap_or(0);

        QueueStats {
            depth: inner.heap.len(),
            capacity: self.capacity,
            by_priority,
            oldest_age_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: i64, priority: TaskPriority) -> QueuedTask {
        QueuedTask {
            task_id: TaskId(id),
            task_type: TaskKind::General,
            description: format!("task {}", id),
            context: None,
            priority,
            bound_worker: None,
            conversation_id: None,
            attempt: 0,
        }
    }

    #[tokio::test]
    async fn test_priority_order_then_fifo() {
        let queue = TaskQueue::new(10);
        queue.enqueue(task(1, TaskPriority::Normal)).unwrap();
        queue.enqueue(task(2, TaskPriority::Critical)).unwrap();
        queue.enqueue(task(3, TaskPriority::Normal)).unwrap();
        queue.enqueue(task(4, TaskPriority::High)).unwrap();

        let order: Vec<i64> = [
            queue.dequeue(Duration::from_millis(10)).await.unwrap(),
            queue.dequeue(Duration::from_millis(10)).await.unwrap(),
            queue.dequeue(Duration::from_millis(10)).await.unwrap(),
            queue.dequeue(Duration::from_millis(10)).await.unwrap(),
        ]
        .iter()
        .map(|t| t.task_id.0)
        .collect();

        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[tokio::test]
    async fn test_capacity_is_a_hard_failure() {
        let queue = TaskQueue::new(2);
        queue.enqueue(task(1, TaskPriority::Normal)).unwrap();
        queue.enqueue(task(2, TaskPriority::Normal)).unwrap();
        assert!(matches!(
            queue.enqueue(task(3, TaskPriority::Normal)),
            Err(QueueError::Full(2))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_task_is_never_dequeued() {
        let queue = TaskQueue::new(10);
        queue.enqueue(task(1, TaskPriority::Normal)).unwrap();
        queue.enqueue(task(2, TaskPriority::Normal)).unwrap();
        assert!(queue.cancel(TaskId(1)));

        let next = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(next.task_id, TaskId(2));
        assert!(queue.dequeue(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_times_out_empty() {
        let queue = TaskQueue::new(10);
        let start = Instant::now();
        assert!(queue.dequeue(Duration::from_millis(20)).await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiter() {
        let queue = std::sync::Arc::new(TaskQueue::new(10));
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(task(7, TaskPriority::Low)).unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.task_id, TaskId(7));
    }

    #[tokio::test]
    async fn test_stats_counts_by_priority() {
        let queue = TaskQueue::new(10);
        queue.enqueue(task(1, TaskPriority::Critical)).unwrap();
        queue.enqueue(task(2, TaskPriority::Normal)).unwrap();
        queue.enqueue(task(3, TaskPriority::Normal)).unwrap();

        let stats = queue.stats();
        assert_eq!(stats.depth, 3);
        assert_eq!(stats.by_priority[0], (TaskPriority::Critical, 1));
        assert_eq!(stats.by_priority[2], (TaskPriority::Normal, 2));
    }
}
