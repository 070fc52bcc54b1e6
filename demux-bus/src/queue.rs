use std::{collections::VecDeque, fmt, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::error::{PipelineError, Result};

/// Size accounting used for backpressure on one side of a stream.
///
/// A producer may push while the queued total is below `high_water_mark`.
pub struct QueuingStrategy<T> {
    high_water_mark: usize,
    size: Arc<dyn Fn(&T) -> usize + Send + Sync>,
}

impl<T> QueuingStrategy<T> {
    /// `high_water_mark` is clamped to at least 1, otherwise no producer
    /// could ever make progress, and to at most [`Semaphore::MAX_PERMITS`].
    pub fn new(high_water_mark: usize, size: impl Fn(&T) -> usize + Send + Sync + 'static) -> Self {
        Self {
            high_water_mark: high_water_mark.clamp(1, Semaphore::MAX_PERMITS),
            size: Arc::new(size),
        }
    }

    /// Every chunk counts as one.
    pub fn count(high_water_mark: usize) -> Self {
        Self::new(high_water_mark, |_| 1)
    }

    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    pub fn size_of(&self, chunk: &T) -> usize {
        (self.size)(chunk)
    }
}

impl<T: AsRef<[u8]>> QueuingStrategy<T> {
    /// Chunks are accounted by their byte length.
    pub fn byte_length(high_water_mark: usize) -> Self {
        Self::new(high_water_mark, |chunk: &T| chunk.as_ref().len())
    }
}

impl<T> Clone for QueuingStrategy<T> {
    fn clone(&self) -> Self {
        Self {
            high_water_mark: self.high_water_mark,
            size: Arc::clone(&self.size),
        }
    }
}

impl<T> Default for QueuingStrategy<T> {
    fn default() -> Self {
        Self::count(1)
    }
}

impl<T> fmt::Debug for QueuingStrategy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuingStrategy")
            .field("high_water_mark", &self.high_water_mark)
            .finish_non_exhaustive()
    }
}

enum QueueStatus {
    Open,
    Closed,
    Errored { reason: PipelineError, reported: bool },
}

struct QueueState<T> {
    items: VecDeque<(T, usize)>,
    total: usize,
    status: QueueStatus,
}

/// The readable side's chunk queue.
///
/// `enqueue` never blocks; producers that respect backpressure wait on
/// [`ChunkQueue::ready`] first (or use [`ChunkQueue::send`]).
pub(crate) struct ChunkQueue<T> {
    state: Mutex<QueueState<T>>,
    readable: Notify,
    writable: Notify,
    strategy: QueuingStrategy<T>,
}

impl<T> ChunkQueue<T> {
    pub fn new(strategy: QueuingStrategy<T>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                total: 0,
                status: QueueStatus::Open,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            strategy,
        }
    }

    /// `None` once errored, `Some(0)` once closed.
    pub fn desired_size(&self) -> Option<isize> {
        let state = self.state.lock();
        match state.status {
            QueueStatus::Open => {
                Some(self.strategy.high_water_mark() as isize - state.total as isize)
            }
            QueueStatus::Closed => Some(0),
            QueueStatus::Errored { .. } => None,
        }
    }

    pub fn enqueue(&self, chunk: T) -> Result<()> {
        let size = self.strategy.size_of(&chunk);
        {
            let mut state = self.state.lock();
            match &state.status {
                QueueStatus::Open => {}
                QueueStatus::Closed => return Err(PipelineError::Closed),
                QueueStatus::Errored { reason, .. } => return Err(reason.clone()),
            }
            state.items.push_back((chunk, size));
            state.total += size;
        }
        self.readable.notify_waiters();
        Ok(())
    }

    /// Waits until the queue wants more data.
    pub async fn ready(&self) -> Result<()> {
        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                match &state.status {
                    QueueStatus::Open if state.total < self.strategy.high_water_mark() => {
                        return Ok(());
                    }
                    QueueStatus::Open => {}
                    QueueStatus::Closed => return Err(PipelineError::Closed),
                    QueueStatus::Errored { reason, .. } => return Err(reason.clone()),
                }
            }
            notified.await;
        }
    }

    pub async fn send(&self, chunk: T) -> Result<()> {
        self.ready().await?;
        self.enqueue(chunk)
    }

    /// Next chunk, `None` at the end. An error is reported once, after which
    /// the queue reads as ended.
    pub async fn read(&self) -> Option<Result<T>> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if let Some((chunk, size)) = state.items.pop_front() {
                    state.total -= size;
                    drop(state);
                    self.writable.notify_waiters();
                    return Some(Ok(chunk));
                }
                match &mut state.status {
                    QueueStatus::Open => {}
                    QueueStatus::Closed => return None,
                    QueueStatus::Errored { reported: true, .. } => return None,
                    QueueStatus::Errored { reason, reported } => {
                        *reported = true;
                        return Some(Err(reason.clone()));
                    }
                }
            }
            notified.await;
        }
    }

    /// Marks end of data; queued chunks stay readable.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if let QueueStatus::Open = state.status {
                state.status = QueueStatus::Closed;
            }
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// Errors the queue, discarding anything not yet read. No-op once the
    /// queue is closed or errored.
    pub fn error(&self, reason: PipelineError) {
        {
            let mut state = self.state.lock();
            if let QueueStatus::Open = state.status {
                state.items.clear();
                state.total = 0;
                state.status = QueueStatus::Errored {
                    reason,
                    reported: false,
                };
            }
        }
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    /// True when a reader has nothing more to observe.
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        match state.status {
            QueueStatus::Open => false,
            QueueStatus::Closed => state.items.is_empty(),
            QueueStatus::Errored { reported, .. } => reported,
        }
    }
}
