use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures::{Stream, StreamExt, stream::BoxStream};

use crate::{
    error::{PipelineError, Result},
    monitor::MonitorSink,
    pipe::pipe,
    queue::{ChunkQueue, QueuingStrategy},
    signal::AbortSignal,
    transform::{self, TransformController, Transformer},
};

/// The writable side of a [`ShutdownAwareStream`].
pub type WritableEnd<I> = MonitorSink<I>;

/// A duplex stream around a [`Transformer`] whose close hook runs exactly
/// once, whether the stream ends cleanly or fails anywhere.
///
/// Failures travel downstream through the readable end and the abort signal,
/// and upstream by rejecting writes on the writable end.
pub struct ShutdownAwareStream<I, O> {
    writable: WritableEnd<I>,
    readable: ReadableEnd<O>,
    signal: AbortSignal,
}

impl<I, O> ShutdownAwareStream<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new<T: Transformer<I, O>>(transformer: T) -> Self {
        Self::with_strategies(transformer, QueuingStrategy::default(), QueuingStrategy::default())
    }

    /// Must be called inside a tokio runtime: the stage runs on its own task.
    pub fn with_strategies<T: Transformer<I, O>>(
        transformer: T,
        writable_strategy: QueuingStrategy<I>,
        readable_strategy: QueuingStrategy<O>,
    ) -> Self {
        let signal = AbortSignal::new();
        let queue = Arc::new(ChunkQueue::new(readable_strategy));
        let controller = TransformController::new(queue.clone(), signal.clone());
        let stage = transform::spawn_stage(transformer, controller);

        let watched = stage.state();
        let watcher_signal = signal.clone();
        tokio::spawn(async move {
            if let Err(e) = transform::terminal(watched).await {
                watcher_signal.abort(e);
            }
        });

        let writable = MonitorSink::new(writable_strategy);
        if let Err(e) = writable.connect(Arc::new(stage)) {
            signal.abort(e.into());
        }

        Self {
            writable,
            readable: ReadableEnd::new(queue, signal.clone()),
            signal,
        }
    }

    pub fn writable(&self) -> &WritableEnd<I> {
        &self.writable
    }

    pub fn readable(&mut self) -> &mut ReadableEnd<O> {
        &mut self.readable
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.signal
    }

    pub fn into_parts(self) -> (WritableEnd<I>, ReadableEnd<O>) {
        (self.writable, self.readable)
    }
}

/// The readable side of a [`ShutdownAwareStream`].
///
/// Yields `Ok` chunks until the stream ends, or a single `Err` if it failed.
/// Dropping it before the end cancels the stream.
pub struct ReadableEnd<O> {
    queue: Arc<ChunkQueue<O>>,
    signal: AbortSignal,
    items: BoxStream<'static, Result<O>>,
}

impl<O: Send + 'static> ReadableEnd<O> {
    fn new(queue: Arc<ChunkQueue<O>>, signal: AbortSignal) -> Self {
        let items = futures::stream::unfold((queue.clone(), signal.clone()), |(queue, signal)| {
            async move {
                // nothing queued before an abort is delivered after it
                if let Some(reason) = signal.reason() {
                    queue.error(reason);
                }
                let item = queue.read().await?;
                Some((item, (queue, signal)))
            }
        })
        .boxed();
        Self {
            queue,
            signal,
            items,
        }
    }

    pub async fn read(&mut self) -> Option<Result<O>> {
        self.next().await
    }

    /// Room left before the producer has to wait.
    pub fn desired_size(&self) -> Option<isize> {
        self.queue.desired_size()
    }

    /// Discards anything queued and aborts the stream with `reason`.
    pub fn cancel(&self, reason: PipelineError) {
        self.queue.error(reason.clone());
        self.signal.abort(reason);
    }

    /// Forwards every chunk into `destination`, then closes it. A failure on
    /// either side is propagated to the other.
    pub async fn pipe_to(mut self, destination: &WritableEnd<O>) -> Result<()> {
        let res = pipe(&mut self, destination).await;
        if let Err(e) = &res {
            self.cancel(e.clone());
        }
        res
    }

    /// Pipes this end into `next` on a new task and returns `next`'s output.
    pub fn pipe_through<P: Send + 'static>(self, next: ShutdownAwareStream<O, P>) -> ReadableEnd<P> {
        let (writable, readable) = next.into_parts();
        tokio::spawn(async move {
            if let Err(e) = self.pipe_to(&writable).await {
                log::debug!("pipe ended with error: {}", e);
            }
        });
        readable
    }
}

impl<O> Stream for ReadableEnd<O> {
    type Item = Result<O>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.items.poll_next_unpin(cx)
    }
}

impl<O> Drop for ReadableEnd<O> {
    fn drop(&mut self) {
        if !self.queue.is_finished() {
            let reason = PipelineError::aborted("readable side dropped");
            self.queue.error(reason.clone());
            self.signal.abort(reason);
        }
    }
}

#[cfg(test)]
#[path = "duplex_test.rs"]
mod duplex_test;
