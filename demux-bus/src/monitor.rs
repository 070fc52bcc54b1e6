use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::{
    deferred::Deferred,
    error::{PipelineError, Result, SinkConnectionError},
    queue::QueuingStrategy,
};

/// Anything a [`MonitorSink`] can be connected to.
#[async_trait]
pub trait WriteTarget<I: Send + 'static>: Send + Sync {
    async fn write(&self, chunk: I) -> Result<()>;

    async fn close(&self) -> Result<()>;

    async fn abort(&self, reason: PipelineError) -> Result<()>;

    /// Resolves when the target has finished, with its failure if any.
    async fn closed(&self) -> Result<()>;

    fn failure(&self) -> Option<PipelineError>;
}

/// Writable endpoint that binds to its destination after construction.
///
/// Calls made before [`MonitorSink::connect`] wait for the destination. After
/// that every call is forwarded as is: writes are not buffered here, the
/// writable strategy only limits how many may be in flight at once.
pub struct MonitorSink<I> {
    destination: Arc<Deferred<Arc<dyn WriteTarget<I>>>>,
    strategy: QueuingStrategy<I>,
    permits: Arc<Semaphore>,
}

impl<I> Clone for MonitorSink<I> {
    fn clone(&self) -> Self {
        Self {
            destination: Arc::clone(&self.destination),
            strategy: self.strategy.clone(),
            permits: Arc::clone(&self.permits),
        }
    }
}

impl<I: Send + 'static> MonitorSink<I> {
    pub fn new(strategy: QueuingStrategy<I>) -> Self {
        let permits = Arc::new(Semaphore::new(strategy.high_water_mark()));
        Self {
            destination: Arc::new(Deferred::new()),
            strategy,
            permits,
        }
    }

    pub fn connect(
        &self,
        destination: Arc<dyn WriteTarget<I>>,
    ) -> std::result::Result<(), SinkConnectionError> {
        if self.destination.set(destination) {
            Ok(())
        } else {
            Err(SinkConnectionError::AlreadyConnected)
        }
    }

    /// Write slots still free; `None` once the destination has failed.
    pub fn desired_size(&self) -> Option<isize> {
        if self.failure().is_some() {
            return None;
        }
        Some(self.permits.available_permits() as isize)
    }

    pub async fn write(&self, chunk: I) -> Result<()> {
        let destination = self.destination.wait().await;
        if let Some(e) = destination.failure() {
            return Err(e);
        }
        let weight = self.strategy.size_of(&chunk).min(self.strategy.high_water_mark());
        let weight = u32::try_from(weight).unwrap_or(u32::MAX);
        let _permit = self
            .permits
            .acquire_many(weight)
            .await
            .map_err(|_| PipelineError::Closed)?;
        destination.write(chunk).await
    }

    pub async fn close(&self) -> Result<()> {
        self.destination.wait().await.close().await
    }

    pub async fn abort(&self, reason: PipelineError) -> Result<()> {
        self.destination.wait().await.abort(reason).await
    }

    /// Resolves once the destination finishes; its failure is this sink's.
    pub async fn closed(&self) -> Result<()> {
        self.destination.wait().await.closed().await
    }

    pub fn failure(&self) -> Option<PipelineError> {
        self.destination.get().and_then(|d| d.failure())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::{MonitorSink, WriteTarget};
    use crate::{
        error::{PipelineError, Result, SinkConnectionError},
        queue::QueuingStrategy,
    };

    #[derive(Default)]
    struct Recorder {
        written: Mutex<Vec<u32>>,
        failure: Mutex<Option<PipelineError>>,
    }

    #[async_trait]
    impl WriteTarget<u32> for Recorder {
        async fn write(&self, chunk: u32) -> Result<()> {
            if let Some(e) = self.failure.lock().clone() {
                return Err(e);
            }
            self.written.lock().push(chunk);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }

        async fn abort(&self, reason: PipelineError) -> Result<()> {
            *self.failure.lock() = Some(reason);
            Ok(())
        }

        async fn closed(&self) -> Result<()> {
            match self.failure.lock().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        fn failure(&self) -> Option<PipelineError> {
            self.failure.lock().clone()
        }
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let sink = MonitorSink::new(QueuingStrategy::<u32>::count(1));
        sink.connect(Arc::new(Recorder::default())).unwrap();
        assert_eq!(
            sink.connect(Arc::new(Recorder::default())),
            Err(SinkConnectionError::AlreadyConnected)
        );
    }

    #[tokio::test]
    async fn test_write_waits_for_destination() -> anyhow::Result<()> {
        let sink = MonitorSink::new(QueuingStrategy::<u32>::count(1));
        let pending = {
            let sink = sink.clone();
            tokio::spawn(async move { sink.write(5).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pending.is_finished());

        let recorder = Arc::new(Recorder::default());
        sink.connect(recorder.clone())?;
        pending.await??;
        assert_eq!(*recorder.written.lock(), vec![5]);
        Ok(())
    }

    #[tokio::test]
    async fn test_destination_failure_is_reported() -> anyhow::Result<()> {
        let sink = MonitorSink::new(QueuingStrategy::<u32>::count(1));
        let recorder = Arc::new(Recorder::default());
        sink.connect(recorder.clone())?;
        sink.write(1).await?;

        *recorder.failure.lock() = Some(PipelineError::aborted("downstream gone"));
        assert_eq!(sink.failure(), Some(PipelineError::aborted("downstream gone")));
        assert_eq!(sink.desired_size(), None);
        assert_eq!(sink.write(2).await, Err(PipelineError::aborted("downstream gone")));
        assert_eq!(sink.closed().await, Err(PipelineError::aborted("downstream gone")));
        assert_eq!(*recorder.written.lock(), vec![1]);
        Ok(())
    }

    #[tokio::test]
    async fn test_unbounded_high_water_mark() -> anyhow::Result<()> {
        let sink = MonitorSink::new(QueuingStrategy::<u32>::new(usize::MAX, |_| usize::MAX));
        assert_eq!(sink.desired_size(), Some(tokio::sync::Semaphore::MAX_PERMITS as isize));

        let recorder = Arc::new(Recorder::default());
        sink.connect(recorder.clone())?;
        sink.write(7).await?;
        sink.write(8).await?;
        assert_eq!(*recorder.written.lock(), vec![7, 8]);
        Ok(())
    }
}
