use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    error::{PipelineError, Result, SinkConnectionError},
    monitor::WriteTarget,
    queue::ChunkQueue,
    signal::AbortSignal,
};

/// Why a stage is shutting down, handed to [`Transformer::close`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    EndOfInput,
    Error(PipelineError),
}

/// The processing logic of one duplex stream.
///
/// Hooks run on the stage's own task, one at a time. `close` is called exactly
/// once per stage: after a successful `flush`, or once the stage has failed.
#[async_trait]
pub trait Transformer<I, O>: Send + 'static
where
    I: Send + 'static,
    O: Send + 'static,
{
    async fn start(&mut self, _controller: &TransformController<O>) -> Result<()> {
        Ok(())
    }

    async fn transform(&mut self, chunk: I, controller: &TransformController<O>) -> Result<()>;

    async fn flush(&mut self, _controller: &TransformController<O>) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self, _reason: &ShutdownReason) {}
}

/// Capability handed to transformer hooks: the readable queue plus the
/// stage's abort signal.
pub struct TransformController<O> {
    queue: Arc<ChunkQueue<O>>,
    signal: AbortSignal,
}

impl<O> Clone for TransformController<O> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            signal: self.signal.clone(),
        }
    }
}

impl<O: Send + 'static> TransformController<O> {
    pub(crate) fn new(queue: Arc<ChunkQueue<O>>, signal: AbortSignal) -> Self {
        Self { queue, signal }
    }

    pub fn signal(&self) -> &AbortSignal {
        &self.signal
    }

    /// Room left on the readable side; `None` once it has errored.
    pub fn desired_size(&self) -> Option<isize> {
        self.queue.desired_size()
    }

    /// Pushes without waiting for room.
    pub fn enqueue(&self, chunk: O) -> Result<()> {
        self.queue.enqueue(chunk)
    }

    pub async fn ready(&self) -> Result<()> {
        tokio::select! {
            biased;
            reason = self.signal.aborted() => Err(reason),
            res = self.queue.ready() => res,
        }
    }

    /// Waits for room on the readable side, then pushes.
    pub async fn send(&self, chunk: O) -> Result<()> {
        tokio::select! {
            biased;
            reason = self.signal.aborted() => Err(reason),
            res = self.queue.send(chunk) => res,
        }
    }

    /// [`TransformController::send`] for callers on a blocking thread.
    pub fn blocking_send(&self, chunk: O) -> Result<()> {
        futures::executor::block_on(self.send(chunk))
    }

    /// Errors the readable side and fires the abort signal.
    pub fn error(&self, reason: PipelineError) {
        self.queue.error(reason.clone());
        self.signal.abort(reason);
    }

    /// Ends the readable side cleanly and rejects any further input.
    pub fn terminate(&self) {
        self.queue.close();
        self.signal.abort(PipelineError::aborted("stream terminated"));
    }

    pub(crate) fn close_queue(&self) {
        self.queue.close();
    }
}

/// Guards the close hook; only the first `fire` wins.
#[derive(Debug)]
pub(crate) struct ShutdownLatch {
    armed: Mutex<Option<()>>,
}

impl ShutdownLatch {
    pub fn armed() -> Self {
        Self {
            armed: Mutex::new(Some(())),
        }
    }

    pub fn fire(&self) -> bool {
        self.armed.lock().take().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StageState {
    Running,
    Closed,
    Errored(PipelineError),
}

enum StageCommand<I> {
    Write {
        chunk: I,
        result: oneshot::Sender<Result<()>>,
    },
    Close {
        result: oneshot::Sender<Result<()>>,
    },
    Abort {
        reason: PipelineError,
        result: oneshot::Sender<Result<()>>,
    },
}

enum Reply {
    Reject(oneshot::Sender<Result<()>>),
    Acknowledge(oneshot::Sender<Result<()>>),
}

enum Exit {
    Closed(oneshot::Sender<Result<()>>),
    Failed(PipelineError, Option<Reply>),
}

/// Spawns the task that owns `transformer` and returns its writer.
pub(crate) fn spawn_stage<I, O, T>(transformer: T, controller: TransformController<O>) -> StageWriter<I>
where
    I: Send + 'static,
    O: Send + 'static,
    T: Transformer<I, O>,
{
    let (tx, rx) = mpsc::channel(1);
    let (state_tx, state_rx) = watch::channel(StageState::Running);
    tokio::spawn(run_stage(transformer, controller, rx, state_tx));
    StageWriter { tx, state: state_rx }
}

async fn run_stage<I, O, T>(
    mut transformer: T,
    controller: TransformController<O>,
    mut rx: mpsc::Receiver<StageCommand<I>>,
    state: watch::Sender<StageState>,
) where
    I: Send + 'static,
    O: Send + 'static,
    T: Transformer<I, O>,
{
    let signal = controller.signal().clone();
    let latch = ShutdownLatch::armed();

    let started = tokio::select! {
        biased;
        reason = signal.aborted() => Err(reason),
        res = transformer.start(&controller) => res,
    };
    let exit = match started {
        Ok(()) => command_loop(&mut transformer, &controller, &mut rx).await,
        Err(e) => Exit::Failed(e, None),
    };

    match exit {
        Exit::Closed(result) => {
            controller.close_queue();
            if latch.fire() {
                transformer.close(&ShutdownReason::EndOfInput).await;
            }
            state.send_replace(StageState::Closed);
            let _ = result.send(Ok(()));
        }
        Exit::Failed(e, reply) => {
            controller.error(e.clone());
            let reason = signal.reason().unwrap_or(e);
            log::debug!("stage shutting down: {}", reason);
            if latch.fire() {
                transformer.close(&ShutdownReason::Error(reason.clone())).await;
            }
            state.send_replace(StageState::Errored(reason.clone()));
            match reply {
                Some(Reply::Reject(result)) => {
                    let _ = result.send(Err(reason));
                }
                Some(Reply::Acknowledge(result)) => {
                    let _ = result.send(Ok(()));
                }
                None => {}
            }
        }
    }
    // queued commands are answered from the final state once `rx` drops
    rx.close();
}

async fn command_loop<I, O, T>(
    transformer: &mut T,
    controller: &TransformController<O>,
    rx: &mut mpsc::Receiver<StageCommand<I>>,
) -> Exit
where
    I: Send + 'static,
    O: Send + 'static,
    T: Transformer<I, O>,
{
    let signal = controller.signal().clone();
    loop {
        let cmd = tokio::select! {
            biased;
            reason = signal.aborted() => return Exit::Failed(reason, None),
            cmd = rx.recv() => cmd,
        };
        match cmd {
            None => {
                return Exit::Failed(PipelineError::aborted("writable side dropped"), None);
            }
            Some(StageCommand::Write { chunk, result }) => {
                let outcome = tokio::select! {
                    biased;
                    reason = signal.aborted() => Err(reason),
                    res = async {
                        controller.ready().await?;
                        transformer.transform(chunk, controller).await
                    } => res,
                };
                match outcome {
                    Ok(()) => {
                        let _ = result.send(Ok(()));
                    }
                    Err(e) => return Exit::Failed(e, Some(Reply::Reject(result))),
                }
            }
            Some(StageCommand::Close { result }) => {
                let outcome = tokio::select! {
                    biased;
                    reason = signal.aborted() => Err(reason),
                    res = transformer.flush(controller) => res,
                };
                return match outcome {
                    Ok(()) => Exit::Closed(result),
                    Err(e) => Exit::Failed(e, Some(Reply::Reject(result))),
                };
            }
            Some(StageCommand::Abort { reason, result }) => {
                return Exit::Failed(reason, Some(Reply::Acknowledge(result)));
            }
        }
    }
}

/// Resolves once a stage has left [`StageState::Running`].
pub(crate) async fn terminal(mut state: watch::Receiver<StageState>) -> Result<()> {
    let waited = state
        .wait_for(|s| *s != StageState::Running)
        .await
        .map(|s| s.clone());
    let last = match waited {
        Ok(s) => s,
        Err(_) => state.borrow().clone(),
    };
    match last {
        StageState::Errored(e) => Err(e),
        StageState::Closed => Ok(()),
        StageState::Running => Err(SinkConnectionError::NotConnected.into()),
    }
}

/// Writable handle onto a running stage.
pub(crate) struct StageWriter<I> {
    tx: mpsc::Sender<StageCommand<I>>,
    state: watch::Receiver<StageState>,
}

impl<I> Clone for StageWriter<I> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            state: self.state.clone(),
        }
    }
}

impl<I: Send + 'static> StageWriter<I> {
    pub fn state(&self) -> watch::Receiver<StageState> {
        self.state.clone()
    }

    fn terminal_error(&self) -> PipelineError {
        match &*self.state.borrow() {
            StageState::Errored(e) => e.clone(),
            StageState::Closed => PipelineError::Closed,
            StageState::Running => SinkConnectionError::NotConnected.into(),
        }
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Result<()>>) -> StageCommand<I>,
    ) -> Result<()> {
        let (result, rx) = oneshot::channel();
        if self.tx.send(command(result)).await.is_err() {
            return Err(self.terminal_error());
        }
        match rx.await {
            Ok(res) => res,
            Err(_) => Err(self.terminal_error()),
        }
    }
}

#[async_trait]
impl<I: Send + 'static> WriteTarget<I> for StageWriter<I> {
    async fn write(&self, chunk: I) -> Result<()> {
        self.request(|result| StageCommand::Write { chunk, result })
            .await
    }

    async fn close(&self) -> Result<()> {
        let current = self.state.borrow().clone();
        match current {
            StageState::Closed => return Ok(()),
            StageState::Errored(e) => return Err(e),
            StageState::Running => {}
        }
        match self.request(|result| StageCommand::Close { result }).await {
            Err(PipelineError::Closed) => Ok(()),
            res => res,
        }
    }

    async fn abort(&self, reason: PipelineError) -> Result<()> {
        if *self.state.borrow() != StageState::Running {
            return Ok(());
        }
        // a stage that finished meanwhile has nothing left to abort
        let _ = self
            .request(|result| StageCommand::Abort { reason, result })
            .await;
        Ok(())
    }

    async fn closed(&self) -> Result<()> {
        terminal(self.state.clone()).await
    }

    fn failure(&self) -> Option<PipelineError> {
        match &*self.state.borrow() {
            StageState::Errored(e) => Some(e.clone()),
            _ => None,
        }
    }
}
