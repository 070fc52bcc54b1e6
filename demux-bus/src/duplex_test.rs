use std::time::Duration;

use bytes::Bytes;

use super::ShutdownAwareStream;
use crate::{
    error::PipelineError,
    queue::QueuingStrategy,
    test_support::{Passthrough, wait_until},
    transform::ShutdownReason,
};

fn chunk(s: &'static str) -> Bytes {
    Bytes::from_static(s.as_bytes())
}

#[tokio::test]
async fn test_passthrough_runs_close_hook_once() -> anyhow::Result<()> {
    let transformer = Passthrough::default();
    let hooks = transformer.hooks.clone();
    let (writable, mut readable) = ShutdownAwareStream::new(transformer).into_parts();

    let writer = tokio::spawn(async move {
        writable.write(chunk("a")).await?;
        writable.write(chunk("b")).await?;
        writable.close().await?;
        // both are no-ops once closed
        writable.close().await?;
        writable.abort(PipelineError::aborted("late")).await?;
        Ok::<_, PipelineError>(())
    });

    let mut out = Vec::new();
    while let Some(item) = readable.read().await {
        out.push(item?);
    }
    writer.await??;

    assert_eq!(out, vec![chunk("a"), chunk("b")]);
    assert_eq!(*hooks.lock(), vec![ShutdownReason::EndOfInput]);
    Ok(())
}

#[tokio::test]
async fn test_transform_error_rejects_writes() -> anyhow::Result<()> {
    let transformer = Passthrough {
        fail_on: Some(chunk("x")),
        ..Default::default()
    };
    let hooks = transformer.hooks.clone();
    let stream = ShutdownAwareStream::new(transformer);
    let (writable, mut readable) = stream.into_parts();

    let failure = PipelineError::transform("bad chunk");
    assert_eq!(writable.write(chunk("x")).await, Err(failure.clone()));
    assert_eq!(writable.write(chunk("y")).await, Err(failure.clone()));
    assert_eq!(writable.failure(), Some(failure.clone()));

    assert_eq!(readable.read().await, Some(Err(failure.clone())));
    assert_eq!(readable.read().await, None);
    assert_eq!(*hooks.lock(), vec![ShutdownReason::Error(failure)]);
    Ok(())
}

#[tokio::test]
async fn test_close_and_abort_after_consumer_failure() -> anyhow::Result<()> {
    let transformer = Passthrough::default();
    let hooks = transformer.hooks.clone();
    let (writable, readable) = ShutdownAwareStream::new(transformer).into_parts();

    let reason = PipelineError::aborted("consumer gone");
    readable.cancel(reason.clone());
    assert_eq!(writable.closed().await, Err(reason.clone()));

    assert_eq!(writable.write(chunk("a")).await, Err(reason.clone()));
    assert_eq!(writable.close().await, Err(reason.clone()));
    assert_eq!(writable.close().await, Err(reason.clone()));
    writable.abort(PipelineError::aborted("again")).await?;
    writable.abort(PipelineError::aborted("again")).await?;

    assert_eq!(*hooks.lock(), vec![ShutdownReason::Error(reason)]);
    Ok(())
}

#[tokio::test]
async fn test_dropping_readable_cancels_stream() -> anyhow::Result<()> {
    let transformer = Passthrough::default();
    let hooks = transformer.hooks.clone();
    let stream = ShutdownAwareStream::new(transformer);
    let signal = stream.abort_signal().clone();
    let (writable, readable) = stream.into_parts();

    drop(readable);
    let reason = PipelineError::aborted("readable side dropped");
    assert_eq!(writable.closed().await, Err(reason.clone()));
    assert!(signal.is_aborted());
    assert_eq!(*hooks.lock(), vec![ShutdownReason::Error(reason)]);
    Ok(())
}

#[tokio::test]
async fn test_backpressure_bounds_readable_queue() -> anyhow::Result<()> {
    let stream = ShutdownAwareStream::with_strategies(
        Passthrough::default(),
        QueuingStrategy::count(1),
        QueuingStrategy::count(2),
    );
    let (writable, mut readable) = stream.into_parts();

    let writer = tokio::spawn(async move {
        for i in 0..10u8 {
            writable.write(Bytes::from(vec![i])).await?;
        }
        writable.close().await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());
    assert_eq!(readable.desired_size(), Some(0));

    let mut count = 0;
    while let Some(item) = readable.read().await {
        assert_eq!(item?, Bytes::from(vec![count]));
        count += 1;
    }
    writer.await??;
    assert_eq!(count, 10);
    Ok(())
}

#[tokio::test]
async fn test_external_abort_fails_both_sides() -> anyhow::Result<()> {
    let transformer = Passthrough::default();
    let hooks = transformer.hooks.clone();
    let mut stream = ShutdownAwareStream::new(transformer);

    let reason = PipelineError::aborted("user cancelled");
    assert!(stream.abort_signal().abort(reason.clone()));
    assert!(!stream.abort_signal().abort(PipelineError::aborted("second")));

    assert_eq!(stream.readable().read().await, Some(Err(reason.clone())));
    assert_eq!(stream.writable().write(chunk("a")).await, Err(reason.clone()));
    assert!(wait_until(|| hooks.lock().len() == 1).await);
    assert_eq!(*hooks.lock(), vec![ShutdownReason::Error(reason)]);
    Ok(())
}

#[tokio::test]
async fn test_start_failure_surfaces_on_both_sides() -> anyhow::Result<()> {
    let transformer = Passthrough {
        fail_start: true,
        ..Default::default()
    };
    let hooks = transformer.hooks.clone();
    let (writable, mut readable) = ShutdownAwareStream::new(transformer).into_parts();

    let failure = PipelineError::transform("start refused");
    assert_eq!(readable.read().await, Some(Err(failure.clone())));
    assert_eq!(writable.write(chunk("a")).await, Err(failure.clone()));
    assert_eq!(*hooks.lock(), vec![ShutdownReason::Error(failure)]);
    Ok(())
}

#[tokio::test]
async fn test_terminate_ends_readable_and_rejects_input() -> anyhow::Result<()> {
    let transformer = Passthrough {
        terminate_on: Some(chunk("end")),
        ..Default::default()
    };
    let hooks = transformer.hooks.clone();
    let (writable, mut readable) = ShutdownAwareStream::new(transformer).into_parts();

    let writer = tokio::spawn(async move {
        writable.write(chunk("a")).await?;
        writable.write(chunk("end")).await?;
        writable.closed().await?;
        Ok::<_, PipelineError>(())
    });

    assert_eq!(readable.read().await, Some(Ok(chunk("a"))));
    assert_eq!(readable.read().await, None);

    let terminated = PipelineError::aborted("stream terminated");
    assert_eq!(writer.await?, Err(terminated.clone()));
    assert_eq!(*hooks.lock(), vec![ShutdownReason::Error(terminated)]);
    Ok(())
}

#[tokio::test]
async fn test_unbounded_strategies() -> anyhow::Result<()> {
    let (writable, mut readable) = ShutdownAwareStream::with_strategies(
        Passthrough::default(),
        QueuingStrategy::count(usize::MAX),
        QueuingStrategy::byte_length(usize::MAX),
    )
    .into_parts();

    for s in ["a", "bb", "ccc"] {
        writable.write(chunk(s)).await?;
    }
    writable.close().await?;

    let mut out = Vec::new();
    while let Some(item) = readable.read().await {
        out.push(item?);
    }
    assert_eq!(out, vec![chunk("a"), chunk("bb"), chunk("ccc")]);
    Ok(())
}
