use futures::{Stream, StreamExt};

use crate::{
    error::{PipelineError, Result},
    monitor::MonitorSink,
};

/// Drains `source` into `destination`.
///
/// A rejected write ends the pipe with that error (the caller decides what
/// happens to the source); a source error aborts `destination`; the end of
/// `source` closes it.
pub async fn pipe<S, I, E>(mut source: S, destination: &MonitorSink<I>) -> Result<()>
where
    S: Stream<Item = std::result::Result<I, E>> + Unpin,
    I: Send + 'static,
    E: Into<PipelineError>,
{
    while let Some(item) = source.next().await {
        match item {
            Ok(chunk) => destination.write(chunk).await?,
            Err(e) => {
                let reason = e.into();
                log::debug!("pipe source failed: {}", reason);
                destination.abort(reason.clone()).await?;
                return Err(reason);
            }
        }
    }
    destination.close().await
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::stream;

    use super::pipe;
    use crate::{
        duplex::ShutdownAwareStream,
        error::PipelineError,
        test_support::Passthrough,
    };

    #[tokio::test]
    async fn test_source_error_aborts_destination() {
        let stream = ShutdownAwareStream::new(Passthrough::default());
        let (writable, mut readable) = stream.into_parts();

        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Err(PipelineError::Input("broken upload".into())),
        ]);
        let res = tokio::spawn(async move { pipe(source, &writable).await });

        // chunks still queued when the abort lands are discarded
        let mut last = None;
        while let Some(item) = readable.read().await {
            last = Some(item);
        }
        assert_eq!(last, Some(Err(PipelineError::Input("broken upload".into()))));
        assert_eq!(
            res.await.unwrap(),
            Err(PipelineError::Input("broken upload".into()))
        );
    }
}
