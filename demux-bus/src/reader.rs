use std::io::{self, Read, Seek, SeekFrom};

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

/// Creates the bounded byte channel between async writers and an engine
/// reading on a blocking thread. Dropping the sender ends the input.
pub fn byte_channel(capacity: usize) -> (mpsc::Sender<Bytes>, ByteReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        tx,
        ByteReader {
            rx,
            front: Bytes::new(),
            position: 0,
            eof: false,
        },
    )
}

/// Blocking [`Read`] over the chunks of a [`byte_channel`].
///
/// Must not be used from an async context.
#[derive(Debug)]
pub struct ByteReader {
    rx: mpsc::Receiver<Bytes>,
    front: Bytes,
    position: u64,
    eof: bool,
}

impl ByteReader {
    /// Blocks until a byte is available or the input has ended.
    pub fn at_end(&mut self) -> bool {
        self.fill();
        self.front.is_empty()
    }

    fn fill(&mut self) {
        while self.front.is_empty() && !self.eof {
            match self.rx.blocking_recv() {
                Some(chunk) => self.front = chunk,
                None => self.eof = true,
            }
        }
    }
}

impl Read for ByteReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.fill();
        let n = buf.len().min(self.front.len());
        buf[..n].copy_from_slice(&self.front[..n]);
        self.front.advance(n);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for ByteReader {
    /// Only reports the current position; the input is not seekable.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match pos {
            SeekFrom::Current(0) => Ok(self.position),
            SeekFrom::Start(p) if p == self.position => Ok(self.position),
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "byte stream input is not seekable",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Seek, SeekFrom};

    use bytes::Bytes;

    use super::byte_channel;

    #[tokio::test]
    async fn test_reads_across_chunk_boundaries() -> anyhow::Result<()> {
        let (tx, mut reader) = byte_channel(4);
        tx.send(Bytes::from_static(b"ab")).await?;
        tx.send(Bytes::new()).await?;
        tx.send(Bytes::from_static(b"cde")).await?;
        drop(tx);

        let out = tokio::task::spawn_blocking(move || {
            assert!(!reader.at_end());
            let mut out = Vec::new();
            reader.read_to_end(&mut out)?;
            assert_eq!(reader.seek(SeekFrom::Current(0))?, 5);
            assert!(reader.seek(SeekFrom::Start(0)).is_err());
            assert!(reader.at_end());
            Ok::<_, std::io::Error>(out)
        })
        .await??;
        assert_eq!(out, b"abcde");
        Ok(())
    }
}
