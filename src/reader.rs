//! Coalescing pump for a child process's stdout/stderr pipe.
//!
//! Reads are buffered into at-most-1KiB send chunks and coalesced across a
//! short window so a chatty process doesn't produce one websocket frame per
//! OS read. Output is capped at `MAX_SIZE` total; the final chunk is
//! truncated to land exactly on the cap.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const READ_BUF: usize = 1 << 10;
pub const SEND_BUF: usize = 1 << 10;
pub const MAX_SIZE: usize = 1 << 19;
pub const COALESCE_WINDOW: Duration = Duration::from_millis(20);

#[derive(Debug)]
pub enum ReaderOutcome {
    /// Stream reached EOF on its own.
    Eof,
    /// Output hit `MAX_SIZE`; the stream was not read to EOF.
    Truncated,
    /// The stopper fired before EOF or the cap.
    Stopped,
    Io(std::io::Error),
}

/// `cancel` stops this reader from the outside (e.g. the process already
/// exited). `abort` is fired by this reader when it hits `MAX_SIZE`, so a
/// caller racing on it can kill the process promptly instead of leaving it
/// blocked on a full pipe once nothing drains it.
pub fn spawn_reader<R>(
    mut stream: R,
    sink: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    abort: CancellationToken,
) -> JoinHandle<ReaderOutcome>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut total = 0usize;
        let mut pending: Vec<u8> = Vec::with_capacity(SEND_BUF);
        let mut read_buf = [0u8; READ_BUF];
        let mut coalesce_deadline: Option<Instant> = None;

        loop {
            let sleep = async {
                match coalesce_deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    flush(&sink, &mut pending).await;
                    return ReaderOutcome::Stopped;
                }
                _ = sleep => {
                    flush(&sink, &mut pending).await;
                    coalesce_deadline = None;
                }
                res = stream.read(&mut read_buf) => {
                    match res {
                        Ok(0) => {
                            flush(&sink, &mut pending).await;
                            return ReaderOutcome::Eof;
                        }
                        Ok(mut n) => {
                            let truncated = total + n > MAX_SIZE;
                            if truncated {
                                n = MAX_SIZE - total;
                            }
                            total += n;
                            pending.extend_from_slice(&read_buf[..n]);
                            if coalesce_deadline.is_none() {
                                coalesce_deadline = Some(Instant::now() + COALESCE_WINDOW);
                            }
                            if pending.len() >= SEND_BUF || truncated {
                                flush(&sink, &mut pending).await;
                                coalesce_deadline = None;
                            }
                            if truncated {
                                abort.cancel();
                                return ReaderOutcome::Truncated;
                            }
                        }
                        Err(e) => {
                            flush(&sink, &mut pending).await;
                            return ReaderOutcome::Io(e);
                        }
                    }
                }
            }
        }
    })
}

async fn flush(sink: &mpsc::Sender<Vec<u8>>, pending: &mut Vec<u8>) {
    if pending.is_empty() {
        return;
    }
    let _ = sink.send(std::mem::take(pending)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn forwards_bytes_to_eof() {
        let stream = Builder::new().read(b"hello world").build();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = spawn_reader(stream, tx, CancellationToken::new(), CancellationToken::new());

        let mut collected = Vec::new();
        while let Some(chunk) = rx.recv().await {
            collected.extend(chunk);
        }
        assert_eq!(collected, b"hello world");
        assert!(matches!(handle.await.unwrap(), ReaderOutcome::Eof));
    }

    #[tokio::test]
    async fn cancellation_yields_stopped_outcome() {
        let stream = Builder::new().wait(Duration::from_secs(3600)).build();
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let cancel = CancellationToken::new();
        let handle = spawn_reader(stream, tx, cancel.clone(), CancellationToken::new());
        cancel.cancel();
        assert!(matches!(handle.await.unwrap(), ReaderOutcome::Stopped));
    }

    #[tokio::test]
    async fn truncation_fires_abort_signal() {
        let overflow = vec![b'x'; MAX_SIZE + 10];
        let stream = Builder::new().read(&overflow).build();
        let (tx, mut rx) = mpsc::channel(64);
        let abort = CancellationToken::new();
        let handle = spawn_reader(stream, tx, CancellationToken::new(), abort.clone());

        let mut total = 0;
        while let Some(chunk) = rx.recv().await {
            total += chunk.len();
        }
        assert_eq!(total, MAX_SIZE);
        assert!(abort.is_cancelled());
        assert!(matches!(handle.await.unwrap(), ReaderOutcome::Truncated));
    }
}
