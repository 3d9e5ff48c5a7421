//! Pipe pumps for a worker process.
//!
//! Each output pipe is read by its own task and forwarded, chunk by chunk,
//! to the owner over a channel. Stdin is owned by a single writer task so
//! every write is ordered, including the handshake.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::{Error, Result};

/// Size of a single read from an output pipe.
const READ_CHUNK_SIZE: usize = 8192;

/// Which output pipe a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Worker stdout.
    Stdout,
    /// Worker stderr.
    Stderr,
}

/// Something that happened on one of the pipes.
#[derive(Debug)]
pub(crate) enum PipeEvent {
    Chunk(StreamKind, Bytes),
    Eof(StreamKind),
    ReadFailed(StreamKind, std::io::Error),
    StdinClosed(std::io::Error),
}

/// Message for the stdin writer task.
#[derive(Debug)]
pub(crate) enum StdinMessage {
    Handshake(Bytes),
    Line(Bytes),
}

/// Cloneable handle for writing to a worker's stdin.
#[derive(Debug, Clone)]
pub struct StdinHandle {
    tx: mpsc::UnboundedSender<StdinMessage>,
}

impl StdinHandle {
    pub(crate) const fn new(tx: mpsc::UnboundedSender<StdinMessage>) -> Self {
        Self { tx }
    }

    /// Queues one already-terminated line for the worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StdinClosed`] if the writer has stopped, which only
    /// happens after a failed write.
    pub fn write_line(&self, line: impl Into<Bytes>) -> Result<()> {
        self.tx
            .send(StdinMessage::Line(line.into()))
            .map_err(|_| Error::StdinClosed)
    }

    /// Whether the writer has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    fn send_handshake(&self, payload: Bytes) -> Result<()> {
        self.tx
            .send(StdinMessage::Handshake(payload))
            .map_err(|_| Error::StdinClosed)
    }
}

/// One-shot handshake fired by the first stdout chunk.
#[derive(Debug)]
pub(crate) struct Handshake {
    payload: Bytes,
    stdin: StdinHandle,
    sent: Arc<AtomicBool>,
}

impl Handshake {
    pub(crate) const fn new(payload: Bytes, stdin: StdinHandle, sent: Arc<AtomicBool>) -> Self {
        Self {
            payload,
            stdin,
            sent,
        }
    }

    fn fire(self) {
        if self.sent.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(bytes = self.payload.len(), "sending handshake");
        if let Err(e) = self.stdin.send_handshake(self.payload) {
            warn!(err = %e, "handshake could not be queued");
        }
    }
}

/// Reads `reader` until EOF, forwarding each chunk.
///
/// On stdout the first chunk, of any size, fires the handshake before the
/// chunk is forwarded. Later chunks never fire it again.
pub(crate) async fn pump_output<R>(
    kind: StreamKind,
    mut reader: R,
    events: mpsc::UnboundedSender<PipeEvent>,
    mut handshake: Option<Handshake>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                trace!(?kind, "pipe reached EOF");
                let _ = events.send(PipeEvent::Eof(kind));
                return;
            }
            Ok(n) => {
                if let Some(handshake) = handshake.take() {
                    handshake.fire();
                }
                if events
                    .send(PipeEvent::Chunk(kind, Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    // Owner is gone; keep draining so the worker never blocks on a full pipe.
                    continue;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                let _ = events.send(PipeEvent::ReadFailed(kind, e));
                return;
            }
        }
    }
}

/// Owns stdin and writes queued messages in order.
///
/// When `await_handshake` is set, lines queued before the handshake are held
/// back and written right after it, so the account record is always the first
/// thing the worker reads. A failed write is reported as
/// [`PipeEvent::StdinClosed`] and stops the writer.
pub(crate) async fn write_stdin<W>(
    stdin: W,
    capacity: usize,
    mut rx: mpsc::UnboundedReceiver<StdinMessage>,
    events: mpsc::UnboundedSender<PipeEvent>,
    await_handshake: bool,
) where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::with_capacity(capacity, stdin);
    let mut waiting = await_handshake;
    let mut held: VecDeque<Bytes> = VecDeque::new();

    while let Some(message) = rx.recv().await {
        let batch: Vec<Bytes> = match message {
            StdinMessage::Handshake(payload) => {
                waiting = false;
                std::iter::once(payload).chain(held.drain(..)).collect()
            }
            StdinMessage::Line(line) if waiting => {
                held.push_back(line);
                continue;
            }
            StdinMessage::Line(line) => vec![line],
        };

        for bytes in batch {
            let written = async {
                writer.write_all(&bytes).await?;
                writer.flush().await
            }
            .await;
            if let Err(e) = written {
                warn!(err = %e, "write to worker stdin failed");
                let _ = events.send(PipeEvent::StdinClosed(e));
                return;
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn test_handshake_fires_once_on_first_chunk() {
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(AtomicBool::new(false));
        let handshake = Handshake::new(
            Bytes::from_static(b"{\"a\":1}\n{\"i\":2}\n"),
            StdinHandle::new(stdin_tx),
            sent.clone(),
        );
        let reader = Builder::new().read(b"x").read(b"y").read(b"z\n").build();

        pump_output(StreamKind::Stdout, reader, events_tx, Some(handshake)).await;

        assert!(sent.load(Ordering::SeqCst));
        let writes = drain(&mut stdin_rx);
        assert_eq!(writes.len(), 1);
        assert!(matches!(
            &writes[0],
            StdinMessage::Handshake(p) if &p[..] == b"{\"a\":1}\n{\"i\":2}\n"
        ));

        let events = drain(&mut events_rx);
        let chunks: Vec<&[u8]> = events
            .iter()
            .filter_map(|e| match e {
                PipeEvent::Chunk(StreamKind::Stdout, data) => Some(data.as_ref()),
                _ => None,
            })
            .collect();
        assert_eq!(chunks, vec![&b"x"[..], &b"y"[..], &b"z\n"[..]]);
        assert!(matches!(events.last(), Some(PipeEvent::Eof(StreamKind::Stdout))));
    }

    #[tokio::test]
    async fn test_handshake_already_sent_is_not_repeated() {
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(AtomicBool::new(true));
        let handshake =
            Handshake::new(Bytes::from_static(b"h\n"), StdinHandle::new(stdin_tx), sent);
        let reader = Builder::new().read(b"data\n").build();

        pump_output(StreamKind::Stdout, reader, events_tx, Some(handshake)).await;

        assert!(drain(&mut stdin_rx).is_empty());
    }

    #[tokio::test]
    async fn test_no_output_means_no_handshake() {
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(AtomicBool::new(false));
        let handshake =
            Handshake::new(Bytes::from_static(b"h\n"), StdinHandle::new(stdin_tx), sent.clone());
        let reader = Builder::new().build();

        pump_output(StreamKind::Stdout, reader, events_tx, Some(handshake)).await;

        assert!(!sent.load(Ordering::SeqCst));
        assert!(drain(&mut stdin_rx).is_empty());
        assert!(matches!(
            drain(&mut events_rx).as_slice(),
            [PipeEvent::Eof(StreamKind::Stdout)]
        ));
    }

    #[tokio::test]
    async fn test_writer_holds_lines_until_handshake() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let stdin = StdinHandle::new(tx);

        stdin.write_line(Bytes::from_static(b"cmd1\n")).unwrap();
        stdin.send_handshake(Bytes::from_static(b"acct\nident\n")).unwrap();
        stdin.write_line(Bytes::from_static(b"cmd2\n")).unwrap();
        drop(stdin);

        let mock = Builder::new()
            .write(b"acct\nident\n")
            .write(b"cmd1\n")
            .write(b"cmd2\n")
            .build();
        write_stdin(mock, 1024, rx, events_tx, true).await;

        assert!(drain(&mut events_rx).is_empty());
    }

    #[tokio::test]
    async fn test_writer_without_handshake_writes_immediately() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let stdin = StdinHandle::new(tx);
        stdin
            .write_line(Bytes::from_static(b"{\"type\":\"wake-workers\"}\n"))
            .unwrap();
        drop(stdin);

        let mock = Builder::new().write(b"{\"type\":\"wake-workers\"}\n").build();
        write_stdin(mock, 1024, rx, events_tx, false).await;
    }

    #[tokio::test]
    async fn test_writer_reports_broken_pipe() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let stdin = StdinHandle::new(tx);
        stdin.write_line(Bytes::from_static(b"lost\n")).unwrap();

        let mock = Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
            .build();
        write_stdin(mock, 1024, rx, events_tx, false).await;

        assert!(matches!(
            drain(&mut events_rx).as_slice(),
            [PipeEvent::StdinClosed(e)] if e.kind() == std::io::ErrorKind::BrokenPipe
        ));
        assert!(stdin.is_closed());
        assert!(matches!(
            stdin.write_line(Bytes::from_static(b"x\n")),
            Err(Error::StdinClosed)
        ));
    }
}
