//! Byte stream plumbing shared by the shell, the connector and the audit worker

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::PollSender;
use tracing::debug;

/// End-of-Transmission (Ctrl-D)
pub const EOT: u8 = 0x04;

/// Boxed input stream handed to a session
pub type InputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Boxed output stream handed to a session
pub type OutputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Reads terminal lines from a byte stream
///
/// A line ends at `\n`, `\r\n` or a bare `\r`. An EOT byte ends the current
/// line and the stream: characters read before it are still returned, and
/// every later call yields `None`.
pub struct LineReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
    skip_lf: bool,
    finished: bool,
    eot_ends_stream: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            pending: Vec::new(),
            skip_lf: false,
            finished: false,
            eot_ends_stream: true,
        }
    }

    /// Reader for relayed transcripts, where EOT only ends the current line
    ///
    /// A Ctrl-D typed inside a tunnel goes to the remote shell, so the
    /// transcript keeps going until the byte stream itself ends.
    pub fn transcript(inner: R) -> Self {
        Self {
            eot_ends_stream: false,
            ..Self::new(inner)
        }
    }

    /// Read the next line without its terminator
    ///
    /// Returns `Ok(None)` at end of stream or after EOT. Cancel safe: a
    /// partially read line is kept for the next call.
    pub async fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.finished {
            return Ok(None);
        }

        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                self.finished = true;
                return Ok(self.take_pending());
            }

            let mut used = 0;
            let mut complete = false;
            for &byte in available {
                used += 1;
                if std::mem::take(&mut self.skip_lf) && byte == b'\n' {
                    continue;
                }
                match byte {
                    b'\n' => {
                        complete = true;
                        break;
                    }
                    b'\r' => {
                        self.skip_lf = true;
                        complete = true;
                        break;
                    }
                    EOT => {
                        self.finished = self.eot_ends_stream;
                        complete = true;
                        break;
                    }
                    other => self.pending.push(other),
                }
            }
            self.inner.consume(used);

            if complete {
                if self.finished {
                    return Ok(self.take_pending());
                }
                return Ok(Some(std::mem::take(&mut self.pending)));
            }
        }
    }

    /// Whether EOT or end of stream has been seen
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Raw access to the remaining bytes, including anything already buffered
    ///
    /// Drops the `\n` half of a `\r\n` pair whose `\r` ended the last line.
    pub fn raw(&mut self) -> &mut BufReader<R> {
        if std::mem::take(&mut self.skip_lf) && self.inner.buffer().first() == Some(&b'\n') {
            self.inner.consume(1);
        }
        &mut self.inner
    }

    fn take_pending(&mut self) -> Option<Vec<u8>> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Create an unbounded in-memory byte pipe
///
/// The writer never blocks, so it is safe to feed from transport callbacks.
/// Dropping the writer ends the stream; an `Err` sent through the pipe is
/// surfaced to the reader as a read error.
pub fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::unbounded_channel();
    (PipeWriter { tx }, PipeReader::new(PipeRx::Unbounded(rx)))
}

/// Create a bounded pipe for a [`TeeReader`] tap
///
/// At most `capacity` chunks are held. A tee waits for room before it reads
/// more input, so a slow reader slows the tee down instead of buffering.
pub fn tap(capacity: usize) -> (TapWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        TapWriter { tx: PollSender::new(tx) },
        PipeReader::new(PipeRx::Bounded(rx)),
    )
}

/// Writing end of a [`pipe`]
#[derive(Debug, Clone)]
pub struct PipeWriter {
    tx: mpsc::UnboundedSender<io::Result<Bytes>>,
}

impl PipeWriter {
    /// Queue bytes for the reader; fails once the reader is gone
    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Ok(Bytes::copy_from_slice(data)))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"))
    }

    /// Deliver a read error to the reader
    pub fn fail(&self, error: io::Error) {
        let _ = self.tx.send(Err(error));
    }
}

/// Writing end of a [`tap`]
pub struct TapWriter {
    tx: PollSender<io::Result<Bytes>>,
}

#[derive(Debug)]
enum PipeRx {
    Unbounded(mpsc::UnboundedReceiver<io::Result<Bytes>>),
    Bounded(mpsc::Receiver<io::Result<Bytes>>),
}

impl PipeRx {
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        match self {
            PipeRx::Unbounded(rx) => rx.poll_recv(cx),
            PipeRx::Bounded(rx) => rx.poll_recv(cx),
        }
    }
}

/// Reading end of a [`pipe`] or [`tap`]
#[derive(Debug)]
pub struct PipeReader {
    rx: PipeRx,
    chunk: Bytes,
}

impl PipeReader {
    fn new(rx: PipeRx) -> Self {
        Self {
            rx,
            chunk: Bytes::new(),
        }
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.chunk.is_empty() {
                let n = self.chunk.len().min(buf.remaining());
                let head = self.chunk.split_to(n);
                buf.put_slice(&head);
                return Poll::Ready(Ok(()));
            }

            match ready!(self.rx.poll_recv(cx)) {
                Some(Ok(chunk)) => self.chunk = chunk,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// Reader that copies everything it reads into a [`TapWriter`]
///
/// Room in the tap is reserved before the inner reader is polled, so every
/// byte handed out has a place in the tap. Once the tap's reader is gone,
/// reads fail with `BrokenPipe` so nothing passes through uncopied. Dropping
/// the tee ends the tapped stream.
pub struct TeeReader<R> {
    inner: R,
    tap: TapWriter,
}

impl<R> TeeReader<R> {
    pub fn new(inner: R, tap: TapWriter) -> Self {
        Self { inner, tap }
    }
}

fn tap_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "audit tap closed")
}

impl<R: AsyncRead + Unpin> AsyncRead for TeeReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if ready!(this.tap.tx.poll_reserve(cx)).is_err() {
            debug!("tee tap closed");
            return Poll::Ready(Err(tap_closed()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];
        if fresh.is_empty() {
            return Poll::Ready(Ok(()));
        }
        if this.tap.tx.send_item(Ok(Bytes::copy_from_slice(fresh))).is_err() {
            debug!("tee tap closed");
            return Poll::Ready(Err(tap_closed()));
        }
        Poll::Ready(Ok(()))
    }
}

/// Buffered output stream shared between a session and its flusher
#[derive(Clone)]
pub struct SharedOutput {
    inner: Arc<Mutex<BufWriter<OutputStream>>>,
}

impl SharedOutput {
    pub fn new(stream: OutputStream) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BufWriter::new(stream))),
        }
    }

    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        self.inner.lock().await.write_all(data).await
    }

    pub async fn write_str(&self, text: &str) -> io::Result<()> {
        self.write_all(text.as_bytes()).await
    }

    /// Write `text` followed by a terminal line break
    pub async fn write_line(&self, text: &str) -> io::Result<()> {
        let mut writer = self.inner.lock().await;
        writer.write_all(text.as_bytes()).await?;
        writer.write_all(b"\r\n").await
    }

    pub async fn flush(&self) -> io::Result<()> {
        self.inner.lock().await.flush().await
    }

    /// Flush and close the underlying stream
    pub async fn shutdown(&self) -> io::Result<()> {
        self.inner.lock().await.shutdown().await
    }

    fn downgrade(&self) -> Weak<Mutex<BufWriter<OutputStream>>> {
        Arc::downgrade(&self.inner)
    }
}

/// Background task that flushes an output stream at a fixed interval
///
/// Stops when dropped, when the stream is gone, or when a flush fails.
pub struct PeriodicFlusher {
    task: JoinHandle<()>,
}

impl PeriodicFlusher {
    pub fn start(output: &SharedOutput, interval: Duration) -> Self {
        let output = output.downgrade();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(output) = output.upgrade() else {
                    break;
                };
                let mut writer = output.lock().await;
                if let Err(e) = writer.flush().await {
                    debug!("periodic flush stopped: {}", e);
                    break;
                }
            }
        });
        Self { task }
    }
}

impl Drop for PeriodicFlusher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn lines_of(input: &[u8]) -> Vec<String> {
        let mut reader = LineReader::new(input);
        let mut lines = Vec::new();
        while let Some(line) = reader.read_line().await.unwrap() {
            lines.push(String::from_utf8(line).unwrap());
        }
        lines
    }

    #[tokio::test]
    async fn test_line_terminators() {
        assert_eq!(
            lines_of(b"one\ntwo\r\nthree\rfour").await,
            vec!["one", "two", "three", "four"]
        );
    }

    #[tokio::test]
    async fn test_crlf_split_across_reads() {
        let (writer, pipe_reader) = pipe();
        let mut reader = LineReader::new(pipe_reader);
        writer.write(b"first\r").unwrap();
        assert_eq!(reader.read_line().await.unwrap(), Some(b"first".to_vec()));
        writer.write(b"\nsecond\n").unwrap();
        assert_eq!(reader.read_line().await.unwrap(), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_empty_lines_are_returned() {
        assert_eq!(lines_of(b"\n\nx\n").await, vec!["", "", "x"]);
    }

    #[tokio::test]
    async fn test_eot_ends_line_and_stream() {
        let mut reader = LineReader::new(&b"action1\x04\nmore\n"[..]);
        assert_eq!(reader.read_line().await.unwrap(), Some(b"action1".to_vec()));
        assert!(reader.is_finished());
        assert_eq!(reader.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transcript_reader_continues_after_eot() {
        let mut reader = LineReader::transcript(&b"cat\x04whoami\n"[..]);
        assert_eq!(reader.read_line().await.unwrap(), Some(b"cat".to_vec()));
        assert!(!reader.is_finished());
        assert_eq!(reader.read_line().await.unwrap(), Some(b"whoami".to_vec()));
        assert_eq!(reader.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_eot_on_empty_line() {
        let mut reader = LineReader::new(&b"\x04"[..]);
        assert_eq!(reader.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_raw_skips_dangling_lf() {
        let mut reader = LineReader::new(&b"connect host\r\nls\n"[..]);
        assert_eq!(reader.read_line().await.unwrap(), Some(b"connect host".to_vec()));
        let mut rest = Vec::new();
        reader.raw().read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"ls\n");
    }

    #[tokio::test]
    async fn test_pipe_write_after_reader_dropped_fails() {
        let (writer, reader) = pipe();
        drop(reader);
        let err = writer.write(b"late").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_pipe_delivers_errors() {
        let (writer, mut reader) = pipe();
        writer.write(b"ok").unwrap();
        writer.fail(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 2);
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }

    #[tokio::test]
    async fn test_tee_copies_reads() {
        let (tap, mut tapped) = tap(8);
        let mut tee = TeeReader::new(&b"hello world"[..], tap);
        let mut out = Vec::new();
        tee.read_to_end(&mut out).await.unwrap();
        drop(tee);

        let mut copy = Vec::new();
        tapped.read_to_end(&mut copy).await.unwrap();
        assert_eq!(out, b"hello world");
        assert_eq!(copy, b"hello world");
    }

    #[tokio::test]
    async fn test_tee_fails_once_tap_closed() {
        let (tap, tapped) = tap(8);
        drop(tapped);
        let mut tee = TeeReader::new(&b"secret"[..], tap);
        let mut buf = [0u8; 6];
        let err = tee.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_full_tap_holds_back_reads() {
        let (writer, input) = pipe();
        let (tap, mut tapped) = tap(1);
        let mut tee = TeeReader::new(input, tap);
        writer.write(b"ab").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(tee.read(&mut buf).await.unwrap(), 2);

        // The single slot is taken until the tapped side reads it
        writer.write(b"cd").unwrap();
        assert!(time::timeout(Duration::from_millis(50), tee.read(&mut buf))
            .await
            .is_err());

        let mut copy = [0u8; 8];
        assert_eq!(tapped.read(&mut copy).await.unwrap(), 2);
        assert_eq!(&copy[..2], b"ab");
        assert_eq!(tee.read(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"cd");
    }

    #[tokio::test]
    async fn test_shared_output_flushes() {
        let (client, mut server) = tokio::io::duplex(1024);
        let output = SharedOutput::new(Box::new(client));
        output.write_line("hello").await.unwrap();
        output.flush().await.unwrap();

        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\r\n");
    }

    #[tokio::test]
    async fn test_periodic_flusher_pushes_buffered_output() {
        let (client, mut server) = tokio::io::duplex(1024);
        let output = SharedOutput::new(Box::new(client));
        let _flusher = PeriodicFlusher::start(&output, Duration::from_millis(10));

        output.write_str("buffered").await.unwrap();

        let mut buf = [0u8; 8];
        time::timeout(Duration::from_secs(2), server.read_exact(&mut buf))
            .await
            .expect("flusher did not flush")
            .unwrap();
        assert_eq!(&buf, b"buffered");
    }

    #[tokio::test]
    async fn test_flusher_stops_when_output_dropped() {
        let (client, _server) = tokio::io::duplex(64);
        let output = SharedOutput::new(Box::new(client));
        let flusher = PeriodicFlusher::start(&output, Duration::from_millis(5));
        drop(output);
        time::sleep(Duration::from_millis(50)).await;
        assert!(flusher.task.is_finished());
    }
}
