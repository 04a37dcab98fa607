//! Unidirectional byte pumps between a child's pipes and its console.
//!
//! A [`ReadPump`] owns the read side (child output): it runs one dedicated task
//! that decodes bytes as they arrive and hands each chunk to a sink without
//! waiting for a full line. A [`WritePump`] owns the write side (child input)
//! and feeds it from a queue on its own task. Both report closure
//! exactly once through a [`Latch`], whether the stream ended, failed, or was
//! closed by the owner.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

const READ_CHUNK: usize = 4096;

/// Callback invoked once when a pump closes.
pub type ClosedHook = Box<dyn Fn() + Send + Sync>;

/// A flag that can be set exactly once.
///
/// `fire` returns `true` only for the caller that performed the transition, so
/// whatever follows a successful `fire` runs once no matter how many threads race.
#[derive(Debug, Default)]
pub struct Latch {
    fired: AtomicBool,
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self) -> bool {
        self.fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

#[derive(Debug, Error)]
pub enum PumpError {
    #[error("pump is closed")]
    Closed,
}

/// Read side of a child stream.
pub struct ReadPump {
    name: String,
    closed: Arc<Latch>,
    stop: Arc<Notify>,
}

impl ReadPump {
    /// Starts the read loop on its own task and returns immediately.
    ///
    /// `on_chunk` receives decoded text in arrival order; `on_closed` runs once
    /// after the last chunk, when the loop ends for any reason.
    pub fn start<R, F>(name: impl Into<String>, source: R, on_chunk: F, on_closed: ClosedHook) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        F: FnMut(String) + Send + 'static,
    {
        let name = name.into();
        let closed = Arc::new(Latch::new());
        let stop = Arc::new(Notify::new());
        tokio::spawn(read_loop(
            name.clone(),
            source,
            on_chunk,
            on_closed,
            Arc::clone(&closed),
            Arc::clone(&stop),
        ));
        Self { name, closed, stop }
    }

    /// Asks the read loop to stop. Closing an already closed pump does nothing.
    pub fn close(&self) {
        if !self.closed.is_fired() {
            debug!(pump = %self.name, "closing read pump");
            self.stop.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }
}

async fn read_loop<R, F>(
    name: String,
    mut source: R,
    mut on_chunk: F,
    on_closed: ClosedHook,
    closed: Arc<Latch>,
    stop: Arc<Notify>,
) where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut decoder = Utf8Decoder::default();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        tokio::select! {
            biased;
            _ = stop.notified() => {
                debug!(pump = %name, "read pump stopped by owner");
                break;
            }
            read = source.read(&mut buf) => match read {
                Ok(0) => {
                    debug!(pump = %name, "end of stream");
                    break;
                }
                Ok(n) => {
                    let text = decoder.decode(&buf[..n]);
                    if !text.is_empty() {
                        on_chunk(text);
                    }
                }
                Err(err) => {
                    // Usually the child going away; handled like end of stream.
                    debug!(pump = %name, error = %err, "read failed, closing");
                    break;
                }
            }
        }
    }
    let tail = decoder.finish();
    if !tail.is_empty() {
        on_chunk(tail);
    }
    drop(source);
    if closed.fire() {
        on_closed();
    }
}

/// Write side of a child stream.
///
/// Writes are queued to a dedicated task that owns the sink, so a child that
/// never drains its stdin cannot stall the caller. Queued text is written and
/// flushed in submission order.
pub struct WritePump {
    name: String,
    queue: mpsc::UnboundedSender<String>,
    closed: Arc<Latch>,
    stop: Arc<Notify>,
}

impl WritePump {
    /// Starts the write task and returns immediately.
    ///
    /// `on_closed` runs once, after the sink has been released, when the pump
    /// is closed by its owner or a write fails.
    pub fn start<W>(name: impl Into<String>, sink: W, on_closed: ClosedHook) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let (queue, pending) = mpsc::unbounded_channel();
        let closed = Arc::new(Latch::new());
        let stop = Arc::new(Notify::new());
        tokio::spawn(write_loop(
            name.clone(),
            sink,
            pending,
            on_closed,
            Arc::clone(&closed),
            Arc::clone(&stop),
        ));
        Self {
            name,
            queue,
            closed,
            stop,
        }
    }

    /// Queues `text` for the child. Never waits on the pipe.
    pub fn write(&self, text: &str) -> Result<(), PumpError> {
        if self.closed.is_fired() {
            return Err(PumpError::Closed);
        }
        self.queue
            .send(text.to_string())
            .map_err(|_| PumpError::Closed)
    }

    /// Stops the write task, abandoning a write that is stuck on a full pipe.
    /// Closing an already closed pump does nothing.
    pub fn close(&self) {
        if !self.closed.is_fired() {
            debug!(pump = %self.name, "closing write pump");
            self.stop.notify_one();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_fired()
    }
}

async fn write_loop<W>(
    name: String,
    mut sink: W,
    mut pending: mpsc::UnboundedReceiver<String>,
    on_closed: ClosedHook,
    closed: Arc<Latch>,
    stop: Arc<Notify>,
) where
    W: AsyncWrite + Unpin,
{
    let mut clean = true;
    loop {
        let text = tokio::select! {
            biased;
            _ = stop.notified() => break,
            next = pending.recv() => match next {
                Some(text) => text,
                None => break,
            },
        };
        tokio::select! {
            biased;
            _ = stop.notified() => {
                debug!(pump = %name, "write abandoned on close");
                clean = false;
                break;
            }
            written = write_flush(&mut sink, text.as_bytes()) => {
                if let Err(err) = written {
                    warn!(pump = %name, error = %err, "write failed, closing");
                    clean = false;
                    break;
                }
            }
        }
    }
    if !closed.fire() {
        return;
    }
    if clean {
        if let Err(err) = sink.shutdown().await {
            debug!(pump = %name, error = %err, "shutdown of write pump failed");
        }
    }
    drop(sink);
    pending.close();
    on_closed();
}

async fn write_flush<W>(sink: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    sink.write_all(bytes).await?;
    sink.flush().await
}

/// Incremental UTF-8 decoder.
///
/// A multi-byte sequence split across reads is held back until complete;
/// invalid bytes decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, input: &[u8]) -> String {
        self.pending.extend_from_slice(input);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        out
    }

    /// Flushes whatever is still held back.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

/// Reads two streams as one, reaching end of stream only once both have.
///
/// Used to fold a child's stderr into its stdout. The caller's buffer must have
/// spare capacity, as an empty read is taken to mean end of stream.
pub struct MergedReader<A, B> {
    first: Option<A>,
    second: Option<B>,
    prefer_second: bool,
}

impl<A, B> MergedReader<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self {
            first: Some(first),
            second: Some(second),
            prefer_second: false,
        }
    }
}

impl<A, B> AsyncRead for MergedReader<A, B>
where
    A: AsyncRead + Unpin,
    B: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let order = if this.prefer_second { [1, 0] } else { [0, 1] };
        this.prefer_second = !this.prefer_second;
        for side in order {
            let before = buf.filled().len();
            let polled = if side == 0 {
                match this.first.as_mut() {
                    Some(reader) => Pin::new(reader).poll_read(cx, buf),
                    None => continue,
                }
            } else {
                match this.second.as_mut() {
                    Some(reader) => Pin::new(reader).poll_read(cx, buf),
                    None => continue,
                }
            };
            match polled {
                Poll::Ready(Ok(())) if buf.filled().len() == before => {
                    if side == 0 {
                        this.first = None;
                    } else {
                        this.second = None;
                    }
                }
                Poll::Ready(result) => return Poll::Ready(result),
                Poll::Pending => {}
            }
        }
        if this.first.is_none() && this.second.is_none() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_hook(count: &Arc<AtomicUsize>, tx: mpsc::UnboundedSender<()>) -> ClosedHook {
        let count = Arc::clone(count);
        Box::new(move || {
            count.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        })
    }

    async fn recv_within<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[test]
    fn latch_fires_once() {
        let latch = Latch::new();
        assert!(!latch.is_fired());
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(latch.is_fired());
    }

    #[test]
    fn latch_fires_once_across_threads() {
        let latch = Arc::new(Latch::new());
        let winners = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let latch = Arc::clone(&latch);
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    if latch.fire() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn decoder_holds_split_sequences() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[b'a', 0xC3]), "a");
        assert_eq!(decoder.decode(&[0xA9, b'b']), "\u{e9}b");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[b'x', 0xFF, b'y']), "x\u{fffd}y");
        assert_eq!(decoder.decode(&[0xE2, 0x82]), "");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }

    #[tokio::test]
    async fn read_pump_forwards_chunks_and_closes_once_at_eof() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel();
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let count = Arc::new(AtomicUsize::new(0));
        let pump = ReadPump::start(
            "test-out",
            reader,
            move |text| {
                let _ = chunk_tx.send(text);
            },
            counting_hook(&count, closed_tx),
        );

        writer.write_all(b"hello ").await.unwrap();
        assert_eq!(recv_within(&mut chunk_rx).await.as_deref(), Some("hello "));
        writer.write_all(b"world").await.unwrap();
        assert_eq!(recv_within(&mut chunk_rx).await.as_deref(), Some("world"));
        drop(writer);

        assert!(recv_within(&mut closed_rx).await.is_some());
        assert!(pump.is_closed());
        pump.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn read_pump_close_stops_an_open_stream() {
        let (_writer, reader) = tokio::io::duplex(64);
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let count = Arc::new(AtomicUsize::new(0));
        let pump = ReadPump::start("test-out", reader, |_| {}, counting_hook(&count, closed_tx));

        pump.close();
        pump.close();
        assert!(recv_within(&mut closed_rx).await.is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_pump_writes_in_order() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let (closed_tx, _closed_rx) = mpsc::unbounded_channel();
        let count = Arc::new(AtomicUsize::new(0));
        let pump = WritePump::start("test-in", writer, counting_hook(&count, closed_tx));

        pump.write("status\n").unwrap();
        pump.write("players\n").unwrap();
        let mut buf = [0u8; 15];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"status\nplayers\n");
        assert!(!pump.is_closed());
    }

    #[tokio::test]
    async fn write_failure_closes_once() {
        let (writer, reader) = tokio::io::duplex(64);
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let count = Arc::new(AtomicUsize::new(0));
        let pump = WritePump::start("test-in", writer, counting_hook(&count, closed_tx));
        drop(reader);

        pump.write("late\n").unwrap();
        assert!(recv_within(&mut closed_rx).await.is_some());
        assert!(pump.is_closed());
        assert!(matches!(pump.write("later\n"), Err(PumpError::Closed)));
        pump.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_does_not_wait_for_a_full_pipe() {
        let (writer, _reader) = tokio::io::duplex(64);
        let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
        let count = Arc::new(AtomicUsize::new(0));
        let pump = WritePump::start("test-in", writer, counting_hook(&count, closed_tx));

        let big = "x".repeat(256 * 1024);
        let started = tokio::time::Instant::now();
        pump.write(&big).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        pump.write("queued behind\n").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pump.is_closed());

        pump.close();
        assert!(recv_within(&mut closed_rx).await.is_some());
        assert!(matches!(pump.write("after\n"), Err(PumpError::Closed)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn merged_reader_ends_after_both_sides() {
        let (mut out_w, out_r) = tokio::io::duplex(64);
        let (mut err_w, err_r) = tokio::io::duplex(64);
        let mut merged = MergedReader::new(out_r, err_r);

        out_w.write_all(b"out").await.unwrap();
        drop(out_w);
        err_w.write_all(b"err").await.unwrap();

        let mut seen = Vec::new();
        let mut buf = [0u8; 16];
        while seen.len() < 6 {
            let n = merged.read(&mut buf).await.unwrap();
            assert!(n > 0);
            seen.extend_from_slice(&buf[..n]);
        }
        let text = String::from_utf8(seen).unwrap();
        assert!(text.contains("out") && text.contains("err"));

        drop(err_w);
        assert_eq!(merged.read(&mut buf).await.unwrap(), 0);
    }
}
