//! Latency instrumentation for one HTTP round trip.
//!
//! DNS and connection timestamps are taken by the transport around its own
//! resolve and dial steps. On HTTP/1.1, write and first-byte timestamps
//! come from a [`TracedStream`] wrapped around the plaintext side of the
//! connection: once a [`PhaseClock`] is armed, every successful write moves
//! the "request written" mark forward until the first byte of the response
//! is read back. TLS records that carry no application data never reach
//! it. Multiplexed HTTP/2 streams share a socket, so the transport marks
//! them itself through [`Tracer::wrote_request`] and
//! [`Tracer::got_first_response_byte`].

use crate::types::Phases;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

#[derive(Debug, Default, Clone, Copy)]
struct Marks {
    armed: bool,
    wrote: Option<Instant>,
    first_byte: Option<Instant>,
}

/// Write/read marks shared between a connection's socket and the request
/// currently using it.
#[derive(Debug, Default)]
pub struct PhaseClock {
    marks: Mutex<Marks>,
}

impl PhaseClock {
    fn lock(&self) -> MutexGuard<'_, Marks> {
        self.marks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts observing a new request on this connection.
    pub fn arm(&self) {
        *self.lock() = Marks {
            armed: true,
            ..Marks::default()
        };
    }

    /// Stops observing and returns (request written, first response byte).
    pub fn disarm(&self) -> (Option<Instant>, Option<Instant>) {
        let mut marks = self.lock();
        marks.armed = false;
        (marks.wrote, marks.first_byte)
    }

    fn on_write(&self) {
        let mut marks = self.lock();
        if marks.armed && marks.first_byte.is_none() {
            marks.wrote = Some(Instant::now());
        }
    }

    fn on_read(&self) {
        let mut marks = self.lock();
        // Frames read before anything was written (e.g. HTTP/2 settings)
        // are not a response.
        if marks.armed && marks.wrote.is_some() && marks.first_byte.is_none() {
            marks.first_byte = Some(Instant::now());
        }
    }
}

/// I/O wrapper feeding a [`PhaseClock`].
#[derive(Debug)]
pub struct TracedStream<S> {
    inner: S,
    clock: Arc<PhaseClock>,
}

impl<S> TracedStream<S> {
    pub fn new(inner: S, clock: Arc<PhaseClock>) -> Self {
        Self { inner, clock }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TracedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(polled, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.clock.on_read();
        }
        polled
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TracedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(polled, Poll::Ready(Ok(n)) if n > 0) {
            this.clock.on_write();
        }
        polled
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if matches!(polled, Poll::Ready(Ok(n)) if n > 0) {
            this.clock.on_write();
        }
        polled
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Timestamps for one hop of a request, filled in by the transport.
#[derive(Debug, Default, Clone)]
pub struct Tracer {
    dns_start: Option<Instant>,
    dns_done: Option<Instant>,
    get_conn: Option<Instant>,
    got_conn: Option<Instant>,
    reused: bool,
    wrote: Option<Instant>,
    first_byte: Option<Instant>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dns_start(&mut self) {
        self.dns_start = Some(Instant::now());
    }

    pub fn dns_done(&mut self) {
        self.dns_done = Some(Instant::now());
    }

    pub fn get_conn(&mut self) {
        self.get_conn = Some(Instant::now());
    }

    pub fn got_conn(&mut self, reused: bool) {
        self.got_conn = Some(Instant::now());
        self.reused = reused;
    }

    pub fn wrote_request(&mut self) {
        self.wrote = Some(Instant::now());
    }

    pub fn got_first_response_byte(&mut self) {
        self.first_byte = Some(Instant::now());
    }

    /// Copies the write and first-byte marks out of the connection's clock.
    pub fn observe(&mut self, clock: &PhaseClock) {
        let (wrote, first_byte) = clock.disarm();
        self.wrote = wrote;
        self.first_byte = first_byte;
    }

    /// Derives the phase breakdown, `done` being the moment the body was
    /// fully drained (or the hop failed). Missing marks yield zero.
    pub fn phases(&self, done: Instant) -> Phases {
        Phases {
            dns: span(self.dns_start, self.dns_done),
            connect: if self.reused {
                Duration::ZERO
            } else {
                span(self.get_conn, self.got_conn)
            },
            write: span(self.got_conn, self.wrote),
            delay: span(self.wrote, self.first_byte),
            read: span(self.first_byte, Some(done)),
        }
    }
}

fn span(from: Option<Instant>, to: Option<Instant>) -> Duration {
    match (from, to) {
        (Some(from), Some(to)) => to.saturating_duration_since(from),
        _ => Duration::ZERO,
    }
}
