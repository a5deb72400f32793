//! Mock collaborators and an in-memory event recorder used by this crate's own test suite
//! (and exposed, behind the `test-util` feature, so the `tests/` integration suite can reach
//! them too) to exercise [`crate::Pool`] without a real server.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
    time::Duration,
};

use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use crate::{
    collab::{Authenticator, BoxFuture, Credential, Dialer, HandshakeReply, Handshaker, StreamHealth},
    error::{Error, ErrorKind, Result},
    event::{EventListener, PoolEvent},
    options::Address,
};

/// An in-memory duplex stream standing in for a real socket, with an externally-settable
/// "peer closed" flag so tests can exercise the pool's liveness probe (§4.5) without a real
/// server dropping a connection out from under it.
pub struct MockStream {
    inner: DuplexStream,
    closed: Arc<AtomicBool>,
}

impl AsyncRead for MockStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl StreamHealth for MockStream {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A handle to a [`MockStream`] created by [`MockDialer`], letting a test simulate the peer
/// closing the socket out from under an idle pooled connection.
#[derive(Clone)]
pub struct MockStreamHandle {
    closed: Arc<AtomicBool>,
}

impl MockStreamHandle {
    /// Marks the stream as closed by the peer; the pool's next liveness probe (§4.5) will
    /// observe this and discard the connection with reason `Error`.
    pub fn mark_closed_by_peer(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A [`Dialer`] that never touches the network: every dial creates an in-memory duplex pipe,
/// optionally after a configured latency, optionally failing the next `n` calls.
#[derive(Clone, Default)]
pub struct MockDialer {
    latency: Duration,
    fail_next_count: Arc<AtomicUsize>,
    dial_count: Arc<AtomicUsize>,
    handles: Arc<Mutex<Vec<MockStreamHandle>>>,
}

impl MockDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every dial sleeps for `latency` before completing (or failing), simulating a slow
    /// network round trip so tests can observe `max_connecting` throttling in action.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// The next `n` dial attempts fail with a connection-failure error instead of succeeding.
    pub fn fail_next(&self, n: usize) {
        self.fail_next_count.store(n, Ordering::SeqCst);
    }

    /// The number of dial attempts that completed (successfully or not) so far.
    pub fn dial_count(&self) -> usize {
        self.dial_count.load(Ordering::SeqCst)
    }

    /// A handle to the `n`th (0-indexed) stream this dialer has created, for simulating a
    /// peer-initiated close on a specific connection.
    pub fn stream_handle(&self, n: usize) -> Option<MockStreamHandle> {
        self.handles.lock().unwrap().get(n).cloned()
    }
}

impl Dialer for MockDialer {
    type Stream = MockStream;

    fn dial<'a>(&'a self, _address: &'a Address, timeout: Duration) -> BoxFuture<'a, Result<Self::Stream>> {
        Box::pin(async move {
            let connect = async {
                if !self.latency.is_zero() {
                    tokio::time::sleep(self.latency).await;
                }

                let mut remaining = self.fail_next_count.load(Ordering::SeqCst);
                if remaining > 0 {
                    remaining -= 1;
                    self.fail_next_count.store(remaining, Ordering::SeqCst);
                    self.dial_count.fetch_add(1, Ordering::SeqCst);
                    return Err(Error::connection_failure_for_test("simulated dial failure", false));
                }

                let (client, server) = tokio::io::duplex(4096);
                // Keep the server half alive for the pool's stream, echoing nothing -- tests
                // don't exercise the wire codec, only pool bookkeeping, so a live but silent
                // peer is enough.
                tokio::spawn(async move {
                    let mut sink = tokio::io::sink();
                    let mut server = server;
                    let _ = tokio::io::copy(&mut server, &mut sink).await;
                });

                let closed = Arc::new(AtomicBool::new(false));
                self.handles.lock().unwrap().push(MockStreamHandle { closed: closed.clone() });
                self.dial_count.fetch_add(1, Ordering::SeqCst);

                Ok(MockStream { inner: client, closed })
            };

            match tokio::time::timeout(timeout, connect).await {
                Ok(result) => result,
                Err(_) => Err(Error::connection_failure_for_test("simulated dial timeout", true)),
            }
        })
    }
}

/// A [`Handshaker`] returning a fixed [`HandshakeReply`], optionally after a latency, optionally
/// failing the next `n` attempts.
#[derive(Clone, Default)]
pub struct MockHandshaker {
    reply: HandshakeReply,
    latency: Duration,
    fail_next_count: Arc<AtomicUsize>,
}

impl MockHandshaker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reply(mut self, reply: HandshakeReply) -> Self {
        self.reply = reply;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_next_count.store(n, Ordering::SeqCst);
    }
}

impl<S: Send> Handshaker<S> for MockHandshaker {
    fn handshake<'a>(&'a self, _stream: &'a mut S, _app_name: Option<&'a str>) -> BoxFuture<'a, Result<HandshakeReply>> {
        Box::pin(async move {
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            let mut remaining = self.fail_next_count.load(Ordering::SeqCst);
            if remaining > 0 {
                remaining -= 1;
                self.fail_next_count.store(remaining, Ordering::SeqCst);
                return Err(Error::connection_failure_for_test("simulated handshake failure", false));
            }
            Ok(self.reply.clone())
        })
    }
}

/// An [`Authenticator`] that always succeeds, recording every credential it was asked to
/// authenticate, unless told to fail the next `n` attempts.
#[derive(Clone, Default)]
pub struct MockAuthenticator {
    fail_next_count: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Credential>>>,
}

impl MockAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_next_count.store(n, Ordering::SeqCst);
    }

    pub fn seen_credentials(&self) -> Vec<Credential> {
        self.seen.lock().unwrap().clone()
    }
}

impl<S: Send> Authenticator<S> for MockAuthenticator {
    fn authenticate<'a>(&'a self, _stream: &'a mut S, credential: &'a Credential) -> BoxFuture<'a, Result<()>> {
        let credential = credential.clone();
        Box::pin(async move {
            self.seen.lock().unwrap().push(credential);
            let mut remaining = self.fail_next_count.load(Ordering::SeqCst);
            if remaining > 0 {
                remaining -= 1;
                self.fail_next_count.store(remaining, Ordering::SeqCst);
                return Err(Error::connection_failure_for_test("simulated auth failure", false));
            }
            Ok(())
        })
    }
}

/// Records every [`PoolEvent`] a pool emits, in order, for tests to assert against -- the
/// in-process analogue of the CMAP spec test runner's event handler.
#[derive(Clone, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<PoolEvent>>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of every event recorded so far, in emission order.
    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().unwrap().clone()
    }

    /// How many recorded events have the given [`PoolEvent::name`].
    pub fn count(&self, name: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.name() == name).count()
    }

    /// Polls [`RecordingListener::count`] until it reaches at least `count` or `timeout`
    /// elapses, returning whether it was reached. Event delivery from the pool's worker task
    /// is asynchronous relative to a caller's `await`, so tests that assert on event counts
    /// poll rather than assume the event arrived by the time their own future resolved.
    pub async fn wait_for_count(&self, name: &str, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.count(name) < count {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    fn counts_by_name(&self) -> HashMap<&'static str, usize> {
        let mut map = HashMap::new();
        for event in self.events.lock().unwrap().iter() {
            *map.entry(event.name()).or_insert(0) += 1;
        }
        map
    }

    /// A compact summary for failure messages: `{"PoolCreated": 1, "ConnectionCreated": 2, ...}`.
    pub fn summary(&self) -> String {
        format!("{:?}", self.counts_by_name())
    }
}

impl EventListener for RecordingListener {
    fn handle(&self, event: PoolEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl Error {
    /// Builds a connection-failure error carrying an arbitrary message, for use by
    /// [`testkit`](crate::testkit) mocks that don't have a real [`std::io::Error`] to wrap.
    pub(crate) fn connection_failure_for_test(message: &str, is_timeout: bool) -> Self {
        Self::connection_failure(std::io::Error::other(message), is_timeout)
    }
}

/// A malformed-credential style error, useful for tests asserting on [`ErrorKind::Authentication`].
pub fn authentication_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Authentication { message: message.into() })
}
