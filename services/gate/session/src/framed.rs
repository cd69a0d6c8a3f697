//! Framed sessions: message-oriented transports that deliver whole frames.
//!
//! The transport already delimits messages: every successful receive is one
//! complete frame, so there is no parse pump. Frames are received into
//! buffers checked out of a [`BufferPool`], copied out before the buffer
//! returns to the pool, and dispatched to `on_recv` inline on the read pump
//! (recv handling is serialized per session).
//!
//! Backpressure on send is a bounded retry: [`SEND_RETRY_ATTEMPTS`]
//! non-blocking enqueue attempts separated by an exponentially doubling
//! delay, failing with [`SessionError::SendTimeout`] once exhausted. The
//! write pump applies the same schedule to transport writes before declaring
//! the connection broken.

use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, warn};

use gate_bufpool::{Buffer, BufferPool};

use crate::cancel::CancelToken;
use crate::hooks::SessionHooks;
use crate::pump::spawn_guarded;
use crate::registry::{ManagedSession, SessionRegistry};
use crate::{next_sid, SessionError, OUTBOUND_QUEUE_CAPACITY};

/// How long a session may go without a heartbeat before it is timed out
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Non-blocking enqueue attempts made by [`FramedSession::send_msg`]
pub const SEND_RETRY_ATTEMPTS: u32 = 3;

/// Transport write attempts made per frame by the write pump
const WRITE_RETRY_ATTEMPTS: u32 = 3;

/// Base delay of the exponential backoff between attempts
const SEND_BACKOFF_BASE: Duration = Duration::from_millis(100);

fn send_backoff(attempt: u32) -> Duration {
    SEND_BACKOFF_BASE * (1u32 << attempt.min(10))
}

/// Source half of a framed transport: one complete frame per receive.
///
/// The frame is written into the caller-provided buffer, which the session
/// checked out of its buffer pool; the session copies the contents out
/// before returning the buffer.
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Receive one complete frame into `buf`, returning its length, or
    /// `None` once the transport is exhausted.
    async fn recv_frame(&mut self, buf: &mut Buffer) -> io::Result<Option<usize>>;
}

/// Sink half of a framed transport.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Transmit one complete frame
    async fn send_frame(&mut self, frame: Bytes) -> io::Result<()>;

    /// Close the underlying transport
    async fn close(&mut self) -> io::Result<()>;
}

/// Framed session configuration
#[derive(Debug, Clone)]
pub struct FramedConfig {
    /// Maximum accepted single-frame size; larger frames are dropped
    pub max_frame_size: usize,
}

impl Default for FramedConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 64 * 1024,
        }
    }
}

struct FramedParts {
    source: Box<dyn FrameSource>,
    sink: Box<dyn FrameSink>,
    out_rx: mpsc::Receiver<Bytes>,
}

/// One message-oriented session.
pub struct FramedSession {
    sid: u64,
    id: AtomicU64,
    cache: DashMap<String, Arc<dyn Any + Send + Sync>>,
    hooks: Arc<dyn SessionHooks<FramedSession>>,
    out_tx: mpsc::Sender<Bytes>,
    cancel: CancelToken,
    closed: AtomicBool,
    last_heartbeat: Mutex<Instant>,
    registry: Arc<SessionRegistry>,
    buffers: Arc<BufferPool>,
    config: FramedConfig,
    parts: Mutex<Option<FramedParts>>,
}

impl FramedSession {
    /// Create a session over a framed transport
    pub fn new(
        source: Box<dyn FrameSource>,
        sink: Box<dyn FrameSink>,
        hooks: Arc<dyn SessionHooks<FramedSession>>,
        registry: Arc<SessionRegistry>,
        buffers: Arc<BufferPool>,
        config: FramedConfig,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        Arc::new(Self {
            sid: next_sid(),
            id: AtomicU64::new(0),
            cache: DashMap::new(),
            hooks,
            out_tx,
            cancel: CancelToken::new(),
            closed: AtomicBool::new(false),
            last_heartbeat: Mutex::new(Instant::now()),
            registry,
            buffers,
            config,
            parts: Mutex::new(Some(FramedParts {
                source,
                sink,
                out_rx,
            })),
        })
    }

    /// Register with the registry, run `on_start`, and spawn the pumps.
    /// A second call is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let taken = self.parts.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(parts) = taken else {
            warn!(sid = self.sid, "session already started");
            return;
        };

        self.registry.register(self.clone());
        self.hooks.on_start(self).await;

        spawn_guarded("read", self.sid, Arc::clone(self).read_pump(parts.source));
        spawn_guarded(
            "write",
            self.sid,
            Arc::clone(self).write_pump(parts.out_rx, parts.sink),
        );
    }

    /// Connection serial, unique for the process lifetime
    pub fn sid(&self) -> u64 {
        self.sid
    }

    /// Logical identity; 0 until authentication
    pub fn id(&self) -> u64 {
        self.id.load(Ordering::SeqCst)
    }

    /// Bind the logical identity, once.
    ///
    /// Returns `false` if `id` is 0 or an identity was already set; the id
    /// is immutable once non-zero.
    pub fn set_id(&self, id: u64) -> bool {
        if id == 0 {
            return false;
        }
        self.id
            .compare_exchange(0, id, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// The session's cancellation token
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Whether teardown has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Store a value in the session cache
    pub fn set<V: Any + Send + Sync>(&self, key: impl Into<String>, value: V) {
        self.cache.insert(key.into(), Arc::new(value));
    }

    /// Fetch a typed value from the session cache
    pub fn get<V: Any + Send + Sync>(&self, key: &str) -> Option<Arc<V>> {
        self.cache
            .get(key)
            .and_then(|entry| Arc::clone(entry.value()).downcast::<V>().ok())
    }

    /// Remove a value from the session cache
    pub fn remove(&self, key: &str) {
        self.cache.remove(key);
    }

    /// Stamp the heartbeat with the current time
    pub fn heartbeat(&self) {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Whether `now` is past the last heartbeat plus [`HEARTBEAT_TIMEOUT`]
    pub fn is_heartbeat_timeout(&self, now: Instant) -> bool {
        let last = *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        now > last + HEARTBEAT_TIMEOUT
    }

    /// Ask the registry to promote this session to online under its id
    pub fn login(self: &Arc<Self>) {
        self.registry.login(self.clone());
    }

    /// Encode and enqueue one outbound frame.
    ///
    /// Encode failure propagates without enqueuing. The enqueue makes
    /// [`SEND_RETRY_ATTEMPTS`] non-blocking attempts, sleeping an
    /// exponentially doubling delay (100 ms, 200 ms, 400 ms) after each
    /// failed one, then fails with [`SessionError::SendTimeout`].
    pub async fn send_msg<F>(&self, encode: F) -> Result<(), SessionError>
    where
        F: FnOnce() -> anyhow::Result<Bytes>,
    {
        let mut pending = encode().map_err(SessionError::Encode)?;

        for attempt in 0..SEND_RETRY_ATTEMPTS {
            if self.closed.load(Ordering::SeqCst) {
                return Err(SessionError::Closed);
            }
            match self.out_tx.try_send(pending) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Closed(_)) => return Err(SessionError::Closed),
                Err(TrySendError::Full(frame)) => {
                    pending = frame;
                    tokio::time::sleep(send_backoff(attempt)).await;
                }
            }
        }
        Err(SessionError::SendTimeout)
    }

    /// Idempotent teardown: run `on_stop`, fail further sends fast, cancel
    /// the pipelines (which closes the transport), and unregister.
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(sid = self.sid, id = self.id(), "closing session");

        self.hooks.on_stop(self).await;
        self.cancel.cancel();
        self.registry.unregister(self.clone());
    }

    async fn read_pump(self: Arc<Self>, mut source: Box<dyn FrameSource>) {
        loop {
            let mut buf = self.buffers.get();
            let received = tokio::select! {
                res = source.recv_frame(&mut buf) => res,
                _ = self.cancel.cancelled() => {
                    self.buffers.put(buf);
                    break;
                }
            };

            match received {
                Ok(Some(len)) => {
                    if len == 0 {
                        self.buffers.put(buf);
                        continue;
                    }
                    if len > self.config.max_frame_size {
                        warn!(
                            sid = self.sid,
                            len,
                            max = self.config.max_frame_size,
                            "frame exceeds size limit, dropping"
                        );
                        self.buffers.put(buf);
                        continue;
                    }

                    // Copy out before the buffer returns to the pool; the
                    // same storage may immediately back another reader.
                    let data = Bytes::copy_from_slice(&buf.as_slice()[..len]);
                    self.buffers.put(buf);

                    self.hooks.on_recv(&self, data).await;
                }
                Ok(None) => {
                    debug!(sid = self.sid, "transport closed by peer");
                    self.buffers.put(buf);
                    break;
                }
                Err(e) => {
                    debug!(sid = self.sid, error = %e, "frame read failed");
                    self.buffers.put(buf);
                    break;
                }
            }
        }
        self.cancel.cancel();
    }

    async fn write_pump(self: Arc<Self>, mut out_rx: mpsc::Receiver<Bytes>, mut sink: Box<dyn FrameSink>) {
        'pump: loop {
            tokio::select! {
                maybe = out_rx.recv() => {
                    let Some(frame) = maybe else { break };
                    let mut delivered = false;
                    for attempt in 0..WRITE_RETRY_ATTEMPTS {
                        match sink.send_frame(frame.clone()).await {
                            Ok(()) => {
                                delivered = true;
                                break;
                            }
                            Err(e) => {
                                warn!(
                                    sid = self.sid,
                                    attempt,
                                    len = frame.len(),
                                    error = %e,
                                    "frame write failed"
                                );
                                tokio::time::sleep(send_backoff(attempt)).await;
                            }
                        }
                    }
                    if !delivered {
                        break 'pump;
                    }
                },
                _ = self.cancel.cancelled() => break,
            }
        }
        let _ = sink.close().await;
        self.close().await;
    }
}

#[async_trait]
impl ManagedSession for FramedSession {
    fn sid(&self) -> u64 {
        FramedSession::sid(self)
    }

    fn id(&self) -> u64 {
        FramedSession::id(self)
    }

    fn is_heartbeat_timeout(&self, now: Instant) -> bool {
        FramedSession::is_heartbeat_timeout(self, now)
    }

    async fn close(self: Arc<Self>) {
        FramedSession::close(&self).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use std::sync::atomic::AtomicUsize;

    struct ChanSource {
        rx: mpsc::Receiver<Vec<u8>>,
    }

    #[async_trait]
    impl FrameSource for ChanSource {
        async fn recv_frame(&mut self, buf: &mut Buffer) -> io::Result<Option<usize>> {
            match self.rx.recv().await {
                Some(frame) => {
                    buf.copy_from(&frame);
                    Ok(Some(frame.len()))
                }
                None => Ok(None),
            }
        }
    }

    struct ChanSink {
        tx: mpsc::Sender<Bytes>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl FrameSink for ChanSink {
        async fn send_frame(&mut self, frame: Bytes) -> io::Result<()> {
            self.tx
                .send(frame)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "sink receiver gone"))
        }

        async fn close(&mut self) -> io::Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Sink that fails the first `failures` sends, then delivers.
    struct FlakySink {
        failures: u32,
        tx: mpsc::Sender<Bytes>,
    }

    #[async_trait]
    impl FrameSink for FlakySink {
        async fn send_frame(&mut self, frame: Bytes) -> io::Result<()> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "transient"));
            }
            self.tx
                .send(frame)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "sink receiver gone"))
        }

        async fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct RecordingHooks {
        frames: Mutex<Vec<Bytes>>,
        stops: AtomicUsize,
    }

    impl RecordingHooks {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
                stops: AtomicUsize::new(0),
            })
        }

        fn frames(&self) -> Vec<Bytes> {
            self.frames.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SessionHooks<FramedSession> for RecordingHooks {
        async fn on_recv(&self, _session: &Arc<FramedSession>, data: Bytes) {
            self.frames.lock().unwrap().push(data);
        }

        async fn on_stop(&self, _session: &Arc<FramedSession>) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        session: Arc<FramedSession>,
        hooks: Arc<RecordingHooks>,
        registry: Arc<SessionRegistry>,
        buffers: Arc<BufferPool>,
        frame_tx: mpsc::Sender<Vec<u8>>,
        sent_rx: mpsc::Receiver<Bytes>,
        sink_closed: Arc<AtomicBool>,
    }

    fn harness(config: FramedConfig) -> Harness {
        let registry = SessionRegistry::new(RegistryConfig::default());
        let buffers = Arc::new(BufferPool::new());
        let hooks = RecordingHooks::new();
        let (frame_tx, frame_rx) = mpsc::channel(64);
        let (sent_tx, sent_rx) = mpsc::channel(64);
        let sink_closed = Arc::new(AtomicBool::new(false));

        let session = FramedSession::new(
            Box::new(ChanSource { rx: frame_rx }),
            Box::new(ChanSink {
                tx: sent_tx,
                closed: Arc::clone(&sink_closed),
            }),
            Arc::clone(&hooks) as Arc<dyn SessionHooks<FramedSession>>,
            Arc::clone(&registry),
            Arc::clone(&buffers),
            config,
        );

        Harness {
            session,
            hooks,
            registry,
            buffers,
            frame_tx,
            sent_rx,
            sink_closed,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_dispatches_through_buffer_pool() {
        let mut h = harness(FramedConfig::default());
        h.session.start().await;

        h.frame_tx.send(b"first".to_vec()).await.unwrap();
        h.frame_tx.send(b"second".to_vec()).await.unwrap();
        settle().await;

        let frames = h.hooks.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref(), b"first");
        assert_eq!(frames[1].as_ref(), b"second");

        // Every checkout was returned: the pool holds no outstanding buffer.
        let stats = h.buffers.stats();
        assert_eq!(stats.gets, stats.puts + 1, "only the in-flight recv holds a buffer");

        // Receiving alone must produce no outbound traffic.
        assert!(h.sent_rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_frame_dropped_without_recv_or_close() {
        let h = harness(FramedConfig { max_frame_size: 8 });
        h.session.start().await;

        h.frame_tx.send(vec![0xAA; 100]).await.unwrap();
        h.frame_tx.send(b"ok".to_vec()).await.unwrap();
        settle().await;

        let frames = h.hooks.frames();
        assert_eq!(frames.len(), 1, "oversized frame must never dispatch");
        assert_eq!(frames[0].as_ref(), b"ok");
        assert!(!h.session.is_closed());
        assert_eq!(h.hooks.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_msg_retry_schedule_on_overflow() {
        let h = harness(FramedConfig::default());
        // Pumps not started: nothing drains the outbound queue.
        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            h.session
                .send_msg(|| Ok(Bytes::from_static(b"x")))
                .await
                .unwrap();
        }

        let before = Instant::now();
        let err = h
            .session
            .send_msg(|| Ok(Bytes::from_static(b"x")))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::SendTimeout));
        // Exactly three attempts with doubling backoff: 100 + 200 + 400 ms.
        assert_eq!(before.elapsed(), Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_msg_succeeds_once_queue_drains() {
        let h = harness(FramedConfig::default());
        let parts = h.session.parts.lock().unwrap().take().unwrap();
        let mut out_rx = parts.out_rx;

        for _ in 0..OUTBOUND_QUEUE_CAPACITY {
            h.session
                .send_msg(|| Ok(Bytes::from_static(b"x")))
                .await
                .unwrap();
        }

        // Free one slot while the sender is backing off.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            let _ = out_rx.recv().await;
            // Keep the receiver alive so the queue does not report closed.
            std::future::pending::<()>().await;
        });

        let before = Instant::now();
        h.session
            .send_msg(|| Ok(Bytes::from_static(b"y")))
            .await
            .unwrap();

        // Attempts at 0 ms and 100 ms fail; the third, at 300 ms, lands in
        // the slot freed at 250 ms.
        assert_eq!(before.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_predicate() {
        let h = harness(FramedConfig::default());

        assert!(!h.session.is_heartbeat_timeout(Instant::now()));

        tokio::time::sleep(HEARTBEAT_TIMEOUT + Duration::from_secs(1)).await;
        assert!(h.session.is_heartbeat_timeout(Instant::now()));

        h.session.heartbeat();
        assert!(!h.session.is_heartbeat_timeout(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent_and_unregisters() {
        let h = harness(FramedConfig::default());
        tokio::spawn(Arc::clone(&h.registry).run());
        h.session.start().await;
        settle().await;
        assert!(h.registry.is_connected(h.session.sid()));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let session = Arc::clone(&h.session);
            tasks.push(tokio::spawn(async move { session.close().await }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        settle().await;

        assert_eq!(h.hooks.stops.load(Ordering::SeqCst), 1);
        assert!(!h.registry.is_connected(h.session.sid()));
        assert!(h.sink_closed.load(Ordering::SeqCst), "transport must be closed");

        let err = h
            .session
            .send_msg(|| Ok(Bytes::from_static(b"x")))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_pump_retries_with_backoff() {
        let registry = SessionRegistry::new(RegistryConfig::default());
        let buffers = Arc::new(BufferPool::new());
        let hooks = RecordingHooks::new();
        let (_frame_tx, frame_rx) = mpsc::channel(1);
        let (sent_tx, mut sent_rx) = mpsc::channel(1);

        let session = FramedSession::new(
            Box::new(ChanSource { rx: frame_rx }),
            Box::new(FlakySink {
                failures: 2,
                tx: sent_tx,
            }),
            hooks,
            registry,
            buffers,
            FramedConfig::default(),
        );
        session.start().await;

        let before = Instant::now();
        session
            .send_msg(|| Ok(Bytes::from_static(b"persist")))
            .await
            .unwrap();

        let delivered = sent_rx.recv().await.unwrap();
        assert_eq!(delivered.as_ref(), b"persist");
        // Two failed attempts back off 100 + 200 ms before the third lands.
        assert_eq!(before.elapsed(), Duration::from_millis(300));
        assert!(!session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_write_failure_tears_down() {
        let registry = SessionRegistry::new(RegistryConfig::default());
        let buffers = Arc::new(BufferPool::new());
        let hooks = RecordingHooks::new();
        let (_frame_tx, frame_rx) = mpsc::channel(1);
        let (sent_tx, sent_rx) = mpsc::channel(1);
        drop(sent_rx); // every send fails

        let session = FramedSession::new(
            Box::new(ChanSource { rx: frame_rx }),
            Box::new(ChanSink {
                tx: sent_tx,
                closed: Arc::new(AtomicBool::new(false)),
            }),
            Arc::clone(&hooks) as Arc<dyn SessionHooks<FramedSession>>,
            registry,
            buffers,
            FramedConfig::default(),
        );
        session.start().await;

        session
            .send_msg(|| Ok(Bytes::from_static(b"doomed")))
            .await
            .unwrap();

        // Three failed write attempts (100 + 200 + 400 ms of backoff), then
        // the connection is presumed broken.
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(session.is_closed());
        assert_eq!(hooks.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_promotes_session_online() {
        let h = harness(FramedConfig::default());
        tokio::spawn(Arc::clone(&h.registry).run());
        h.session.start().await;
        settle().await;

        assert!(h.session.set_id(42));
        h.session.login();
        settle().await;

        assert!(h.registry.is_online(42));
        assert_eq!(h.registry.get_online(42).unwrap().sid(), h.session.sid());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_sweep_closes_heartbeat_timeout() {
        let registry = SessionRegistry::new(RegistryConfig {
            sweep_interval: Duration::from_secs(10),
        });
        tokio::spawn(Arc::clone(&registry).run());

        let buffers = Arc::new(BufferPool::new());
        let hooks = RecordingHooks::new();
        let (_frame_tx, frame_rx) = mpsc::channel(1);
        let (sent_tx, _sent_rx) = mpsc::channel(64);

        let session = FramedSession::new(
            Box::new(ChanSource { rx: frame_rx }),
            Box::new(ChanSink {
                tx: sent_tx,
                closed: Arc::new(AtomicBool::new(false)),
            }),
            Arc::clone(&hooks) as Arc<dyn SessionHooks<FramedSession>>,
            Arc::clone(&registry),
            Arc::clone(&buffers),
            FramedConfig::default(),
        );
        session.start().await;
        settle().await;
        assert!(registry.is_connected(session.sid()));

        tokio::time::sleep(HEARTBEAT_TIMEOUT + Duration::from_secs(15)).await;
        settle().await;

        assert!(session.is_closed());
        assert_eq!(hooks.stops.load(Ordering::SeqCst), 1);
        assert!(!registry.is_connected(session.sid()));
    }
}
