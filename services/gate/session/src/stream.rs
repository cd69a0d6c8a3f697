//! Stream sessions: raw byte-stream connections with three pumps.
//!
//! A stream session owns one TCP connection and runs three cooperating
//! pipelines sharing one cancellation token:
//!
//! - the **read pump** copies arriving bytes into the bounded inbound queue,
//!   dropping (with a warning) on overflow so a slow consumer loses data
//!   rather than stalling the network read
//! - the **parse pump** extracts length-prefixed frames from the accumulated
//!   bytes and dispatches each body to the `on_recv` hook on its own task,
//!   so a slow handler cannot delay later frames
//! - the **write pump** drains the outbound queue with a per-write deadline;
//!   any write failure tears the session down
//!
//! Teardown is idempotent: whichever pump exits first cancels the token, the
//! others follow at their next suspension point, and `on_stop` fires exactly
//! once.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, warn};

use gate_wire::FrameDecoder;

use crate::cancel::CancelToken;
use crate::hooks::SessionHooks;
use crate::pump::spawn_guarded;
use crate::registry::{ManagedSession, SessionRegistry};
use crate::{next_sid, SessionError, INBOUND_QUEUE_CAPACITY, OUTBOUND_QUEUE_CAPACITY};

/// Stream session configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Size of the read pump's scratch buffer
    pub read_buffer_size: usize,
    /// Maximum accepted frame body size (decoder policy)
    pub max_frame_size: usize,
    /// Per-write deadline applied by the write pump
    pub write_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 4 * 1024,
            max_frame_size: gate_wire::DEFAULT_MAX_FRAME_SIZE,
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Transfer counters for a session; observability only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Bytes read off the connection
    pub bytes_in: u64,
    /// Bytes written to the connection
    pub bytes_out: u64,
    /// Complete frames extracted and dispatched
    pub frames_in: u64,
    /// Frames written to the connection
    pub frames_out: u64,
}

#[derive(Debug, Default)]
struct Counters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
}

struct StreamParts {
    stream: TcpStream,
    in_rx: mpsc::Receiver<Bytes>,
    out_rx: mpsc::Receiver<Bytes>,
}

/// One raw byte-stream session.
pub struct StreamSession {
    sid: u64,
    id: AtomicU64,
    cache: DashMap<String, Arc<dyn Any + Send + Sync>>,
    hooks: Arc<dyn SessionHooks<StreamSession>>,
    in_tx: mpsc::Sender<Bytes>,
    out_tx: mpsc::Sender<Bytes>,
    cancel: CancelToken,
    closed: AtomicBool,
    peer: Option<SocketAddr>,
    registry: Option<Arc<SessionRegistry>>,
    config: StreamConfig,
    stats: Counters,
    parts: Mutex<Option<StreamParts>>,
}

impl StreamSession {
    /// Create a session over an accepted connection
    pub fn new(
        stream: TcpStream,
        hooks: Arc<dyn SessionHooks<StreamSession>>,
        config: StreamConfig,
    ) -> Arc<Self> {
        Self::build(stream, hooks, config, None)
    }

    /// Create a session that reports its lifecycle to a registry
    pub fn with_registry(
        stream: TcpStream,
        hooks: Arc<dyn SessionHooks<StreamSession>>,
        config: StreamConfig,
        registry: Arc<SessionRegistry>,
    ) -> Arc<Self> {
        Self::build(stream, hooks, config, Some(registry))
    }

    fn build(
        stream: TcpStream,
        hooks: Arc<dyn SessionHooks<StreamSession>>,
        config: StreamConfig,
        registry: Option<Arc<SessionRegistry>>,
    ) -> Arc<Self> {
        let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let peer = stream.peer_addr().ok();

        Arc::new(Self {
            sid: next_sid(),
            id: AtomicU64::new(0),
            cache: DashMap::new(),
            hooks,
            in_tx,
            out_tx,
            cancel: CancelToken::new(),
            closed: AtomicBool::new(false),
            peer,
            registry,
            config,
            stats: Counters::default(),
            parts: Mutex::new(Some(StreamParts {
                stream,
                in_rx,
                out_rx,
            })),
        })
    }

    /// Run `on_start` and spawn the three pumps. A second call is a no-op.
    pub async fn start(self: &Arc<Self>) {
        let taken = self.parts.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(parts) = taken else {
            warn!(sid = self.sid, "session already started");
            return;
        };

        if let Some(registry) = &self.registry {
            registry.register(self.clone());
        }
        self.hooks.on_start(self).await;

        let (reader, writer) = parts.stream.into_split();
        spawn_guarded("read", self.sid, Arc::clone(self).read_pump(reader));
        spawn_guarded("parse", self.sid, Arc::clone(self).parse_pump(parts.in_rx));
        spawn_guarded(
            "write",
            self.sid,
            Arc::clone(self).write_pump(parts.out_rx, writer),
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

    /// Peer address of the underlying connection, when known
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The session's cancellation token
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Whether teardown has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Snapshot the transfer counters
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            bytes_in: self.stats.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.stats.bytes_out.load(Ordering::Relaxed),
            frames_in: self.stats.frames_in.load(Ordering::Relaxed),
            frames_out: self.stats.frames_out.load(Ordering::Relaxed),
        }
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

    /// Encode and enqueue one outbound frame.
    ///
    /// Encode failure propagates without enqueuing. The enqueue is a single
    /// non-blocking attempt: a full outbound queue fails fast with
    /// [`SessionError::SendTimeout`].
    pub fn send_msg<F>(&self, encode: F) -> Result<(), SessionError>
    where
        F: FnOnce() -> anyhow::Result<Bytes>,
    {
        let data = encode().map_err(SessionError::Encode)?;

        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        match self.out_tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SessionError::SendTimeout),
            Err(TrySendError::Closed(_)) => Err(SessionError::Closed),
        }
    }

    /// Idempotent teardown: cancel the pipelines, run `on_stop` exactly
    /// once, and notify the registry when one is attached.
    pub async fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(sid = self.sid, id = self.id(), "closing session");

        self.cancel.cancel();
        self.hooks.on_stop(self).await;
        if let Some(registry) = &self.registry {
            registry.unregister(self.clone());
        }
    }

    async fn read_pump(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut scratch = vec![0u8; self.config.read_buffer_size];
        loop {
            tokio::select! {
                res = reader.read(&mut scratch) => match res {
                    Ok(0) => {
                        debug!(sid = self.sid, "connection closed by peer");
                        break;
                    }
                    Ok(n) => {
                        self.stats.bytes_in.fetch_add(n as u64, Ordering::Relaxed);
                        let chunk = Bytes::copy_from_slice(&scratch[..n]);
                        match self.in_tx.try_send(chunk) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) => {
                                warn!(sid = self.sid, len = n, "inbound queue full, dropping data");
                            }
                            Err(TrySendError::Closed(_)) => break,
                        }
                    }
                    Err(e) => {
                        debug!(sid = self.sid, error = %e, "read failed");
                        break;
                    }
                },
                _ = self.cancel.cancelled() => break,
            }
        }
        self.cancel.cancel();
    }

    async fn parse_pump(self: Arc<Self>, mut in_rx: mpsc::Receiver<Bytes>) {
        let mut decoder = FrameDecoder::with_max_frame_size(self.config.max_frame_size);
        let mut pending = BytesMut::new();
        loop {
            tokio::select! {
                maybe = in_rx.recv() => {
                    let Some(chunk) = maybe else { break };
                    pending.extend_from_slice(&chunk);
                    loop {
                        match decoder.decode(&mut pending) {
                            Ok(Some(frame)) => {
                                self.stats.frames_in.fetch_add(1, Ordering::Relaxed);
                                // Each frame gets its own task; dispatch order
                                // across frames is deliberately unspecified.
                                let session = Arc::clone(&self);
                                let hooks = Arc::clone(&self.hooks);
                                tokio::spawn(async move {
                                    hooks.on_recv(&session, frame).await;
                                });
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!(sid = self.sid, error = %e, "dropping frame");
                            }
                        }
                    }
                },
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    async fn write_pump(self: Arc<Self>, mut out_rx: mpsc::Receiver<Bytes>, mut writer: OwnedWriteHalf) {
        loop {
            tokio::select! {
                maybe = out_rx.recv() => {
                    let Some(data) = maybe else { break };
                    match tokio::time::timeout(self.config.write_timeout, writer.write_all(&data)).await {
                        Ok(Ok(())) => {
                            self.stats.bytes_out.fetch_add(data.len() as u64, Ordering::Relaxed);
                            self.stats.frames_out.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Err(e)) => {
                            warn!(sid = self.sid, len = data.len(), error = %e, "write failed");
                            break;
                        }
                        Err(_) => {
                            warn!(sid = self.sid, len = data.len(), "write deadline exceeded");
                            break;
                        }
                    }
                },
                _ = self.cancel.cancelled() => break,
            }
        }
        let _ = writer.shutdown().await;
        self.close().await;
    }
}

#[async_trait]
impl ManagedSession for StreamSession {
    fn sid(&self) -> u64 {
        StreamSession::sid(self)
    }

    fn id(&self) -> u64 {
        StreamSession::id(self)
    }

    fn is_heartbeat_timeout(&self, _now: Instant) -> bool {
        // Stream sessions carry no heartbeat; liveness is the connection
        // itself.
        false
    }

    async fn close(self: Arc<Self>) {
        StreamSession::close(&self).await;
    }
}
