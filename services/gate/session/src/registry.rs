//! Process-wide session registry: connected and online tables.
//!
//! The registry owns two tables. The *connected* table holds every live
//! session, keyed by connection serial; the *online* table holds sessions
//! that completed authentication, keyed by logical id. Direct queries take
//! each table's own read lock, but every mutation that relates the two
//! tables (register, promote-on-login, unregister) is requested through a
//! bounded command queue and applied by one serialized handler loop, so a
//! session can never be observed online without being connected.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;

/// Capacity of each registry command queue
const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Capability surface the registry needs from a session.
///
/// Implemented by the session variants; the registry never inspects the
/// concrete type.
#[async_trait]
pub trait ManagedSession: Send + Sync {
    /// Process-unique connection serial, fixed at construction
    fn sid(&self) -> u64;

    /// Logical identity; 0 until authentication
    fn id(&self) -> u64;

    /// Whether the session's heartbeat is older than the timeout window
    fn is_heartbeat_timeout(&self, now: Instant) -> bool;

    /// Idempotent teardown; feeds an unregister back to the registry
    async fn close(self: Arc<Self>);
}

/// Registry configuration
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval between heartbeat-timeout sweeps
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
        }
    }
}

type SessionRef = Arc<dyn ManagedSession>;
type Table = RwLock<HashMap<u64, SessionRef>>;

struct Receivers {
    register_rx: mpsc::Receiver<SessionRef>,
    login_rx: mpsc::Receiver<SessionRef>,
    unregister_rx: mpsc::Receiver<SessionRef>,
}

/// The session registry.
///
/// Construct with [`SessionRegistry::new`], then spawn [`run`] to drive the
/// command loop and the periodic heartbeat sweep.
///
/// [`run`]: SessionRegistry::run
pub struct SessionRegistry {
    connected: Table,
    online: Table,
    register_tx: mpsc::Sender<SessionRef>,
    login_tx: mpsc::Sender<SessionRef>,
    unregister_tx: mpsc::Sender<SessionRef>,
    receivers: Mutex<Option<Receivers>>,
    shutdown: CancelToken,
    config: RegistryConfig,
}

impl SessionRegistry {
    /// Create a registry with its command queues
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        let (register_tx, register_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (login_tx, login_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);

        Arc::new(Self {
            connected: RwLock::new(HashMap::new()),
            online: RwLock::new(HashMap::new()),
            register_tx,
            login_tx,
            unregister_tx,
            receivers: Mutex::new(Some(Receivers {
                register_rx,
                login_rx,
                unregister_rx,
            })),
            shutdown: CancelToken::new(),
            config,
        })
    }

    /// Drive the serialized command loop and the heartbeat sweep.
    ///
    /// Runs until [`shutdown`](SessionRegistry::shutdown) is called. Calling
    /// `run` a second time is a logged no-op.
    pub async fn run(self: Arc<Self>) {
        let taken = self
            .receivers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut rx) = taken else {
            warn!("session registry loop already running");
            return;
        };

        let mut sweep = tokio::time::interval_at(
            Instant::now() + self.config.sweep_interval,
            self.config.sweep_interval,
        );
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(session) = rx.register_rx.recv() => self.apply_register(session),
                Some(session) = rx.login_rx.recv() => self.apply_login(session),
                Some(session) = rx.unregister_rx.recv() => self.apply_unregister(session),
                _ = sweep.tick() => self.timeout_sweep().await,
                _ = self.shutdown.cancelled() => {
                    info!("session registry shutting down");
                    break;
                }
            }
        }
    }

    /// Stop the command loop
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Request that a session be added to the connected table
    pub fn register(&self, session: SessionRef) {
        submit(&self.register_tx, "register", session);
    }

    /// Request promotion of a connected, authenticated session to online
    pub fn login(&self, session: SessionRef) {
        submit(&self.login_tx, "login", session);
    }

    /// Request removal from both tables
    pub fn unregister(&self, session: SessionRef) {
        submit(&self.unregister_tx, "unregister", session);
    }

    fn apply_register(&self, session: SessionRef) {
        let sid = session.sid();
        write(&self.connected).insert(sid, session);
        debug!(sid, "session registered");
    }

    fn apply_login(&self, session: SessionRef) {
        let sid = session.sid();
        if !read(&self.connected).contains_key(&sid) {
            debug!(sid, "login for unregistered session, ignoring");
            return;
        }

        let id = session.id();
        if id == 0 {
            warn!(sid, "login without authenticated id, ignoring");
            return;
        }

        write(&self.online).insert(id, session);
        info!(sid, id, "session online");
    }

    fn apply_unregister(&self, session: SessionRef) {
        let sid = session.sid();
        write(&self.connected).remove(&sid);

        let id = session.id();
        if id != 0 {
            let mut online = write(&self.online);
            // Only evict the online entry if it is this very session: a
            // reconnected successor under the same id must survive the old
            // session's teardown.
            let same = online.get(&id).map(|cur| cur.sid() == sid).unwrap_or(false);
            if same {
                online.remove(&id);
            }
        }

        debug!(sid, id, "session unregistered");
    }

    /// Close every connected session whose heartbeat has timed out.
    ///
    /// Iterates a snapshot of the connected table; each close feeds an
    /// unregister back through the command queue.
    pub async fn timeout_sweep(&self) {
        let now = Instant::now();
        let snapshot: Vec<SessionRef> = read(&self.connected).values().cloned().collect();

        let mut closed = 0usize;
        for session in snapshot {
            if session.is_heartbeat_timeout(now) {
                debug!(sid = session.sid(), "heartbeat timeout, closing session");
                session.close().await;
                closed += 1;
            }
        }

        if closed > 0 {
            info!(closed, "heartbeat sweep closed timed out sessions");
        }
    }

    /// Close every connected session
    pub async fn close_all(&self) {
        let snapshot: Vec<SessionRef> = read(&self.connected).values().cloned().collect();
        info!(count = snapshot.len(), "closing all sessions");
        for session in snapshot {
            session.close().await;
        }
    }

    /// Whether a session with this connection serial is connected
    pub fn is_connected(&self, sid: u64) -> bool {
        read(&self.connected).contains_key(&sid)
    }

    /// Whether a session is online under this id
    pub fn is_online(&self, id: u64) -> bool {
        read(&self.online).contains_key(&id)
    }

    /// Look up the online session for an id
    pub fn get_online(&self, id: u64) -> Option<SessionRef> {
        read(&self.online).get(&id).cloned()
    }

    /// Visit every online session; return `false` from the visitor to stop
    pub fn range<F>(&self, mut visit: F)
    where
        F: FnMut(u64, &SessionRef) -> bool,
    {
        for (id, session) in read(&self.online).iter() {
            if !visit(*id, session) {
                return;
            }
        }
    }

    /// Close the online session with this id, if any
    pub async fn disconnect(&self, id: u64) {
        if let Some(session) = self.get_online(id) {
            session.close().await;
        }
    }

    /// Number of connected sessions
    pub fn len(&self) -> usize {
        read(&self.connected).len()
    }

    /// Whether no sessions are connected
    pub fn is_empty(&self) -> bool {
        read(&self.connected).is_empty()
    }

    /// Number of online sessions
    pub fn online_len(&self) -> usize {
        read(&self.online).len()
    }
}

/// Non-blocking command submission: on a full queue the command is re-sent
/// from a detached task, so a submitter inside the handler loop (the sweep
/// closing sessions) can never deadlock against it.
fn submit(tx: &mpsc::Sender<SessionRef>, command: &'static str, session: SessionRef) {
    match tx.try_send(session) {
        Ok(()) => {}
        Err(TrySendError::Full(session)) => {
            warn!(command, "registry command queue full, deferring");
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(session).await;
            });
        }
        Err(TrySendError::Closed(_)) => {
            warn!(command, "registry command queue closed, dropping command");
        }
    }
}

fn read(table: &Table) -> RwLockReadGuard<'_, HashMap<u64, SessionRef>> {
    table.read().unwrap_or_else(|e| e.into_inner())
}

fn write(table: &Table) -> RwLockWriteGuard<'_, HashMap<u64, SessionRef>> {
    table.write().unwrap_or_else(|e| e.into_inner())
}
