//! Gate daemon binary.
//!
//! Composition root for the session runtime: worker pool, session registry,
//! and the TCP accept loop behind a small CLI. Inbound frames are echoed
//! back through the worker pool, the default behavior until an embedding
//! application supplies its own hook set.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use gate_session::{
    RegistryConfig, SessionHooks, SessionRegistry, StreamConfig, StreamSession,
};
use gate_wire::encode_frame;
use gate_workers::{Task, WorkerPool, WorkerPoolConfig};

mod config;

use config::GateConfig;

/// Connection gateway daemon
#[derive(Parser, Debug)]
#[command(name = "gate", version, about = "Connection gateway daemon")]
struct Args {
    /// Path to the YAML config file
    #[arg(long, default_value = "gate.yaml")]
    config: PathBuf,

    /// Listen address, e.g. 0.0.0.0:7001 (overrides config file)
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Per-write deadline, e.g. 10s
    #[arg(long, default_value = "10s")]
    write_timeout: humantime::Duration,

    /// Worker idle window before reclamation, e.g. 5m
    #[arg(long, default_value = "5m")]
    worker_idle_window: humantime::Duration,

    /// Registry heartbeat sweep interval, e.g. 30s
    #[arg(long, default_value = "30s")]
    sweep_interval: humantime::Duration,
}

/// Default hook set: echo every frame back, dispatched through the pool.
struct EchoHooks {
    pool: Arc<WorkerPool>,
    max_frame_size: usize,
}

#[async_trait]
impl SessionHooks<StreamSession> for EchoHooks {
    async fn on_start(&self, session: &Arc<StreamSession>) {
        info!(sid = session.sid(), peer = ?session.peer_addr(), "session started");
    }

    async fn on_recv(&self, session: &Arc<StreamSession>, data: Bytes) {
        let task = EchoTask {
            session: Arc::clone(session),
            data,
            max_frame_size: self.max_frame_size,
        };
        if let Err(e) = self.pool.assign(Box::new(task)) {
            warn!(sid = session.sid(), error = %e, "echo task dropped");
        }
    }

    async fn on_stop(&self, session: &Arc<StreamSession>) {
        let stats = session.stats();
        info!(
            sid = session.sid(),
            bytes_in = stats.bytes_in,
            bytes_out = stats.bytes_out,
            frames_in = stats.frames_in,
            frames_out = stats.frames_out,
            "session stopped"
        );
    }
}

struct EchoTask {
    session: Arc<StreamSession>,
    data: Bytes,
    max_frame_size: usize,
}

#[async_trait]
impl Task for EchoTask {
    async fn run(self: Box<Self>) {
        let reply = self.data;
        let max = self.max_frame_size;
        if let Err(e) = self
            .session
            .send_msg(|| encode_frame(&reply, max).map_err(Into::into))
        {
            warn!(sid = self.session.sid(), error = %e, "echo reply dropped");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_level)?)
        .init();

    let mut config = GateConfig::load_from_file(&args.config)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let pool = Arc::new(WorkerPool::new(WorkerPoolConfig {
        min_workers: config.min_workers,
        max_workers: config.max_workers,
        idle_window: args.worker_idle_window.into(),
        ..WorkerPoolConfig::default()
    }));
    pool.start();

    let registry = SessionRegistry::new(RegistryConfig {
        sweep_interval: args.sweep_interval.into(),
    });
    tokio::spawn(Arc::clone(&registry).run());

    let stream_config = StreamConfig {
        max_frame_size: config.max_frame_size,
        write_timeout: args.write_timeout.into(),
        ..StreamConfig::default()
    };
    let hooks = Arc::new(EchoHooks {
        pool: Arc::clone(&pool),
        max_frame_size: config.max_frame_size,
    });

    let listener = TcpListener::bind(config.listen).await?;
    info!(listen = %config.listen, "gate listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    let session = StreamSession::with_registry(
                        stream,
                        Arc::clone(&hooks) as Arc<dyn SessionHooks<StreamSession>>,
                        stream_config.clone(),
                        Arc::clone(&registry),
                    );
                    session.start().await;
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    registry.close_all().await;
    registry.shutdown();
    pool.stop();
    info!("gate stopped");

    Ok(())
}
