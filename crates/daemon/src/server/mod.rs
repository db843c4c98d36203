//! Encode server orchestrator.
//!
//! A single command loop owns the queue, the catalog and the worker pool.
//! Client commands, worker completions and the background loops all arrive
//! as [`Command`]s on one channel and are applied strictly in order; events
//! are broadcast from inside the loop right after each mutation, so every
//! client sees state changes in the order they were made.

mod events;
mod handlers;
mod loops;

pub use events::{ServerEvents, CONSOLE_HISTORY};
pub use loops::{parse_logo_name, DirWatcher, WatchEvent};

use crate::config::Config;
use crate::encode::{CommandEncoder, Encoder};
use crate::hook::{AddHook, ScriptHook};
use crate::probe::{CommandProber, Prober};
use crate::rpc::{serve, ClientHub, ClientMessage, Inbound, ServerMessage};
use crate::status::{new_shared_status, SharedStatus};
use crate::status_server::run_status_server;
use crate::worker::WorkerOutcome;
use crate::catalog::DataPaths;
use handlers::ServerState;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Commands buffered ahead of the command loop.
const COMMAND_QUEUE: usize = 256;

/// Work for the command loop.
#[derive(Debug)]
pub enum Command {
    Client(Inbound),
    WorkerFinished(WorkerOutcome),
    FilesChanged(Vec<WatchEvent>),
    Persist,
    PruneLogs,
    /// Entering (`true`) or leaving the quiet-hours window.
    QuietHours(bool),
    /// Stop now, even with workers still running.
    Shutdown,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to prepare data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// External programs the server drives.
#[derive(Clone)]
pub struct Collaborators {
    pub prober: Arc<dyn Prober>,
    pub encoder: Arc<dyn Encoder>,
    pub hook: Arc<dyn AddHook>,
}

impl Collaborators {
    /// The real programs named in the configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            prober: Arc::new(CommandProber::new(&config.encoder.prober)),
            encoder: Arc::new(CommandEncoder::new(&config.encoder.executable)),
            hook: Arc::new(ScriptHook::new(&config.encoder.hook_dir)),
        }
    }
}

pub struct EncodeServer {
    config: Config,
    collaborators: Collaborators,
    status: SharedStatus,
    shutdown: CancellationToken,
}

impl EncodeServer {
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        Self {
            config,
            collaborators,
            status: new_shared_status(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Cancel to drain and stop the server, like an `EndServer` command.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Bind the RPC listener on the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = format!("{}:{}", self.config.server.bind, self.config.server.port);
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Serve clients on `listener` until the server is ended.
    pub async fn run(self, listener: TcpListener) -> Result<(), ServerError> {
        let paths = DataPaths::new(&self.config.server.data_dir);
        for dir in [
            paths.root.clone(),
            paths.profile_dir(),
            paths.logo_dir(),
            paths.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .map_err(|source| ServerError::DataDir { path: dir.clone(), source })?;
        }

        let hub = ClientHub::new();
        let events = Arc::new(ServerEvents::new(hub.clone()));
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (inbound_tx, inbound_rx) = mpsc::channel(COMMAND_QUEUE);
        let stop_tasks = CancellationToken::new();

        let mut state = ServerState::new(
            &self.config,
            paths.clone(),
            events,
            self.collaborators,
            cmd_tx.clone(),
            self.status.clone(),
        );

        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "rpc listening");
        }
        tokio::spawn(serve(listener, hub.clone(), inbound_tx, stop_tasks.clone()));
        tokio::spawn(route_inbound(
            inbound_rx,
            cmd_tx.clone(),
            state.add_cancel(),
            hub.clone(),
        ));

        let persistence = &self.config.persistence;
        tokio::spawn(loops::persistence_loop(
            cmd_tx.clone(),
            Duration::from_secs(persistence.save_interval_secs.max(1)),
            state.persist_wake(),
            stop_tasks.clone(),
        ));
        tokio::spawn(loops::watch_loop(
            cmd_tx.clone(),
            DirWatcher::new(paths.logo_dir(), paths.profile_dir()),
            Duration::from_secs(persistence.watch_interval_secs.max(1)),
            stop_tasks.clone(),
        ));
        tokio::spawn(loops::quiet_hours_loop(
            cmd_tx.clone(),
            state.quiet_window(),
            stop_tasks.clone(),
        ));
        tokio::spawn(loops::prune_loop(cmd_tx.clone(), stop_tasks.clone()));
        tokio::spawn(loops::system_metrics_loop(
            self.status.clone(),
            stop_tasks.clone(),
        ));

        let status_bind = self.config.server.status_bind.clone();
        if !status_bind.is_empty() {
            let status = self.status.clone();
            let stop = stop_tasks.clone();
            tokio::spawn(async move {
                if let Err(e) = run_status_server(&status_bind, status, stop).await {
                    error!(error = %e, "status endpoint stopped");
                }
            });
        }
        drop(cmd_tx);

        state.run(cmd_rx, self.shutdown).await;

        stop_tasks.cancel();
        hub.close_all();
        info!("server stopped");
        Ok(())
    }
}

/// Forward client commands to the command loop. `CancelAddQueue` is acted
/// on right here, since the command loop is busy with the add it cancels.
async fn route_inbound(
    mut inbound: mpsc::Receiver<Inbound>,
    tx: mpsc::Sender<Command>,
    add_cancel: Arc<Mutex<CancellationToken>>,
    hub: ClientHub,
) {
    while let Some(msg) = inbound.recv().await {
        if let ClientMessage::CancelAddQueue(req) = &msg.message {
            info!(client = msg.client, "add cancel requested");
            add_cancel.lock().cancel();
            if let Some(id) = &req.request_id {
                hub.send_to(msg.client, &ServerMessage::add_result(Some(id.clone())));
            }
            continue;
        }
        if tx.send(Command::Client(msg)).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests;
