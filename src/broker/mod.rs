//! Broker daemon — agent connections, session relay, logout fan-out.
//!
//! The broker accepts remote agents over TCP and local control clients
//! over a Unix domain socket. Agents register a (node, client, user)
//! binding; control clients ask for sessions to be relayed to a user's
//! agents or for a user to be logged out everywhere.
//!
//! Architecture: channel-based actor. A single broker loop owns all
//! mutable state ([`state::BrokerState`]). Per-connection tasks forward
//! inbound messages through a [`handle::BrokerHandle`] and write whatever
//! the loop queues on their outbound channel. Session relay, logout and
//! control requests run as spawned tasks that reach the loop through the
//! same handle and never touch the registry directly.

pub mod ack;
pub mod config;
pub mod connection;
pub mod handle;
mod handler;
pub mod hierarchy;
pub mod liveness;
mod registration;
pub mod registry;
pub mod state;

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use config::BrokerConfig;
use connection::Outgoing;
use handle::{BrokerCommand, BrokerHandle};
use handler::{ControlRequest, Followup};
use hierarchy::{HierarchyAssigner, NoHierarchy};
use state::{BrokerState, ConnectionId};

use crate::ipc::protocol::{Message, Status};
use crate::session::origin::{HttpOriginClient, OriginSiteClient};
use crate::session::service::SessionService;
use crate::session::store::{MemorySessionStore, SessionBlob, SessionStore};

/// Broker startup/runtime errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("$XDG_RUNTIME_DIR is not set")]
    NoRuntimeDir,
    #[error("broker already running at {0}")]
    AlreadyRunning(PathBuf),
    #[error("failed to create directory {path}: {source}")]
    MkdirFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to bind socket {path}: {source}")]
    BindFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to listen on {addr}: {source}")]
    ListenFailed {
        addr: SocketAddr,
        source: std::io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Sockets the broker loop accepts on. Either may be absent.
#[derive(Debug, Default)]
pub struct Listeners {
    pub agents: Option<TcpListener>,
    pub control: Option<UnixListener>,
}

/// The broker loop and the state it owns.
pub struct Broker {
    state: BrokerState,
    cmd_tx: mpsc::UnboundedSender<BrokerCommand>,
    cmd_rx: mpsc::UnboundedReceiver<BrokerCommand>,
    sweep_interval: Duration,
    service: Arc<SessionService>,
    assigner: Arc<dyn HierarchyAssigner>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        store: Arc<dyn SessionStore>,
        origin: Arc<dyn OriginSiteClient>,
        assigner: Arc<dyn HierarchyAssigner>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let service = Arc::new(SessionService::new(
            BrokerHandle::new(cmd_tx.clone()),
            &config,
            store,
            origin,
        ));
        Self {
            state: BrokerState::new(&config),
            cmd_tx,
            cmd_rx,
            sweep_interval: config.sweep_interval.max(Duration::from_millis(100)),
            service,
            assigner,
        }
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle::new(self.cmd_tx.clone())
    }

    pub fn service(&self) -> Arc<SessionService> {
        Arc::clone(&self.service)
    }

    /// Run the loop until `shutdown` resolves.
    ///
    /// Dropping the state on exit drops every outbound queue, which ends
    /// all connection tasks.
    pub async fn run(self, listeners: Listeners, shutdown: impl Future<Output = ()>) {
        let Broker {
            mut state,
            cmd_tx,
            mut cmd_rx,
            sweep_interval,
            service,
            assigner,
        } = self;
        let tasks = Tasks {
            handle: BrokerHandle::new(cmd_tx),
            service,
            assigner,
        };

        let mut sweep =
            tokio::time::interval_at(tokio::time::Instant::now() + sweep_interval, sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                // -- New agent connection --
                result = accept_agent(listeners.agents.as_ref()) => {
                    match result {
                        Ok((stream, addr)) => {
                            let _ = stream.set_nodelay(true);
                            let conn_id = ConnectionId::new();
                            connection::spawn_connection(stream, conn_id, tasks.handle.clone());
                            tracing::debug!(%conn_id, %addr, "accepted agent connection");
                        }
                        Err(e) => tracing::warn!(error = %e, "agent accept failed"),
                    }
                }

                // -- New control connection --
                result = accept_control(listeners.control.as_ref()) => {
                    match result {
                        Ok(stream) => {
                            let conn_id = ConnectionId::new();
                            connection::spawn_connection(stream, conn_id, tasks.handle.clone());
                            tracing::debug!(%conn_id, "accepted control connection");
                        }
                        Err(e) => tracing::warn!(error = %e, "control accept failed"),
                    }
                }

                // -- Command from a connection task or a handle --
                Some(cmd) = cmd_rx.recv() => {
                    handle_command(&mut state, cmd, &tasks);
                }

                // -- Periodic liveness sweep --
                _ = sweep.tick() => {
                    let removed = state.sweep(Instant::now());
                    if removed > 0 {
                        tracing::info!(removed, "swept stale connections");
                    }
                }

                _ = &mut shutdown => break,
            }
        }
        tracing::debug!(bound = state.registry().len(), "broker loop stopped");
    }
}

async fn accept_agent(listener: Option<&TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(l) => l.accept().await,
        None => std::future::pending().await,
    }
}

async fn accept_control(listener: Option<&UnixListener>) -> std::io::Result<UnixStream> {
    match listener {
        Some(l) => l.accept().await.map(|(stream, _)| stream),
        None => std::future::pending().await,
    }
}

/// What spawned followups need from the loop.
struct Tasks {
    handle: BrokerHandle,
    service: Arc<SessionService>,
    assigner: Arc<dyn HierarchyAssigner>,
}

impl Tasks {
    fn spawn(&self, followup: Followup) {
        match followup {
            Followup::AutoRelay { user_id } => {
                let service = Arc::clone(&self.service);
                tokio::spawn(async move {
                    match service.relay_for_user(&user_id).await {
                        Ok(outcome) => tracing::debug!(%user_id, %outcome, "auto relay finished"),
                        Err(e) => tracing::warn!(%user_id, error = %e, "auto relay failed"),
                    }
                });
            }
            Followup::AssignHierarchy {
                connection_id,
                node_id,
                client_id,
            } => {
                let assigner = Arc::clone(&self.assigner);
                let handle = self.handle.clone();
                tokio::spawn(async move {
                    let Some(assignment) = assigner.assign(&node_id, &client_id).await else {
                        return;
                    };
                    match handle.apply_hierarchy(connection_id, assignment).await {
                        Ok(true) => tracing::debug!(conn_id = %connection_id, %node_id, "hierarchy assigned"),
                        Ok(false) => tracing::debug!(conn_id = %connection_id, "connection gone before hierarchy assignment"),
                        Err(e) => tracing::debug!(error = %e, "hierarchy assignment dropped"),
                    }
                });
            }
            Followup::Control {
                reply_to,
                id,
                request,
            } => {
                let service = Arc::clone(&self.service);
                tokio::spawn(async move {
                    let reply = execute_control(&service, id, request).await;
                    let _ = reply_to.send(Outgoing::Message(reply));
                });
            }
        }
    }
}

fn handle_command(state: &mut BrokerState, cmd: BrokerCommand, tasks: &Tasks) {
    let now = Instant::now();
    match cmd {
        BrokerCommand::Attach {
            connection_id,
            outbound,
        } => state.attach(connection_id, outbound, now),
        BrokerCommand::Inbound {
            connection_id,
            message,
        } => {
            if !state.is_attached(connection_id) {
                return;
            }
            for followup in handler::handle_message(state, connection_id, message, now) {
                tasks.spawn(followup);
            }
        }
        BrokerCommand::Detach { connection_id } => match state.detach(connection_id) {
            Some(record) => tracing::info!(
                conn_id = %connection_id,
                node_id = %record.node_id,
                client_id = %record.client_id,
                "bound connection closed"
            ),
            None => tracing::debug!(conn_id = %connection_id, "connection cleaned up"),
        },
        BrokerCommand::ConnectionsFor { user_id, reply } => {
            let _ = reply.send(state.connections_for(&user_id, now));
        }
        BrokerCommand::DispatchRelay {
            user_id,
            session_payload,
            reply,
        } => {
            let _ = reply.send(state.dispatch_relay(&user_id, &session_payload, now));
        }
        BrokerCommand::DispatchLogout { user_id, reply } => {
            let _ = reply.send(state.dispatch_logout(&user_id, now));
        }
        BrokerCommand::Evict {
            connection_ids,
            reason,
            reply,
        } => {
            let _ = reply.send(state.evict(&connection_ids, &reason));
        }
        BrokerCommand::ApplyHierarchy {
            connection_id,
            assignment,
            reply,
        } => {
            let _ = reply.send(state.apply_hierarchy(connection_id, &assignment, true));
        }
        BrokerCommand::ListConnections { user_id, reply } => {
            let _ = reply.send(state.describe(user_id.as_deref()));
        }
    }
}

async fn execute_control(service: &SessionService, id: u32, request: ControlRequest) -> Message {
    match request {
        ControlRequest::RelayNow { user_id } => match service.relay_for_user(&user_id).await {
            Ok(outcome) => Message::Response {
                id,
                status: Status::Ok,
                error: None,
                connections: None,
                outcome: Some(outcome.as_str().to_owned()),
                delivered: None,
                missing: None,
            },
            Err(e) => Message::failure(id, e.to_string()),
        },
        ControlRequest::Logout { user_id } => match service.logout_user(&user_id).await {
            Ok(summary) => Message::Response {
                id,
                status: Status::Ok,
                error: None,
                connections: None,
                outcome: None,
                delivered: Some(wire_count(summary.delivered)),
                missing: Some(wire_count(summary.missing)),
            },
            Err(e) => Message::failure(id, e.to_string()),
        },
        ControlRequest::StoreSession {
            user_id,
            username,
            session_payload,
        } => {
            let blob = SessionBlob {
                user_id,
                username,
                payload: session_payload,
            };
            match service.store_session(blob).await {
                Ok(()) => Message::ok(id),
                Err(e) => Message::failure(id, e.to_string()),
            }
        }
    }
}

/// Counts go over the wire as `u32`; larger values saturate.
fn wire_count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Run the broker daemon until SIGTERM or SIGINT.
///
/// # Errors
///
/// Returns `BrokerError` if the control socket path cannot be resolved
/// or bound, another broker is already running, or the agent listener
/// cannot be bound.
pub async fn run(config: BrokerConfig) -> Result<(), BrokerError> {
    let (socket_path, dedicated_dir) = match &config.control_socket {
        Some(path) => (path.clone(), false),
        None => (resolve_socket_path()?, true),
    };
    let control = bind_socket(&socket_path, dedicated_dir).await?;
    let agents = TcpListener::bind(config.listen)
        .await
        .map_err(|source| BrokerError::ListenFailed {
            addr: config.listen,
            source,
        })?;

    tracing::info!(
        listen = %config.listen,
        control = %socket_path.display(),
        "broker listening"
    );

    let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    let origin: Arc<dyn OriginSiteClient> = Arc::new(HttpOriginClient::new(config.origin.clone()));
    let assigner: Arc<dyn HierarchyAssigner> = match &config.hierarchy {
        Some(fixed) if !fixed.is_empty() => Arc::new(fixed.clone()),
        _ => Arc::new(NoHierarchy),
    };

    // Graceful shutdown on SIGTERM or SIGINT.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
    };

    Broker::new(config, store, origin, assigner)
        .run(
            Listeners {
                agents: Some(agents),
                control: Some(control),
            },
            shutdown,
        )
        .await;

    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::warn!(error = %e, path = %socket_path.display(), "failed to remove socket");
    }

    tracing::info!("broker stopped");
    Ok(())
}

// -- Socket setup --

/// Default control socket path under `$XDG_RUNTIME_DIR`.
pub fn resolve_socket_path() -> Result<PathBuf, BrokerError> {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR").map_err(|_| BrokerError::NoRuntimeDir)?;
    Ok(PathBuf::from(runtime_dir)
        .join("relayd")
        .join("control.sock"))
}

/// Create the socket directory and bind the Unix listener.
///
/// A `dedicated_dir` is forced to mode 0700 even if it already existed.
/// On EADDRINUSE the existing socket is probed: a live one means another
/// broker is running, a dead one is stale and gets replaced.
async fn bind_socket(path: &Path, dedicated_dir: bool) -> Result<UnixListener, BrokerError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| BrokerError::MkdirFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        if dedicated_dir {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700)).map_err(
                |e| BrokerError::MkdirFailed {
                    path: parent.to_path_buf(),
                    source: e,
                },
            )?;
        }
    }

    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            match UnixStream::connect(path).await {
                Ok(_) => Err(BrokerError::AlreadyRunning(path.to_path_buf())),
                Err(_) => {
                    tracing::info!(path = %path.display(), "removing stale socket");
                    std::fs::remove_file(path).map_err(|e| BrokerError::BindFailed {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                    UnixListener::bind(path).map_err(|e| BrokerError::BindFailed {
                        path: path.to_path_buf(),
                        source: e,
                    })
                }
            }
        }
        Err(e) => Err(BrokerError::BindFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}
