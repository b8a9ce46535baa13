//! Daemon orchestrator for wiring together all components.
//!
//! The orchestrator builds the process engine and [`SessionManager`] from the
//! configuration, binds the control listeners (Unix socket, optional TCP,
//! optional WebSocket), and shuts everything down through one
//! [`CancellationToken`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::{AnyEngine, ProcessEngine};
use crate::ipc::{get_socket_path, serve_connection, IpcServer, TcpServer};
use crate::session::SessionManager;
use crate::transport::ws::{serve_ws_connection, WsServer};

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding listeners.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Owns the session manager and the listeners in front of it.
pub struct Orchestrator<E = AnyEngine> {
    config: Config,
    manager: SessionManager<E>,
    socket_path: PathBuf,
    state: Arc<RwLock<OrchestratorState>>,
    shutdown_token: CancellationToken,
    listeners: Vec<JoinHandle<()>>,
    tcp_addr: Option<SocketAddr>,
    ws_addr: Option<SocketAddr>,
}

impl Orchestrator<AnyEngine> {
    /// Validate `config` and build the engine it selects.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().context("Invalid configuration")?;
        let engine = AnyEngine::from_config(&config.engine);
        info!(engine = engine.name(), "Selected process engine");
        Ok(Self::with_engine(config, engine))
    }
}

impl<E: ProcessEngine> Orchestrator<E> {
    /// Build an orchestrator around an already constructed engine.
    pub fn with_engine(config: Config, engine: E) -> Self {
        let manager = SessionManager::from_config(Arc::new(engine), &config.session);
        let socket_path = config
            .daemon
            .socket_path
            .clone()
            .unwrap_or_else(get_socket_path);

        Self {
            config,
            manager,
            socket_path,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            shutdown_token: CancellationToken::new(),
            listeners: Vec::new(),
            tcp_addr: None,
            ws_addr: None,
        }
    }

    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    pub fn manager(&self) -> &SessionManager<E> {
        &self.manager
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bound TCP control address, once started.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Bound WebSocket address, once started.
    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_addr
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Bind every configured listener and start accepting.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }

        info!("Starting daemon orchestrator...");

        if let Err(e) = self.bind_listeners().await {
            self.shutdown_token.cancel();
            for handle in self.listeners.drain(..) {
                let _ = handle.await;
            }
            *self.state.write().await = OrchestratorState::Stopped;
            return Err(e);
        }

        *self.state.write().await = OrchestratorState::Running;
        info!("Daemon orchestrator started successfully");
        Ok(())
    }

    async fn bind_listeners(&mut self) -> Result<()> {
        let server = IpcServer::bind(&self.socket_path)
            .await
            .with_context(|| format!("Failed to bind control socket {:?}", self.socket_path))?;
        info!(path = ?self.socket_path, "Listening on control socket");
        self.listeners.push(tokio::spawn(run_unix_listener(
            server,
            self.manager.clone(),
            self.shutdown_token.clone(),
        )));

        if let Some(addr) = self.config.network.tcp_listen.clone() {
            let server = TcpServer::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind TCP listener {addr}"))?;
            let local = server.local_addr()?;
            info!(addr = %local, "Listening for TCP control connections");
            self.tcp_addr = Some(local);
            self.listeners.push(tokio::spawn(run_tcp_listener(
                server,
                self.manager.clone(),
                self.shutdown_token.clone(),
            )));
        }

        if let Some(addr) = self.config.network.ws_listen.clone() {
            let server = WsServer::bind(&addr)
                .await
                .with_context(|| format!("Failed to bind WebSocket listener {addr}"))?;
            let local = server.local_addr()?;
            info!(addr = %local, "Listening for WebSocket subscribers");
            self.ws_addr = Some(local);
            self.listeners.push(tokio::spawn(run_ws_listener(
                server,
                self.manager.clone(),
                self.shutdown_token.clone(),
            )));
        }

        Ok(())
    }

    /// Stop accepting, then close every session.
    pub async fn stop(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();
        for handle in self.listeners.drain(..) {
            if let Err(e) = handle.await {
                warn!("Listener task ended abnormally: {}", e);
            }
        }

        let closed = self.manager.shutdown_all().await;
        debug!(closed, "Closed sessions on shutdown");

        *self.state.write().await = OrchestratorState::Stopped;
        info!("Daemon orchestrator stopped");
        Ok(())
    }
}

async fn run_unix_listener<E: ProcessEngine>(
    server: IpcServer,
    manager: SessionManager<E>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = server.accept() => accepted,
        };
        match accepted {
            Ok(conn) => {
                let manager = manager.clone();
                let shutdown = shutdown.child_token();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(conn, manager, shutdown).await {
                        debug!("Control connection ended with error: {}", e);
                    }
                });
            }
            Err(e) => warn!("Failed to accept control connection: {}", e),
        }
    }
    debug!("Control socket listener stopped");
}

async fn run_tcp_listener<E: ProcessEngine>(
    server: TcpServer,
    manager: SessionManager<E>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = server.accept() => accepted,
        };
        match accepted {
            Ok((conn, peer)) => {
                debug!(peer = %peer, "Accepted TCP control connection");
                let manager = manager.clone();
                let shutdown = shutdown.child_token();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(conn, manager, shutdown).await {
                        debug!(peer = %peer, "TCP control connection ended with error: {}", e);
                    }
                });
            }
            Err(e) => warn!("Failed to accept TCP connection: {}", e),
        }
    }
    debug!("TCP listener stopped");
}

async fn run_ws_listener<E: ProcessEngine>(
    server: WsServer,
    manager: SessionManager<E>,
    shutdown: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = server.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let manager = manager.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_ws_connection(stream, manager).await {
                        debug!(peer = %peer, "WebSocket connection ended with error: {}", e);
                    }
                });
            }
            Err(e) => warn!("Failed to accept WebSocket connection: {}", e),
        }
    }
    debug!("WebSocket listener stopped");
}
