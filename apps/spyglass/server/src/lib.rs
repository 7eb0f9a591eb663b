//! Spyglass rendezvous server.
//!
//! Peers open plain TCP connections to one port and identify themselves with
//! a role tag. Targets register a primary connection under an access code and
//! later attach screen, controller and keylogger components on demand;
//! watchers register their own primary and open matching components that the
//! server relays to and from the target's.

pub mod acceptor;
pub mod cli;
pub mod config;
pub mod error;
pub mod feeds;
pub mod file_server;
pub mod imaging;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod session;
pub mod target;
pub mod watcher;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use spyglass_core::FrameCodec;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub use config::{FileServerConfig, ServerConfig, SessionSettings};
pub use error::HandlerError;
pub use registry::Registry;

/// Any byte stream a peer can be served over.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> PeerStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// State shared by every connection task.
pub struct ServerContext {
    pub codec: FrameCodec,
    pub settings: SessionSettings,
    pub registry: Registry,
    pub shutdown: CancellationToken,
}

impl ServerContext {
    pub fn new(codec: FrameCodec, settings: SessionSettings) -> Self {
        Self {
            codec,
            settings,
            registry: Registry::new(),
            shutdown: CancellationToken::new(),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    config: ServerConfig,
    context: Arc<ServerContext>,
}

impl Server {
    /// Binds the main listener. Failing here aborts startup.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| format!("failed to bind listener on {}", config.listen_addr))?;
        let context = Arc::new(ServerContext::new(config.codec, config.session));
        Ok(Self {
            listener,
            config,
            context,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    pub fn context(&self) -> Arc<ServerContext> {
        self.context.clone()
    }

    /// Cancelling this token stops the accept loop and every session.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.context.shutdown.clone()
    }

    pub async fn run(self) -> Result<()> {
        let Server {
            listener,
            config,
            context,
        } = self;

        if let Some(file_server) = config.file_server.clone() {
            tokio::spawn(file_server::serve(file_server, context.shutdown.clone()));
        }

        info!(
            listen_addr = %config.listen_addr,
            header_width = context.codec.header_width(),
            image_mode = context.settings.image_mode.as_str(),
            "spyglass server accepting connections"
        );
        acceptor::run(listener, context).await;
        Ok(())
    }
}
