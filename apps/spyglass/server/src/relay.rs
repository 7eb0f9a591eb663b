//! Loops that move data from a target component to a watcher component.
//!
//! Every loop watches three liveness signals besides its own socket: the
//! watch token (STOP_WATCHING, watcher primary gone, shutdown), the target
//! component's stop token (marked for stop, target primary gone) and the
//! watcher's inbound stream. Polls are bounded by `relay_poll_interval`, so a
//! vanished peer is noticed without waiting on a blocking read.

use bytes::Bytes;
use spyglass_core::{Component, ControlEvent, FrameError, FrameReader, FrameWriter, Reply};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SessionSettings;
use crate::error::HandlerError;
use crate::feeds::{ControlQueue, KeyFeed, ScreenFeed};
use crate::metrics;

/// Frames read from a peer on a background task, so handlers can select on
/// them without losing half-read frames.
pub struct Inbound {
    rx: mpsc::Receiver<Result<Bytes, FrameError>>,
    task: JoinHandle<()>,
}

impl Inbound {
    pub fn spawn<R>(mut reader: FrameReader<R>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(async move {
            loop {
                let item = match reader.recv().await {
                    Ok(Some(payload)) => Ok(payload),
                    Ok(None) => return,
                    Err(err) => Err(err),
                };
                let failed = item.is_err();
                if tx.send(item).await.is_err() || failed {
                    return;
                }
            }
        });
        Self { rx, task }
    }

    /// `Ok(None)` once the watcher has gone away.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, HandlerError> {
        match self.rx.recv().await {
            Some(Ok(payload)) => Ok(Some(payload)),
            Some(Err(err)) if err.is_disconnect() => Ok(None),
            Some(Err(err)) => Err(err.into()),
            None => Ok(None),
        }
    }
}

impl Drop for Inbound {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sends each new screen frame once, pausing after every `ack_interval`
/// frames until the watcher acknowledges. At most one ack is banked ahead.
pub async fn screen<W>(
    writer: &mut FrameWriter<W>,
    inbound: &mut Inbound,
    feed: &ScreenFeed,
    stop: &CancellationToken,
    watch: &CancellationToken,
    settings: &SessionSettings,
) -> Result<(), HandlerError>
where
    W: AsyncWrite + Unpin,
{
    let mut poll = interval(settings.relay_poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_sent = 0u64;
    let mut unacked = 0u32;
    let mut acked = false;

    loop {
        tokio::select! {
            _ = watch.cancelled() => return Ok(()),
            _ = stop.cancelled() => return Ok(()),
            frame = inbound.recv() => match frame? {
                Some(payload) => {
                    if Reply::is_ack(&payload) {
                        acked = true;
                    } else {
                        debug!(len = payload.len(), "ignoring non-ack frame from watcher screen reader");
                    }
                    continue;
                }
                None => return Ok(()),
            },
            _ = poll.tick() => {}
        }

        if unacked >= settings.ack_interval {
            if !acked {
                continue;
            }
            acked = false;
            unacked = 0;
        }
        if feed.freshness() == last_sent {
            continue;
        }

        let (freshness, frame) = feed.snapshot();
        writer.send(&frame).await?;
        last_sent = freshness;
        unacked += 1;
        metrics::FRAMES_RELAYED
            .with_label_values(&[Component::ScreenReader.as_str()])
            .inc();
    }
}

/// Decodes control events from the watcher and queues them for the target.
pub async fn controller(
    inbound: &mut Inbound,
    queue: &ControlQueue,
    stop: &CancellationToken,
    watch: &CancellationToken,
) -> Result<(), HandlerError> {
    loop {
        let payload = tokio::select! {
            _ = watch.cancelled() => return Ok(()),
            _ = stop.cancelled() => return Ok(()),
            frame = inbound.recv() => match frame? {
                Some(payload) if !payload.is_empty() => payload,
                _ => return Ok(()),
            },
        };
        let event = ControlEvent::decode(&payload)?;
        if !queue.push(event) {
            debug!("target controller went away while queueing");
            return Ok(());
        }
        metrics::CONTROL_EVENTS_QUEUED.inc();
    }
}

/// Forwards each ready key batch once and clears the ready flag.
pub async fn keylogger<W>(
    writer: &mut FrameWriter<W>,
    inbound: &mut Inbound,
    feed: &KeyFeed,
    stop: &CancellationToken,
    watch: &CancellationToken,
    settings: &SessionSettings,
) -> Result<(), HandlerError>
where
    W: AsyncWrite + Unpin,
{
    let mut poll = interval(settings.relay_poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = watch.cancelled() => return Ok(()),
            _ = stop.cancelled() => return Ok(()),
            frame = inbound.recv() => match frame? {
                Some(_) => continue,
                None => return Ok(()),
            },
            _ = poll.tick() => {}
        }
        if let Some(batch) = feed.take() {
            writer.send(&batch).await?;
            metrics::FRAMES_RELAYED
                .with_label_values(&[Component::Keylogger.as_str()])
                .inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spyglass_core::{DeviceEvent, FrameCodec, FramedChannel, MouseButton};
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    fn settings() -> SessionSettings {
        SessionSettings {
            ack_interval: 2,
            relay_poll_interval: Duration::from_millis(5),
            ..SessionSettings::default()
        }
    }

    #[tokio::test]
    async fn screen_relay_sends_each_frame_once_and_waits_for_acks() {
        let (server_side, watcher_side) = duplex(64 * 1024);
        let (reader, mut writer) = FramedChannel::new(server_side, FrameCodec::default()).into_split();
        let mut watcher = FramedChannel::new(watcher_side, FrameCodec::default());
        let mut inbound = Inbound::spawn(reader);

        let feed = std::sync::Arc::new(ScreenFeed::default());
        let stop = CancellationToken::new();
        let watch = CancellationToken::new();

        let relay = {
            let feed = feed.clone();
            let stop = stop.clone();
            let watch = watch.clone();
            tokio::spawn(async move {
                screen(&mut writer, &mut inbound, &feed, &stop, &watch, &settings()).await
            })
        };

        for n in 1..=2u8 {
            feed.publish(Bytes::from(vec![n]));
            let got = timeout(Duration::from_secs(1), watcher.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(got.as_ref(), &[n]);
        }

        // third frame is held back until the ack arrives
        feed.publish(Bytes::from_static(&[3]));
        assert!(timeout(Duration::from_millis(60), watcher.recv()).await.is_err());
        watcher.send(b"OK").await.unwrap();
        let got = timeout(Duration::from_secs(1), watcher.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.as_ref(), &[3]);

        stop.cancel();
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn early_acks_and_junk_do_not_lift_pacing() {
        let (server_side, watcher_side) = duplex(64 * 1024);
        let (reader, mut writer) = FramedChannel::new(server_side, FrameCodec::default()).into_split();
        let mut watcher = FramedChannel::new(watcher_side, FrameCodec::default());
        let mut inbound = Inbound::spawn(reader);

        let feed = std::sync::Arc::new(ScreenFeed::default());
        let stop = CancellationToken::new();
        let watch = CancellationToken::new();
        let relay = {
            let feed = feed.clone();
            let stop = stop.clone();
            let watch = watch.clone();
            tokio::spawn(async move {
                screen(&mut writer, &mut inbound, &feed, &stop, &watch, &settings()).await
            })
        };

        for _ in 0..3 {
            watcher.send(b"OK").await.unwrap();
        }

        // one banked ack releases exactly one extra batch
        for n in 1..=4u8 {
            feed.publish(Bytes::from(vec![n]));
            let got = timeout(Duration::from_secs(1), watcher.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(got.as_ref(), &[n]);
        }

        feed.publish(Bytes::from_static(&[5]));
        assert!(timeout(Duration::from_millis(60), watcher.recv()).await.is_err());
        watcher.send(b"xx").await.unwrap();
        assert!(timeout(Duration::from_millis(60), watcher.recv()).await.is_err());

        watcher.send(b"OK").await.unwrap();
        let got = timeout(Duration::from_secs(1), watcher.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(got.as_ref(), &[5]);

        stop.cancel();
        relay.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn watcher_hangup_ends_the_relay() {
        let (server_side, watcher_side) = duplex(1024);
        let (reader, mut writer) = FramedChannel::new(server_side, FrameCodec::default()).into_split();
        let mut inbound = Inbound::spawn(reader);
        drop(watcher_side);

        let feed = KeyFeed::default();
        let never = CancellationToken::new();
        timeout(
            Duration::from_secs(1),
            keylogger(&mut writer, &mut inbound, &feed, &never, &never, &settings()),
        )
        .await
        .expect("relay should notice the hangup")
        .unwrap();
    }

    #[tokio::test]
    async fn controller_relay_rejects_malformed_events() {
        let (server_side, watcher_side) = duplex(1024);
        let (reader, _writer) = FramedChannel::new(server_side, FrameCodec::default()).into_split();
        let mut watcher = FramedChannel::new(watcher_side, FrameCodec::default());
        let mut inbound = Inbound::spawn(reader);

        let (feed, inbox) = crate::feeds::ComponentFeed::new(
            Component::Controller,
            CancellationToken::new(),
        );
        let mut inbox = inbox.unwrap();
        let crate::feeds::FeedState::Controller(queue) = feed.state() else {
            panic!("expected a control queue");
        };

        let click = ControlEvent::Mouse {
            event: DeviceEvent::MouseDown,
            button: MouseButton::Left,
            x: 0.5,
            y: 0.5,
        };
        watcher.send(&click.encode()).await.unwrap();
        watcher.send(&[0x07, 0x00]).await.unwrap();

        let never = CancellationToken::new();
        let result = controller(&mut inbound, queue, &never, &never).await;
        assert!(matches!(result, Err(HandlerError::Protocol(_))));
        assert_eq!(inbox.try_recv().unwrap(), click);
    }
}
