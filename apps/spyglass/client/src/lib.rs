//! Peer-side helpers for talking to a Spyglass rendezvous server.
//!
//! These cover the handshakes (role tag, access codes, admission reply) and
//! the request/response exchanges on the primary connections. Payload
//! production (screen capture, input injection) is left to the caller.

use bytes::Bytes;
use spyglass_core::{
    AccessCode, Action, Component, ComponentPresence, ControlEvent, FrameCodec, FrameError,
    FramedChannel, KeyBatch, Reason, RecordError, Reply, ReplyError, Role, Side, TargetList,
};
use thiserror::Error;
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Reply(#[from] ReplyError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error("server refused admission: {}", .0.as_str())]
    Rejected(Reason),
    #[error("server closed the connection")]
    Disconnected,
    #[error("unexpected frame: {0}")]
    Unexpected(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Connection settings shared by every handle opened against one server.
#[derive(Debug, Clone)]
pub struct Client {
    addr: String,
    codec: FrameCodec,
}

impl Client {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            codec: FrameCodec::default(),
        }
    }

    #[must_use]
    pub fn with_codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Opens a socket and sends the role tag. No reply is expected yet.
    pub async fn open(&self, role: Role) -> Result<FramedChannel<TcpStream>> {
        let stream = connect(&self.addr).await?;
        stream.set_nodelay(true).map_err(ClientError::Connect)?;
        let mut channel = FramedChannel::new(stream, self.codec);
        channel.send(&[role.as_byte()]).await?;
        Ok(channel)
    }

    /// Registers a target primary under `code`.
    pub async fn target(&self, code: &AccessCode, identity: &[u8]) -> Result<TargetPrimary> {
        let mut channel = self.open(Role::Target).await?;
        channel.send(code.as_ref()).await?;
        channel.send(identity).await?;
        expect_admission(&mut channel).await?;
        debug!(%code, "target registered");
        Ok(TargetPrimary { channel })
    }

    pub async fn target_component(
        &self,
        component: Component,
        code: &AccessCode,
    ) -> Result<ComponentConnection> {
        let mut channel = self
            .open(Role::component_of(Side::Target, component))
            .await?;
        channel.send(code.as_ref()).await?;
        expect_admission(&mut channel).await?;
        Ok(ComponentConnection { channel, component })
    }

    /// Registers a watcher primary under `code`.
    pub async fn watcher(&self, code: &AccessCode) -> Result<WatcherPrimary> {
        let mut channel = self.open(Role::Watcher).await?;
        channel.send(code.as_ref()).await?;
        expect_admission(&mut channel).await?;
        debug!(%code, "watcher registered");
        Ok(WatcherPrimary { channel })
    }

    pub async fn watcher_component(
        &self,
        component: Component,
        code: &AccessCode,
        target: &AccessCode,
    ) -> Result<ComponentConnection> {
        let mut channel = self
            .open(Role::component_of(Side::Watcher, component))
            .await?;
        channel.send(code.as_ref()).await?;
        channel.send(target.as_ref()).await?;
        expect_admission(&mut channel).await?;
        Ok(ComponentConnection { channel, component })
    }
}

async fn connect(addr: impl ToSocketAddrs) -> Result<TcpStream> {
    TcpStream::connect(addr).await.map_err(ClientError::Connect)
}

async fn expect_admission(channel: &mut FramedChannel<TcpStream>) -> Result<()> {
    let payload = channel.recv().await?.ok_or(ClientError::Disconnected)?;
    match Reply::decode(&payload)? {
        Reply::Ok => Ok(()),
        Reply::Rejected(reason) => Err(ClientError::Rejected(reason)),
    }
}

/// Registered target primary connection.
pub struct TargetPrimary {
    channel: FramedChannel<TcpStream>,
}

impl TargetPrimary {
    /// Next action pushed by the server. `None` once the server hangs up.
    pub async fn next_action(&mut self) -> Result<Option<Action>> {
        let Some(payload) = self.channel.recv().await? else {
            return Ok(None);
        };
        let action = Action::from_frame(&payload)
            .map_err(|err| ClientError::Unexpected(err.to_string()))?;
        Ok(Some(action))
    }

    /// Next action other than a heartbeat. Heartbeats are answered with `OK`.
    pub async fn next_command(&mut self) -> Result<Option<Action>> {
        loop {
            match self.next_action().await? {
                Some(Action::Wait) => self.channel.send(&Reply::Ok.encode()).await?,
                other => return Ok(other),
            }
        }
    }

    pub async fn disconnect(mut self) -> Result<()> {
        self.channel.send(&[Action::Disconnect.as_byte()]).await?;
        self.channel.shutdown().await;
        Ok(())
    }

    pub fn channel_mut(&mut self) -> &mut FramedChannel<TcpStream> {
        &mut self.channel
    }
}

/// Registered watcher primary connection.
pub struct WatcherPrimary {
    channel: FramedChannel<TcpStream>,
}

impl WatcherPrimary {
    pub async fn target_list(&mut self) -> Result<Vec<AccessCode>> {
        self.request(Action::SendTargetList).await?;
        let payload = self.reply().await?;
        Ok(TargetList::decode(&payload)?.0)
    }

    pub async fn connected_components(&mut self, target: &AccessCode) -> Result<ComponentPresence> {
        self.request(Action::SendConnectedComponents).await?;
        self.channel.send(target.as_ref()).await?;
        let payload = self.reply().await?;
        Ok(ComponentPresence::decode(&payload)?)
    }

    /// Ends every component relay of this watcher. The server sends no reply.
    pub async fn stop_watching(&mut self) -> Result<()> {
        self.request(Action::StopWatching).await
    }

    pub async fn disconnect(mut self) -> Result<()> {
        self.request(Action::Disconnect).await?;
        self.channel.shutdown().await;
        Ok(())
    }

    pub fn channel_mut(&mut self) -> &mut FramedChannel<TcpStream> {
        &mut self.channel
    }

    async fn request(&mut self, action: Action) -> Result<()> {
        self.channel.send(&[action.as_byte()]).await?;
        Ok(())
    }

    async fn reply(&mut self) -> Result<Bytes> {
        self.channel.recv().await?.ok_or(ClientError::Disconnected)
    }
}

/// An admitted component connection on either side.
pub struct ComponentConnection {
    channel: FramedChannel<TcpStream>,
    component: Component,
}

impl ComponentConnection {
    pub fn component(&self) -> Component {
        self.component
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.channel.send(payload).await?;
        Ok(())
    }

    /// `None` once the server closes the component.
    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        Ok(self.channel.recv().await?)
    }

    /// Reads a pacing acknowledgement on a screen reader.
    pub async fn expect_ack(&mut self) -> Result<()> {
        let payload = self.channel.recv().await?.ok_or(ClientError::Disconnected)?;
        if Reply::is_ack(&payload) {
            Ok(())
        } else {
            Err(ClientError::Unexpected(format!(
                "expected OK, got {} bytes",
                payload.len()
            )))
        }
    }

    pub async fn ack(&mut self) -> Result<()> {
        self.send(&Reply::Ok.encode()).await
    }

    pub async fn send_control(&mut self, event: &ControlEvent) -> Result<()> {
        self.send(&event.encode()).await
    }

    pub async fn recv_control(&mut self) -> Result<Option<ControlEvent>> {
        match self.recv().await? {
            Some(payload) => Ok(Some(ControlEvent::decode(&payload)?)),
            None => Ok(None),
        }
    }

    pub async fn send_keys(&mut self, batch: &KeyBatch) -> Result<()> {
        let payload = batch.encode()?;
        self.send(&payload).await
    }

    pub async fn recv_keys(&mut self) -> Result<Option<KeyBatch>> {
        match self.recv().await? {
            Some(payload) => Ok(Some(KeyBatch::decode(&payload)?)),
            None => Ok(None),
        }
    }

    pub async fn close(mut self) {
        self.channel.shutdown().await;
    }
}
