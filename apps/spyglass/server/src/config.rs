use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use spyglass_core::FrameCodec;

use crate::imaging::ImageMode;

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:11419";
pub const DEFAULT_FILE_SERVER_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_FILE_ROOT: &str = "/srv/fileShare";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub file_server: Option<FileServerConfig>,
    pub codec: FrameCodec,
    pub session: SessionSettings,
}

impl ServerConfig {
    /// Main listener only, default framing and pacing.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            file_server: None,
            codec: FrameCodec::default(),
            session: SessionSettings::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileServerConfig {
    pub listen_addr: SocketAddr,
    pub root: PathBuf,
}

/// Timing and pacing knobs applied to every session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    /// Screen frames between pacing acknowledgements.
    pub ack_interval: u32,
    pub heartbeat_interval: Duration,
    pub attach_retries: u32,
    pub attach_retry_interval: Duration,
    pub relay_poll_interval: Duration,
    pub image_mode: ImageMode,
    pub jpeg_quality: u8,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ack_interval: 10,
            heartbeat_interval: Duration::from_secs(1),
            attach_retries: 100,
            attach_retry_interval: Duration::from_millis(100),
            relay_poll_interval: Duration::from_millis(10),
            image_mode: ImageMode::Direct,
            jpeg_quality: 85,
        }
    }
}
