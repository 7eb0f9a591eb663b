use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use spyglass_client::Client;
use spyglass_core::frame::DEFAULT_MAX_PAYLOAD;
use spyglass_core::{AccessCode, FrameCodec};
use tokio::time::timeout;

use crate::config::{
    FileServerConfig, ServerConfig, SessionSettings, DEFAULT_FILE_ROOT, DEFAULT_FILE_SERVER_ADDR,
    DEFAULT_LISTEN_ADDR,
};
use crate::imaging::ImageMode;

#[derive(Debug, Parser)]
#[command(
    name = "spyglass-server",
    author,
    version,
    about = "Rendezvous server pairing Spyglass targets with their watchers"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Connect as a watcher and print what the server knows about targets
    Probe {
        /// Server address (host:port)
        #[arg(short, long, default_value = "127.0.0.1:11419")]
        server: String,

        /// Watcher access code to register under
        #[arg(short, long)]
        code: String,

        /// Also print component presence for this target
        #[arg(short, long)]
        target: Option<String>,

        #[arg(long, default_value_t = spyglass_core::frame::DEFAULT_HEADER_WIDTH)]
        header_width: usize,
    },
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address the rendezvous listener binds to.
    #[arg(long, env = "SPYGLASS_LISTEN_ADDR", default_value = DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// Address of the side-channel file server.
    #[arg(long, env = "SPYGLASS_FILE_SERVER_ADDR", default_value = DEFAULT_FILE_SERVER_ADDR)]
    pub file_server_addr: String,

    /// Directory exposed by the file server.
    #[arg(long, env = "SPYGLASS_FILE_ROOT", default_value = DEFAULT_FILE_ROOT)]
    pub file_root: PathBuf,

    /// Do not start the file server.
    #[arg(long, env = "SPYGLASS_NO_FILE_SERVER", default_value_t = false)]
    pub no_file_server: bool,

    /// Width in bytes of the ASCII length header on every frame.
    #[arg(long, env = "SPYGLASS_HEADER_WIDTH", default_value_t = spyglass_core::frame::DEFAULT_HEADER_WIDTH)]
    pub header_width: usize,

    /// Largest payload accepted on any frame.
    #[arg(long, env = "SPYGLASS_MAX_PAYLOAD", default_value_t = DEFAULT_MAX_PAYLOAD)]
    pub max_payload: usize,

    /// Screen frames between pacing acknowledgements.
    #[arg(long, env = "SPYGLASS_ACK_INTERVAL", default_value_t = 10)]
    pub ack_interval: u32,

    #[arg(long, env = "SPYGLASS_HEARTBEAT_MS", default_value_t = 1000)]
    pub heartbeat_ms: u64,

    /// How many times a watcher component checks for its target component.
    #[arg(long, env = "SPYGLASS_ATTACH_RETRIES", default_value_t = 100)]
    pub attach_retries: u32,

    #[arg(long, env = "SPYGLASS_ATTACH_RETRY_MS", default_value_t = 100)]
    pub attach_retry_ms: u64,

    #[arg(long, env = "SPYGLASS_RELAY_POLL_MS", default_value_t = 10)]
    pub relay_poll_ms: u64,

    /// How targets encode screen frames.
    #[arg(long, env = "SPYGLASS_IMAGE_MODE", value_enum, default_value_t = ImageMode::Direct)]
    pub image_mode: ImageMode,

    /// JPEG quality used when rebuilding frames in diff mode.
    #[arg(long, env = "SPYGLASS_JPEG_QUALITY", default_value_t = 85)]
    pub jpeg_quality: u8,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        let file_server = if args.no_file_server {
            None
        } else {
            let file_addr: SocketAddr = args
                .file_server_addr
                .parse()
                .with_context(|| format!("invalid file server address: {}", args.file_server_addr))?;
            Some(FileServerConfig {
                listen_addr: file_addr,
                root: args.file_root,
            })
        };

        ensure!(
            (1..=64).contains(&args.header_width),
            "header width must be between 1 and 64, got {}",
            args.header_width
        );
        ensure!(args.max_payload > 0, "max payload must be non-zero");
        ensure!(args.ack_interval >= 1, "ack interval must be at least 1");
        ensure!(args.heartbeat_ms > 0, "heartbeat interval must be non-zero");
        ensure!(args.attach_retry_ms > 0, "attach retry interval must be non-zero");
        ensure!(args.relay_poll_ms > 0, "relay poll interval must be non-zero");
        ensure!(
            (1..=100).contains(&args.jpeg_quality),
            "jpeg quality must be between 1 and 100"
        );

        Ok(ServerConfig {
            listen_addr,
            file_server,
            codec: FrameCodec::new(args.header_width).with_max_payload(args.max_payload),
            session: SessionSettings {
                ack_interval: args.ack_interval,
                heartbeat_interval: Duration::from_millis(args.heartbeat_ms),
                attach_retries: args.attach_retries,
                attach_retry_interval: Duration::from_millis(args.attach_retry_ms),
                relay_poll_interval: Duration::from_millis(args.relay_poll_ms),
                image_mode: args.image_mode,
                jpeg_quality: args.jpeg_quality,
            },
        })
    }
}

/// Registers as a watcher, prints the target list (and optionally one
/// target's component presence) and disconnects.
pub async fn run_probe(
    server: String,
    code: String,
    target: Option<String>,
    header_width: usize,
) -> Result<()> {
    let client = Client::new(server).with_codec(FrameCodec::new(header_width));
    let mut watcher = timeout(
        Duration::from_secs(5),
        client.watcher(&AccessCode::from(code)),
    )
    .await
    .with_context(|| format!("timed out connecting to {}", client.addr()))??;

    let targets = watcher.target_list().await?;
    println!("targets ({}):", targets.len());
    for code in &targets {
        println!("  {code}");
    }

    if let Some(target) = target {
        let presence = watcher
            .connected_components(&AccessCode::from(target.as_str()))
            .await?;
        println!("components of {target}:");
        println!("  primary:       {}", presence.primary);
        println!("  screen reader: {}", presence.screen_reader);
        println!("  controller:    {}", presence.controller);
        println!("  keylogger:     {}", presence.keylogger);
    }

    watcher.disconnect().await?;
    Ok(())
}
