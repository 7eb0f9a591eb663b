use anyhow::Result;
use clap::Parser;
use spyglass_server::cli::{self, Cli, Commands};
use spyglass_server::{Server, ServerConfig};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    if let Some(Commands::Probe {
        server,
        code,
        target,
        header_width,
    }) = cli.command
    {
        return cli::run_probe(server, code, target, header_width).await;
    }

    let config = ServerConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        file_server = ?config.file_server.as_ref().map(|fs| fs.listen_addr),
        "starting spyglass server"
    );

    let server = Server::bind(config).await?;
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });

    server.run().await?;
    info!("spyglass server stopped");
    Ok(())
}
