// src/main.rs
use reliant::{config, Socket, TransportError};

#[derive(thiserror::Error, Debug)]
enum AppError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, AppError>;

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cfg = config::handle().map_err(TransportError::from)?;

    tracing::info!(bind_address = %cfg.network.bind_address, "starting reliant transport");
    let socket = Socket::bind(&cfg).await?;

    socket.run().await?;

    tracing::info!("reliant transport stopped.");
    Ok(())
}
