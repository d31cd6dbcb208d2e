//! Tesserae server
//!
//! Accepts viewer WebSocket connections, routes their subscribe and
//! unsubscribe requests into the canvas, and streams tile updates and
//! composite notifications back out.

mod connection;

use std::sync::Arc;
use std::time::Duration;

use canvas::{Canvas, CanvasError, FsImageStorage, StorageError};
use tesserae_config::{BroadcastConfig, ConfigError, Settings};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

pub use connection::handle_connection;

/// How long shutdown waits for in-flight renders
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// Errors that stop the server or a single connection
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Canvas(#[from] CanvasError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
}

impl From<tokio_tungstenite::tungstenite::Error> for ServerError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ServerError::WebSocket(Box::new(e))
    }
}

/// Open the canvas described by `settings` and serve it until ctrl-c
pub async fn run(settings: Settings) -> Result<(), ServerError> {
    let storage = FsImageStorage::open(
        settings.server.storage_path.as_str(),
        settings.grid.chunk_tile_span,
    )?;
    let canvas = Arc::new(Canvas::open(&settings, Arc::new(storage))?);

    if settings.server.render_on_start {
        canvas.render_all();
    } else {
        canvas.reconcile();
    }

    let listener = TcpListener::bind(settings.server.bind_address()).await?;

    tokio::select! {
        result = serve(listener, canvas.clone(), settings.broadcast) => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested");
        }
    }

    if !canvas.scheduler().wait_until_clean(SHUTDOWN_DRAIN).await {
        warn!(
            "Stopping with {} composites still pending",
            canvas.scheduler().pending()
        );
    }
    Ok(())
}

/// Accept connections forever, one task per viewer
pub async fn serve(
    listener: TcpListener,
    canvas: Arc<Canvas>,
    config: BroadcastConfig,
) -> Result<(), ServerError> {
    info!("Listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        let canvas = canvas.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, canvas, config).await {
                debug!("Connection from {} ended with error: {}", peer, e);
            }
        });
    }
}
