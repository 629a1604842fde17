//! Backend process. Listens for websocket connections speaking the
//! executor subprotocol and renders each task directly against the local
//! renderer binary, one at a time per connection.

use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use std::sync::Arc;

use renderd::config::ExecutorConfig;
use renderd::session::{self, Mode};
use renderd::transport::{Connection, EXECUTOR_SUBPROTOCOL};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    dotenvy::dotenv().ok();

    tracing::info!("renderd-executor starting");

    let config = ExecutorConfig::from_env();
    let renderer_bin: Arc<str> = Arc::from(config.renderer_bin.as_str());
    let concurrency = Arc::new(Semaphore::new(config.max_concurrency.max(1)));

    let listener = TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "listening");

    loop {
        let (tcp, peer) = listener.accept().await?;
        let renderer_bin = renderer_bin.clone();
        let concurrency = concurrency.clone();
        let max_duration = config.max_duration_secs;
        tokio::spawn(async move {
            let permit = match concurrency.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let conn = match Connection::accept(tcp, EXECUTOR_SUBPROTOCOL).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(%peer, %e, "websocket handshake failed");
                    return;
                }
            };
            let mode = Mode::Standalone { renderer_bin };
            if let Err(e) = session::run(conn, mode, max_duration).await {
                tracing::info!(%peer, %e, "session ended");
            }
            drop(permit);
        });
    }
}
