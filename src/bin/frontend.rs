//! Client-facing process. Listens for websocket connections speaking the
//! frontend subprotocol; each connection either renders locally
//! (standalone mode) or is handed to a duration-tiered dispatcher that
//! spreads work across a pool of executor backends.

use std::sync::Arc;

use tokio::net::TcpListener;

use renderd::backend_pool::BackendPool;
use renderd::config::FrontendConfig;
use renderd::dispatcher::Dispatcher;
use renderd::session::{self, Mode};
use renderd::tasklist::TaskList;
use renderd::transport::{Connection, FRONTEND_SUBPROTOCOL};

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

    tracing::info!("renderd-frontend starting");

    let config = FrontendConfig::from_env();
    let max_duration = config
        .tiers
        .iter()
        .map(|t| t.bound)
        .fold(0.0_f64, f64::max);

    let mode_factory: Arc<dyn Fn() -> Mode + Send + Sync> = if config.standalone {
        let renderer_bin: Arc<str> = Arc::from(config.renderer_bin.as_str());
        Arc::new(move || Mode::Standalone {
            renderer_bin: renderer_bin.clone(),
        })
    } else {
        let tasklist = Arc::new(TaskList::new(max_duration));
        let backends = Arc::new(BackendPool::new(&config.backends));
        let dispatcher = Arc::new(Dispatcher::new(tasklist.clone(), backends));
        dispatcher.spawn(config.tiers.clone());
        Arc::new(move || Mode::Queued {
            tasklist: tasklist.clone(),
        })
    };

    let listener = TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "listening");

    loop {
        let (tcp, peer) = listener.accept().await?;
        let mode_factory = mode_factory.clone();
        tokio::spawn(async move {
            let conn = match Connection::accept(tcp, FRONTEND_SUBPROTOCOL).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(%peer, %e, "websocket handshake failed");
                    return;
                }
            };
            if let Err(e) = session::run(conn, mode_factory(), max_duration).await {
                tracing::info!(%peer, %e, "session ended");
            }
        });
    }
}
