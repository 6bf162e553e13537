use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

mod codec;
mod common;
mod config;
mod playback;
mod pool;
mod protocol;
mod server;
mod sources;
mod voice;

use common::AnyResult;
use config::Config;
use pool::ThreadPool;
use server::{Gateway, spawn_event_router};
use sources::SourceRegistry;

#[tokio::main]
async fn main() -> AnyResult<()> {
    let config = Config::load()?;

    if config.banner_enabled() {
        common::banner::print_banner(&common::banner::BannerInfo::default());
    }
    common::logger::init(&config);

    let sources = Arc::new(SourceRegistry::new(&config));

    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let (events_tx, events_rx) = flume::unbounded();
    let pool = ThreadPool::new(workers, events_tx, sources.clone());

    let gateway = Arc::new(Gateway::new(config.clone(), pool, sources));
    spawn_event_router(gateway.clone(), events_rx);

    let addr: SocketAddr = format!("{}:{}", config.server.address, config.server.port).parse()?;
    let app = server::rest::router(gateway);

    info!("listening on {addr} (Lavalink v3, {workers} workers)");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
