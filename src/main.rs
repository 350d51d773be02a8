use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use log::{info, warn};
use tokio::net::TcpListener;

use config::Config;
use metadata::RedisStore;
use server_inner::ServerInner;
use session::SessionSettings;

mod config;
mod connection;
mod error;
mod http;
mod metadata;
mod protocol;
mod server_inner;
mod session;
mod transcoder;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    dotenv().ok();
    env_logger::init();

    let config = Config::from_env()?;
    let store = RedisStore::connect(&config.redis_url).await?;
    let server = Arc::new(ServerInner::new(
        Arc::new(store),
        SessionSettings {
            transcoder: config.transcoder.clone(),
            remove_on_stop: config.remove_on_stop,
        },
    ));

    let listener = TcpListener::bind(config.listen_addr).await?;
    info!("relay listening on {}", config.listen_addr);

    axum::serve(listener, http::router(server.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    server.shutdown(SHUTDOWN_GRACE).await;
    info!("relay stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler unavailable: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown requested");
}
