//! Serves the cache and session demo endpoints.
//!
//! ```text
//! CACHE=badger cargo run --example cache_demo
//! curl -X POST localhost:4000/cache/save -d '{"name":"foo","value":"bar"}'
//! curl -X POST localhost:4000/cache/get -d '{"name":"foo"}'
//! curl -c jar -b jar localhost:4000/session
//! ```
//!
//! Configuration comes from the environment or `./.env`; see the README for
//! the full list of variables.

use std::sync::Arc;

use cellar::{AppBuilder, Config, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "cellar=debug,info".into()))
        .init();

    let config = Config::from_env(".")?;
    let port = config.port;
    let app = Arc::new(AppBuilder::new(config).build().await?);

    let server = Server::bind(format!("127.0.0.1:{port}")).await?;
    info!("cache demo on http://{}", server.local_addr());

    let handler_app = Arc::clone(&app);
    server
        .run_until(
            move |req| cellar::handlers::handle(Arc::clone(&handler_app), req),
            async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to listen for ctrl-c");
                }
            },
        )
        .await?;

    app.shutdown().await;
    Ok(())
}
