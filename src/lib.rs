//! # cellar
//!
//! Pluggable cache backends and session-store wiring for small async web
//! applications.
//!
//! One [`Cache`] facade sits over either a pooled remote key-value service
//! (spoken to in RESP) or an embedded log-structured store on local disk.
//! [`AppBuilder`] picks the backend from configuration, attaches the session
//! store, and [`App::shutdown`] closes everything exactly once.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cellar::{AppBuilder, Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env(".")?;
//!     let port = config.port;
//!     let app = Arc::new(AppBuilder::new(config).build().await?);
//!
//!     let server = Server::bind(format!("127.0.0.1:{port}")).await?;
//!     let handler_app = Arc::clone(&app);
//!     server
//!         .run_until(
//!             move |req| cellar::handlers::handle(Arc::clone(&handler_app), req),
//!             async { tokio::signal::ctrl_c().await.ok(); },
//!         )
//!         .await?;
//!
//!     app.shutdown().await;
//!     Ok(())
//! }
//! ```

mod lock;

pub mod app;
pub mod background;
pub mod cache;
pub mod config;
pub mod handlers;
pub mod http;
pub mod pool;
pub mod resp;
pub mod server;
pub mod session;
pub mod store;

pub use app::{App, AppBuilder, CacheBackend, SetupError};
pub use cache::{Cache, CacheError};
pub use config::Config;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use server::{Server, ServerError};
