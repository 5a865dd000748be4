//! HTTP and WebSocket endpoint for Tether sessions.
//!
//! One endpoint path carries the whole protocol:
//!
//! - `POST` takes one JSON-RPC envelope. The `initialize` response carries
//!   the new session id in `Mcp-Session-Id`; every later request must echo it.
//! - `GET` opens the session's event stream, resuming after `Last-Event-ID`.
//! - `DELETE` ends the session.
//!
//! `GET <endpoint>/ws` offers the same session over a WebSocket.
//!
//! # Example
//!
//! ```ignore
//! use tether_rpc::Router;
//! use tether_server::{Server, ServerConfig};
//!
//! let handler = Router::new().method("echo", |_ctx, params| async move {
//!     Ok(params.unwrap_or_default())
//! });
//! let config = ServerConfig::new().with_bind_address("127.0.0.1:8080".parse()?);
//!
//! Server::new(handler, config).run().await?;
//! ```

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use auth::{bearer_token, origin_middleware};
pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use state::AppState;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    http::{HeaderName, HeaderValue},
    middleware,
    routing::{get, post},
};
use tether_protocol::{headers, methods};
use tether_rpc::{AuthMiddleware, AuthProvider, Handler, Middleware};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

/// The Tether HTTP/WebSocket server.
pub struct Server {
    /// Application state.
    state: AppState,
}

impl Server {
    /// Create a new server with the given handler and configuration.
    pub fn new(handler: impl Handler + 'static, config: ServerConfig) -> Self {
        Self {
            state: AppState::new(handler, config),
        }
    }

    /// Create a server from a pre-built application state.
    pub fn from_state(state: AppState) -> Self {
        Self { state }
    }

    /// Add a middleware to the dispatcher chain.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.state.dispatcher = self.state.dispatcher.with_middleware(middleware);
        self
    }

    /// Require a valid bearer token on every request except `ping`.
    pub fn with_auth(self, provider: Arc<dyn AuthProvider>) -> Self {
        let middleware = AuthMiddleware::new(provider).allow_method(methods::PING);
        self.with_middleware(Arc::new(middleware))
    }

    /// The shared application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Build the router with all routes and middleware.
    pub fn router(&self) -> Router {
        let config = self.state.config();

        let mut router = Router::new()
            .route(
                &config.endpoint,
                post(routes::post_handler)
                    .get(routes::get_handler)
                    .delete(routes::delete_handler),
            )
            .route(&config.ws_endpoint(), get(routes::ws_handler))
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                auth::origin_middleware,
            ))
            .layer(DefaultBodyLimit::max(config.max_body_size))
            // Health stays reachable from any origin.
            .merge(routes::health_routes());

        if config.enable_cors {
            router = router.layer(cors_layer(config));
        }

        router
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Run the server until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let addr = self.state.config.bind_address;
        self.run_on(addr).await
    }

    /// Run the server on a specific address (useful for testing).
    pub async fn run_on(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Internal(format!("Failed to bind: {}", e)))?;

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve on a bound listener until `shutdown` resolves.
    ///
    /// Shutdown closes every session, which ends open event streams and
    /// fails in-flight server-initiated requests.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        self.state.config.validate()?;
        let router = self.router();
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::Internal(format!("Failed to read address: {}", e)))?;

        let reaper_cancel = CancellationToken::new();
        let reaper = self.state.sessions.spawn_reaper(reaper_cancel.clone());

        info!(
            addr = %addr,
            endpoint = %self.state.config.endpoint,
            "Starting server"
        );

        let sessions = self.state.sessions.clone();
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("Shutting down, closing sessions");
                sessions.shutdown();
            })
            .await;

        reaper_cancel.cancel();
        if let Err(e) = reaper.await {
            tracing::debug!(error = %e, "session reaper ended abnormally");
        }

        result.map_err(|e| ServerError::Internal(format!("Server error: {}", e)))
    }

    /// Get the configured bind address.
    pub fn bind_address(&self) -> SocketAddr {
        self.state.config.bind_address
    }
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins = if config.allowed_origins.is_empty() {
        AllowOrigin::from(Any)
    } else {
        AllowOrigin::list(
            config
                .allowed_origins
                .iter()
                .filter_map(|origin| HeaderValue::from_str(origin).ok()),
        )
    };

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(headers::SESSION_ID)])
}
