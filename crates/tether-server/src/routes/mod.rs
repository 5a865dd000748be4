//! HTTP routes.

pub mod health;
pub mod mcp;
pub mod ws;

pub use health::{HealthResponse, health_routes};
pub use mcp::{delete_handler, get_handler, post_handler};
pub use ws::ws_handler;
