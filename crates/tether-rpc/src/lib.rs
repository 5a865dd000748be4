//! Request lifecycle engine for Tether.
//!
//! This crate correlates JSON-RPC requests with their responses in both
//! directions and runs inbound requests through an ordered middleware chain
//! into a [`Handler`]:
//!
//! - [`RequestRegistry`] tracks pending inbound requests (with their cancel
//!   tokens), outbound waiters and per-token progress ordering.
//! - [`Dispatcher`] decodes inbound envelopes and routes them to the handler,
//!   the registry or the waiting caller.
//! - [`Peer`] sends requests and notifications to the other side over any
//!   [`MessageSink`].
//! - [`AuthProvider`] is the boundary to credential validation.
//!
//! The crate is transport-agnostic; sessions and channels live elsewhere.

pub mod auth;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod middleware;
pub mod peer;
pub mod registry;

pub use auth::{
    AccessToken, AuthError, AuthMiddleware, AuthProvider, Claims, StaticTokenProvider,
};
pub use context::{ChannelContext, RequestContext};
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, Result, RpcError};
pub use handler::{Handler, Router};
pub use middleware::{Middleware, Next};
pub use peer::{DEFAULT_REQUEST_TIMEOUT, MessageSink, Peer};
pub use registry::{ProgressState, RequestRegistry, ResponseWaiter};
