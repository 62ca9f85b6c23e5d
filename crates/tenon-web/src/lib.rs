//! Tenon HTTP layer
//!
//! HTTP/1.x serving on top of the `tenon-core` executor:
//! - **Pipeline**: one cooperative task per connection, driving
//!   read → parse → dispatch → write → keep-alive (`pipeline` module)
//! - **Components**: router, request interceptors and error handler shared by
//!   every connection (`components` module)
//! - **Server**: accept loop handing provider connections to a
//!   [`ConnectionHandler`] (`server` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tenon_web::{
//!     Components, HandlerError, HttpConnectionHandler, Method, ParameterMap, Request,
//!     Response, Server, SimpleRouter, TcpConnectionProvider,
//! };
//!
//! fn health(_: &Request, _: &ParameterMap) -> Result<Response, HandlerError> {
//!     Ok(Response::ok("ok\n"))
//! }
//!
//! let router = SimpleRouter::new().with(Method::Get, "/health", health);
//! let components = Components::builder(router).build();
//! let handler = Arc::new(HttpConnectionHandler::new(components, Some(4))?);
//! let provider = Arc::new(TcpConnectionProvider::bind("127.0.0.1:8000".parse()?)?);
//!
//! let server = Server::new(provider, handler.clone());
//! server.run(false)?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod components;
pub mod config;
pub mod connection;
pub mod error_handler;
pub mod handler;
pub mod http;
pub mod interceptor;
pub mod live;
pub mod params;
pub mod pipeline;
pub mod provider;
pub mod router;
pub mod server;

pub use components::{Components, ComponentsBuilder};
pub use config::ServerConfig;
pub use connection::Connection;
pub use error_handler::{DefaultErrorHandler, ErrorHandler, HttpError};
pub use handler::{ConnectionHandler, HttpConnectionHandler};
pub use http::{
    encode_response, parse_head, reason_phrase, Headers, Method, ProtocolError, Request,
    RequestHead, Response, Version,
};
pub use interceptor::{Intercept, RequestInterceptor};
pub use live::{LiveConnection, LiveConnections};
pub use params::ParameterMap;
pub use pipeline::ConnectionPipeline;
pub use provider::{ConnectionProvider, TcpConnectionProvider};
pub use router::{Handler, HandlerError, Router, SimpleRouter};
pub use server::{Server, ServerError, ServerStatus};
