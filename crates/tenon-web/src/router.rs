//! Request handlers and routing

use crate::http::{Method, Request, Response};
use crate::params::ParameterMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Failure returned by a request handler
///
/// Rendered into a response by the error handler; the connection stays
/// usable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Status code of the error response
    pub status: u16,
    /// Human-readable detail
    pub message: String,
}

impl HandlerError {
    /// Error with an explicit status
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// 400 Bad Request
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    /// 500 Internal Server Error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }
}

/// Produces the response for a routed request
///
/// Runs on a worker thread and must not block.
pub trait Handler: Send + Sync + 'static {
    /// Handle one request
    fn handle(&self, request: &Request, params: &ParameterMap) -> Result<Response, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&Request, &ParameterMap) -> Result<Response, HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, request: &Request, params: &ParameterMap) -> Result<Response, HandlerError> {
        self(request, params)
    }
}

/// Maps a method and path to a handler
pub trait Router: Send + Sync + 'static {
    /// Find the handler for `method` and `path`, or `None` for not-found
    fn route(&self, method: &Method, path: &str) -> Option<Arc<dyn Handler>>;
}

/// Exact-match routing table
///
/// `HEAD` falls back to the `GET` handler when no `HEAD` route exists.
#[derive(Default)]
pub struct SimpleRouter {
    routes: HashMap<(Method, String), Arc<dyn Handler>>,
}

impl SimpleRouter {
    /// Create an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a route, replacing any previous handler for it
    pub fn add(&mut self, method: Method, path: impl Into<String>, handler: impl Handler) {
        self.routes.insert((method, path.into()), Arc::new(handler));
    }

    /// Builder-style [`SimpleRouter::add`]
    pub fn with(mut self, method: Method, path: impl Into<String>, handler: impl Handler) -> Self {
        self.add(method, path, handler);
        self
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are registered
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl Router for SimpleRouter {
    fn route(&self, method: &Method, path: &str) -> Option<Arc<dyn Handler>> {
        let key = (method.clone(), path.to_string());
        if let Some(handler) = self.routes.get(&key) {
            return Some(handler.clone());
        }
        if *method == Method::Head {
            return self.routes.get(&(Method::Get, key.1)).cloned();
        }
        None
    }
}

impl std::fmt::Debug for SimpleRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut routes: Vec<String> = self
            .routes
            .keys()
            .map(|(m, p)| format!("{} {}", m, p))
            .collect();
        routes.sort();
        f.debug_struct("SimpleRouter").field("routes", &routes).finish()
    }
}
