//! Shared, immutable collaborators of every connection

use crate::config::ServerConfig;
use crate::error_handler::{DefaultErrorHandler, ErrorHandler};
use crate::interceptor::RequestInterceptor;
use crate::router::{Router, SimpleRouter};
use std::sync::Arc;

/// Router, error handler, interceptor chain and tunables
///
/// Built once and shared by reference between all connection pipelines.
#[derive(Clone)]
pub struct Components {
    /// Maps requests to handlers
    pub router: Arc<dyn Router>,
    /// Renders error responses
    pub error_handler: Arc<dyn ErrorHandler>,
    /// Run before routing, in order
    pub interceptors: Vec<Arc<dyn RequestInterceptor>>,
    /// Limits and timeouts
    pub config: Arc<ServerConfig>,
}

impl Components {
    /// Start building from a router
    pub fn builder(router: impl Router) -> ComponentsBuilder {
        ComponentsBuilder {
            router: Arc::new(router),
            error_handler: Arc::new(DefaultErrorHandler),
            interceptors: Vec::new(),
            config: ServerConfig::default(),
        }
    }

    /// Components with an empty router and defaults everywhere
    pub fn empty() -> Self {
        Self::builder(SimpleRouter::new()).build()
    }
}

impl std::fmt::Debug for Components {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Components")
            .field("interceptors", &self.interceptors.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Components`]
pub struct ComponentsBuilder {
    router: Arc<dyn Router>,
    error_handler: Arc<dyn ErrorHandler>,
    interceptors: Vec<Arc<dyn RequestInterceptor>>,
    config: ServerConfig,
}

impl ComponentsBuilder {
    /// Replace the error handler
    pub fn error_handler(mut self, handler: impl ErrorHandler) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Append an interceptor to the chain
    pub fn interceptor(mut self, interceptor: impl RequestInterceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Replace the tunables
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish
    pub fn build(self) -> Components {
        Components {
            router: self.router,
            error_handler: self.error_handler,
            interceptors: self.interceptors,
            config: Arc::new(self.config),
        }
    }
}
