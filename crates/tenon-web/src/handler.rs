//! Connection handlers: turning accepted streams into tasks

use crate::components::Components;
use crate::connection::Connection;
use crate::error_handler::{ErrorHandler, HttpError};
use crate::http::{encode_response, Version};
use crate::interceptor::RequestInterceptor;
use crate::live::LiveConnections;
use crate::params::ParameterMap;
use crate::pipeline::ConnectionPipeline;
use parking_lot::RwLock;
use std::io::Write;
use std::net::Shutdown;
use std::sync::Arc;
use tenon_core::{Executor, ExecutorConfig, ExecutorError, ExecutorStatus};

/// Takes ownership of accepted connections
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve a connection; must not block the caller
    ///
    /// Failures are reported through the handler's error path, not returned.
    fn handle_connection(&self, stream: Box<dyn Connection>, params: ParameterMap);

    /// Stop serving; connections in progress are cancelled
    fn stop(&self);
}

/// Serves HTTP/1.x by running one [`ConnectionPipeline`] task per connection
pub struct HttpConnectionHandler {
    executor: Arc<Executor>,
    components: RwLock<Arc<Components>>,
    live: Arc<LiveConnections>,
}

impl HttpConnectionHandler {
    /// Handler with its own executor of `threads` workers (None = number of CPUs)
    pub fn new(components: Components, threads: Option<usize>) -> Result<Self, ExecutorError> {
        let config = ExecutorConfig {
            workers: threads,
            ..ExecutorConfig::default()
        };
        Self::with_config(components, config)
    }

    /// Handler with its own executor
    pub fn with_config(
        components: Components,
        config: ExecutorConfig,
    ) -> Result<Self, ExecutorError> {
        let executor = Executor::new(config)?;
        executor.start()?;
        Ok(Self::with_executor(components, Arc::new(executor)))
    }

    /// Handler sharing an existing executor
    ///
    /// The executor must be started by its owner; [`ConnectionHandler::stop`]
    /// still stops it.
    pub fn with_executor(components: Components, executor: Arc<Executor>) -> Self {
        Self {
            executor,
            components: RwLock::new(Arc::new(components)),
            live: Arc::new(LiveConnections::new()),
        }
    }

    /// Replace the error handler for connections accepted from now on
    pub fn set_error_handler(&self, handler: impl ErrorHandler) {
        let mut components = self.components.write();
        let mut next = (**components).clone();
        next.error_handler = Arc::new(handler);
        *components = Arc::new(next);
    }

    /// Append an interceptor for connections accepted from now on
    pub fn add_request_interceptor(&self, interceptor: impl RequestInterceptor) {
        let mut components = self.components.write();
        let mut next = (**components).clone();
        next.interceptors.push(Arc::new(interceptor));
        *components = Arc::new(next);
    }

    /// Connections currently being served
    pub fn live_connections(&self) -> &Arc<LiveConnections> {
        &self.live
    }

    /// The executor running the connections
    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    fn reject(&self, mut stream: Box<dyn Connection>, components: &Components, err: ExecutorError) {
        log::warn!("rejecting connection: {}", err);
        let response = components.error_handler.handle(&HttpError::Unavailable);
        let bytes = encode_response(&response, Version::Http11, false, true);
        // Best effort: one non-blocking attempt, then drop the stream
        if let Err(err) = stream.write(&bytes) {
            log::trace!("writing 503: {}", err);
        }
        let _ = stream.shutdown(Shutdown::Both);
    }
}

impl ConnectionHandler for HttpConnectionHandler {
    fn handle_connection(&self, stream: Box<dyn Connection>, params: ParameterMap) {
        let peer = stream.peer_addr().ok().map(|addr| addr.to_string());
        let params = match &peer {
            Some(peer) if params.get("peer_addr").is_none() => params.with("peer_addr", peer.as_str()),
            _ => params,
        };

        let components = self.components.read().clone();
        match self.executor.status() {
            ExecutorStatus::Created | ExecutorStatus::Running => {}
            ExecutorStatus::Draining | ExecutorStatus::Stopped => {
                return self.reject(stream, &components, ExecutorError::Stopped);
            }
        }

        let guard = self.live.track(peer);
        let pipeline =
            ConnectionPipeline::new(stream, components.clone(), params).with_guard(guard);
        if let Err((pipeline, err)) = self.executor.try_submit(pipeline) {
            // Lost a race with stop
            if let Some(stream) = pipeline.into_stream() {
                self.reject(stream, &components, err);
            }
        }
    }

    fn stop(&self) {
        if let Err(err) = self.executor.stop() {
            log::warn!("connection handler stop: {}", err);
        }
    }
}
