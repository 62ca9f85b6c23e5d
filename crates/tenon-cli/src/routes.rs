//! Built-in routes served by `tenon serve`

use std::sync::Arc;
use tenon_core::Executor;
use tenon_web::{
    HandlerError, Intercept, Method, ParameterMap, Request, Response, SimpleRouter,
};

/// `GET /health`, `POST /echo` and `GET /stats`
pub fn router(executor: Arc<Executor>) -> SimpleRouter {
    SimpleRouter::new()
        .with(Method::Get, "/health", health)
        .with(Method::Post, "/echo", echo)
        .with(
            Method::Get,
            "/stats",
            move |_: &Request, _: &ParameterMap| -> Result<Response, HandlerError> {
                let stats = executor.stats();
                Ok(Response::ok(format!(
                    "workers {}\nspawned {}\ncompleted {}\nfailed {}\ncancelled {}\nin_flight {}\n",
                    executor.worker_count(),
                    stats.spawned,
                    stats.completed,
                    stats.failed,
                    stats.cancelled,
                    stats.in_flight(),
                )))
            },
        )
}

fn health(_: &Request, _: &ParameterMap) -> Result<Response, HandlerError> {
    Ok(Response::ok("ok\n"))
}

fn echo(request: &Request, _: &ParameterMap) -> Result<Response, HandlerError> {
    let content_type = request
        .header("content-type")
        .unwrap_or("application/octet-stream")
        .to_string();
    Ok(Response::new(200)
        .with_header("Content-Type", content_type)
        .with_body(request.body.clone()))
}

/// Logs every request at debug level before routing
pub fn access_log(request: &mut Request, params: &ParameterMap) -> Intercept {
    log::debug!(
        "{} {} {}",
        params.get("peer_addr").unwrap_or("-"),
        request.method,
        request.target
    );
    Intercept::Continue
}
