//! Request interceptors

use crate::http::{Request, Response};
use crate::params::ParameterMap;

/// Decision of a [`RequestInterceptor`]
#[derive(Debug)]
pub enum Intercept {
    /// Pass the (possibly modified) request on
    Continue,
    /// Skip routing and answer with this response
    Respond(Response),
}

/// Runs before routing, in registration order
///
/// The first interceptor that responds short-circuits the rest of the
/// chain and the handler.
pub trait RequestInterceptor: Send + Sync + 'static {
    /// Inspect or rewrite a request
    fn intercept(&self, request: &mut Request, params: &ParameterMap) -> Intercept;
}

impl<F> RequestInterceptor for F
where
    F: Fn(&mut Request, &ParameterMap) -> Intercept + Send + Sync + 'static,
{
    fn intercept(&self, request: &mut Request, params: &ParameterMap) -> Intercept {
        self(request, params)
    }
}
