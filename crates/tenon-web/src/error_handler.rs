//! Turning failures into responses

use crate::http::{reason_phrase, Method, ProtocolError, Response};
use crate::router::HandlerError;

/// Anything that ends a request exchange with an error response
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    /// The request could not be read; the connection is closed after the response
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No route for the request
    #[error("no route for {method} {path}")]
    NotFound {
        /// Request method
        method: Method,
        /// Request path
        path: String,
    },

    /// The request did not arrive in full before the request timeout
    #[error("request not received in time")]
    RequestTimeout,

    /// The handler returned an error
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// The handler panicked
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The connection could not be accepted for processing
    #[error("server unavailable")]
    Unavailable,
}

impl HttpError {
    /// Status code of the error response
    pub fn status(&self) -> u16 {
        match self {
            HttpError::Protocol(err) => err.status(),
            HttpError::NotFound { .. } => 404,
            HttpError::RequestTimeout => 408,
            HttpError::Handler(err) => err.status,
            HttpError::Panicked(_) => 500,
            HttpError::Unavailable => 503,
        }
    }

    /// Whether the connection must be closed after the error response
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            HttpError::Protocol(_) | HttpError::RequestTimeout | HttpError::Unavailable
        )
    }
}

/// Builds the response for an [`HttpError`]
///
/// Called on a worker thread; must do bounded work and not block.
pub trait ErrorHandler: Send + Sync + 'static {
    /// Render an error
    fn handle(&self, error: &HttpError) -> Response;
}

/// Plain-text error bodies: `<code> <reason>: <detail>`
#[derive(Debug, Clone, Default)]
pub struct DefaultErrorHandler;

impl ErrorHandler for DefaultErrorHandler {
    fn handle(&self, error: &HttpError) -> Response {
        let status = error.status();
        Response::text(
            status,
            format!("{} {}: {}\n", status, reason_phrase(status), error),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(HttpError::RequestTimeout.status(), 408);
        assert_eq!(
            HttpError::NotFound {
                method: Method::Get,
                path: "/x".into()
            }
            .status(),
            404
        );
        assert_eq!(HttpError::from(HandlerError::new(418, "teapot")).status(), 418);
        assert_eq!(
            HttpError::from(ProtocolError::HeaderTooLarge { limit: 10 }).status(),
            431
        );
    }

    #[test]
    fn test_close_rules() {
        assert!(HttpError::RequestTimeout.closes_connection());
        assert!(HttpError::from(ProtocolError::BadHeader("x".into())).closes_connection());
        assert!(!HttpError::Panicked("x".into()).closes_connection());
        assert!(!HttpError::from(HandlerError::internal("x")).closes_connection());
    }

    #[test]
    fn test_default_body() {
        let response = DefaultErrorHandler.handle(&HttpError::NotFound {
            method: Method::Get,
            path: "/missing".into(),
        });
        assert_eq!(response.status, 404);
        assert_eq!(
            String::from_utf8(response.body).unwrap(),
            "404 Not Found: no route for GET /missing\n"
        );
    }
}
