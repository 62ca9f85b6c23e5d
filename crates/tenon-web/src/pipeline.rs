//! Connection pipeline: one task per connection
//!
//! ```text
//! AwaitInput -> ParseHeaders -> ParseBody -> Dispatch -> WriteResponse
//!     ^              |              |           |          |      |
//!     |              +--------------+-----------+--> HandleError  |
//!     |                                                    |      v
//!     +---------------- keep-alive <-----------------------+  AwaitOutputReady
//! ```
//!
//! Only `AwaitInput` and `AwaitOutputReady` suspend. Every read and write
//! is attempted until `WouldBlock` before suspending, since readiness is
//! edge-triggered. Bytes that arrive after the current request (pipelined
//! requests) stay in the input buffer and are parsed once the current
//! response has been written, so request N+1 is never dispatched before
//! response N is out.

use crate::components::Components;
use crate::connection::Connection;
use crate::error_handler::HttpError;
use crate::http::{
    encode_response, parse_head, Method, ProtocolError, Request, RequestHead, Response, Version,
};
use crate::interceptor::Intercept;
use crate::live::ConnectionGuard;
use crate::params::ParameterMap;
use std::any::Any;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tenon_core::{Action, Context, Coroutine, IoSource, TaskError, Wake};

type Stream = IoSource<Box<dyn Connection>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitInput,
    ParseHeaders,
    ParseBody,
    Dispatch,
    HandleError,
    AwaitOutputReady,
    WriteResponse,
}

enum Flow {
    /// Continue with another phase right away
    Next(Phase),
    /// Suspend in `phase`
    Wait(Phase, Action),
    /// The connection is done
    Exit(Action),
}

/// Serves HTTP/1.x requests on one connection until it closes
pub struct ConnectionPipeline {
    /// Stream before its registration on first resume
    pending: Option<Box<dyn Connection>>,
    stream: Option<Stream>,
    components: Arc<Components>,
    params: ParameterMap,
    phase: Phase,

    input: Vec<u8>,
    eof: bool,
    head: Option<RequestHead>,
    body_length: usize,
    request: Option<Request>,
    error: Option<HttpError>,

    /// Version and method of the exchange being answered
    version: Version,
    head_only: bool,
    keep_alive: bool,

    output: Vec<u8>,
    written: usize,

    idle_since: Instant,
    request_started: Option<Instant>,
    write_started: Option<Instant>,
    spurious: u32,
    served: u64,
    _guard: Option<ConnectionGuard>,
}

impl ConnectionPipeline {
    /// Pipeline for a freshly accepted stream
    pub fn new(
        stream: Box<dyn Connection>,
        components: Arc<Components>,
        params: ParameterMap,
    ) -> Self {
        Self {
            pending: Some(stream),
            stream: None,
            components,
            params,
            phase: Phase::AwaitInput,
            input: Vec::new(),
            eof: false,
            head: None,
            body_length: 0,
            request: None,
            error: None,
            version: Version::Http11,
            head_only: false,
            keep_alive: false,
            output: Vec::new(),
            written: 0,
            idle_since: Instant::now(),
            request_started: None,
            write_started: None,
            spurious: 0,
            served: 0,
            _guard: None,
        }
    }

    pub(crate) fn with_guard(mut self, guard: ConnectionGuard) -> Self {
        self._guard = Some(guard);
        self
    }

    /// The stream, if the pipeline never started serving it
    pub(crate) fn into_stream(mut self) -> Option<Box<dyn Connection>> {
        self.pending.take()
    }

    /// Requests answered so far
    pub fn served(&self) -> u64 {
        self.served
    }

    fn peer(&self) -> &str {
        self.params.get("peer_addr").unwrap_or("?")
    }

    fn advance(&mut self, mut woken: bool) -> Action {
        loop {
            let flow = match self.phase {
                Phase::AwaitInput => self.await_input(woken),
                Phase::ParseHeaders => self.parse_headers(),
                Phase::ParseBody => self.parse_body(),
                Phase::Dispatch => self.dispatch(),
                Phase::HandleError => self.handle_http_error(),
                Phase::AwaitOutputReady | Phase::WriteResponse => self.write_response(woken),
            };
            woken = false;

            match flow {
                Flow::Next(phase) => self.phase = phase,
                Flow::Wait(phase, action) => {
                    self.phase = phase;
                    return action;
                }
                Flow::Exit(action) => return action,
            }
        }
    }

    fn await_input(&mut self, woken: bool) -> Flow {
        let config = &self.components.config;
        let cap = config.max_header_size + config.max_body_size + config.read_buffer_size;
        let chunk = config.read_buffer_size.max(1);
        let max_spurious = config.max_spurious_wakeups;
        let max_header_size = config.max_header_size;
        let deadline = self.read_deadline();

        let Some(stream) = self.stream.as_mut() else {
            return Flow::Exit(Action::done());
        };

        let mut progressed = false;
        while !self.eof && self.input.len() < cap {
            let start = self.input.len();
            self.input.resize(start + chunk, 0);
            let result = stream.read(&mut self.input[start..]);
            self.input.truncate(start + *result.as_ref().unwrap_or(&0));

            match result {
                Ok(0) => self.eof = true,
                Ok(_) => progressed = true,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if progressed {
                        break;
                    }
                    if woken {
                        self.spurious += 1;
                        if self.spurious > max_spurious {
                            return self.stream_fault(io::Error::new(
                                io::ErrorKind::WouldBlock,
                                "too many spurious wakeups",
                            ));
                        }
                    }
                    return Flow::Wait(Phase::AwaitInput, stream.readable(Some(deadline)));
                }
                Err(err) => return self.stream_fault(err),
            }
        }

        if !progressed && self.head.is_none() && self.input.len() >= cap {
            // Buffer full and still no complete head
            return self.fail_exchange(
                ProtocolError::HeaderTooLarge {
                    limit: max_header_size,
                }
                .into(),
            );
        }

        if progressed {
            self.spurious = 0;
            if self.request_started.is_none() {
                self.request_started = Some(Instant::now());
            }
        } else if self.request_started.is_none() {
            // Peer closed between requests
            return Flow::Exit(self.close("peer closed"));
        } else if self.eof {
            return self.stream_fault(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-request",
            ));
        }

        if self.head.is_some() {
            Flow::Next(Phase::ParseBody)
        } else {
            Flow::Next(Phase::ParseHeaders)
        }
    }

    fn read_deadline(&self) -> Instant {
        let config = &self.components.config;
        match self.request_started {
            Some(started) => started + config.request_timeout,
            None => self.idle_since + config.keep_alive_timeout,
        }
    }

    fn parse_headers(&mut self) -> Flow {
        let config = &self.components.config;
        match parse_head(&self.input, config.max_header_size) {
            Ok(Some((head, used))) => {
                self.input.drain(..used);
                self.version = head.version;
                self.head_only = head.method == Method::Head;
                match head.body_length(config.max_body_size) {
                    Ok(length) => {
                        self.body_length = length;
                        self.head = Some(head);
                        Flow::Next(Phase::ParseBody)
                    }
                    Err(err) => self.fail_exchange(err.into()),
                }
            }
            Ok(None) => Flow::Next(Phase::AwaitInput),
            Err(err) => self.fail_exchange(err.into()),
        }
    }

    fn parse_body(&mut self) -> Flow {
        if self.input.len() < self.body_length {
            return Flow::Next(Phase::AwaitInput);
        }
        let Some(head) = self.head.take() else {
            return Flow::Next(Phase::ParseHeaders);
        };
        let body: Vec<u8> = self.input.drain(..self.body_length).collect();
        self.request = Some(Request::from_head(head, body));
        Flow::Next(Phase::Dispatch)
    }

    fn dispatch(&mut self) -> Flow {
        let Some(mut request) = self.request.take() else {
            return Flow::Next(Phase::AwaitInput);
        };
        self.keep_alive = wants_keep_alive(&self.components, &request);

        let components = self.components.clone();
        let params = &self.params;
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            for interceptor in &components.interceptors {
                if let Intercept::Respond(response) = interceptor.intercept(&mut request, params) {
                    return Ok(response);
                }
            }
            match components.router.route(&request.method, request.path()) {
                Some(handler) => handler.handle(&request, params).map_err(HttpError::from),
                None => Err(HttpError::NotFound {
                    method: request.method.clone(),
                    path: request.path().to_string(),
                }),
            }
        }));

        match result {
            Ok(Ok(response)) => {
                log::debug!(
                    "{} {} {} -> {}",
                    self.peer(),
                    request.method,
                    request.target,
                    response.status
                );
                self.prepare(response);
                Flow::Next(Phase::WriteResponse)
            }
            Ok(Err(err)) => {
                log::debug!("{} {} {}: {}", self.peer(), request.method, request.target, err);
                self.fail_exchange(err)
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!(
                    "{} {} {}: handler panicked: {}",
                    self.peer(),
                    request.method,
                    request.target,
                    message
                );
                self.fail_exchange(HttpError::Panicked(message))
            }
        }
    }

    fn fail_exchange(&mut self, error: HttpError) -> Flow {
        self.error = Some(error);
        Flow::Next(Phase::HandleError)
    }

    fn handle_http_error(&mut self) -> Flow {
        let Some(error) = self.error.take() else {
            return Flow::Next(Phase::AwaitInput);
        };
        if error.closes_connection() {
            self.keep_alive = false;
            log::debug!("{}: {}", self.peer(), error);
        }

        let handler = self.components.error_handler.clone();
        let response = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&error)))
            .unwrap_or_else(|_| {
                log::error!("error handler panicked on {:?}", error);
                Response::text(500, "500 Internal Server Error\n")
            });
        self.prepare(response);
        Flow::Next(Phase::WriteResponse)
    }

    fn prepare(&mut self, response: Response) {
        if response.headers.has_token("connection", "close") {
            self.keep_alive = false;
        }
        self.output = encode_response(&response, self.version, self.keep_alive, !self.head_only);
        self.written = 0;
        self.write_started = Some(Instant::now());
    }

    fn write_response(&mut self, woken: bool) -> Flow {
        let max_spurious = self.components.config.max_spurious_wakeups;
        let deadline = self.write_started.unwrap_or_else(Instant::now)
            + self.components.config.request_timeout;
        let Some(stream) = self.stream.as_mut() else {
            return Flow::Exit(Action::done());
        };

        let mut progressed = false;
        while self.written < self.output.len() {
            match stream.write(&self.output[self.written..]) {
                Ok(0) => {
                    return self.stream_fault(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection accepted no bytes",
                    ))
                }
                Ok(n) => {
                    self.written += n;
                    progressed = true;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if woken && !progressed {
                        self.spurious += 1;
                        if self.spurious > max_spurious {
                            return self.stream_fault(io::Error::new(
                                io::ErrorKind::WouldBlock,
                                "too many spurious wakeups",
                            ));
                        }
                    }
                    return Flow::Wait(Phase::AwaitOutputReady, stream.writable(Some(deadline)));
                }
                Err(err) => return self.stream_fault(err),
            }
        }
        if let Err(err) = stream.flush() {
            if err.kind() != io::ErrorKind::WouldBlock {
                return self.stream_fault(err);
            }
        }

        self.served += 1;
        self.spurious = 0;
        self.output.clear();
        self.written = 0;
        self.write_started = None;
        self.version = Version::Http11;
        self.head_only = false;

        if !self.keep_alive {
            return Flow::Exit(self.close("response complete"));
        }

        let now = Instant::now();
        self.idle_since = now;
        if self.input.is_empty() {
            self.request_started = None;
            Flow::Next(Phase::AwaitInput)
        } else {
            // Pipelined request already buffered
            self.request_started = Some(now);
            Flow::Next(Phase::ParseHeaders)
        }
    }

    fn stream_fault(&mut self, err: io::Error) -> Flow {
        log::debug!("{}: stream fault: {}", self.peer(), err);
        Flow::Exit(Action::fail(err))
    }

    fn close(&mut self, why: &str) -> Action {
        if let Some(stream) = self.stream.as_ref() {
            let _ = stream.shutdown(Shutdown::Write);
        }
        log::debug!(
            "{}: closed after {} request(s) ({})",
            self.peer(),
            self.served,
            why
        );
        Action::done()
    }
}

impl Coroutine for ConnectionPipeline {
    fn resume(&mut self, cx: &mut Context<'_>) -> Action {
        if self.stream.is_none() {
            let Some(stream) = self.pending.take() else {
                return Action::done();
            };
            match cx.register(stream) {
                Ok(stream) => self.stream = Some(stream),
                Err(err) => {
                    log::warn!("{}: failed to register connection: {}", self.peer(), err);
                    return Action::fail(err);
                }
            }
            self.idle_since = Instant::now();
        }
        self.advance(cx.wake() == Wake::Ready)
    }

    fn handle_error(&mut self, error: TaskError, _cx: &mut Context<'_>) -> Action {
        if error.is_timeout() {
            match self.phase {
                Phase::AwaitInput if self.request_started.is_none() => {
                    return self.close("idle timeout");
                }
                Phase::AwaitInput => {
                    self.error = Some(HttpError::RequestTimeout);
                    self.phase = Phase::HandleError;
                    return self.advance(false);
                }
                _ => {}
            }
        }
        log::debug!("{}: {}", self.peer(), error);
        Action::Finish(Err(error))
    }

    fn cancel(&mut self) {
        let result = match (self.stream.as_ref(), self.pending.as_ref()) {
            (Some(stream), _) => stream.shutdown(Shutdown::Both),
            (None, Some(stream)) => stream.shutdown(Shutdown::Both),
            (None, None) => Ok(()),
        };
        if let Err(err) = result {
            log::trace!("{}: shutdown on cancel: {}", self.peer(), err);
        }
    }

    fn name(&self) -> &'static str {
        "http-connection"
    }
}

/// Whether the connection may serve another request after this one
fn wants_keep_alive(components: &Components, request: &Request) -> bool {
    if !components.config.keep_alive {
        return false;
    }
    match request.version {
        Version::Http11 => !request.headers.has_token("connection", "close"),
        Version::Http10 => request.headers.has_token("connection", "keep-alive"),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
