//! HTTP capability interception.
//!
//! When guest code performs a network request the engine does not open a
//! socket itself: it hands an [`HttpRequest`] descriptor to the host's
//! registered [`HttpHandler`] together with a [`ResponseBody`] sink.  The
//! handler may return immediately and complete the response later from any
//! thread, by performing exactly one [`ResponseBody::start`], any number of
//! [`ResponseBody::push`] calls, and exactly one [`ResponseBody::close`], in
//! that order.  Frames reach the suspended guest in the order the host issued
//! them; the guest resumes only after `close`.
//!
//! Protocol violations poison the sink and fail the exchange with
//! [`SandboxError::ProtocolViolation`]; they never crash the process or
//! corrupt the sandbox.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::{Result, SandboxError};

/// One header of a request or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

impl HttpHeader {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Request descriptor handed to the host's HTTP handler.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<HttpHeader>,
}

impl HttpRequest {
    /// Build a request descriptor, validating the URL.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        url::Url::parse(&url)
            .map_err(|e| SandboxError::Argument(format!("invalid request url '{url}': {e}")))?;
        Ok(Self {
            method: method.into(),
            url,
            headers: Vec::new(),
        })
    }

    /// Append a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(HttpHeader::new(name, value));
        self
    }
}

/// Assembled response delivered back into the suspended guest call.
///
/// Chunk boundaries are preserved exactly as the host pushed them.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<HttpHeader>,
    pub chunks: Vec<Vec<u8>>,
}

impl HttpResponse {
    /// The concatenated body bytes.
    pub fn body(&self) -> Vec<u8> {
        self.chunks.iter().flatten().copied().collect()
    }

    /// The body as (lossy) UTF-8 text.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body()).into_owned()
    }
}

/// Host-supplied interceptor for guest HTTP requests.
///
/// `handle` is called on the invocation's driving thread and must not block
/// on the response: deliver it through `body`, from this call or from any
/// other thread, and return.  Returning an error fails the exchange without
/// touching the sink.
pub trait HttpHandler: Send + Sync + 'static {
    fn handle(&self, request: HttpRequest, body: ResponseBody) -> Result<()>;
}

impl<F> HttpHandler for F
where
    F: Fn(HttpRequest, ResponseBody) -> Result<()> + Send + Sync + 'static,
{
    fn handle(&self, request: HttpRequest, body: ResponseBody) -> Result<()> {
        self(request, body)
    }
}

/// One frame of a response as it travels from the delivering thread to the
/// suspended guest.
#[derive(Debug)]
pub(crate) enum Frame {
    Start {
        status: u16,
        headers: Vec<HttpHeader>,
    },
    Chunk(Vec<u8>),
    Close,
    /// The delivering side broke the protocol; the exchange must fail.
    Violation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkState {
    Idle,
    Started,
    Closed,
    Poisoned,
}

/// Sink through which a capability handler streams a response back into a
/// suspended guest call.
///
/// The sink is `Send` and may be moved to any thread.  It serves exactly one
/// exchange; once closed (or poisoned by a violation) every further call
/// fails.
pub struct ResponseBody {
    tx: mpsc::UnboundedSender<Frame>,
    state: Arc<Mutex<SinkState>>,
}

impl ResponseBody {
    /// Create a sink plus the receiver the invoker drains frames from.
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                state: Arc::new(Mutex::new(SinkState::Idle)),
            },
            rx,
        )
    }

    /// Begin the response with a status code and headers.
    ///
    /// Must be the first call on the sink and must happen exactly once.
    pub fn start(&self, status: u16, headers: &[HttpHeader]) -> Result<()> {
        let mut state = self.state.lock().expect("sink state lock");
        match *state {
            SinkState::Idle => {
                *state = SinkState::Started;
                self.send(Frame::Start {
                    status,
                    headers: headers.to_vec(),
                })
            }
            SinkState::Started => self.violate(&mut state, "start called twice"),
            SinkState::Closed => self.violate(&mut state, "start after close"),
            SinkState::Poisoned => Err(already_failed()),
        }
    }

    /// Append one body chunk, in the order bytes should appear in the body.
    pub fn push(&self, chunk: &[u8]) -> Result<()> {
        let mut state = self.state.lock().expect("sink state lock");
        match *state {
            SinkState::Started => self.send(Frame::Chunk(chunk.to_vec())),
            SinkState::Idle => self.violate(&mut state, "push before start"),
            SinkState::Closed => self.violate(&mut state, "push after close"),
            SinkState::Poisoned => Err(already_failed()),
        }
    }

    /// Finish the response.  The guest resumes once this frame is consumed.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock().expect("sink state lock");
        match *state {
            SinkState::Started => {
                *state = SinkState::Closed;
                self.send(Frame::Close)
            }
            SinkState::Idle => self.violate(&mut state, "close before start"),
            SinkState::Closed => self.violate(&mut state, "close called twice"),
            SinkState::Poisoned => Err(already_failed()),
        }
    }

    fn send(&self, frame: Frame) -> Result<()> {
        self.tx.send(frame).map_err(|_| {
            // The invocation ended (timeout or abort) and dropped the receiver.
            SandboxError::InvalidState("http exchange is no longer pending")
        })
    }

    fn violate(&self, state: &mut SinkState, what: &str) -> Result<()> {
        *state = SinkState::Poisoned;
        tracing::warn!(violation = what, "http response sink misused");
        let _ = self.tx.send(Frame::Violation(what.to_string()));
        Err(SandboxError::ProtocolViolation(what.to_string()))
    }
}

fn already_failed() -> SandboxError {
    SandboxError::ProtocolViolation("exchange already failed".into())
}
