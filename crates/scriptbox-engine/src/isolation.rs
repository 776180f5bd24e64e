//! The substitutable guest isolation boundary.
//!
//! The engine never talks to a concrete isolation technology directly.  It
//! goes through two seams:
//!
//! - [`IsolationBackend`] -- loads/validates a runtime image and instantiates
//!   guest instances from it.  One backend serves a whole context.
//! - [`GuestInstance`] -- one isolated guest: compiles script source and runs
//!   entry points.
//!
//! During a call the guest reaches back into the host exclusively through a
//! [`HostChannel`]: a message-passing handoff, so that capability responses
//! delivered from arbitrary host threads synchronize cleanly with the guest's
//! single logical thread of execution.  Event emission is acknowledged -- the
//! guest does not advance until the host handler consumed the event.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::args::Argument;
use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::event::Event;
use crate::http::{HttpRequest, HttpResponse};
use crate::image::RuntimeImage;

/// A signal travelling from the guest side to the invocation driver.
pub(crate) enum GuestSignal {
    /// An event to deliver; the sender blocks until acknowledged.
    Emit(Event, oneshot::Sender<()>),
    /// A capability request; the guest stays suspended until the reply.
    Http(HttpRequest, oneshot::Sender<Result<HttpResponse>>),
}

/// The guest's handle to the host during one invocation.
///
/// Cheap to clone; all clones feed the same invocation.
#[derive(Clone)]
pub struct HostChannel {
    tx: mpsc::UnboundedSender<GuestSignal>,
}

impl HostChannel {
    /// Deliver an event to the host's event handler, in emission order.
    ///
    /// Resolves once the handler returned, so event delivery stays
    /// synchronous with guest progress.
    pub async fn emit(&self, event: Event) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(GuestSignal::Emit(event, ack_tx))
            .map_err(|_| aborted())?;
        ack_rx.await.map_err(|_| aborted())
    }

    /// Perform a host-intercepted HTTP request.
    ///
    /// Suspends the calling guest until the host's handler completed the
    /// three-phase response protocol (or the exchange failed).
    pub async fn http_request(&self, request: HttpRequest) -> Result<HttpResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(GuestSignal::Http(request, reply_tx))
            .map_err(|_| aborted())?;
        reply_rx.await.map_err(|_| aborted())?
    }
}

fn aborted() -> SandboxError {
    SandboxError::InvalidState("invocation is no longer running")
}

/// Create the guest/host signal pair for one invocation.
pub(crate) fn host_channel() -> (HostChannel, mpsc::UnboundedReceiver<GuestSignal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (HostChannel { tx }, rx)
}

/// One isolated guest instance with mutable execution state.
#[async_trait]
pub trait GuestInstance: Send {
    /// Compile `source` inside the guest, replacing any previously loaded
    /// script.
    ///
    /// Syntax/semantic errors surface as [`SandboxError::Compile`] carrying
    /// the guest diagnostic.  The caller bounds compilation time.
    async fn compile(&mut self, source: &str) -> Result<()>;

    /// Resolve and run an entry point of the loaded script.
    ///
    /// Implementations emit every produced value, stdout write and log line
    /// through `host` at the moment it occurs, and report
    /// [`SandboxError::EntryNotFound`], [`SandboxError::Argument`] or
    /// [`SandboxError::GuestFault`] as the guest does.
    async fn call_entry(
        &mut self,
        entry: &str,
        args: &[Argument],
        host: HostChannel,
    ) -> Result<()>;
}

/// A concrete isolation technology (wasm by default).
#[async_trait]
pub trait IsolationBackend: Send + Sync + 'static {
    /// Validate and prepare a runtime image for instantiation.
    ///
    /// Malformed images fail with [`SandboxError::InvalidImage`].
    async fn load_image(&self, image: &RuntimeImage) -> Result<()>;

    /// Bring up one isolated guest instance.
    ///
    /// Fails with [`SandboxError::StartFailure`] when the isolation boundary
    /// cannot be instantiated.
    async fn instantiate(
        &self,
        image: &RuntimeImage,
        config: &SandboxConfig,
    ) -> Result<Box<dyn GuestInstance>>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_resolves_after_ack() {
        let (host, mut rx) = host_channel();

        let emitter = tokio::spawn(async move {
            host.emit(Event::Stdout(b"hi".to_vec())).await
        });

        match rx.recv().await.expect("signal must arrive") {
            GuestSignal::Emit(event, ack) => {
                assert_eq!(event, Event::Stdout(b"hi".to_vec()));
                ack.send(()).unwrap();
            }
            GuestSignal::Http(..) => panic!("expected emit signal"),
        }
        emitter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn http_request_receives_reply() {
        let (host, mut rx) = host_channel();
        let request = HttpRequest::new("GET", "http://mock.test/hello").unwrap();

        let caller = tokio::spawn(async move { host.http_request(request).await });

        match rx.recv().await.expect("signal must arrive") {
            GuestSignal::Http(request, reply) => {
                assert_eq!(request.method, "GET");
                reply
                    .send(Ok(HttpResponse {
                        status: 200,
                        headers: vec![],
                        chunks: vec![b"ok".to_vec()],
                    }))
                    .ok();
            }
            GuestSignal::Emit(..) => panic!("expected http signal"),
        }

        let response = caller.await.unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body_text(), "ok");
    }

    #[tokio::test]
    async fn dropped_receiver_aborts_guest_side() {
        let (host, rx) = host_channel();
        drop(rx);
        let err = host.emit(Event::EndJson(None)).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState(_)));
    }
}
