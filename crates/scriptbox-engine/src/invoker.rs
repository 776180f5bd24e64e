//! Invocation driver.
//!
//! [`drive`] runs one guest entry point to completion.  It concurrently polls
//! the guest call future and the invocation's signal channel, so the guest is
//! suspended precisely while the host consumes an event or answers a
//! capability request:
//!
//! 1. `Emit` signals are delivered to the event handler and acknowledged --
//!    event order equals guest execution order.
//! 2. `Http` signals run one capability exchange: the registered handler gets
//!    the request and a fresh response sink, the driver awaits the sink's
//!    frames (start, chunks, close) in host-issued order, and the guest
//!    resumes with the assembled response only after close.
//!
//! The caller wraps the whole drive in a deadline, so time spent suspended on
//! a capability exchange counts against the invocation budget.

use tokio::sync::mpsc;

use crate::args::Argument;
use crate::error::{Result, SandboxError};
use crate::event::{Event, EventHandler};
use crate::http::{Frame, HttpHandler, HttpRequest, HttpResponse, ResponseBody};
use crate::isolation::{GuestInstance, GuestSignal, host_channel};

/// Drive one invocation of `entry` and deliver its events.
///
/// Returns once the guest call completed or faulted.  If the guest completed
/// without a terminal event, one `EndJson(None)` is appended so callers can
/// rely on exactly one terminal event per successful invocation.  After a
/// fault no further events are delivered.
pub(crate) async fn drive(
    instance: &mut dyn GuestInstance,
    entry: &str,
    args: &[Argument],
    events: &mut dyn EventHandler,
    http: Option<&dyn HttpHandler>,
    max_response_bytes: usize,
) -> Result<()> {
    let (host, mut signals) = host_channel();
    let mut call = instance.call_entry(entry, args, host);
    let mut terminal_seen = false;

    let call_result = loop {
        tokio::select! {
            biased;
            maybe_signal = signals.recv() => {
                match maybe_signal {
                    Some(signal) => {
                        handle_signal(signal, events, http, max_response_bytes, &mut terminal_seen)
                            .await;
                    }
                    // Every sender is gone; only completion remains.
                    None => break (&mut call).await,
                }
            }
            result = &mut call => break result,
        }
    };
    drop(call);

    // Signals sent between the final poll and completion.
    while let Ok(signal) = signals.try_recv() {
        handle_signal(signal, events, http, max_response_bytes, &mut terminal_seen).await;
    }

    call_result?;
    if !terminal_seen {
        events.on_event(Event::EndJson(None));
    }
    tracing::debug!(entry, "invocation completed");
    Ok(())
}

async fn handle_signal(
    signal: GuestSignal,
    events: &mut dyn EventHandler,
    http: Option<&dyn HttpHandler>,
    max_response_bytes: usize,
    terminal_seen: &mut bool,
) {
    match signal {
        GuestSignal::Emit(event, ack) => {
            if matches!(event, Event::EndJson(_)) {
                *terminal_seen = true;
            }
            events.on_event(event);
            let _ = ack.send(());
        }
        GuestSignal::Http(request, reply) => {
            tracing::debug!(
                method = %request.method,
                url = %request.url,
                "guest http request intercepted"
            );
            let outcome = match http {
                None => Err(SandboxError::CapabilityUnavailable { capability: "http" }),
                Some(handler) => exchange(handler, request, max_response_bytes).await,
            };
            let _ = reply.send(outcome);
        }
    }
}

/// Run one capability exchange: hand the request to the host handler, then
/// collect the response frames it delivers (possibly from another thread).
async fn exchange(
    handler: &dyn HttpHandler,
    request: HttpRequest,
    max_response_bytes: usize,
) -> Result<HttpResponse> {
    let (body, frames) = ResponseBody::channel();
    handler.handle(request, body)?;
    assemble(frames, max_response_bytes).await
}

async fn assemble(
    mut frames: mpsc::UnboundedReceiver<Frame>,
    max_response_bytes: usize,
) -> Result<HttpResponse> {
    let (status, headers) = match frames.recv().await {
        Some(Frame::Start { status, headers }) => (status, headers),
        Some(Frame::Violation(what)) => return Err(SandboxError::ProtocolViolation(what)),
        Some(Frame::Chunk(_) | Frame::Close) | None => {
            // The sink enforces ordering, so only a dropped sink reaches here.
            return Err(SandboxError::ProtocolViolation(
                "response dropped before start".into(),
            ));
        }
    };

    let mut chunks = Vec::new();
    let mut total = 0usize;
    loop {
        match frames.recv().await {
            Some(Frame::Chunk(chunk)) => {
                total += chunk.len();
                if total > max_response_bytes {
                    return Err(SandboxError::ProtocolViolation(format!(
                        "response body exceeded {max_response_bytes} bytes"
                    )));
                }
                chunks.push(chunk);
            }
            Some(Frame::Close) => {
                break Ok(HttpResponse {
                    status,
                    headers,
                    chunks,
                });
            }
            Some(Frame::Violation(what)) => break Err(SandboxError::ProtocolViolation(what)),
            Some(Frame::Start { .. }) | None => {
                break Err(SandboxError::ProtocolViolation(
                    "response dropped before close".into(),
                ));
            }
        }
    }
}
