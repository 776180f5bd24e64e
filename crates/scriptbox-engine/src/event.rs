//! Events delivered to the host while a guest invocation runs.
//!
//! Events arrive in guest execution order, never batched at the end of a run.
//! Terminal-event convention: every invocation that completes without a fault
//! delivers exactly one [`Event::EndJson`] -- carrying the return value for a
//! normal return, or `None` after a generator's final yield.
//! [`Event::ResultJson`] is only ever an intermediate yield.

/// Discriminant of an [`Event`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// One value produced by a generator-style entry point.
    ResultJson,
    /// Terminal event of an invocation.
    EndJson,
    /// Bytes the guest wrote to its standard output stream.
    Stdout,
    /// A structured log line emitted by guest code.
    Log,
}

/// A single event produced by a running invocation.
///
/// Payloads are opaque encoded bytes (commonly JSON) that the engine passes
/// through unmodified.  Events own their payload, so handlers may keep it
/// without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// One value produced by a generator-style entry point, in production
    /// order.
    ResultJson(Vec<u8>),
    /// Terminal event; `Some` carries the return value of a normal return.
    EndJson(Option<Vec<u8>>),
    /// Bytes written to the guest's standard output, at the point they
    /// occurred.
    Stdout(Vec<u8>),
    /// A structured log line from guest code.
    Log(Vec<u8>),
}

impl Event {
    /// The event's discriminant.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ResultJson(_) => EventKind::ResultJson,
            Self::EndJson(_) => EventKind::EndJson,
            Self::Stdout(_) => EventKind::Stdout,
            Self::Log(_) => EventKind::Log,
        }
    }

    /// The payload bytes, if the event carries any.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Self::ResultJson(bytes) | Self::Stdout(bytes) | Self::Log(bytes) => Some(bytes),
            Self::EndJson(bytes) => bytes.as_deref(),
        }
    }
}

/// Receiver for the events of a sandbox's invocations.
///
/// The handler runs synchronously with respect to guest progress: the guest
/// does not advance until `on_event` returns.
pub trait EventHandler: Send + 'static {
    /// Called once per event, in emission order.
    fn on_event(&mut self, event: Event);
}

impl<F> EventHandler for F
where
    F: FnMut(Event) + Send + 'static,
{
    fn on_event(&mut self, event: Event) {
        self(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(Event::ResultJson(vec![]).kind(), EventKind::ResultJson);
        assert_eq!(Event::EndJson(None).kind(), EventKind::EndJson);
        assert_eq!(Event::Stdout(vec![]).kind(), EventKind::Stdout);
        assert_eq!(Event::Log(vec![]).kind(), EventKind::Log);
    }

    #[test]
    fn payload_of_end_event() {
        assert_eq!(Event::EndJson(None).payload(), None);
        assert_eq!(
            Event::EndJson(Some(b"42".to_vec())).payload(),
            Some(&b"42"[..])
        );
    }

    #[test]
    fn payload_of_value_events() {
        assert_eq!(
            Event::ResultJson(b"1".to_vec()).payload(),
            Some(&b"1"[..])
        );
        assert_eq!(
            Event::Stdout(b"hi".to_vec()).payload(),
            Some(&b"hi"[..])
        );
    }

    #[test]
    fn closures_are_handlers() {
        use std::sync::{Arc, Mutex};

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut handler = move |event: Event| sink.lock().unwrap().push(event.kind());
        handler.on_event(Event::Stdout(b"x".to_vec()));
        handler.on_event(Event::EndJson(None));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![EventKind::Stdout, EventKind::EndJson]
        );
    }
}
