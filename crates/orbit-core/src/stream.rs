// Event channel plumbing
//
// A bounded single-producer channel of canonical StreamEvents, with an
// error slot read after the channel closes. Backpressure on ordinary
// events is intentional and bounds in-flight memory; error-path sends are
// best-effort and never block on an absent consumer.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::error::{AgentError, Result};
use crate::events::StreamEvent;

/// Create a bounded event channel
pub fn event_channel(capacity: usize) -> (EventEmitter, EventStream) {
    let (tx, rx) = mpsc::channel(capacity);
    let error = Arc::new(Mutex::new(None));
    (
        EventEmitter {
            tx,
            error: Arc::clone(&error),
        },
        EventStream { rx, error },
    )
}

/// Producer half of an event channel
///
/// Cloned freely: the orchestrator, provider adapters, and event-emitting
/// tools all write through the same emitter for one run.
#[derive(Clone)]
pub struct EventEmitter {
    tx: mpsc::Sender<StreamEvent>,
    error: Arc<Mutex<Option<AgentError>>>,
}

impl EventEmitter {
    /// Send an ordinary event, waiting for channel capacity.
    ///
    /// Returns an error when the consumer dropped the stream.
    pub async fn emit(&self, event: StreamEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| AgentError::event("event stream receiver dropped"))
    }

    /// Send without blocking; the event is dropped if the channel is full
    /// or the consumer is gone. Used for error-path events only.
    pub fn emit_best_effort(&self, event: StreamEvent) {
        let _ = self.tx.try_send(event);
    }

    /// Record an error for the consumer to read after the channel closes
    pub fn set_error(&self, err: AgentError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Whether the consumer is still listening
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("open", &self.is_open())
            .finish()
    }
}

/// Consumer half of an event channel
///
/// Yields canonical events until the producer finishes; `take_error`
/// returns the recorded failure (if any) once the stream is exhausted.
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
    error: Arc<Mutex<Option<AgentError>>>,
}

impl EventStream {
    /// Take the error recorded by the producer, if any.
    ///
    /// Meaningful after the stream has yielded `None`; checking earlier
    /// races against the producer.
    pub fn take_error(&self) -> Option<AgentError> {
        self.error.lock().unwrap().take()
    }

    /// Drain every remaining event into a Vec (test helper)
    pub async fn collect_events(mut self) -> (Vec<StreamEvent>, Option<AgentError>) {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        let error = self.take_error();
        (events, error)
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (emitter, mut stream) = event_channel(4);

        tokio::spawn(async move {
            emitter.emit(StreamEvent::text_delta("a")).await.unwrap();
            emitter.emit(StreamEvent::text_delta("b")).await.unwrap();
        });

        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert!(matches!(first, StreamEvent::TextDelta { ref delta, .. } if delta == "a"));
        assert!(matches!(second, StreamEvent::TextDelta { ref delta, .. } if delta == "b"));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_readable_after_close() {
        let (emitter, mut stream) = event_channel(1);
        emitter.set_error(AgentError::provider("connection reset"));
        drop(emitter);

        assert!(stream.next().await.is_none());
        let err = stream.take_error().unwrap();
        assert!(matches!(err, AgentError::Provider(_)));
    }

    #[tokio::test]
    async fn test_best_effort_send_never_blocks() {
        let (emitter, stream) = event_channel(1);
        drop(stream);
        // Consumer is gone; this must not hang or panic.
        emitter.emit_best_effort(StreamEvent::warning("dropped"));
        assert!(!emitter.is_open());
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let (emitter, stream) = event_channel(1);
        emitter.set_error(AgentError::provider("first"));
        emitter.set_error(AgentError::provider("second"));
        drop(emitter);
        let (_, error) = stream.collect_events().await;
        assert_eq!(error.unwrap().to_string(), "Provider error: first");
    }
}
