// ABOUTME: Call records and the caller-facing CallHandle - one pending or
// ABOUTME: in-flight unit of work and the event stream delivered for it.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::Canceller;
use crate::error::CallError;

/// An event delivered for one call.
#[derive(Debug)]
pub enum CallEvent {
    /// The call was dispatched to a worker. The canceller stops that worker.
    Started(Canceller),
    /// Intermediate data streamed by the task.
    Data(Value),
    /// The task finished with an output.
    Complete(Value),
    /// The call failed: task error, timeout, or worker termination.
    Error(CallError),
    /// The task ended without output.
    Exit,
}

impl CallEvent {
    /// Whether this event ends the call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Error(_) | Self::Exit)
    }
}

/// Caller-facing handle for one submitted call.
///
/// Events arrive in order; `recv` yields at most one terminal event and then
/// `None`.
#[derive(Debug)]
pub struct CallHandle {
    events: mpsc::UnboundedReceiver<CallEvent>,
    finished: bool,
}

impl CallHandle {
    /// Wait for the next event.
    ///
    /// Returns `None` after the terminal event, or if the farm was dropped
    /// while the call was still pending.
    pub async fn recv(&mut self) -> Option<CallEvent> {
        self.next().await
    }

    /// Wait for the call to finish, skipping `Started` and `Data` events.
    ///
    /// `Exit` resolves to `Value::Null`.
    pub async fn result(mut self) -> Result<Value, CallError> {
        while let Some(event) = self.recv().await {
            match event {
                CallEvent::Complete(output) => return Ok(output),
                CallEvent::Error(err) => return Err(err),
                CallEvent::Exit => return Ok(Value::Null),
                CallEvent::Started(_) | CallEvent::Data(_) => {}
            }
        }
        Err(CallError::Abandoned)
    }
}

impl Stream for CallHandle {
    type Item = CallEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<CallEvent>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let event = ready!(self.events.poll_recv(cx));
        match &event {
            Some(e) if e.is_terminal() => self.finished = true,
            None => self.finished = true,
            _ => {}
        }
        Poll::Ready(event)
    }
}

struct CallTimer {
    token: u64,
    abort: AbortHandle,
}

/// Farm-side record of a call, owned by the queue or by a worker slot.
pub(crate) struct CallRecord {
    pub args: Vec<Value>,
    pub retries: u32,
    timer: Option<CallTimer>,
    sink: mpsc::UnboundedSender<CallEvent>,
}

impl CallRecord {
    pub fn new(args: Vec<Value>) -> (Self, CallHandle) {
        let (sink, events) = mpsc::unbounded_channel();
        let record = Self {
            args,
            retries: 0,
            timer: None,
            sink,
        };
        let handle = CallHandle {
            events,
            finished: false,
        };
        (record, handle)
    }

    /// Deliver an event. A caller that dropped its handle is not an error.
    pub fn emit(&self, event: CallEvent) {
        let _ = self.sink.send(event);
    }

    pub fn arm_timer(&mut self, token: u64, abort: AbortHandle) {
        self.clear_timer();
        self.timer = Some(CallTimer { token, abort });
    }

    pub fn clear_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort.abort();
        }
    }

    pub fn timer_token(&self) -> Option<u64> {
        self.timer.as_ref().map(|t| t.token)
    }
}

impl Drop for CallRecord {
    fn drop(&mut self) {
        self.clear_timer();
    }
}
