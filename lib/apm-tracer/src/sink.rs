use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::debug;

use crate::span::Trace;

/// A destination for completed traces.
///
/// `submit` is called from within the span-closing path of the subscriber, so implementations must not block.
pub trait TraceSink: Send + Sync {
    /// Submits a completed trace.
    fn submit(&self, trace: Trace);
}

/// Creates a bounded trace queue, returning the sending half as a [`TraceSink`] and the receiving half for an exporter.
pub fn trace_channel(capacity: usize) -> (ChannelSink, TraceReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (ChannelSink { tx }, TraceReceiver { rx })
}

/// A [`TraceSink`] backed by a bounded channel.
///
/// When the channel is full, traces are dropped rather than blocking the caller.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<Trace>,
}

impl TraceSink for ChannelSink {
    fn submit(&self, trace: Trace) {
        match self.tx.try_send(trace) {
            Ok(()) => {}
            Err(TrySendError::Full(trace)) => {
                debug!(spans = trace.len(), "Trace queue full. Dropping trace.");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

/// Receiving half of a trace queue created by [`trace_channel`].
pub struct TraceReceiver {
    rx: mpsc::Receiver<Trace>,
}

impl TraceReceiver {
    pub(crate) async fn recv(&mut self) -> Option<Trace> {
        self.rx.recv().await
    }

    pub(crate) fn try_recv(&mut self) -> Option<Trace> {
        self.rx.try_recv().ok()
    }
}
