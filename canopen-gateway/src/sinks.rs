//! Observers for inbound process data and error frames.
//!
//! Sinks run on the dispatch task, in line with frame reception, so they
//! must return quickly. Anything slow belongs behind `subscribe_frames`.

use std::sync::{Arc, Mutex, MutexGuard};

use canopen_common::{ErrorMessage, Frame, PdoMessage};
use tokio::sync::mpsc;

pub trait PdoSink: Send + Sync {
    fn on_pdo(&self, pdo: &PdoMessage);
}

pub trait ErrorSink: Send + Sync {
    fn on_error(&self, error: &ErrorMessage);
}

impl<F> PdoSink for F
where
    F: Fn(&PdoMessage) + Send + Sync,
{
    fn on_pdo(&self, pdo: &PdoMessage) {
        self(pdo)
    }
}

impl<F> ErrorSink for F
where
    F: Fn(&ErrorMessage) + Send + Sync,
{
    fn on_error(&self, error: &ErrorMessage) {
        self(error)
    }
}

/// Current sinks plus raw frame subscribers; outlives individual sessions.
#[derive(Default)]
pub struct SinkRegistry {
    pdo: Mutex<Option<Arc<dyn PdoSink>>>,
    error: Mutex<Option<Arc<dyn ErrorSink>>>,
    raw_frame_subscribers: Mutex<Vec<mpsc::UnboundedSender<Frame>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SinkRegistry {
    pub fn set_pdo_sink(&self, sink: Arc<dyn PdoSink>) {
        *lock(&self.pdo) = Some(sink);
    }

    pub fn set_error_sink(&self, sink: Arc<dyn ErrorSink>) {
        *lock(&self.error) = Some(sink);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.raw_frame_subscribers).push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.raw_frame_subscribers).len()
    }

    /// Returns whether a sink was registered.
    pub fn dispatch_pdo(&self, pdo: &PdoMessage) -> bool {
        // clone out so the sink runs without holding the registry lock
        let sink = lock(&self.pdo).clone();
        match sink {
            Some(sink) => {
                sink.on_pdo(pdo);
                true
            }
            None => false,
        }
    }

    pub fn dispatch_error(&self, error: &ErrorMessage) -> bool {
        let sink = lock(&self.error).clone();
        match sink {
            Some(sink) => {
                sink.on_error(error);
                true
            }
            None => false,
        }
    }

    /// Broadcast to raw frame subscribers, pruning closed receivers.
    pub fn publish_frame(&self, frame: &Frame) {
        lock(&self.raw_frame_subscribers).retain(|subscriber| subscriber.send(*frame).is_ok());
    }
}
