//! Fatal-error broadcast from workers to whatever hosts them.

use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct ShutdownMessage {
    pub error: Arc<anyhow::Error>,
    pub instance_id: String,
}

enum Sink {
    Broadcast(async_broadcast::Sender<ShutdownMessage>),
    Panic,
    Noop,
}

/// Handed to each indexer instance so a fatal error (terminal `ERROR` state)
/// reaches the host process.
#[derive(Clone)]
pub struct ShutdownSignal {
    sink: Arc<Sink>,
    instance_id: String,
}

impl ShutdownSignal {
    pub fn new(shutdown_tx: async_broadcast::Sender<ShutdownMessage>, instance_id: String) -> Self {
        Self {
            sink: Arc::new(Sink::Broadcast(shutdown_tx)),
            instance_id,
        }
    }

    /// For tools that want a fatal error to abort the process.
    pub fn panic() -> Self {
        Self {
            sink: Arc::new(Sink::Panic),
            instance_id: String::new(),
        }
    }

    /// For tests that observe the terminal state through status instead.
    pub fn noop() -> Self {
        Self {
            sink: Arc::new(Sink::Noop),
            instance_id: String::new(),
        }
    }

    pub fn signal(&self, fatal_error: anyhow::Error) {
        match &*self.sink {
            Sink::Broadcast(tx) => {
                _ = tx.try_broadcast(ShutdownMessage {
                    error: Arc::new(fatal_error),
                    instance_id: self.instance_id.clone(),
                });
            },
            Sink::Panic => panic!("shutting down due to fatal error: {fatal_error:#}"),
            Sink::Noop => (),
        }
    }
}
