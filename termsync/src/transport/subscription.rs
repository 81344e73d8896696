//! Subscription handle shared between a transport and a stream pump.
//!
//! A subscription is a bounded [`tokio::sync::mpsc`] channel of
//! [`Envelope`]s plus a terminal-error slot. The transport keeps the
//! [`SubscriptionSink`]; the engine keeps the [`Subscription`]. When every
//! sink is gone, [`Subscription::next`] returns `None` (the "done" signal)
//! and [`Subscription::error`] reports why, if the transport said so.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Envelope, TransportError};

/// Receiving side of a subscription, owned by a stream.
pub struct Subscription {
    envelopes: mpsc::Receiver<Envelope>,
    terminal: Arc<Mutex<Option<TransportError>>>,
}

/// Delivering side of a subscription, owned by the transport.
#[derive(Clone)]
pub struct SubscriptionSink {
    tx: mpsc::Sender<Envelope>,
    terminal: Arc<Mutex<Option<TransportError>>>,
}

impl Subscription {
    /// Creates a connected sink/subscription pair with the given capacity.
    #[must_use]
    pub fn channel(buffer: usize) -> (SubscriptionSink, Self) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let terminal = Arc::new(Mutex::new(None));
        (
            SubscriptionSink {
                tx,
                terminal: Arc::clone(&terminal),
            },
            Self {
                envelopes: rx,
                terminal,
            },
        )
    }

    /// Waits for the next envelope.
    ///
    /// Returns `None` once the transport has ended the subscription and all
    /// buffered envelopes have been drained.
    pub async fn next(&mut self) -> Option<Envelope> {
        self.envelopes.recv().await
    }

    /// The terminal error the transport recorded, if any.
    #[must_use]
    pub fn error(&self) -> Option<TransportError> {
        self.terminal.lock().clone()
    }

    /// Stops accepting deliveries and drops the handle.
    ///
    /// The transport notices through [`SubscriptionSink::is_closed`] and
    /// prunes the sink.
    pub fn unsubscribe(mut self) {
        self.envelopes.close();
    }
}

impl SubscriptionSink {
    /// Delivers one envelope, waiting for capacity.
    ///
    /// Returns `false` if the subscriber has gone away.
    pub async fn deliver(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).await.is_ok()
    }

    /// Whether the subscriber has unsubscribed or been dropped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Records a terminal error and ends this sink.
    ///
    /// The subscription completes once every clone of the sink is dropped.
    pub fn fail(self, error: TransportError) {
        let mut slot = self.terminal.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
    }
}
