//! Live subscription and delivery pump for one conversation.
//!
//! A [`Stream`] owns one transport [`Subscription`] and the tokio task that
//! drains it. Each envelope is decoded and passed to the stream's
//! [`StreamHandler`]. Per-message failures (undecodable payloads, duplicate
//! deliveries, store errors) are logged and skipped; only the end of the
//! subscription itself ends the pump, and an end with an error is reported
//! as an [`Event::Error`](crate::event::Event::Error).
//!
//! Lifecycle: `Idle` → [`start`](Stream::start) → `Running` →
//! [`stop`](Stream::stop) → `Idle`. A pump that ends on its own leaves the
//! stream `Stopped`; it can be started again.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use termsync_proto::codec;
use termsync_proto::contact::Contact;

use crate::event::EventBus;
use crate::handler::StreamHandler;
use crate::transport::{ChatOptions, Envelope, Subscription, Transport, TransportError};

/// Errors returned by stream lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// `start` was called while the pump is running.
    #[error("stream for {0} is already running")]
    AlreadyRunning(String),

    /// The transport refused the subscription.
    #[error("failed to subscribe to {contact}: {source}")]
    Subscribe {
        /// The conversation.
        contact: String,
        /// Underlying transport error.
        source: TransportError,
    },
}

/// Observable lifecycle state of a [`Stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Not started, or stopped by the owner.
    Idle,
    /// The pump task is draining the subscription.
    Running,
    /// The pump ended on its own because the subscription ended.
    Stopped,
}

struct Running {
    cancel: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// One live subscription plus its pump task.
pub struct Stream<T, H> {
    contact: Contact,
    options: ChatOptions,
    transport: Arc<T>,
    handler: Arc<H>,
    events: EventBus,
    running: Option<Running>,
}

impl<T, H> Stream<T, H>
where
    T: Transport + 'static,
    H: StreamHandler,
{
    /// Creates an idle stream.
    #[must_use]
    pub const fn new(
        contact: Contact,
        options: ChatOptions,
        transport: Arc<T>,
        handler: Arc<H>,
        events: EventBus,
    ) -> Self {
        Self {
            contact,
            options,
            transport,
            handler,
            events,
            running: None,
        }
    }

    /// The contact this stream was created for.
    #[must_use]
    pub const fn contact(&self) -> &Contact {
        &self.contact
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        match &self.running {
            None => StreamState::Idle,
            Some(running) if running.task.is_finished() => StreamState::Stopped,
            Some(_) => StreamState::Running,
        }
    }

    /// Subscribes and launches the pump task.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::AlreadyRunning`] if the pump is running, or
    /// [`StreamError::Subscribe`] if the transport refuses the subscription.
    pub async fn start(&mut self) -> Result<(), StreamError> {
        if self.state() == StreamState::Running {
            return Err(StreamError::AlreadyRunning(self.contact.to_string()));
        }
        self.running = None;

        let subscription = self
            .transport
            .subscribe(&self.options)
            .await
            .map_err(|source| StreamError::Subscribe {
                contact: self.contact.to_string(),
                source,
            })?;

        let (cancel, cancelled) = oneshot::channel();
        let task = tokio::spawn(pump(
            self.contact.clone(),
            subscription,
            Arc::clone(&self.handler),
            self.events.clone(),
            cancelled,
        ));
        self.running = Some(Running { cancel, task });
        tracing::debug!(contact = %self.contact, options = %self.options, "stream started");
        Ok(())
    }

    /// Cancels the pump and waits for it to exit.
    ///
    /// A message already being handled is allowed to finish. No-op when
    /// idle.
    pub async fn stop(&mut self) {
        let Some(Running { cancel, task }) = self.running.take() else {
            return;
        };
        let _ = cancel.send(());
        if let Err(e) = task.await {
            tracing::warn!(contact = %self.contact, error = %e, "stream task did not exit cleanly");
        }
        tracing::debug!(contact = %self.contact, "stream stopped");
    }
}

async fn pump<H: StreamHandler>(
    contact: Contact,
    mut subscription: Subscription,
    handler: Arc<H>,
    events: EventBus,
    mut cancelled: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;

            _ = &mut cancelled => {
                subscription.unsubscribe();
                return;
            }

            next = subscription.next() => {
                let Some(envelope) = next else {
                    if let Some(error) = subscription.error() {
                        tracing::warn!(
                            contact = %contact,
                            error = %error,
                            "subscription terminated"
                        );
                        events.error(&contact, &error).await;
                    } else {
                        tracing::debug!(contact = %contact, "subscription ended");
                    }
                    return;
                };
                deliver(&contact, handler.as_ref(), envelope).await;
            }
        }
    }
}

async fn deliver<H: StreamHandler>(contact: &Contact, handler: &H, envelope: Envelope) {
    let payload = match codec::decode(&envelope.payload) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(
                contact = %contact,
                id = %envelope.id,
                error = %e,
                "dropping undecodable payload"
            );
            return;
        }
    };
    let id = envelope.id.clone();
    match handler.handle(payload.into_message(envelope.id, envelope.signer)).await {
        Ok(()) => {}
        Err(e) if e.is_duplicate() => {
            tracing::debug!(contact = %contact, id = %id, "duplicate delivery");
        }
        Err(e) => {
            tracing::warn!(contact = %contact, id = %id, error = %e, "failed to handle message");
        }
    }
}
