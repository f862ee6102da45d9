//! Per-connection sessions and message fan-out.
//!
//! Every accepted connection runs [`Hub::handle_session`] in its own task.
//! The session registers the connection's [`Outbox`], then loops on the
//! connection's [`MessageSource`], broadcasting each message to every
//! connection registered at that moment. The registry is the only state
//! shared between sessions.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::io::AsyncBufRead;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::message::{JsonLines, Message};
use crate::registry::{
    ConnectionId, ConnectionIds, ConnectionRegistry, RegistryError, SequentialIds,
};

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(250);

/// Inbound half of a connection.
pub trait MessageSource: Send {
    /// Waits for the next message. `Ok(None)` means the peer finished sending.
    fn recv(&mut self) -> impl Future<Output = io::Result<Option<Message>>> + Send;
}

impl<R> MessageSource for JsonLines<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn recv(&mut self) -> io::Result<Option<Message>> {
        self.next_message().await
    }
}

impl MessageSource for mpsc::Receiver<io::Result<Message>> {
    async fn recv(&mut self) -> io::Result<Option<Message>> {
        mpsc::Receiver::recv(self).await.transpose()
    }
}

/// Outbound handle for one connection.
///
/// Wraps a bounded channel; whoever owns the receiving end writes the
/// messages to the wire. Dropping that receiver makes every later delivery
/// fail with [`DeliveryError::Closed`].
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Message>,
}

impl Outbox {
    /// Creates an outbox buffering up to `capacity` messages (at least one).
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queues `message`, giving up once the buffer has stayed full for `timeout`.
    pub async fn deliver(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        self.tx
            .send_timeout(message, timeout)
            .await
            .map_err(|err| match err {
                SendTimeoutError::Timeout(_) => DeliveryError::TimedOut(timeout),
                SendTimeoutError::Closed(_) => DeliveryError::Closed,
            })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("recipient connection is closed")]
    Closed,
    #[error("recipient did not accept the message within {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to receive from connection")]
    Receive(#[source] io::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Opening,
    Active,
    Closing,
    Closed,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Upper bound on how long a single recipient may stall a broadcast.
    pub send_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

/// Connection registry plus the broadcast loop. Cloning shares the registry.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    registry: ConnectionRegistry<Outbox>,
    ids: Box<dyn ConnectionIds>,
    config: HubConfig,
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self::with_ids(config, SequentialIds::new())
    }

    pub fn with_ids(config: HubConfig, ids: impl ConnectionIds) -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: ConnectionRegistry::new(),
                ids: Box::new(ids),
                config,
            }),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Runs one connection from registration to deregistration.
    ///
    /// Returns `Ok(())` when the peer ends its stream and an error when
    /// receiving fails. Either way the connection is deregistered before
    /// this returns. A session whose id is already taken never registers
    /// and fails with [`RegistryError::DuplicateIdentity`].
    pub async fn handle_session<S>(
        &self,
        mut source: S,
        outbox: Outbox,
    ) -> Result<(), SessionError>
    where
        S: MessageSource,
    {
        let id = self.inner.ids.next_id();
        let span = info_span!("session", connection = %id);
        self.run_session(id, &mut source, outbox)
            .instrument(span)
            .await
    }

    async fn run_session<S>(
        &self,
        id: ConnectionId,
        source: &mut S,
        outbox: Outbox,
    ) -> Result<(), SessionError>
    where
        S: MessageSource,
    {
        let mut state = SessionState::Opening;
        debug!(?state, "session opening");

        if let Err(err) = self.inner.registry.add(id, outbox) {
            // The id belongs to another live session; leave its entry alone.
            advance(&mut state, SessionState::Closed);
            return Err(err.into());
        }

        advance(&mut state, SessionState::Active);
        info!(connections = self.connection_count(), "connection registered");
        let outcome = self.pump(source).await;

        advance(&mut state, SessionState::Closing);
        self.inner.registry.remove(id);
        advance(&mut state, SessionState::Closed);
        info!(connections = self.connection_count(), "connection deregistered");

        outcome
    }

    async fn pump<S>(&self, source: &mut S) -> Result<(), SessionError>
    where
        S: MessageSource,
    {
        loop {
            match source.recv().await {
                Ok(Some(message)) => {
                    info!(
                        message_id = %message.id,
                        sender = %message.sender.name,
                        recipient = %message.recipient.name,
                        "received message"
                    );
                    let report = self.broadcast(&message).await;
                    debug!(
                        delivered = report.delivered,
                        failed = report.failed,
                        "broadcast finished"
                    );
                }
                Ok(None) => {
                    debug!("peer finished sending");
                    return Ok(());
                }
                Err(err) => return Err(SessionError::Receive(err)),
            }
        }
    }

    /// Sends `message` to every connection registered right now.
    ///
    /// Deliveries run concurrently, each bounded by the configured send
    /// timeout. A failed delivery is logged and counted and never affects
    /// the other recipients.
    pub async fn broadcast(&self, message: &Message) -> BroadcastReport {
        let recipients = self.inner.registry.snapshot();
        let timeout = self.inner.config.send_timeout;

        let deliveries = recipients.into_iter().map(|(id, outbox)| async move {
            (id, outbox.deliver(message.clone(), timeout).await)
        });

        let mut report = BroadcastReport::default();
        for (id, result) in join_all(deliveries).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    warn!(
                        recipient = %id,
                        message_id = %message.id,
                        %error,
                        "broadcast delivery failed"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }
}

fn advance(state: &mut SessionState, next: SessionState) {
    let from = *state;
    debug!(?from, to = ?next, "session state change");
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::User;

    fn sample() -> Message {
        Message::new(User::new("alice"), User::new("bob"), "hi")
    }

    #[tokio::test]
    async fn deliver_to_dropped_receiver_is_closed() {
        let (outbox, rx) = Outbox::channel(4);
        drop(rx);

        let result = outbox.deliver(sample(), Duration::from_millis(10)).await;
        assert_eq!(result, Err(DeliveryError::Closed));
    }

    #[tokio::test]
    async fn deliver_to_full_outbox_times_out() {
        let (outbox, _rx) = Outbox::channel(1);
        let timeout = Duration::from_millis(20);
        outbox.deliver(sample(), timeout).await.expect("first fits");

        let result = outbox.deliver(sample(), timeout).await;
        assert_eq!(result, Err(DeliveryError::TimedOut(timeout)));
    }

    #[tokio::test]
    async fn broadcast_with_no_connections_is_empty() {
        let hub = Hub::new(HubConfig::default());
        let report = hub.broadcast(&sample()).await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn channel_source_maps_closed_channel_to_end_of_input() {
        let (tx, mut rx) = mpsc::channel::<io::Result<Message>>(1);
        tx.send(Ok(sample())).await.expect("send");
        drop(tx);

        assert!(MessageSource::recv(&mut rx).await.expect("message").is_some());
        assert!(MessageSource::recv(&mut rx).await.expect("eof").is_none());
    }
}
