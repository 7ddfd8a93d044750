use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::broker::{Backoff, BrokerError, Channel, Connector, Delivery, Properties};
use crate::config::PREFETCH_COUNT;

/// What to do with a delivery once its handler returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Reject { requeue: bool },
}

type FailureCallback = Box<dyn Fn(&BrokerError) + Send + Sync>;

/// Resilient broker connection with the pipeline's conventions.
///
/// The channel is shared: handlers publish through the same client that
/// feeds them, and [`BrokerClient::consume`] swaps in a new channel when the
/// old one is lost.
pub struct BrokerClient<C: Connector> {
    connector: C,
    backoff: Backoff,
    attempts: u32,
    on_failure: FailureCallback,
    channel: Mutex<Option<Arc<C::Channel>>>,
}

impl<C: Connector> BrokerClient<C> {
    /// Creates a client that tries `attempts` times before giving up.
    pub fn new(connector: C, attempts: u32, backoff: Backoff) -> Self {
        Self { connector, backoff, attempts: attempts.max(1), on_failure: Box::new(|_| {}), channel: Mutex::new(None) }
    }

    /// Runs `callback` once the attempt budget is exhausted.
    #[must_use]
    pub fn on_failure(mut self, callback: impl Fn(&BrokerError) + Send + Sync + 'static) -> Self {
        self.on_failure = Box::new(callback);
        self
    }

    /// Connects, retrying with backoff, and sets the prefetch to one.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionExhausted`] after the failure
    /// callback ran.
    pub async fn connect(&self) -> Result<(), BrokerError> {
        for attempt in 0..self.attempts {
            match self.connector.connect().await {
                Ok(channel) => {
                    channel.set_prefetch(PREFETCH_COUNT).await?;
                    info!(attempt = attempt + 1, "connected to the broker");
                    *self.slot() = Some(Arc::new(channel));
                    return Ok(());
                }
                Err(e) if attempt + 1 < self.attempts => {
                    let delay = self.backoff.delay(attempt);
                    warn!(attempt = attempt + 1, ?delay, "broker connection failed: {e}");
                    sleep(delay).await;
                }
                Err(e) => warn!(attempt = attempt + 1, "broker connection failed: {e}"),
            }
        }

        let error = BrokerError::ConnectionExhausted(self.attempts);
        error!("{error}");
        (self.on_failure)(&error);
        Err(error)
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<C::Channel>>> {
        self.channel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The open channel.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotConnected`] before [`BrokerClient::connect`] succeeded.
    pub fn channel(&self) -> Result<Arc<C::Channel>, BrokerError> {
        self.slot().clone().ok_or(BrokerError::NotConnected)
    }

    /// Publishes `message` as persistent JSON carrying `correlation_id`.
    ///
    /// # Errors
    ///
    /// Returns an error when the message cannot be encoded or the channel fails.
    pub async fn publish<T: Serialize>(&self, exchange: &str, routing_key: &str, message: &T, correlation_id: &str) -> Result<(), BrokerError> {
        let body = serde_json::to_vec(message)?;
        debug!(exchange, routing_key, "publishing message");
        let channel = self.channel()?;
        channel.publish(exchange, routing_key, body, Properties::json(correlation_id)).await
    }

    /// Feeds every delivery of `queue` to `handler` until the queue ends,
    /// settling each one with the returned [`Outcome`]. Returns the number
    /// of deliveries handled.
    ///
    /// Deliveries without a correlation id get a fresh one. The handler runs
    /// inside a `message` span carrying the correlation id.
    ///
    /// A lost channel is replaced through [`BrokerClient::connect`] and
    /// consumption goes on; the broker redelivers whatever the lost channel
    /// had not settled.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionExhausted`] when reconnecting fails,
    /// or the channel error when it is not a lost connection.
    pub async fn consume<F, Fut>(&self, queue: &str, mut handler: F) -> Result<u64, BrokerError>
    where
        F: FnMut(Delivery) -> Fut,
        Fut: Future<Output = Outcome>,
    {
        let mut handled = 0;
        info!(queue, "consuming");

        loop {
            let channel = self.channel()?;
            match Self::deliver(&channel, queue, &mut handler, &mut handled).await {
                Ok(()) => break,
                Err(e) if e.is_transient() => {
                    warn!(queue, handled, "lost the broker channel: {e}");
                    // Dropping the last handle lets the broker take back unsettled deliveries.
                    drop(channel);
                    self.slot().take();
                    self.connect().await?;
                }
                Err(e) => return Err(e),
            }
        }

        info!(queue, handled, "queue drained");
        Ok(handled)
    }

    async fn deliver<F, Fut>(channel: &C::Channel, queue: &str, handler: &mut F, handled: &mut u64) -> Result<(), BrokerError>
    where
        F: FnMut(Delivery) -> Fut,
        Fut: Future<Output = Outcome>,
    {
        while let Some(mut delivery) = channel.next(queue).await? {
            let correlation_id = delivery.properties.correlation_id.get_or_insert_with(|| Uuid::new_v4().to_string()).clone();
            let tag = delivery.tag;
            let span = info_span!("message", correlation_id = %correlation_id, delivery_tag = tag);

            let outcome = handler(delivery).instrument(span.clone()).await;
            match outcome {
                Outcome::Ack => channel.ack(tag).await?,
                Outcome::Reject { requeue } => channel.reject(tag, requeue).await?,
            }
            span.in_scope(|| debug!(?outcome, "delivery settled"));
            *handled += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::broker::MemoryBroker;

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(30))
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_after_three_failures() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(3);
        let failures = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&failures);

        let client = BrokerClient::new(broker.clone(), 30, backoff()).on_failure(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let start = Instant::now();
        client.connect().await.unwrap();

        let delays: Vec<_> = (0..3).map(|attempt| backoff().delay(attempt)).collect();
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(start.elapsed(), delays.iter().sum::<Duration>());
        assert_eq!(broker.connection_attempts(), 4);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert!(client.channel().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_attempt_budget() {
        let broker = MemoryBroker::new();
        broker.refuse_connections(10);
        let failures = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&failures);

        let client = BrokerClient::new(broker.clone(), 3, backoff()).on_failure(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(matches!(client.connect().await, Err(BrokerError::ConnectionExhausted(3))));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(broker.connection_attempts(), 3);
        assert!(matches!(client.channel(), Err(BrokerError::NotConnected)));
    }

    #[tokio::test]
    async fn test_consume_settles_and_assigns_correlation_ids() {
        let broker = MemoryBroker::new();
        broker.declare_queue("files");
        broker.push("files", "ok", Some("given")).unwrap();
        broker.push("files", "bad", None).unwrap();
        broker.close("files");

        let client = BrokerClient::new(broker.clone(), 1, backoff());
        client.connect().await.unwrap();

        let mut seen = Vec::new();
        let handled = client
            .consume("files", |delivery| {
                seen.push(delivery.properties.correlation_id.clone());
                let outcome = if delivery.body == b"ok" { Outcome::Ack } else { Outcome::Reject { requeue: false } };
                async move { outcome }
            })
            .await
            .unwrap();

        assert_eq!(handled, 2);
        assert_eq!(seen[0].as_deref(), Some("given"));
        assert!(seen[1].as_deref().is_some_and(|id| Uuid::parse_str(id).is_ok()));
        assert_eq!(broker.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_consume_reconnects_after_losing_the_channel() {
        let broker = MemoryBroker::new();
        broker.declare_queue("files");
        for body in ["one", "two", "three"] {
            broker.push("files", body, None).unwrap();
        }
        broker.close("files");

        let client = BrokerClient::new(broker.clone(), 3, backoff());
        client.connect().await.unwrap();

        let mut seen = Vec::new();
        let handled = client
            .consume("files", |delivery| {
                if delivery.body == b"two" && !delivery.redelivered {
                    broker.sever_connections();
                }
                seen.push((String::from_utf8(delivery.body).unwrap(), delivery.redelivered));
                async { Outcome::Ack }
            })
            .await
            .unwrap();

        assert_eq!(seen, [("one".to_owned(), false), ("two".to_owned(), false), ("three".to_owned(), false), ("two".to_owned(), true)]);
        assert_eq!(handled, 3);
        assert_eq!(broker.connection_attempts(), 2);
        assert!(broker.dead_letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_gives_up_when_reconnecting_fails() {
        let broker = MemoryBroker::new();
        broker.declare_queue("files");
        broker.push("files", "one", None).unwrap();
        let failures = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&failures);

        let client = BrokerClient::new(broker.clone(), 2, backoff()).on_failure(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        client.connect().await.unwrap();

        let result = client
            .consume("files", |_| {
                broker.sever_connections();
                broker.refuse_connections(5);
                async { Outcome::Ack }
            })
            .await;

        assert!(matches!(result, Err(BrokerError::ConnectionExhausted(2))));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(broker.connection_attempts(), 3);
    }

    #[tokio::test]
    async fn test_publish_sets_properties() {
        let broker = MemoryBroker::new();
        let client = BrokerClient::new(broker.clone(), 1, backoff());
        client.connect().await.unwrap();

        client.publish("cega", "files.error", &serde_json::json!({"reason": "x"}), "corr-1").await.unwrap();

        let published = broker.published_to("cega", "files.error");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].properties, Properties::json("corr-1"));
        assert_eq!(published[0].json().unwrap()["reason"], "x");
    }
}
