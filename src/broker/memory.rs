//! In-process broker with AMQP-like semantics.
//!
//! Queues are flume channels. Exchanges route by exact routing key to the
//! queues bound to them; every published message is also kept in a log so
//! that callers can inspect what the pipeline sent. Prefetch is enforced per
//! channel with a semaphore: a consumer holding `prefetch` unacknowledged
//! deliveries waits until one of them is acknowledged or rejected.
//!
//! Like an AMQP server, the broker takes back the unacknowledged deliveries
//! of a channel that goes away and queues them again as redelivered.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use flume::{Receiver, Sender};
use hashbrown::HashMap;
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, warn};

use crate::broker::{BrokerError, Channel, Connector, Delivery, Properties};

/// A message as it was published.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: Properties,
}

impl Published {
    /// Parses the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the parse error when the body is not JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

struct Queue {
    sender: Sender<Delivery>,
    receiver: Receiver<Delivery>,
    /// Closed queues take no new messages but still take back requeued ones.
    closed: Arc<AtomicBool>,
    closing: Arc<Notify>,
}

impl Queue {
    fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self { sender, receiver, closed: Arc::new(AtomicBool::new(false)), closing: Arc::new(Notify::new()) }
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    bindings: HashMap<(String, String), Vec<String>>,
    published: Vec<Published>,
    dead_letters: Vec<Delivery>,
}

impl State {
    fn enqueue(&mut self, queue: &str, delivery: Delivery) {
        match self.queues.get(queue) {
            Some(q) if !q.closed.load(Ordering::SeqCst) && q.sender.send(delivery.clone()).is_ok() => {}
            _ => {
                warn!(queue, "queue closed, message dead-lettered");
                self.dead_letters.push(delivery);
            }
        }
    }

    fn requeue(&mut self, queue: &str, mut delivery: Delivery) {
        delivery.redelivered = true;
        match self.queues.get(queue) {
            Some(q) if q.sender.send(delivery.clone()).is_ok() => {}
            _ => self.dead_letters.push(delivery),
        }
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    next_tag: AtomicU64,
    refuse: AtomicU32,
    attempts: AtomicU32,
    /// Bumped to drop every open channel.
    generation: AtomicU64,
}

/// Handle on an in-process broker. Clones share the broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner.state)
    }

    /// Declares a queue. Declaring an existing queue changes nothing.
    pub fn declare_queue(&self, queue: &str) {
        self.state().queues.entry(queue.to_owned()).or_insert_with(Queue::new);
    }

    /// Routes messages published to `exchange` with `routing_key` into `queue`.
    pub fn bind(&self, exchange: &str, routing_key: &str, queue: &str) {
        let mut state = self.state();
        state.queues.entry(queue.to_owned()).or_insert_with(Queue::new);
        let queues = state.bindings.entry((exchange.to_owned(), routing_key.to_owned())).or_default();
        if !queues.iter().any(|bound| bound == queue) {
            queues.push(queue.to_owned());
        }
    }

    /// Puts a message straight into a queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::UnknownQueue`] when the queue was never declared.
    pub fn push(&self, queue: &str, body: impl Into<Vec<u8>>, correlation_id: Option<&str>) -> Result<(), BrokerError> {
        let mut state = self.state();
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_owned()));
        }
        let properties = Properties { correlation_id: correlation_id.map(str::to_owned), ..Properties::default() };
        state.enqueue(queue, Delivery { tag: 0, body: body.into(), properties, redelivered: false });
        Ok(())
    }

    /// Closes a queue: consumers see the end of the queue once it is drained.
    pub fn close(&self, queue: &str) {
        if let Some(q) = self.state().queues.get(queue) {
            q.closed.store(true, Ordering::SeqCst);
            q.closing.notify_waiters();
        }
    }

    /// Number of messages waiting in a queue.
    #[must_use]
    pub fn pending(&self, queue: &str) -> usize {
        self.state().queues.get(queue).map_or(0, |q| q.receiver.len())
    }

    /// Every message published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<Published> {
        self.state().published.clone()
    }

    /// Messages published to one exchange with one routing key.
    #[must_use]
    pub fn published_to(&self, exchange: &str, routing_key: &str) -> Vec<Published> {
        self.state().published.iter().filter(|p| p.exchange == exchange && p.routing_key == routing_key).cloned().collect()
    }

    /// Deliveries rejected without requeue.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<Delivery> {
        self.state().dead_letters.clone()
    }

    /// Makes the next `count` connection attempts fail.
    pub fn refuse_connections(&self, count: u32) {
        self.inner.refuse.store(count, Ordering::SeqCst);
    }

    /// Drops every open channel, as a lost connection would. Their next
    /// operation fails and their unacknowledged deliveries are requeued once
    /// they are dropped.
    pub fn sever_connections(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        warn!("memory broker connections severed");
    }

    /// Number of connection attempts so far, failed ones included.
    #[must_use]
    pub fn connection_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryBroker {
    type Channel = MemoryChannel;

    async fn connect(&self) -> Result<MemoryChannel, BrokerError> {
        let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let refused = self.inner.refuse.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1)).is_ok();
        if refused {
            return Err(BrokerError::ConnectionFailed(format!("connection refused (attempt {attempt})")));
        }

        debug!(attempt, "memory broker connected");
        let generation = self.inner.generation.load(Ordering::SeqCst);
        Ok(MemoryChannel { broker: self.clone(), generation, prefetch: Mutex::new(None), unacked: Mutex::new(HashMap::new()) })
    }
}

/// A channel on a [`MemoryBroker`].
pub struct MemoryChannel {
    broker: MemoryBroker,
    generation: u64,
    prefetch: Mutex<Option<Arc<Semaphore>>>,
    unacked: Mutex<HashMap<u64, (String, Delivery)>>,
}

impl MemoryChannel {
    /// Number of deliveries neither acknowledged nor rejected.
    #[must_use]
    pub fn unacked(&self) -> usize {
        lock(&self.unacked).len()
    }

    fn check_open(&self) -> Result<(), BrokerError> {
        if self.broker.inner.generation.load(Ordering::SeqCst) == self.generation {
            Ok(())
        } else {
            Err(BrokerError::ConnectionFailed("connection lost".to_owned()))
        }
    }

    fn settle(&self, tag: u64) -> Result<(String, Delivery), BrokerError> {
        self.check_open()?;
        let entry = lock(&self.unacked).remove(&tag).ok_or(BrokerError::UnknownDelivery(tag))?;
        if let Some(semaphore) = lock(&self.prefetch).as_ref() {
            semaphore.add_permits(1);
        }
        Ok(entry)
    }
}

impl Channel for MemoryChannel {
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.check_open()?;
        *lock(&self.prefetch) = Some(Arc::new(Semaphore::new(usize::from(count))));
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: Vec<u8>, properties: Properties) -> Result<(), BrokerError> {
        self.check_open()?;
        let mut state = self.broker.state();
        let queues = state.bindings.get(&(exchange.to_owned(), routing_key.to_owned())).cloned().unwrap_or_default();
        if queues.is_empty() {
            debug!(exchange, routing_key, "message not routed to any queue");
        }

        for queue in &queues {
            state.enqueue(queue, Delivery { tag: 0, body: body.clone(), properties: properties.clone(), redelivered: false });
        }
        state.published.push(Published { exchange: exchange.to_owned(), routing_key: routing_key.to_owned(), body, properties });
        Ok(())
    }

    async fn next(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        self.check_open()?;
        let (receiver, closed, closing) = self
            .broker
            .state()
            .queues
            .get(queue)
            .map(|q| (q.receiver.clone(), Arc::clone(&q.closed), Arc::clone(&q.closing)))
            .ok_or_else(|| BrokerError::UnknownQueue(queue.to_owned()))?;

        let semaphore = lock(&self.prefetch).clone();
        if let Some(semaphore) = &semaphore {
            semaphore.acquire().await.map_err(|_| BrokerError::NotConnected)?.forget();
        }

        let received = loop {
            // Registered before the check so that a close in between still wakes us.
            let notified = closing.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if closed.load(Ordering::SeqCst) && receiver.is_empty() {
                break None;
            }
            tokio::select! {
                delivery = receiver.recv_async() => break delivery.ok(),
                () = &mut notified => {}
            }
        };

        let Some(mut delivery) = received else {
            if let Some(semaphore) = &semaphore {
                semaphore.add_permits(1);
            }
            return Ok(None);
        };

        delivery.tag = self.broker.inner.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.unacked).insert(delivery.tag, (queue.to_owned(), delivery.clone()));
        Ok(Some(delivery))
    }

    async fn ack(&self, tag: u64) -> Result<(), BrokerError> {
        self.settle(tag).map(|_| ())
    }

    async fn reject(&self, tag: u64, requeue: bool) -> Result<(), BrokerError> {
        let (queue, delivery) = self.settle(tag)?;
        let mut state = self.broker.state();
        if requeue {
            state.requeue(&queue, delivery);
        } else {
            state.dead_letters.push(delivery);
        }
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        let unacked: Vec<_> = lock(&self.unacked).drain().map(|(_, entry)| entry).collect();
        if unacked.is_empty() {
            return;
        }

        debug!(count = unacked.len(), "requeueing deliveries of a dropped channel");
        let mut state = self.broker.state();
        for (queue, delivery) in unacked {
            state.requeue(&queue, delivery);
        }
    }
}

/// Locks a mutex, recovering the data of a poisoned one.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
