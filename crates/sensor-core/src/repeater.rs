//! [`Repeater`] fans a single upstream data channel out to any number of
//! independent [`Subscription`]s.
//!
//! A single fan-out task owns the upstream receiver and the set of registered
//! subscribers. Every item it consumes is cloned into the bounded queue of each
//! subscriber registered at that moment. Every subscriber has its own delivery
//! task moving items from that queue into the subscription data channel, so a
//! consumer that stops reading can only stall itself.
//!
//! When a subscriber queue is full the newest item is dropped for that
//! subscriber only. The fan-out task never waits on a subscriber.

use thiserror::Error;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};

use crate::stream::{self, Stream, StreamEnds};

/// Default number of items a subscriber may fall behind before losing events.
pub const DEFAULT_BUFFER: usize = 1024;

/// Stream handed out by a [`Repeater`].
pub type Subscription<T> = Stream<HandleControl, T>;

/// Control messages understood by the delivery task of a [`Subscription`].
///
/// Dropping the whole subscription has the same effect as
/// [`HandleControl::Unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleControl {
    Unsubscribe,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepeaterError {
    #[error("upstream closed, no more subscriptions accepted")]
    Closed,
}

/// Handle to a running fan-out task.
#[derive(Debug, Clone)]
pub struct Repeater<T> {
    name: &'static str,
    tx_register: mpsc::UnboundedSender<RegisterRequest<T>>,
}

#[derive(Debug)]
struct RegisterRequest<T> {
    tx_reply: oneshot::Sender<Subscription<T>>,
}

impl<T: Clone + Send + 'static> Repeater<T> {
    /// Start fanning out `upstream` with the [`DEFAULT_BUFFER`] per subscriber.
    pub fn new(name: &'static str, upstream: mpsc::Receiver<T>) -> Self {
        Self::with_buffer(name, upstream, DEFAULT_BUFFER)
    }

    /// Start fanning out `upstream`, each subscriber can queue up to `buffer` items.
    pub fn with_buffer(name: &'static str, upstream: mpsc::Receiver<T>, buffer: usize) -> Self {
        let (tx_register, rx_register) = mpsc::unbounded_channel();
        let fan_out = FanOut {
            name,
            upstream,
            rx_register,
            subscribers: Vec::new(),
            buffer: buffer.max(1),
            next_id: 0,
        };
        tokio::spawn(fan_out.run());
        Self { name, tx_register }
    }

    /// Register a new subscriber. It will receive every item consumed from
    /// upstream after the registration, and nothing consumed before it.
    pub async fn new_stream(&self) -> Result<Subscription<T>, RepeaterError> {
        let (tx_reply, rx_reply) = oneshot::channel();
        self.tx_register
            .send(RegisterRequest { tx_reply })
            .map_err(|_| RepeaterError::Closed)?;
        rx_reply.await.map_err(|_| {
            log::debug!(target: self.name, "subscription rejected, upstream closed");
            RepeaterError::Closed
        })
    }
}

struct FanOut<T> {
    name: &'static str,
    upstream: mpsc::Receiver<T>,
    rx_register: mpsc::UnboundedReceiver<RegisterRequest<T>>,
    subscribers: Vec<Subscriber<T>>,
    buffer: usize,
    next_id: u64,
}

struct Subscriber<T> {
    id: u64,
    queue: mpsc::Sender<T>,
    dropped: u64,
}

impl<T: Clone + Send + 'static> FanOut<T> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                Some(request) = self.rx_register.recv() => self.register(request),
                item = self.upstream.recv() => match item {
                    Some(item) => self.deliver(item),
                    None => break,
                },
            }
        }
        log::debug!(
            target: self.name,
            "upstream closed, closing {} subscriptions",
            self.subscribers.len()
        );
        // Dropping the queues lets each delivery task flush what it already
        // holds and then close its subscription.
    }

    fn register(&mut self, request: RegisterRequest<T>) {
        let id = self.next_id;
        self.next_id += 1;

        let (subscription, ends) = stream::channel(1, 1);
        let (queue, rx_queue) = mpsc::channel(self.buffer);
        if request.tx_reply.send(subscription).is_err() {
            // The caller went away before getting its subscription.
            return;
        }
        tokio::spawn(deliver(self.name, id, rx_queue, ends));
        self.subscribers.push(Subscriber {
            id,
            queue,
            dropped: 0,
        });
        log::trace!(target: self.name, "subscriber {id} registered");
    }

    fn deliver(&mut self, item: T) {
        let name = self.name;
        self.subscribers
            .retain_mut(|subscriber| match subscriber.queue.try_send(item.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    subscriber.dropped += 1;
                    if subscriber.dropped.is_power_of_two() {
                        log::warn!(
                            target: name,
                            "subscriber {} is not keeping up, dropped {} events",
                            subscriber.id,
                            subscriber.dropped
                        );
                    }
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    log::trace!(target: name, "subscriber {} gone", subscriber.id);
                    false
                }
            });
    }
}

/// Move items from a subscriber queue to its subscription until the queue
/// ends, the consumer drops its receiver or asks to unsubscribe.
async fn deliver<T>(
    name: &'static str,
    id: u64,
    mut queue: mpsc::Receiver<T>,
    ends: StreamEnds<HandleControl, T>,
) {
    let StreamEnds { mut ctrl, data } = ends;
    // A closed control channel only means no more control messages.
    let mut ctrl_open = true;
    loop {
        let item = tokio::select! {
            msg = ctrl.recv(), if ctrl_open => match msg {
                Some(HandleControl::Unsubscribe) => break,
                None => {
                    ctrl_open = false;
                    continue;
                }
            },
            item = queue.recv() => match item {
                Some(item) => item,
                None => break,
            },
            _ = data.closed() => break,
        };
        let permit = loop {
            tokio::select! {
                permit = data.reserve() => break permit.ok(),
                msg = ctrl.recv(), if ctrl_open => match msg {
                    Some(HandleControl::Unsubscribe) => break None,
                    None => ctrl_open = false,
                },
            }
        };
        let Some(permit) = permit else {
            break;
        };
        permit.send(item);
    }
    log::trace!(target: name, "subscriber {id} closed");
}
