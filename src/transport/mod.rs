//! In-process reliable fan-out transport.
//!
//! The schedule service and its adapters only touch the handles defined
//! here, so swapping in a networked transport is a matter of reimplementing
//! this module's contracts: reliable topics with optional latching, and
//! blocking request/response endpoints that observe teardown.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, unbounded};
use thiserror::Error;

pub mod messages;

/// How often a blocked service call re-checks the teardown flag.
pub const SERVICE_POLL: Duration = Duration::from_millis(100);

type Payload = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("the schedule service is shutting down")]
    ShuttingDown,
    /// Retryable; writers rebind on the next failover notice.
    #[error("transport unavailable: {0}")]
    Unavailable(&'static str),
}

struct TopicState {
    subscribers: Vec<Sender<Payload>>,
    latched: Option<Payload>,
    latching: bool,
}

impl TopicState {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            latched: None,
            latching: false,
        }
    }
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, TopicState>,
    services: HashMap<String, Payload>,
}

/// The shared in-process message fabric.
#[derive(Clone)]
pub struct Bus {
    state: Arc<Mutex<BusState>>,
    quit: Arc<AtomicBool>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            quit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flip the teardown flag: every blocked service call unblocks with
    /// `ShuttingDown` within one poll interval.
    pub fn shutdown(&self) {
        self.quit.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.quit.load(Ordering::SeqCst)
    }

    pub fn publisher<T: Clone + Send + Sync + 'static>(&self, topic: &str) -> Publisher<T> {
        self.make_publisher(topic, false)
    }

    /// A latching publisher retains its last message and delivers it to every
    /// future subscriber, like a transient-local, depth-1 channel.
    pub fn latched_publisher<T: Clone + Send + Sync + 'static>(&self, topic: &str) -> Publisher<T> {
        self.make_publisher(topic, true)
    }

    pub fn subscribe<T: Clone + Send + Sync + 'static>(&self, topic: &str) -> Subscription<T> {
        let (tx, rx) = unbounded();
        let mut state = self.state.lock().expect("bus lock");
        let entry = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(TopicState::new);
        if let Some(latched) = &entry.latched {
            let _ = tx.send(latched.clone());
        }
        entry.subscribers.push(tx);
        Subscription {
            receiver: rx,
            _marker: PhantomData,
        }
    }

    /// Live subscriber count, pruning closed channels as a side effect.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let mut state = self.state.lock().expect("bus lock");
        match state.topics.get_mut(topic) {
            Some(entry) => {
                entry.subscribers.retain(|tx| !tx_is_closed(tx));
                entry.subscribers.len()
            }
            None => 0,
        }
    }

    /// Bind (or re-bind, on failover) the server side of a service. Any
    /// previously bound queue is disconnected and its clients must rebind.
    pub fn serve<Req, Res>(&self, name: &str) -> ServiceQueue<Req, Res>
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        let (tx, rx) = unbounded::<ServiceRequest<Req, Res>>();
        let mut state = self.state.lock().expect("bus lock");
        state.services.insert(name.to_string(), Arc::new(tx));
        ServiceQueue { receiver: rx }
    }

    pub fn client<Req, Res>(&self, name: &str) -> ServiceClient<Req, Res>
    where
        Req: Send + 'static,
        Res: Send + 'static,
    {
        ServiceClient {
            bus: self.clone(),
            name: name.to_string(),
            cached: Mutex::new(None),
        }
    }

    fn make_publisher<T: Clone + Send + Sync + 'static>(
        &self,
        topic: &str,
        latching: bool,
    ) -> Publisher<T> {
        let mut state = self.state.lock().expect("bus lock");
        let entry = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(TopicState::new);
        entry.latching |= latching;
        Publisher {
            bus: self.clone(),
            topic: topic.to_string(),
            _marker: PhantomData,
        }
    }

    fn lookup_service(&self, name: &str) -> Option<Payload> {
        let state = self.state.lock().expect("bus lock");
        state.services.get(name).cloned()
    }
}

fn tx_is_closed(tx: &Sender<Payload>) -> bool {
    // Closure is only observable through a send; subscriptions skip probes.
    tx.send(Arc::new(Probe)).is_err()
}

/// Internal marker pushed by liveness probes; subscriptions skip it.
struct Probe;

pub struct Publisher<T> {
    bus: Bus,
    topic: String,
    _marker: PhantomData<T>,
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> {
    /// Non-blocking fan-out to every live subscriber.
    pub fn publish(&self, message: T) {
        let payload: Payload = Arc::new(message);
        let mut state = self.bus.state.lock().expect("bus lock");
        let Some(entry) = state.topics.get_mut(&self.topic) else {
            return;
        };
        entry.subscribers.retain(|tx| tx.send(payload.clone()).is_ok());
        if entry.latching {
            entry.latched = Some(payload);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.bus.subscriber_count(&self.topic)
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

pub struct Subscription<T> {
    receiver: Receiver<Payload>,
    _marker: PhantomData<T>,
}

impl<T: Clone + Send + Sync + 'static> Subscription<T> {
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        loop {
            let payload = self.receiver.try_recv()?;
            if let Some(message) = decode::<T>(payload) {
                return Ok(message);
            }
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvTimeoutError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let payload = self.receiver.recv_timeout(remaining)?;
            if let Some(message) = decode::<T>(payload) {
                return Ok(message);
            }
        }
    }

    pub(crate) fn raw(&self) -> &Receiver<Payload> {
        &self.receiver
    }
}

fn decode<T: Clone + Send + Sync + 'static>(payload: Payload) -> Option<T> {
    if payload.downcast_ref::<Probe>().is_some() {
        return None;
    }
    payload.downcast_ref::<T>().cloned()
}

pub struct ServiceRequest<Req, Res> {
    pub request: Req,
    reply: Sender<Res>,
}

impl<Req, Res> ServiceRequest<Req, Res> {
    pub fn respond(self, response: Res) {
        // The caller may have given up; that is its business.
        let _ = self.reply.send(response);
    }
}

pub struct ServiceQueue<Req, Res> {
    receiver: Receiver<ServiceRequest<Req, Res>>,
}

impl<Req, Res> ServiceQueue<Req, Res> {
    pub fn try_recv(&self) -> Result<ServiceRequest<Req, Res>, TryRecvError> {
        self.receiver.try_recv()
    }

    pub(crate) fn raw(&self) -> &Receiver<ServiceRequest<Req, Res>> {
        &self.receiver
    }
}

pub struct ServiceClient<Req, Res> {
    bus: Bus,
    name: String,
    cached: Mutex<Option<Sender<ServiceRequest<Req, Res>>>>,
}

impl<Req, Res> ServiceClient<Req, Res>
where
    Req: Send + 'static,
    Res: Send + 'static,
{
    /// Block until the service answers or the bus tears down. Polls the quit
    /// flag every [`SERVICE_POLL`] so shutdown is observed promptly.
    pub fn call(&self, request: Req) -> Result<Res, TransportError> {
        let sender = self.current_sender()?;
        let (reply_tx, reply_rx) = unbounded();
        if sender
            .send(ServiceRequest {
                request,
                reply: reply_tx,
            })
            .is_err()
        {
            self.drop_cached();
            return Err(TransportError::Unavailable("service endpoint rebound"));
        }

        loop {
            match reply_rx.recv_timeout(SERVICE_POLL) {
                Ok(response) => return Ok(response),
                Err(RecvTimeoutError::Timeout) => {
                    if self.bus.is_shutting_down() {
                        return Err(TransportError::ShuttingDown);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.drop_cached();
                    return Err(TransportError::Unavailable("service dropped the request"));
                }
            }
        }
    }

    /// Forget the cached endpoint; the next call re-resolves it. Writers do
    /// this when a failover notice arrives.
    pub fn rebind(&self) {
        self.drop_cached();
    }

    fn current_sender(&self) -> Result<Sender<ServiceRequest<Req, Res>>, TransportError> {
        let mut cached = self.cached.lock().expect("client lock");
        if let Some(sender) = cached.as_ref() {
            return Ok(sender.clone());
        }
        let payload = self
            .bus
            .lookup_service(&self.name)
            .ok_or(TransportError::Unavailable("service not bound"))?;
        let sender = payload
            .downcast_ref::<Sender<ServiceRequest<Req, Res>>>()
            .ok_or(TransportError::Unavailable("service type mismatch"))?
            .clone();
        *cached = Some(sender.clone());
        Ok(sender)
    }

    fn drop_cached(&self) {
        *self.cached.lock().expect("client lock") = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_reaches_every_subscriber() {
        let bus = Bus::new();
        let publisher = bus.publisher::<u64>("numbers");
        let a = bus.subscribe::<u64>("numbers");
        let b = bus.subscribe::<u64>("numbers");

        publisher.publish(7);
        assert_eq!(a.try_recv().unwrap(), 7);
        assert_eq!(b.try_recv().unwrap(), 7);
    }

    #[test]
    fn latched_topics_replay_to_late_subscribers() {
        let bus = Bus::new();
        let publisher = bus.latched_publisher::<&'static str>("info");
        publisher.publish("first");
        publisher.publish("second");

        let late = bus.subscribe::<&'static str>("info");
        assert_eq!(late.try_recv().unwrap(), "second");
        assert!(late.try_recv().is_err());
    }

    #[test]
    fn subscriber_count_drops_dead_subscribers() {
        let bus = Bus::new();
        let _publisher = bus.publisher::<u64>("numbers");
        let sub = bus.subscribe::<u64>("numbers");
        assert_eq!(bus.subscriber_count("numbers"), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count("numbers"), 0);
    }

    #[test]
    fn service_round_trip() {
        let bus = Bus::new();
        let queue = bus.serve::<u64, u64>("double");
        let client = bus.client::<u64, u64>("double");

        let worker = std::thread::spawn(move || {
            let request = queue.raw().recv().unwrap();
            let value = request.request;
            request.respond(value * 2);
        });

        assert_eq!(client.call(21).unwrap(), 42);
        worker.join().unwrap();
    }

    #[test]
    fn shutdown_unblocks_waiting_callers() {
        let bus = Bus::new();
        let _queue = bus.serve::<u64, u64>("stuck");
        let client = bus.client::<u64, u64>("stuck");

        let bus2 = bus.clone();
        let killer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            bus2.shutdown();
        });

        let err = client.call(1).unwrap_err();
        assert!(matches!(err, TransportError::ShuttingDown));
        killer.join().unwrap();
    }

    #[test]
    fn rebinding_a_service_disconnects_old_clients() {
        let bus = Bus::new();
        let queue = bus.serve::<u64, u64>("svc");
        let client = bus.client::<u64, u64>("svc");

        // Prime the client's cached endpoint.
        let worker = std::thread::spawn({
            let raw = queue.raw().clone();
            move || {
                let request = raw.recv().unwrap();
                request.respond(1);
            }
        });
        assert_eq!(client.call(0).unwrap(), 1);
        worker.join().unwrap();

        // Failover: a replacement binds the service anew.
        let queue2 = bus.serve::<u64, u64>("svc");
        drop(queue);
        let err = client.call(0).unwrap_err();
        assert!(matches!(err, TransportError::Unavailable(_)));

        // After rebinding the call reaches the new endpoint.
        client.rebind();
        let worker = std::thread::spawn(move || {
            let request = queue2.raw().recv().unwrap();
            request.respond(2);
        });
        assert_eq!(client.call(0).unwrap(), 2);
        worker.join().unwrap();
    }
}
