//! In-memory broker
//!
//! Emulates the broker behavior the RPC layer depends on, for both binding
//! styles, inside one process:
//!
//! - fanout exchanges with exclusive, auto-deleted queues and manual acks
//! - single-partition topics read through consumer groups; members of one
//!   group share records round-robin, every group sees every record
//!
//! It also carries fault injection (refused dials, severed sessions, silent
//! partitions, stream errors) so reconnect and timeout paths can be driven
//! from tests and the demo binary.

use crate::config::{ConnectionConfig, OffsetReset};
use crate::error::TransportError;
use crate::transport::{
    Acknowledge, Deliveries, Delivery, ExchangeSession, ExchangeTransport, LogSession,
    LogTransport, Message,
};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

type Sink = UnboundedSender<Result<Delivery, TransportError>>;

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    failing_dials: u32,
    dials: u64,
    partitioned: bool,
    sessions: HashSet<Uuid>,
    /// exchange name -> bound queue names
    exchanges: HashMap<String, HashSet<String>>,
    queues: HashMap<String, Queue>,
    topics: HashMap<String, Topic>,
}

struct Queue {
    owner: Uuid,
    consumer: Option<Sink>,
    backlog: VecDeque<Message>,
}

#[derive(Default)]
struct Topic {
    records: Vec<Message>,
    groups: HashMap<String, Group>,
}

struct Group {
    cursor: usize,
    members: Vec<Member>,
    next: usize,
}

struct Member {
    session: Uuid,
    sink: Sink,
}

struct CountAck(Arc<AtomicU64>);

impl Acknowledge for CountAck {
    fn ack(&self) -> Result<(), TransportError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Handle to an in-memory broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    acked: Arc<AtomicU64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` dials
    pub fn fail_next_dials(&self, n: u32) {
        self.state.lock().failing_dials = n;
    }

    /// Refuse every dial while `false`
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// Accept publishes but drop them on the floor while `true`
    pub fn set_partitioned(&self, partitioned: bool) {
        self.state.lock().partitioned = partitioned;
    }

    /// Drop every live session. Inbound streams end and old handles fail with
    /// [`TransportError::Closed`].
    pub fn sever_all(&self) {
        let mut state = self.state.lock();
        let count = state.sessions.len();
        state.sessions.clear();
        state.queues.clear();
        for bound in state.exchanges.values_mut() {
            bound.clear();
        }
        for topic in state.topics.values_mut() {
            for group in topic.groups.values_mut() {
                group.members.clear();
            }
        }
        debug!(sessions = count, "Severed all broker sessions");
    }

    /// Push an error item into every live inbound stream
    pub fn inject_fault(&self, error: TransportError) {
        let state = self.state.lock();
        let queue_sinks = state.queues.values().filter_map(|q| q.consumer.as_ref());
        let member_sinks = state
            .topics
            .values()
            .flat_map(|t| t.groups.values())
            .flat_map(|g| g.members.iter().map(|m| &m.sink));

        for sink in queue_sinks.chain(member_sinks) {
            let _ = sink.unbounded_send(Err(error.clone()));
        }
    }

    /// Total dial attempts, successful or not
    pub fn dial_count(&self) -> u64 {
        self.state.lock().dials
    }

    /// Total acknowledged exchange deliveries
    pub fn acked_count(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn live_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Number of records ever produced to `topic`
    pub fn topic_len(&self, topic: &str) -> usize {
        self.state
            .lock()
            .topics
            .get(topic)
            .map_or(0, |t| t.records.len())
    }

    /// Next record index `group` will receive on `topic`
    pub fn group_position(&self, topic: &str, group: &str) -> Option<usize> {
        self.state
            .lock()
            .topics
            .get(topic)
            .and_then(|t| t.groups.get(group))
            .map(|g| g.cursor)
    }

    fn open_session(&self, config: &ConnectionConfig) -> Result<MemorySession, TransportError> {
        let mut state = self.state.lock();
        state.dials += 1;

        let address = config.addresses.first().map(String::as_str).unwrap_or("");
        if state.unreachable {
            return Err(TransportError::Dial(format!("broker unreachable at {}", address)));
        }
        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err(TransportError::Dial(format!("connection refused by {}", address)));
        }

        let id = Uuid::new_v4();
        state.sessions.insert(id);
        debug!(session = %id, client_id = %config.client_id, "Broker session opened");

        Ok(MemorySession {
            id,
            broker: self.clone(),
        })
    }

    fn delivery(&self, message: Message) -> Delivery {
        Delivery::with_acker(message, Arc::new(CountAck(self.acked.clone())))
    }
}

/// One dialed session on a [`MemoryBroker`]
pub struct MemorySession {
    id: Uuid,
    broker: MemoryBroker,
}

impl MemorySession {
    fn check_live(&self, state: &BrokerState) -> Result<(), TransportError> {
        if state.sessions.contains(&self.id) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    fn close_session(&self) {
        let mut state = self.broker.state.lock();
        if !state.sessions.remove(&self.id) {
            return;
        }

        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner == self.id)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &owned {
            state.queues.remove(name);
        }
        for bound in state.exchanges.values_mut() {
            bound.retain(|q| !owned.contains(q));
        }
        for topic in state.topics.values_mut() {
            for group in topic.groups.values_mut() {
                group.members.retain(|m| m.session != self.id);
            }
        }

        debug!(session = %self.id, "Broker session closed");
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.close_session();
    }
}

/// Hand pending records of every group on `topic` to its members
fn deliver_backlog(topic: &mut Topic) {
    let Topic { records, groups } = topic;

    for group in groups.values_mut() {
        while group.cursor < records.len() && !group.members.is_empty() {
            let idx = group.next % group.members.len();
            let delivery = Delivery::new(records[group.cursor].clone());

            if group.members[idx].sink.unbounded_send(Ok(delivery)).is_ok() {
                group.cursor += 1;
                group.next = idx + 1;
            } else {
                group.members.remove(idx);
            }
        }
    }
}

#[async_trait]
impl ExchangeTransport for MemoryBroker {
    async fn dial(
        &self,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn ExchangeSession>, TransportError> {
        Ok(Arc::new(self.open_session(config)?))
    }
}

#[async_trait]
impl LogTransport for MemoryBroker {
    async fn dial(&self, config: &ConnectionConfig) -> Result<Arc<dyn LogSession>, TransportError> {
        Ok(Arc::new(self.open_session(config)?))
    }
}

#[async_trait]
impl ExchangeSession for MemorySession {
    async fn declare_fanout(&self, exchange: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        self.check_live(&state)?;
        state.exchanges.entry(exchange.to_string()).or_default();
        Ok(())
    }

    async fn declare_exclusive_queue(&self) -> Result<String, TransportError> {
        let mut state = self.broker.state.lock();
        self.check_live(&state)?;

        let name = format!("amq.gen-{}", Uuid::new_v4().simple());
        state.queues.insert(
            name.clone(),
            Queue {
                owner: self.id,
                consumer: None,
                backlog: VecDeque::new(),
            },
        );
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        self.check_live(&state)?;

        if !state.queues.contains_key(queue) {
            return Err(TransportError::Setup(format!("no queue '{}'", queue)));
        }
        let bound = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| TransportError::Setup(format!("no exchange '{}'", exchange)))?;
        bound.insert(queue.to_string());
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Deliveries, TransportError> {
        let mut guard = self.broker.state.lock();
        let state: &mut BrokerState = &mut guard;
        self.check_live(state)?;

        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::Setup(format!("no queue '{}'", queue)))?;
        if entry.owner != self.id {
            return Err(TransportError::Setup(format!(
                "queue '{}' is exclusive to another session",
                queue
            )));
        }
        if entry.consumer.is_some() {
            return Err(TransportError::Setup(format!(
                "queue '{}' already has a consumer",
                queue
            )));
        }

        let (tx, rx) = unbounded();
        for message in entry.backlog.drain(..) {
            let _ = tx.unbounded_send(Ok(self.broker.delivery(message)));
        }
        entry.consumer = Some(tx);

        Ok(rx.boxed())
    }

    async fn publish(&self, exchange: &str, message: Message) -> Result<(), TransportError> {
        let mut guard = self.broker.state.lock();
        let state: &mut BrokerState = &mut guard;
        self.check_live(state)?;

        if state.partitioned {
            return Ok(());
        }

        let bound = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| TransportError::Publish(format!("no exchange '{}'", exchange)))?;

        for name in bound {
            let Some(queue) = state.queues.get_mut(name) else {
                continue;
            };
            match &queue.consumer {
                Some(sink) => {
                    let delivery = self.broker.delivery(message.clone());
                    if sink.unbounded_send(Ok(delivery)).is_err() {
                        queue.consumer = None;
                        queue.backlog.push_back(message.clone());
                    }
                }
                None => queue.backlog.push_back(message.clone()),
            }
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_session();
        Ok(())
    }
}

#[async_trait]
impl LogSession for MemorySession {
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        reset: OffsetReset,
    ) -> Result<Deliveries, TransportError> {
        let mut state = self.broker.state.lock();
        self.check_live(&state)?;

        let entry = state.topics.entry(topic.to_string()).or_default();
        let len = entry.records.len();
        let (tx, rx) = unbounded();

        let group = entry.groups.entry(group.to_string()).or_insert_with(|| Group {
            cursor: match reset {
                OffsetReset::Earliest => 0,
                OffsetReset::Latest => len,
                OffsetReset::Offset(n) => usize::try_from(n).unwrap_or(usize::MAX).min(len),
            },
            members: Vec::new(),
            next: 0,
        });
        group.members.push(Member {
            session: self.id,
            sink: tx,
        });

        deliver_backlog(entry);
        Ok(rx.boxed())
    }

    async fn produce(&self, topic: &str, message: Message) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock();
        self.check_live(&state)?;

        if state.partitioned {
            return Ok(());
        }

        let entry = state.topics.entry(topic.to_string()).or_default();
        entry.records.push(message);
        deliver_backlog(entry);
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.close_session();
        Ok(())
    }
}
