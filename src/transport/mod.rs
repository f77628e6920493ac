//! Transport seam
//!
//! The raw broker primitive is consumed through two trait pairs, one per
//! binding style:
//!
//! - exchange binding: a broker with fanout exchanges and exclusive queues
//!   (AMQP style). Requests and replies are published to exchanges.
//! - log binding: a broker with topics read through consumer groups
//!   (partitioned-log style). Requests and replies are produced to topics.
//!
//! [`memory::MemoryBroker`] implements both.

pub mod memory;

use crate::config::{ConnectionConfig, OffsetReset};
use crate::error::TransportError;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A raw broker message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Partitioning key (log binding)
    pub key: Option<String>,
    /// Transport-attached metadata
    pub headers: BTreeMap<String, String>,
    /// Opaque payload
    pub body: Vec<u8>,
}

impl Message {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Acknowledges a delivery back to the broker
pub trait Acknowledge: Send + Sync {
    fn ack(&self) -> Result<(), TransportError>;
}

/// An inbound message plus its acknowledgement handle
pub struct Delivery {
    pub message: Message,
    acker: Option<Arc<dyn Acknowledge>>,
}

impl Delivery {
    /// A delivery that needs no acknowledgement
    pub fn new(message: Message) -> Self {
        Self {
            message,
            acker: None,
        }
    }

    pub fn with_acker(message: Message, acker: Arc<dyn Acknowledge>) -> Self {
        Self {
            message,
            acker: Some(acker),
        }
    }

    /// Acknowledge the delivery. Only the first call reaches the broker.
    pub fn ack(&mut self) -> Result<(), TransportError> {
        match self.acker.take() {
            Some(acker) => acker.ack(),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("pending_ack", &self.acker.is_some())
            .finish()
    }
}

/// Inbound stream. The stream ending means the transport closed it.
pub type Deliveries = BoxStream<'static, Result<Delivery, TransportError>>;

/// Dials an exchange-style broker
#[async_trait]
pub trait ExchangeTransport: Send + Sync {
    async fn dial(&self, config: &ConnectionConfig)
        -> Result<Arc<dyn ExchangeSession>, TransportError>;
}

/// A live exchange-style broker session
#[async_trait]
pub trait ExchangeSession: Send + Sync {
    /// Declare a fanout exchange (idempotent)
    async fn declare_fanout(&self, exchange: &str) -> Result<(), TransportError>;

    /// Declare an exclusive, auto-deleted queue with a broker-generated name
    async fn declare_exclusive_queue(&self) -> Result<String, TransportError>;

    async fn bind_queue(&self, queue: &str, exchange: &str) -> Result<(), TransportError>;

    /// Start consuming a queue with manual acknowledgement
    async fn consume(&self, queue: &str) -> Result<Deliveries, TransportError>;

    async fn publish(&self, exchange: &str, message: Message) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Dials a log-style broker
#[async_trait]
pub trait LogTransport: Send + Sync {
    async fn dial(&self, config: &ConnectionConfig) -> Result<Arc<dyn LogSession>, TransportError>;
}

/// A live log-style broker session
#[async_trait]
pub trait LogSession: Send + Sync {
    /// Join `group` on `topic`; `reset` applies when the group has no position yet
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        reset: OffsetReset,
    ) -> Result<Deliveries, TransportError>;

    async fn produce(&self, topic: &str, message: Message) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// The transport a client or server runs over
#[derive(Clone)]
pub enum Binding {
    Exchange(Arc<dyn ExchangeTransport>),
    Log(Arc<dyn LogTransport>),
}

impl Binding {
    pub fn exchange(transport: impl ExchangeTransport + 'static) -> Self {
        Binding::Exchange(Arc::new(transport))
    }

    pub fn log(transport: impl LogTransport + 'static) -> Self {
        Binding::Log(Arc::new(transport))
    }

    pub fn kind(&self) -> BindingKind {
        match self {
            Binding::Exchange(_) => BindingKind::Exchange,
            Binding::Log(_) => BindingKind::Log,
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Binding::{:?}", self.kind())
    }
}

/// Which binding style is in use; also selects the wire header layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Exchange,
    Log,
}

impl std::str::FromStr for BindingKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "exchange" => Ok(BindingKind::Exchange),
            "log" => Ok(BindingKind::Log),
            _ => Err(format!("Invalid binding: {}. Must be exchange or log", s)),
        }
    }
}
