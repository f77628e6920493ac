//! Configuration for rpcbus connections, clients and servers

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Where a new consumer group starts reading a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    /// Oldest retained record
    Earliest,
    /// Only records produced after subscribing
    Latest,
    /// An explicit offset, clamped to the end of the log
    Offset(u64),
}

impl FromStr for OffsetReset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            other => other.parse::<u64>().map(OffsetReset::Offset).map_err(|_| {
                format!(
                    "Invalid offset reset: {}. Must be earliest, latest, or a number",
                    s
                )
            }),
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetReset::Earliest => write!(f, "earliest"),
            OffsetReset::Latest => write!(f, "latest"),
            OffsetReset::Offset(n) => write!(f, "{}", n),
        }
    }
}

/// Transport connection settings shared by clients and servers
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Broker URL or list of seed brokers
    pub addresses: Vec<String>,

    /// Delay between failed connect attempts
    pub retry_wait: Duration,

    /// Number of connect attempts before giving up
    pub attempts: u32,

    /// Identity reported to the broker
    pub client_id: String,

    /// Consumer group (log binding only)
    pub group_id: Option<String>,

    /// Starting position for a new consumer group (log binding only)
    pub offset_reset: OffsetReset,
}

impl ConnectionConfig {
    /// Create a configuration for a single address with default retry settings
    pub fn new(address: impl Into<String>) -> Self {
        Self::with_addresses(vec![address.into()])
    }

    /// Create a configuration for several seed addresses
    pub fn with_addresses(addresses: Vec<String>) -> Self {
        Self {
            addresses,
            retry_wait: Duration::from_secs(5),
            attempts: 10,
            client_id: "rpcbus".to_string(),
            group_id: None,
            offset_reset: OffsetReset::Latest,
        }
    }

    /// Set the retry interval and attempt budget
    pub fn retry(mut self, wait: Duration, attempts: u32) -> Self {
        self.retry_wait = wait;
        self.attempts = attempts;
        self
    }

    /// Set the client identity
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Set the consumer group
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Set the offset reset policy
    pub fn offset_reset(mut self, offset_reset: OffsetReset) -> Self {
        self.offset_reset = offset_reset;
        self
    }
}

/// Configuration for a [`Client`](crate::Client)
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,

    /// How long a remote call waits for its reply
    pub call_timeout: Duration,

    /// Upper bound on the shutdown drain
    pub drain_timeout: Duration,
}

impl ClientConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            call_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(2),
        }
    }

    /// Set the per-call timeout
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the shutdown drain bound
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }
}

/// Configuration for a [`Server`](crate::Server)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub connection: ConnectionConfig,

    /// Upper bound on the shutdown drain
    pub drain_timeout: Duration,

    /// Handlers allowed to run at once; 1 dispatches inline in the consumer loop
    pub max_concurrent_handlers: usize,
}

impl ServerConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            drain_timeout: Duration::from_secs(2),
            max_concurrent_handlers: 1,
        }
    }

    /// Set the shutdown drain bound
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Dispatch up to `n` handlers concurrently (values below 1 are treated as 1)
    pub fn max_concurrent_handlers(mut self, n: usize) -> Self {
        self.max_concurrent_handlers = n.max(1);
        self
    }
}
