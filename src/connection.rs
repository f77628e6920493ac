//! Broker connection with bounded-retry connect
//!
//! A [`Connection`] is either fully connected (a session installed and its
//! inbound stream handed out) or fully disconnected. Partial setups are
//! closed and discarded before an error is returned.

use crate::config::ConnectionConfig;
use crate::error::{ConnectError, TransportError};
use crate::transport::{
    Binding, BindingKind, Deliveries, ExchangeSession, LogSession, Message,
};

use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Clone)]
enum LinkSession {
    Exchange(Arc<dyn ExchangeSession>),
    Log(Arc<dyn LogSession>),
}

impl LinkSession {
    async fn publish(&self, destination: &str, message: Message) -> Result<(), TransportError> {
        match self {
            LinkSession::Exchange(session) => session.publish(destination, message).await,
            LinkSession::Log(session) => session.produce(destination, message).await,
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        match self {
            LinkSession::Exchange(session) => session.close().await,
            LinkSession::Log(session) => session.close().await,
        }
    }
}

/// Owns the transport session for one client or server
pub struct Connection {
    binding: Binding,
    config: ConnectionConfig,
    /// Exchange or topic this connection consumes from
    source: String,
    session: RwLock<Option<LinkSession>>,
}

impl Connection {
    pub fn new(binding: Binding, config: ConnectionConfig, source: impl Into<String>) -> Self {
        Self {
            binding,
            config,
            source: source.into(),
            session: RwLock::new(None),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> BindingKind {
        self.binding.kind()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.session.read().is_some()
    }

    /// Dial and set up consumption once.
    ///
    /// Exchange binding: declare a fanout exchange named by the source, an
    /// exclusive queue bound to it, and consume with manual ack. Log binding:
    /// subscribe the source topic under the configured group.
    ///
    /// Any previously installed session is closed first.
    pub async fn connect(&self) -> Result<Deliveries, ConnectError> {
        if let Err(e) = self.close().await {
            debug!(source = %self.source, error = %e, "Closing previous session failed");
        }

        let (session, deliveries) = match &self.binding {
            Binding::Exchange(transport) => {
                let session = transport
                    .dial(&self.config)
                    .await
                    .map_err(ConnectError::stage("dial"))?;

                match setup_exchange(session.as_ref(), &self.source).await {
                    Ok(deliveries) => (LinkSession::Exchange(session), deliveries),
                    Err(e) => {
                        let _ = session.close().await;
                        return Err(e);
                    }
                }
            }
            Binding::Log(transport) => {
                let session = transport
                    .dial(&self.config)
                    .await
                    .map_err(ConnectError::stage("dial"))?;

                match setup_log(session.as_ref(), &self.source, &self.config).await {
                    Ok(deliveries) => (LinkSession::Log(session), deliveries),
                    Err(e) => {
                        let _ = session.close().await;
                        return Err(e);
                    }
                }
            }
        };

        *self.session.write() = Some(session);
        debug!(source = %self.source, binding = ?self.kind(), "Connected");
        Ok(deliveries)
    }

    /// Connect with the configured retry budget
    pub async fn attempt_connect(&self) -> Result<Deliveries, ConnectError> {
        self.attempt_connect_until(std::future::pending()).await
    }

    /// Connect with the configured retry budget, giving up with
    /// [`ConnectError::Cancelled`] as soon as `cancel` completes.
    ///
    /// Sleeps `retry_wait` between failed attempts, never after the last one.
    pub async fn attempt_connect_until<F>(&self, cancel: F) -> Result<Deliveries, ConnectError>
    where
        F: Future<Output = ()>,
    {
        let attempts = self.config.attempts;
        if attempts == 0 {
            return Err(ConnectError::NoAttempts);
        }

        tokio::pin!(cancel);
        let mut last = ConnectError::NoAttempts;

        for attempt in 1..=attempts {
            let result = tokio::select! {
                biased;
                _ = &mut cancel => return Err(ConnectError::Cancelled),
                result = self.connect() => result,
            };

            match result {
                Ok(deliveries) => {
                    if attempt > 1 {
                        info!(source = %self.source, attempt, "Connected after retry");
                    }
                    return Ok(deliveries);
                }
                Err(e) => {
                    warn!(
                        source = %self.source,
                        attempt,
                        attempts_left = attempts - attempt,
                        error = %e,
                        "Connect attempt failed"
                    );
                    last = e;
                }
            }

            if attempt < attempts {
                tokio::select! {
                    biased;
                    _ = &mut cancel => return Err(ConnectError::Cancelled),
                    _ = sleep(self.config.retry_wait) => {}
                }
            }
        }

        Err(ConnectError::Exhausted {
            attempts,
            source: Box::new(last),
        })
    }

    /// Publish on the installed session
    pub async fn publish(&self, destination: &str, message: Message) -> Result<(), TransportError> {
        let session = self.session.read().clone();
        match session {
            Some(session) => session.publish(destination, message).await,
            None => Err(TransportError::NotConnected),
        }
    }

    /// Release the session. Closing a disconnected connection is a no-op.
    pub async fn close(&self) -> Result<(), TransportError> {
        let session = self.session.write().take();
        match session {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }
}

async fn setup_exchange(
    session: &dyn ExchangeSession,
    exchange: &str,
) -> Result<Deliveries, ConnectError> {
    session
        .declare_fanout(exchange)
        .await
        .map_err(ConnectError::stage("declare exchange"))?;
    let queue = session
        .declare_exclusive_queue()
        .await
        .map_err(ConnectError::stage("declare queue"))?;
    session
        .bind_queue(&queue, exchange)
        .await
        .map_err(ConnectError::stage("bind queue"))?;
    session
        .consume(&queue)
        .await
        .map_err(ConnectError::stage("consume"))
}

async fn setup_log(
    session: &dyn LogSession,
    topic: &str,
    config: &ConnectionConfig,
) -> Result<Deliveries, ConnectError> {
    let group = config.group_id.as_deref().filter(|g| !g.is_empty());
    let group = group.ok_or_else(|| {
        ConnectError::stage("subscribe")(TransportError::Setup(
            "no consumer group configured".to_string(),
        ))
    })?;

    session
        .subscribe(topic, group, config.offset_reset)
        .await
        .map_err(ConnectError::stage("subscribe"))
}
