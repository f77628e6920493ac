//! Dispatch server
//!
//! Consumes requests from one exchange or topic, runs them through a
//! [`Router`] and publishes one reply per well-formed request to the
//! destination the request names.

mod dispatch;
mod handler;
mod router;

pub use handler::{handler_fn, json_handler, Handler, HandlerError, HandlerFn, JsonHandler, Request};
pub use router::{Router, RouterBuilder};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::envelope;
use crate::error::{Result, RpcError};
use crate::lifecycle::{InFlight, Lifecycle, LinkState};
use crate::supervisor::{supervise, Consumer};
use crate::transport::{Binding, BindingKind, Deliveries, Delivery};
use dispatch::Dispatcher;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ServerInner {
    connection: Arc<Connection>,
    router: Router,
    lifecycle: Arc<Lifecycle>,
    drain_timeout: Duration,
    max_concurrent_handlers: usize,
    // Held between construction and start()
    deliveries: Mutex<Option<Deliveries>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.lifecycle.stop.stop();
    }
}

/// RPC server
///
/// Cheap to clone; clones share the connection and the dispatch loop.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Connect to the broker and prepare to serve `request_destination`.
    ///
    /// Nothing is consumed until [`start`](Self::start). The log binding
    /// requires a consumer group id.
    pub async fn new(
        binding: Binding,
        config: ServerConfig,
        request_destination: impl Into<String>,
        router: Router,
    ) -> Result<Self> {
        let request_destination = request_destination.into();
        if request_destination.is_empty() {
            return Err(RpcError::Config(
                "request destination must not be empty".to_string(),
            ));
        }
        if binding.kind() == BindingKind::Log
            && config.connection.group_id.as_deref().map_or(true, str::is_empty)
        {
            return Err(RpcError::Config(
                "log binding requires a consumer group id".to_string(),
            ));
        }

        let ServerConfig {
            connection: connection_config,
            drain_timeout,
            max_concurrent_handlers,
        } = config;

        let connection = Arc::new(Connection::new(
            binding,
            connection_config,
            request_destination,
        ));
        let deliveries = connection.attempt_connect().await?;

        debug!(
            source = %connection.source(),
            handlers = ?router.names(),
            "Server connected"
        );

        Ok(Self {
            inner: Arc::new(ServerInner {
                connection,
                router,
                lifecycle: Arc::new(Lifecycle::new()),
                drain_timeout,
                max_concurrent_handlers: max_concurrent_handlers.max(1),
                deliveries: Mutex::new(Some(deliveries)),
                task: Mutex::new(None),
            }),
        })
    }

    /// Start the dispatch loop. Later calls are ignored.
    pub fn start(&self) {
        let Some(deliveries) = self.inner.deliveries.lock().take() else {
            warn!(source = %self.inner.connection.source(), "Server already started or shut down");
            return;
        };

        let permits = (self.inner.max_concurrent_handlers > 1)
            .then(|| Arc::new(Semaphore::new(self.inner.max_concurrent_handlers)));

        let consumer = Arc::new(RequestConsumer {
            dispatcher: Arc::new(Dispatcher::new(
                self.inner.connection.clone(),
                self.inner.router.clone(),
            )),
            kind: self.inner.connection.kind(),
            in_flight: self.inner.lifecycle.in_flight.clone(),
            permits,
        });

        self.inner.lifecycle.set_state(LinkState::Running);
        let task = tokio::spawn(supervise(
            self.inner.connection.clone(),
            self.inner.lifecycle.clone(),
            consumer,
            deliveries,
        ));
        *self.inner.task.lock() = Some(task);

        info!(
            source = %self.inner.connection.source(),
            binding = ?self.inner.connection.kind(),
            max_concurrent_handlers = self.inner.max_concurrent_handlers,
            "Server started"
        );
    }

    /// Stop consuming, wait (bounded by the drain timeout) for handlers in
    /// progress, then close the connection. Calling it again returns `Ok(())`.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.deliveries.lock().take();
        let task = self.inner.task.lock().take();
        self.inner
            .lifecycle
            .shutdown(&self.inner.connection, task, self.inner.drain_timeout)
            .await
    }

    /// Error notifications for this server; see [`Client::notify`](crate::Client::notify)
    pub fn notify(&self) -> Option<mpsc::UnboundedReceiver<RpcError>> {
        self.inner.lifecycle.notifier.take()
    }

    pub fn state(&self) -> LinkState {
        self.inner.lifecycle.state()
    }

    pub fn state_receiver(&self) -> watch::Receiver<LinkState> {
        self.inner.lifecycle.state_receiver()
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }
}

struct RequestConsumer {
    dispatcher: Arc<Dispatcher>,
    kind: BindingKind,
    in_flight: InFlight,
    // None dispatches inline in the consumer loop
    permits: Option<Arc<Semaphore>>,
}

#[async_trait]
impl Consumer for RequestConsumer {
    async fn consume(&self, mut delivery: Delivery) {
        if let Err(e) = delivery.ack() {
            warn!(error = %e, "Failed to ack request");
        }

        let request = match envelope::decode_request(self.kind, delivery.message) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Discarding malformed request");
                return;
            }
        };
        debug!(
            handler = %request.handler,
            correlation_id = %request.correlation_id,
            "Request received"
        );

        match &self.permits {
            None => {
                let _in_flight = self.in_flight.enter();
                self.dispatcher.dispatch(request).await;
            }
            Some(permits) => {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    return;
                };
                let in_flight = self.in_flight.enter();
                let dispatcher = self.dispatcher.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    let _in_flight = in_flight;
                    dispatcher.dispatch(request).await;
                });
            }
        }
    }
}
