//! Call client
//!
//! Turns publish/consume into a blocking call: each [`Client::remote_call`]
//! publishes one request tagged with a fresh correlation id and waits for
//! the reply with the same id to come back through the client's single
//! consumer loop.

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::envelope::{self, RequestEnvelope, Status};
use crate::error::{Result, RpcError};
use crate::lifecycle::{Lifecycle, LinkState};
use crate::registry::{CorrelationRegistry, Reply};
use crate::supervisor::{supervise, Consumer};
use crate::transport::{Binding, BindingKind, Delivery};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct ClientInner {
    connection: Arc<Connection>,
    registry: Arc<CorrelationRegistry>,
    lifecycle: Arc<Lifecycle>,
    request_destination: String,
    reply_destination: String,
    call_timeout: Duration,
    drain_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // Let the supervisor exit when the last handle goes away without shutdown
        self.lifecycle.stop.stop();
    }
}

/// RPC client
///
/// Cheap to clone; all clones share one connection, one consumer loop and
/// one correlation registry.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Connect and start consuming replies.
    ///
    /// Requests go to `request_destination`; replies are read from
    /// `reply_destination`, which every request names as its reply address.
    /// On the log binding a client without a consumer group gets a unique
    /// one so it sees every reply on the topic.
    pub async fn connect(
        binding: Binding,
        config: ClientConfig,
        request_destination: impl Into<String>,
        reply_destination: impl Into<String>,
    ) -> Result<Self> {
        let request_destination = request_destination.into();
        let reply_destination = reply_destination.into();
        if request_destination.is_empty() || reply_destination.is_empty() {
            return Err(RpcError::Config(
                "request and reply destinations must not be empty".to_string(),
            ));
        }

        let ClientConfig {
            connection: mut connection_config,
            call_timeout,
            drain_timeout,
        } = config;

        if binding.kind() == BindingKind::Log
            && connection_config.group_id.as_deref().map_or(true, str::is_empty)
        {
            connection_config.group_id =
                Some(format!("{}-{}", connection_config.client_id, Uuid::new_v4()));
        }

        let connection = Arc::new(Connection::new(
            binding,
            connection_config,
            reply_destination.clone(),
        ));
        let deliveries = connection.attempt_connect().await?;

        let registry = Arc::new(CorrelationRegistry::new());
        let lifecycle = Arc::new(Lifecycle::new());
        let consumer = Arc::new(ReplyConsumer {
            registry: registry.clone(),
            kind: connection.kind(),
        });

        lifecycle.set_state(LinkState::Running);
        let task = tokio::spawn(supervise(
            connection.clone(),
            lifecycle.clone(),
            consumer,
            deliveries,
        ));

        info!(
            binding = ?connection.kind(),
            request_destination = %request_destination,
            reply_destination = %reply_destination,
            "Client connected"
        );

        Ok(Self {
            inner: Arc::new(ClientInner {
                connection,
                registry,
                lifecycle,
                request_destination,
                reply_destination,
                call_timeout,
                drain_timeout,
                task: Mutex::new(Some(task)),
            }),
        })
    }

    /// Call `handler` on the server and wait for its reply.
    ///
    /// `None` sends an empty body. Fails with
    /// [`RpcError::Timeout`] after the configured call timeout. If the link
    /// is recovering the request is published once it is back, within the
    /// same timeout. [`RpcError::ConnectionClosed`] means this client is
    /// shut down or has failed for good.
    pub async fn remote_call<Req, Res>(&self, handler: &str, request: Option<&Req>) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.call(handler, request, None, std::future::pending()).await
    }

    /// Like [`remote_call`](Self::remote_call), also giving up at `deadline`
    /// if that comes before the call timeout
    pub async fn remote_call_with_deadline<Req, Res>(
        &self,
        handler: &str,
        request: Option<&Req>,
        deadline: Instant,
    ) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        self.call(handler, request, Some(deadline), std::future::pending())
            .await
    }

    /// Like [`remote_call`](Self::remote_call), returning
    /// [`RpcError::Cancelled`] if `cancel` completes first
    pub async fn remote_call_until<Req, Res, F>(
        &self,
        handler: &str,
        request: Option<&Req>,
        cancel: F,
    ) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
        F: Future<Output = ()>,
    {
        self.call(handler, request, None, cancel).await
    }

    async fn call<Req, Res, F>(
        &self,
        handler: &str,
        request: Option<&Req>,
        deadline: Option<Instant>,
        cancel: F,
    ) -> Result<Res>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
        F: Future<Output = ()>,
    {
        let inner = &self.inner;
        if inner.lifecycle.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        if handler.is_empty() {
            return Err(RpcError::BadHandler);
        }

        let body = match request {
            Some(request) => serde_json::to_vec(request).map_err(RpcError::Encode)?,
            None => Vec::new(),
        };

        let correlation_id = Uuid::new_v4().to_string();
        let mut pending = inner.registry.register(correlation_id.clone());

        let message = envelope::encode_request(
            inner.connection.kind(),
            RequestEnvelope {
                correlation_id: correlation_id.clone(),
                handler: handler.to_string(),
                reply_to: inner.reply_destination.clone(),
                body,
            },
        );

        let mut until = Instant::now() + inner.call_timeout;
        if let Some(deadline) = deadline {
            until = until.min(deadline);
        }
        let stopped = inner.lifecycle.stop.stopped();
        tokio::pin!(stopped);
        tokio::pin!(cancel);

        let mut link = inner.lifecycle.state_receiver();
        let published = async {
            loop {
                let result = {
                    let _in_flight = inner.lifecycle.in_flight.enter();
                    inner
                        .connection
                        .publish(&inner.request_destination, message.clone())
                        .await
                };
                let Err(e) = result else {
                    return Ok(());
                };
                if inner.lifecycle.is_closed() {
                    return Err(RpcError::ConnectionClosed);
                }
                warn!(
                    correlation_id = %correlation_id,
                    handler = %handler,
                    error = %e,
                    "Failed to publish request, waiting for the link"
                );
                if !link_restored(&mut link).await {
                    return Err(RpcError::ConnectionClosed);
                }
            }
        };

        tokio::select! {
            biased;
            published = published => published?,
            _ = &mut stopped => return Err(RpcError::ConnectionClosed),
            _ = &mut cancel => return Err(RpcError::Cancelled),
            _ = sleep_until(until) => {
                debug!(correlation_id = %correlation_id, handler = %handler, "Remote call timed out before publishing");
                return Err(RpcError::Timeout);
            }
        }
        debug!(correlation_id = %correlation_id, handler = %handler, "Request published");

        let reply = tokio::select! {
            biased;
            reply = pending.reply() => reply,
            _ = &mut stopped => return Err(RpcError::ConnectionClosed),
            _ = &mut cancel => return Err(RpcError::Cancelled),
            _ = sleep_until(until) => {
                debug!(correlation_id = %correlation_id, handler = %handler, "Remote call timed out");
                return Err(RpcError::Timeout);
            }
        };

        match reply {
            Some(reply) => decode_reply(reply),
            None => Err(RpcError::ConnectionClosed),
        }
    }

    /// Stop the consumer loop, wait (bounded by the drain timeout) for
    /// publishes in progress, then close the connection.
    ///
    /// Calls still waiting for a reply return [`RpcError::ConnectionClosed`].
    /// Calling it again returns `Ok(())`.
    pub async fn shutdown(&self) -> Result<()> {
        let task = self.inner.task.lock().take();
        self.inner
            .lifecycle
            .shutdown(&self.inner.connection, task, self.inner.drain_timeout)
            .await
    }

    /// Error notifications for this client.
    ///
    /// Carries steady-state transport errors and the terminal reconnect
    /// failure. The channel closes after a terminal failure or on shutdown.
    /// Only the first caller receives it.
    pub fn notify(&self) -> Option<mpsc::UnboundedReceiver<RpcError>> {
        self.inner.lifecycle.notifier.take()
    }

    pub fn state(&self) -> LinkState {
        self.inner.lifecycle.state()
    }

    pub fn state_receiver(&self) -> watch::Receiver<LinkState> {
        self.inner.lifecycle.state_receiver()
    }

    /// Number of calls waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn reply_destination(&self) -> &str {
        &self.inner.reply_destination
    }
}

/// Waits until a recovery in progress (or one not yet noticed by the
/// supervisor) has finished. Returns false if the state channel went away.
async fn link_restored(link: &mut watch::Receiver<LinkState>) -> bool {
    if !link.has_changed().unwrap_or(false) && link.changed().await.is_err() {
        return false;
    }
    link.wait_for(|state| *state != LinkState::Recovering)
        .await
        .is_ok()
}

fn decode_reply<Res: DeserializeOwned>(reply: Reply) -> Result<Res> {
    let status = reply.status.as_deref().and_then(Status::parse);
    match status {
        Some(Status::Success) => {
            let body: &[u8] = if reply.body.is_empty() {
                b"null"
            } else {
                &reply.body
            };
            serde_json::from_slice(body).map_err(RpcError::Decode)
        }
        Some(Status::BadHandler) => Err(RpcError::BadHandler),
        Some(Status::InternalError) => Err(RpcError::InternalServer),
        None => Err(RpcError::UnknownStatus(reply.status.unwrap_or_default())),
    }
}

/// Routes replies to waiting calls
struct ReplyConsumer {
    registry: Arc<CorrelationRegistry>,
    kind: BindingKind,
}

#[async_trait]
impl Consumer for ReplyConsumer {
    async fn consume(&self, mut delivery: Delivery) {
        if let Err(e) = delivery.ack() {
            warn!(error = %e, "Failed to ack reply");
        }

        let response = match envelope::decode_response(self.kind, delivery.message) {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "Dropping malformed reply");
                return;
            }
        };

        let reply = Reply {
            status: response.status,
            body: response.body,
        };
        if !self.registry.fulfill(&response.correlation_id, reply) {
            debug!(correlation_id = %response.correlation_id, "No pending call for reply");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(status: Option<&str>, body: &str) -> Reply {
        Reply {
            status: status.map(str::to_string),
            body: body.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_decode_success_body() {
        let value: serde_json::Value = decode_reply(reply(Some("success"), r#"{"n":3}"#)).unwrap();
        assert_eq!(value["n"], 3);
    }

    #[test]
    fn test_decode_empty_success_body_as_unit() {
        assert!(decode_reply::<()>(reply(Some("success"), "")).is_ok());

        let none: Option<u32> = decode_reply(reply(Some("success"), "")).unwrap();
        assert_eq!(none, None);
    }

    #[test]
    fn test_decode_status_mapping() {
        assert!(matches!(
            decode_reply::<()>(reply(Some("bad-handler"), "")),
            Err(RpcError::BadHandler)
        ));
        assert!(matches!(
            decode_reply::<()>(reply(Some("internal-error"), "")),
            Err(RpcError::InternalServer)
        ));
    }

    #[test]
    fn test_decode_unknown_or_missing_status() {
        match decode_reply::<()>(reply(Some("teapot"), "")) {
            Err(RpcError::UnknownStatus(status)) => assert_eq!(status, "teapot"),
            other => panic!("unexpected: {other:?}"),
        }
        match decode_reply::<()>(reply(None, "{}")) {
            Err(RpcError::UnknownStatus(status)) => assert!(status.is_empty()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_decode_type_mismatch() {
        let result = decode_reply::<u32>(reply(Some("success"), r#""text""#));
        assert!(matches!(result, Err(RpcError::Decode(_))));
    }
}
