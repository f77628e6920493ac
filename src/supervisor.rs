//! Reconnect supervisor
//!
//! Runs the consumer loop for one client or server. When the inbound stream
//! ends it reconnects with the connection's retry budget and starts the next
//! loop generation; the previous generation has always returned by then
//! because each one runs inline.
//!
//! Idle -> Running -> Recovering -> Running | Failed, and any state -> Stopped on
//! shutdown.

use crate::connection::Connection;
use crate::error::{ConnectError, RpcError};
use crate::lifecycle::{Lifecycle, LinkState};
use crate::transport::{Deliveries, Delivery};

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Handles one inbound delivery
#[async_trait]
pub(crate) trait Consumer: Send + Sync {
    async fn consume(&self, delivery: Delivery);
}

enum Exit {
    Stopped,
    StreamClosed,
}

pub(crate) async fn supervise(
    connection: Arc<Connection>,
    lifecycle: Arc<Lifecycle>,
    consumer: Arc<dyn Consumer>,
    mut deliveries: Deliveries,
) {
    let mut generation: u64 = 1;
    lifecycle.set_state(LinkState::Running);

    loop {
        debug!(source = %connection.source(), generation, "Consumer loop started");

        let exit = consume_until_closed(&lifecycle, consumer.as_ref(), &mut deliveries).await;
        if let Exit::Stopped = exit {
            lifecycle.set_state(LinkState::Stopped);
            debug!(source = %connection.source(), generation, "Consumer loop stopped");
            return;
        }

        warn!(source = %connection.source(), generation, "Inbound stream closed, reconnecting");
        lifecycle.set_state(LinkState::Recovering);

        match connection.attempt_connect_until(lifecycle.stop.stopped()).await {
            Ok(next) => {
                deliveries = next;
                generation += 1;
                lifecycle.set_state(LinkState::Running);
                info!(source = %connection.source(), generation, "Reconnected");
            }
            Err(ConnectError::Cancelled) => {
                lifecycle.set_state(LinkState::Stopped);
                debug!(source = %connection.source(), "Reconnect cancelled by shutdown");
                return;
            }
            Err(e) => {
                error!(source = %connection.source(), error = %e, "Reconnect failed, giving up");
                lifecycle.set_state(LinkState::Failed);
                lifecycle.notifier.fail(RpcError::Connect(e));
                return;
            }
        }
    }
}

async fn consume_until_closed(
    lifecycle: &Lifecycle,
    consumer: &dyn Consumer,
    deliveries: &mut Deliveries,
) -> Exit {
    let stopped = lifecycle.stop.stopped();
    tokio::pin!(stopped);

    loop {
        tokio::select! {
            biased;
            _ = &mut stopped => return Exit::Stopped,
            item = deliveries.next() => match item {
                Some(Ok(delivery)) => consumer.consume(delivery).await,
                Some(Err(e)) => {
                    warn!(error = %e, "Inbound stream error");
                    lifecycle.notifier.report(RpcError::Transport(e));
                }
                None => return Exit::StreamClosed,
            },
        }
    }
}
