//! Request dispatch
//!
//! Runs one request through the router and publishes exactly one reply.

use crate::connection::Connection;
use crate::envelope::{self, RequestEnvelope, Status};
use crate::server::handler::Request;
use crate::server::router::Router;

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub(crate) struct Dispatcher {
    connection: Arc<Connection>,
    router: Router,
}

impl Dispatcher {
    pub(crate) fn new(connection: Arc<Connection>, router: Router) -> Self {
        Self { connection, router }
    }

    pub(crate) async fn dispatch(&self, request: RequestEnvelope) {
        let RequestEnvelope {
            correlation_id,
            handler,
            reply_to,
            body,
        } = request;

        let (status, body) = self.invoke(&handler, &correlation_id, body).await;
        let reply = envelope::encode_response(self.connection.kind(), &correlation_id, status, body);

        match self.connection.publish(&reply_to, reply).await {
            Ok(()) => debug!(
                correlation_id = %correlation_id,
                handler = %handler,
                status = %status,
                "Reply published"
            ),
            Err(e) => warn!(
                correlation_id = %correlation_id,
                reply_to = %reply_to,
                error = %e,
                "Failed to publish reply"
            ),
        }
    }

    /// Status and body for the reply. Only a success carries a body.
    async fn invoke(&self, name: &str, correlation_id: &str, body: Vec<u8>) -> (Status, Vec<u8>) {
        let Some(handler) = self.router.get(name) else {
            warn!(handler = %name, correlation_id = %correlation_id, "Unknown handler");
            return (Status::BadHandler, Vec::new());
        };

        let request = Request::new(name, correlation_id, body);
        let outcome = AssertUnwindSafe(handler.handle(request)).catch_unwind().await;

        match outcome {
            Ok(Ok(value)) => match serde_json::to_vec(&value) {
                Ok(body) => (Status::Success, body),
                Err(e) => {
                    error!(handler = %name, correlation_id = %correlation_id, error = %e, "Failed to encode response");
                    (Status::InternalError, Vec::new())
                }
            },
            Ok(Err(e)) => {
                error!(handler = %name, correlation_id = %correlation_id, error = %e, "Handler failed");
                (Status::InternalError, Vec::new())
            }
            Err(panic) => {
                error!(
                    handler = %name,
                    correlation_id = %correlation_id,
                    panic = %panic_message(panic.as_ref()),
                    "Handler panicked"
                );
                (Status::InternalError, Vec::new())
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
