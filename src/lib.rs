//! rpcbus - request/response RPC over publish/subscribe brokers
//!
//! Turns a broadcast-oriented transport into blocking remote calls. Two
//! binding styles are supported:
//!
//! - exchange: fanout exchanges with exclusive queues (AMQP style)
//! - log: topics read through consumer groups (partitioned-log style)
//!
//! A [`Client`] publishes requests tagged with a correlation id and matches
//! replies back to the waiting call. A [`Server`] consumes requests,
//! dispatches them by handler name through a [`Router`] and replies with a
//! status code. Both reconnect on their own when the inbound stream ends.
//!
//! # Example
//!
//! ```no_run
//! use rpcbus::memory::MemoryBroker;
//! use rpcbus::{json_handler, Binding, Client, ClientConfig, ConnectionConfig, Router, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let broker = MemoryBroker::new();
//!
//!     let router = Router::builder()
//!         .route("sum", json_handler(|numbers: Vec<i64>| async move {
//!             Ok::<_, anyhow::Error>(numbers.iter().sum::<i64>())
//!         }))
//!         .build();
//!
//!     let server = Server::new(
//!         Binding::exchange(broker.clone()),
//!         ServerConfig::new(ConnectionConfig::new("memory://local")),
//!         "math.requests",
//!         router,
//!     )
//!     .await?;
//!     server.start();
//!
//!     let client = Client::connect(
//!         Binding::exchange(broker),
//!         ClientConfig::new(ConnectionConfig::new("memory://local")),
//!         "math.requests",
//!         "math.replies",
//!     )
//!     .await?;
//!
//!     let total: i64 = client.remote_call("sum", Some(&vec![1, 2, 3])).await?;
//!     assert_eq!(total, 6);
//!
//!     client.shutdown().await?;
//!     server.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod connection;
pub mod envelope;
mod error;
mod lifecycle;
mod registry;
mod server;
mod supervisor;
pub mod transport;

pub use client::Client;
pub use config::{ClientConfig, ConnectionConfig, OffsetReset, ServerConfig};
pub use connection::Connection;
pub use envelope::Status;
pub use error::{ConnectError, Result, RpcError, TransportError};
pub use lifecycle::LinkState;
pub use registry::{CorrelationRegistry, PendingCall, Reply};
pub use server::{
    handler_fn, json_handler, Handler, HandlerError, HandlerFn, JsonHandler, Request, Router,
    RouterBuilder, Server,
};
pub use transport::{memory, Binding, BindingKind, Message};
