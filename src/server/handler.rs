//! Handler trait and closure adapters

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::marker::PhantomData;
use thiserror::Error;

/// An inbound call as seen by a handler
#[derive(Debug, Clone)]
pub struct Request {
    handler: String,
    correlation_id: String,
    body: Vec<u8>,
}

impl Request {
    pub fn new(
        handler: impl Into<String>,
        correlation_id: impl Into<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            handler: handler.into(),
            correlation_id: correlation_id.into(),
            body,
        }
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decode the body as JSON. An empty body decodes as `null`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        if self.body.is_empty() {
            serde_json::from_slice(b"null")
        } else {
            serde_json::from_slice(&self.body)
        }
    }
}

/// Why a handler produced no response value. Never sent to the caller.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Failed(#[from] anyhow::Error),

    #[error("failed to encode response: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Serves one named remote procedure
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<serde_json::Value, HandlerError>;
}

/// Handler built from a closure over the raw [`Request`]
pub struct HandlerFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Request) -> Result<serde_json::Value, HandlerError> {
        (self.f)(request).await
    }
}

/// Wrap a closure over the raw request
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    HandlerFn { f }
}

/// Handler built from a typed closure; see [`json_handler`]
pub struct JsonHandler<F, Req, Res> {
    f: F,
    _types: PhantomData<fn(Req) -> Res>,
}

#[async_trait]
impl<F, Fut, Req, Res> Handler for JsonHandler<F, Req, Res>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Res>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
{
    async fn handle(&self, request: Request) -> Result<serde_json::Value, HandlerError> {
        let input: Req = request
            .json()
            .map_err(|e| anyhow::Error::new(e).context("failed to decode request body"))?;
        let output = (self.f)(input).await?;
        serde_json::to_value(output).map_err(HandlerError::Encode)
    }
}

/// Wrap a typed closure. The request body is decoded into `Req` (a decode
/// failure counts as a handler failure) and the result is encoded as JSON.
///
/// ```no_run
/// use rpcbus::json_handler;
///
/// let sum = json_handler(|numbers: Vec<i64>| async move {
///     Ok::<_, anyhow::Error>(numbers.iter().sum::<i64>())
/// });
/// ```
pub fn json_handler<F, Fut, Req, Res>(f: F) -> JsonHandler<F, Req, Res>
where
    F: Fn(Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Res>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Res: Serialize + Send + 'static,
{
    JsonHandler {
        f,
        _types: PhantomData,
    }
}
