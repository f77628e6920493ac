//! Wire envelope
//!
//! Routing metadata travels in message headers, never in the body. The
//! header layout depends on the binding:
//!
//! | field          | exchange       | log           |
//! |----------------|----------------|---------------|
//! | handler        | `type`         | `handler`     |
//! | status         | `type`         | `status`      |
//! | correlation id | `correlation_id` | `correlation_id` + record key |
//! | reply to       | `reply_to`     | `reply_topic` |
//!
//! Exchange messages also carry `content_type: application/json`.

use crate::transport::{BindingKind, Message};

use std::fmt;
use thiserror::Error;

pub mod header {
    pub const TYPE: &str = "type";
    pub const CORRELATION_ID: &str = "correlation_id";
    pub const REPLY_TO: &str = "reply_to";
    pub const CONTENT_TYPE: &str = "content_type";
    pub const HANDLER: &str = "handler";
    pub const REPLY_TOPIC: &str = "reply_topic";
    pub const STATUS: &str = "status";
}

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Outcome code carried by every response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    BadHandler,
    InternalError,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::BadHandler => "bad-handler",
            Status::InternalError => "internal-error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Status::Success),
            "bad-handler" => Some(Status::BadHandler),
            "internal-error" => Some(Status::InternalError),
            _ => None,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A routing field was absent or empty
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("envelope is missing {0}")]
pub struct MissingField(pub &'static str);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub correlation_id: String,
    pub handler: String,
    pub reply_to: String,
    pub body: Vec<u8>,
}

/// A decoded response. `status` is kept raw so unknown codes can be reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseEnvelope {
    pub correlation_id: String,
    pub status: Option<String>,
    pub body: Vec<u8>,
}

fn required(message: &Message, key: &'static str) -> Result<String, MissingField> {
    match message.header(key) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(MissingField(key)),
    }
}

fn base(kind: BindingKind, correlation_id: &str, body: Vec<u8>) -> Message {
    let mut message = Message {
        body,
        ..Message::default()
    };
    message
        .headers
        .insert(header::CORRELATION_ID.to_string(), correlation_id.to_string());

    match kind {
        BindingKind::Exchange => {
            message
                .headers
                .insert(header::CONTENT_TYPE.to_string(), CONTENT_TYPE_JSON.to_string());
        }
        BindingKind::Log => {
            message.key = Some(correlation_id.to_string());
        }
    }
    message
}

pub fn encode_request(kind: BindingKind, request: RequestEnvelope) -> Message {
    let mut message = base(kind, &request.correlation_id, request.body);
    let (handler_key, reply_key) = match kind {
        BindingKind::Exchange => (header::TYPE, header::REPLY_TO),
        BindingKind::Log => (header::HANDLER, header::REPLY_TOPIC),
    };
    message.headers.insert(handler_key.to_string(), request.handler);
    message.headers.insert(reply_key.to_string(), request.reply_to);
    message
}

pub fn encode_response(
    kind: BindingKind,
    correlation_id: &str,
    status: Status,
    body: Vec<u8>,
) -> Message {
    let mut message = base(kind, correlation_id, body);
    let status_key = match kind {
        BindingKind::Exchange => header::TYPE,
        BindingKind::Log => header::STATUS,
    };
    message
        .headers
        .insert(status_key.to_string(), status.as_str().to_string());
    message
}

pub fn decode_request(kind: BindingKind, message: Message) -> Result<RequestEnvelope, MissingField> {
    let (handler_key, reply_key) = match kind {
        BindingKind::Exchange => (header::TYPE, header::REPLY_TO),
        BindingKind::Log => (header::HANDLER, header::REPLY_TOPIC),
    };

    Ok(RequestEnvelope {
        handler: required(&message, handler_key)?,
        correlation_id: required(&message, header::CORRELATION_ID)?,
        reply_to: required(&message, reply_key)?,
        body: message.body,
    })
}

pub fn decode_response(kind: BindingKind, message: Message) -> Result<ResponseEnvelope, MissingField> {
    let status_key = match kind {
        BindingKind::Exchange => header::TYPE,
        BindingKind::Log => header::STATUS,
    };

    Ok(ResponseEnvelope {
        correlation_id: required(&message, header::CORRELATION_ID)?,
        status: message.header(status_key).map(str::to_string),
        body: message.body,
    })
}
