//! Payload types of the echo service and the envelopes the dispatcher moves them in.

use faststr::FastStr;
use serde::{Deserialize, Serialize};

use crate::{server::Streaming, BoxStream, Status};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloRequest {
    pub name: FastStr,
}

impl HelloRequest {
    pub fn new(name: impl Into<FastStr>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloReply {
    pub message: FastStr,
}

/// What the server hands a handler: exactly one message, or the open request stream.
pub enum RecvBody<T> {
    Unary(T),
    Streaming(Streaming<T>),
}

impl<T> RecvBody<T> {
    /// Returns the single request of a unary or server-streaming call.
    pub fn into_unary(self) -> Result<T, Status> {
        match self {
            RecvBody::Unary(message) => Ok(message),
            RecvBody::Streaming(_) => Err(Status::internal("expected a single request message")),
        }
    }

    /// Returns the request stream of a client-streaming or bidirectional call.
    pub fn into_streaming(self) -> Result<Streaming<T>, Status> {
        match self {
            RecvBody::Streaming(stream) => Ok(stream),
            RecvBody::Unary(_) => Err(Status::internal("expected a request stream")),
        }
    }
}

/// What a handler hands back: one message, or a stream drained to the wire.
pub enum SendBody<T> {
    Unary(T),
    Streaming(BoxStream<'static, Result<T, Status>>),
}

impl<T> std::fmt::Debug for SendBody<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendBody::Unary(message) => f.debug_tuple("Unary").field(message).finish(),
            SendBody::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}
