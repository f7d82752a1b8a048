//! Metadata propagation and interceptor protocol for a four-shape RPC echo service.
//!
//! The crate is split the same way a call flows:
//!
//! - [`metadata`] holds the side-channel key/value container used for request metadata,
//!   response headers and response trailers.
//! - [`context`] carries per-call state on both ends.
//! - [`transport`] defines the contract a transport must honor and ships an in-process one.
//! - [`layer`] contains the client and server interceptors.
//! - [`driver`] sequences sends and receives for the streaming shapes.
//! - [`greeter`] is the echo service itself.

pub mod client;
pub mod context;
pub mod driver;
pub mod error;
pub mod greeter;
pub mod layer;
pub mod message;
pub mod metadata;
pub mod request;
pub mod response;
pub mod server;
pub mod status;
pub mod tracing;
pub mod transport;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type BoxStream<'l, T> = std::pin::Pin<Box<dyn futures::Stream<Item = T> + Send + 'l>>;

pub use client::{ClientStream, GreeterClient, GreeterClientBuilder};
pub use error::{Error, Result};
pub use message::{HelloReply, HelloRequest, RecvBody, SendBody};
pub use metadata::MetadataMap;
pub use request::{IntoRequest, Request};
pub use response::Response;
pub use server::{Server, Streaming};
pub use status::{Code, Status};
