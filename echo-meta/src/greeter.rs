//! The echo service: the `Greeter` trait, its echo implementation and the dispatcher that routes
//! calls to it by method.

use std::{future::Future, sync::Arc};

use async_stream::stream;
use futures::StreamExt;
use motore::service::Service;

use crate::{
    context::{CallShape, MethodDescriptor, ServerContext},
    error::Error,
    message::{HelloReply, HelloRequest, RecvBody, SendBody},
    server::Streaming,
    BoxStream, Request, Response, Status,
};

pub const UNARY_ECHO: MethodDescriptor =
    MethodDescriptor::new("/helloworld.Greeter/UnaryEcho", CallShape::Unary);
pub const SERVER_STREAMING_ECHO: MethodDescriptor = MethodDescriptor::new(
    "/helloworld.Greeter/ServerStreamingEcho",
    CallShape::ServerStreaming,
);
pub const CLIENT_STREAMING_ECHO: MethodDescriptor = MethodDescriptor::new(
    "/helloworld.Greeter/ClientStreamingEcho",
    CallShape::ClientStreaming,
);
pub const BIDIRECTIONAL_STREAMING_ECHO: MethodDescriptor = MethodDescriptor::new(
    "/helloworld.Greeter/BidirectionalStreamingEcho",
    CallShape::Bidirectional,
);

pub const METHODS: [MethodDescriptor; 4] = [
    UNARY_ECHO,
    SERVER_STREAMING_ECHO,
    CLIENT_STREAMING_ECHO,
    BIDIRECTIONAL_STREAMING_ECHO,
];

/// Looks up a method by its full path.
pub fn method(path: &str) -> Option<MethodDescriptor> {
    METHODS.into_iter().find(|m| m.path == path)
}

/// Number of replies a server-streaming call produces.
pub const STREAMING_COUNT: usize = 10;

pub type ReplyStream = BoxStream<'static, Result<HelloReply, Status>>;

pub trait Greeter: Send + Sync + 'static {
    fn unary_echo(
        &self,
        cx: &mut ServerContext,
        req: Request<HelloRequest>,
    ) -> impl Future<Output = Result<Response<HelloReply>, Status>> + Send;

    fn server_streaming_echo(
        &self,
        cx: &mut ServerContext,
        req: Request<HelloRequest>,
    ) -> impl Future<Output = Result<Response<ReplyStream>, Status>> + Send;

    fn client_streaming_echo(
        &self,
        cx: &mut ServerContext,
        req: Request<Streaming<HelloRequest>>,
    ) -> impl Future<Output = Result<Response<HelloReply>, Status>> + Send;

    fn bidirectional_streaming_echo(
        &self,
        cx: &mut ServerContext,
        req: Request<Streaming<HelloRequest>>,
    ) -> impl Future<Output = Result<Response<ReplyStream>, Status>> + Send;
}

fn echo(req: &HelloRequest) -> HelloReply {
    HelloReply {
        message: format!("Hello again {}", req.name).into(),
    }
}

/// Replies `"Hello again " + name` to every request.
#[derive(Debug, Clone)]
pub struct EchoGreeter {
    streaming_count: usize,
}

impl EchoGreeter {
    pub fn new() -> Self {
        Self {
            streaming_count: STREAMING_COUNT,
        }
    }

    /// Sets how many replies a server-streaming call produces.
    pub fn streaming_count(mut self, count: usize) -> Self {
        self.streaming_count = count;
        self
    }
}

impl Default for EchoGreeter {
    fn default() -> Self {
        Self::new()
    }
}

impl Greeter for EchoGreeter {
    async fn unary_echo(
        &self,
        cx: &mut ServerContext,
        req: Request<HelloRequest>,
    ) -> Result<Response<HelloReply>, Status> {
        let Some(metadata) = cx.incoming_metadata() else {
            return Err(Error::MetadataMissing.into());
        };
        tracing::debug!("[ECHO] unary echo with {} metadata keys", metadata.len());
        Ok(Response::new(echo(req.get_ref())))
    }

    async fn server_streaming_echo(
        &self,
        _cx: &mut ServerContext,
        req: Request<HelloRequest>,
    ) -> Result<Response<ReplyStream>, Status> {
        let reply = echo(req.get_ref());
        let replies = std::iter::repeat(reply)
            .take(self.streaming_count)
            .map(Ok);
        Ok(Response::new(futures::stream::iter(replies).boxed()))
    }

    async fn client_streaming_echo(
        &self,
        _cx: &mut ServerContext,
        req: Request<Streaming<HelloRequest>>,
    ) -> Result<Response<HelloReply>, Status> {
        let mut requests = req.into_inner();
        let mut last = None;
        let mut received = 0usize;
        while let Some(request) = requests.message().await? {
            received += 1;
            last = Some(request);
        }
        let Some(last) = last else {
            return Err(Error::NoRequestsReceived.into());
        };
        tracing::debug!("[ECHO] client stream ended after {received} requests");
        Ok(Response::new(echo(&last)))
    }

    async fn bidirectional_streaming_echo(
        &self,
        _cx: &mut ServerContext,
        req: Request<Streaming<HelloRequest>>,
    ) -> Result<Response<ReplyStream>, Status> {
        let mut requests = req.into_inner();
        let replies = stream! {
            while let Some(request) = requests.next().await {
                yield request.map(|request| echo(&request));
            }
        };
        Ok(Response::new(replies.boxed()))
    }
}

/// Routes calls to a [`Greeter`] by method path.
pub struct GreeterServer<G> {
    inner: Arc<G>,
}

impl<G> GreeterServer<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

impl<G> Clone for GreeterServer<G> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<G> Service<ServerContext, Request<RecvBody<HelloRequest>>> for GreeterServer<G>
where
    G: Greeter,
{
    type Response = Response<SendBody<HelloReply>>;
    type Error = Status;

    async fn call(
        &self,
        cx: &mut ServerContext,
        req: Request<RecvBody<HelloRequest>>,
    ) -> Result<Self::Response, Self::Error> {
        let (metadata, body) = req.into_parts();
        let path = cx.rpc_info().method().clone();
        match method(&path) {
            Some(m) if m == UNARY_ECHO => {
                let req = Request::from_parts(metadata, body.into_unary()?);
                let resp = self.inner.unary_echo(cx, req).await?;
                Ok(resp.map(SendBody::Unary))
            }
            Some(m) if m == SERVER_STREAMING_ECHO => {
                let req = Request::from_parts(metadata, body.into_unary()?);
                let resp = self.inner.server_streaming_echo(cx, req).await?;
                Ok(resp.map(SendBody::Streaming))
            }
            Some(m) if m == CLIENT_STREAMING_ECHO => {
                let req = Request::from_parts(metadata, body.into_streaming()?);
                let resp = self.inner.client_streaming_echo(cx, req).await?;
                Ok(resp.map(SendBody::Unary))
            }
            Some(m) if m == BIDIRECTIONAL_STREAMING_ECHO => {
                let req = Request::from_parts(metadata, body.into_streaming()?);
                let resp = self.inner.bidirectional_streaming_echo(cx, req).await?;
                Ok(resp.map(SendBody::Streaming))
            }
            _ => Err(Status::unimplemented(format!("method {path} not found"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn methods_resolve_by_path() {
        assert_eq!(
            method("/helloworld.Greeter/BidirectionalStreamingEcho"),
            Some(BIDIRECTIONAL_STREAMING_ECHO)
        );
        assert_eq!(
            method("/helloworld.Greeter/ClientStreamingEcho").map(|m| m.shape),
            Some(CallShape::ClientStreaming)
        );
        assert!(method("/helloworld.Greeter/Nope").is_none());
    }

    #[test]
    fn echo_prepends_greeting() {
        assert_eq!(
            echo(&HelloRequest::new("unaryCall")).message.as_str(),
            "Hello again unaryCall"
        );
    }
}
