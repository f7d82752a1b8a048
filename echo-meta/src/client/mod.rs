//! The Greeter client.
//!
//! Unary and streaming calls go through two separate service stacks, so interceptors can be
//! layered onto each independently:
//!
//! ```rust,ignore
//! let client = GreeterClientBuilder::new(transport)
//!     .rpc_timeout(Duration::from_secs(1))
//!     .unary_layer(ClientUnaryLayer::new())
//!     .stream_layer(ClientStreamLayer::new())
//!     .build();
//! ```

mod callopt;
mod stream;

use std::{sync::Arc, time::Duration};

use motore::{
    layer::{Identity, Layer, Stack},
    service::Service,
};

pub use self::{
    callopt::CallOpt,
    stream::{ClientStream, RequestSender, ResponseReceiver},
};
use crate::{
    context::{ClientContext, Config, MethodDescriptor, Role, RpcInfo},
    error::Error,
    greeter::{
        BIDIRECTIONAL_STREAMING_ECHO, CLIENT_STREAMING_ECHO, SERVER_STREAMING_ECHO, UNARY_ECHO,
    },
    message::{HelloReply, HelloRequest},
    metadata::MetadataMap,
    transport::{CallHead, Cancellation, Transport},
    IntoRequest, Request, Response, Status,
};

/// Opens a call through `transport`, recording the outgoing metadata in `cx`.
async fn open<T: Transport>(
    transport: &T,
    cx: &mut ClientContext,
    metadata: MetadataMap,
) -> Result<ClientStream<T::Request, T::Response>, Error> {
    cx.stats.record_call_start_at();
    let cancellation = Cancellation::new();
    let deadline = cx
        .config()
        .rpc_timeout()
        .map(|timeout| cancellation.cancel_after(timeout));
    let method = cx.rpc_info().method().clone();
    let head = CallHead {
        method: method.clone(),
        shape: cx.rpc_info().shape(),
        metadata: metadata.clone(),
        buffer: cx.config().stream_buffer(),
        cancellation: cancellation.clone(),
    };
    cx.record_outgoing(metadata);

    let call = tokio::select! {
        biased;
        status = cancellation.cancelled() => return Err(Error::Status(status)),
        call = transport.open(head) => call?,
    };
    Ok(ClientStream::new(call, method, deadline))
}

/// The innermost unary service: sends one request and collects the response, header and
/// trailer.
pub struct UnaryCall<T> {
    transport: Arc<T>,
}

impl<T> Clone for UnaryCall<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
        }
    }
}

impl<T> Service<ClientContext, Request<T::Request>> for UnaryCall<T>
where
    T: Transport,
{
    type Response = Response<T::Response>;
    type Error = Error;

    async fn call(
        &self,
        cx: &mut ClientContext,
        req: Request<T::Request>,
    ) -> Result<Self::Response, Self::Error> {
        let (metadata, message) = req.into_parts();
        let mut stream = open(&*self.transport, cx, metadata).await?;

        let result = exchange(&mut stream, message).await;
        cx.record_header(stream.received_header().cloned());
        cx.record_trailer(stream.trailer().cloned());
        cx.stats.record_call_end_at();

        let message = result.map_err(|err| match err {
            Error::StreamTerminal(status) => Error::Status(status),
            other => other,
        })?;
        Ok(Response::from_parts(
            cx.header().cloned().unwrap_or_default(),
            cx.trailer().cloned().unwrap_or_default(),
            message,
        ))
    }
}

async fn exchange<Req, Resp>(
    stream: &mut ClientStream<Req, Resp>,
    message: Req,
) -> Result<Resp, Error> {
    if let Err(err) = stream.send(message).await {
        // The terminal status read below says why.
        tracing::debug!("[ECHO] unary request not delivered: {err}");
    }
    stream.close_send();
    let Some(reply) = stream.message().await? else {
        return Err(Status::internal("no response received for a unary call").into());
    };
    match stream.message().await? {
        None => Ok(reply),
        Some(_) => {
            Err(Status::internal("more than one response received for a unary call").into())
        }
    }
}

/// The innermost streaming service: opens the call and sends the initial request, if any.
pub struct StreamCall<T> {
    transport: Arc<T>,
}

impl<T> Clone for StreamCall<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
        }
    }
}

impl<T> Service<ClientContext, Request<Option<T::Request>>> for StreamCall<T>
where
    T: Transport,
{
    type Response = ClientStream<T::Request, T::Response>;
    type Error = Error;

    async fn call(
        &self,
        cx: &mut ClientContext,
        req: Request<Option<T::Request>>,
    ) -> Result<Self::Response, Self::Error> {
        let (metadata, message) = req.into_parts();
        let mut stream = open(&*self.transport, cx, metadata).await?;
        if let Some(message) = message {
            stream.send(message).await?;
            stream.close_send();
        }
        Ok(stream)
    }
}

pub struct GreeterClientBuilder<T, UL = Identity, SL = Identity> {
    transport: T,
    config: Config,
    unary_layer: UL,
    stream_layer: SL,
}

impl<T> GreeterClientBuilder<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            config: Config::default(),
            unary_layer: Identity::new(),
            stream_layer: Identity::new(),
        }
    }
}

impl<T, UL, SL> GreeterClientBuilder<T, UL, SL> {
    /// Sets the rpc timeout for every call made by the client.
    ///
    /// A [`CallOpt`] can override it per call.
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.set_rpc_timeout(Some(timeout));
        self
    }

    /// Sets the capacity of each message channel of a call.
    ///
    /// Default is 64.
    pub fn stream_buffer(mut self, stream_buffer: usize) -> Self {
        self.config.set_stream_buffer(Some(stream_buffer));
        self
    }

    /// Adds a new inner layer to the unary stack.
    ///
    /// After `.unary_layer(foo).unary_layer(bar)` a call goes through foo, then bar.
    pub fn unary_layer<Inner>(self, layer: Inner) -> GreeterClientBuilder<T, Stack<Inner, UL>, SL> {
        GreeterClientBuilder {
            transport: self.transport,
            config: self.config,
            unary_layer: Stack::new(layer, self.unary_layer),
            stream_layer: self.stream_layer,
        }
    }

    /// Adds a new inner layer to the streaming stack.
    pub fn stream_layer<Inner>(
        self,
        layer: Inner,
    ) -> GreeterClientBuilder<T, UL, Stack<Inner, SL>> {
        GreeterClientBuilder {
            transport: self.transport,
            config: self.config,
            unary_layer: self.unary_layer,
            stream_layer: Stack::new(layer, self.stream_layer),
        }
    }

    pub fn build(self) -> GreeterClient<UL::Service, SL::Service>
    where
        T: Transport<Request = HelloRequest, Response = HelloReply>,
        UL: Layer<UnaryCall<T>>,
        SL: Layer<StreamCall<T>>,
    {
        let transport = Arc::new(self.transport);
        let unary = self.unary_layer.layer(UnaryCall {
            transport: transport.clone(),
        });
        let stream = self.stream_layer.layer(StreamCall { transport });
        GreeterClient {
            inner: Arc::new(ClientInner {
                unary,
                stream,
                config: self.config,
            }),
        }
    }
}

struct ClientInner<U, S> {
    unary: U,
    stream: S,
    config: Config,
}

pub struct GreeterClient<U, S> {
    inner: Arc<ClientInner<U, S>>,
}

impl<U, S> Clone for GreeterClient<U, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<U, S> GreeterClient<U, S>
where
    U: Service<ClientContext, Request<HelloRequest>, Response = Response<HelloReply>, Error = Error>
        + Send
        + Sync,
    S: Service<
            ClientContext,
            Request<Option<HelloRequest>>,
            Response = ClientStream<HelloRequest, HelloReply>,
            Error = Error,
        > + Send
        + Sync,
{
    fn make_cx(&self, method: MethodDescriptor, config: Config) -> ClientContext {
        let mut cx = ClientContext::new(
            RpcInfo::new(Role::Client, method.path, method.shape),
            self.inner.config.clone(),
        );
        cx.config_mut().merge(config);
        cx
    }

    pub async fn unary_echo(
        &self,
        req: impl IntoRequest<HelloRequest>,
    ) -> Result<Response<HelloReply>, Error> {
        self.unary_echo_with_callopt(req, CallOpt::default()).await
    }

    pub async fn unary_echo_with_callopt(
        &self,
        req: impl IntoRequest<HelloRequest>,
        callopt: CallOpt,
    ) -> Result<Response<HelloReply>, Error> {
        let mut req = req.into_request();
        req.metadata_mut().merge(callopt.metadata);
        let mut cx = self.make_cx(UNARY_ECHO, callopt.config);
        self.inner.unary.call(&mut cx, req).await
    }

    pub async fn server_streaming_echo(
        &self,
        req: impl IntoRequest<HelloRequest>,
    ) -> Result<ClientStream<HelloRequest, HelloReply>, Error> {
        self.server_streaming_echo_with_callopt(req, CallOpt::default())
            .await
    }

    pub async fn server_streaming_echo_with_callopt(
        &self,
        req: impl IntoRequest<HelloRequest>,
        callopt: CallOpt,
    ) -> Result<ClientStream<HelloRequest, HelloReply>, Error> {
        self.open_stream(SERVER_STREAMING_ECHO, req.into_request().map(Some), callopt)
            .await
    }

    pub async fn client_streaming_echo(
        &self,
    ) -> Result<ClientStream<HelloRequest, HelloReply>, Error> {
        self.client_streaming_echo_with_callopt(CallOpt::default())
            .await
    }

    pub async fn client_streaming_echo_with_callopt(
        &self,
        callopt: CallOpt,
    ) -> Result<ClientStream<HelloRequest, HelloReply>, Error> {
        self.open_stream(CLIENT_STREAMING_ECHO, Request::new(None), callopt)
            .await
    }

    pub async fn bidirectional_streaming_echo(
        &self,
    ) -> Result<ClientStream<HelloRequest, HelloReply>, Error> {
        self.bidirectional_streaming_echo_with_callopt(CallOpt::default())
            .await
    }

    pub async fn bidirectional_streaming_echo_with_callopt(
        &self,
        callopt: CallOpt,
    ) -> Result<ClientStream<HelloRequest, HelloReply>, Error> {
        self.open_stream(BIDIRECTIONAL_STREAMING_ECHO, Request::new(None), callopt)
            .await
    }

    async fn open_stream(
        &self,
        method: MethodDescriptor,
        mut req: Request<Option<HelloRequest>>,
        callopt: CallOpt,
    ) -> Result<ClientStream<HelloRequest, HelloReply>, Error> {
        req.metadata_mut().merge(callopt.metadata);
        let mut cx = self.make_cx(method, callopt.config);
        self.inner.stream.call(&mut cx, req).await
    }
}
