use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use echo_meta::{
    client::{CallOpt, StreamCall, UnaryCall},
    context::{ClientContext, ServerContext},
    driver,
    error::MetadataSection,
    greeter::{EchoGreeter, GreeterServer},
    layer::{
        client::{ClientStreamService, ClientUnaryService},
        ClientStreamLayer, ClientUnaryLayer, MetadataContract, ServerMetadataLayer,
    },
    metadata::{LOCATION_KEY, TIMESTAMP_KEY},
    tracing::NoopProvider,
    transport::{Incoming, LocalTransport},
    Code, Error, GreeterClient, GreeterClientBuilder, HelloReply, HelloRequest, MetadataMap,
    RecvBody, Request, Response, SendBody, Server, Status,
};
use faststr::FastStr;
use futures::StreamExt;
use motore::{layer::Layer, service::Service};
use parking_lot::Mutex;

type Transport = LocalTransport<HelloRequest, HelloReply>;
type EchoClient = GreeterClient<
    ClientUnaryService<UnaryCall<Transport>>,
    ClientStreamService<StreamCall<Transport>>,
>;

fn values(metadata: &MetadataMap, key: &str) -> Vec<String> {
    metadata
        .get(key)
        .map(|v| v.iter().map(|s| s.to_string()).collect())
        .unwrap_or_default()
}

fn names(name: &'static str, n: usize) -> impl futures::Stream<Item = HelloRequest> {
    futures::stream::iter((0..n).map(move |_| HelloRequest::new(name)))
}

/// Serves the echo greeter behind the metadata interceptor.
fn echo_server(incoming: Incoming<HelloRequest, HelloReply>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let server =
        Server::new(GreeterServer::new(EchoGreeter::new())).layer(ServerMetadataLayer::new());
    tokio::spawn(server.run(incoming));
}

fn echo_client(transport: Transport) -> EchoClient {
    GreeterClientBuilder::new(transport)
        .unary_layer(ClientUnaryLayer::new())
        .stream_layer(ClientStreamLayer::new())
        .build()
}

fn setup() -> EchoClient {
    let (transport, incoming) = LocalTransport::new();
    echo_server(incoming);
    echo_client(transport)
}

#[tokio::test]
async fn unary_round_trip_carries_header_and_trailer() {
    let client = setup();
    let resp = client
        .unary_echo(HelloRequest::new("unaryCall"))
        .await
        .unwrap();

    assert_eq!(resp.get_ref().message.as_str(), "Hello again unaryCall");
    assert_eq!(values(resp.metadata(), LOCATION_KEY), ["MTV"]);
    assert_eq!(values(resp.metadata(), TIMESTAMP_KEY).len(), 1);
    assert_eq!(values(resp.trailers(), TIMESTAMP_KEY).len(), 1);
}

#[tokio::test]
async fn server_streaming_yields_ten_replies() {
    let client = setup();
    let stream = client
        .server_streaming_echo(HelloRequest::new("serverStreamingCall"))
        .await
        .unwrap();
    let outcome = driver::server_streaming(stream).await.unwrap();

    assert_eq!(outcome.messages.len(), 10);
    assert!(outcome
        .messages
        .iter()
        .all(|r| r.message.as_str() == "Hello again serverStreamingCall"));
    assert_eq!(values(&outcome.header, LOCATION_KEY), ["MTV"]);
    assert!(outcome.trailer.contains_key(TIMESTAMP_KEY));
}

#[tokio::test]
async fn client_streaming_echoes_the_last_request() {
    let client = setup();
    let stream = client.client_streaming_echo().await.unwrap();
    let requests = names("clientStreamWithMetadata", 9).chain(futures::stream::iter([
        HelloRequest::new("last"),
    ]));
    let outcome = driver::client_streaming(stream, requests).await.unwrap();

    assert_eq!(outcome.messages.len(), 1);
    assert_eq!(outcome.messages[0].message.as_str(), "Hello again last");
    assert_eq!(values(&outcome.header, LOCATION_KEY), ["MTV"]);
    assert!(outcome.trailer.contains_key(TIMESTAMP_KEY));
}

#[tokio::test]
async fn client_stream_can_be_driven_by_hand() {
    let client = setup();
    let mut stream = client.client_streaming_echo().await.unwrap();

    let header = stream.header().await.unwrap();
    assert_eq!(values(header, LOCATION_KEY), ["MTV"]);
    for name in ["a", "b", "c"] {
        stream.send(HelloRequest::new(name)).await.unwrap();
    }
    let reply = stream.close_and_recv().await.unwrap();
    assert_eq!(reply.message.as_str(), "Hello again c");
    assert!(stream.trailer().unwrap().contains_key(TIMESTAMP_KEY));
}

#[tokio::test]
async fn client_streaming_without_requests_is_invalid() {
    let client = setup();
    let stream = client.client_streaming_echo().await.unwrap();
    let err = driver::client_streaming(stream, names("unused", 0))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn bidirectional_preserves_order() {
    let client = setup();
    let stream = client.bidirectional_streaming_echo().await.unwrap();
    let requests = futures::stream::iter((0..10).map(|i| HelloRequest::new(format!("bidi-{i}"))));
    let outcome = driver::bidirectional(stream, requests).await.unwrap();

    let replies: Vec<_> = outcome
        .messages
        .iter()
        .map(|r| r.message.to_string())
        .collect();
    let expected: Vec<_> = (0..10).map(|i| format!("Hello again bidi-{i}")).collect();
    assert_eq!(replies, expected);
    assert!(outcome.trailer.contains_key(TIMESTAMP_KEY));
}

#[tokio::test]
async fn missing_metadata_is_data_loss_without_header_or_trailer() {
    let (transport, incoming) = LocalTransport::new();
    echo_server(incoming);
    let client = echo_client(transport.without_metadata());

    let err = client
        .unary_echo(HelloRequest::new("unaryCall"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DataLoss);

    let mut stream = client
        .server_streaming_echo(HelloRequest::new("serverStreamingCall"))
        .await
        .unwrap();
    let err = stream.message().await.unwrap_err();
    assert_eq!(err.code(), Code::DataLoss);
    assert!(stream.received_header().is_none());
    assert!(stream.trailer().unwrap().is_empty());
}

#[tokio::test]
async fn missing_header_key_fails_the_client() {
    let (transport, incoming) = LocalTransport::new();
    // No interceptor: the header goes out empty.
    tokio::spawn(Server::new(GreeterServer::new(EchoGreeter::new())).run(incoming));
    let client = GreeterClientBuilder::new(transport)
        .unary_layer(
            ClientUnaryLayer::new().contract(MetadataContract::new().require_header(LOCATION_KEY)),
        )
        .build();

    let err = client
        .unary_echo(HelloRequest::new("unaryCall"))
        .await
        .unwrap_err();
    match err {
        Error::RequiredMetadataMissing { key, section } => {
            assert_eq!(key.as_str(), LOCATION_KEY);
            assert_eq!(section, MetadataSection::Header);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn missing_header_key_fails_a_stream_for_good() {
    let (transport, incoming) = LocalTransport::new();
    tokio::spawn(Server::new(GreeterServer::new(EchoGreeter::new())).run(incoming));
    let client = GreeterClientBuilder::new(transport)
        .stream_layer(
            ClientStreamLayer::new().contract(MetadataContract::new().require_header(LOCATION_KEY)),
        )
        .build();

    let mut stream = client
        .server_streaming_echo(HelloRequest::new("serverStreamingCall"))
        .await
        .unwrap();
    for _ in 0..2 {
        match stream.message().await {
            Err(Error::RequiredMetadataMissing { key, section }) => {
                assert_eq!(key.as_str(), LOCATION_KEY);
                assert_eq!(section, MetadataSection::Header);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    let stream = client.bidirectional_streaming_echo().await.unwrap();
    let err = driver::bidirectional(stream, names("bidi", 3))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn missing_trailer_key_is_not_end_of_stream() {
    let (transport, incoming) = LocalTransport::new();
    echo_server(incoming);
    let client = GreeterClientBuilder::new(transport)
        .stream_layer(
            ClientStreamLayer::new()
                .contract(MetadataContract::new().require_trailer("missing-key")),
        )
        .build();

    let mut stream = client
        .server_streaming_echo(HelloRequest::new("serverStreamingCall"))
        .await
        .unwrap();
    let mut received = 0;
    let err = loop {
        match stream.message().await {
            Ok(Some(_)) => received += 1,
            Ok(None) => panic!("stream ended cleanly without the required trailer key"),
            Err(err) => break err,
        }
    };
    assert_eq!(received, 10);
    assert!(matches!(
        err,
        Error::RequiredMetadataMissing { section: MetadataSection::Trailer, .. }
    ));
    assert!(matches!(
        stream.message().await,
        Err(Error::RequiredMetadataMissing { section: MetadataSection::Trailer, .. })
    ));
}

/// Counts how often the handler body runs.
#[derive(Clone, Default)]
struct Counting(Arc<AtomicUsize>);

impl Service<ServerContext, Request<RecvBody<HelloRequest>>> for Counting {
    type Response = Response<SendBody<HelloReply>>;
    type Error = Status;

    async fn call(
        &self,
        _cx: &mut ServerContext,
        _req: Request<RecvBody<HelloRequest>>,
    ) -> Result<Self::Response, Self::Error> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(Response::new(SendBody::Unary(HelloReply {
            message: FastStr::from_static_str("ran"),
        })))
    }
}

#[tokio::test]
async fn missing_metadata_never_reaches_the_handler() {
    let (transport, incoming) = LocalTransport::new();
    let counting = Counting::default();
    tokio::spawn(
        Server::new(counting.clone())
            .layer(ServerMetadataLayer::new())
            .run(incoming),
    );
    let client = echo_client(transport.without_metadata());

    let err = client
        .unary_echo(HelloRequest::new("unaryCall"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DataLoss);
    let stream = client.client_streaming_echo().await.unwrap();
    let err = driver::client_streaming(stream, names("unused", 3))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DataLoss);
    assert_eq!(counting.0.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn echo_handler_rejects_calls_without_metadata() {
    let (transport, incoming) = LocalTransport::new();
    // No interceptor in front of the handler.
    tokio::spawn(Server::new(GreeterServer::new(EchoGreeter::new())).run(incoming));
    let client = GreeterClientBuilder::new(transport.without_metadata()).build();

    let err = client
        .unary_echo(HelloRequest::new("unaryCall"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    let status = Status::from(err);
    assert_eq!(status.message(), "handler reached without incoming metadata");
}

struct FailsMidStream;

impl Service<ServerContext, Request<RecvBody<HelloRequest>>> for FailsMidStream {
    type Response = Response<SendBody<HelloReply>>;
    type Error = Status;

    async fn call(
        &self,
        _cx: &mut ServerContext,
        _req: Request<RecvBody<HelloRequest>>,
    ) -> Result<Self::Response, Self::Error> {
        let replies = futures::stream::iter([
            Ok(HelloReply {
                message: FastStr::from_static_str("a"),
            }),
            Err(Status::internal("failed after the first reply")),
        ]);
        Ok(Response::new(SendBody::Streaming(replies.boxed())))
    }
}

#[tokio::test]
async fn failure_after_a_reply_still_sends_one_trailer() {
    let (transport, incoming) = LocalTransport::new();
    tokio::spawn(
        Server::new(FailsMidStream)
            .layer(ServerMetadataLayer::new())
            .run(incoming),
    );
    let client = echo_client(transport);

    let mut stream = client
        .server_streaming_echo(HelloRequest::new("serverStreamingCall"))
        .await
        .unwrap();
    let first = stream.message().await.unwrap().unwrap();
    assert_eq!(first.message.as_str(), "a");
    let err = stream.message().await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert_eq!(values(stream.received_header().unwrap(), LOCATION_KEY), ["MTV"]);
    let trailer = stream.trailer().unwrap();
    assert_eq!(values(trailer, TIMESTAMP_KEY).len(), 1);
    assert_eq!(stream.message().await.unwrap_err().code(), Code::Internal);
}

struct Panics;

impl Service<ServerContext, Request<RecvBody<HelloRequest>>> for Panics {
    type Response = Response<SendBody<HelloReply>>;
    type Error = Status;

    async fn call(
        &self,
        _cx: &mut ServerContext,
        _req: Request<RecvBody<HelloRequest>>,
    ) -> Result<Self::Response, Self::Error> {
        panic!("handler exploded")
    }
}

#[tokio::test]
async fn panicking_handler_still_sends_the_trailer() {
    let (transport, incoming) = LocalTransport::new();
    tokio::spawn(Server::new(Panics).layer(ServerMetadataLayer::new()).run(incoming));
    let client = echo_client(transport);

    let mut stream = client
        .server_streaming_echo(HelloRequest::new("serverStreamingCall"))
        .await
        .unwrap();
    let err = stream.message().await.unwrap_err();
    assert_eq!(err.code(), Code::Internal);
    assert!(stream.trailer().unwrap().contains_key(TIMESTAMP_KEY));
}

struct Slow(Duration);

impl Service<ServerContext, Request<RecvBody<HelloRequest>>> for Slow {
    type Response = Response<SendBody<HelloReply>>;
    type Error = Status;

    async fn call(
        &self,
        _cx: &mut ServerContext,
        _req: Request<RecvBody<HelloRequest>>,
    ) -> Result<Self::Response, Self::Error> {
        tokio::time::sleep(self.0).await;
        Ok(Response::new(SendBody::Unary(HelloReply {
            message: FastStr::from_static_str("late"),
        })))
    }
}

#[tokio::test]
async fn rpc_timeout_is_deadline_exceeded() {
    let (transport, incoming) = LocalTransport::new();
    tokio::spawn(
        Server::new(Slow(Duration::from_secs(5)))
            .layer(ServerMetadataLayer::new())
            .run(incoming),
    );
    let client = GreeterClientBuilder::new(transport)
        .rpc_timeout(Duration::from_millis(50))
        .unary_layer(ClientUnaryLayer::new())
        .build();

    let err = client
        .unary_echo(HelloRequest::new("unaryCall"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);

    // A per-call option overrides the client's timeout.
    let err = client
        .unary_echo_with_callopt(
            HelloRequest::new("unaryCall"),
            CallOpt::new().with_rpc_timeout(Duration::from_millis(10)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::DeadlineExceeded);
}

#[tokio::test]
async fn bidirectional_without_interceptor_does_not_deadlock() {
    let (transport, incoming) = LocalTransport::new();
    tokio::spawn(Server::new(GreeterServer::new(EchoGreeter::new())).run(incoming));
    let client = GreeterClientBuilder::new(transport).stream_buffer(1).build();

    let stream = client.bidirectional_streaming_echo().await.unwrap();
    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        driver::bidirectional(stream, names("bidi", 10)),
    )
    .await
    .expect("bidirectional call stalled")
    .unwrap();
    assert_eq!(outcome.messages.len(), 10);
    assert!(outcome.header.is_empty());
}

struct SendsHeaderTwice;

impl Service<ServerContext, Request<RecvBody<HelloRequest>>> for SendsHeaderTwice {
    type Response = Response<SendBody<HelloReply>>;
    type Error = Status;

    async fn call(
        &self,
        cx: &mut ServerContext,
        req: Request<RecvBody<HelloRequest>>,
    ) -> Result<Self::Response, Self::Error> {
        cx.send_header(MetadataMap::from_pairs([(LOCATION_KEY, "first")]))?;
        if cx
            .send_header(MetadataMap::from_pairs([(LOCATION_KEY, "second")]))
            .is_ok()
        {
            return Err(Status::internal("header sent twice"));
        }
        let name = req.into_inner().into_unary()?.name;
        Ok(Response::new(SendBody::Unary(HelloReply { message: name })))
    }
}

#[tokio::test]
async fn header_is_sent_at_most_once() {
    let (transport, incoming) = LocalTransport::new();
    tokio::spawn(
        Server::new(SendsHeaderTwice)
            .span_provider(NoopProvider)
            .run(incoming),
    );
    let client = GreeterClientBuilder::new(transport).build();

    let resp = client
        .unary_echo(HelloRequest::new("unaryCall"))
        .await
        .unwrap();
    assert_eq!(values(resp.metadata(), LOCATION_KEY), ["first"]);
}

/// Captures the outgoing metadata the inner service recorded.
#[derive(Clone)]
struct Capture(Arc<Mutex<Option<MetadataMap>>>);

impl<S> Layer<S> for Capture {
    type Service = CaptureService<S>;

    fn layer(self, inner: S) -> Self::Service {
        CaptureService {
            inner,
            captured: self.0,
        }
    }
}

struct CaptureService<S> {
    inner: S,
    captured: Arc<Mutex<Option<MetadataMap>>>,
}

impl<S, Req, Resp> Service<ClientContext, Request<Req>> for CaptureService<S>
where
    S: Service<ClientContext, Request<Req>, Response = Resp, Error = Error> + Send + Sync,
    Req: Send,
{
    type Response = Resp;
    type Error = Error;

    async fn call(&self, cx: &mut ClientContext, req: Request<Req>) -> Result<Resp, Error> {
        let resp = self.inner.call(cx, req).await;
        *self.captured.lock() = cx.outgoing_metadata().cloned();
        resp
    }
}

#[tokio::test]
async fn outgoing_metadata_is_recorded() {
    let (transport, incoming) = LocalTransport::new();
    echo_server(incoming);
    let captured = Arc::new(Mutex::new(None));
    let client = GreeterClientBuilder::new(transport)
        .unary_layer(ClientUnaryLayer::new())
        .unary_layer(Capture(captured.clone()))
        .build();

    client
        .unary_echo_with_callopt(
            HelloRequest::new("unaryCall"),
            CallOpt::new().with_metadata("tenant", "blue"),
        )
        .await
        .unwrap();

    let outgoing = captured.lock().take().unwrap();
    assert_eq!(values(&outgoing, "tenant"), ["blue"]);
    assert_eq!(values(&outgoing, TIMESTAMP_KEY).len(), 1);
}

#[tokio::test]
async fn graceful_shutdown_drains_in_flight_calls() {
    let (transport, incoming) = LocalTransport::new();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(
        Server::new(Slow(Duration::from_millis(100)))
            .layer(ServerMetadataLayer::new())
            .run_with_shutdown(incoming, async move {
                let _ = stop_rx.await;
            }),
    );
    let client = GreeterClientBuilder::new(transport).build();

    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move { client.unary_echo(HelloRequest::new("unaryCall")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    stop_tx.send(()).unwrap();

    let resp = in_flight.await.unwrap().unwrap();
    assert_eq!(resp.get_ref().message.as_str(), "late");
    server.await.unwrap().unwrap();

    let err = client
        .unary_echo(HelloRequest::new("afterShutdown"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unavailable);
}
