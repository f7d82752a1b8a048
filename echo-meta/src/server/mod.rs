//! The server runtime.
//!
//! [`Server`] accepts calls from an [`Incoming`] and serves each one on its own task. Every call
//! ends with exactly one terminal frame, whether the service succeeded, failed, panicked or the
//! call was cancelled.

mod streaming;

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use futures::{Future, FutureExt};
use motore::{
    layer::{Identity, Layer, Stack},
    service::Service,
};
use tracing::Instrument;

pub use self::streaming::Streaming;
use crate::{
    context::{ResponseHead, Role, RpcInfo, ServerContext},
    driver,
    message::{RecvBody, SendBody},
    tracing::{DefaultProvider, SpanProvider},
    transport::{Incoming, ServerCall, Termination},
    BoxError, Request, Response, Status,
};

/// A server for one service.
#[derive(Clone)]
pub struct Server<S, L, SP = DefaultProvider> {
    service: S,
    layer: L,
    span_provider: SP,
}

impl<S> Server<S, Identity, DefaultProvider> {
    /// Creates a new [`Server`].
    pub fn new(service: S) -> Self {
        Self {
            service,
            layer: Identity::new(),
            span_provider: DefaultProvider,
        }
    }
}

impl<S, L, SP> Server<S, L, SP> {
    /// Adds a new inner layer to the server.
    ///
    /// # Order
    ///
    /// Assume we already have two layers: foo and bar. We want to add a new layer baz.
    ///
    /// The current order is: foo -> bar (the request will come to foo first, and then bar).
    ///
    /// After we call `.layer(baz)`, we will get: foo -> bar -> baz.
    pub fn layer<Inner>(self, layer: Inner) -> Server<S, Stack<Inner, L>, SP> {
        Server {
            service: self.service,
            layer: Stack::new(layer, self.layer),
            span_provider: self.span_provider,
        }
    }

    /// Adds a new front layer to the server.
    ///
    /// After we call `.layer_front(baz)` on foo -> bar, we will get: baz -> foo -> bar.
    pub fn layer_front<Front>(self, layer: Front) -> Server<S, Stack<L, Front>, SP> {
        Server {
            service: self.service,
            layer: Stack::new(self.layer, layer),
            span_provider: self.span_provider,
        }
    }

    pub fn span_provider<P: SpanProvider>(self, span_provider: P) -> Server<S, L, P> {
        Server {
            service: self.service,
            layer: self.layer,
            span_provider,
        }
    }

    /// The main entry point for the server. Runs until every transport handle is gone.
    pub async fn run<Req, Resp>(self, incoming: Incoming<Req, Resp>) -> Result<(), BoxError>
    where
        L: Layer<S>,
        L::Service: Service<
                ServerContext,
                Request<RecvBody<Req>>,
                Response = Response<SendBody<Resp>>,
            > + Send
            + Sync
            + 'static,
        <L::Service as Service<ServerContext, Request<RecvBody<Req>>>>::Error: Into<Status> + Send,
        SP: SpanProvider,
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        self.run_with_shutdown(incoming, futures::future::pending()).await
    }

    /// Runs server with a stop signal to control graceful shutdown.
    ///
    /// Once `signal` resolves no new calls are accepted, and the server returns after the calls
    /// in flight have completed.
    pub async fn run_with_shutdown<Req, Resp, F>(
        self,
        mut incoming: Incoming<Req, Resp>,
        signal: F,
    ) -> Result<(), BoxError>
    where
        L: Layer<S>,
        L::Service: Service<
                ServerContext,
                Request<RecvBody<Req>>,
                Response = Response<SendBody<Resp>>,
            > + Send
            + Sync
            + 'static,
        <L::Service as Service<ServerContext, Request<RecvBody<Req>>>>::Error: Into<Status> + Send,
        SP: SpanProvider,
        Req: Send + 'static,
        Resp: Send + 'static,
        F: Future<Output = ()>,
    {
        tracing::info!("[ECHO] server start");
        let service = Arc::new(self.layer.layer(self.service));

        tokio::pin!(signal);
        let (tx, rx) = tokio::sync::watch::channel(());

        loop {
            tokio::select! {
                _ = &mut signal => {
                    incoming.close();
                    // Calls already handed over are still served.
                    while let Some(call) = incoming.accept().await {
                        spawn_call(service.clone(), call, self.span_provider.clone(), rx.clone());
                    }
                    drop(rx);
                    tracing::info!("[ECHO] graceful shutdown");
                    let _ = tx.send(());
                    // Waits for in-flight calls to drop their receivers.
                    tx.closed().await;
                    return Ok(());
                },
                call = incoming.accept() => {
                    let Some(call) = call else {
                        drop(rx);
                        tx.closed().await;
                        return Ok(());
                    };
                    spawn_call(service.clone(), call, self.span_provider.clone(), rx.clone());
                },
            }
        }
    }
}

fn spawn_call<S, Req, Resp, SP>(
    service: Arc<S>,
    call: ServerCall<Req, Resp>,
    span_provider: SP,
    watch: tokio::sync::watch::Receiver<()>,
) where
    S: Service<ServerContext, Request<RecvBody<Req>>, Response = Response<SendBody<Resp>>>
        + Send
        + Sync
        + 'static,
    S::Error: Into<Status> + Send,
    SP: SpanProvider,
    Req: Send + 'static,
    Resp: Send + 'static,
{
    tracing::trace!("[ECHO] recv a call: {}", call.method);
    tokio::spawn(async move {
        serve_call(&*service, call, &span_provider).await;
        drop(watch);
    });
}

/// Serves one call to completion and sends its terminal frame.
pub(crate) async fn serve_call<S, Req, Resp, SP>(
    service: &S,
    call: ServerCall<Req, Resp>,
    span_provider: &SP,
) where
    S: Service<ServerContext, Request<RecvBody<Req>>, Response = Response<SendBody<Resp>>>,
    S::Error: Into<Status>,
    SP: SpanProvider,
{
    let ServerCall {
        method,
        shape,
        metadata,
        requests,
        header,
        messages,
        termination,
        cancellation,
    } = call;

    let mut cx = ServerContext::new(
        RpcInfo::new(Role::Server, method, shape),
        metadata,
        ResponseHead::new(header),
        cancellation.clone(),
    );
    cx.stats.record_process_start_at();
    let span = span_provider.on_serve(&cx);
    let head = cx.response_head().clone();
    let trailer = cx.trailer_slot().clone();

    let result = async {
        let mut requests = Streaming::new(requests, cancellation.clone());
        let body = if shape.client_push() {
            RecvBody::Streaming(requests)
        } else {
            match requests.message().await? {
                Some(message) => RecvBody::Unary(message),
                None => return Err(Status::internal("missing request message")),
            }
        };
        let req = Request::from_parts(cx.incoming_metadata().cloned().unwrap_or_default(), body);

        let served = async {
            let resp = service.call(&mut cx, req).await.map_err(Into::into)?;
            let (metadata, trailers, body) = resp.into_parts();
            if !metadata.is_empty() {
                if let Err(status) = head.set_header(metadata) {
                    tracing::warn!("[ECHO] dropping response metadata: {}", status.message());
                }
            }
            trailer.merge(trailers);
            driver::push_responses(&head, body, &messages).await
        };

        tokio::select! {
            biased;
            status = cancellation.cancelled() => Err(status),
            res = AssertUnwindSafe(served).catch_unwind() => {
                res.unwrap_or_else(|payload| Err(panic_status(payload)))
            }
        }
    }
    .instrument(span)
    .await;

    head.complete(result.is_ok());
    drop(messages);
    cx.stats.record_process_end_at();

    match &result {
        Ok(()) => tracing::debug!("[ECHO] {} completed", cx.rpc_info().method()),
        Err(status) => tracing::debug!(
            "[ECHO] {} failed: {}",
            cx.rpc_info().method(),
            status
        ),
    }

    let frame = Termination {
        status: result.err(),
        trailer: trailer.take(),
    };
    if termination.send(frame).is_err() {
        tracing::trace!("[ECHO] client went away before the terminal frame");
    }
    span_provider.leave_serve(&cx);
}

fn panic_status(payload: Box<dyn Any + Send>) -> Status {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    tracing::error!("[ECHO] handler panicked: {message}");
    Status::internal(format!("handler panicked: {message}"))
}
