//! Sequencing of sends and receives for the streaming call shapes.
//!
//! On the client, a call that pushes requests runs its producer on a spawned task while the
//! consumer drains responses on the caller's task, so a full buffer on one side never blocks the
//! other. The header is fetched by the consumer and checked concurrently with the producer's
//! first send; the producer never waits for it.

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::{
    client::{ClientStream, ResponseReceiver},
    context::{CallPhase, CallShape, ResponseHead},
    error::Error,
    message::SendBody,
    metadata::MetadataMap,
    Status,
};

/// Everything a drained stream produced.
#[derive(Debug, Clone)]
pub struct StreamOutcome<T> {
    pub messages: Vec<T>,
    pub header: MetadataMap,
    pub trailer: MetadataMap,
}

/// Drains a server-streaming call whose request was sent when the stream was opened.
pub async fn server_streaming<Req, Resp>(
    stream: ClientStream<Req, Resp>,
) -> Result<StreamOutcome<Resp>, Error>
where
    Req: Send + 'static,
{
    drive(CallShape::ServerStreaming, stream, futures::stream::empty()).await
}

/// Sends every request of `requests`, then closes the request stream and waits for the single
/// response.
pub async fn client_streaming<Req, Resp, S>(
    stream: ClientStream<Req, Resp>,
    requests: S,
) -> Result<StreamOutcome<Resp>, Error>
where
    Req: Send + 'static,
    S: Stream<Item = Req> + Send + 'static,
{
    drive(CallShape::ClientStreaming, stream, requests).await
}

/// Sends every request of `requests` while collecting the responses as they arrive.
pub async fn bidirectional<Req, Resp, S>(
    stream: ClientStream<Req, Resp>,
    requests: S,
) -> Result<StreamOutcome<Resp>, Error>
where
    Req: Send + 'static,
    S: Stream<Item = Req> + Send + 'static,
{
    drive(CallShape::Bidirectional, stream, requests).await
}

async fn drive<Req, Resp, S>(
    shape: CallShape,
    stream: ClientStream<Req, Resp>,
    requests: S,
) -> Result<StreamOutcome<Resp>, Error>
where
    Req: Send + 'static,
    S: Stream<Item = Req> + Send + 'static,
{
    let (mut sender, mut receiver) = stream.into_split();

    if !shape.client_push() {
        sender.close_send();
        return consume(shape, &mut receiver).await;
    }

    let producer = tokio::spawn(async move {
        futures::pin_mut!(requests);
        let mut sent = 0usize;
        while let Some(request) = requests.next().await {
            sender.send(request).await?;
            sent += 1;
        }
        sender.close_send();
        tracing::trace!("[ECHO] producer done after {sent} requests");
        Ok::<_, Error>(())
    });

    // The consumer's error explains the producer's, so it wins.
    let outcome = match consume(shape, &mut receiver).await {
        Ok(outcome) => outcome,
        Err(err) => {
            producer.abort();
            return Err(err);
        }
    };
    producer.await.map_err(|e| Error::Status(e.into()))??;
    Ok(outcome)
}

async fn consume<Resp>(
    shape: CallShape,
    receiver: &mut ResponseReceiver<Resp>,
) -> Result<StreamOutcome<Resp>, Error> {
    let header = receiver.header().await?.clone();
    let mut messages = Vec::new();
    while let Some(message) = receiver.message().await? {
        messages.push(message);
    }
    if !shape.server_push() && messages.len() != 1 {
        return Err(Error::StreamTerminal(Status::internal(format!(
            "expected one response, received {}",
            messages.len()
        ))));
    }
    Ok(StreamOutcome {
        messages,
        header,
        trailer: receiver.trailer().cloned().unwrap_or_default(),
    })
}

/// Writes a handler's response body to the wire, sending a pending header before the first
/// message.
pub(crate) async fn push_responses<T>(
    head: &ResponseHead,
    body: SendBody<T>,
    messages: &mpsc::Sender<T>,
) -> Result<(), Status> {
    match body {
        SendBody::Unary(message) => push(head, messages, message).await,
        SendBody::Streaming(mut stream) => {
            while let Some(message) = stream.next().await {
                push(head, messages, message?).await?;
            }
            Ok(())
        }
    }
}

async fn push<T>(
    head: &ResponseHead,
    messages: &mpsc::Sender<T>,
    message: T,
) -> Result<(), Status> {
    if head.phase() != CallPhase::Exchanging {
        head.start_exchange();
    }
    messages
        .send(message)
        .await
        .map_err(|_| Status::cancelled("client stopped receiving responses"))
}
