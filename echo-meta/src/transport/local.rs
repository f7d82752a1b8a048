use std::fmt;

use tokio::sync::mpsc;
use tracing::trace;

use super::{pair, CallHead, ClientCall, ServerCall, Transport};
use crate::Status;

const DEFAULT_BACKLOG: usize = 128;

/// An in-process transport: every opened call is handed to the matching [`Incoming`] as a
/// [`ServerCall`].
pub struct LocalTransport<Req, Resp> {
    tx: mpsc::Sender<ServerCall<Req, Resp>>,
    strip_metadata: bool,
}

impl<Req, Resp> Clone for LocalTransport<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            strip_metadata: self.strip_metadata,
        }
    }
}

impl<Req, Resp> fmt::Debug for LocalTransport<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransport")
            .field("strip_metadata", &self.strip_metadata)
            .finish()
    }
}

impl<Req, Resp> LocalTransport<Req, Resp> {
    /// Creates a transport and the server-side stream of calls opened through it.
    pub fn new() -> (Self, Incoming<Req, Resp>) {
        Self::with_backlog(DEFAULT_BACKLOG)
    }

    /// Like [`LocalTransport::new`], with at most `backlog` calls waiting to be accepted.
    pub fn with_backlog(backlog: usize) -> (Self, Incoming<Req, Resp>) {
        let (tx, rx) = mpsc::channel(backlog.max(1));
        (
            Self {
                tx,
                strip_metadata: false,
            },
            Incoming { rx },
        )
    }

    /// Delivers calls to the server without any metadata container, as a transport that failed
    /// to read the request headers would.
    pub fn without_metadata(mut self) -> Self {
        self.strip_metadata = true;
        self
    }
}

impl<Req, Resp> Transport for LocalTransport<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Request = Req;
    type Response = Resp;

    async fn open(&self, head: CallHead) -> Result<ClientCall<Req, Resp>, Status> {
        let CallHead {
            method,
            shape,
            metadata,
            buffer,
            cancellation,
        } = head;
        let metadata = (!self.strip_metadata).then_some(metadata);
        trace!("[ECHO] local transport opening call {method}");

        let (client, server) = pair(method, shape, metadata, buffer, cancellation);
        self.tx
            .send(server)
            .await
            .map_err(|_| Status::unavailable("server is not accepting calls"))?;
        Ok(client)
    }
}

/// The server side of a [`LocalTransport`].
pub struct Incoming<Req, Resp> {
    rx: mpsc::Receiver<ServerCall<Req, Resp>>,
}

impl<Req, Resp> fmt::Debug for Incoming<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Incoming").finish_non_exhaustive()
    }
}

impl<Req, Resp> Incoming<Req, Resp> {
    /// Waits for the next call. Returns `None` once every transport handle is gone.
    pub async fn accept(&mut self) -> Option<ServerCall<Req, Resp>> {
        self.rx.recv().await
    }

    /// Stops accepting new calls; calls already queued can still be accepted.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use faststr::FastStr;

    use super::*;
    use crate::{context::CallShape, metadata::MetadataMap, transport::Cancellation, Code};

    fn head(metadata: MetadataMap) -> CallHead {
        CallHead {
            method: FastStr::from_static_str("/helloworld.Greeter/UnaryEcho"),
            shape: CallShape::Unary,
            metadata,
            buffer: 4,
            cancellation: Cancellation::new(),
        }
    }

    #[tokio::test]
    async fn delivers_metadata_to_the_server() {
        let (transport, mut incoming) = LocalTransport::<u8, u8>::new();
        let _client = transport
            .open(head(MetadataMap::from_pairs([("timestamp", "t")])))
            .await
            .unwrap();

        let call = incoming.accept().await.unwrap();
        assert_eq!(call.shape, CallShape::Unary);
        assert!(call.metadata.unwrap().contains_key("timestamp"));
    }

    #[tokio::test]
    async fn can_withhold_metadata() {
        let (transport, mut incoming) = LocalTransport::<u8, u8>::new();
        let transport = transport.without_metadata();
        let _client = transport.open(head(MetadataMap::new())).await.unwrap();
        assert!(incoming.accept().await.unwrap().metadata.is_none());
    }

    #[tokio::test]
    async fn closed_incoming_is_unavailable() {
        let (transport, incoming) = LocalTransport::<u8, u8>::new();
        drop(incoming);
        let err = transport.open(head(MetadataMap::new())).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
    }
}
