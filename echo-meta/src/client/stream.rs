use std::fmt;

use faststr::FastStr;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::DropGuard;

use crate::{
    error::Error,
    layer::MetadataContract,
    metadata::MetadataMap,
    transport::{Cancellation, ClientCall, DeadlineGuard, Termination},
    Status,
};

/// An open call on the client: the sending half and the receiving half.
///
/// The header is received before the first response message, and the trailer becomes available
/// once [`ClientStream::message`] has returned `Ok(None)` or an error. Dropping the stream before
/// that cancels the call.
pub struct ClientStream<Req, Resp> {
    sender: RequestSender<Req>,
    receiver: ResponseReceiver<Resp>,
}

impl<Req, Resp> ClientStream<Req, Resp> {
    pub(crate) fn new(
        call: ClientCall<Req, Resp>,
        method: FastStr,
        deadline: Option<DeadlineGuard>,
    ) -> Self {
        let ClientCall {
            requests,
            header,
            messages,
            termination,
            cancellation,
        } = call;
        Self {
            sender: RequestSender {
                tx: Some(requests),
                cancellation: cancellation.clone(),
            },
            receiver: ResponseReceiver {
                method,
                header_rx: Some(header),
                header: None,
                messages,
                termination: Some(termination),
                trailer: None,
                terminal: None,
                failure: None,
                finished: false,
                guard: Some(cancellation.drop_guard()),
                cancellation,
                deadline,
                contract: None,
            },
        }
    }

    /// Checks the header and trailer of this stream against `contract`.
    pub fn with_contract(mut self, contract: MetadataContract) -> Self {
        self.receiver.contract = Some(contract);
        self
    }

    pub async fn send(&mut self, message: Req) -> Result<(), Error> {
        self.sender.send(message).await
    }

    /// Signals end-of-stream to the server.
    pub fn close_send(&mut self) {
        self.sender.close_send()
    }

    pub async fn header(&mut self) -> Result<&MetadataMap, Error> {
        self.receiver.header().await
    }

    pub async fn message(&mut self) -> Result<Option<Resp>, Error> {
        self.receiver.message().await
    }

    pub fn received_header(&self) -> Option<&MetadataMap> {
        self.receiver.received_header()
    }

    pub fn trailer(&self) -> Option<&MetadataMap> {
        self.receiver.trailer()
    }

    /// Closes the sending side and waits for the single response of a client-streaming call.
    pub async fn close_and_recv(&mut self) -> Result<Resp, Error> {
        self.close_send();
        let Some(reply) = self.message().await? else {
            return Err(Error::StreamTerminal(Status::internal(
                "stream completed without a response",
            )));
        };
        match self.message().await? {
            None => Ok(reply),
            Some(_) => Err(Error::StreamTerminal(Status::internal(
                "more than one response received",
            ))),
        }
    }

    /// Splits the stream so sending and receiving can run on different tasks.
    pub fn into_split(self) -> (RequestSender<Req>, ResponseReceiver<Resp>) {
        (self.sender, self.receiver)
    }
}

impl<Req, Resp> fmt::Debug for ClientStream<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStream")
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .finish()
    }
}

/// The sending half of a call.
pub struct RequestSender<Req> {
    tx: Option<mpsc::Sender<Req>>,
    cancellation: Cancellation,
}

impl<Req> RequestSender<Req> {
    /// Sends one request, waiting for buffer space.
    pub async fn send(&mut self, message: Req) -> Result<(), Error> {
        let Some(tx) = &self.tx else {
            return Err(Error::PeerSendFailure(Status::internal(
                "send after the request stream was closed",
            )));
        };
        tokio::select! {
            biased;
            status = self.cancellation.cancelled() => Err(Error::PeerSendFailure(status)),
            res = tx.send(message) => res.map_err(|_| {
                Error::PeerSendFailure(Status::unavailable("server closed the request stream"))
            }),
        }
    }

    /// Signals end-of-stream. Further sends fail.
    pub fn close_send(&mut self) {
        self.tx = None;
    }
}

impl<Req> fmt::Debug for RequestSender<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSender")
            .field("closed", &self.tx.is_none())
            .finish()
    }
}

/// The receiving half of a call.
pub struct ResponseReceiver<Resp> {
    method: FastStr,
    header_rx: Option<oneshot::Receiver<MetadataMap>>,
    header: Option<MetadataMap>,
    messages: mpsc::Receiver<Resp>,
    termination: Option<oneshot::Receiver<Termination>>,
    trailer: Option<MetadataMap>,
    terminal: Option<Status>,
    /// A contract violation seen on this call, reported by every later read.
    failure: Option<Error>,
    finished: bool,
    cancellation: Cancellation,
    guard: Option<DropGuard>,
    deadline: Option<DeadlineGuard>,
    contract: Option<MetadataContract>,
}

impl<Resp> ResponseReceiver<Resp> {
    /// Waits for the header.
    ///
    /// If the server failed before sending one, returns the call's terminal error. The header
    /// is checked against the stream's contract when it is received; a violation cancels the
    /// call and is returned from then on.
    pub async fn header(&mut self) -> Result<&MetadataMap, Error> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if self.header.is_none() {
            if self.finished {
                self.finish().await?;
            }
            let header = self.recv_header().await?;
            let verified = match &self.contract {
                Some(contract) => contract.verify_header(Some(&header)),
                None => Ok(()),
            };
            self.header = Some(header);
            if let Err(err) = verified {
                return Err(self.fail(err));
            }
        }
        Ok(self.header.get_or_insert_with(MetadataMap::new))
    }

    /// Fetches the next message. `Ok(None)` is end-of-stream; the trailer is available from then
    /// on.
    pub async fn message(&mut self) -> Result<Option<Resp>, Error> {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if self.finished {
            return self.finish().await.map(|()| None);
        }
        self.header().await?;
        if self.finished {
            return self.finish().await.map(|()| None);
        }

        let cancellation = self.cancellation.clone();
        let next = tokio::select! {
            biased;
            status = cancellation.cancelled() => return Err(self.abort(status)),
            message = self.messages.recv() => message,
        };
        match next {
            Some(message) => Ok(Some(message)),
            None => self.finish().await.map(|()| None),
        }
    }

    /// The header, if it has been received.
    pub fn received_header(&self) -> Option<&MetadataMap> {
        self.header.as_ref()
    }

    /// The trailer, once the call has terminated.
    pub fn trailer(&self) -> Option<&MetadataMap> {
        self.trailer.as_ref()
    }

    /// The error status the call terminated with, if any.
    pub fn status(&self) -> Option<&Status> {
        self.terminal.as_ref()
    }

    async fn recv_header(&mut self) -> Result<MetadataMap, Error> {
        let Some(rx) = self.header_rx.take() else {
            return Ok(MetadataMap::new());
        };
        let cancellation = self.cancellation.clone();
        let received = tokio::select! {
            biased;
            status = cancellation.cancelled() => return Err(self.abort(status)),
            header = rx => header.ok(),
        };
        match received {
            Some(header) => Ok(header),
            None => {
                tracing::trace!("[ECHO] {}: trailers-only response", self.method);
                self.finish().await?;
                Ok(MetadataMap::new())
            }
        }
    }

    async fn finish(&mut self) -> Result<(), Error> {
        if !self.finished {
            let termination = match self.termination.take() {
                Some(mut rx) => {
                    let cancellation = self.cancellation.clone();
                    tokio::select! {
                        biased;
                        t = &mut rx => t.unwrap_or_else(|_| {
                            let status = Status::unavailable("call ended without a terminal frame");
                            Termination {
                                status: Some(status),
                                trailer: MetadataMap::new(),
                            }
                        }),
                        status = cancellation.cancelled() => {
                            self.termination = Some(rx);
                            return Err(self.abort(status));
                        }
                    }
                }
                None => Termination::default(),
            };
            self.complete(termination.status, Some(termination.trailer));

            if self.terminal.is_none() {
                if let Some(contract) = &self.contract {
                    let verified = contract
                        .verify_header(self.header.as_ref())
                        .and_then(|()| contract.verify_trailer(self.trailer.as_ref()));
                    if let Err(err) = verified {
                        return Err(self.fail(err));
                    }
                }
            }
        }

        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        match &self.terminal {
            Some(status) => Err(Error::StreamTerminal(status.clone())),
            None => Ok(()),
        }
    }

    fn complete(&mut self, status: Option<Status>, trailer: Option<MetadataMap>) {
        self.finished = true;
        self.terminal = status;
        self.trailer = trailer;
        if let Some(guard) = self.guard.take() {
            guard.disarm();
        }
        self.deadline = None;
        match &self.terminal {
            Some(status) => tracing::debug!("[ECHO] {} terminated: {status}", self.method),
            None => tracing::trace!("[ECHO] {} completed", self.method),
        }
    }

    /// Records a contract violation. A call still in flight is cancelled with it.
    fn fail(&mut self, err: Error) -> Error {
        if !self.finished {
            let status = Status::from(err.clone());
            self.cancellation.cancel(status.clone());
            self.abort(status);
        }
        tracing::debug!("[ECHO] {}: {err}", self.method);
        self.failure = Some(err.clone());
        err
    }

    /// Ends the call locally after a cancellation, keeping the trailer if it already arrived.
    fn abort(&mut self, status: Status) -> Error {
        let trailer = self
            .termination
            .take()
            .and_then(|mut rx| rx.try_recv().ok())
            .map(|t| t.trailer);
        self.complete(Some(status.clone()), trailer);
        Error::StreamTerminal(status)
    }
}

impl<Resp> fmt::Debug for ResponseReceiver<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseReceiver")
            .field("method", &self.method)
            .field("header", &self.header)
            .field("trailer", &self.trailer)
            .field("terminal", &self.terminal)
            .field("failure", &self.failure)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
