//! The contract a transport has to honor for one call.
//!
//! A call is a pair of halves connected by channels:
//!
//! - request messages flow client to server over a bounded channel; dropping the client's sender
//!   is end-of-stream,
//! - the header is a one-shot sent before the first response message,
//! - response messages flow server to client over a bounded channel,
//! - the terminal frame (status plus trailer) is a one-shot, sent exactly once after the response
//!   channel has been closed.
//!
//! Both halves share a [`Cancellation`] that unblocks every pending send and receive.

mod local;

use std::{future::Future, sync::Arc, time::Duration};

use faststr::FastStr;
use parking_lot::Mutex;
use tokio::{sync::mpsc, sync::oneshot, task::JoinHandle};
use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFutureOwned};

pub use self::local::{Incoming, LocalTransport};
use crate::{context::CallShape, metadata::MetadataMap, Status};

/// Opens calls towards a server.
pub trait Transport: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    fn open(
        &self,
        head: CallHead,
    ) -> impl Future<Output = Result<ClientCall<Self::Request, Self::Response>, Status>> + Send;
}

/// Everything a transport needs to know to open a call.
#[derive(Debug)]
pub struct CallHead {
    pub method: FastStr,
    pub shape: CallShape,
    pub metadata: MetadataMap,
    pub buffer: usize,
    pub cancellation: Cancellation,
}

/// The last frame of every call.
#[derive(Debug, Default)]
pub struct Termination {
    /// `None` means the call completed successfully.
    pub status: Option<Status>,
    pub trailer: MetadataMap,
}

/// The client's half of a call.
#[derive(Debug)]
pub struct ClientCall<Req, Resp> {
    pub requests: mpsc::Sender<Req>,
    pub header: oneshot::Receiver<MetadataMap>,
    pub messages: mpsc::Receiver<Resp>,
    pub termination: oneshot::Receiver<Termination>,
    pub cancellation: Cancellation,
}

/// The server's half of a call.
#[derive(Debug)]
pub struct ServerCall<Req, Resp> {
    pub method: FastStr,
    pub shape: CallShape,
    /// `None` if the transport could not produce a metadata container.
    pub metadata: Option<MetadataMap>,
    pub requests: mpsc::Receiver<Req>,
    pub header: oneshot::Sender<MetadataMap>,
    pub messages: mpsc::Sender<Resp>,
    pub termination: oneshot::Sender<Termination>,
    pub cancellation: Cancellation,
}

/// Creates both halves of one call.
pub fn pair<Req, Resp>(
    method: FastStr,
    shape: CallShape,
    metadata: Option<MetadataMap>,
    buffer: usize,
    cancellation: Cancellation,
) -> (ClientCall<Req, Resp>, ServerCall<Req, Resp>) {
    let buffer = buffer.max(1);
    let (req_tx, req_rx) = mpsc::channel(buffer);
    let (header_tx, header_rx) = oneshot::channel();
    let (msg_tx, msg_rx) = mpsc::channel(buffer);
    let (term_tx, term_rx) = oneshot::channel();

    let client = ClientCall {
        requests: req_tx,
        header: header_rx,
        messages: msg_rx,
        termination: term_rx,
        cancellation: cancellation.clone(),
    };
    let server = ServerCall {
        method,
        shape,
        metadata,
        requests: req_rx,
        header: header_tx,
        messages: msg_tx,
        termination: term_tx,
        cancellation,
    };
    (client, server)
}

/// Cancellation shared by both halves of a call.
///
/// The first reason given wins; later calls to [`Cancellation::cancel`] only make sure the token
/// is cancelled.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    token: CancellationToken,
    reason: Arc<Mutex<Option<Status>>>,
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, status: Status) {
        {
            let mut reason = self.reason.lock();
            if reason.is_none() {
                *reason = Some(status);
            }
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the call is cancelled, with the reason.
    pub async fn cancelled(&self) -> Status {
        self.token.cancelled().await;
        self.status()
    }

    /// The cancellation reason. A call cancelled without one (e.g. by dropping the client's
    /// receiving half) reports `Cancelled`.
    pub fn status(&self) -> Status {
        self.reason
            .lock()
            .clone()
            .unwrap_or_else(|| Status::cancelled("call cancelled by the client"))
    }

    /// Cancels the call with `DeadlineExceeded` once `timeout` elapses, unless the returned guard
    /// is dropped first.
    pub fn cancel_after(&self, timeout: Duration) -> DeadlineGuard {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    this.cancel(Status::deadline_exceeded(format!(
                        "deadline of {}ms exceeded",
                        timeout.as_millis()
                    )));
                }
                _ = this.token.cancelled() => {}
            }
        });
        DeadlineGuard(handle)
    }

    /// A guard that cancels the call when dropped, unless disarmed.
    pub(crate) fn drop_guard(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    pub(crate) fn cancelled_owned(&self) -> WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }
}

/// Aborts the deadline timer of a call when dropped.
#[derive(Debug)]
pub struct DeadlineGuard(JoinHandle<()>);

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    #[tokio::test]
    async fn first_reason_wins() {
        let c = Cancellation::new();
        assert!(!c.is_cancelled());
        c.cancel(Status::deadline_exceeded("late"));
        c.cancel(Status::cancelled("bye"));
        assert_eq!(c.cancelled().await.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn deadline_fires() {
        let c = Cancellation::new();
        let _guard = c.cancel_after(Duration::from_millis(10));
        assert_eq!(c.cancelled().await.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn dropped_deadline_guard_never_fires() {
        let c = Cancellation::new();
        drop(c.cancel_after(Duration::from_millis(5)));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!c.is_cancelled());
    }

    #[tokio::test]
    async fn drop_guard_cancels_without_reason() {
        let c = Cancellation::new();
        drop(c.drop_guard());
        assert_eq!(c.cancelled().await.code(), Code::Cancelled);
    }

    #[tokio::test]
    async fn pair_wires_both_halves() {
        let (client, mut server) = pair::<u8, u8>(
            FastStr::from_static_str("/m"),
            CallShape::Unary,
            Some(MetadataMap::new()),
            0,
            Cancellation::new(),
        );
        client.requests.send(1).await.unwrap();
        assert_eq!(server.requests.recv().await, Some(1));
        drop(client);
        assert!(server.messages.send(2).await.is_err());
    }
}
