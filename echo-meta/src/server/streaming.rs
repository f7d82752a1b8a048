use std::{
    fmt,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{Future, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::WaitForCancellationFutureOwned;

use crate::{transport::Cancellation, Status};

/// The incoming request messages of a call.
///
/// Yields `Ok` items in receipt order and ends with `None` once the client closes its side. If
/// the call is cancelled, the next poll yields the cancellation status and the stream ends.
pub struct Streaming<T> {
    rx: mpsc::Receiver<T>,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    cancellation: Cancellation,
    done: bool,
}

impl<T> Streaming<T> {
    pub(crate) fn new(rx: mpsc::Receiver<T>, cancellation: Cancellation) -> Self {
        Self {
            rx,
            cancelled: Box::pin(cancellation.cancelled_owned()),
            cancellation,
            done: false,
        }
    }

    /// Fetch the next message. `Ok(None)` is end-of-stream.
    pub async fn message(&mut self) -> Result<Option<T>, Status> {
        self.next().await.transpose()
    }
}

impl<T> Stream for Streaming<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.cancelled.as_mut().poll(cx).is_ready() {
            this.done = true;
            return Poll::Ready(Some(Err(this.cancellation.status())));
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(message)) => Poll::Ready(Some(Ok(message))),
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> fmt::Debug for Streaming<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Streaming")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    #[tokio::test]
    async fn yields_in_order_then_ends() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = Streaming::new(rx, Cancellation::new());
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        drop(tx);

        assert_eq!(stream.message().await.unwrap(), Some(1));
        assert_eq!(stream.message().await.unwrap(), Some(2));
        assert_eq!(stream.message().await.unwrap(), None);
        assert_eq!(stream.message().await.unwrap(), None);
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_pending_receive() {
        let (_tx, rx) = mpsc::channel::<u8>(4);
        let cancellation = Cancellation::new();
        let mut stream = Streaming::new(rx, cancellation.clone());

        let waiter = tokio::spawn(async move { stream.message().await });
        cancellation.cancel(Status::deadline_exceeded("late"));

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }
}
