//! Idle read watchdog for exchange WebSocket streams.
//!
//! Exchanges occasionally stop sending frames without closing the socket. [`IdleTimeout`]
//! ends the wrapped stream once nothing has been received for the configured period so the
//! connection task reconnects.

use futures::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::{Instant, Sleep};
use tracing::warn;

/// Default read timeout for exchange WebSocket streams (2 minutes).
pub const DEFAULT_WS_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Stream wrapper that terminates when the inner stream is idle for longer than `timeout`.
#[derive(Debug)]
pub struct IdleTimeout<S> {
    inner: S,
    timeout: Duration,
    deadline: Pin<Box<Sleep>>,
    timed_out: bool,
}

impl<S> IdleTimeout<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            deadline: Box::pin(tokio::time::sleep(timeout)),
            timed_out: false,
        }
    }

    /// True if the stream ended because the idle deadline elapsed.
    pub fn timed_out(&self) -> bool {
        self.timed_out
    }
}

impl<S> Stream for IdleTimeout<S>
where
    S: Stream + Unpin,
{
    type Item = S::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.timed_out {
            return Poll::Ready(None);
        }

        let timeout = self.timeout;

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(item)) => {
                self.deadline.as_mut().reset(Instant::now() + timeout);
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match self.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    warn!(
                        timeout_secs = timeout.as_secs(),
                        "WebSocket read timeout - no data received, triggering reconnection"
                    );
                    self.timed_out = true;
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::sync::mpsc;
    use tokio_stream::wrappers::ReceiverStream;

    #[tokio::test]
    async fn test_idle_stream_times_out() {
        let (_tx, rx) = mpsc::channel::<u8>(1);
        let mut stream = IdleTimeout::new(ReceiverStream::new(rx), Duration::from_millis(20));

        assert_eq!(stream.next().await, None);
        assert!(stream.timed_out());
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_active_stream_resets_deadline() {
        let (tx, rx) = mpsc::channel::<u8>(4);
        let mut stream = IdleTimeout::new(ReceiverStream::new(rx), Duration::from_millis(200));

        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));

        drop(tx);
        assert_eq!(stream.next().await, None);
        assert!(!stream.timed_out());
    }
}
