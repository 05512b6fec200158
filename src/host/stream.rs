//! Pull-based consumer for provider chat streams.

use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::protocol::StreamEvent;

/// Events for one chat request, in emission order, ending with exactly
/// one terminal event. If the producer goes away without sending a
/// terminal, a `Done` is synthesized so consumers never hang on a
/// half-finished stream.
pub struct EventStream {
    rx: mpsc::Receiver<StreamEvent>,
    terminated: bool,
}

impl EventStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self {
            rx,
            terminated: false,
        }
    }

    /// Next event, or `None` once a terminal event has been yielded.
    pub async fn next(&mut self) -> Option<StreamEvent> {
        if self.terminated {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => {
                if event.is_terminal() {
                    self.terminated = true;
                }
                Some(event)
            }
            None => {
                self.terminated = true;
                Some(StreamEvent::Done)
            }
        }
    }

    /// Drain the stream, concatenating content text. Returns the text
    /// and the error message if the stream ended with one.
    pub async fn collect_content(mut self) -> (String, Option<String>) {
        let mut text = String::new();
        let mut error = None;
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Content { text: chunk } => text.push_str(&chunk),
                StreamEvent::Error { message } => error = Some(message),
                _ => {}
            }
        }
        (text, error)
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        if self.terminated {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    self.terminated = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                self.terminated = true;
                Poll::Ready(Some(StreamEvent::Done))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_yields_until_terminal() {
        let (tx, rx) = mpsc::channel(8);
        let mut stream = EventStream::new(rx);

        tx.send(StreamEvent::Content { text: "a".into() })
            .await
            .unwrap();
        tx.send(StreamEvent::Done).await.unwrap();
        tx.send(StreamEvent::Content { text: "late".into() })
            .await
            .unwrap();

        assert_eq!(
            stream.next().await,
            Some(StreamEvent::Content { text: "a".into() })
        );
        assert_eq!(stream.next().await, Some(StreamEvent::Done));
        // Nothing after a terminal, even with events still queued.
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_synthesizes_done_on_producer_drop() {
        let (tx, rx) = mpsc::channel(8);
        let mut stream = EventStream::new(rx);

        tx.send(StreamEvent::Content { text: "a".into() })
            .await
            .unwrap();
        drop(tx);

        assert_eq!(
            stream.next().await,
            Some(StreamEvent::Content { text: "a".into() })
        );
        assert_eq!(stream.next().await, Some(StreamEvent::Done));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn test_collect_content() {
        let (tx, rx) = mpsc::channel(8);
        let stream = EventStream::new(rx);

        tx.send(StreamEvent::Content { text: "hel".into() })
            .await
            .unwrap();
        tx.send(StreamEvent::Content { text: "lo".into() })
            .await
            .unwrap();
        tx.send(StreamEvent::Done).await.unwrap();

        let (text, error) = stream.collect_content().await;
        assert_eq!(text, "hello");
        assert!(error.is_none());
    }
}
