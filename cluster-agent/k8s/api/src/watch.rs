use futures::prelude::*;
pub use kube::runtime::watcher::{Event, Result};
use std::pin::Pin;
use tokio::time;
use tracing::{info, Instrument};

/// Wraps a watch event stream, logging and backing off on errors.
pub struct Watch<T> {
    initialized: bool,
    span: tracing::Span,
    rx: Pin<Box<dyn Stream<Item = Result<Event<T>>> + Send + 'static>>,
}

// === impl Watch ===

impl<T, W> From<W> for Watch<T>
where
    W: Stream<Item = Result<Event<T>>> + Send + 'static,
{
    fn from(watch: W) -> Self {
        Self::new(watch.boxed())
    }
}

impl<T> Watch<T> {
    pub fn new(rx: Pin<Box<dyn Stream<Item = Result<Event<T>>> + Send + 'static>>) -> Watch<T> {
        Self {
            rx,
            initialized: false,
            span: tracing::Span::current(),
        }
    }

    pub fn instrument(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Whether at least one event has been received.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Receive the next event in the stream, or `None` if the stream ended.
    ///
    /// If the stream fails, log the error and sleep for 1s before polling for a reset event.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        loop {
            match self.rx.next().instrument(self.span.clone()).await? {
                Ok(ev) => {
                    self.initialized = true;
                    return Some(ev);
                }
                Err(error) => {
                    info!(parent: &self.span, %error, "Failed");
                    time::sleep(time::Duration::from_secs(1)).await;
                    info!(parent: &self.span, "Restarting");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn skips_errors_and_ends_with_stream() {
        let events = vec![
            Err(kube::runtime::watcher::Error::NoResourceVersion),
            Ok(Event::Apply(1u32)),
            Ok(Event::Delete(2u32)),
        ];
        let mut watch = Watch::from(stream::iter(events));
        assert!(!watch.is_initialized());

        assert!(matches!(watch.recv().await, Some(Event::Apply(1))));
        assert!(watch.is_initialized());
        assert!(matches!(watch.recv().await, Some(Event::Delete(2))));
        assert!(watch.recv().await.is_none());
    }
}
