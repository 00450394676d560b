// Ordered request-end cleanup.
// Closers registered here run after the response writer was closed, so a
// resource handed over by a finished source can never truncate queued output.
use crate::sse::SseWriter;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;

type Closer = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Default)]
pub struct Teardown {
    closers: Vec<(String, Closer)>,
}

impl Teardown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `closer`; closers run in registration order.
    pub fn defer<F, Fut>(&mut self, name: impl Into<String>, closer: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.closers
            .push((name.into(), Box::new(move || closer().boxed())));
    }

    pub fn len(&self) -> usize {
        self.closers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.closers.is_empty()
    }

    pub async fn run(self) {
        for (name, closer) in self.closers {
            tracing::debug!(closer = %name, "running deferred cleanup");
            closer().await;
        }
    }

    /// Close `writer` (flushing what it still buffers), then run every closer.
    pub async fn run_after_close(self, writer: &SseWriter) {
        writer.close();
        self.run().await;
    }
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.closers.iter().map(|(name, _)| name))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sse::{self, SseMessage};
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[tokio::test]
    async fn closers_run_in_order_after_writer_close() {
        let (writer, _body) = sse::channel();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut teardown = Teardown::new();
        for name in ["first", "second"] {
            let log = Arc::clone(&log);
            let writer = writer.clone();
            teardown.defer(name, move || async move {
                log.lock().push((name, writer.is_closed()));
            });
        }
        assert_eq!(teardown.len(), 2);
        writer.write(&SseMessage::json(1)).expect("write");
        teardown.run_after_close(&writer).await;
        assert_eq!(*log.lock(), vec![("first", true), ("second", true)]);
        assert_eq!(writer.frames_flushed(), 1);
    }
}
