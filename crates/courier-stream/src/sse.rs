//! Server-sent events framing and the buffered response writer.
//!
//! # Purpose
//! Render [`SseMessage`] records (`data: <json>\n\n`, comment heartbeats, or
//! preformatted passthrough) and move them to the HTTP body through an
//! explicit buffer/flush pair.
//!
//! # Notes
//! The body half is an unbounded channel. When the HTTP layer drops it (client
//! went away), the next flush fails with [`StreamError::ClientGone`]; that
//! failed write is the disconnect signal, not any abort flag.
use crate::{Result, StreamError};
use bytes::{Bytes, BytesMut};
use futures::Stream;
use parking_lot::Mutex;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Streaming-friendly response headers: no caching, no proxy buffering, no compression.
pub const RESPONSE_HEADERS: [(&str, &str); 4] = [
    ("content-type", "text/event-stream"),
    ("cache-control", "no-cache"),
    ("x-accel-buffering", "no"),
    ("content-encoding", "identity"),
];

pub const HEARTBEAT: &str = ": heartbeat\n\n";

#[derive(Debug, Clone, PartialEq)]
pub enum SseMessage {
    Json(Value),
    /// Already wire-ready text, written verbatim.
    Preformatted(String),
}

impl SseMessage {
    pub fn json(value: impl Into<Value>) -> Self {
        SseMessage::Json(value.into())
    }

    pub fn heartbeat() -> Self {
        SseMessage::Preformatted(HEARTBEAT.to_string())
    }

    pub fn render(&self) -> String {
        match self {
            // Compact JSON escapes newlines, so one record is always one data line.
            SseMessage::Json(value) => format!("data: {value}\n\n"),
            SseMessage::Preformatted(text) => text.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Pending {
    bytes: BytesMut,
    frames: u64,
}

#[derive(Debug)]
struct WriterInner {
    pending: Mutex<Pending>,
    // `None` once the writer was closed.
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    flushed_frames: Mutex<u64>,
}

/// Writing half of one SSE response. Clones share the same buffer.
#[derive(Debug, Clone)]
pub struct SseWriter {
    inner: Arc<WriterInner>,
}

/// Reading half, handed to the HTTP layer as the response body.
#[derive(Debug)]
pub struct SseBody {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

/// Create a connected writer/body pair.
pub fn channel() -> (SseWriter, SseBody) {
    let (tx, rx) = mpsc::unbounded_channel();
    let writer = SseWriter {
        inner: Arc::new(WriterInner {
            pending: Mutex::new(Pending::default()),
            tx: Mutex::new(Some(tx)),
            flushed_frames: Mutex::new(0),
        }),
    };
    (writer, SseBody { rx })
}

impl SseWriter {
    /// Buffer a record; nothing reaches the client until [`SseWriter::flush`].
    pub fn write(&self, message: &SseMessage) -> Result<()> {
        self.ensure_writable()?;
        let mut pending = self.inner.pending.lock();
        pending.bytes.extend_from_slice(message.render().as_bytes());
        pending.frames += 1;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        let (chunk, frames) = {
            let mut pending = self.inner.pending.lock();
            if pending.bytes.is_empty() {
                drop(pending);
                return self.ensure_writable();
            }
            let frames = std::mem::take(&mut pending.frames);
            (pending.bytes.split().freeze(), frames)
        };
        let tx = self.inner.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(StreamError::WriterClosed);
        };
        tx.send(chunk).map_err(|_| StreamError::ClientGone)?;
        *self.inner.flushed_frames.lock() += frames;
        metrics::counter!("courier_sse_frames_total").increment(frames);
        Ok(())
    }

    /// Write and flush in one step.
    pub fn send(&self, message: &SseMessage) -> Result<()> {
        self.write(message)?;
        self.flush()
    }

    /// Comment-only record; invisible to clients, fails loudly on a dead socket.
    pub fn heartbeat(&self) -> Result<()> {
        self.send(&SseMessage::heartbeat())?;
        metrics::counter!("courier_sse_heartbeats_total").increment(1);
        Ok(())
    }

    pub fn is_client_gone(&self) -> bool {
        self.inner
            .tx
            .lock()
            .as_ref()
            .is_some_and(mpsc::UnboundedSender::is_closed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.tx.lock().is_none()
    }

    pub fn frames_flushed(&self) -> u64 {
        *self.inner.flushed_frames.lock()
    }

    /// Flush what is still buffered and end the response body. Idempotent.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        if let Err(err) = self.flush() {
            tracing::debug!(error = %err, "final flush failed while closing stream");
        }
        self.inner.tx.lock().take();
    }

    fn ensure_writable(&self) -> Result<()> {
        match self.inner.tx.lock().as_ref() {
            None => Err(StreamError::WriterClosed),
            Some(tx) if tx.is_closed() => Err(StreamError::ClientGone),
            Some(_) => Ok(()),
        }
    }
}

impl SseBody {
    /// Next flushed chunk; `None` once the writer closed and everything was read.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = std::result::Result<Bytes, Infallible>> + Send + 'static {
        futures::stream::unfold(self, |mut body| async move {
            body.next_chunk().await.map(|chunk| (Ok(chunk), body))
        })
    }
}
