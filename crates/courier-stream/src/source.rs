// Units driven by the cooperative scheduler.
// A source never blocks inside `tick`; it does one bounded step of work and
// returns. Sources may emit at any point through `TickContext::message`, which
// flushes immediately instead of waiting for the end of the round.
use crate::Result;
use crate::sse::{SseMessage, SseWriter};
use crate::teardown::Teardown;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};

/// What a source callback wants done with one input.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Terminate the source.
    Stop,
    /// Send nothing.
    Skip,
    Message(SseMessage),
}

impl Reply {
    pub fn send(value: impl Into<Value>) -> Self {
        Reply::Message(SseMessage::Json(value.into()))
    }

    pub fn preformatted(text: impl Into<String>) -> Self {
        Reply::Message(SseMessage::Preformatted(text.into()))
    }
}

pub struct TickContext<'a> {
    writer: &'a SseWriter,
    stop: &'a AtomicBool,
}

impl<'a> TickContext<'a> {
    pub fn new(writer: &'a SseWriter, stop: &'a AtomicBool) -> Self {
        Self { writer, stop }
    }

    /// Frame `message` and flush it right away.
    pub fn message(&self, message: SseMessage) -> Result<()> {
        self.writer.send(&message)
    }

    pub fn client_gone(&self) -> bool {
        self.writer.is_client_gone()
    }

    /// Ask the scheduler to stop after the current round.
    pub fn stop_scheduler(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
pub trait TickableSource: Send {
    fn name(&self) -> &str {
        "source"
    }

    async fn tick(&mut self, ctx: &mut TickContext<'_>);

    fn is_terminated(&self) -> bool {
        false
    }

    /// Hand any resource that must outlive the response writer to `teardown`.
    fn shutdown(&mut self, _teardown: &mut Teardown) {}
}

/// Polls a user function every tick and pushes whatever non-falsy value it returns.
pub struct PollSource<F> {
    name: String,
    poll: F,
}

impl<F> PollSource<F>
where
    F: FnMut() -> Value + Send,
{
    pub fn new(name: impl Into<String>, poll: F) -> Self {
        Self {
            name: name.into(),
            poll,
        }
    }
}

#[async_trait]
impl<F> TickableSource for PollSource<F>
where
    F: FnMut() -> Value + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn tick(&mut self, ctx: &mut TickContext<'_>) {
        let value = (self.poll)();
        if is_falsy(&value) {
            return;
        }
        if let Err(err) = ctx.message(SseMessage::Json(value)) {
            tracing::debug!(source = %self.name, error = %err, "poll source could not send");
        }
    }
}

/// Empty results are not worth a frame.
pub fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(number) => number.as_f64() == Some(0.0),
        Value::String(text) => text.is_empty() || text == "0",
        Value::Array(items) => items.is_empty(),
        Value::Object(fields) => fields.is_empty(),
    }
}
