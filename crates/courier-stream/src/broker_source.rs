// Broker subscription living inside the cooperative scheduler.
// Uses the non-blocking iterator only: the first tick subscribes and primes,
// later ticks read whatever is already there and return.
use crate::envelope::Envelope;
use crate::source::{Reply, TickContext, TickableSource};
use crate::teardown::Teardown;
use async_trait::async_trait;
use courier_broker::{BrokerMessage, Connection, Frame, PubSubIter};
use serde_json::Value;

pub type BrokerCallback = Box<dyn FnMut(&str, &Value) -> Reply + Send>;

pub struct BrokerPollSource {
    // Taken on shutdown; the connection then belongs to the teardown list.
    iter: Option<PubSubIter>,
    callback: BrokerCallback,
    max_frames_per_tick: usize,
    terminated: bool,
}

impl BrokerPollSource {
    pub fn new(
        connection: Box<dyn Connection>,
        channels: Vec<String>,
        callback: impl FnMut(&str, &Value) -> Reply + Send + 'static,
    ) -> Self {
        Self {
            iter: Some(PubSubIter::new(connection, channels)),
            callback: Box::new(callback),
            max_frames_per_tick: 1,
            terminated: false,
        }
    }

    pub fn with_max_frames_per_tick(mut self, max_frames_per_tick: usize) -> Self {
        self.max_frames_per_tick = max_frames_per_tick.max(1);
        self
    }

    fn terminate(&mut self, reason: &'static str) {
        if !self.terminated {
            tracing::debug!(reason, "broker poll source terminated");
            self.terminated = true;
        }
    }
}

enum Step {
    Idle,
    Skipped,
    Deliver(BrokerMessage),
}

fn next_step(iter: &mut PubSubIter) -> courier_broker::Result<Step> {
    if iter.current().is_none() {
        iter.advance()?;
    }
    let step = match iter.current() {
        None => return Ok(Step::Idle),
        Some(Frame::Subscribed { .. }) => Step::Skipped,
        Some(Frame::Message(message)) if !iter.channels().contains(&message.channel) => {
            tracing::debug!(channel = %message.channel, "dropping message on unexpected channel");
            Step::Skipped
        }
        Some(Frame::Message(message)) => Step::Deliver(message.clone()),
    };
    iter.advance()?;
    Ok(step)
}

#[async_trait]
impl TickableSource for BrokerPollSource {
    fn name(&self) -> &str {
        "broker-poll"
    }

    async fn tick(&mut self, ctx: &mut TickContext<'_>) {
        if self.terminated {
            return;
        }
        // Best effort only: proxies keep this signal from firing reliably.
        if ctx.client_gone() {
            self.terminate("client gone");
            return;
        }
        let Some(iter) = self.iter.as_mut() else {
            return;
        };
        if !iter.is_primed() {
            if let Err(err) = iter.prime().await {
                tracing::warn!(error = %err, "broker poll source could not subscribe");
                self.terminate("subscribe failed");
            }
            return;
        }

        let mut delivered = 0;
        while delivered < self.max_frames_per_tick {
            let message = match next_step(iter) {
                Ok(Step::Idle) => break,
                Ok(Step::Skipped) => continue,
                Ok(Step::Deliver(message)) => message,
                Err(err) => {
                    tracing::warn!(error = %err, "broker poll source read failed");
                    self.terminated = true;
                    return;
                }
            };
            delivered += 1;
            metrics::counter!("courier_broker_poll_messages_total").increment(1);
            let envelope = Envelope::from_message(message);
            match (self.callback)(&envelope.channel, &envelope.payload) {
                Reply::Stop => {
                    self.terminated = true;
                    return;
                }
                Reply::Skip => {}
                Reply::Message(message) => {
                    if let Err(err) = ctx.message(message) {
                        tracing::debug!(error = %err, "broker poll source could not send");
                        self.terminated = true;
                        return;
                    }
                }
            }
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }

    fn shutdown(&mut self, teardown: &mut Teardown) {
        self.terminated = true;
        if let Some(iter) = self.iter.take() {
            let mut connection = iter.into_connection();
            teardown.defer("broker-poll-connection", move || async move {
                connection.close().await;
            });
        }
    }
}
