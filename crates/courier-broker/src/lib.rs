// Broker primitives consumed by the streaming core.
// A connection either publishes or sits in subscriber mode; it never does both.
// Subscriber mode is consumed in one of two shapes: the blocking `next_message`
// (bounded by the read timeout) or the non-blocking `try_next_frame` iterator.
use async_trait::async_trait;
use bytes::Bytes;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod memory;

pub use memory::MemoryBroker;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },
    #[error("authentication rejected by broker")]
    Auth,
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),
    #[error("connection is broken and must be re-established")]
    Broken,
    #[error("command not allowed while subscribed")]
    SubscriberMode,
    #[error("connection is not subscribed")]
    NotSubscribed,
    #[error("connection closed")]
    Closed,
}

impl BrokerError {
    /// A read timeout is the periodic, expected way a blocking subscribe
    /// hands control back; it is not a failure of the broker.
    pub fn is_read_timeout(&self) -> bool {
        matches!(self, BrokerError::ReadTimeout(_))
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            BrokerError::Connect { .. } => "broker_connect",
            BrokerError::Auth => "broker_auth",
            BrokerError::ReadTimeout(_) => "broker_read_timeout",
            BrokerError::Broken => "broker_broken",
            BrokerError::SubscriberMode => "broker_subscriber_mode",
            BrokerError::NotSubscribed => "broker_not_subscribed",
            BrokerError::Closed => "broker_closed",
        }
    }
}

/// Connection settings handed to every broker client the core creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    // Bounded wait for blocking reads; `None` blocks until a message or interrupt.
    pub read_timeout: Option<Duration>,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            read_timeout: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = Some(read_timeout);
        self
    }

    /// Same endpoint and credentials, blocking reads never time out.
    pub fn without_read_timeout(&self) -> Self {
        Self {
            read_timeout: None,
            ..self.clone()
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::new("127.0.0.1", 6379)
    }
}

/// One datagram delivered on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: Bytes,
}

impl BrokerMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Item produced by the non-blocking iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Subscription confirmation; `count` is the number of channels now subscribed.
    Subscribed { channel: String, count: usize },
    Message(BrokerMessage),
}

impl Frame {
    pub fn is_control(&self) -> bool {
        matches!(self, Frame::Subscribed { .. })
    }

    pub fn as_message(&self) -> Option<&BrokerMessage> {
        match self {
            Frame::Message(message) => Some(message),
            Frame::Subscribed { .. } => None,
        }
    }
}

/// Unsubscribe-all trigger that can be fired from outside the task that owns
/// the subscribed connection.
#[derive(Debug, Clone)]
pub struct Interrupt {
    token: CancellationToken,
}

impl Interrupt {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn unsubscribe_all(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> Result<Box<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send {
    fn id(&self) -> u64;

    /// Returns the number of subscribers the payload was delivered to.
    async fn publish(&mut self, channel: &str, payload: Bytes) -> Result<usize>;

    /// Enter subscriber mode for `channels` (additive on an already subscribed connection).
    async fn subscribe(&mut self, channels: &[String]) -> Result<()>;

    /// Block until the next datagram.
    ///
    /// `Ok(None)` means the connection was unsubscribed through its [`Interrupt`].
    /// `Err(ReadTimeout)` leaves the connection broken.
    async fn next_message(&mut self) -> Result<Option<BrokerMessage>>;

    /// Non-blocking read of the next frame, control frames included.
    fn try_next_frame(&mut self) -> Result<Option<Frame>>;

    fn interrupt(&self) -> Interrupt;

    async fn close(&mut self);
}

/// Subscribe-with-callback: blocks in subscriber mode and hands every datagram
/// to `handler` until it breaks, the connection is interrupted, or a read fails.
pub async fn listen<F>(connection: &mut dyn Connection, channels: &[String], mut handler: F) -> Result<()>
where
    F: FnMut(BrokerMessage) -> ControlFlow<()> + Send,
{
    connection.subscribe(channels).await?;
    while let Some(message) = connection.next_message().await? {
        if handler(message).is_break() {
            break;
        }
    }
    Ok(())
}

/// Non-blocking cursor over a subscribed connection.
///
/// `prime` issues the subscribe and advances once; afterwards `current` never
/// waits and `advance` pulls at most one frame.
pub struct PubSubIter {
    connection: Box<dyn Connection>,
    channels: Vec<String>,
    current: Option<Frame>,
    primed: bool,
}

impl PubSubIter {
    pub fn new(connection: Box<dyn Connection>, channels: Vec<String>) -> Self {
        Self {
            connection,
            channels,
            current: None,
            primed: false,
        }
    }

    pub fn is_primed(&self) -> bool {
        self.primed
    }

    pub fn channels(&self) -> &[String] {
        &self.channels
    }

    pub async fn prime(&mut self) -> Result<()> {
        self.connection.subscribe(&self.channels).await?;
        self.primed = true;
        self.advance()
    }

    pub fn current(&self) -> Option<&Frame> {
        self.current.as_ref()
    }

    pub fn advance(&mut self) -> Result<()> {
        self.current = self.connection.try_next_frame()?;
        Ok(())
    }

    pub fn into_connection(self) -> Box<dyn Connection> {
        self.connection
    }
}
