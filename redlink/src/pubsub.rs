//! Publish/subscribe support
//!
//! A subscriber dedicates one connection to push delivery: after the
//! first subscribe command the connection's read loop stops correlating
//! replies with requests and instead fans every inbound message out to
//! the listeners registered for its channel or pattern. A subscribed
//! connection is never lent out for request/response use.
//!
//! If the dedicated connection is lost, every listener receives a
//! `SubscriptionLost` event and must re-subscribe explicitly; silently
//! re-subscribing would mask the messages missed while disconnected.

use crate::command::Command;
use crate::connection::{ConnectionReader, ConnectionWriter, RedisConnection};
use crate::protocol::RespEncoder;
use bytes::Bytes;
use futures_util::Stream;
use redlink_core::{
    error::{RedisError, RedisResult},
    value::Reply,
};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// A message received on a subscribed channel
#[derive(Debug, Clone)]
pub struct PubSubMessage {
    /// The channel the message was published to
    pub channel: String,
    /// The message payload; binary-safe
    pub payload: Bytes,
    /// The pattern that matched, for pattern subscriptions
    pub pattern: Option<String>,
}

/// Event delivered to a listener
#[derive(Debug, Clone)]
pub enum PubSubEvent {
    /// A message for one of the listener's subscriptions
    Message(PubSubMessage),
    /// The dedicated connection was lost; the subscription is gone and
    /// must be re-established explicitly
    SubscriptionLost(String),
}

/// Receiving end of one subscription registration
pub struct PubSubListener {
    rx: mpsc::UnboundedReceiver<PubSubEvent>,
}

impl PubSubListener {
    /// Next event, or `None` once the listener is detached
    pub async fn next_event(&mut self) -> Option<PubSubEvent> {
        self.rx.recv().await
    }
}

impl Stream for PubSubListener {
    type Item = PubSubEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

type ListenerSender = mpsc::UnboundedSender<PubSubEvent>;

#[derive(Default)]
struct SubscriptionSet {
    channels: HashMap<String, Vec<ListenerSender>>,
    patterns: HashMap<String, Vec<ListenerSender>>,
}

impl SubscriptionSet {
    fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }

    /// Deliver to every listener of the message's channel or pattern,
    /// pruning listeners whose receivers are gone.
    fn deliver(&mut self, message: &PubSubMessage) {
        let listeners = match &message.pattern {
            Some(pattern) => self.patterns.get_mut(pattern),
            None => self.channels.get_mut(&message.channel),
        };

        if let Some(listeners) = listeners {
            listeners.retain(|listener| {
                listener
                    .send(PubSubEvent::Message(message.clone()))
                    .is_ok()
            });
        }
    }

    fn fail_all(&mut self, reason: &str) {
        for listeners in self.channels.values().chain(self.patterns.values()) {
            for listener in listeners {
                let _ = listener.send(PubSubEvent::SubscriptionLost(reason.to_string()));
            }
        }
        self.channels.clear();
        self.patterns.clear();
    }
}

/// A dedicated push-mode connection with its listener registry
pub struct Subscriber {
    writer: Arc<Mutex<ConnectionWriter>>,
    registry: Arc<Mutex<SubscriptionSet>>,
    closed: Arc<AtomicBool>,
}

impl Subscriber {
    /// Take ownership of a connection and switch it to push delivery
    #[must_use]
    pub fn spawn(connection: RedisConnection) -> Self {
        let (reader, writer) = connection.into_split();
        let registry = Arc::new(Mutex::new(SubscriptionSet::default()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(push_loop(
            reader,
            Arc::clone(&registry),
            Arc::clone(&closed),
        ));

        Self {
            writer: Arc::new(Mutex::new(writer)),
            registry,
            closed,
        }
    }

    /// Subscribe to a channel; messages published to it are delivered to
    /// the returned listener in arrival order.
    pub async fn subscribe(&self, channel: &str) -> RedisResult<PubSubListener> {
        self.ensure_live()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry
            .lock()
            .await
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(tx);

        self.send(&Command::new("SUBSCRIBE").arg(channel)).await?;
        Ok(PubSubListener { rx })
    }

    /// Subscribe to a glob-style pattern
    pub async fn psubscribe(&self, pattern: &str) -> RedisResult<PubSubListener> {
        self.ensure_live()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.registry
            .lock()
            .await
            .patterns
            .entry(pattern.to_string())
            .or_default()
            .push(tx);

        self.send(&Command::new("PSUBSCRIBE").arg(pattern)).await?;
        Ok(PubSubListener { rx })
    }

    /// Drop all listeners for a channel and tell the server.
    ///
    /// When no subscriptions remain the dedicated connection is closed;
    /// a connection that has been in push mode is not reused for
    /// request/response traffic.
    pub async fn unsubscribe(&self, channel: &str) -> RedisResult<()> {
        self.ensure_live()?;
        self.send(&Command::new("UNSUBSCRIBE").arg(channel)).await?;

        let now_empty = {
            let mut registry = self.registry.lock().await;
            registry.channels.remove(channel);
            registry.is_empty()
        };
        if now_empty {
            self.close().await;
        }
        Ok(())
    }

    /// Drop all listeners for a pattern and tell the server
    pub async fn punsubscribe(&self, pattern: &str) -> RedisResult<()> {
        self.ensure_live()?;
        self.send(&Command::new("PUNSUBSCRIBE").arg(pattern)).await?;

        let now_empty = {
            let mut registry = self.registry.lock().await;
            registry.patterns.remove(pattern);
            registry.is_empty()
        };
        if now_empty {
            self.close().await;
        }
        Ok(())
    }

    /// Channels with at least one listener
    pub async fn subscribed_channels(&self) -> Vec<String> {
        self.registry.lock().await.channels.keys().cloned().collect()
    }

    /// Whether the dedicated connection is gone
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the dedicated connection
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.writer.lock().await.shutdown().await;
    }

    async fn send(&self, command: &Command) -> RedisResult<()> {
        let frame = RespEncoder::command_bytes(command);
        self.writer.lock().await.write_frame(&frame).await
    }

    fn ensure_live(&self) -> RedisResult<()> {
        if self.is_closed() {
            return Err(RedisError::ConnectionLost(
                "subscriber connection is closed".to_string(),
            ));
        }
        Ok(())
    }
}

async fn push_loop(
    mut reader: ConnectionReader,
    registry: Arc<Mutex<SubscriptionSet>>,
    closed: Arc<AtomicBool>,
) {
    loop {
        match reader.read_reply().await {
            Ok(reply) => {
                // push frames arrive as dedicated push replies on the
                // extended protocol and as plain arrays on the baseline
                let items = match reply {
                    Reply::Push(items) | Reply::Array(items) => items,
                    other => {
                        warn!(
                            "unexpected {} frame in subscribed mode",
                            other.type_name()
                        );
                        continue;
                    }
                };

                match parse_push_message(&items) {
                    Ok(Some(message)) => registry.lock().await.deliver(&message),
                    Ok(None) => debug!("subscription state change acknowledged"),
                    Err(e) => warn!("malformed push frame: {e}"),
                }
            }
            Err(e) => {
                closed.store(true, Ordering::SeqCst);
                registry.lock().await.fail_all(&e.to_string());
                break;
            }
        }
    }
}

/// Parse one inbound push frame.
///
/// Returns `None` for subscribe/unsubscribe acknowledgements, which are
/// state changes rather than messages.
fn parse_push_message(items: &[Reply]) -> RedisResult<Option<PubSubMessage>> {
    if items.is_empty() {
        return Err(RedisError::Protocol("empty push frame".to_string()));
    }
    let kind = items[0].as_string()?;

    match kind.as_str() {
        "message" if items.len() >= 3 => Ok(Some(PubSubMessage {
            channel: items[1].as_string()?,
            payload: items[2].as_bytes()?,
            pattern: None,
        })),
        "pmessage" if items.len() >= 4 => Ok(Some(PubSubMessage {
            channel: items[2].as_string()?,
            payload: items[3].as_bytes()?,
            pattern: Some(items[1].as_string()?),
        })),
        "subscribe" | "unsubscribe" | "psubscribe" | "punsubscribe" => Ok(None),
        other => Err(RedisError::Protocol(format!(
            "unknown push frame kind: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Transport;
    use redlink_core::config::ConnectionConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn mem_subscriber() -> (Subscriber, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        let connection =
            RedisConnection::from_transport(Transport::Mem(client), ConnectionConfig::default());
        (Subscriber::spawn(connection), server)
    }

    #[test]
    fn test_parse_message() {
        let items = vec![
            Reply::from("message"),
            Reply::from("news"),
            Reply::from("hello"),
        ];
        let message = parse_push_message(&items).unwrap().unwrap();
        assert_eq!(message.channel, "news");
        assert_eq!(&message.payload[..], b"hello");
        assert!(message.pattern.is_none());
    }

    #[test]
    fn test_parse_pattern_message() {
        let items = vec![
            Reply::from("pmessage"),
            Reply::from("news.*"),
            Reply::from("news.tech"),
            Reply::from("chips"),
        ];
        let message = parse_push_message(&items).unwrap().unwrap();
        assert_eq!(message.channel, "news.tech");
        assert_eq!(message.pattern.as_deref(), Some("news.*"));
    }

    #[test]
    fn test_parse_acknowledgement_is_not_a_message() {
        let items = vec![Reply::from("subscribe"), Reply::from("news"), Reply::Integer(1)];
        assert!(parse_push_message(&items).unwrap().is_none());

        let items = vec![Reply::from("nonsense"), Reply::from("x"), Reply::from("y")];
        assert!(parse_push_message(&items).is_err());
    }

    #[tokio::test]
    async fn test_fan_out_by_channel() {
        let (subscriber, mut server) = mem_subscriber();

        let mut news = subscriber.subscribe("news").await.unwrap();

        // the server sees the subscribe command
        let mut request = vec![0u8; 64];
        let n = server.read(&mut request).await.unwrap();
        assert_eq!(&request[..n], b"*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n");

        // acknowledgement, two news messages, one for another channel
        server
            .write_all(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n")
            .await
            .unwrap();
        server
            .write_all(b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$5\r\nfirst\r\n")
            .await
            .unwrap();
        server
            .write_all(b"*3\r\n$7\r\nmessage\r\n$6\r\nsports\r\n$4\r\ngoal\r\n")
            .await
            .unwrap();
        server
            .write_all(b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$6\r\nsecond\r\n")
            .await
            .unwrap();

        // only the news messages arrive, in delivery order
        match news.next_event().await.unwrap() {
            PubSubEvent::Message(m) => {
                assert_eq!(m.channel, "news");
                assert_eq!(&m.payload[..], b"first");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match news.next_event().await.unwrap() {
            PubSubEvent::Message(m) => assert_eq!(&m.payload[..], b"second"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscription_lost_on_connection_loss() {
        let (subscriber, mut server) = mem_subscriber();
        let mut news = subscriber.subscribe("news").await.unwrap();

        let mut request = vec![0u8; 64];
        let _ = server.read(&mut request).await.unwrap();
        drop(server);

        match news.next_event().await.unwrap() {
            PubSubEvent::SubscriptionLost(_) => {}
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(subscriber.is_closed());
        // no silent re-subscribe: further subscriptions are refused
        assert!(matches!(
            subscriber.subscribe("news").await,
            Err(RedisError::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn test_push_frames_on_extended_protocol() {
        let (subscriber, mut server) = mem_subscriber();
        let mut news = subscriber.subscribe("news").await.unwrap();

        let mut request = vec![0u8; 64];
        let _ = server.read(&mut request).await.unwrap();

        server
            .write_all(b">3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$2\r\nhi\r\n")
            .await
            .unwrap();

        match news.next_event().await.unwrap() {
            PubSubEvent::Message(m) => assert_eq!(&m.payload[..], b"hi"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
