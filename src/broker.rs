//! Correlated request/reply over MQTT
//!
//! The node subscribes to a topic named after a fresh correlation token,
//! publishes its request to the shared sync topic and waits for the first
//! message on its own topic. Everything else arriving on the session is noise.

use crate::BoardError;
use crate::config::SyncConfig;
use crate::correlation::CorrelationToken;
use alloc::string::String;
use embassy_time::{Duration, Instant, Timer};
use log::{debug, info, warn};

/// A message delivered on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

/// A connected broker session
#[allow(async_fn_in_trait)]
pub trait BrokerSession {
    /// Whether the underlying network link is still up
    fn link_up(&self) -> bool;

    async fn subscribe(&mut self, topic: &str) -> Result<(), BoardError>;

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BoardError>;

    /// Take one pending message, or wait `window` when none is ready
    async fn poll_message(&mut self, window: Duration) -> Result<Option<InboundMessage>, BoardError>;
}

/// Opens broker sessions
///
/// A session borrows the connector, which owns the socket and client buffers.
#[allow(async_fn_in_trait)]
pub trait BrokerConnector {
    type Session<'s>: BrokerSession
    where
        Self: 's;

    fn link_up(&self) -> bool;

    async fn connect(&mut self) -> Result<Self::Session<'_>, BoardError>;
}

pub struct CorrelatedRequestClient<C: BrokerConnector> {
    connector: C,
    poll_interval: Duration,
    reconnect_delay: Duration,
    deadline: Option<Duration>,
}

impl<C: BrokerConnector> CorrelatedRequestClient<C> {
    pub fn new(connector: C, config: &SyncConfig) -> Self {
        Self {
            connector,
            poll_interval: config.poll_interval,
            reconnect_delay: config.reconnect_delay,
            deadline: config.broker_deadline,
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn connector_mut(&mut self) -> &mut C {
        &mut self.connector
    }

    /// Publish `payload` to `topic` and wait for the reply on the token's topic
    ///
    /// Connection attempts are retried until the link goes down or the
    /// deadline elapses. A session that fails while waiting is replaced and
    /// the request is sent again with the same token.
    pub async fn request(
        &mut self,
        token: &CorrelationToken,
        topic: &str,
        payload: &[u8],
    ) -> Result<String, BoardError> {
        let started = Instant::now();
        let connector = &mut self.connector;
        let poll_interval = self.poll_interval;
        let reconnect_delay = self.reconnect_delay;
        let deadline = self.deadline;

        'session: loop {
            check_deadline(started, deadline)?;
            if !connector.link_up() {
                warn!("[BROKER] Network link is down");
                return Err(BoardError::TransportUnavailable);
            }

            let mut session = match connector.connect().await {
                Ok(session) => session,
                Err(e) => {
                    warn!("[BROKER] Connection failed: {}, retrying", e);
                    Timer::after(reconnect_delay).await;
                    continue 'session;
                }
            };
            info!("[BROKER] Connected");

            if let Err(e) = session.subscribe(token.as_str()).await {
                warn!("[BROKER] Subscribe to {} failed: {}", token, e);
                Timer::after(reconnect_delay).await;
                continue 'session;
            }
            if let Err(e) = session.publish(topic, payload).await {
                warn!("[BROKER] Publish to {} failed: {}", topic, e);
                Timer::after(reconnect_delay).await;
                continue 'session;
            }
            info!("[BROKER] Request published, waiting on {}", token);

            loop {
                check_deadline(started, deadline)?;
                if !session.link_up() {
                    warn!("[BROKER] Network link lost while waiting for the reply");
                    return Err(BoardError::TransportUnavailable);
                }

                match session.poll_message(poll_interval).await {
                    Ok(Some(message)) if message.topic == token.as_str() => {
                        info!("[BROKER] Reply received ({} bytes)", message.payload.len());
                        return Ok(message.payload);
                    }
                    Ok(Some(message)) => {
                        debug!("[BROKER] Ignoring message on {}", message.topic);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!("[BROKER] Session error: {}, reconnecting", e);
                        Timer::after(reconnect_delay).await;
                        continue 'session;
                    }
                }
            }
        }
    }
}

fn check_deadline(started: Instant, deadline: Option<Duration>) -> Result<(), BoardError> {
    match deadline {
        Some(limit) if started.elapsed() >= limit => {
            warn!("[BROKER] No reply within {}ms", limit.as_millis());
            Err(BoardError::Timeout)
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BrokerCall, CountingEntropy, ScriptedConnector, ScriptedPoll, test_config};
    use embassy_futures::block_on;

    fn token() -> CorrelationToken {
        CorrelationToken::generate(&mut CountingEntropy::new(1))
    }

    fn client(connector: ScriptedConnector) -> CorrelatedRequestClient<ScriptedConnector> {
        let mut config = test_config();
        config.broker_deadline = Some(Duration::from_secs(2));
        CorrelatedRequestClient::new(connector, &config)
    }

    #[test]
    fn reply_on_the_token_topic_completes_the_request() {
        let token = token();
        let mut connector = ScriptedConnector::new();
        connector.push_poll(ScriptedPoll::Nothing);
        connector.push_poll(ScriptedPoll::message(token.as_str(), "success=true;ph=1"));

        let mut client = client(connector);
        let reply = block_on(client.request(&token, "sync", b"{}")).unwrap();

        assert_eq!(reply, "success=true;ph=1");
        assert_eq!(
            client.connector().calls(),
            [
                BrokerCall::Connect,
                BrokerCall::Subscribe(token.as_str().into()),
                BrokerCall::Publish("sync".into(), "{}".into()),
            ]
        );
    }

    #[test]
    fn messages_for_other_topics_are_discarded() {
        let token = token();
        let mut connector = ScriptedConnector::new();
        connector.push_poll(ScriptedPoll::message("someone-else", "success=true;ph=x"));
        connector.push_poll(ScriptedPoll::message("sync", "{}"));
        connector.push_poll(ScriptedPoll::message(token.as_str(), "success=true;ph=mine"));

        let mut client = client(connector);
        let reply = block_on(client.request(&token, "sync", b"{}")).unwrap();
        assert_eq!(reply, "success=true;ph=mine");
    }

    #[test]
    fn failed_connections_are_retried() {
        let token = token();
        let mut connector = ScriptedConnector::new();
        connector.fail_connects(2);
        connector.push_poll(ScriptedPoll::message(token.as_str(), "success=true;ph=1"));

        let mut client = client(connector);
        assert!(block_on(client.request(&token, "sync", b"{}")).is_ok());

        let connects = client
            .connector()
            .calls()
            .iter()
            .filter(|c| **c == BrokerCall::Connect)
            .count();
        assert_eq!(connects, 3);
    }

    #[test]
    fn session_error_resubscribes_and_republishes_with_the_same_token() {
        let token = token();
        let mut connector = ScriptedConnector::new();
        connector.push_poll(ScriptedPoll::SessionError);
        connector.push_poll(ScriptedPoll::message(token.as_str(), "success=true;ph=1"));

        let mut client = client(connector);
        assert!(block_on(client.request(&token, "sync", b"{}")).is_ok());

        let subscribe = BrokerCall::Subscribe(token.as_str().into());
        let calls = client.connector().calls();
        assert_eq!(calls.iter().filter(|c| **c == subscribe).count(), 2);
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, BrokerCall::Publish(..)))
                .count(),
            2
        );
    }

    #[test]
    fn link_down_is_transport_unavailable() {
        let token = token();
        let mut connector = ScriptedConnector::new();
        connector.set_link(false);
        let mut client = client(connector);
        assert_eq!(
            block_on(client.request(&token, "sync", b"{}")),
            Err(BoardError::TransportUnavailable)
        );
        assert!(client.connector().calls().is_empty());
    }

    #[test]
    fn link_lost_while_waiting_is_transport_unavailable() {
        let token = token();
        let mut connector = ScriptedConnector::new();
        connector.push_poll(ScriptedPoll::Nothing);
        connector.push_poll(ScriptedPoll::LinkDown);

        let mut client = client(connector);
        assert_eq!(
            block_on(client.request(&token, "sync", b"{}")),
            Err(BoardError::TransportUnavailable)
        );
    }

    #[test]
    fn deadline_without_reply_is_a_timeout() {
        let token = token();
        let mut config = test_config();
        config.broker_deadline = Some(Duration::from_millis(40));
        let mut client = CorrelatedRequestClient::new(ScriptedConnector::new(), &config);

        assert_eq!(
            block_on(client.request(&token, "sync", b"{}")),
            Err(BoardError::Timeout)
        );
    }
}
