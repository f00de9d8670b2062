//! Host-side doubles for storage, radio, portal and broker

use crate::BoardError;
use crate::broker::{BrokerConnector, BrokerSession, InboundMessage};
use crate::config::{EmptyCredentialPolicy, SyncConfig};
use crate::correlation::EntropySource;
use crate::portal::PortalIo;
use crate::records::WifiCredentials;
use crate::status_led::{LedStatus, StatusIndicator};
use crate::store::{MemoryStorage, RecordKey, RecordStorage};
use crate::sync::WifiLink;
use std::collections::VecDeque;
use std::string::{String, ToString};
use std::vec::Vec;
use embassy_time::{Duration, Timer};

pub fn test_config() -> SyncConfig {
    SyncConfig {
        poll_interval: Duration::from_millis(1),
        reconnect_delay: Duration::from_millis(1),
        broker_deadline: None,
        portal_deadline: None,
        sync_topic: "sync",
        portal_ip: [192, 168, 1, 1],
        empty_credentials: EmptyCredentialPolicy::Reject,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Remove,
}

/// In-memory storage that logs every access and fails on demand
#[derive(Debug, Default)]
pub struct FlakyStorage {
    inner: MemoryStorage,
    fail_reads: bool,
    fail_writes: bool,
    write_failures: usize,
    log: Vec<(Access, RecordKey, usize)>,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_reads() -> Self {
        Self {
            fail_reads: true,
            ..Self::default()
        }
    }

    pub fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn fail_next_writes(&mut self, count: usize) {
        self.write_failures = count;
    }

    pub fn reset_log(&mut self) {
        self.log.clear();
    }

    /// Access kind, record and payload length of every call
    pub fn log(&self) -> &[(Access, RecordKey, usize)] {
        &self.log
    }
}

impl RecordStorage for FlakyStorage {
    fn read(&mut self, key: RecordKey) -> Result<Option<Vec<u8>>, BoardError> {
        if self.fail_reads {
            self.log.push((Access::Read, key, 0));
            return Err(BoardError::IoError);
        }
        let data = self.inner.read(key)?;
        self.log
            .push((Access::Read, key, data.as_ref().map_or(0, Vec::len)));
        Ok(data)
    }

    fn write(&mut self, key: RecordKey, data: &[u8]) -> Result<(), BoardError> {
        self.log.push((Access::Write, key, data.len()));
        if self.fail_writes {
            return Err(BoardError::IoError);
        }
        if self.write_failures > 0 {
            self.write_failures -= 1;
            return Err(BoardError::IoError);
        }
        self.inner.write(key, data)
    }

    fn remove(&mut self, key: RecordKey) -> Result<bool, BoardError> {
        self.log.push((Access::Remove, key, 0));
        self.inner.remove(key)
    }
}

/// Deterministic entropy: consecutive byte values from a seed
pub struct CountingEntropy {
    next: u8,
}

impl CountingEntropy {
    pub fn new(seed: u8) -> Self {
        Self { next: seed }
    }
}

impl EntropySource for CountingEntropy {
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for byte in dest.iter_mut() {
            *byte = self.next;
            self.next = self.next.wrapping_add(1);
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingIndicator {
    history: Vec<LedStatus>,
}

impl RecordingIndicator {
    pub fn history(&self) -> &[LedStatus] {
        &self.history
    }
}

impl StatusIndicator for RecordingIndicator {
    fn set_status(&mut self, status: LedStatus) {
        self.history.push(status);
    }
}

/// Radio double
#[derive(Debug, Default)]
pub struct FakeWifi {
    connected: bool,
    refuse: bool,
    access_points: usize,
    joined: Vec<String>,
}

impl FakeWifi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every later station connect fails
    pub fn fail_connect(&mut self) {
        self.refuse = true;
    }

    pub fn access_points_started(&self) -> usize {
        self.access_points
    }

    /// SSIDs of every connect attempt
    pub fn joined(&self) -> &[String] {
        &self.joined
    }
}

impl WifiLink for FakeWifi {
    async fn start_access_point(&mut self) -> Result<(), BoardError> {
        self.connected = false;
        self.access_points += 1;
        Ok(())
    }

    async fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), BoardError> {
        self.joined.push(credentials.ssid.clone());
        if self.refuse {
            return Err(BoardError::WiFiError);
        }
        self.connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

/// Portal transport fed from queues
///
/// Every DNS query comes from the same peer; responses are kept verbatim.
#[derive(Debug, Default)]
pub struct ScriptedPortal {
    dns_queries: VecDeque<Vec<u8>>,
    dns_replies: Vec<Vec<u8>>,
    requests: VecDeque<Vec<u8>>,
    responses: Vec<Vec<u8>>,
}

impl ScriptedPortal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an A query for the name made of `labels`
    pub fn push_dns_query(&mut self, labels: &[&str]) {
        let mut packet = vec![0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        for label in labels {
            packet.push(label.len() as u8);
            packet.extend_from_slice(label.as_bytes());
        }
        packet.extend_from_slice(&[0, 0, 1, 0, 1]);
        self.dns_queries.push_back(packet);
    }

    pub fn push_request(&mut self, raw: Vec<u8>) {
        self.requests.push_back(raw);
    }

    pub fn dns_replies(&self) -> &[Vec<u8>] {
        &self.dns_replies
    }

    /// Status code of every response sent so far
    pub fn statuses(&self) -> Vec<u16> {
        self.responses
            .iter()
            .filter_map(|raw| {
                let text = std::str::from_utf8(raw).ok()?;
                text.split(' ').nth(1)?.parse().ok()
            })
            .collect()
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }
}

impl PortalIo for ScriptedPortal {
    type Peer = ();

    async fn poll_dns(&mut self, buf: &mut [u8]) -> Result<Option<(usize, ())>, BoardError> {
        let Some(query) = self.dns_queries.pop_front() else {
            return Ok(None);
        };
        let len = query.len().min(buf.len());
        buf[..len].copy_from_slice(&query[..len]);
        Ok(Some((len, ())))
    }

    async fn send_dns(&mut self, _peer: (), reply: &[u8]) -> Result<(), BoardError> {
        self.dns_replies.push(reply.to_vec());
        Ok(())
    }

    async fn poll_request(&mut self, buf: &mut [u8]) -> Result<Option<usize>, BoardError> {
        let Some(request) = self.requests.pop_front() else {
            return Ok(None);
        };
        let len = request.len().min(buf.len());
        buf[..len].copy_from_slice(&request[..len]);
        Ok(Some(len))
    }

    async fn respond(&mut self, response: &[u8]) -> Result<(), BoardError> {
        self.responses.push(response.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Connect,
    Subscribe(String),
    Publish(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedPoll {
    /// Poll window passes without a message
    Nothing,
    /// The session breaks
    SessionError,
    /// The network link drops
    LinkDown,
    Message { topic: String, payload: String },
    /// A message on the most recently subscribed topic
    Reply(String),
}

impl ScriptedPoll {
    pub fn message(topic: &str, payload: &str) -> Self {
        ScriptedPoll::Message {
            topic: topic.to_string(),
            payload: payload.to_string(),
        }
    }

    pub fn reply(payload: &str) -> Self {
        ScriptedPoll::Reply(payload.to_string())
    }
}

/// Broker double; an exhausted poll script means silence
#[derive(Debug)]
pub struct ScriptedConnector {
    link: bool,
    failed_connects: usize,
    polls: VecDeque<ScriptedPoll>,
    calls: Vec<BrokerCall>,
    subscribed: Option<String>,
}

impl Default for ScriptedConnector {
    fn default() -> Self {
        Self {
            link: true,
            failed_connects: 0,
            polls: VecDeque::new(),
            calls: Vec::new(),
            subscribed: None,
        }
    }
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_poll(&mut self, poll: ScriptedPoll) {
        self.polls.push_back(poll);
    }

    /// The next `count` connects fail
    pub fn fail_connects(&mut self, count: usize) {
        self.failed_connects = count;
    }

    pub fn set_link(&mut self, up: bool) {
        self.link = up;
    }

    pub fn calls(&self) -> &[BrokerCall] {
        &self.calls
    }

    /// Topic and payload of every publish
    pub fn published(&self) -> Vec<(String, String)> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Publish(topic, payload) => Some((topic.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }
}

impl BrokerConnector for ScriptedConnector {
    type Session<'s> = ScriptedSession<'s>;

    fn link_up(&self) -> bool {
        self.link
    }

    async fn connect(&mut self) -> Result<ScriptedSession<'_>, BoardError> {
        self.calls.push(BrokerCall::Connect);
        if self.failed_connects > 0 {
            self.failed_connects -= 1;
            return Err(BoardError::IoError);
        }
        Ok(ScriptedSession { connector: self })
    }
}

pub struct ScriptedSession<'a> {
    connector: &'a mut ScriptedConnector,
}

impl BrokerSession for ScriptedSession<'_> {
    fn link_up(&self) -> bool {
        self.connector.link
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), BoardError> {
        self.connector
            .calls
            .push(BrokerCall::Subscribe(topic.to_string()));
        self.connector.subscribed = Some(topic.to_string());
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BoardError> {
        self.connector.calls.push(BrokerCall::Publish(
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        ));
        Ok(())
    }

    async fn poll_message(
        &mut self,
        window: Duration,
    ) -> Result<Option<InboundMessage>, BoardError> {
        let Some(poll) = self.connector.polls.pop_front() else {
            Timer::after(window).await;
            return Ok(None);
        };
        match poll {
            ScriptedPoll::Nothing => Ok(None),
            ScriptedPoll::SessionError => Err(BoardError::IoError),
            ScriptedPoll::LinkDown => {
                self.connector.link = false;
                Ok(None)
            }
            ScriptedPoll::Message { topic, payload } => Ok(Some(InboundMessage { topic, payload })),
            ScriptedPoll::Reply(payload) => Ok(Some(InboundMessage {
                topic: self.connector.subscribed.clone().unwrap_or_default(),
                payload,
            })),
        }
    }
}
