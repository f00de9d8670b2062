//! MQTT transport on the station stack
//!
//! `MqttConnector` owns the socket and client buffers; every `connect`
//! resolves the broker, opens a fresh TCP connection and lends the buffers to
//! a rust-mqtt v5 client for the lifetime of the session.

use crate::broker::{BrokerConnector, BrokerSession, InboundMessage};
use crate::{BoardError, config};
use alloc::string::String;
use core::fmt::Write as _;
use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::TcpSocket;
use embassy_net::{IpAddress, Ipv4Address, Stack};
use embassy_time::{Duration, Instant, Timer};
use log::{debug, info, warn};
use rust_mqtt::client::client::MqttClient;
use rust_mqtt::client::client_config::{ClientConfig as MqttClientConfig, MqttVersion};
use rust_mqtt::packet::v5::publish_packet::QualityOfService;
use rust_mqtt::packet::v5::reason_codes::ReasonCode;
use rust_mqtt::utils::rng_generator::CountingRng;

const MAX_PROPERTIES: usize = 5;
const SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Buffers lent to each session
pub struct MqttBuffers<'a> {
    pub socket_rx: &'a mut [u8],
    pub socket_tx: &'a mut [u8],
    pub client_write: &'a mut [u8],
    pub client_recv: &'a mut [u8],
}

pub struct MqttConnector<'a> {
    stack: Stack<'a>,
    host: &'static str,
    port: u16,
    client_id: heapless::String<24>,
    buffers: MqttBuffers<'a>,
}

impl<'a> MqttConnector<'a> {
    /// Connector for the configured broker, identified by the station MAC
    pub fn new(stack: Stack<'a>, mac: [u8; 6], buffers: MqttBuffers<'a>) -> Self {
        let mut client_id = heapless::String::new();
        let _ = write!(
            client_id,
            "soil-node-{:02x}{:02x}{:02x}",
            mac[3], mac[4], mac[5]
        );
        Self {
            stack,
            host: config::BROKER_HOST,
            port: config::broker_port(),
            client_id,
            buffers,
        }
    }

    async fn resolve(&self) -> Result<IpAddress, BoardError> {
        if let Ok(ipv4) = self.host.parse::<Ipv4Address>() {
            return Ok(IpAddress::Ipv4(ipv4));
        }
        let addresses = self
            .stack
            .dns_query(self.host, DnsQueryType::A)
            .await
            .map_err(|e| {
                warn!("[BROKER] DNS lookup of {} failed: {:?}", self.host, e);
                BoardError::IoError
            })?;
        addresses.first().copied().ok_or(BoardError::NotFound)
    }
}

impl BrokerConnector for MqttConnector<'_> {
    type Session<'s>
        = MqttSession<'s>
    where
        Self: 's;

    fn link_up(&self) -> bool {
        self.stack.is_link_up() && self.stack.is_config_up()
    }

    async fn connect(&mut self) -> Result<MqttSession<'_>, BoardError> {
        let address = self.resolve().await?;
        info!("[BROKER] Connecting to {}:{}", self.host, self.port);

        let buffers = &mut self.buffers;
        let mut socket = TcpSocket::new(self.stack, &mut *buffers.socket_rx, &mut *buffers.socket_tx);
        socket.set_timeout(Some(SOCKET_TIMEOUT));
        socket.connect((address, self.port)).await.map_err(|e| {
            warn!("[BROKER] TCP connect error: {:?}", e);
            BoardError::IoError
        })?;

        let mut mqtt_config = MqttClientConfig::new(MqttVersion::MQTTv5, CountingRng(20000));
        mqtt_config.add_max_subscribe_qos(QualityOfService::QoS0);
        mqtt_config.add_client_id(self.client_id.as_str());
        mqtt_config.keep_alive = config::MQTT_KEEP_ALIVE_SECS;
        mqtt_config.max_packet_size = 1024;

        let write_len = buffers.client_write.len();
        let recv_len = buffers.client_recv.len();
        let mut client = MqttClient::<_, MAX_PROPERTIES, _>::new(
            socket,
            &mut *buffers.client_write,
            write_len,
            &mut *buffers.client_recv,
            recv_len,
            mqtt_config,
        );

        client.connect_to_broker().await.map_err(|code| {
            warn!("[BROKER] CONNECT refused: {:?}", code);
            mqtt_error(code)
        })?;

        Ok(MqttSession {
            client,
            stack: self.stack,
            last_activity: Instant::now(),
        })
    }
}

pub struct MqttSession<'s> {
    client: MqttClient<'s, TcpSocket<'s>, MAX_PROPERTIES, CountingRng>,
    stack: Stack<'s>,
    last_activity: Instant,
}

impl MqttSession<'_> {
    /// Ping once half the keep-alive has passed without traffic
    async fn keep_alive(&mut self) -> Result<(), BoardError> {
        let half = Duration::from_secs(config::MQTT_KEEP_ALIVE_SECS as u64 / 2);
        if self.last_activity.elapsed() < half {
            return Ok(());
        }
        debug!("[BROKER] Keep-alive ping");
        self.client.send_ping().await.map_err(mqtt_error)?;
        self.last_activity = Instant::now();
        Ok(())
    }
}

impl BrokerSession for MqttSession<'_> {
    fn link_up(&self) -> bool {
        self.stack.is_link_up() && self.stack.is_config_up()
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), BoardError> {
        self.client
            .subscribe_to_topic(topic)
            .await
            .map_err(mqtt_error)?;
        self.last_activity = Instant::now();
        Ok(())
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), BoardError> {
        match self
            .client
            .send_message(topic, payload, QualityOfService::QoS0, false)
            .await
        {
            Ok(()) | Err(ReasonCode::NoMatchingSubscribers) => {
                self.last_activity = Instant::now();
                Ok(())
            }
            Err(code) => Err(mqtt_error(code)),
        }
    }

    async fn poll_message(&mut self, window: Duration) -> Result<Option<InboundMessage>, BoardError> {
        // Only started once bytes are waiting, so a packet is never read halfway
        match self.client.receive_message_if_ready().await {
            Ok(Some((topic, payload))) => {
                let message = InboundMessage {
                    topic: String::from(topic),
                    payload: String::from_utf8_lossy(payload).into_owned(),
                };
                self.last_activity = Instant::now();
                return Ok(Some(message));
            }
            Ok(None) => {}
            Err(code) => return Err(mqtt_error(code)),
        }

        // send_ping drops any PUBLISH read ahead of the PINGRESP, so only
        // ping with nothing pending
        self.keep_alive().await?;
        Timer::after(window).await;
        Ok(None)
    }
}

/// Every client failure ends the session; the request client reconnects
fn mqtt_error(code: ReasonCode) -> BoardError {
    debug!("[BROKER] Client error: {:?}", code);
    BoardError::IoError
}
