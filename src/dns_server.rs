//! Captive DNS socket
//!
//! Non-blocking wrapper around the access point's UDP socket on port 53. The
//! answers themselves are built by `dns::captive_reply`.

use crate::{BoardError, config};
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpEndpoint, Stack};
use embassy_time::{Duration, with_timeout};
use log::{info, warn};

/// Longest a single poll waits for a datagram
const RECV_WINDOW: Duration = Duration::from_millis(1);

pub struct DnsResponder<'a> {
    socket: UdpSocket<'a>,
}

impl<'a> DnsResponder<'a> {
    pub fn new(
        stack: Stack<'a>,
        rx_meta: &'a mut [PacketMetadata],
        rx_buffer: &'a mut [u8],
        tx_meta: &'a mut [PacketMetadata],
        tx_buffer: &'a mut [u8],
    ) -> Result<Self, BoardError> {
        let mut socket = UdpSocket::new(stack, rx_meta, rx_buffer, tx_meta, tx_buffer);
        socket.bind(config::DNS_PORT).map_err(|e| {
            warn!("[DNS] Failed to bind port {}: {:?}", config::DNS_PORT, e);
            BoardError::PortalError
        })?;
        info!("[DNS] Captive DNS bound to port {}", config::DNS_PORT);
        Ok(Self { socket })
    }

    /// One pending query, if any arrived
    pub async fn poll(&mut self, buf: &mut [u8]) -> Result<Option<(usize, IpEndpoint)>, BoardError> {
        match with_timeout(RECV_WINDOW, self.socket.recv_from(buf)).await {
            Ok(Ok((len, meta))) => Ok(Some((len, meta.endpoint))),
            Ok(Err(e)) => {
                warn!("[DNS] Socket error: {:?}", e);
                Err(BoardError::IoError)
            }
            Err(_) => Ok(None),
        }
    }

    pub async fn reply(&mut self, peer: IpEndpoint, packet: &[u8]) -> Result<(), BoardError> {
        self.socket
            .send_to(packet, peer)
            .await
            .map_err(|_| BoardError::IoError)
    }
}
