//! Portal sockets
//!
//! A single-connection HTTP listener on the access point plus the captive
//! DNS responder, exposed to the portal loop through `PortalIo`.

use crate::dns_server::DnsResponder;
use crate::portal::{self, PortalIo};
use crate::{BoardError, config};
use embassy_net::tcp::{State, TcpSocket};
use embassy_net::{IpEndpoint, Stack};
use embassy_time::{Duration, with_timeout};
use log::{debug, warn};

/// Longest a poll waits for a client to connect
const ACCEPT_WINDOW: Duration = Duration::from_millis(1);

/// Idle limit for a connected client
const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpListener<'a> {
    socket: TcpSocket<'a>,
}

impl<'a> HttpListener<'a> {
    pub fn new(stack: Stack<'a>, rx_buffer: &'a mut [u8], tx_buffer: &'a mut [u8]) -> Self {
        let mut socket = TcpSocket::new(stack, rx_buffer, tx_buffer);
        socket.set_timeout(Some(CLIENT_TIMEOUT));
        Self { socket }
    }

    /// Accept a client if one is waiting and read its whole request
    ///
    /// An accept that times out leaves the socket listening. The handshake
    /// then completes between polls, so only a closed socket is put back into
    /// listen; a connected one is read directly.
    pub async fn poll(&mut self, buf: &mut [u8]) -> Result<Option<usize>, BoardError> {
        match self.socket.state() {
            State::Closed => {
                match with_timeout(ACCEPT_WINDOW, self.socket.accept(config::HTTP_PORT)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("[HTTP] Accept failed: {:?}", e);
                        self.reset().await;
                        return Err(BoardError::IoError);
                    }
                    Err(_) => return Ok(None),
                }
            }
            State::Listen | State::SynReceived => return Ok(None),
            _ => {}
        }
        debug!("[HTTP] Client connected from {:?}", self.socket.remote_endpoint());

        let mut len = 0;
        while len < buf.len() {
            match self.socket.read(&mut buf[len..]).await {
                Ok(0) => break,
                Ok(n) => {
                    len += n;
                    if portal::request_len(&buf[..len]).is_some() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("[HTTP] Read failed: {:?}", e);
                    self.reset().await;
                    return Err(BoardError::IoError);
                }
            }
        }

        if len == 0 {
            self.reset().await;
            return Ok(None);
        }
        Ok(Some(len))
    }

    /// Send `response` and close the connection
    pub async fn respond(&mut self, response: &[u8]) -> Result<(), BoardError> {
        let mut sent = 0;
        let result = loop {
            if sent == response.len() {
                break Ok(());
            }
            match self.socket.write(&response[sent..]).await {
                Ok(0) => break Err(BoardError::IoError),
                Ok(n) => sent += n,
                Err(e) => {
                    warn!("[HTTP] Write failed: {:?}", e);
                    break Err(BoardError::IoError);
                }
            }
        };

        if result.is_ok() {
            let _ = self.socket.flush().await;
            self.socket.close();
            let _ = self.socket.flush().await;
        }
        self.reset().await;
        result
    }

    /// Drop whatever is left of the connection so the next accept can listen
    async fn reset(&mut self) {
        if self.socket.state() != State::Closed {
            self.socket.abort();
            let _ = self.socket.flush().await;
        }
    }
}

/// DNS and HTTP sockets of the access point
pub struct PortalSockets<'a> {
    dns: DnsResponder<'a>,
    http: HttpListener<'a>,
}

impl<'a> PortalSockets<'a> {
    pub fn new(dns: DnsResponder<'a>, http: HttpListener<'a>) -> Self {
        Self { dns, http }
    }
}

impl PortalIo for PortalSockets<'_> {
    type Peer = IpEndpoint;

    async fn poll_dns(&mut self, buf: &mut [u8]) -> Result<Option<(usize, IpEndpoint)>, BoardError> {
        self.dns.poll(buf).await
    }

    async fn send_dns(&mut self, peer: IpEndpoint, reply: &[u8]) -> Result<(), BoardError> {
        self.dns.reply(peer, reply).await
    }

    async fn poll_request(&mut self, buf: &mut [u8]) -> Result<Option<usize>, BoardError> {
        self.http.poll(buf).await
    }

    async fn respond(&mut self, response: &[u8]) -> Result<(), BoardError> {
        self.http.respond(response).await
    }
}
