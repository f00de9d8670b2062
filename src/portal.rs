//! Captive provisioning portal
//!
//! Serves one form (WiFi or identity) over the access point, answers every
//! DNS query with the portal address and persists the first valid
//! submission. The caller restarts the node once [`ProvisioningPortal::serve`]
//! reports the submission.

use crate::dns;
use crate::guard::{self, MissingFields};
use crate::records::{UserEntry, WifiCredentials};
use crate::store::{RecordKey, RecordStorage, RecordStore};
use crate::{BoardError, config};
use alloc::borrow::Cow;
use alloc::string::String;
use alloc::vec::Vec;
use alloc::format;
use embassy_time::{Duration, Instant, Timer};
use log::{debug, info, warn};

const WIFI_PAGE: &str = include_str!("../assets/wifi.html");
const SYNC_PAGE: &str = include_str!("../assets/sync.html");

/// Paths operating systems probe to detect a captive network
const CAPTIVE_PATHS: &[&str] = &[
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/ncsi.txt",
    "/connecttest.txt",
];

/// Size of the buffer a whole HTTP request must fit in
pub const REQUEST_BUFFER_SIZE: usize = 2048;

/// Size of DNS query and reply buffers
pub const DNS_BUFFER_SIZE: usize = 512;

/// Which record the portal collects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormKind {
    Wifi,
    Identity,
}

impl FormKind {
    pub fn path(&self) -> &'static str {
        match self {
            FormKind::Wifi => "/wifi",
            FormKind::Identity => "/sync",
        }
    }

    pub fn page(&self) -> &'static str {
        match self {
            FormKind::Wifi => WIFI_PAGE,
            FormKind::Identity => SYNC_PAGE,
        }
    }

    pub fn record_key(&self) -> RecordKey {
        match self {
            FormKind::Wifi => RecordKey::WifiSession,
            FormKind::Identity => RecordKey::UserEntry,
        }
    }

    /// Status sent back when required fields are missing
    pub fn missing_status(&self) -> u16 {
        match self {
            FormKind::Wifi => 400,
            FormKind::Identity => 206,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Other,
}

/// A complete HTTP request borrowed from the receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest<'a> {
    pub method: Method,
    pub path: &'a str,
    pub body: &'a str,
}

impl<'a> HttpRequest<'a> {
    pub fn parse(raw: &'a [u8]) -> Result<Self, BoardError> {
        let head_end = header_end(raw).ok_or(BoardError::PortalError)?;
        let head = core::str::from_utf8(&raw[..head_end]).map_err(|_| BoardError::PortalError)?;

        let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
        let method = match request_line.next() {
            Some("GET") => Method::Get,
            Some("POST") => Method::Post,
            Some(_) => Method::Other,
            None => return Err(BoardError::PortalError),
        };
        let target = request_line.next().ok_or(BoardError::PortalError)?;
        let path = target.split('?').next().unwrap_or(target);

        let body_end = (head_end + content_length(head)).min(raw.len());
        let body =
            core::str::from_utf8(&raw[head_end..body_end]).map_err(|_| BoardError::PortalError)?;

        Ok(Self { method, path, body })
    }

    /// Decoded value of a form field in an urlencoded body
    pub fn form_value(&self, name: &str) -> Option<String> {
        self.body
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| url_decode(key) == name)
            .map(|(_, value)| url_decode(value))
    }
}

/// Total length of the request once its headers have arrived
pub fn request_len(raw: &[u8]) -> Option<usize> {
    let head_end = header_end(raw)?;
    let head = core::str::from_utf8(&raw[..head_end]).ok()?;
    Some(head_end + content_length(head))
}

fn header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn content_length(head: &str) -> usize {
    head.lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

/// Decode `application/x-www-form-urlencoded` text
pub fn url_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => decoded.push(b' '),
            b'%' => match bytes.get(i + 1..i + 3).and_then(|pair| hex_pair(pair[0], pair[1])) {
                Some(byte) => {
                    decoded.push(byte);
                    i += 2;
                }
                None => decoded.push(b'%'),
            },
            other => decoded.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_pair(high: u8, low: u8) -> Option<u8> {
    let high = (high as char).to_digit(16)?;
    let low = (low as char).to_digit(16)?;
    Some((high * 16 + low) as u8)
}

/// Response the portal sends back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub location: Option<&'static str>,
    pub body: Cow<'static, str>,
}

impl HttpResponse {
    pub fn text(status: u16, body: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            location: None,
            body: body.into(),
        }
    }

    pub fn html(page: &'static str) -> Self {
        Self {
            status: 200,
            content_type: "text/html; charset=utf-8",
            location: None,
            body: Cow::Borrowed(page),
        }
    }

    pub fn redirect(location: &'static str) -> Self {
        Self {
            status: 302,
            content_type: "text/plain; charset=utf-8",
            location: Some(location),
            body: Cow::Borrowed(""),
        }
    }

    fn reason(&self) -> &'static str {
        match self.status {
            200 => "OK",
            206 => "Partial Content",
            302 => "Found",
            400 => "Bad Request",
            404 => "Not Found",
            422 => "Unprocessable Entity",
            _ => "",
        }
    }

    /// Serialize as an HTTP/1.1 response that closes the connection
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n",
            self.status,
            self.reason(),
            self.content_type,
            self.body.len()
        );
        if let Some(location) = self.location {
            head.push_str("Location: ");
            head.push_str(location);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(self.body.as_bytes());
        bytes
    }
}

/// Result of handling one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalReply {
    pub response: HttpResponse,
    /// The form was valid and its record is persisted
    pub submitted: bool,
}

impl PortalReply {
    fn page(response: HttpResponse) -> Self {
        Self {
            response,
            submitted: false,
        }
    }
}

/// Route one request
pub fn handle<S: RecordStorage>(
    kind: FormKind,
    store: &mut RecordStore<S>,
    request: &HttpRequest<'_>,
) -> PortalReply {
    debug!("[PORTAL] {:?} {}", request.method, request.path);

    let form_path = request.path == kind.path() || request.path == "/";
    match request.method {
        Method::Get if form_path => PortalReply::page(HttpResponse::html(kind.page())),
        Method::Get if CAPTIVE_PATHS.contains(&request.path) => {
            PortalReply::page(HttpResponse::redirect(kind.path()))
        }
        Method::Post if form_path => submit(kind, store, request),
        _ => PortalReply::page(HttpResponse::text(404, "Not found")),
    }
}

fn submit<S: RecordStorage>(
    kind: FormKind,
    store: &mut RecordStore<S>,
    request: &HttpRequest<'_>,
) -> PortalReply {
    let saved = match kind {
        FormKind::Wifi => {
            let ssid = request.form_value("ssid");
            let password = request.form_value("password");
            let fields = [("SSID", ssid.as_deref()), ("Password", password.as_deref())];
            if let Err(reply) = validate(kind, &fields) {
                return reply;
            }
            save_wifi(store, ssid.as_deref(), password.as_deref())
        }
        FormKind::Identity => {
            let name = request.form_value("username");
            let password = request.form_value("password");
            let cpf = request.form_value("cpf");
            let serial_code = request.form_value("serialCode");
            let fields = [
                ("Username", name.as_deref()),
                ("Password", password.as_deref()),
                ("CPF", cpf.as_deref()),
                ("Serial code", serial_code.as_deref()),
            ];
            if let Err(reply) = validate(kind, &fields) {
                return reply;
            }
            let entry = UserEntry::new(
                name.as_deref().unwrap_or_default(),
                password.as_deref().unwrap_or_default(),
                serial_code.as_deref().unwrap_or_default(),
                cpf.as_deref().unwrap_or_default(),
            );
            store.write_lines(RecordKey::UserEntry, &entry.to_lines(), false)
        }
    };

    match saved {
        Ok(()) => {
            info!("[PORTAL] {:?} form saved to {}", kind, kind.record_key().path());
            PortalReply {
                response: HttpResponse::text(200, "OK"),
                submitted: true,
            }
        }
        Err(e) => {
            warn!("[PORTAL] Failed to save {:?} form: {}", kind, e);
            PortalReply::page(HttpResponse::text(422, "Could not save the form"))
        }
    }
}

fn save_wifi<S: RecordStorage>(
    store: &mut RecordStore<S>,
    ssid: Option<&str>,
    password: Option<&str>,
) -> Result<(), BoardError> {
    let wifi = WifiCredentials::new(ssid.unwrap_or_default(), password.unwrap_or_default())?;
    store.write_lines(RecordKey::WifiSession, &wifi.to_lines(), false)
}

/// Missing fields first, then values that would not survive the line record
fn validate(kind: FormKind, fields: &[(&str, Option<&str>)]) -> Result<(), PortalReply> {
    guard::against_missing_bulk(fields).map_err(|missing| rejected(kind, missing))?;
    guard::against_line_breaks(fields).map_err(|label| {
        info!("[PORTAL] Rejected {:?} form: {} spans several lines", kind, label);
        PortalReply::page(HttpResponse::text(400, format!("{} must be a single line.", label)))
    })
}

fn rejected(kind: FormKind, missing: MissingFields<'_>) -> PortalReply {
    let message = missing.message();
    info!("[PORTAL] Rejected {:?} form: {}", kind, message);
    PortalReply::page(HttpResponse::text(kind.missing_status(), message))
}

/// Socket side of the portal
#[allow(async_fn_in_trait)]
pub trait PortalIo {
    /// Address a DNS reply goes back to
    type Peer: Copy;

    /// Take one pending DNS query, if any
    async fn poll_dns(&mut self, buf: &mut [u8]) -> Result<Option<(usize, Self::Peer)>, BoardError>;

    async fn send_dns(&mut self, peer: Self::Peer, reply: &[u8]) -> Result<(), BoardError>;

    /// Take one complete HTTP request, if any
    async fn poll_request(&mut self, buf: &mut [u8]) -> Result<Option<usize>, BoardError>;

    /// Answer the request returned by the last `poll_request` and close it
    async fn respond(&mut self, response: &[u8]) -> Result<(), BoardError>;
}

/// How `serve` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalCompletion {
    /// A valid form is persisted; the node must restart
    Submitted,
}

pub struct ProvisioningPortal {
    kind: FormKind,
    ip: [u8; 4],
    poll_interval: Duration,
    deadline: Option<Duration>,
}

impl ProvisioningPortal {
    pub fn new(kind: FormKind, config: &config::SyncConfig) -> Self {
        Self {
            kind,
            ip: config.portal_ip,
            poll_interval: config.poll_interval,
            deadline: config.portal_deadline,
        }
    }

    /// Pump DNS and HTTP until a valid submission is persisted
    pub async fn serve<S, IO>(
        &self,
        store: &mut RecordStore<S>,
        io: &mut IO,
    ) -> Result<PortalCompletion, BoardError>
    where
        S: RecordStorage,
        IO: PortalIo,
    {
        info!("[PORTAL] Serving {:?} form on {}", self.kind, self.kind.path());

        let started = Instant::now();
        let mut query = [0u8; DNS_BUFFER_SIZE];
        let mut answer = [0u8; DNS_BUFFER_SIZE];
        let mut request = alloc::vec![0u8; REQUEST_BUFFER_SIZE];

        loop {
            if let Some(deadline) = self.deadline {
                if started.elapsed() >= deadline {
                    warn!("[PORTAL] No submission within {}s", deadline.as_secs());
                    return Err(BoardError::Timeout);
                }
            }

            match io.poll_dns(&mut query).await {
                Ok(Some((len, peer))) => {
                    if let Some(reply_len) =
                        dns::captive_reply(&query[..len], self.ip, config::DNS_TTL_SECS, &mut answer)
                    {
                        if let Some(name) = dns::query_name(&query[..len]) {
                            debug!("[DNS] {} -> portal", name);
                        }
                        if let Err(e) = io.send_dns(peer, &answer[..reply_len]).await {
                            warn!("[DNS] Failed to send reply: {}", e);
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("[DNS] Receive error: {}", e),
            }

            match io.poll_request(&mut request).await {
                Ok(Some(len)) => {
                    let reply = match HttpRequest::parse(&request[..len]) {
                        Ok(parsed) => handle(self.kind, store, &parsed),
                        Err(_) => PortalReply::page(HttpResponse::text(400, "Bad request")),
                    };
                    if let Err(e) = io.respond(&reply.response.to_bytes()).await {
                        warn!("[PORTAL] Failed to send response: {}", e);
                    }
                    if reply.submitted {
                        return Ok(PortalCompletion::Submitted);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("[PORTAL] Receive error: {}", e),
            }

            Timer::after(self.poll_interval).await;
        }
    }
}
