#![cfg_attr(not(test), no_std)]

//! ESP32-C3 Soil Sensor Node Provisioning Library
//!
//! This library provides the modules that bring a soil sensor node from a blank
//! flash to a fully bound device: WiFi credentials and the user identity are
//! collected through a captive portal, then exchanged for per-sensor credentials
//! over an MQTT round-trip. Every stage is persisted so later boots skip it.

extern crate alloc;

pub mod broker;
pub mod correlation;
pub mod dns;
pub mod guard;
pub mod payload;
pub mod portal;
pub mod records;
pub mod state_machine;
pub mod status_led;
pub mod store;
pub mod sync;
pub mod sync_step;

#[cfg(target_arch = "riscv32")]
pub mod dns_server;
#[cfg(target_arch = "riscv32")]
pub mod flash_store;
#[cfg(target_arch = "riscv32")]
pub mod http_server;
#[cfg(target_arch = "riscv32")]
pub mod mqtt;
#[cfg(target_arch = "riscv32")]
pub mod wifi;

#[cfg(test)]
mod testing;

/// Project version information
pub const VERSION: &str = "0.1.0-dev";

/// Default configuration constants
pub mod config {
    use embassy_time::Duration;

    /// Access point name shown while the captive portal is running
    /// Read from environment variables at compile time
    pub const PORTAL_AP_SSID: &str = env!("PORTAL_AP_SSID");

    /// Address of the device on its own access point (also the DNS answer)
    pub const PORTAL_IP: [u8; 4] = [192, 168, 1, 1];

    /// Prefix length of the access point network (255.255.255.0)
    pub const PORTAL_PREFIX_LEN: u8 = 24;

    /// Captive DNS port
    pub const DNS_PORT: u16 = 53;

    /// TTL of the captive DNS answers
    pub const DNS_TTL_SECS: u32 = 60;

    /// Portal HTTP port
    pub const HTTP_PORT: u16 = 80;

    /// GPIO driving the status pixel (on-board WS2812 of the C3 devkit)
    pub const LED_DATA_PIN: u8 = 8;

    /// MQTT broker used for the credential round-trip
    pub const BROKER_HOST: &str = env!("BROKER_HOST");
    pub const BROKER_PORT: &str = env!("BROKER_PORT");

    /// Topic the identity payload is published to
    pub const SYNC_TOPIC: &str = env!("SYNC_TOPIC");

    /// 0 means no deadline
    pub const BROKER_TIMEOUT_SECS: &str = env!("BROKER_TIMEOUT_SECS");
    pub const PORTAL_TIMEOUT_SECS: &str = env!("PORTAL_TIMEOUT_SECS");

    pub const ACCEPT_EMPTY_CREDENTIALS: &str = env!("ACCEPT_EMPTY_CREDENTIALS");

    /// Cadence of every cooperative polling loop
    pub const POLL_INTERVAL_MS: u64 = 10;

    /// Delay between broker connection attempts
    pub const RECONNECT_DELAY_MS: u64 = 1000;

    /// WiFi connection timeout in milliseconds
    pub const WIFI_CONNECT_TIMEOUT_MS: u64 = 10000;

    /// MQTT keep-alive in seconds
    pub const MQTT_KEEP_ALIVE_SECS: u16 = 60;

    /// Flash offset of the record region (one 4 KiB sector per record)
    pub const FLASH_RECORD_BASE: u32 = 0x3F_0000;

    /// Delay before resetting after an unrecoverable sync failure
    pub const FAILURE_RESET_DELAY_MS: u64 = 30_000;

    /// What to do when the broker binds zero sensors to the device
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum EmptyCredentialPolicy {
        /// Treat zero bindings as a rejected identity: clear it and ask again
        Reject,
        /// Persist the empty set and finish
        Accept,
    }

    /// Runtime view of the configuration consumed by the sync orchestrator
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncConfig {
        pub poll_interval: Duration,
        pub reconnect_delay: Duration,
        /// `None` waits for the broker reply forever
        pub broker_deadline: Option<Duration>,
        /// `None` keeps the portal up until a valid submission
        pub portal_deadline: Option<Duration>,
        pub sync_topic: &'static str,
        pub portal_ip: [u8; 4],
        pub empty_credentials: EmptyCredentialPolicy,
    }

    impl SyncConfig {
        /// Build the configuration from the values baked in by `build.rs`
        pub fn from_build_env() -> Self {
            Self {
                poll_interval: Duration::from_millis(POLL_INTERVAL_MS),
                reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
                broker_deadline: parse_deadline(BROKER_TIMEOUT_SECS),
                portal_deadline: parse_deadline(PORTAL_TIMEOUT_SECS),
                sync_topic: SYNC_TOPIC,
                portal_ip: PORTAL_IP,
                empty_credentials: parse_policy(ACCEPT_EMPTY_CREDENTIALS),
            }
        }
    }

    impl Default for SyncConfig {
        fn default() -> Self {
            Self::from_build_env()
        }
    }

    /// Broker port, falling back to the MQTT default on a bad value
    pub fn broker_port() -> u16 {
        BROKER_PORT.parse().unwrap_or(1883)
    }

    fn parse_deadline(secs: &str) -> Option<Duration> {
        match secs.trim().parse::<u64>() {
            Ok(0) | Err(_) => None,
            Ok(secs) => Some(Duration::from_secs(secs)),
        }
    }

    fn parse_policy(value: &str) -> EmptyCredentialPolicy {
        if value.trim().eq_ignore_ascii_case("true") {
            EmptyCredentialPolicy::Accept
        } else {
            EmptyCredentialPolicy::Reject
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn zero_or_garbage_timeout_means_no_deadline() {
            assert_eq!(parse_deadline("0"), None);
            assert_eq!(parse_deadline("soon"), None);
            assert_eq!(parse_deadline(" 30 "), Some(Duration::from_secs(30)));
        }

        #[test]
        fn empty_credentials_are_rejected_unless_enabled() {
            assert_eq!(parse_policy("false"), EmptyCredentialPolicy::Reject);
            assert_eq!(parse_policy(""), EmptyCredentialPolicy::Reject);
            assert_eq!(parse_policy("TRUE"), EmptyCredentialPolicy::Accept);
        }
    }
}

/// Error types for the provisioning flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardError {
    /// Record absent
    NotFound,
    /// Storage could not be opened, read or written
    IoError,
    /// Wrong field count or malformed delimiters
    StructuralParseError,
    /// Broker response failed the `success=true` gate
    InvalidPayload,
    /// Well-formed broker response with zero bindings
    Empty,
    /// WiFi or broker not connected
    TransportUnavailable,
    /// Create on a record that already has content
    AlreadyExists,
    /// A configured deadline elapsed
    Timeout,
    /// WiFi driver error
    WiFiError,
    /// Portal socket error
    PortalError,
}

impl core::fmt::Display for BoardError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            BoardError::NotFound => "record not found",
            BoardError::IoError => "storage i/o failure",
            BoardError::StructuralParseError => "malformed record or payload",
            BoardError::InvalidPayload => "broker rejected the request",
            BoardError::Empty => "broker returned no sensor bindings",
            BoardError::TransportUnavailable => "transport unavailable",
            BoardError::AlreadyExists => "record already exists",
            BoardError::Timeout => "deadline elapsed",
            BoardError::WiFiError => "wifi driver error",
            BoardError::PortalError => "portal socket error",
        };
        f.write_str(text)
    }
}
