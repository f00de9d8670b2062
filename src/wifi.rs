//! WiFi module for ESP32-C3 board
//!
//! Switches the radio between the provisioning access point and station mode
//! using esp-wifi 0.14.1, with the station address obtained through
//! embassy-net DHCP.

use crate::records::WifiCredentials;
use crate::sync::WifiLink;
use crate::{BoardError, config};
use embassy_net::Stack;
use embassy_time::{Duration, Instant, Timer, with_timeout};
use esp_wifi::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, WifiController,
};
use log::{info, warn};

/// WiFi manager owning the radio controller
pub struct WiFiManager<'a> {
    controller: WifiController<'a>,
    sta_stack: Stack<'a>,
    ap_ssid: &'static str,
}

impl<'a> WiFiManager<'a> {
    pub fn new(controller: WifiController<'a>, sta_stack: Stack<'a>) -> Self {
        Self {
            controller,
            sta_stack,
            ap_ssid: config::PORTAL_AP_SSID,
        }
    }

    async fn restart_with(&mut self, configuration: &Configuration) -> Result<(), BoardError> {
        if self.controller.is_started().unwrap_or(false) {
            self.controller
                .stop_async()
                .await
                .map_err(|_| BoardError::WiFiError)?;
        }
        self.controller
            .set_configuration(configuration)
            .map_err(|_| BoardError::WiFiError)?;
        self.controller
            .start_async()
            .await
            .map_err(|_| BoardError::WiFiError)
    }

    /// Wait until DHCP hands out an address
    async fn wait_for_address(&self, deadline: Instant) -> Result<[u8; 4], BoardError> {
        loop {
            if let Some(config) = self.sta_stack.config_v4() {
                return Ok(config.address.address().octets());
            }
            if Instant::now() >= deadline {
                warn!("[DHCP] No address before the connect timeout");
                return Err(BoardError::WiFiError);
            }
            Timer::after(Duration::from_millis(config::POLL_INTERVAL_MS * 10)).await;
        }
    }
}

impl WifiLink for WiFiManager<'_> {
    async fn start_access_point(&mut self) -> Result<(), BoardError> {
        info!("[WIFI] Starting access point \"{}\"", self.ap_ssid);

        let ap_config = AccessPointConfiguration {
            ssid: self.ap_ssid.try_into().map_err(|_| BoardError::WiFiError)?,
            auth_method: AuthMethod::None,
            ..Default::default()
        };
        self.restart_with(&Configuration::AccessPoint(ap_config))
            .await?;

        let [a, b, c, d] = config::PORTAL_IP;
        info!("[WIFI] Access point up, portal at http://{}.{}.{}.{}/", a, b, c, d);
        Ok(())
    }

    async fn connect(&mut self, credentials: &WifiCredentials) -> Result<(), BoardError> {
        info!("[WIFI] Connecting to WiFi network: {}", credentials.ssid);

        let client_config = ClientConfiguration {
            ssid: credentials
                .ssid
                .as_str()
                .try_into()
                .map_err(|_| BoardError::WiFiError)?,
            password: credentials
                .password
                .as_str()
                .try_into()
                .map_err(|_| BoardError::WiFiError)?,
            auth_method: AuthMethod::WPA2Personal,
            ..Default::default()
        };
        self.restart_with(&Configuration::Client(client_config))
            .await?;

        let timeout = Duration::from_millis(config::WIFI_CONNECT_TIMEOUT_MS);
        let deadline = Instant::now() + timeout;
        match with_timeout(timeout, self.controller.connect_async()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("[WIFI] Failed to connect: {:?}", e);
                return Err(BoardError::WiFiError);
            }
            Err(_) => {
                warn!("[WIFI] Failed to connect within {}ms", timeout.as_millis());
                return Err(BoardError::WiFiError);
            }
        }

        let [a, b, c, d] = self.wait_for_address(deadline).await?;
        info!("[WIFI] Connected, DHCP address {}.{}.{}.{}", a, b, c, d);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.controller.is_connected().unwrap_or(false) && self.sta_stack.is_config_up()
    }
}
