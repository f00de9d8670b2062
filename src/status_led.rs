//! Status LED
//!
//! One addressable pixel shows which provisioning stage the node is in.

use smart_leds::RGB8;

/// LED status states for visual feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedStatus {
    Starting,
    /// Loading or collecting WiFi credentials
    WiFiSync,
    /// Loading or collecting the user identity
    IdentitySync,
    /// Access point and portal are up, waiting for the user
    PortalActive,
    /// Waiting for the broker reply
    BrokerSync,
    Synced,
    Restarting,
    Error,
}

/// Sink for stage changes
pub trait StatusIndicator {
    fn set_status(&mut self, status: LedStatus);
}

/// Default brightness, out of 255
pub const BRIGHTNESS: u8 = 32;

pub fn color(status: LedStatus) -> RGB8 {
    match status {
        LedStatus::Starting => RGB8::new(255, 255, 255),
        LedStatus::WiFiSync => RGB8::new(0, 0, 255),
        LedStatus::IdentitySync => RGB8::new(0, 255, 255),
        LedStatus::PortalActive => RGB8::new(255, 160, 0),
        LedStatus::BrokerSync => RGB8::new(160, 0, 255),
        LedStatus::Synced => RGB8::new(0, 255, 0),
        LedStatus::Restarting => RGB8::new(255, 255, 0),
        LedStatus::Error => RGB8::new(255, 0, 0),
    }
}

/// Colour scaled to the status brightness
pub fn dimmed(status: LedStatus) -> RGB8 {
    let c = color(status);
    let scale = |v: u8| ((v as u16 * BRIGHTNESS as u16) / 255) as u8;
    RGB8::new(scale(c.r), scale(c.g), scale(c.b))
}

/// WS2812 driver on an RMT channel
#[cfg(target_arch = "riscv32")]
pub mod driver {
    use super::{LedStatus, StatusIndicator, dimmed};
    use crate::BoardError;
    use alloc::vec::Vec;
    use esp_hal::gpio::Level;
    use esp_hal::rmt::{PulseCode, TxChannel};
    use log::warn;
    use smart_leds::{RGB8, SmartLedsWrite};

    /// Drives a strip of WS2812 pixels, GRB order, with a 10 MHz RMT clock
    pub struct Ws2812<TX: TxChannel> {
        channel: Option<TX>,
    }

    impl<TX: TxChannel> Ws2812<TX> {
        pub fn new(channel: TX) -> Self {
            Self {
                channel: Some(channel),
            }
        }

        fn transmit(&mut self, pulses: &[u32]) -> Result<(), BoardError> {
            let channel = self.channel.take().ok_or(BoardError::IoError)?;
            let transaction = channel.transmit(pulses).map_err(|_| BoardError::IoError)?;
            match transaction.wait() {
                Ok(channel) => {
                    self.channel = Some(channel);
                    Ok(())
                }
                // The frame usually lands even when the wait reports an error
                Err((_, channel)) => {
                    self.channel = Some(channel);
                    Ok(())
                }
            }
        }
    }

    impl<TX: TxChannel> SmartLedsWrite for Ws2812<TX> {
        type Error = BoardError;
        type Color = RGB8;

        fn write<T, I>(&mut self, iterator: T) -> Result<(), Self::Error>
        where
            T: IntoIterator<Item = I>,
            I: Into<Self::Color>,
        {
            let mut pulses = Vec::new();
            for pixel in iterator {
                let pixel: RGB8 = pixel.into();
                for byte in [pixel.g, pixel.r, pixel.b] {
                    pulses.extend_from_slice(&byte_to_pulses(byte));
                }
            }
            // Latch
            pulses.push(PulseCode::new(Level::Low, 800, Level::Low, 0));
            self.transmit(&pulses)
        }
    }

    /// 1-bit = 6 high + 6 low ticks, 0-bit = 3 high + 9 low ticks at 10 MHz
    fn byte_to_pulses(byte: u8) -> [u32; 8] {
        let mut pulses = [0u32; 8];
        for (i, pulse) in pulses.iter_mut().enumerate() {
            *pulse = if (byte >> (7 - i)) & 1 == 1 {
                PulseCode::new(Level::High, 6, Level::Low, 6)
            } else {
                PulseCode::new(Level::High, 3, Level::Low, 9)
            };
        }
        pulses
    }

    /// Single status pixel
    pub struct PixelIndicator<TX: TxChannel> {
        strip: Ws2812<TX>,
        status: Option<LedStatus>,
    }

    impl<TX: TxChannel> PixelIndicator<TX> {
        pub fn new(channel: TX) -> Self {
            Self {
                strip: Ws2812::new(channel),
                status: None,
            }
        }
    }

    impl<TX: TxChannel> StatusIndicator for PixelIndicator<TX> {
        fn set_status(&mut self, status: LedStatus) {
            if self.status == Some(status) {
                return;
            }
            self.status = Some(status);
            if let Err(e) = self.strip.write([dimmed(status)]) {
                warn!("[LED] Failed to update status pixel: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_status_has_a_distinct_colour() {
        let all = [
            LedStatus::Starting,
            LedStatus::WiFiSync,
            LedStatus::IdentitySync,
            LedStatus::PortalActive,
            LedStatus::BrokerSync,
            LedStatus::Synced,
            LedStatus::Restarting,
            LedStatus::Error,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(color(*a), color(*b), "{:?} / {:?}", a, b);
            }
        }
    }

    #[test]
    fn dimming_scales_every_channel() {
        assert_eq!(dimmed(LedStatus::Error), RGB8::new(BRIGHTNESS, 0, 0));
        assert_eq!(dimmed(LedStatus::Synced), RGB8::new(0, BRIGHTNESS, 0));
    }
}
