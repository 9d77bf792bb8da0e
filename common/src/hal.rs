//! Board collaborators consumed by the meter core.
//!
//! Each backend (ESP32, host simulator, tests) supplies one implementation of
//! every trait and bundles them through [`Board`].

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::{
    transport::HttpExchange,
    types::{ButtonEvent, RelayId},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HardwareError {
    #[error("adc read failed: {0}")]
    Adc(String),
    #[error("gpio write failed: {0}")]
    Gpio(String),
    #[error("wifi driver error: {0}")]
    Wifi(String),
}

/// One analog input, read as raw ADC counts.
pub trait AnalogSource {
    fn sample(&mut self) -> Result<u16, HardwareError>;
}

/// Physical relay outputs.
pub trait RelayOutput {
    fn set(&mut self, relay: RelayId, on: bool) -> Result<(), HardwareError>;
    fn get(&self, relay: RelayId) -> bool;
}

/// Decoded remote-control presses. Must not block.
pub trait ButtonSource {
    fn poll(&mut self) -> Option<ButtonEvent>;
}

pub trait Display {
    fn show(&mut self, current1: f32, current2: f32, total: f32);
}

/// Station-mode WiFi below the connect/maintain contract.
pub trait WifiLink {
    /// Starts (or restarts) association. Returns once the request is issued.
    fn start_association(&mut self) -> Result<(), HardwareError>;
    fn disconnect(&mut self);
    fn is_associated(&self) -> bool;

    fn ip_addr(&self) -> Option<Ipv4Addr> {
        None
    }

    fn rssi(&self) -> Option<i8> {
        None
    }
}

/// Monotonic milliseconds plus a blocking delay, used only at boot.
pub trait Clock {
    fn now_ms(&self) -> u64;
    fn delay_ms(&mut self, ms: u64);
}

pub trait Board {
    type Analog: AnalogSource;
    type Relays: RelayOutput;
    type Buttons: ButtonSource;
    type Display: Display;
    type Wifi: WifiLink;
    type Http: HttpExchange;
    type Clock: Clock;
}

/// Concrete collaborators handed to [`crate::Meter::boot`].
pub struct BoardParts<B: Board> {
    pub voltage: B::Analog,
    pub currents: [B::Analog; crate::config::CURRENT_CHANNELS],
    pub relays: B::Relays,
    pub buttons: B::Buttons,
    pub display: B::Display,
    pub wifi: B::Wifi,
    pub http: B::Http,
    pub clock: B::Clock,
}
