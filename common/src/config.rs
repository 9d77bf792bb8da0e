use serde::{Deserialize, Serialize};

use crate::{calibration::CalibrationParams, types::ButtonEvent, types::RelayId};

pub const CURRENT_CHANNELS: usize = 3;

/// Blocking server exchanges one tick can make: local push, telemetry, poll.
pub const MAX_EXCHANGES_PER_TICK: u64 = 3;
const MAX_HTTP_TIMEOUT_MS: u64 = 10_000;
const MIN_WATCHDOG_MS: u64 = 30_000;
const WATCHDOG_MARGIN_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    pub telemetry_interval_ms: u64,
    pub relay_poll_interval_ms: u64,
    pub display_refresh_ms: u64,
    pub http_timeout_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub wifi_connect_attempts: u32,
    pub wifi_retry_delay_ms: u64,
    pub loop_delay_ms: u64,
    pub push_state_on_boot: bool,
}

impl Default for MeterConfig {
    fn default() -> Self {
        Self {
            telemetry_interval_ms: 5_000,
            relay_poll_interval_ms: 3_000,
            display_refresh_ms: 1_000,
            http_timeout_ms: 5_000,
            reconnect_backoff_ms: 30_000,
            wifi_connect_attempts: 20,
            wifi_retry_delay_ms: 500,
            loop_delay_ms: 10,
            push_state_on_boot: true,
        }
    }
}

/// Mains voltage channel: fixed midpoint, fixed reference, one scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageCalibration {
    pub scale: f32,
    pub reference_volts: f32,
    pub adc_full_scale: u16,
}

impl Default for VoltageCalibration {
    fn default() -> Self {
        Self {
            scale: 234.26,
            reference_volts: 3.3,
            adc_full_scale: 4096,
        }
    }
}

impl VoltageCalibration {
    pub fn midpoint(&self) -> f32 {
        f32::from(self.adc_full_scale) / 2.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationConfig {
    pub voltage: VoltageCalibration,
    pub currents: [CalibrationParams; CURRENT_CHANNELS],
    pub bias_samples: u32,
    pub samples_per_update: u16,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            voltage: VoltageCalibration::default(),
            currents: [CalibrationParams::new(0.0111, -0.02); CURRENT_CHANNELS],
            bias_samples: 1_000,
            samples_per_update: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub server_url: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            server_url: "http://192.168.1.100:5000".to_string(),
        }
    }
}

/// NEC command byte for each remote button.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IrButtonMap {
    pub toggle_relay1: u8,
    pub toggle_relay2: u8,
    pub all_on: u8,
    pub all_off: u8,
}

impl Default for IrButtonMap {
    fn default() -> Self {
        Self {
            toggle_relay1: 0x0C,
            toggle_relay2: 0x18,
            all_on: 0x45,
            all_off: 0x47,
        }
    }
}

impl IrButtonMap {
    pub fn lookup(&self, command: u8) -> Option<ButtonEvent> {
        if command == self.toggle_relay1 {
            Some(ButtonEvent::Toggle(RelayId::Relay1))
        } else if command == self.toggle_relay2 {
            Some(ButtonEvent::Toggle(RelayId::Relay2))
        } else if command == self.all_on {
            Some(ButtonEvent::AllOn)
        } else if command == self.all_off {
            Some(ButtonEvent::AllOff)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardwareConfig {
    pub relay_pins: [i32; 2],
    pub relay_active_low: bool,
    pub ir_rx_pin: i32,
    pub rmt_channel: u8,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            relay_pins: [26, 27],
            relay_active_low: false,
            ir_rx_pin: 15,
            rmt_channel: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub meter: MeterConfig,
    pub calibration: CalibrationConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub ir: IrButtonMap,
    #[serde(default)]
    pub hardware: HardwareConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.meter.sanitize();
        self.calibration.sanitize();
        self.hardware.sanitize();
    }
}

impl MeterConfig {
    pub fn sanitize(&mut self) {
        self.telemetry_interval_ms = self.telemetry_interval_ms.clamp(1_000, 3_600_000);
        self.relay_poll_interval_ms = self.relay_poll_interval_ms.clamp(500, 600_000);
        self.display_refresh_ms = self.display_refresh_ms.clamp(100, 60_000);
        self.http_timeout_ms = self.http_timeout_ms.clamp(500, MAX_HTTP_TIMEOUT_MS);
        self.reconnect_backoff_ms = self.reconnect_backoff_ms.clamp(1_000, 600_000);
        self.wifi_connect_attempts = self.wifi_connect_attempts.clamp(1, 100);
        self.wifi_retry_delay_ms = self.wifi_retry_delay_ms.clamp(50, 10_000);
        self.loop_delay_ms = self.loop_delay_ms.min(1_000);
    }

    /// Longest one tick can block when every exchange runs into its timeout.
    pub fn worst_case_tick_ms(&self) -> u64 {
        self.http_timeout_ms
            .saturating_mul(MAX_EXCHANGES_PER_TICK)
            .saturating_add(self.loop_delay_ms)
    }

    /// Task watchdog period, long enough that a tick stalled on an
    /// unresponsive server never trips it.
    pub fn watchdog_timeout_sec(&self) -> u32 {
        let budget_ms = self
            .worst_case_tick_ms()
            .saturating_add(WATCHDOG_MARGIN_MS)
            .max(MIN_WATCHDOG_MS);
        u32::try_from(budget_ms.div_ceil(1_000)).unwrap_or(u32::MAX)
    }
}

impl CalibrationConfig {
    pub fn sanitize(&mut self) {
        if self.bias_samples == 0 {
            self.bias_samples = 1_000;
        }
        if self.samples_per_update == 0 {
            self.samples_per_update = 1;
        }
        if self.voltage.adc_full_scale == 0 {
            self.voltage.adc_full_scale = 4096;
        }
        if !self.voltage.reference_volts.is_finite() || self.voltage.reference_volts <= 0.0 {
            self.voltage.reference_volts = 3.3;
        }
    }
}

impl HardwareConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        for (pin, default) in self.relay_pins.iter_mut().zip(defaults.relay_pins) {
            if *pin < 0 {
                *pin = default;
            }
        }
        if self.ir_rx_pin < 0 {
            self.ir_rx_pin = defaults.ir_rx_pin;
        }
        if self.rmt_channel > 7 {
            self.rmt_channel = defaults.rmt_channel;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_clamps_intervals_and_zero_counts() {
        let mut runtime = RuntimeConfig::default();
        runtime.meter.relay_poll_interval_ms = 0;
        runtime.meter.wifi_connect_attempts = 0;
        runtime.calibration.bias_samples = 0;
        runtime.calibration.samples_per_update = 0;
        runtime.hardware.rmt_channel = 9;

        runtime.sanitize();

        assert_eq!(runtime.meter.relay_poll_interval_ms, 500);
        assert_eq!(runtime.meter.wifi_connect_attempts, 1);
        assert_eq!(runtime.calibration.bias_samples, 1_000);
        assert_eq!(runtime.calibration.samples_per_update, 1);
        assert_eq!(runtime.hardware.rmt_channel, 2);
    }

    #[test]
    fn stalled_tick_fits_watchdog_budget() {
        let mut meter = MeterConfig::default();
        assert_eq!(meter.watchdog_timeout_sec(), 30);

        meter.http_timeout_ms = 120_000;
        meter.loop_delay_ms = 5_000;
        meter.sanitize();

        assert_eq!(meter.http_timeout_ms, MAX_HTTP_TIMEOUT_MS);
        let watchdog_ms = u64::from(meter.watchdog_timeout_sec()) * 1_000;
        assert!(watchdog_ms > meter.worst_case_tick_ms());
        assert_eq!(meter.watchdog_timeout_sec(), 41);
    }

    #[test]
    fn runtime_without_optional_sections_deserializes() {
        let raw = serde_json::to_value(RuntimeConfig::default()).unwrap();
        let mut object = raw.as_object().unwrap().clone();
        object.remove("ir");
        object.remove("hardware");

        let parsed: RuntimeConfig = serde_json::from_value(object.into()).unwrap();

        assert_eq!(parsed.ir, IrButtonMap::default());
        assert_eq!(parsed.hardware, HardwareConfig::default());
    }

    #[test]
    fn button_map_lookup() {
        let map = IrButtonMap::default();
        assert_eq!(
            map.lookup(0x18),
            Some(ButtonEvent::Toggle(RelayId::Relay2))
        );
        assert_eq!(map.lookup(0x47), Some(ButtonEvent::AllOff));
        assert_eq!(map.lookup(0x00), None);
    }
}
