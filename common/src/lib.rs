//! Platform-independent core of the energy meter firmware.

pub mod cadence;
pub mod calibration;
pub mod config;
pub mod connectivity;
pub mod display;
pub mod endpoints;
pub mod hal;
pub mod ir;
pub mod local_control;
pub mod meter;
pub mod relay;
pub mod sampler;
pub mod sync;
pub mod telemetry;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use calibration::{CalibrationError, CalibrationParams};
pub use config::{MeterConfig, RuntimeConfig};
pub use hal::{Board, BoardParts, HardwareError};
pub use meter::{Meter, MeterStatus, TickReport};
pub use sync::{PollOutcome, PushOutcome, ReportOutcome, SyncStats};
pub use telemetry::Readings;
pub use transport::{HttpExchange, HttpRequest, HttpResponse, Method, TransportError};
pub use types::{ButtonEvent, RelayId, RelayState, TelemetryReport};
