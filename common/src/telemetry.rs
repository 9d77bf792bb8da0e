use serde::Serialize;

use crate::{config::CURRENT_CHANNELS, types::TelemetryReport};

/// The latest drained measurement window. `None` means the window held no
/// samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Readings {
    pub voltage: Option<f32>,
    pub currents: [Option<f32>; CURRENT_CHANNELS],
}

impl Readings {
    pub fn current(&self, channel: usize) -> f32 {
        self.currents
            .get(channel)
            .copied()
            .flatten()
            .unwrap_or(0.0)
    }

    pub fn total_current(&self) -> f32 {
        (0..CURRENT_CHANNELS).map(|channel| self.current(channel)).sum()
    }

    /// Empty windows report as zero; power is apparent power `V * I`.
    pub fn report(&self) -> TelemetryReport {
        let voltage = self.voltage.unwrap_or(0.0);
        let current1 = self.current(0);
        let current2 = self.current(1);
        let current3 = self.current(2);
        let total_current = self.total_current();

        TelemetryReport {
            voltage,
            current1,
            current2,
            current3,
            total_current,
            power1: voltage * current1,
            power2: voltage * current2,
            total_power: voltage * total_current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn report_derives_totals_and_power() {
        let readings = Readings {
            voltage: Some(230.0),
            currents: [Some(1.0), Some(0.5), Some(0.25)],
        };

        assert_eq!(
            readings.report(),
            TelemetryReport {
                voltage: 230.0,
                current1: 1.0,
                current2: 0.5,
                current3: 0.25,
                total_current: 1.75,
                power1: 230.0,
                power2: 115.0,
                total_power: 402.5,
            }
        );
    }

    #[test]
    fn empty_windows_report_zero() {
        let readings = Readings {
            voltage: None,
            currents: [Some(2.0), None, None],
        };
        let report = readings.report();
        assert_eq!(report.voltage, 0.0);
        assert_eq!(report.current2, 0.0);
        assert_eq!(report.total_current, 2.0);
        assert_eq!(report.total_power, 0.0);
    }
}
