use crate::{
    calibration::{CalibrationError, CalibrationParams, ChannelBias},
    config::VoltageCalibration,
    hal::AnalogSource,
};

/// Running sum of squared deviations for one measurement window.
#[derive(Debug, Clone, Copy, Default)]
pub struct RmsAccumulator {
    sum_of_squares: f64,
    count: u64,
}

impl RmsAccumulator {
    pub fn push(&mut self, deviation: f32) {
        let d = f64::from(deviation);
        self.sum_of_squares += d * d;
        self.count = self.count.saturating_add(1);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Returns the RMS of the window and starts a new one. `None` when no
    /// sample arrived since the last drain.
    pub fn drain(&mut self) -> Option<f32> {
        let window = std::mem::take(self);
        if window.count == 0 {
            return None;
        }
        Some((window.sum_of_squares / window.count as f64).sqrt() as f32)
    }
}

/// A current channel. Only obtainable through [`CurrentSampler::calibrate`],
/// so a reading is never taken against an unlearned bias.
#[derive(Debug)]
pub struct CurrentSampler<S> {
    source: S,
    params: CalibrationParams,
    bias: ChannelBias,
    samples_per_update: u16,
    accumulator: RmsAccumulator,
    failed_reads: u64,
}

impl<S: AnalogSource> CurrentSampler<S> {
    pub fn calibrate(
        mut source: S,
        params: CalibrationParams,
        bias_samples: u32,
        samples_per_update: u16,
    ) -> Result<Self, CalibrationError> {
        let bias = ChannelBias::learn(&mut source, bias_samples)?;
        Ok(Self {
            source,
            params,
            bias,
            samples_per_update: samples_per_update.max(1),
            accumulator: RmsAccumulator::default(),
            failed_reads: 0,
        })
    }

    /// Samples a fresh bias without installing it.
    pub fn learn_bias(&mut self, bias_samples: u32) -> Result<ChannelBias, CalibrationError> {
        ChannelBias::learn(&mut self.source, bias_samples)
    }

    /// Installs `bias` and discards the current window.
    pub fn set_bias(&mut self, bias: ChannelBias) {
        self.bias = bias;
        self.accumulator = RmsAccumulator::default();
    }

    pub fn bias(&self) -> ChannelBias {
        self.bias
    }

    pub fn params(&self) -> CalibrationParams {
        self.params
    }

    pub fn failed_reads(&self) -> u64 {
        self.failed_reads
    }

    pub fn pending_samples(&self) -> u64 {
        self.accumulator.count()
    }

    pub fn update(&mut self) {
        for _ in 0..self.samples_per_update {
            match self.source.sample() {
                Ok(raw) => self
                    .accumulator
                    .push(f32::from(raw) - self.bias.learned_offset),
                Err(_) => self.failed_reads = self.failed_reads.saturating_add(1),
            }
        }
    }

    /// Calibrated RMS amperes of the window since the previous read.
    ///
    /// Negative values are returned as-is; they indicate a calibration
    /// offset that does not match the sensor.
    pub fn read_amps(&mut self) -> Option<f32> {
        self.accumulator
            .drain()
            .map(|rms_raw| self.params.apply(rms_raw))
    }
}

/// Mains voltage channel. The sensor output is assumed symmetric around
/// the ADC midpoint, so there is no bias learning step.
#[derive(Debug)]
pub struct VoltageSampler<S> {
    source: S,
    calibration: VoltageCalibration,
    samples_per_update: u16,
    accumulator: RmsAccumulator,
    failed_reads: u64,
}

impl<S: AnalogSource> VoltageSampler<S> {
    pub fn new(source: S, calibration: VoltageCalibration, samples_per_update: u16) -> Self {
        Self {
            source,
            calibration,
            samples_per_update: samples_per_update.max(1),
            accumulator: RmsAccumulator::default(),
            failed_reads: 0,
        }
    }

    pub fn failed_reads(&self) -> u64 {
        self.failed_reads
    }

    pub fn update(&mut self) {
        let midpoint = self.calibration.midpoint();
        for _ in 0..self.samples_per_update {
            match self.source.sample() {
                Ok(raw) => self.accumulator.push(f32::from(raw) - midpoint),
                Err(_) => self.failed_reads = self.failed_reads.saturating_add(1),
            }
        }
    }

    pub fn read_volts(&mut self) -> Option<f32> {
        let calibration = self.calibration;
        self.accumulator.drain().map(|rms_counts| {
            let volts_at_pin =
                rms_counts * calibration.reference_volts / f32::from(calibration.adc_full_scale);
            volts_at_pin * calibration.scale
        })
    }
}
