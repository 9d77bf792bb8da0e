use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hal::AnalogSource;

/// Linear correction applied to the RMS magnitude of a current channel:
/// `amps = rms_raw * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    pub scale: f32,
    pub offset: f32,
}

impl CalibrationParams {
    pub const fn new(scale: f32, offset: f32) -> Self {
        Self { scale, offset }
    }

    pub fn apply(&self, rms_raw: f32) -> f32 {
        rms_raw * self.scale + self.offset
    }
}

/// DC level of a current sensor output with no load connected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelBias {
    pub learned_offset: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CalibrationError {
    #[error("bias calibration needs at least one sample")]
    NoSamples,
    #[error("all {attempted} calibration samples failed to read")]
    AllSamplesFailed { attempted: u32 },
}

impl ChannelBias {
    /// Averages `sample_count` raw samples taken back to back.
    ///
    /// The caller guarantees the channel carries no load. Failed reads are
    /// skipped; the mean is taken over the samples that succeeded.
    pub fn learn<S: AnalogSource>(
        source: &mut S,
        sample_count: u32,
    ) -> Result<Self, CalibrationError> {
        if sample_count == 0 {
            return Err(CalibrationError::NoSamples);
        }

        let mut sum = 0_f64;
        let mut taken = 0_u32;
        for _ in 0..sample_count {
            if let Ok(raw) = source.sample() {
                sum += f64::from(raw);
                taken += 1;
            }
        }

        if taken == 0 {
            return Err(CalibrationError::AllSamplesFailed {
                attempted: sample_count,
            });
        }

        Ok(Self {
            learned_offset: (sum / f64::from(taken)) as f32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedAnalog;

    #[test]
    fn learns_mean_of_zero_load_samples() {
        let mut source = ScriptedAnalog::new(vec![2046, 2050, 2047, 2049]);
        let bias = ChannelBias::learn(&mut source, 4).unwrap();
        assert!((bias.learned_offset - 2048.0).abs() < 1e-3);
    }

    #[test]
    fn learning_twice_on_same_input_is_idempotent() {
        let samples = vec![2040, 2052, 2049, 2051, 2046];
        let first = ChannelBias::learn(&mut ScriptedAnalog::new(samples.clone()), 5).unwrap();
        let second = ChannelBias::learn(&mut ScriptedAnalog::new(samples), 5).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn zero_sample_count_is_rejected() {
        let mut source = ScriptedAnalog::new(vec![2048]);
        assert_eq!(
            ChannelBias::learn(&mut source, 0),
            Err(CalibrationError::NoSamples)
        );
    }

    #[test]
    fn failed_reads_are_skipped() {
        let mut source = ScriptedAnalog::with_failures(vec![Some(2000), None, Some(2100)]);
        let bias = ChannelBias::learn(&mut source, 3).unwrap();
        assert!((bias.learned_offset - 2050.0).abs() < 1e-3);
    }

    #[test]
    fn all_failed_reads_are_an_error() {
        let mut source = ScriptedAnalog::with_failures(vec![None, None]);
        assert_eq!(
            ChannelBias::learn(&mut source, 2),
            Err(CalibrationError::AllSamplesFailed { attempted: 2 })
        );
    }

    #[test]
    fn params_apply_to_rms_magnitude() {
        let params = CalibrationParams::new(0.5, -1.0);
        assert!((params.apply(10.0) - 4.0).abs() < 1e-6);
    }
}
