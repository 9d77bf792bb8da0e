//! The meter application context and its cooperative control loop.
//!
//! One tick runs, in order: connectivity maintenance, the local button
//! check and its push, sampler advancement, then whichever of display
//! refresh, telemetry report and relay poll are due. A button change is
//! therefore pushed before a poll in the same tick can observe it.

use std::time::Duration;

use log::{info, warn};
use serde::Serialize;

use crate::{
    cadence::SyncClock,
    calibration::{CalibrationError, CalibrationParams},
    config::{CalibrationConfig, MeterConfig, RuntimeConfig, CURRENT_CHANNELS},
    connectivity::Connectivity,
    hal::{AnalogSource, Board, BoardParts, Clock, Display},
    local_control::LocalControl,
    relay::{on_off, RelayAuthority},
    sampler::{CurrentSampler, VoltageSampler},
    sync::{PollOutcome, PushOutcome, ReportOutcome, SyncEngine, SyncStats},
    telemetry::Readings,
    transport::ServerClient,
    types::RelayState,
};

/// What a single tick did. Empty fields mean the step did not run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub local_push: Option<PushOutcome>,
    pub displayed: bool,
    pub telemetry: Option<ReportOutcome>,
    pub poll: Option<PollOutcome>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MeterStatus {
    pub relays: RelayState,
    pub connected: bool,
    pub readings: Readings,
    pub stats: SyncStats,
    #[serde(rename = "reconnectAttempts")]
    pub reconnect_attempts: u64,
    #[serde(rename = "learnedOffsets")]
    pub learned_offsets: [f32; CURRENT_CHANNELS],
    #[serde(rename = "failedReads")]
    pub failed_reads: u64,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    pub ticks: u64,
}

pub struct Meter<B: Board> {
    config: MeterConfig,
    clock: B::Clock,
    voltage: VoltageSampler<B::Analog>,
    currents: [CurrentSampler<B::Analog>; CURRENT_CHANNELS],
    relays: RelayAuthority<B::Relays>,
    local: LocalControl<B::Buttons>,
    display: B::Display,
    link: Connectivity<B::Wifi>,
    server: ServerClient<B::Http>,
    sync: SyncEngine,
    cadences: SyncClock,
    readings: Readings,
    boot_ms: u64,
    ticks: u64,
}

impl<B: Board> Meter<B> {
    /// Brings the meter up: relay state from hardware, bias calibration of
    /// every current channel, bounded WiFi association, then an optional
    /// push of the boot relay state.
    ///
    /// The current inputs must carry no load while this runs. A channel
    /// whose calibration reads all fail aborts boot.
    pub fn boot(config: &RuntimeConfig, parts: BoardParts<B>) -> Result<Self, CalibrationError> {
        let BoardParts {
            voltage,
            currents,
            relays,
            buttons,
            display,
            wifi,
            http,
            mut clock,
        } = parts;
        let meter = config.meter.clone();
        let calibration = &config.calibration;

        let relays = RelayAuthority::from_hardware(relays);
        let boot_state = relays.state();
        info!(
            "boot relay state: R1={} R2={}",
            on_off(boot_state.relay1),
            on_off(boot_state.relay2)
        );

        info!(
            "calibrating {CURRENT_CHANNELS} current channels over {} samples, keep loads off",
            calibration.bias_samples
        );
        let [c1, c2, c3] = currents;
        let [p1, p2, p3] = calibration.currents;
        let currents = [
            calibrate_channel(1, c1, p1, calibration)?,
            calibrate_channel(2, c2, p2, calibration)?,
            calibrate_channel(3, c3, p3, calibration)?,
        ];

        let voltage =
            VoltageSampler::new(voltage, calibration.voltage, calibration.samples_per_update);

        let mut link = Connectivity::new(wifi, meter.reconnect_backoff_ms);
        link.begin(&mut clock, meter.wifi_connect_attempts, meter.wifi_retry_delay_ms);

        let mut server = ServerClient::new(http, Duration::from_millis(meter.http_timeout_ms));
        let mut sync = SyncEngine::new();
        if meter.push_state_on_boot && link.is_connected() {
            sync.push_boot_state(boot_state, &link, &mut server);
        }

        let boot_ms = clock.now_ms();
        Ok(Self {
            cadences: SyncClock::new(&meter, boot_ms),
            config: meter,
            clock,
            voltage,
            currents,
            relays,
            local: LocalControl::new(buttons),
            display,
            link,
            server,
            sync,
            readings: Readings::default(),
            boot_ms,
            ticks: 0,
        })
    }

    pub fn tick(&mut self) -> TickReport {
        let now_ms = self.clock.now_ms();
        self.ticks = self.ticks.wrapping_add(1);
        let mut report = TickReport::default();

        self.link.maintain(now_ms);

        if let Some(state) = self.local.poll(&mut self.relays) {
            let outcome = self
                .sync
                .push_local_change(state, &self.link, &mut self.server);
            report.local_push = Some(outcome);
        }

        self.voltage.update();
        for sampler in &mut self.currents {
            sampler.update();
        }

        if self.cadences.display.poll(now_ms) {
            self.refresh_readings();
            let current1 = self.readings.current(0);
            let current2 = self.readings.current(1);
            self.display
                .show(current1, current2, self.readings.total_current());
            report.displayed = true;
        }

        if self.cadences.telemetry.poll(now_ms) {
            let telemetry = self.readings.report();
            report.telemetry = Some(self.sync.report(&telemetry, &self.link, &mut self.server));
        }

        if self.cadences.relay_poll.poll(now_ms) {
            report.poll = Some(
                self.sync
                    .poll_remote(&mut self.relays, &self.link, &mut self.server),
            );
        }

        report
    }

    /// Sleeps for the configured idle time between ticks.
    pub fn idle(&mut self) {
        let delay = self.config.loop_delay_ms;
        if delay > 0 {
            self.clock.delay_ms(delay);
        }
    }

    /// Relearns every current channel bias. Loads must be off.
    ///
    /// All channels are learned before any is installed; if one fails, every
    /// channel keeps its previous bias and pending window.
    pub fn recalibrate(&mut self, bias_samples: u32) -> Result<(), CalibrationError> {
        let mut learned = Vec::with_capacity(CURRENT_CHANNELS);
        for (channel, sampler) in self.currents.iter_mut().enumerate() {
            let bias = sampler.learn_bias(bias_samples).inspect_err(|err| {
                warn!(
                    "current channel {} recalibration failed, keeping previous biases: {err}",
                    channel + 1
                )
            })?;
            learned.push(bias);
        }

        for (channel, (sampler, bias)) in self.currents.iter_mut().zip(learned).enumerate() {
            sampler.set_bias(bias);
            info!(
                "current channel {} recalibrated, bias {:.1}",
                channel + 1,
                bias.learned_offset
            );
        }
        Ok(())
    }

    pub fn relay_state(&self) -> RelayState {
        self.relays.state()
    }

    pub fn readings(&self) -> Readings {
        self.readings
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn stats(&self) -> SyncStats {
        self.sync.stats()
    }

    pub fn config(&self) -> &MeterConfig {
        &self.config
    }

    pub fn status(&self) -> MeterStatus {
        MeterStatus {
            relays: self.relays.state(),
            connected: self.link.is_connected(),
            readings: self.readings,
            stats: self.sync.stats(),
            reconnect_attempts: self.link.reconnect_attempts(),
            learned_offsets: self
                .currents
                .each_ref()
                .map(|sampler| sampler.bias().learned_offset),
            failed_reads: self.voltage.failed_reads()
                + self
                    .currents
                    .iter()
                    .map(CurrentSampler::failed_reads)
                    .sum::<u64>(),
            uptime_ms: self.clock.now_ms().wrapping_sub(self.boot_ms),
            ticks: self.ticks,
        }
    }

    fn refresh_readings(&mut self) {
        let voltage = self.voltage.read_volts();
        let mut currents = [None; CURRENT_CHANNELS];
        for (slot, sampler) in currents.iter_mut().zip(self.currents.iter_mut()) {
            *slot = sampler.read_amps();
        }
        if voltage.is_none() && currents.iter().all(Option::is_none) {
            warn!("measurement window empty");
        }
        self.readings = Readings { voltage, currents };
    }
}

fn calibrate_channel<S: AnalogSource>(
    channel: usize,
    source: S,
    params: CalibrationParams,
    calibration: &CalibrationConfig,
) -> Result<CurrentSampler<S>, CalibrationError> {
    let sampler = CurrentSampler::calibrate(
        source,
        params,
        calibration.bias_samples,
        calibration.samples_per_update,
    )
    .inspect_err(|err| warn!("current channel {channel} calibration failed: {err}"))?;
    info!(
        "current channel {channel} bias {:.1}",
        sampler.bias().learned_offset
    );
    Ok(sampler)
}
