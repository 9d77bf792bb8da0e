use anyhow::Context;
use esp_idf_hal::{
    gpio::InputPin,
    peripheral::Peripheral,
    rmt::{config::ReceiveConfig, Pulse, Receive, RmtChannel, RxRmtDriver},
};
use log::{debug, warn};

use energy_meter_common::{config::IrButtonMap, hal::ButtonSource, ir::IrDecoder, ButtonEvent};

/// 80 MHz APB / 80 gives one tick per microsecond.
const IR_TICK_DIVIDER: u8 = 80;
const IR_IDLE_THRESHOLD_TICKS: u16 = 12_000;
const IR_RING_BUFFER_BYTES: usize = 1_024;
const MAX_FRAME_PAIRS: usize = 72;

enum IrBackend {
    Rmt(RxRmtDriver<'static>),
    Disabled,
}

pub struct IrReceiver {
    backend: IrBackend,
    decoder: IrDecoder,
    ignored_frames: u64,
}

impl IrReceiver {
    pub fn new<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
        buttons: IrButtonMap,
    ) -> anyhow::Result<Self>
    where
        C: RmtChannel,
        P: InputPin,
    {
        let config = ReceiveConfig::new()
            .clock_divider(IR_TICK_DIVIDER)
            .idle_threshold(IR_IDLE_THRESHOLD_TICKS);

        let mut rx = RxRmtDriver::new(channel, pin, &config, IR_RING_BUFFER_BYTES)
            .context("failed to init RMT IR receiver")?;
        rx.start().context("failed to start RMT IR receiver")?;

        Ok(Self {
            backend: IrBackend::Rmt(rx),
            decoder: IrDecoder::new(buttons),
            ignored_frames: 0,
        })
    }

    pub fn disabled(buttons: IrButtonMap) -> Self {
        Self {
            backend: IrBackend::Disabled,
            decoder: IrDecoder::new(buttons),
            ignored_frames: 0,
        }
    }
}

impl ButtonSource for IrReceiver {
    fn poll(&mut self) -> Option<ButtonEvent> {
        let IrBackend::Rmt(rx) = &mut self.backend else {
            return None;
        };

        let mut pulses = [(Pulse::zero(), Pulse::zero()); MAX_FRAME_PAIRS];
        let count = match rx.receive(&mut pulses, 0) {
            Ok(Receive::Read(count)) => count,
            Ok(Receive::Overflow(count)) => {
                warn!("IR frame overflowed receive buffer ({count} pairs)");
                return None;
            }
            Ok(Receive::Timeout) => return None,
            Err(err) => {
                warn!("IR receive failed: {err}");
                return None;
            }
        };

        // The demodulator idles high, so each pair is (mark, space) already.
        let pairs: Vec<(u32, u32)> = pulses[..count.min(MAX_FRAME_PAIRS)]
            .iter()
            .map(|(mark, space)| {
                (
                    u32::from(mark.ticks.ticks()),
                    u32::from(space.ticks.ticks()),
                )
            })
            .collect();

        let event = self.decoder.decode(&pairs);
        if event.is_none() {
            self.ignored_frames = self.ignored_frames.saturating_add(1);
            debug!(
                "IR frame with {} pairs ignored ({} so far)",
                pairs.len(),
                self.ignored_frames
            );
        }
        event
    }
}
