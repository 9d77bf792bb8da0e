//! NEC infrared frame decoding.
//!
//! Input is a captured frame as `(mark_us, space_us)` pairs, leader first.

use crate::{config::IrButtonMap, types::ButtonEvent};

const LEADER_MARK_US: u32 = 9_000;
const LEADER_SPACE_US: u32 = 4_500;
const REPEAT_SPACE_US: u32 = 2_250;
const BIT_MARK_US: u32 = 560;
const ZERO_SPACE_US: u32 = 560;
const ONE_SPACE_US: u32 = 1_690;
const TOLERANCE_PCT: u32 = 30;
const DATA_BITS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NecFrame {
    Command { address: u16, command: u8 },
    Repeat,
}

fn near(measured: u32, nominal: u32) -> bool {
    let slack = nominal * TOLERANCE_PCT / 100;
    (nominal - slack..=nominal + slack).contains(&measured)
}

pub fn decode_nec(pairs: &[(u32, u32)]) -> Option<NecFrame> {
    let (&(leader_mark, leader_space), data) = pairs.split_first()?;
    if !near(leader_mark, LEADER_MARK_US) {
        return None;
    }
    if near(leader_space, REPEAT_SPACE_US) {
        return Some(NecFrame::Repeat);
    }
    if !near(leader_space, LEADER_SPACE_US) || data.len() < DATA_BITS {
        return None;
    }

    let mut word = 0_u32;
    for (bit, &(mark, space)) in data.iter().take(DATA_BITS).enumerate() {
        if !near(mark, BIT_MARK_US) {
            return None;
        }
        if near(space, ONE_SPACE_US) {
            word |= 1 << bit;
        } else if !near(space, ZERO_SPACE_US) {
            return None;
        }
    }

    let [addr_lo, addr_hi, command, command_inv] = word.to_le_bytes();
    if command != !command_inv {
        return None;
    }

    Some(NecFrame::Command {
        address: u16::from_le_bytes([addr_lo, addr_hi]),
        command,
    })
}

/// Maps captured frames to button events. Repeat frames from a held button
/// are dropped so one press toggles once.
#[derive(Debug, Clone)]
pub struct IrDecoder {
    buttons: IrButtonMap,
}

impl IrDecoder {
    pub fn new(buttons: IrButtonMap) -> Self {
        Self { buttons }
    }

    pub fn decode(&self, pairs: &[(u32, u32)]) -> Option<ButtonEvent> {
        match decode_nec(pairs)? {
            NecFrame::Command { command, .. } => self.buttons.lookup(command),
            NecFrame::Repeat => None,
        }
    }
}

#[cfg(test)]
pub(crate) fn encode_nec(address: u8, command: u8) -> Vec<(u32, u32)> {
    let word = u32::from_le_bytes([address, !address, command, !command]);
    let mut pairs = vec![(LEADER_MARK_US, LEADER_SPACE_US)];
    for bit in 0..DATA_BITS {
        let space = if word & (1 << bit) != 0 {
            ONE_SPACE_US
        } else {
            ZERO_SPACE_US
        };
        pairs.push((BIT_MARK_US, space));
    }
    pairs.push((BIT_MARK_US, 0));
    pairs
}
