use log::{info, warn};

use crate::{
    hal::{HardwareError, RelayOutput},
    types::{RelayId, RelayState},
};

/// Sole owner of the logical relay state and the only writer of the
/// relay outputs.
#[derive(Debug)]
pub struct RelayAuthority<R> {
    output: R,
    state: RelayState,
}

impl<R: RelayOutput> RelayAuthority<R> {
    /// Adopts whatever the hardware is driving at boot.
    pub fn from_hardware(output: R) -> Self {
        let state = RelayState {
            relay1: output.get(RelayId::Relay1),
            relay2: output.get(RelayId::Relay2),
        };
        Self { output, state }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Drives one relay. The logical state follows only a successful write.
    /// Returns whether the relay changed.
    pub fn set(&mut self, relay: RelayId, on: bool) -> Result<bool, HardwareError> {
        if self.state.get(relay) == on {
            return Ok(false);
        }
        self.output.set(relay, on)?;
        self.state.set(relay, on);
        Ok(true)
    }

    pub fn toggle(&mut self, relay: RelayId) -> Result<bool, HardwareError> {
        let on = !self.state.get(relay);
        self.set(relay, on)
    }

    /// Writes only the relays that differ from `target`. Returns whether any
    /// relay changed; an identical target performs no hardware write.
    pub fn apply(&mut self, target: RelayState) -> Result<bool, HardwareError> {
        let mut changed = false;
        let mut first_err = None;
        for relay in self.state.differing(&target) {
            let on = target.get(relay);
            match self.set(relay, on) {
                Ok(true) => {
                    changed = true;
                    info!("{} -> {}", relay.as_str(), on_off(on));
                }
                Ok(false) => {}
                Err(err) => {
                    warn!("failed to drive {}: {err}", relay.as_str());
                    first_err.get_or_insert(err);
                }
            }
        }

        match first_err {
            Some(err) if !changed => Err(err),
            _ => Ok(changed),
        }
    }
}

pub fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}
