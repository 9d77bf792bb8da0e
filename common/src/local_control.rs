use log::{info, warn};

use crate::{
    hal::{ButtonSource, RelayOutput},
    relay::{on_off, RelayAuthority},
    types::{ButtonEvent, RelayState},
};

/// Turns remote-control presses into relay writes.
#[derive(Debug)]
pub struct LocalControl<B> {
    buttons: B,
}

impl<B: ButtonSource> LocalControl<B> {
    pub fn new(buttons: B) -> Self {
        Self { buttons }
    }

    /// Handles at most one pending press. Returns the new relay state when
    /// the press changed at least one relay; a press that leaves the state
    /// as it was is not a local change.
    pub fn poll<R: RelayOutput>(&mut self, relays: &mut RelayAuthority<R>) -> Option<RelayState> {
        let event = self.buttons.poll()?;
        let before = relays.state();

        let result = match event {
            ButtonEvent::Toggle(relay) => relays.toggle(relay),
            ButtonEvent::AllOn => relays.apply(RelayState::new(true, true)),
            ButtonEvent::AllOff => relays.apply(RelayState::new(false, false)),
        };

        match result {
            Ok(true) => {
                let after = relays.state();
                info!(
                    "IR {event:?}: R1={} R2={}",
                    on_off(after.relay1),
                    on_off(after.relay2)
                );
                Some(after)
            }
            Ok(false) => None,
            Err(err) => {
                warn!("IR {event:?} could not drive relays: {err}");
                let after = relays.state();
                (after != before).then_some(after)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testing::{RecordingRelays, ScriptedButtons},
        types::RelayId,
    };

    #[test]
    fn toggle_reports_new_state() {
        let buttons = ScriptedButtons::default();
        buttons.press(ButtonEvent::Toggle(RelayId::Relay2));
        let mut relays = RelayAuthority::from_hardware(RecordingRelays::new(RelayState::default()));
        let mut local = LocalControl::new(buttons);

        assert_eq!(local.poll(&mut relays), Some(RelayState::new(false, true)));
        assert_eq!(local.poll(&mut relays), None);
    }

    #[test]
    fn no_op_press_is_not_a_change() {
        let buttons = ScriptedButtons::default();
        buttons.press(ButtonEvent::AllOff);
        let hardware = RecordingRelays::new(RelayState::default());
        let mut relays = RelayAuthority::from_hardware(hardware.clone());
        let mut local = LocalControl::new(buttons);

        assert_eq!(local.poll(&mut relays), None);
        assert!(hardware.writes().is_empty());
    }

    #[test]
    fn one_press_handled_per_poll() {
        let buttons = ScriptedButtons::default();
        buttons.press(ButtonEvent::AllOn);
        buttons.press(ButtonEvent::Toggle(RelayId::Relay1));
        let mut relays = RelayAuthority::from_hardware(RecordingRelays::new(RelayState::default()));
        let mut local = LocalControl::new(buttons);

        assert_eq!(local.poll(&mut relays), Some(RelayState::new(true, true)));
        assert_eq!(local.poll(&mut relays), Some(RelayState::new(false, true)));
    }
}
