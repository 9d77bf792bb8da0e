use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayId {
    Relay1,
    Relay2,
}

impl RelayId {
    pub const ALL: [RelayId; 2] = [RelayId::Relay1, RelayId::Relay2];

    pub fn index(self) -> usize {
        match self {
            Self::Relay1 => 0,
            Self::Relay2 => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Relay1 => "relay1",
            Self::Relay2 => "relay2",
        }
    }
}

/// Logical ON/OFF state of both relays. Also the wire body of
/// `/api/relay/state` in both directions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayState {
    pub relay1: bool,
    pub relay2: bool,
}

impl RelayState {
    pub fn new(relay1: bool, relay2: bool) -> Self {
        Self { relay1, relay2 }
    }

    pub fn get(&self, relay: RelayId) -> bool {
        match relay {
            RelayId::Relay1 => self.relay1,
            RelayId::Relay2 => self.relay2,
        }
    }

    pub fn set(&mut self, relay: RelayId, on: bool) {
        match relay {
            RelayId::Relay1 => self.relay1 = on,
            RelayId::Relay2 => self.relay2 = on,
        }
    }

    /// Relays whose value differs between `self` and `other`.
    pub fn differing(&self, other: &RelayState) -> Vec<RelayId> {
        RelayId::ALL
            .into_iter()
            .filter(|relay| self.get(*relay) != other.get(*relay))
            .collect()
    }
}

/// A decoded button press from the local remote control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ButtonEvent {
    Toggle(RelayId),
    AllOn,
    AllOff,
}

impl ButtonEvent {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "1" | "relay1" => Some(Self::Toggle(RelayId::Relay1)),
            "2" | "relay2" => Some(Self::Toggle(RelayId::Relay2)),
            "on" | "all-on" => Some(Self::AllOn),
            "off" | "all-off" => Some(Self::AllOff),
            _ => None,
        }
    }
}

/// Snapshot pushed to `/api/data`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub voltage: f32,
    pub current1: f32,
    pub current2: f32,
    pub current3: f32,
    pub total_current: f32,
    pub power1: f32,
    pub power2: f32,
    pub total_power: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_state_wire_format_matches_server() {
        let json = serde_json::to_string(&RelayState::new(true, false)).unwrap();
        assert_eq!(json, r#"{"relay1":true,"relay2":false}"#);
    }

    #[test]
    fn differing_lists_only_changed_relays() {
        let local = RelayState::new(false, true);
        assert!(local.differing(&local).is_empty());
        assert_eq!(
            local.differing(&RelayState::new(true, true)),
            vec![RelayId::Relay1]
        );
        assert_eq!(
            local.differing(&RelayState::new(true, false)),
            vec![RelayId::Relay1, RelayId::Relay2]
        );
    }

    #[test]
    fn button_names_parse() {
        assert_eq!(
            ButtonEvent::parse("2"),
            Some(ButtonEvent::Toggle(RelayId::Relay2))
        );
        assert_eq!(ButtonEvent::parse("all-off"), Some(ButtonEvent::AllOff));
        assert_eq!(ButtonEvent::parse("volume-up"), None);
    }
}
