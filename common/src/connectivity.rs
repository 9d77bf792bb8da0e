use log::{info, warn};

use crate::hal::{Clock, WifiLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    pub connected: bool,
    pub last_reconnect_attempt_ms: Option<u64>,
}

/// Owns the WiFi link and decides when the loop may use the network.
#[derive(Debug)]
pub struct Connectivity<W> {
    link: W,
    state: ConnectivityState,
    reconnect_backoff_ms: u64,
    reconnects: u64,
}

impl<W: WifiLink> Connectivity<W> {
    pub fn new(link: W, reconnect_backoff_ms: u64) -> Self {
        Self {
            link,
            state: ConnectivityState {
                connected: false,
                last_reconnect_attempt_ms: None,
            },
            reconnect_backoff_ms,
            reconnects: 0,
        }
    }

    /// Initial association, polling up to `attempts` times `retry_delay_ms`
    /// apart. Returns whether the link came up; failure is not fatal.
    pub fn begin<C: Clock>(&mut self, clock: &mut C, attempts: u32, retry_delay_ms: u64) -> bool {
        info!("connecting to WiFi");
        if let Err(err) = self.link.start_association() {
            warn!("wifi association request failed: {err}");
        }

        for _ in 0..attempts {
            if self.link.is_associated() {
                break;
            }
            clock.delay_ms(retry_delay_ms);
        }

        self.state.connected = self.link.is_associated();
        if self.state.connected {
            self.log_link_up("wifi connected");
        } else {
            warn!("wifi connection failed after {attempts} attempts; continuing offline");
        }
        self.state.connected
    }

    /// Called every tick. Detects a dropped link and reassociates no more
    /// often than the backoff interval.
    pub fn maintain(&mut self, now_ms: u64) {
        if self.link.is_associated() {
            if !self.state.connected {
                self.state.connected = true;
                self.log_link_up("wifi reconnected");
            }
            return;
        }

        if self.state.connected {
            warn!("wifi link lost");
        }
        self.state.connected = false;

        let due = match self.state.last_reconnect_attempt_ms {
            Some(last) => now_ms.wrapping_sub(last) >= self.reconnect_backoff_ms,
            None => true,
        };
        if !due {
            return;
        }

        self.state.last_reconnect_attempt_ms = Some(now_ms);
        self.reconnects = self.reconnects.saturating_add(1);
        info!("reconnecting to WiFi");
        self.link.disconnect();
        if let Err(err) = self.link.start_association() {
            warn!("wifi association request failed: {err}");
        }
    }

    /// The single gate for every network call.
    pub fn is_connected(&self) -> bool {
        self.state.connected && self.link.is_associated()
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnects
    }

    fn log_link_up(&self, message: &str) {
        let ip = self
            .link
            .ip_addr()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "-".to_string());
        match self.link.rssi() {
            Some(rssi) => info!("{message}: ip={ip} rssi={rssi}dBm"),
            None => info!("{message}: ip={ip}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ManualClock, ToggleWifi};

    #[test]
    fn begin_polls_until_associated() {
        let wifi = ToggleWifi::associate_after(3);
        let mut clock = ManualClock::default();
        let mut link = Connectivity::new(wifi.clone(), 30_000);

        assert!(link.begin(&mut clock, 20, 500));
        assert!(link.is_connected());
        assert_eq!(clock.now_ms(), 1_500);
    }

    #[test]
    fn begin_gives_up_after_budget() {
        let wifi = ToggleWifi::down();
        let mut clock = ManualClock::default();
        let mut link = Connectivity::new(wifi, 30_000);

        assert!(!link.begin(&mut clock, 4, 500));
        assert!(!link.is_connected());
        assert_eq!(clock.now_ms(), 2_000);
    }

    #[test]
    fn reconnect_respects_backoff() {
        let wifi = ToggleWifi::up();
        let mut clock = ManualClock::default();
        let mut link = Connectivity::new(wifi.clone(), 30_000);
        link.begin(&mut clock, 1, 500);

        wifi.set_up(false);
        link.maintain(1_000);
        assert!(!link.is_connected());
        assert_eq!(wifi.association_requests(), 2);

        link.maintain(20_000);
        assert_eq!(wifi.association_requests(), 2);

        link.maintain(31_000);
        assert_eq!(wifi.association_requests(), 3);
        assert_eq!(link.reconnect_attempts(), 2);
    }

    #[test]
    fn link_recovery_is_detected() {
        let wifi = ToggleWifi::down();
        let mut clock = ManualClock::default();
        let mut link = Connectivity::new(wifi.clone(), 30_000);
        link.begin(&mut clock, 1, 10);

        wifi.set_up(true);
        link.maintain(5_000);

        assert!(link.is_connected());
        assert!(link.state().connected);
    }

    #[test]
    fn gate_closes_as_soon_as_link_drops() {
        let wifi = ToggleWifi::up();
        let mut clock = ManualClock::default();
        let mut link = Connectivity::new(wifi.clone(), 30_000);
        link.begin(&mut clock, 1, 10);

        wifi.set_up(false);
        assert!(!link.is_connected());
    }
}
