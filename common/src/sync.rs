//! Relay reconciliation and telemetry reporting.
//!
//! Every exchange is a single fire-and-forget attempt. Nothing is queued
//! for retry: a lost push is corrected by a later poll, a lost report is
//! superseded by the next one.
//!
//! The device writes server state only after a local hardware event and
//! writes local state only from a freshly fetched server value that
//! differs. When an IR press and a dashboard command land in the same poll
//! window, whichever request the server processes last wins.

use log::{debug, info, warn};
use serde::Serialize;

use crate::{
    connectivity::Connectivity,
    hal::{HardwareError, RelayOutput, WifiLink},
    relay::{on_off, RelayAuthority},
    transport::{HttpExchange, ServerClient, TransportError},
    types::{RelayState, TelemetryReport},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    Sent,
    Offline,
    Failed(TransportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Offline,
    Failed(TransportError),
    Unchanged,
    Applied(RelayState),
    HardwareFault(HardwareError),
}

impl PollOutcome {
    /// True exactly when the fetched state differed and was applied.
    pub fn changed(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Sent(u16),
    Offline,
    Failed(TransportError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    #[serde(rename = "localChanges")]
    pub local_changes: u64,
    #[serde(rename = "pushesSent")]
    pub pushes_sent: u64,
    #[serde(rename = "pushesFailed")]
    pub pushes_failed: u64,
    #[serde(rename = "pollsOk")]
    pub polls_ok: u64,
    #[serde(rename = "pollsFailed")]
    pub polls_failed: u64,
    #[serde(rename = "remoteChanges")]
    pub remote_changes: u64,
    #[serde(rename = "telemetrySent")]
    pub telemetry_sent: u64,
    #[serde(rename = "telemetryFailed")]
    pub telemetry_failed: u64,
    #[serde(rename = "offlineSkips")]
    pub offline_skips: u64,
}

#[derive(Debug, Default)]
pub struct SyncEngine {
    stats: SyncStats,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Pushes `state` once, whether or not it reaches the server.
    pub fn push_local_change<W, H>(
        &mut self,
        state: RelayState,
        link: &Connectivity<W>,
        server: &mut ServerClient<H>,
    ) -> PushOutcome
    where
        W: WifiLink,
        H: HttpExchange,
    {
        self.stats.local_changes += 1;
        self.push_state(state, link, server)
    }

    /// Pushes the boot-time hardware state. Same rules as a local change.
    pub fn push_boot_state<W, H>(
        &mut self,
        state: RelayState,
        link: &Connectivity<W>,
        server: &mut ServerClient<H>,
    ) -> PushOutcome
    where
        W: WifiLink,
        H: HttpExchange,
    {
        self.push_state(state, link, server)
    }

    fn push_state<W, H>(
        &mut self,
        state: RelayState,
        link: &Connectivity<W>,
        server: &mut ServerClient<H>,
    ) -> PushOutcome
    where
        W: WifiLink,
        H: HttpExchange,
    {
        if !link.is_connected() {
            self.stats.offline_skips += 1;
            self.stats.pushes_failed += 1;
            warn!("offline, relay state push dropped");
            return PushOutcome::Offline;
        }

        match server.push_relay_state(state) {
            Ok(()) => {
                self.stats.pushes_sent += 1;
                info!(
                    "relay state posted: R1={} R2={}",
                    on_off(state.relay1),
                    on_off(state.relay2)
                );
                PushOutcome::Sent
            }
            Err(err) => {
                self.stats.pushes_failed += 1;
                warn!("failed to post relay state: {err}");
                PushOutcome::Failed(err)
            }
        }
    }

    /// Fetches the server state and applies it when any relay differs.
    pub fn poll_remote<W, H, R>(
        &mut self,
        relays: &mut RelayAuthority<R>,
        link: &Connectivity<W>,
        server: &mut ServerClient<H>,
    ) -> PollOutcome
    where
        W: WifiLink,
        H: HttpExchange,
        R: RelayOutput,
    {
        if !link.is_connected() {
            self.stats.offline_skips += 1;
            return PollOutcome::Offline;
        }

        let remote = match server.fetch_relay_state() {
            Ok(remote) => remote,
            Err(err) => {
                self.stats.polls_failed += 1;
                warn!("relay state poll failed: {err}");
                return PollOutcome::Failed(err);
            }
        };
        self.stats.polls_ok += 1;

        if remote == relays.state() {
            debug!("relay state in sync with server");
            return PollOutcome::Unchanged;
        }

        match relays.apply(remote) {
            Ok(true) => {
                self.stats.remote_changes += 1;
                let applied = relays.state();
                info!(
                    "web command applied: R1={} R2={}",
                    on_off(applied.relay1),
                    on_off(applied.relay2)
                );
                PollOutcome::Applied(applied)
            }
            Ok(false) => PollOutcome::Unchanged,
            Err(err) => PollOutcome::HardwareFault(err),
        }
    }

    pub fn report<W, H>(
        &mut self,
        report: &TelemetryReport,
        link: &Connectivity<W>,
        server: &mut ServerClient<H>,
    ) -> ReportOutcome
    where
        W: WifiLink,
        H: HttpExchange,
    {
        if !link.is_connected() {
            self.stats.offline_skips += 1;
            self.stats.telemetry_failed += 1;
            debug!("offline, telemetry report dropped");
            return ReportOutcome::Offline;
        }

        match server.push_telemetry(report) {
            Ok(status) => {
                self.stats.telemetry_sent += 1;
                debug!("telemetry sent, HTTP {status}");
                ReportOutcome::Sent(status)
            }
            Err(err) => {
                self.stats.telemetry_failed += 1;
                warn!("failed to send telemetry: {err}");
                ReportOutcome::Failed(err)
            }
        }
    }
}
