//! In-memory collaborators for unit tests. Every fake is a cheap clone over
//! shared state so a test can keep a handle after moving one into the core.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
    time::Duration,
};

use crate::{
    endpoints::{PATH_RELAY_STATE, PATH_TELEMETRY},
    hal::{
        AnalogSource, Board, ButtonSource, Clock, Display, HardwareError, RelayOutput, WifiLink,
    },
    transport::{HttpExchange, HttpRequest, HttpResponse, Method, TransportError},
    types::{ButtonEvent, RelayId, RelayState, TelemetryReport},
};

#[derive(Debug, Default)]
struct AnalogScript {
    queue: VecDeque<Option<u16>>,
    idle: u16,
}

/// Plays back queued samples, `None` being a failed read. Once the queue is
/// empty it keeps returning the last good sample.
#[derive(Debug, Clone, Default)]
pub struct ScriptedAnalog {
    script: Rc<RefCell<AnalogScript>>,
}

impl ScriptedAnalog {
    pub fn new(samples: Vec<u16>) -> Self {
        let analog = Self::default();
        analog.queue(samples);
        analog
    }

    pub fn with_failures(samples: Vec<Option<u16>>) -> Self {
        let analog = Self::default();
        analog.queue_with_failures(samples);
        analog
    }

    pub fn queue(&self, samples: Vec<u16>) {
        self.queue_with_failures(samples.into_iter().map(Some).collect());
    }

    pub fn queue_with_failures(&self, samples: Vec<Option<u16>>) {
        self.script.borrow_mut().queue.extend(samples);
    }

    pub fn set_idle(&self, raw: u16) {
        self.script.borrow_mut().idle = raw;
    }
}

impl AnalogSource for ScriptedAnalog {
    fn sample(&mut self) -> Result<u16, HardwareError> {
        let mut script = self.script.borrow_mut();
        match script.queue.pop_front() {
            Some(Some(raw)) => {
                script.idle = raw;
                Ok(raw)
            }
            Some(None) => Err(HardwareError::Adc("scripted failure".to_string())),
            None => Ok(script.idle),
        }
    }
}

#[derive(Debug, Default)]
struct RelayBank {
    state: RelayState,
    writes: Vec<(RelayId, bool)>,
    failing: Vec<RelayId>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingRelays {
    bank: Rc<RefCell<RelayBank>>,
}

impl RecordingRelays {
    pub fn new(state: RelayState) -> Self {
        Self {
            bank: Rc::new(RefCell::new(RelayBank {
                state,
                ..RelayBank::default()
            })),
        }
    }

    pub fn writes(&self) -> Vec<(RelayId, bool)> {
        self.bank.borrow().writes.clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        let failing = if fail {
            RelayId::ALL.to_vec()
        } else {
            Vec::new()
        };
        self.bank.borrow_mut().failing = failing;
    }

    /// Makes writes to `relay` alone fail.
    pub fn fail_relay(&self, relay: RelayId) {
        self.bank.borrow_mut().failing = vec![relay];
    }

    pub fn physical(&self) -> RelayState {
        self.bank.borrow().state
    }
}

impl RelayOutput for RecordingRelays {
    fn set(&mut self, relay: RelayId, on: bool) -> Result<(), HardwareError> {
        let mut bank = self.bank.borrow_mut();
        if bank.failing.contains(&relay) {
            return Err(HardwareError::Gpio(format!("{} stuck", relay.as_str())));
        }
        bank.state.set(relay, on);
        bank.writes.push((relay, on));
        Ok(())
    }

    fn get(&self, relay: RelayId) -> bool {
        self.bank.borrow().state.get(relay)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedButtons {
    pending: Rc<RefCell<VecDeque<ButtonEvent>>>,
}

impl ScriptedButtons {
    pub fn press(&self, event: ButtonEvent) {
        self.pending.borrow_mut().push_back(event);
    }
}

impl ButtonSource for ScriptedButtons {
    fn poll(&mut self) -> Option<ButtonEvent> {
        self.pending.borrow_mut().pop_front()
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingDisplay {
    frames: Rc<RefCell<Vec<(f32, f32, f32)>>>,
}

impl RecordingDisplay {
    pub fn frames(&self) -> Vec<(f32, f32, f32)> {
        self.frames.borrow().clone()
    }
}

impl Display for RecordingDisplay {
    fn show(&mut self, current1: f32, current2: f32, total: f32) {
        self.frames.borrow_mut().push((current1, current2, total));
    }
}

#[derive(Debug, Default)]
struct WifiState {
    up: bool,
    associate_in: Option<u32>,
    requests: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ToggleWifi {
    state: Rc<RefCell<WifiState>>,
}

impl ToggleWifi {
    fn with(state: WifiState) -> Self {
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn up() -> Self {
        Self::with(WifiState {
            up: true,
            ..WifiState::default()
        })
    }

    pub fn down() -> Self {
        Self::default()
    }

    /// Reports unassociated for the first `polls` checks, then comes up.
    pub fn associate_after(polls: u32) -> Self {
        Self::with(WifiState {
            associate_in: Some(polls),
            ..WifiState::default()
        })
    }

    pub fn set_up(&self, up: bool) {
        let mut state = self.state.borrow_mut();
        state.up = up;
        state.associate_in = None;
    }

    pub fn association_requests(&self) -> u32 {
        self.state.borrow().requests
    }
}

impl WifiLink for ToggleWifi {
    fn start_association(&mut self) -> Result<(), HardwareError> {
        self.state.borrow_mut().requests += 1;
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn is_associated(&self) -> bool {
        let mut state = self.state.borrow_mut();
        match state.associate_in {
            Some(0) => {
                state.associate_in = None;
                state.up = true;
            }
            Some(remaining) => {
                state.associate_in = Some(remaining - 1);
                return false;
            }
            None => {}
        }
        state.up
    }
}

#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get().wrapping_add(ms));
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn delay_ms(&mut self, ms: u64) {
        self.advance(ms);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl RecordedRequest {
    fn from_request(request: &HttpRequest<'_>) -> Self {
        Self {
            method: request.method,
            path: request.path.to_string(),
            body: request.body.map(<[u8]>::to_vec),
            timeout: request.timeout,
        }
    }
}

#[derive(Debug, Default)]
struct HttpScript {
    responses: VecDeque<Result<HttpResponse, TransportError>>,
    requests: Vec<RecordedRequest>,
}

/// Answers requests from a queue of canned responses.
#[derive(Debug, Clone, Default)]
pub struct ScriptedHttp {
    script: Rc<RefCell<HttpScript>>,
}

impl ScriptedHttp {
    pub fn respond(&self, status: u16, body: &str) {
        self.script.borrow_mut().responses.push_back(Ok(HttpResponse {
            status,
            body: body.as_bytes().to_vec(),
        }));
    }

    pub fn fail(&self, err: TransportError) {
        self.script.borrow_mut().responses.push_back(Err(err));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.script.borrow().requests.clone()
    }
}

impl HttpExchange for ScriptedHttp {
    fn exchange(&mut self, request: HttpRequest<'_>) -> Result<HttpResponse, TransportError> {
        let mut script = self.script.borrow_mut();
        script.requests.push(RecordedRequest::from_request(&request));
        script
            .responses
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Io("no scripted response".to_string())))
    }
}

#[derive(Debug)]
struct ServerState {
    relays: RelayState,
    telemetry: Vec<TelemetryReport>,
    requests: Vec<RecordedRequest>,
    reachable: bool,
    telemetry_status: u16,
    corrupt_relay_body: bool,
}

impl Default for ServerState {
    fn default() -> Self {
        Self {
            relays: RelayState::default(),
            telemetry: Vec::new(),
            requests: Vec::new(),
            reachable: true,
            telemetry_status: 200,
            corrupt_relay_body: false,
        }
    }
}

/// A minimal dashboard server keeping the relay record and received reports.
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    state: Rc<RefCell<ServerState>>,
}

impl FakeServer {
    /// A dashboard user changing the stored state.
    pub fn set_relays(&self, relays: RelayState) {
        self.state.borrow_mut().relays = relays;
    }

    pub fn relays(&self) -> RelayState {
        self.state.borrow().relays
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.borrow_mut().reachable = reachable;
    }

    pub fn set_telemetry_status(&self, status: u16) {
        self.state.borrow_mut().telemetry_status = status;
    }

    pub fn corrupt_relay_body(&self, corrupt: bool) {
        self.state.borrow_mut().corrupt_relay_body = corrupt;
    }

    pub fn telemetry(&self) -> Vec<TelemetryReport> {
        self.state.borrow().telemetry.clone()
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.borrow().requests.clone()
    }

    pub fn relay_posts(&self) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.method == Method::Post && request.path == PATH_RELAY_STATE)
            .count()
    }
}

impl HttpExchange for FakeServer {
    fn exchange(&mut self, request: HttpRequest<'_>) -> Result<HttpResponse, TransportError> {
        let mut state = self.state.borrow_mut();
        state.requests.push(RecordedRequest::from_request(&request));
        if !state.reachable {
            return Err(TransportError::Io("connection refused".to_string()));
        }

        let body = request.body.unwrap_or_default();
        let (status, body) = match (request.method, request.path) {
            (Method::Post, PATH_TELEMETRY) => match serde_json::from_slice(body) {
                Ok(report) => {
                    state.telemetry.push(report);
                    (state.telemetry_status, Vec::new())
                }
                Err(_) => (400, Vec::new()),
            },
            (Method::Get, PATH_RELAY_STATE) if state.corrupt_relay_body => {
                (200, br#"{"relay1":true}"#.to_vec())
            }
            (Method::Get, PATH_RELAY_STATE) => {
                let body = serde_json::to_vec(&state.relays)
                    .map_err(|err| TransportError::Payload(err.to_string()))?;
                (200, body)
            }
            (Method::Post, PATH_RELAY_STATE) => match serde_json::from_slice(body) {
                Ok(relays) => {
                    state.relays = relays;
                    (200, Vec::new())
                }
                Err(_) => (400, Vec::new()),
            },
            _ => (404, Vec::new()),
        };
        Ok(HttpResponse { status, body })
    }
}

pub struct TestBoard;

impl Board for TestBoard {
    type Analog = ScriptedAnalog;
    type Relays = RecordingRelays;
    type Buttons = ScriptedButtons;
    type Display = RecordingDisplay;
    type Wifi = ToggleWifi;
    type Http = FakeServer;
    type Clock = ManualClock;
}
