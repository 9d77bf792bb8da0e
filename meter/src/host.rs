use std::{
    f32::consts::{SQRT_2, TAU},
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header::CONTENT_TYPE, Method as HttpMethod, Request, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    net::TcpListener,
    runtime::Handle,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use energy_meter_common::{
    config::{CalibrationConfig, CURRENT_CHANNELS},
    display::format_lines,
    endpoints::{CONTENT_TYPE_JSON, PATH_RELAY_STATE, PATH_TELEMETRY},
    hal::{AnalogSource, ButtonSource, Clock, Display, RelayOutput, WifiLink},
    Board, BoardParts, ButtonEvent, HardwareError, HttpExchange, HttpRequest, HttpResponse, Meter,
    MeterStatus, Method, RelayId, RelayState, RuntimeConfig, TelemetryReport, TickReport,
    TransportError,
};

const MAX_HTTP_BODY: usize = 4096;
const SAMPLES_PER_CYCLE: u64 = 40;
const MAINS_VOLTS: f32 = 230.0;
/// Load behind relay 1 and relay 2. Channel 3 is wired but unloaded.
const RELAY_LOAD_AMPS: [f32; 2] = [2.0, 1.0];
const SIM_RSSI_DBM: i8 = -52;

#[derive(Clone)]
struct AppState {
    relays: Arc<Mutex<RelayRecord>>,
    latest: Arc<Mutex<Option<TelemetryRecord>>>,
    meter: Arc<Mutex<Option<MeterStatus>>>,
    plant: Arc<SimPlant>,
    ir: mpsc::UnboundedSender<ButtonEvent>,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
struct RelayRecord {
    #[serde(flatten)]
    state: RelayState,
    updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
struct TelemetryRecord {
    #[serde(flatten)]
    report: TelemetryReport,
    #[serde(rename = "receivedAt")]
    received_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct Ack {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct WifiUpdate {
    connected: bool,
}

#[derive(Debug, Serialize)]
struct SimStatus {
    relays: RelayState,
    #[serde(rename = "wifiConnected")]
    wifi_connected: bool,
    meter: Option<MeterStatus>,
}

/// Mains, loads, relays and the WiFi link the simulated meter is wired to.
struct SimPlant {
    relays: [AtomicBool; 2],
    wifi_up: AtomicBool,
    calibration: CalibrationConfig,
}

impl SimPlant {
    fn new(calibration: CalibrationConfig) -> Self {
        Self {
            relays: [AtomicBool::new(false), AtomicBool::new(false)],
            wifi_up: AtomicBool::new(true),
            calibration,
        }
    }

    fn relay(&self, relay: RelayId) -> bool {
        self.relays[relay.index()].load(Ordering::Relaxed)
    }

    fn set_relay(&self, relay: RelayId, on: bool) {
        self.relays[relay.index()].store(on, Ordering::Relaxed);
    }

    fn relays(&self) -> RelayState {
        RelayState::new(self.relay(RelayId::Relay1), self.relay(RelayId::Relay2))
    }

    fn wifi_up(&self) -> bool {
        self.wifi_up.load(Ordering::Relaxed)
    }

    fn set_wifi(&self, up: bool) {
        self.wifi_up.store(up, Ordering::Relaxed);
    }

    fn load_amps(&self, channel: usize) -> f32 {
        match channel {
            0 if self.relay(RelayId::Relay1) => RELAY_LOAD_AMPS[0],
            1 if self.relay(RelayId::Relay2) => RELAY_LOAD_AMPS[1],
            _ => 0.0,
        }
    }

    /// Peak deviation from the ADC midpoint, in counts, that the configured
    /// calibration maps back to the simulated quantity.
    fn amplitude_counts(&self, input: SimInput) -> f32 {
        match input {
            SimInput::Voltage => {
                let voltage = self.calibration.voltage;
                MAINS_VOLTS / voltage.scale * f32::from(voltage.adc_full_scale)
                    / voltage.reference_volts
                    * SQRT_2
            }
            SimInput::Current(channel) => {
                let amps = self.load_amps(channel);
                let params = self.calibration.currents[channel];
                if amps <= 0.0 || params.scale == 0.0 {
                    return 0.0;
                }
                (amps - params.offset) / params.scale * SQRT_2
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SimInput {
    Voltage,
    Current(usize),
}

struct SimAnalog {
    plant: Arc<SimPlant>,
    input: SimInput,
    sample_index: u64,
}

impl AnalogSource for SimAnalog {
    fn sample(&mut self) -> Result<u16, HardwareError> {
        let phase = TAU * self.sample_index as f32 / SAMPLES_PER_CYCLE as f32;
        self.sample_index = (self.sample_index + 1) % SAMPLES_PER_CYCLE;

        let voltage = self.plant.calibration.voltage;
        let full_scale = f32::from(voltage.adc_full_scale) - 1.0;
        let raw = voltage.midpoint() + self.plant.amplitude_counts(self.input) * phase.sin();
        Ok(raw.round().clamp(0.0, full_scale) as u16)
    }
}

struct SimRelays {
    plant: Arc<SimPlant>,
}

impl RelayOutput for SimRelays {
    fn set(&mut self, relay: RelayId, on: bool) -> Result<(), HardwareError> {
        self.plant.set_relay(relay, on);
        Ok(())
    }

    fn get(&self, relay: RelayId) -> bool {
        self.plant.relay(relay)
    }
}

struct SimButtons {
    presses: mpsc::UnboundedReceiver<ButtonEvent>,
}

impl ButtonSource for SimButtons {
    fn poll(&mut self) -> Option<ButtonEvent> {
        self.presses.try_recv().ok()
    }
}

#[derive(Default)]
struct TraceDisplay {
    last: Option<[String; 2]>,
}

impl Display for TraceDisplay {
    fn show(&mut self, current1: f32, current2: f32, total: f32) {
        let lines = format_lines(current1, current2, total);
        if self.last.as_ref() != Some(&lines) {
            info!("lcd | {} | {} |", lines[0], lines[1]);
            self.last = Some(lines);
        }
    }
}

struct SimWifi {
    plant: Arc<SimPlant>,
}

impl WifiLink for SimWifi {
    fn start_association(&mut self) -> Result<(), HardwareError> {
        debug!("simulated association requested");
        Ok(())
    }

    fn disconnect(&mut self) {}

    fn is_associated(&self) -> bool {
        self.plant.wifi_up()
    }

    fn ip_addr(&self) -> Option<Ipv4Addr> {
        self.plant.wifi_up().then_some(Ipv4Addr::LOCALHOST)
    }

    fn rssi(&self) -> Option<i8> {
        self.plant.wifi_up().then_some(SIM_RSSI_DBM)
    }
}

struct HostClock;

impl Clock for HostClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn delay_ms(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Drives requests through the dashboard router in-process. Must be called
/// from a blocking thread, never from inside the runtime.
struct RouterExchange {
    router: Router,
    plant: Arc<SimPlant>,
    runtime: Handle,
}

impl HttpExchange for RouterExchange {
    fn exchange(&mut self, request: HttpRequest<'_>) -> Result<HttpResponse, TransportError> {
        if !self.plant.wifi_up() {
            return Err(TransportError::Io("network unreachable".to_string()));
        }

        let method = match request.method {
            Method::Get => HttpMethod::GET,
            Method::Post => HttpMethod::POST,
        };
        let body = request
            .body
            .map(|body| Body::from(body.to_vec()))
            .unwrap_or_else(Body::empty);
        let http_request = Request::builder()
            .method(method)
            .uri(request.path)
            .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
            .body(body)
            .map_err(|err| TransportError::Io(err.to_string()))?;

        let router = self.router.clone();
        let timeout = request.timeout;
        self.runtime.block_on(async move {
            let response = match tokio::time::timeout(timeout, router.oneshot(http_request)).await {
                Ok(Ok(response)) => response,
                Ok(Err(never)) => match never {},
                Err(_) => return Err(TransportError::Timeout(timeout)),
            };
            let status = response.status().as_u16();
            let body = axum::body::to_bytes(response.into_body(), MAX_HTTP_BODY)
                .await
                .map_err(|err| TransportError::Io(err.to_string()))?;
            Ok(HttpResponse {
                status,
                body: body.to_vec(),
            })
        })
    }
}

struct SimBoard;

impl Board for SimBoard {
    type Analog = SimAnalog;
    type Relays = SimRelays;
    type Buttons = SimButtons;
    type Display = TraceDisplay;
    type Wifi = SimWifi;
    type Http = RouterExchange;
    type Clock = HostClock;
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    info!(
        "simulated dashboard stands in for {}",
        runtime.network.server_url
    );

    let (state, presses) = new_simulation(runtime.calibration.clone());
    let app = dashboard_router(state.clone());
    let parts = sim_board(&state, presses, app.clone(), Handle::current());

    let running = Arc::new(AtomicBool::new(true));
    let device = spawn_device(runtime, parts, state.meter.clone(), running.clone());

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let site = app.fallback_service(ServeDir::new(web_root));

    let port = std::env::var("METER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind dashboard server at {addr}"))?;

    info!("dashboard listening on http://{addr}");
    axum::serve(listener, site)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    running.store(false, Ordering::Relaxed);
    device.await.context("device task panicked")?
}

fn new_simulation(
    calibration: CalibrationConfig,
) -> (AppState, mpsc::UnboundedReceiver<ButtonEvent>) {
    let (ir, presses) = mpsc::unbounded_channel();
    let state = AppState {
        relays: Arc::new(Mutex::new(RelayRecord {
            state: RelayState::default(),
            updated: None,
        })),
        latest: Arc::new(Mutex::new(None)),
        meter: Arc::new(Mutex::new(None)),
        plant: Arc::new(SimPlant::new(calibration)),
        ir,
    };
    (state, presses)
}

fn sim_board(
    state: &AppState,
    presses: mpsc::UnboundedReceiver<ButtonEvent>,
    router: Router,
    runtime: Handle,
) -> BoardParts<SimBoard> {
    let analog = |input| SimAnalog {
        plant: state.plant.clone(),
        input,
        sample_index: 0,
    };
    BoardParts {
        voltage: analog(SimInput::Voltage),
        currents: std::array::from_fn(|channel| analog(SimInput::Current(channel))),
        relays: SimRelays {
            plant: state.plant.clone(),
        },
        buttons: SimButtons { presses },
        display: TraceDisplay::default(),
        wifi: SimWifi {
            plant: state.plant.clone(),
        },
        http: RouterExchange {
            router,
            plant: state.plant.clone(),
            runtime,
        },
        clock: HostClock,
    }
}

fn dashboard_router(state: AppState) -> Router {
    Router::new()
        .route(PATH_TELEMETRY, post(handle_post_data))
        .route("/api/data/latest", get(handle_get_latest))
        .route(
            PATH_RELAY_STATE,
            get(handle_get_relay_state).post(handle_post_relay_state),
        )
        .route("/api/sim/ir/{button}", post(handle_sim_ir))
        .route("/api/sim/wifi", put(handle_put_wifi))
        .route("/api/sim/status", get(handle_get_sim_status))
        .with_state(state)
}

fn spawn_device(
    runtime: RuntimeConfig,
    parts: BoardParts<SimBoard>,
    status: Arc<Mutex<Option<MeterStatus>>>,
    running: Arc<AtomicBool>,
) -> JoinHandle<anyhow::Result<()>> {
    tokio::task::spawn_blocking(move || {
        let mut meter = Meter::boot(&runtime, parts).context("meter boot failed")?;
        *status.blocking_lock() = Some(meter.status());
        info!("meter running");

        while running.load(Ordering::Relaxed) {
            let report = meter.tick();
            if report != TickReport::default() {
                *status.blocking_lock() = Some(meter.status());
            }
            meter.idle();
        }

        info!("meter stopped");
        Ok(())
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn handle_post_data(
    State(state): State<AppState>,
    Json(report): Json<TelemetryReport>,
) -> impl IntoResponse {
    debug!(
        voltage = report.voltage,
        total_current = report.total_current,
        "telemetry received"
    );
    *state.latest.lock().await = Some(TelemetryRecord {
        report,
        received_at: Utc::now(),
    });
    Json(Ack { status: "ok" })
}

async fn handle_get_latest(State(state): State<AppState>) -> axum::response::Response {
    match state.latest.lock().await.clone() {
        Some(record) => Json(record).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "no telemetry received yet"),
    }
}

async fn handle_get_relay_state(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.relays.lock().await.clone())
}

async fn handle_post_relay_state(
    State(state): State<AppState>,
    Json(update): Json<RelayState>,
) -> impl IntoResponse {
    let record = RelayRecord {
        state: update,
        updated: Some(Utc::now()),
    };
    *state.relays.lock().await = record.clone();
    info!(
        relay1 = update.relay1,
        relay2 = update.relay2,
        "relay state stored"
    );
    Json(record)
}

async fn handle_sim_ir(
    State(state): State<AppState>,
    Path(button): Path<String>,
) -> axum::response::Response {
    let Some(event) = ButtonEvent::parse(&button) else {
        return error_response(StatusCode::BAD_REQUEST, "unknown button");
    };
    if state.ir.send(event).is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "meter is not running");
    }
    info!("simulated IR press: {event:?}");
    StatusCode::ACCEPTED.into_response()
}

async fn handle_put_wifi(
    State(state): State<AppState>,
    Json(update): Json<WifiUpdate>,
) -> impl IntoResponse {
    state.plant.set_wifi(update.connected);
    info!(connected = update.connected, "simulated wifi link changed");
    handle_get_sim_status(State(state)).await
}

async fn handle_get_sim_status(State(state): State<AppState>) -> Json<SimStatus> {
    Json(SimStatus {
        relays: state.plant.relays(),
        wifi_connected: state.plant.wifi_up(),
        meter: state.meter.lock().await.clone(),
    })
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("METER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.energy-meter"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
