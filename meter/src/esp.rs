use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    sync::{Arc, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{client::Client as HttpClient, Method as HttpMethod, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    gpio::{ADCPin, AnyInputPin, AnyOutputPin, Output, PinDriver},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals, rmt::RMT},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sys::EspError,
    wifi::EspWifi,
};
use log::{info, warn};

use energy_meter_common::{
    config::{HardwareConfig, IrButtonMap, NetworkConfig},
    display::format_lines,
    endpoints::CONTENT_TYPE_JSON,
    hal::{AnalogSource, Clock, Display, RelayOutput, WifiLink},
    Board, BoardParts, HardwareError, HttpExchange, HttpRequest, HttpResponse, Meter, Method,
    RelayId, RuntimeConfig, TransportError,
};

use crate::ir::IrReceiver;

const NVS_NAMESPACE: &str = "energymeter";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 4096;
const HTTP_CHUNK_SIZE: usize = 512;
const STATUS_LOG_INTERVAL_MS: u64 = 60_000;

type SharedAdc = Arc<AdcDriver<'static, ADC1>>;

struct NvsStore {
    partition: EspDefaultNvsPartition,
}

/// One ADC1 input. Channels of different pins share the driver, so the
/// concrete channel type is erased behind the read closure.
struct AdcInput {
    read: Box<dyn FnMut() -> Result<u16, EspError>>,
}

struct GpioRelays {
    pins: [PinDriver<'static, AnyOutputPin, Output>; 2],
    active_low: bool,
}

#[derive(Default)]
struct LogDisplay {
    last: Option<[String; 2]>,
}

struct EspWifiLink {
    wifi: EspWifi<'static>,
}

struct EspHttpExchange {
    base_url: String,
}

struct EspClock;

struct EspBoard;

impl Board for EspBoard {
    type Analog = AdcInput;
    type Relays = GpioRelays;
    type Buttons = IrReceiver;
    type Display = LogDisplay;
    type Wifi = EspWifiLink;
    type Http = EspHttpExchange;
    type Clock = EspClock;
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        compiled_runtime_config()
    });
    runtime.sanitize();
    ensure_network_defaults(&mut runtime.network);

    info!(
        "config loaded: ssid=`{}`, server=`{}`, relays=GPIO{:?}",
        runtime.network.wifi_ssid, runtime.network.server_url, runtime.hardware.relay_pins,
    );

    let Peripherals {
        modem,
        adc1,
        pins,
        rmt,
        ..
    } = Peripherals::take()?;

    let adc: SharedAdc = Arc::new(AdcDriver::new(adc1).context("failed to init ADC1")?);
    let voltage = AdcInput::new(adc.clone(), pins.gpio34).context("voltage input")?;
    let currents = [
        AdcInput::new(adc.clone(), pins.gpio35).context("current input 1")?,
        AdcInput::new(adc.clone(), pins.gpio32).context("current input 2")?,
        AdcInput::new(adc, pins.gpio33).context("current input 3")?,
    ];

    let relays = GpioRelays::new(&runtime.hardware)?;

    let buttons = match init_ir_receiver(rmt, &runtime.hardware, runtime.ir.clone()) {
        Ok(receiver) => {
            info!(
                "IR receiver initialized on RMT channel{} / GPIO{}",
                runtime.hardware.rmt_channel, runtime.hardware.ir_rx_pin
            );
            receiver
        }
        Err(err) => {
            warn!("failed to initialize IR receiver, running without remote: {err:#}");
            IrReceiver::disabled(runtime.ir.clone())
        }
    };

    let wifi = EspWifiLink::new(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;
    disable_wifi_power_save();

    let parts = BoardParts::<EspBoard> {
        voltage,
        currents,
        relays,
        buttons,
        display: LogDisplay::default(),
        wifi,
        http: EspHttpExchange {
            base_url: runtime.network.server_url.trim_end_matches('/').to_string(),
        },
        clock: EspClock,
    };

    let mut meter = Meter::boot(&runtime, parts).context("meter boot failed")?;

    let watchdog_sec = runtime.meter.watchdog_timeout_sec();
    init_watchdog(watchdog_sec)?;
    info!(
        "task watchdog {watchdog_sec}s, worst-case tick {}ms",
        runtime.meter.worst_case_tick_ms()
    );
    if let Err(err) = add_current_task_to_watchdog() {
        warn!("failed to register control loop with watchdog: {err:#}");
    }

    let mut last_status_ms = monotonic_ms();
    loop {
        feed_watchdog();
        meter.tick();

        let now_ms = monotonic_ms();
        if now_ms.wrapping_sub(last_status_ms) >= STATUS_LOG_INTERVAL_MS {
            last_status_ms = now_ms;
            match serde_json::to_string(&meter.status()) {
                Ok(status) => info!("status {status}"),
                Err(err) => warn!("status serialization failed: {err}"),
            }
        }

        meter.idle();
    }
}

impl AdcInput {
    fn new<P>(adc: SharedAdc, pin: P) -> anyhow::Result<Self>
    where
        P: ADCPin<Adc = ADC1> + 'static,
    {
        let config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let mut channel = AdcChannelDriver::new(adc, pin, &config)?;
        Ok(Self {
            read: Box::new(move || channel.read_raw()),
        })
    }
}

impl AnalogSource for AdcInput {
    fn sample(&mut self) -> Result<u16, HardwareError> {
        (self.read)().map_err(|err| HardwareError::Adc(err.to_string()))
    }
}

impl GpioRelays {
    /// Claims both relay pins and drives them to OFF, the hardware default.
    fn new(hardware: &HardwareConfig) -> anyhow::Result<Self> {
        let [relay1, relay2] = hardware.relay_pins;
        let mut relays = Self {
            pins: [output_pin(relay1)?, output_pin(relay2)?],
            active_low: hardware.relay_active_low,
        };
        for relay in RelayId::ALL {
            relays.set(relay, false)?;
        }
        Ok(relays)
    }
}

impl RelayOutput for GpioRelays {
    fn set(&mut self, relay: RelayId, on: bool) -> Result<(), HardwareError> {
        let pin = &mut self.pins[relay.index()];
        let result = if on != self.active_low {
            pin.set_high()
        } else {
            pin.set_low()
        };
        result.map_err(|err| HardwareError::Gpio(format!("{}: {err}", relay.as_str())))
    }

    fn get(&self, relay: RelayId) -> bool {
        self.pins[relay.index()].is_set_high() != self.active_low
    }
}

fn output_pin(pin: i32) -> anyhow::Result<PinDriver<'static, AnyOutputPin, Output>> {
    if pin < 0 {
        return Err(anyhow!("invalid relay pin: {pin}"));
    }
    let driver = unsafe { PinDriver::output(AnyOutputPin::new(pin)) }
        .with_context(|| format!("failed to claim relay GPIO{pin}"))?;
    Ok(driver)
}

impl Display for LogDisplay {
    fn show(&mut self, current1: f32, current2: f32, total: f32) {
        let lines = format_lines(current1, current2, total);
        if self.last.as_ref() != Some(&lines) {
            info!("lcd | {} | {} |", lines[0], lines[1]);
            self.last = Some(lines);
        }
    }
}

impl EspWifiLink {
    fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs_partition: EspDefaultNvsPartition,
        network: &NetworkConfig,
    ) -> anyhow::Result<Self> {
        let mut wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;

        let auth_method = if network.wifi_pass.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        wifi.set_configuration(&Configuration::Client(ClientConfiguration {
            ssid: network
                .wifi_ssid
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi ssid too long"))?,
            password: network
                .wifi_pass
                .as_str()
                .try_into()
                .map_err(|_| anyhow!("wifi password too long"))?,
            auth_method,
            ..Default::default()
        }))?;

        wifi.start()?;
        info!("wifi started, station `{}`", network.wifi_ssid);
        Ok(Self { wifi })
    }
}

impl WifiLink for EspWifiLink {
    fn start_association(&mut self) -> Result<(), HardwareError> {
        self.wifi
            .connect()
            .map_err(|err| HardwareError::Wifi(err.to_string()))
    }

    fn disconnect(&mut self) {
        if let Err(err) = self.wifi.disconnect() {
            warn!("wifi disconnect failed: {err}");
        }
    }

    fn is_associated(&self) -> bool {
        self.wifi.is_up().unwrap_or(false)
    }

    fn ip_addr(&self) -> Option<Ipv4Addr> {
        self.wifi
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip)
    }

    fn rssi(&self) -> Option<i8> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(ap_info.rssi)
    }
}

impl HttpExchange for EspHttpExchange {
    fn exchange(&mut self, request: HttpRequest<'_>) -> Result<HttpResponse, TransportError> {
        let started = Instant::now();
        let timeout = request.timeout;
        let fail = |err: &dyn core::fmt::Debug| {
            if started.elapsed() >= timeout {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Io(format!("{err:?}"))
            }
        };

        let config = HttpClientConfiguration {
            timeout: Some(timeout),
            ..Default::default()
        };
        let connection = EspHttpConnection::new(&config).map_err(|err| fail(&err))?;
        let mut client = HttpClient::wrap(connection);

        let url = format!("{}{}", self.base_url, request.path);
        let body = request.body.unwrap_or_default();
        let content_length = body.len().to_string();
        let mut http_request = match request.method {
            Method::Get => client.request(HttpMethod::Get, &url, &[("accept", CONTENT_TYPE_JSON)]),
            Method::Post => client.request(
                HttpMethod::Post,
                &url,
                &[
                    ("content-type", CONTENT_TYPE_JSON),
                    ("content-length", content_length.as_str()),
                ],
            ),
        }
        .map_err(|err| fail(&err))?;

        if !body.is_empty() {
            http_request.write_all(body).map_err(|err| fail(&err))?;
        }
        let mut response = http_request.submit().map_err(|err| fail(&err))?;
        let status = response.status();

        let mut received = Vec::new();
        let mut chunk = [0_u8; HTTP_CHUNK_SIZE];
        loop {
            let read = response.read(&mut chunk).map_err(|err| fail(&err))?;
            if read == 0 {
                break;
            }
            if received.len() + read > MAX_HTTP_BODY {
                return Err(TransportError::Payload(format!(
                    "response exceeds {MAX_HTTP_BODY} bytes"
                )));
            }
            received.extend_from_slice(&chunk[..read]);
        }

        Ok(HttpResponse {
            status,
            body: received,
        })
    }
}

impl Clock for EspClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn delay_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(compiled_runtime_config()),
        }
    }
}

fn compiled_runtime_config() -> RuntimeConfig {
    RuntimeConfig {
        network: NetworkConfig {
            wifi_ssid: env!("WIFI_SSID").to_string(),
            wifi_pass: env!("WIFI_PASS").to_string(),
            server_url: env!("SERVER_URL").to_string(),
        },
        ..RuntimeConfig::default()
    }
}

fn ensure_network_defaults(network: &mut NetworkConfig) {
    if network.wifi_ssid.trim().is_empty() {
        network.wifi_ssid = env!("WIFI_SSID").to_string();
        network.wifi_pass = env!("WIFI_PASS").to_string();
    }
    if network.server_url.trim().is_empty() {
        network.server_url = env!("SERVER_URL").to_string();
    }
}

fn init_ir_receiver(
    rmt: RMT,
    hardware: &HardwareConfig,
    buttons: IrButtonMap,
) -> anyhow::Result<IrReceiver> {
    if hardware.ir_rx_pin < 0 {
        return Err(anyhow!("invalid IR receive pin: {}", hardware.ir_rx_pin));
    }

    let pin = hardware.ir_rx_pin;

    match hardware.rmt_channel {
        0 => unsafe { IrReceiver::new(rmt.channel0, AnyInputPin::new(pin), buttons) },
        1 => unsafe { IrReceiver::new(rmt.channel1, AnyInputPin::new(pin), buttons) },
        2 => unsafe { IrReceiver::new(rmt.channel2, AnyInputPin::new(pin), buttons) },
        3 => unsafe { IrReceiver::new(rmt.channel3, AnyInputPin::new(pin), buttons) },
        #[cfg(any(esp32, esp32s3))]
        4 => unsafe { IrReceiver::new(rmt.channel4, AnyInputPin::new(pin), buttons) },
        #[cfg(any(esp32, esp32s3))]
        5 => unsafe { IrReceiver::new(rmt.channel5, AnyInputPin::new(pin), buttons) },
        #[cfg(any(esp32, esp32s3))]
        6 => unsafe { IrReceiver::new(rmt.channel6, AnyInputPin::new(pin), buttons) },
        #[cfg(any(esp32, esp32s3))]
        7 => unsafe { IrReceiver::new(rmt.channel7, AnyInputPin::new(pin), buttons) },
        _ => Err(anyhow!("unsupported RMT channel: {}", hardware.rmt_channel)),
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
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
