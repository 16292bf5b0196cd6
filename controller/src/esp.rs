use core::convert::TryInto;
use std::{
    sync::{mpsc, Arc, Mutex, OnceLock},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    adc::{
        attenuation::DB_11,
        oneshot::{config::AdcChannelConfig, AdcChannelDriver, AdcDriver},
        ADC1,
    },
    delay::{Ets, FreeRtos, BLOCK},
    gpio::{
        AnyOutputPin, Gpio1, Gpio13, Gpio14, Gpio41, Gpio42, Gpio8, Input, Output, OutputPin,
        PinDriver,
    },
    i2c::{I2cConfig, I2cDriver, I2C0},
    sys::EspError,
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    nvs::EspDefaultNvsPartition,
    wifi::{BlockingWifi, EspWifi},
};
use log::{error, info, warn};
use serde::Serialize;

use aeroponic_common::{
    command_key, sensors::sht31, ActuationScheduler, ClimateReading, ControlResponse,
    DataResponse, HttpFacade, NetworkConfig, Probes, Relay, RuntimeConfig, SchedulerAction,
    SensorError, SensorReader, SetpointUpdate, StepDirection, StepGenerator,
    TOPIC_CMD_LIGHT_THRESHOLD, TOPIC_CMD_PH_TARGET, TOPIC_CONTROLLER_AVAILABILITY,
    TOPIC_CONTROLLER_STATE,
};

use crate::DASHBOARD_HTML;

const MAX_HTTP_BODY: usize = 1024;
const MAX_MQTT_PAYLOAD_BYTES: usize = 64;
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;

const VPD_RELAY_PIN: i32 = 19;
const ACID_RELAY_PIN: i32 = 21;
const BASE_RELAY_PIN: i32 = 20;
const MIX_RELAY_PIN: i32 = 5;
const STEP_PIN: i32 = 4;
// GPIO5 drives the mix relay, so direction moves to GPIO6.
const DIR_PIN: i32 = 6;

const STEP_PULSE_US: u32 = 5;
const STEPPER_IDLE_POLL: Duration = Duration::from_millis(20);

#[derive(Clone)]
struct SharedState {
    scheduler: Arc<Mutex<ActuationScheduler>>,
    facade: Arc<Mutex<HttpFacade>>,
    stepper: Arc<Mutex<StepGenerator>>,
}

/// Peripherals the probes are opened from, on the control thread.
struct ProbePins {
    i2c0: I2C0,
    sda: Gpio41,
    scl: Gpio42,
    ph: Gpio1,
    light: Gpio8,
    trig: Gpio13,
    echo: Gpio14,
}

/// SHT31 on I2C0, pH and LDR on ADC1, HC-SR04 on two GPIOs.
struct BoardProbes<'d> {
    i2c: I2cDriver<'d>,
    ph: AdcChannelDriver<'d, Gpio1, &'d AdcDriver<'d, ADC1>>,
    light: AdcChannelDriver<'d, Gpio8, &'d AdcDriver<'d, ADC1>>,
    trig: PinDriver<'d, Gpio13, Output>,
    echo: PinDriver<'d, Gpio14, Input>,
    echo_timeout_us: u32,
}

struct RelayBank {
    pins: Vec<(Relay, PinDriver<'static, AnyOutputPin, Output>)>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let mut runtime = RuntimeConfig::default();
    ensure_network_defaults(&mut runtime.network);
    runtime.validate().context("invalid built-in configuration")?;

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;

    let probe_pins = ProbePins {
        i2c0: peripherals.i2c0,
        sda: pins.gpio41,
        scl: pins.gpio42,
        ph: pins.gpio1,
        light: pins.gpio8,
        trig: pins.gpio13,
        echo: pins.gpio14,
    };

    let mut relays = RelayBank::new([
        (Relay::VpdPump, pins.gpio19.downgrade_output(), VPD_RELAY_PIN),
        (Relay::AcidPump, pins.gpio21.downgrade_output(), ACID_RELAY_PIN),
        (Relay::BasePump, pins.gpio20.downgrade_output(), BASE_RELAY_PIN),
        (Relay::MixPump, pins.gpio5.downgrade_output(), MIX_RELAY_PIN),
    ])?;

    let step_pin = PinDriver::output(pins.gpio4.downgrade_output())?;
    let dir_pin = PinDriver::output(pins.gpio6.downgrade_output())?;
    info!("stepper on STEP GPIO{STEP_PIN} / DIR GPIO{DIR_PIN}");

    let scheduler = ActuationScheduler::new(
        runtime.scheduler.clone(),
        runtime.reservoir.clone(),
        runtime.setpoints,
    );
    for action in scheduler.initial_actions() {
        if let SchedulerAction::RelayOn(relay) | SchedulerAction::RelayOff(relay) = action {
            relays.set(relay, matches!(action, SchedulerAction::RelayOn(_)))?;
        }
    }

    let shared_state = SharedState {
        scheduler: Arc::new(Mutex::new(scheduler)),
        facade: Arc::new(Mutex::new(HttpFacade::new(runtime.http.clone()))),
        stepper: Arc::new(Mutex::new(StepGenerator::new(&runtime.stepper))),
    };

    // Control keeps running without a network.
    let wifi = match connect_wifi(peripherals.modem, sys_loop, nvs_partition, &runtime.network) {
        Ok(wifi) => {
            disable_wifi_power_save();
            Some(wifi)
        }
        Err(err) => {
            warn!("wifi unavailable, running offline: {err:#}");
            None
        }
    };

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let mqtt_client = if wifi.is_some() && runtime.network.mqtt_enabled() {
        match create_mqtt_client(&runtime.network) {
            Ok((client, conn)) => {
                let client = Arc::new(Mutex::new(client));
                if let Err(err) = subscribe_topics(&client) {
                    warn!("mqtt subscribe failed: {err:#}");
                }
                spawn_mqtt_receiver(shared_state.clone(), conn, client.clone());
                Some(client)
            }
            Err(err) => {
                warn!("mqtt client startup failed: {err:#}");
                None
            }
        }
    } else {
        None
    };

    spawn_stepper_thread(shared_state.stepper.clone(), step_pin, dir_pin);
    let (ready_tx, ready_rx) = mpsc::sync_channel(1);
    spawn_control_loop(
        shared_state.clone(),
        peripherals.adc1,
        probe_pins,
        relays,
        mqtt_client,
        &runtime,
        ready_tx,
    );
    match ready_rx.recv() {
        Ok(Ok(status)) => info!(
            "SHT31 found at {:#04x} (status {status:#06x})",
            sht31::DEFAULT_ADDRESS
        ),
        Ok(Err(err)) => halt(&format!("probe initialization failed: {err}")),
        Err(_) => halt("control loop exited during probe initialization"),
    }

    let server = if wifi.is_some() {
        Some(create_http_server(shared_state)?)
    } else {
        None
    };

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_network_defaults(network: &mut NetworkConfig) {
    if let Some(ssid) = option_env!("WIFI_SSID") {
        network.wifi_ssid = ssid.to_string();
    }
    if let Some(pass) = option_env!("WIFI_PASS") {
        network.wifi_pass = pass.to_string();
    }
    if let Some(host) = option_env!("MQTT_HOST") {
        network.mqtt_host = host.to_string();
    }
}

fn halt(reason: &str) -> ! {
    error!("{reason}; halting");
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

impl<'d> BoardProbes<'d> {
    fn open(
        pins: ProbePins,
        adc: &'d AdcDriver<'d, ADC1>,
        echo_timeout_us: u32,
    ) -> anyhow::Result<Self> {
        let adc_config = AdcChannelConfig {
            attenuation: DB_11,
            ..Default::default()
        };
        let i2c = I2cDriver::new(
            pins.i2c0,
            pins.sda,
            pins.scl,
            &I2cConfig::new().baudrate(Hertz(100_000)),
        )
        .context("failed to open I2C0")?;

        Ok(Self {
            i2c,
            ph: AdcChannelDriver::new(adc, pins.ph, &adc_config).context("pH channel")?,
            light: AdcChannelDriver::new(adc, pins.light, &adc_config).context("light channel")?,
            trig: PinDriver::output(pins.trig)?,
            echo: PinDriver::input(pins.echo)?,
            echo_timeout_us,
        })
    }

    fn init_climate_sensor(&mut self) -> anyhow::Result<u16> {
        self.i2c
            .write(sht31::DEFAULT_ADDRESS, &sht31::CMD_SOFT_RESET, BLOCK)
            .context("soft reset")?;
        FreeRtos::delay_ms(2);

        let mut frame = [0_u8; 3];
        self.i2c
            .write_read(
                sht31::DEFAULT_ADDRESS,
                &sht31::CMD_READ_STATUS,
                &mut frame,
                BLOCK,
            )
            .context("status read")?;
        Ok(sht31::decode_status(&frame)?)
    }

    fn wait_for_echo(&self, level_high: bool, timeout_us: u32) -> Result<Instant, SensorError> {
        let started = Instant::now();
        while self.echo.is_high() != level_high {
            if started.elapsed().as_micros() > u128::from(timeout_us) {
                return Err(SensorError::EchoTimeout(timeout_us));
            }
        }
        Ok(Instant::now())
    }
}

fn bus_error(err: impl core::fmt::Display) -> SensorError {
    SensorError::Bus(err.to_string())
}

impl Probes for BoardProbes<'_> {
    fn read_climate(&mut self) -> Result<ClimateReading, SensorError> {
        self.i2c
            .write(sht31::DEFAULT_ADDRESS, &sht31::CMD_MEASURE_HIGH, BLOCK)
            .map_err(bus_error)?;
        FreeRtos::delay_ms(sht31::MEASUREMENT_DELAY_MS);

        let mut frame = [0_u8; 6];
        self.i2c
            .read(sht31::DEFAULT_ADDRESS, &mut frame, BLOCK)
            .map_err(bus_error)?;
        sht31::decode_measurement(&frame)
    }

    fn read_ph_raw(&mut self) -> Result<u16, SensorError> {
        self.ph.read_raw().map_err(bus_error)
    }

    fn measure_echo_us(&mut self) -> Result<u32, SensorError> {
        self.trig.set_low().map_err(bus_error)?;
        Ets::delay_us(2);
        self.trig.set_high().map_err(bus_error)?;
        Ets::delay_us(10);
        self.trig.set_low().map_err(bus_error)?;

        let rising = self.wait_for_echo(true, self.echo_timeout_us)?;
        let falling = self.wait_for_echo(false, self.echo_timeout_us)?;
        Ok(falling
            .duration_since(rising)
            .as_micros()
            .try_into()
            .unwrap_or(u32::MAX))
    }

    fn read_light_raw(&mut self) -> Result<u16, SensorError> {
        self.light.read_raw().map_err(bus_error)
    }
}

impl RelayBank {
    fn new(pins: [(Relay, AnyOutputPin, i32); 4]) -> anyhow::Result<Self> {
        let mut bank = Vec::with_capacity(pins.len());
        for (relay, pin, number) in pins {
            let driver = PinDriver::output(pin)
                .with_context(|| format!("failed to claim GPIO{number} for {}", relay.as_str()))?;
            bank.push((relay, driver));
        }
        Ok(Self { pins: bank })
    }

    /// Relays are active-high.
    fn set(&mut self, relay: Relay, on: bool) -> anyhow::Result<()> {
        let (_, pin) = self
            .pins
            .iter_mut()
            .find(|(candidate, _)| *candidate == relay)
            .ok_or_else(|| anyhow!("no pin wired for {}", relay.as_str()))?;
        if on {
            pin.set_high()?;
        } else {
            pin.set_low()?;
        }
        Ok(())
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.is_empty() {
        return Err(anyhow!("no wifi credentials built in"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

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
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi attempt {attempt}/{WIFI_CONNECT_ATTEMPTS} failed: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    if let Some(err) = last_err {
        let _ = wifi.stop();
        return Err(err).context("all wifi connect attempts failed");
    }

    if let Ok(ip_info) = wifi.wifi().sta_netif().get_ip_info() {
        info!("dashboard at http://{}/", ip_info.ip);
    }
    drop(wifi);
    Ok(esp_wifi)
}

fn create_http_server(state: SharedState) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
            let cache_control = state.facade.lock().unwrap().dashboard_cache_control();
            req.into_response(
                200,
                Some("OK"),
                &[
                    ("Content-Type", "text/html; charset=utf-8"),
                    ("Cache-Control", cache_control.as_str()),
                ],
            )?
            .write_all(DASHBOARD_HTML.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/data", Method::Get, move |req| {
            let now_ms = monotonic_ms();
            let (response, cache_control) = {
                let mut facade = state.facade.lock().unwrap();
                let scheduler = state.scheduler.lock().unwrap();
                (facade.data(now_ms, &scheduler), facade.data_cache_control())
            };

            match response {
                DataResponse::NotModified => {
                    req.into_status_response(304)?;
                }
                DataResponse::Fresh(payload) => {
                    let body = serde_json::to_vec(&payload)?;
                    req.into_response(
                        200,
                        Some("OK"),
                        &[
                            ("Content-Type", "application/json; charset=utf-8"),
                            ("Cache-Control", cache_control.as_str()),
                        ],
                    )?
                    .write_all(&body)?;
                }
            }
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/control", Method::Post, move |mut req| {
            let response = match read_request_body(&mut req) {
                Ok(body) => {
                    let now_ms = monotonic_ms();
                    let mut facade = state.facade.lock().unwrap();
                    let mut scheduler = state.scheduler.lock().unwrap();
                    facade.control(now_ms, &body, &mut scheduler)
                }
                Err(err) => ControlResponse {
                    status: 400,
                    message: format!("{err:#}"),
                },
            };

            if response.status == 200 && !response.message.is_empty() {
                info!("{}", response.message);
            }
            write_control_response(req, &response)?;
            Ok(())
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/status", Method::Get, move |req| {
        let status = state.scheduler.lock().unwrap().status(monotonic_ms());
        write_json(req, &status)
    })?;

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

/// Plain-text body on success, `{"error": ..}` JSON otherwise.
fn write_control_response(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    response: &ControlResponse,
) -> anyhow::Result<()> {
    if response.status == 200 {
        req.into_response(200, Some("OK"), &[("Content-Type", "text/plain")])?
            .write_all(response.message.as_bytes())?;
        return Ok(());
    }

    let body = serde_json::to_vec(&serde_json::json!({ "error": response.message }))?;
    req.into_response(
        response.status,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn create_mqtt_client(
    network: &NetworkConfig,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some("aeroponic-controller"),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        lwt: Some(LwtConfiguration {
            topic: TOPIC_CONTROLLER_AVAILABILITY,
            payload: b"offline",
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        ..Default::default()
    };

    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn subscribe_topics(mqtt: &Arc<Mutex<EspMqttClient<'static>>>) -> anyhow::Result<()> {
    let mut mqtt = mqtt.lock().unwrap();
    for topic in [TOPIC_CMD_LIGHT_THRESHOLD, TOPIC_CMD_PH_TARGET] {
        mqtt.subscribe(topic, QoS::AtMostOnce)?;
    }
    Ok(())
}

fn spawn_mqtt_receiver(
    state: SharedState,
    mut conn: EspMqttConnection,
    mqtt: Arc<Mutex<EspMqttClient<'static>>>,
) {
    let spawned = thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        let published = mqtt.lock().unwrap().enqueue(
                            TOPIC_CONTROLLER_AVAILABILITY,
                            QoS::AtLeastOnce,
                            true,
                            b"online",
                        );
                        if let Err(err) = published {
                            warn!("availability publish failed: {err:?}");
                        }
                    }
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => {
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }
                        if let Err(err) = handle_mqtt_message(&state, topic, data) {
                            warn!("mqtt message handling failed: {err:#}");
                        }
                    }
                    _ => {}
                },
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    if let Err(sub_err) = subscribe_topics(&mqtt) {
                        warn!("mqtt re-subscribe failed: {sub_err:#}");
                    }
                }
            }
        });

    if let Err(err) = spawned {
        warn!("failed to spawn mqtt receiver thread: {err}");
    }
}

fn handle_mqtt_message(state: &SharedState, topic: &str, payload: &[u8]) -> anyhow::Result<()> {
    let Some(key) = command_key(topic) else {
        return Ok(());
    };

    let update = SetpointUpdate::from_payload(key, payload)
        .with_context(|| format!("rejected command on {topic}"))?;
    let message = state.scheduler.lock().unwrap().apply_setpoint(update);
    info!("{message} (mqtt)");
    Ok(())
}

/// Probes are opened on the control thread; the outcome of the SHT31 probe
/// is reported through `ready` before the first loop pass.
fn spawn_control_loop(
    state: SharedState,
    adc1: ADC1,
    probe_pins: ProbePins,
    mut relays: RelayBank,
    mqtt: Option<Arc<Mutex<EspMqttClient<'static>>>>,
    runtime: &RuntimeConfig,
    ready: mpsc::SyncSender<Result<u16, String>>,
) {
    let period = Duration::from_millis(runtime.control_loop_period_ms);
    let telemetry_interval_ms = runtime.network.telemetry_interval_ms;
    let reader = SensorReader::new(runtime.reservoir.clone());
    let echo_timeout_us = runtime.reservoir.echo_timeout_us;

    let spawned = thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            let adc = match AdcDriver::new(adc1) {
                Ok(adc) => adc,
                Err(err) => {
                    let _ = ready.send(Err(format!("failed to open ADC1: {err}")));
                    return;
                }
            };
            let opened = BoardProbes::open(probe_pins, &adc, echo_timeout_us).and_then(
                |mut probes| {
                    let status = probes
                        .init_climate_sensor()
                        .context("couldn't find SHT31 climate sensor")?;
                    Ok((probes, status))
                },
            );
            let mut probes = match opened {
                Ok((probes, status)) => {
                    let _ = ready.send(Ok(status));
                    probes
                }
                Err(err) => {
                    let _ = ready.send(Err(format!("{err:#}")));
                    return;
                }
            };

            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut last_state_publish_ms = 0_u64;

            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                let readings = reader.sample(&mut probes);
                let distance_to_go = state.stepper.lock().unwrap().distance_to_go();

                let actions = {
                    let mut scheduler = state.scheduler.lock().unwrap();
                    scheduler.update_readings(&readings);
                    scheduler.update_stepper(distance_to_go);
                    scheduler.tick(now_ms)
                };

                execute_actions(&state, &mut relays, actions);

                if let Some(mqtt) = &mqtt {
                    if now_ms.saturating_sub(last_state_publish_ms) >= telemetry_interval_ms {
                        last_state_publish_ms = now_ms;
                        if let Err(err) = publish_state(&state, mqtt) {
                            warn!("state publish failed: {err:#}");
                        }
                    }
                }

                thread::sleep(period);
            }
        });

    if let Err(err) = spawned {
        halt(&format!("failed to spawn control loop thread: {err}"));
    }
}

fn execute_actions(state: &SharedState, relays: &mut RelayBank, actions: Vec<SchedulerAction>) {
    for action in actions {
        let result = match action {
            SchedulerAction::RelayOn(relay) => relays.set(relay, true),
            SchedulerAction::RelayOff(relay) => relays.set(relay, false),
            SchedulerAction::Rotate { steps } => {
                state.stepper.lock().unwrap().move_by(i64::from(steps));
                info!("rotating platform {steps} steps");
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!("failed to apply {action:?}: {err:#}");
        }
    }
}

fn publish_state(
    state: &SharedState,
    mqtt: &Arc<Mutex<EspMqttClient<'static>>>,
) -> anyhow::Result<()> {
    let payload = {
        let scheduler = state.scheduler.lock().unwrap();
        serde_json::to_vec(&scheduler.status(monotonic_ms()))?
    };

    mqtt.lock()
        .unwrap()
        .enqueue(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, &payload)?;
    Ok(())
}

fn spawn_stepper_thread(
    stepper: Arc<Mutex<StepGenerator>>,
    mut step_pin: PinDriver<'static, AnyOutputPin, Output>,
    mut dir_pin: PinDriver<'static, AnyOutputPin, Output>,
) {
    let spawned = thread::Builder::new()
        .name("stepper".into())
        .stack_size(4 * 1024)
        .spawn(move || loop {
            let (pulse, idle) = {
                let mut generator = stepper.lock().unwrap();
                (generator.poll(monotonic_us()), generator.is_idle())
            };

            if let Some(direction) = pulse {
                if let Err(err) = emit_step(&mut step_pin, &mut dir_pin, direction) {
                    warn!("step pulse failed: {err}");
                }
            }

            if idle {
                thread::sleep(STEPPER_IDLE_POLL);
            } else {
                thread::sleep(Duration::from_micros(500));
            }
        });

    if let Err(err) = spawned {
        halt(&format!("failed to spawn stepper thread: {err}"));
    }
}

fn emit_step(
    step_pin: &mut PinDriver<'static, AnyOutputPin, Output>,
    dir_pin: &mut PinDriver<'static, AnyOutputPin, Output>,
    direction: StepDirection,
) -> Result<(), EspError> {
    match direction {
        StepDirection::Forward => dir_pin.set_high()?,
        StepDirection::Reverse => dir_pin.set_low()?,
    }
    step_pin.set_high()?;
    Ets::delay_us(STEP_PULSE_US);
    step_pin.set_low()
}

/// `ESP_ERR_INVALID_STATE` means the watchdog or task is already set up.
fn wdt_result(rc: esp_idf_svc::sys::esp_err_t, call: &str) -> anyhow::Result<()> {
    match rc {
        esp_idf_svc::sys::ESP_OK | esp_idf_svc::sys::ESP_ERR_INVALID_STATE => Ok(()),
        _ => Err(anyhow!("{call} returned esp_err_t={rc}")),
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    wdt_result(
        unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) },
        "esp_task_wdt_init",
    )
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    wdt_result(
        unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) },
        "esp_task_wdt_add",
    )
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

fn boot_elapsed() -> Duration {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed()
}

fn monotonic_ms() -> u64 {
    boot_elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}

fn monotonic_us() -> u64 {
    boot_elapsed().as_micros().try_into().unwrap_or(u64::MAX)
}
