use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex, time::MissedTickBehavior};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use aeroponic_common::{
    command_key, ActuationScheduler, DataResponse, HttpFacade, NetworkConfig, RuntimeConfig,
    SchedulerAction, SensorReader, SetpointUpdate, StepGenerator, TOPIC_CMD_LIGHT_THRESHOLD,
    TOPIC_CMD_PH_TARGET, TOPIC_CONTROLLER_AVAILABILITY, TOPIC_CONTROLLER_STATE,
};

use crate::{sim::SimulatedRig, DASHBOARD_HTML};

const MAX_MQTT_PAYLOAD_BYTES: usize = 64;
const STEPPER_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone)]
struct AppState {
    scheduler: Arc<Mutex<ActuationScheduler>>,
    facade: Arc<Mutex<HttpFacade>>,
    stepper: Arc<Mutex<StepGenerator>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = load_runtime_config().await?;

    let scheduler = ActuationScheduler::new(
        runtime.scheduler.clone(),
        runtime.reservoir.clone(),
        runtime.setpoints,
    );
    let mut rig = SimulatedRig::new(runtime.reservoir.clone());
    let app_state = AppState {
        facade: Arc::new(Mutex::new(HttpFacade::new(runtime.http.clone()))),
        stepper: Arc::new(Mutex::new(StepGenerator::new(&runtime.stepper))),
        scheduler: Arc::new(Mutex::new(scheduler)),
    };

    let initial = app_state.scheduler.lock().await.initial_actions();
    execute_actions(&app_state, &mut rig, initial).await;

    spawn_stepper_loop(app_state.stepper.clone());
    spawn_control_loop(
        app_state.clone(),
        rig,
        SensorReader::new(runtime.reservoir.clone()),
        Duration::from_millis(runtime.control_loop_period_ms),
    );

    if runtime.network.mqtt_enabled() {
        let (mqtt, eventloop) = AsyncClient::new(mqtt_options(&runtime.network), 64);
        subscribe_topics(&mqtt).await?;
        spawn_mqtt_loop(app_state.clone(), mqtt.clone(), eventloop);
        spawn_state_publish_loop(
            app_state.clone(),
            mqtt,
            Duration::from_millis(runtime.network.telemetry_interval_ms),
        );
    } else {
        info!("no MQTT broker configured, telemetry disabled");
    }

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, build_router(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn load_runtime_config() -> anyhow::Result<RuntimeConfig> {
    let mut runtime = match std::env::var_os("AEROPONIC_CONFIG") {
        Some(path) => {
            let raw = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read config {}", path.to_string_lossy()))?;
            RuntimeConfig::from_json_slice(&raw)?
        }
        None => RuntimeConfig::default(),
    };

    let network = &mut runtime.network;
    if let Ok(host) = std::env::var("MQTT_HOST") {
        network.mqtt_host = host;
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        network.mqtt_user = user;
    }
    if let Ok(pass) = std::env::var("MQTT_PASS") {
        network.mqtt_pass = pass;
    }

    runtime.validate().context("invalid runtime configuration")?;
    Ok(runtime)
}

fn mqtt_options(network: &NetworkConfig) -> MqttOptions {
    let mut options = MqttOptions::new(
        "aeroponic-controller-rust",
        network.mqtt_host.clone(),
        network.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    options.set_last_will(LastWill::new(
        TOPIC_CONTROLLER_AVAILABILITY,
        "offline",
        QoS::AtLeastOnce,
        true,
    ));
    if !network.mqtt_user.is_empty() {
        options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
    }
    options
}

fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_dashboard))
        .route("/data", get(handle_get_data))
        .route("/control", post(handle_post_control))
        .route("/status", get(handle_get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    for topic in [TOPIC_CMD_LIGHT_THRESHOLD, TOPIC_CMD_PH_TARGET] {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mqtt: AsyncClient, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, &message.payload).await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    // the eventloop task must not block on its own request queue
                    if let Err(err) = mqtt.try_publish(
                        TOPIC_CONTROLLER_AVAILABILITY,
                        QoS::AtLeastOnce,
                        true,
                        "online",
                    ) {
                        warn!("availability publish failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_control_loop(
    app_state: AppState,
    mut rig: SimulatedRig,
    reader: SensorReader,
    period: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            rig.advance(now_ms);
            let readings = reader.sample(&mut rig);
            let distance_to_go = app_state.stepper.lock().await.distance_to_go();

            let actions = {
                let mut scheduler = app_state.scheduler.lock().await;
                scheduler.update_readings(&readings);
                scheduler.update_stepper(distance_to_go);
                scheduler.tick(now_ms)
            };

            if !actions.is_empty() {
                execute_actions(&app_state, &mut rig, actions).await;
            }
        }
    });
}

fn spawn_stepper_loop(stepper: Arc<Mutex<StepGenerator>>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STEPPER_POLL_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let mut generator = stepper.lock().await;
            if generator.poll(monotonic_us()).is_some() && generator.is_idle() {
                info!("platform stopped at step {}", generator.position());
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState, mqtt: AsyncClient, period: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;

            let payload = {
                let scheduler = app_state.scheduler.lock().await;
                serde_json::to_vec(&scheduler.status(monotonic_ms()))
            };

            match payload {
                Ok(body) => {
                    if let Err(err) = mqtt
                        .publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("controller state publish failed: {err}");
                    }
                }
                Err(err) => warn!("controller state serialization failed: {err}"),
            }
        }
    });
}

async fn execute_actions(
    app_state: &AppState,
    rig: &mut SimulatedRig,
    actions: Vec<SchedulerAction>,
) {
    for action in actions {
        match action {
            SchedulerAction::RelayOn(relay) => {
                rig.set_relay(relay, true);
                info!("{} on", relay.as_str());
            }
            SchedulerAction::RelayOff(relay) => {
                rig.set_relay(relay, false);
                info!("{} off", relay.as_str());
            }
            SchedulerAction::Rotate { steps } => {
                app_state.stepper.lock().await.move_by(i64::from(steps));
                info!("rotating platform {steps} steps");
            }
        }
    }
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: &str,
    payload: &[u8],
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let Some(key) = command_key(topic) else {
        return Ok(());
    };

    let update = SetpointUpdate::from_payload(key, payload)
        .with_context(|| format!("rejected command on {topic}"))?;
    let message = app_state.scheduler.lock().await.apply_setpoint(update);
    info!("{message} (mqtt)");
    Ok(())
}

async fn handle_dashboard(State(state): State<AppState>) -> impl IntoResponse {
    let cache_control = state.facade.lock().await.dashboard_cache_control();
    (
        [
            (header::CONTENT_TYPE, "text/html; charset=utf-8".to_string()),
            (header::CACHE_CONTROL, cache_control),
        ],
        DASHBOARD_HTML,
    )
}

async fn handle_get_data(State(state): State<AppState>) -> Response {
    let now_ms = monotonic_ms();
    let mut facade = state.facade.lock().await;
    let response = {
        let scheduler = state.scheduler.lock().await;
        facade.data(now_ms, &scheduler)
    };

    match response {
        DataResponse::NotModified => StatusCode::NOT_MODIFIED.into_response(),
        DataResponse::Fresh(payload) => (
            [(header::CACHE_CONTROL, facade.data_cache_control())],
            Json(payload),
        )
            .into_response(),
    }
}

async fn handle_post_control(State(state): State<AppState>, body: Bytes) -> Response {
    let now_ms = monotonic_ms();
    let response = {
        let mut facade = state.facade.lock().await;
        let mut scheduler = state.scheduler.lock().await;
        facade.control(now_ms, &body, &mut scheduler)
    };

    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_success() {
        if !response.message.is_empty() {
            info!("{}", response.message);
        }
        ([(header::CONTENT_TYPE, "text/plain")], response.message).into_response()
    } else {
        error_response(status, &response.message)
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let scheduler = state.scheduler.lock().await;
    Json(scheduler.status(monotonic_ms()))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
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
