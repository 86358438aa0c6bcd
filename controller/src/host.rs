use std::{
    collections::HashMap,
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, OnceLock},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{Mutex, Notify},
};
use tracing::{info, warn};

use climate_common::{
    entity_from_state_topic, hvac_mode_topic, script_topic, snapshot::parse_device_payload,
    snapshot::parse_sensor_payload, snapshot::parse_weather_payload, temperature_topic,
    ClimateConfig, ClimateDeviceState, ControlMode, ControlSettings, Coordinator, CycleReport,
    DeviceCommand, Profile, RoomId, SettingsOverlay, Snapshot, TOPIC_CMD_MODE, TOPIC_CMD_PROFILE,
    TOPIC_CMD_REFRESH, TOPIC_CMD_TARGET, TOPIC_CMD_TOLERANCE, TOPIC_CONTROLLER_STATE,
    TOPIC_STATE_FILTER,
};
use climate_common::types::OutdoorSourceKind;

const MAX_MQTT_PAYLOAD_BYTES: usize = 4096;
const REFRESH_DEBOUNCE_MS: u64 = 500;

#[derive(Clone)]
struct AppState {
    coordinator: Arc<Mutex<Coordinator>>,
    cache: Arc<Mutex<StateCache>>,
    last_report: Arc<Mutex<Option<CycleReport>>>,
    refresh: Arc<Notify>,
    mqtt: AsyncClient,
    store: AppStore,
}

/// Latest parsed entity states received over MQTT. Entities whose state
/// became unavailable are removed, never kept stale.
#[derive(Default)]
struct StateCache {
    sensors: HashMap<String, f64>,
    weather: HashMap<String, f64>,
    devices: HashMap<String, ClimateDeviceState>,
}

#[derive(Clone)]
struct AppStore {
    config_path: Arc<PathBuf>,
    options_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusBody {
    #[serde(rename = "nowEpoch")]
    now_epoch: i64,
    cycle: Option<CycleReport>,
}

#[derive(Debug, Serialize)]
struct ConfigUpdateResponse {
    #[serde(rename = "restartRequired")]
    restart_required: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut config = store.load_config().await.unwrap_or_else(|err| {
        warn!("failed to load climate config from store: {err:#}");
        ClimateConfig::default()
    });
    config.sanitize();
    config
        .validate()
        .context("rejecting invalid climate configuration")?;

    let options = store.load_options().await.unwrap_or_else(|err| {
        warn!("failed to load options from store: {err:#}");
        SettingsOverlay::default()
    });

    let coordinator = Coordinator::new(&config, options);

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(config.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new("smart-climate-controller", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(config.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(config.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        coordinator: Arc::new(Mutex::new(coordinator)),
        cache: Arc::new(Mutex::new(StateCache::default())),
        last_report: Arc::new(Mutex::new(None)),
        refresh: Arc::new(Notify::new()),
        mqtt,
        store,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone());
    // Run a first cycle shortly after startup instead of waiting a full
    // update interval.
    app_state.refresh.notify_one();

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/mode", post(handle_set_mode))
        .route("/api/profile", post(handle_set_profile))
        .route("/api/target", post(handle_set_target))
        .route("/api/tolerance", post(handle_set_tolerance))
        .route("/api/refresh", post(handle_refresh))
        .route("/api/rooms/{room_id}/enabled", post(handle_set_room_enabled))
        .route("/api/rooms/{room_id}/target", post(handle_set_room_target))
        .route(
            "/api/rooms/{room_id}/tolerance",
            post(handle_set_room_tolerance),
        )
        .route(
            "/api/config",
            get(handle_get_config).put(handle_put_config),
        )
        .route(
            "/api/options",
            get(handle_get_options).put(handle_put_options),
        )
        .with_state(app_state);

    let port = std::env::var("CONTROLLER_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    let topics = [
        TOPIC_STATE_FILTER,
        TOPIC_CMD_MODE,
        TOPIC_CMD_PROFILE,
        TOPIC_CMD_TARGET,
        TOPIC_CMD_TOLERANCE,
        TOPIC_CMD_REFRESH,
    ];

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
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

/// Periodic control loop. Sensor events request an early cycle through
/// `refresh`; the debounce window coalesces bursts. The coordinator mutex
/// guarantees one in-flight cycle at a time no matter who triggers it.
fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        loop {
            let interval_secs = {
                app_state
                    .coordinator
                    .lock()
                    .await
                    .settings
                    .update_interval_secs()
            };

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval_secs)) => {}
                _ = app_state.refresh.notified() => {
                    tokio::time::sleep(Duration::from_millis(REFRESH_DEBOUNCE_MS)).await;
                }
            }

            run_control_cycle(&app_state).await;
        }
    });
}

async fn run_control_cycle(app_state: &AppState) {
    let now_ms = monotonic_ms();

    let outcome = {
        let mut coordinator = app_state.coordinator.lock().await;
        let snapshot = {
            let cache = app_state.cache.lock().await;
            build_snapshot(&cache, &coordinator.settings.data)
        };
        coordinator.run_cycle(&snapshot, now_ms)
    };

    for command in &outcome.commands {
        info!("device command: {command:?}");
        if let Err(err) = publish_command(&app_state.mqtt, command).await {
            warn!("device command publish failed: {err:#}");
        }
    }

    match serde_json::to_vec(&outcome.report) {
        Ok(body) => {
            if let Err(err) = app_state
                .mqtt
                .publish(TOPIC_CONTROLLER_STATE, QoS::AtLeastOnce, true, body)
                .await
            {
                warn!("controller state publish failed: {err}");
            }
        }
        Err(err) => warn!("controller state serialization failed: {err}"),
    }

    *app_state.last_report.lock().await = Some(outcome.report);
}

fn build_snapshot(cache: &StateCache, settings: &ControlSettings) -> Snapshot {
    let outdoor_temp = settings.outdoor_entity().and_then(|entity| {
        match settings.outdoor_source {
            OutdoorSourceKind::Weather => cache.weather.get(entity).copied(),
            OutdoorSourceKind::Sensor => cache.sensors.get(entity).copied(),
        }
    });
    Snapshot {
        sensors: cache.sensors.clone(),
        outdoor_temp,
        devices: cache.devices.clone(),
    }
}

async fn publish_command(mqtt: &AsyncClient, command: &DeviceCommand) -> anyhow::Result<()> {
    match command {
        DeviceCommand::SetHvacMode { device, mode } => {
            mqtt.publish(hvac_mode_topic(device), QoS::AtLeastOnce, false, mode.as_str())
                .await?;
        }
        DeviceCommand::SetTemperature { device, setpoint } => {
            mqtt.publish(
                temperature_topic(device),
                QoS::AtLeastOnce,
                false,
                format!("{setpoint:.1}"),
            )
            .await?;
        }
        DeviceCommand::RunScript { script } => {
            mqtt.publish(script_topic(script), QoS::AtLeastOnce, false, "run")
                .await?;
        }
    }
    Ok(())
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: String,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;

    if let Some(entity) = entity_from_state_topic(&topic) {
        handle_entity_state(app_state, entity, &message).await;
        return Ok(());
    }

    match topic.as_str() {
        TOPIC_CMD_MODE => {
            if let Some(mode) = parse_mode(&message) {
                app_state.coordinator.lock().await.settings.overrides.mode = Some(mode);
                app_state.refresh.notify_one();
            }
        }
        TOPIC_CMD_PROFILE => {
            if let Some(profile) = parse_profile(&message) {
                app_state.coordinator.lock().await.settings.overrides.profile = Some(profile);
                app_state.refresh.notify_one();
            }
        }
        TOPIC_CMD_TARGET => {
            if let Ok(target) = message.trim().parse::<f64>() {
                if target.is_finite() && (5.0..=35.0).contains(&target) {
                    app_state
                        .coordinator
                        .lock()
                        .await
                        .settings
                        .overrides
                        .global_target = Some(target);
                    app_state.refresh.notify_one();
                }
            }
        }
        TOPIC_CMD_TOLERANCE => {
            if let Ok(tolerance) = message.trim().parse::<f64>() {
                if tolerance.is_finite() && (0.1..=5.0).contains(&tolerance) {
                    app_state
                        .coordinator
                        .lock()
                        .await
                        .settings
                        .overrides
                        .global_tolerance = Some(tolerance);
                    app_state.refresh.notify_one();
                }
            }
        }
        TOPIC_CMD_REFRESH => {
            app_state.refresh.notify_one();
        }
        _ => {}
    }

    Ok(())
}

async fn handle_entity_state(app_state: &AppState, entity: &str, message: &str) {
    let watched = {
        let coordinator = app_state.coordinator.lock().await;
        coordinator.watched_sensors().iter().any(|s| s == entity)
    };

    let mut cache = app_state.cache.lock().await;
    if entity.starts_with("climate.") {
        match parse_device_payload(message) {
            Some(state) => {
                cache.devices.insert(entity.to_string(), state);
            }
            None => {
                cache.devices.remove(entity);
            }
        }
        // Device echoes never trigger a cycle; only sensors do.
        return;
    }

    let parsed = if entity.starts_with("weather.") {
        let value = parse_weather_payload(message);
        match value {
            Some(value) => {
                cache.weather.insert(entity.to_string(), value);
            }
            None => {
                cache.weather.remove(entity);
            }
        }
        value
    } else {
        let value = parse_sensor_payload(message);
        match value {
            Some(value) => {
                cache.sensors.insert(entity.to_string(), value);
            }
            None => {
                cache.sensors.remove(entity);
            }
        }
        value
    };
    drop(cache);

    if watched {
        if parsed.is_none() {
            info!("watched entity {entity} became unavailable");
        }
        app_state.refresh.notify_one();
    }
}

fn parse_mode(value: &str) -> Option<ControlMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "off" => Some(ControlMode::Off),
        "per_room" => Some(ControlMode::PerRoom),
        "global" => Some(ControlMode::Global),
        _ => None,
    }
}

fn parse_profile(value: &str) -> Option<Profile> {
    match value.trim().to_ascii_lowercase().as_str() {
        "normal" => Some(Profile::Normal),
        "fast" => Some(Profile::Fast),
        "extreme" => Some(Profile::Extreme),
        _ => None,
    }
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let cycle = state.last_report.lock().await.clone();
    Json(StatusBody {
        now_epoch: Utc::now().timestamp(),
        cycle,
    })
}

async fn handle_set_mode(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(mode) = parse_mode(value) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid mode. Use 'off', 'per_room' or 'global'",
        );
    };

    state.coordinator.lock().await.settings.overrides.mode = Some(mode);
    state.refresh.notify_one();
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_profile(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Some(profile) = parse_profile(value) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid profile. Use 'normal', 'fast' or 'extreme'",
        );
    };

    state.coordinator.lock().await.settings.overrides.profile = Some(profile);
    state.refresh.notify_one();
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_target(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(target) = value.parse::<f64>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    };
    if !target.is_finite() || !(5.0..=35.0).contains(&target) {
        return error_response(StatusCode::BAD_REQUEST, "Target must be between 5 and 35");
    }

    state
        .coordinator
        .lock()
        .await
        .settings
        .overrides
        .global_target = Some(target);
    state.refresh.notify_one();
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_tolerance(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(value) = params.get("value") else {
        return error_response(StatusCode::BAD_REQUEST, "Missing 'value' parameter");
    };
    let Ok(tolerance) = value.parse::<f64>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid tolerance value (0.1-5.0)");
    };
    if !tolerance.is_finite() || !(0.1..=5.0).contains(&tolerance) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid tolerance value (0.1-5.0)");
    }

    state
        .coordinator
        .lock()
        .await
        .settings
        .overrides
        .global_tolerance = Some(tolerance);
    state.refresh.notify_one();
    handle_get_status(State(state)).await.into_response()
}

async fn handle_refresh(State(state): State<AppState>) -> impl IntoResponse {
    state.refresh.notify_one();
    handle_get_status(State(state)).await.into_response()
}

/// Room lookup shared by the per-room override handlers.
async fn known_room(state: &AppState, room_id: &str) -> Option<RoomId> {
    let coordinator = state.coordinator.lock().await;
    coordinator
        .rooms()
        .iter()
        .find(|room| room.room_id.as_str() == room_id)
        .map(|room| room.room_id.clone())
}

async fn handle_set_room_enabled(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(room) = known_room(&state, &room_id).await else {
        return error_response(StatusCode::NOT_FOUND, "Unknown room");
    };
    let Some(enabled) = params.get("value").and_then(|v| v.parse::<bool>().ok()) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid 'value', use true or false");
    };

    state
        .coordinator
        .lock()
        .await
        .settings
        .overrides
        .room_enabled
        .insert(room, enabled);
    state.refresh.notify_one();
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_room_target(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(room) = known_room(&state, &room_id).await else {
        return error_response(StatusCode::NOT_FOUND, "Unknown room");
    };
    let Some(target) = params.get("value").and_then(|v| v.parse::<f64>().ok()) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid temperature value");
    };
    if !target.is_finite() || !(5.0..=35.0).contains(&target) {
        return error_response(StatusCode::BAD_REQUEST, "Target must be between 5 and 35");
    }

    state
        .coordinator
        .lock()
        .await
        .settings
        .overrides
        .room_targets
        .insert(room, target);
    state.refresh.notify_one();
    handle_get_status(State(state)).await.into_response()
}

async fn handle_set_room_tolerance(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(room) = known_room(&state, &room_id).await else {
        return error_response(StatusCode::NOT_FOUND, "Unknown room");
    };
    let Some(tolerance) = params.get("value").and_then(|v| v.parse::<f64>().ok()) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid tolerance value (0.1-5.0)");
    };
    if !tolerance.is_finite() || !(0.1..=5.0).contains(&tolerance) {
        return error_response(StatusCode::BAD_REQUEST, "Invalid tolerance value (0.1-5.0)");
    }

    state
        .coordinator
        .lock()
        .await
        .settings
        .overrides
        .room_tolerances
        .insert(room, tolerance);
    state.refresh.notify_one();
    handle_get_status(State(state)).await.into_response()
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.store.load_config().await.unwrap_or_else(|err| {
        warn!("failed to load config from store: {err:#}");
        ClimateConfig::default()
    });
    Json(config)
}

async fn handle_put_config(
    State(state): State<AppState>,
    Json(mut config): Json<ClimateConfig>,
) -> impl IntoResponse {
    config.sanitize();
    if let Err(err) = config.validate() {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }

    let previous = state.store.load_config().await.ok();
    if let Err(err) = state.store.save_config(&config).await {
        warn!("failed to persist config update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist configuration",
        );
    }

    {
        let mut coordinator = state.coordinator.lock().await;
        coordinator.apply_config(&config);
    }
    state.refresh.notify_one();

    let restart_required = previous
        .map(|prev| {
            let prev = serde_json::to_value(&prev.network).ok();
            let next = serde_json::to_value(&config.network).ok();
            prev != next
        })
        .unwrap_or(false);
    Json(ConfigUpdateResponse { restart_required }).into_response()
}

async fn handle_get_options(State(state): State<AppState>) -> impl IntoResponse {
    let options = state.store.load_options().await.unwrap_or_else(|err| {
        warn!("failed to load options from store: {err:#}");
        SettingsOverlay::default()
    });
    Json(options)
}

async fn handle_put_options(
    State(state): State<AppState>,
    Json(options): Json<SettingsOverlay>,
) -> impl IntoResponse {
    if let Err(err) = state.store.save_options(&options).await {
        warn!("failed to persist options update: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist options");
    }

    {
        let mut coordinator = state.coordinator.lock().await;
        coordinator.settings.options = options;
    }
    state.refresh.notify_one();
    handle_get_options(State(state)).await.into_response()
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("CLIMATE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.climate"));

        Self {
            config_path: Arc::new(data_dir.join("config.json")),
            options_path: Arc::new(data_dir.join("options.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_config(&self) -> anyhow::Result<ClimateConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.config_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<ClimateConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(ClimateConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_config(&self, config: &ClimateConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.config_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(config)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }

    async fn load_options(&self) -> anyhow::Result<SettingsOverlay> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.options_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<SettingsOverlay>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(SettingsOverlay::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_options(&self, options: &SettingsOverlay) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.options_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(options)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
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
