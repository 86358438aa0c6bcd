use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::{OutdoorGate, Thresholds};
use crate::types::{
    AfterReachDumb, AfterReachSmart, AggregationMethod, ArbitrationStrategy, Category,
    ControlMode, Direction, OutdoorPolicy, OutdoorSourceKind, Participation, Profile, RoomId,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate room id `{0}`")]
    DuplicateRoom(RoomId),
    #[error("room `{room}`: dumb device requires both on_script and off_script")]
    MissingScript { room: RoomId },
    #[error("room `{room}`: on_script and off_script must be distinct, got `{script}`")]
    SameScript { room: RoomId, script: String },
    #[error("room `{room}`: `{entity}` is not a script entity")]
    NotAScript { room: RoomId, entity: String },
    #[error(
        "{direction} thresholds must be strictly increasing, got category2={category2} category3={category3}"
    )]
    NonIncreasingThresholds {
        direction: &'static str,
        category2: f64,
        category3: f64,
    },
}

/// Tunable control knobs. This is the persisted *data* layer; the
/// `SettingsStack` resolves it underneath options and runtime overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlSettings {
    pub mode: ControlMode,
    pub profile: Profile,
    pub global_target: f64,
    pub global_tolerance: f64,
    pub aggregation: AggregationMethod,
    pub step_offset: f64,
    pub max_offset: f64,
    /// Seconds of boost before the normal profile ramps one more step.
    pub t_time_secs: u64,
    /// Extra drift past the tolerance edge before boost re-entry.
    pub delta: f64,
    pub update_interval_secs: u64,
    pub min_action_interval_secs: u64,
    pub heat_category2_diff: f64,
    pub heat_category3_diff: f64,
    pub cool_category2_diff: f64,
    pub cool_category3_diff: f64,
    pub outdoor_source: OutdoorSourceKind,
    pub outdoor_weather_entity: Option<String>,
    pub outdoor_sensor_entity: Option<String>,
    pub ac_missing_outdoor_policy: OutdoorPolicy,
    pub min_outdoor_for_heatpump: f64,
    pub max_outdoor_for_cool: f64,
    pub outdoor_min_for_weather_sensitive: f64,
    pub outdoor_max_for_weather_sensitive: f64,
    pub heat_outdoor_target_delta: f64,
    pub cool_outdoor_target_delta: f64,
    pub after_reach_smart: AfterReachSmart,
    pub after_reach_dumb: AfterReachDumb,
    pub shared_arbitration: ArbitrationStrategy,
    pub priority_room: Option<String>,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            mode: ControlMode::Off,
            profile: Profile::Normal,
            global_target: 22.0,
            global_tolerance: 0.3,
            aggregation: AggregationMethod::Average,
            step_offset: 0.5,
            max_offset: 2.0,
            t_time_secs: 300,
            delta: 0.5,
            update_interval_secs: 60,
            min_action_interval_secs: 120,
            heat_category2_diff: 0.5,
            heat_category3_diff: 1.5,
            cool_category2_diff: 0.5,
            cool_category3_diff: 1.5,
            outdoor_source: OutdoorSourceKind::Sensor,
            outdoor_weather_entity: None,
            outdoor_sensor_entity: None,
            ac_missing_outdoor_policy: OutdoorPolicy::Allow,
            min_outdoor_for_heatpump: -15.0,
            max_outdoor_for_cool: 45.0,
            outdoor_min_for_weather_sensitive: -20.0,
            outdoor_max_for_weather_sensitive: 40.0,
            heat_outdoor_target_delta: 2.0,
            cool_outdoor_target_delta: 2.0,
            after_reach_smart: AfterReachSmart::SetTarget,
            after_reach_dumb: AfterReachDumb::TurnOff,
            shared_arbitration: ArbitrationStrategy::MaxDemand,
            priority_room: None,
        }
    }
}

impl ControlSettings {
    pub fn sanitize(&mut self) {
        self.global_target = self.global_target.clamp(5.0, 35.0);
        self.global_tolerance = self.global_tolerance.clamp(0.1, 5.0);
        self.step_offset = self.step_offset.clamp(0.1, 5.0);
        self.max_offset = self.max_offset.clamp(self.step_offset, 10.0);
        self.delta = self.delta.clamp(0.0, 5.0);
        self.t_time_secs = self.t_time_secs.max(30);
        self.update_interval_secs = self.update_interval_secs.clamp(5, 3600);
        self.min_action_interval_secs = self.min_action_interval_secs.clamp(0, 3600);
    }

    pub fn thresholds(&self, direction: Direction) -> Thresholds {
        match direction {
            Direction::Heat => Thresholds {
                category2_diff: self.heat_category2_diff,
                category3_diff: self.heat_category3_diff,
            },
            Direction::Cool => Thresholds {
                category2_diff: self.cool_category2_diff,
                category3_diff: self.cool_category3_diff,
            },
        }
    }

    pub fn outdoor_gate(&self) -> OutdoorGate {
        OutdoorGate {
            missing_policy: self.ac_missing_outdoor_policy,
            min_outdoor_for_heatpump: self.min_outdoor_for_heatpump,
            max_outdoor_for_cool: self.max_outdoor_for_cool,
            window_min: self.outdoor_min_for_weather_sensitive,
            window_max: self.outdoor_max_for_weather_sensitive,
            heat_target_delta: self.heat_outdoor_target_delta,
            cool_target_delta: self.cool_outdoor_target_delta,
        }
    }

    pub fn outdoor_entity(&self) -> Option<&str> {
        match self.outdoor_source {
            OutdoorSourceKind::Weather => self.outdoor_weather_entity.as_deref(),
            OutdoorSourceKind::Sensor => self.outdoor_sensor_entity.as_deref(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.heat_category2_diff >= self.heat_category3_diff {
            return Err(ConfigError::NonIncreasingThresholds {
                direction: "heat",
                category2: self.heat_category2_diff,
                category3: self.heat_category3_diff,
            });
        }
        if self.cool_category2_diff >= self.cool_category3_diff {
            return Err(ConfigError::NonIncreasingThresholds {
                direction: "cool",
                category2: self.cool_category2_diff,
                category3: self.cool_category3_diff,
            });
        }
        Ok(())
    }
}

fn default_dumb_category() -> Category {
    Category::One
}

/// A device controllable only through fire-and-forget script invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumbDeviceConfig {
    pub on_script: String,
    pub off_script: String,
    pub device_type: Direction,
    pub participation: Participation,
    #[serde(default = "default_dumb_category")]
    pub category: Category,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomConfig {
    pub room_id: RoomId,
    pub name: String,
    #[serde(default)]
    pub temp_sensors: Vec<String>,
    #[serde(default)]
    pub heat_category_1: Vec<String>,
    #[serde(default)]
    pub heat_category_2: Vec<String>,
    #[serde(default)]
    pub heat_category_3: Vec<String>,
    #[serde(default)]
    pub cool_category_1: Vec<String>,
    #[serde(default)]
    pub cool_category_2: Vec<String>,
    #[serde(default)]
    pub cool_category_3: Vec<String>,
    #[serde(default)]
    pub weather_sensitive_climates: Vec<String>,
    #[serde(default)]
    pub shared_climates: Vec<String>,
    #[serde(default)]
    pub dumb_devices: Vec<DumbDeviceConfig>,
}

impl RoomConfig {
    pub fn new(room_id: impl Into<RoomId>, name: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            name: name.into(),
            temp_sensors: Vec::new(),
            heat_category_1: Vec::new(),
            heat_category_2: Vec::new(),
            heat_category_3: Vec::new(),
            cool_category_1: Vec::new(),
            cool_category_2: Vec::new(),
            cool_category_3: Vec::new(),
            weather_sensitive_climates: Vec::new(),
            shared_climates: Vec::new(),
            dumb_devices: Vec::new(),
        }
    }

    /// Tier lists for one direction, mildest first.
    pub fn category_lists(&self, direction: Direction) -> [&[String]; 3] {
        match direction {
            Direction::Heat => [
                &self.heat_category_1,
                &self.heat_category_2,
                &self.heat_category_3,
            ],
            Direction::Cool => [
                &self.cool_category_1,
                &self.cool_category_2,
                &self.cool_category_3,
            ],
        }
    }

    pub fn has_devices(&self, direction: Direction) -> bool {
        self.category_lists(direction)
            .iter()
            .any(|list| !list.is_empty())
            || self
                .dumb_devices
                .iter()
                .any(|d| d.device_type == direction && d.participation != Participation::Off)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for dumb in &self.dumb_devices {
            if dumb.on_script.is_empty() || dumb.off_script.is_empty() {
                return Err(ConfigError::MissingScript {
                    room: self.room_id.clone(),
                });
            }
            if dumb.on_script == dumb.off_script {
                return Err(ConfigError::SameScript {
                    room: self.room_id.clone(),
                    script: dumb.on_script.clone(),
                });
            }
            for script in [&dumb.on_script, &dumb.off_script] {
                if !script.starts_with("script.") {
                    return Err(ConfigError::NotAScript {
                        room: self.room_id.clone(),
                        entity: script.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            mqtt_host: "127.0.0.1".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
        }
    }
}

/// Whole persisted configuration: control knobs, room topology, broker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClimateConfig {
    pub settings: ControlSettings,
    pub rooms: Vec<RoomConfig>,
    pub network: NetworkConfig,
}

impl ClimateConfig {
    /// Reject malformed configuration before it ever reaches a control
    /// cycle. Numeric knobs are additionally clamped by `sanitize`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.settings.validate()?;
        let mut seen: Vec<&RoomId> = Vec::new();
        for room in &self.rooms {
            if seen.contains(&&room.room_id) {
                return Err(ConfigError::DuplicateRoom(room.room_id.clone()));
            }
            seen.push(&room.room_id);
            room.validate()?;
        }
        Ok(())
    }

    pub fn sanitize(&mut self) {
        self.settings.sanitize();
    }
}

/// Sparse settings layer: persisted options or in-memory runtime overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsOverlay {
    pub mode: Option<ControlMode>,
    pub profile: Option<Profile>,
    pub global_target: Option<f64>,
    pub global_tolerance: Option<f64>,
    pub update_interval_secs: Option<u64>,
    pub room_targets: BTreeMap<RoomId, f64>,
    pub room_tolerances: BTreeMap<RoomId, f64>,
    pub room_enabled: BTreeMap<RoomId, bool>,
}

/// Single resolution point for a layered setting.
/// Precedence: runtime override > persisted options > persisted data
/// (the data layer itself falls back to built-in defaults via serde).
pub fn resolve<T>(override_value: Option<T>, options_value: Option<T>, data_value: T) -> T {
    override_value.or(options_value).unwrap_or(data_value)
}

#[derive(Debug, Clone, Default)]
pub struct SettingsStack {
    pub data: ControlSettings,
    pub options: SettingsOverlay,
    pub overrides: SettingsOverlay,
}

impl SettingsStack {
    pub fn new(data: ControlSettings, options: SettingsOverlay) -> Self {
        Self {
            data,
            options,
            overrides: SettingsOverlay::default(),
        }
    }

    pub fn mode(&self) -> ControlMode {
        resolve(self.overrides.mode, self.options.mode, self.data.mode)
    }

    pub fn profile(&self) -> Profile {
        resolve(
            self.overrides.profile,
            self.options.profile,
            self.data.profile,
        )
    }

    pub fn global_target(&self) -> f64 {
        resolve(
            self.overrides.global_target,
            self.options.global_target,
            self.data.global_target,
        )
    }

    pub fn global_tolerance(&self) -> f64 {
        resolve(
            self.overrides.global_tolerance,
            self.options.global_tolerance,
            self.data.global_tolerance,
        )
    }

    pub fn update_interval_secs(&self) -> u64 {
        resolve(
            self.overrides.update_interval_secs,
            self.options.update_interval_secs,
            self.data.update_interval_secs,
        )
    }

    /// Per-room layers apply in `per_room` mode only; `global` mode forces
    /// the shared target on every room.
    pub fn room_target(&self, room: &RoomId) -> f64 {
        if self.mode() == ControlMode::Global {
            return self.global_target();
        }
        resolve(
            self.overrides.room_targets.get(room).copied(),
            self.options.room_targets.get(room).copied(),
            self.global_target(),
        )
    }

    pub fn room_tolerance(&self, room: &RoomId) -> f64 {
        if self.mode() == ControlMode::Global {
            return self.global_tolerance();
        }
        resolve(
            self.overrides.room_tolerances.get(room).copied(),
            self.options.room_tolerances.get(room).copied(),
            self.global_tolerance(),
        )
    }

    pub fn room_enabled(&self, room: &RoomId) -> bool {
        resolve(
            self.overrides.room_enabled.get(room).copied(),
            self.options.room_enabled.get(room).copied(),
            true,
        )
    }
}
