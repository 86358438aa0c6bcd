use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::HvacMode;

/// Plausible indoor/outdoor range; anything outside is a sensor glitch.
const MIN_VALID_TEMP: f64 = -40.0;
const MAX_VALID_TEMP: f64 = 60.0;

/// Last known state of a thermostatic climate device, as reported by the
/// device itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClimateDeviceState {
    pub hvac_modes: Vec<HvacMode>,
    pub hvac_mode: Option<HvacMode>,
    pub setpoint: Option<f64>,
    pub min_temp: Option<f64>,
    pub max_temp: Option<f64>,
}

/// Everything the engine consumes for one control cycle. Sensors with an
/// unavailable/unparsable state are simply absent from `sensors`.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub sensors: HashMap<String, f64>,
    pub outdoor_temp: Option<f64>,
    pub devices: HashMap<String, ClimateDeviceState>,
}

impl Snapshot {
    /// Valid readings for the given sensors, preserving sensor order.
    pub fn readings(&self, sensor_ids: &[String]) -> Vec<f64> {
        sensor_ids
            .iter()
            .filter_map(|id| self.sensors.get(id).copied())
            .collect()
    }
}

/// Parse a plain numeric sensor state. Markers like "unknown" or
/// "unavailable" and out-of-range glitches come back as `None`.
pub fn parse_sensor_payload(payload: &str) -> Option<f64> {
    let value: f64 = payload.trim().parse().ok()?;
    if !value.is_finite() || !(MIN_VALID_TEMP..=MAX_VALID_TEMP).contains(&value) {
        return None;
    }
    Some(value)
}

/// Weather entities report a JSON attribute object; the outdoor reading
/// is its `temperature` attribute.
pub fn parse_weather_payload(payload: &str) -> Option<f64> {
    let attrs: serde_json::Value = serde_json::from_str(payload).ok()?;
    let value = attrs.get("temperature")?.as_f64()?;
    if !value.is_finite() || !(MIN_VALID_TEMP..=MAX_VALID_TEMP).contains(&value) {
        return None;
    }
    Some(value)
}

pub fn parse_device_payload(payload: &str) -> Option<ClimateDeviceState> {
    serde_json::from_str(payload).ok()
}
