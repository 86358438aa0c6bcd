//! MQTT topic layout shared by the controller and anything publishing
//! entity state into it. Every entity (sensor, weather, climate device)
//! reports on `climate/state/<entity_id>`; commands go out under
//! `climate/cmnd/<entity_id>/...`.

pub const TOPIC_STATE_PREFIX: &str = "climate/state/";
pub const TOPIC_STATE_FILTER: &str = "climate/state/#";

pub const TOPIC_CONTROLLER_STATE: &str = "climate/controller/state";

pub const TOPIC_CMD_MODE: &str = "climate/cmnd/controller/mode";
pub const TOPIC_CMD_PROFILE: &str = "climate/cmnd/controller/profile";
pub const TOPIC_CMD_TARGET: &str = "climate/cmnd/controller/target";
pub const TOPIC_CMD_TOLERANCE: &str = "climate/cmnd/controller/tolerance";
pub const TOPIC_CMD_REFRESH: &str = "climate/cmnd/controller/refresh";

pub fn entity_from_state_topic(topic: &str) -> Option<&str> {
    topic.strip_prefix(TOPIC_STATE_PREFIX).filter(|e| !e.is_empty())
}

pub fn hvac_mode_topic(device: &str) -> String {
    format!("climate/cmnd/{device}/hvac_mode")
}

pub fn temperature_topic(device: &str) -> String {
    format!("climate/cmnd/{device}/temperature")
}

pub fn script_topic(script: &str) -> String {
    format!("climate/cmnd/{script}/run")
}
