use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Slug identifier of a room, unique across the configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Off,
    PerRoom,
    Global,
}

impl ControlMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::PerRoom => "per_room",
            Self::Global => "global",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Profile {
    Normal,
    Fast,
    Extreme,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Fast => "fast",
            Self::Extreme => "extreme",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Boost,
    Hold,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Boost => "boost",
            Self::Hold => "hold",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Heat,
    Cool,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heat => "heat",
            Self::Cool => "cool",
        }
    }
}

/// Escalation tier for device selection. Tiers are cumulative: a room
/// running at `Three` also drives every `One` and `Two` device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Category {
    One,
    Two,
    Three,
}

impl Category {
    pub fn rank(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            1 => Some(Self::One),
            2 => Some(Self::Two),
            3 => Some(Self::Three),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Category {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::from_rank(value).ok_or_else(|| format!("category must be 1, 2 or 3, got {value}"))
    }
}

impl From<Category> for u8 {
    fn from(value: Category) -> Self {
        value.rank()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Participation {
    Off,
    AlwaysOn,
    UntilReachTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMethod {
    Average,
    Min,
    Max,
    Median,
    First,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutdoorSourceKind {
    Weather,
    Sensor,
}

/// What to assume about outdoor-gated devices when no outdoor reading exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutdoorPolicy {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrationStrategy {
    MaxDemand,
    PriorityRoom,
    AverageRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterReachSmart {
    KeepOn,
    SetTarget,
    TurnOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AfterReachDumb {
    KeepOn,
    TurnOff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Heat,
    Cool,
    Off,
}

impl HvacMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heat => "heat",
            Self::Cool => "cool",
            Self::Off => "off",
        }
    }
}

/// Why a room ended the cycle without acting on any device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseReason {
    NoTemperature,
    ModeOff,
    RoomDisabled,
    NoHeatingDevices,
    NoCoolingDevices,
    NoDevicesActivated,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DemandReport {
    pub direction: Direction,
    pub diff: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomReport {
    pub name: String,
    pub enabled: bool,
    #[serde(rename = "currentTemp")]
    pub current_temp: Option<f64>,
    #[serde(rename = "targetTemp")]
    pub target_temp: f64,
    pub tolerance: f64,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<PhaseReason>,
    pub offset: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demand: Option<DemandReport>,
    #[serde(rename = "activeCategoryHeat")]
    pub active_category_heat: Option<Category>,
    #[serde(rename = "activeCategoryCool")]
    pub active_category_cool: Option<Category>,
    #[serde(rename = "activeDevices")]
    pub active_devices: Vec<String>,
}

/// Arbitration outcome for one shared climate unit. `winner` is absent for
/// the synthetic average-request demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedReport {
    pub winner: Option<RoomId>,
    pub direction: Direction,
    pub target: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub mode: ControlMode,
    pub profile: Profile,
    #[serde(rename = "globalTarget")]
    pub global_target: f64,
    #[serde(rename = "globalTolerance")]
    pub global_tolerance: f64,
    #[serde(rename = "outdoorTemp")]
    pub outdoor_temp: Option<f64>,
    pub rooms: BTreeMap<RoomId, RoomReport>,
    pub shared: BTreeMap<String, SharedReport>,
}
