pub mod config;
pub mod coordinator;
pub mod engine;
pub mod snapshot;
pub mod topics;
pub mod types;

pub use config::{
    ClimateConfig, ConfigError, ControlSettings, DumbDeviceConfig, NetworkConfig, RoomConfig,
    SettingsOverlay, SettingsStack,
};
pub use coordinator::{Coordinator, CycleOutcome, DeviceCommand};
pub use engine::Thresholds;
pub use snapshot::{ClimateDeviceState, Snapshot};
pub use topics::*;
pub use types::{
    AggregationMethod, ArbitrationStrategy, Category, ControlMode, CycleReport, Direction,
    HvacMode, Participation, Phase, PhaseReason, Profile, RoomId, RoomReport,
};
