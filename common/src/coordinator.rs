use std::collections::{BTreeMap, HashMap};

use crate::config::{ClimateConfig, DumbDeviceConfig, RoomConfig, SettingsOverlay, SettingsStack};
use crate::engine::{
    aggregate_temperature, compute_setpoint, filter_weather_sensitive, hvac_mode_for,
    merge_categories, next_phase_and_offset, select_category, should_activate_dumb_device,
    should_reenter_boost, within_target, SETPOINT_EPSILON,
};
use crate::snapshot::Snapshot;
use crate::types::{
    ArbitrationStrategy, Category, ControlMode, CycleReport, DemandReport, Direction, HvacMode,
    Participation, Phase, PhaseReason, Profile, RoomId, RoomReport, SharedReport,
};

/// Fire-and-forget device commands produced by one control cycle.
/// Execution (and any transport failure) is the host's business.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceCommand {
    SetHvacMode { device: String, mode: HvacMode },
    SetTemperature { device: String, setpoint: f64 },
    RunScript { script: String },
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub report: CycleReport,
    pub commands: Vec<DeviceCommand>,
}

/// Mutable per-room state. Lives as long as the coordinator; only a
/// configuration change that removes the room resets it.
#[derive(Debug, Clone)]
pub struct RoomRuntime {
    pub enabled: bool,
    pub current_temp: Option<f64>,
    pub target_temp: f64,
    pub tolerance: f64,
    pub phase: Phase,
    pub current_offset: f64,
    pub boost_started_at: Option<u64>,
    pub last_reach_time: Option<u64>,
    pub active_category_heat: Option<Category>,
    pub active_category_cool: Option<Category>,
    pub active_devices: Vec<String>,
}

impl Default for RoomRuntime {
    fn default() -> Self {
        Self {
            enabled: true,
            current_temp: None,
            target_temp: 0.0,
            tolerance: 0.0,
            phase: Phase::Idle,
            current_offset: 0.0,
            boost_started_at: None,
            last_reach_time: None,
            active_category_heat: None,
            active_category_cool: None,
            active_devices: Vec::new(),
        }
    }
}

/// Anti-flapping bookkeeping, one entry per addressable device,
/// created lazily on first command.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceActionState {
    pub last_action_time: Option<u64>,
}

#[derive(Debug, Clone)]
struct SharedDemand {
    room: RoomId,
    direction: Direction,
    diff: f64,
}

/// Accumulates commands for one cycle, enforcing the anti-flapping
/// interval and suppressing no-op setpoint/mode commands.
struct CommandQueue<'a> {
    snapshot: &'a Snapshot,
    devices: &'a mut HashMap<String, DeviceActionState>,
    min_action_interval_ms: u64,
    now_ms: u64,
    commands: Vec<DeviceCommand>,
}

impl CommandQueue<'_> {
    fn can_act(&self, entity: &str) -> bool {
        match self.devices.get(entity).and_then(|s| s.last_action_time) {
            Some(last) => self.now_ms.saturating_sub(last) >= self.min_action_interval_ms,
            None => true,
        }
    }

    fn mark(&mut self, entity: &str) {
        self.devices
            .entry(entity.to_string())
            .or_default()
            .last_action_time = Some(self.now_ms);
    }

    /// Drive a climate device toward the target. Returns true when at
    /// least one command was issued.
    fn set_climate(
        &mut self,
        entity: &str,
        target: f64,
        direction: Direction,
        profile: Profile,
        offset: f64,
        skip_hvac: bool,
    ) -> bool {
        if !self.can_act(entity) {
            return false;
        }
        let Some(state) = self.snapshot.devices.get(entity) else {
            return false;
        };

        let mut issued = false;
        let mode = hvac_mode_for(direction);
        if !skip_hvac && state.hvac_modes.contains(&mode) && state.hvac_mode != Some(mode) {
            self.commands.push(DeviceCommand::SetHvacMode {
                device: entity.to_string(),
                mode,
            });
            issued = true;
        }

        let setpoint = compute_setpoint(
            target,
            direction,
            profile,
            offset,
            state.min_temp,
            state.max_temp,
        );
        if state
            .setpoint
            .map_or(true, |current| (current - setpoint).abs() > SETPOINT_EPSILON)
        {
            self.commands.push(DeviceCommand::SetTemperature {
                device: entity.to_string(),
                setpoint,
            });
            issued = true;
        }

        if issued {
            self.mark(entity);
        }
        issued
    }

    fn turn_off_climate(&mut self, entity: &str) -> bool {
        if !self.can_act(entity) {
            return false;
        }
        if let Some(state) = self.snapshot.devices.get(entity) {
            if state.hvac_mode == Some(HvacMode::Off) {
                return false;
            }
        }
        self.commands.push(DeviceCommand::SetHvacMode {
            device: entity.to_string(),
            mode: HvacMode::Off,
        });
        self.mark(entity);
        true
    }

    fn run_script(&mut self, script: &str) -> bool {
        if !self.can_act(script) {
            return false;
        }
        self.commands.push(DeviceCommand::RunScript {
            script: script.to_string(),
        });
        self.mark(script);
        true
    }
}

/// Owns all mutable control state and turns one input snapshot into one
/// decision set. Callers serialize invocations (one cycle at a time).
pub struct Coordinator {
    pub settings: SettingsStack,
    rooms: Vec<RoomConfig>,
    runtime: HashMap<RoomId, RoomRuntime>,
    device_state: HashMap<String, DeviceActionState>,
    shared_map: BTreeMap<String, Vec<RoomId>>,
}

impl Coordinator {
    pub fn new(config: &ClimateConfig, options: SettingsOverlay) -> Self {
        let mut coordinator = Self {
            settings: SettingsStack::new(config.settings.clone(), options),
            rooms: Vec::new(),
            runtime: HashMap::new(),
            device_state: HashMap::new(),
            shared_map: BTreeMap::new(),
        };
        coordinator.apply_rooms(config.rooms.clone());
        coordinator
    }

    /// Swap in a fresh room topology. Runtime state survives for rooms
    /// that persist; removed rooms are dropped, new rooms start idle.
    pub fn apply_rooms(&mut self, rooms: Vec<RoomConfig>) {
        self.shared_map.clear();
        for room in &rooms {
            self.runtime.entry(room.room_id.clone()).or_default();
            for shared in &room.shared_climates {
                let entry = self.shared_map.entry(shared.clone()).or_default();
                if !entry.contains(&room.room_id) {
                    entry.push(room.room_id.clone());
                }
            }
        }
        self.runtime
            .retain(|id, _| rooms.iter().any(|room| &room.room_id == id));
        self.rooms = rooms;
    }

    pub fn apply_config(&mut self, config: &ClimateConfig) {
        self.settings.data = config.settings.clone();
        self.apply_rooms(config.rooms.clone());
    }

    pub fn rooms(&self) -> &[RoomConfig] {
        &self.rooms
    }

    /// Entities whose state changes should trigger an early cycle.
    pub fn watched_sensors(&self) -> Vec<String> {
        let mut watched: Vec<String> = Vec::new();
        for room in &self.rooms {
            for sensor in &room.temp_sensors {
                if !watched.contains(sensor) {
                    watched.push(sensor.clone());
                }
            }
        }
        if let Some(outdoor) = self.settings.data.outdoor_entity() {
            if !watched.iter().any(|s| s == outdoor) {
                watched.push(outdoor.to_string());
            }
        }
        watched
    }

    /// Run one control cycle: per-room decisions first, then shared-device
    /// arbitration over the demands the room pass recorded.
    pub fn run_cycle(&mut self, snapshot: &Snapshot, now_ms: u64) -> CycleOutcome {
        let settings = &self.settings;
        let mut queue = CommandQueue {
            snapshot,
            devices: &mut self.device_state,
            min_action_interval_ms: settings.data.min_action_interval_secs * 1000,
            now_ms,
            commands: Vec::new(),
        };

        let mut shared_demands: BTreeMap<String, Vec<SharedDemand>> = BTreeMap::new();
        let mut room_reports: BTreeMap<RoomId, RoomReport> = BTreeMap::new();

        for room in &self.rooms {
            let runtime = self
                .runtime
                .entry(room.room_id.clone())
                .or_default();
            let report = process_room(
                room,
                runtime,
                settings,
                snapshot,
                &mut queue,
                now_ms,
                &mut shared_demands,
            );
            room_reports.insert(room.room_id.clone(), report);
        }

        let shared = apply_shared(
            &self.shared_map,
            &shared_demands,
            &self.rooms,
            &self.runtime,
            settings,
            &mut queue,
        );

        let report = CycleReport {
            mode: settings.mode(),
            profile: settings.profile(),
            global_target: settings.global_target(),
            global_tolerance: settings.global_tolerance(),
            outdoor_temp: snapshot.outdoor_temp,
            rooms: room_reports,
            shared,
        };

        CycleOutcome {
            report,
            commands: queue.commands,
        }
    }
}

fn process_room(
    room: &RoomConfig,
    runtime: &mut RoomRuntime,
    settings: &SettingsStack,
    snapshot: &Snapshot,
    queue: &mut CommandQueue<'_>,
    now_ms: u64,
    shared_demands: &mut BTreeMap<String, Vec<SharedDemand>>,
) -> RoomReport {
    let mode = settings.mode();
    let profile = settings.profile();

    runtime.enabled = settings.room_enabled(&room.room_id);
    runtime.target_temp = settings.room_target(&room.room_id);
    runtime.tolerance = settings.room_tolerance(&room.room_id);
    runtime.current_temp = aggregate_temperature(
        &snapshot.readings(&room.temp_sensors),
        settings.data.aggregation,
    );
    runtime.active_devices.clear();
    runtime.active_category_heat = None;
    runtime.active_category_cool = None;

    let Some(current) = runtime.current_temp else {
        go_idle(runtime);
        return room_report(room, runtime, Some(PhaseReason::NoTemperature), None);
    };

    if mode == ControlMode::Off {
        go_idle(runtime);
        return room_report(room, runtime, Some(PhaseReason::ModeOff), None);
    }
    if !runtime.enabled {
        go_idle(runtime);
        return room_report(room, runtime, Some(PhaseReason::RoomDisabled), None);
    }

    let target = runtime.target_temp;
    let tolerance = runtime.tolerance;
    let diff_heat = target - current;
    let diff_cool = current - target;
    let heat_needed = diff_heat > tolerance;
    let cool_needed = diff_cool > tolerance;
    let reached = within_target(current, target, tolerance);

    // Drifted out of the band while holding, but not past the re-entry
    // margin yet: keep holding instead of striking a fresh boost.
    if runtime.phase == Phase::Hold && !reached {
        let direction = if heat_needed {
            Direction::Heat
        } else {
            Direction::Cool
        };
        if !should_reenter_boost(current, target, tolerance, settings.data.delta, direction) {
            return room_report(room, runtime, None, None);
        }
    }

    let elapsed_boost_ms = runtime
        .boost_started_at
        .map_or(0, |started| now_ms.saturating_sub(started));
    let (phase, offset) = next_phase_and_offset(
        profile,
        runtime.phase,
        reached,
        runtime.current_offset,
        settings.data.step_offset,
        settings.data.max_offset,
        elapsed_boost_ms,
        settings.data.t_time_secs * 1000,
    );
    runtime.phase = phase;
    runtime.current_offset = offset;
    match phase {
        Phase::Hold => {
            runtime.last_reach_time = Some(now_ms);
            runtime.boost_started_at = None;
        }
        Phase::Boost => {
            if runtime.boost_started_at.is_none() {
                runtime.boost_started_at = Some(now_ms);
            }
        }
        Phase::Idle => {}
    }

    let demand = if heat_needed {
        Some((Direction::Heat, diff_heat))
    } else if cool_needed {
        Some((Direction::Cool, diff_cool))
    } else {
        None
    };

    let Some((direction, diff)) = demand else {
        if runtime.phase == Phase::Hold {
            apply_after_reach(room, settings, queue, target);
        }
        return room_report(room, runtime, None, None);
    };

    if !room.has_devices(direction) && room.shared_climates.is_empty() {
        let reason = match direction {
            Direction::Heat => PhaseReason::NoHeatingDevices,
            Direction::Cool => PhaseReason::NoCoolingDevices,
        };
        return room_report(
            room,
            runtime,
            Some(reason),
            Some(DemandReport { direction, diff }),
        );
    }

    let gate = settings.data.outdoor_gate();
    let outdoor = snapshot.outdoor_temp;
    let ac_allowed = gate.ac_allowed(outdoor, direction);
    let category = select_category(diff, &settings.data.thresholds(direction), ac_allowed);
    match direction {
        Direction::Heat => runtime.active_category_heat = Some(category),
        Direction::Cool => runtime.active_category_cool = Some(category),
    }

    let weather_ok =
        ac_allowed && gate.weather_sensitive_allowed(outdoor, target, direction, profile);
    let eligible = eligible_climates(room, direction, category, weather_ok);

    for climate in &eligible {
        if queue.set_climate(climate, target, direction, profile, runtime.current_offset, false) {
            runtime.active_devices.push(climate.clone());
        }
    }

    let active_dumb: Vec<&DumbDeviceConfig> = room
        .dumb_devices
        .iter()
        .filter(|dumb| {
            should_activate_dumb_device(
                category,
                dumb.category,
                direction,
                dumb.device_type,
                dumb.participation,
            )
        })
        .collect();
    for dumb in &active_dumb {
        if queue.run_script(&dumb.on_script) {
            runtime.active_devices.push(dumb.on_script.clone());
        }
    }

    deactivate_non_active(room, &eligible, &active_dumb, queue);

    for shared in &room.shared_climates {
        shared_demands
            .entry(shared.clone())
            .or_default()
            .push(SharedDemand {
                room: room.room_id.clone(),
                direction,
                diff,
            });
    }

    let reason = if runtime.active_devices.is_empty() {
        Some(PhaseReason::NoDevicesActivated)
    } else {
        None
    };
    room_report(
        room,
        runtime,
        reason,
        Some(DemandReport { direction, diff }),
    )
}

fn go_idle(runtime: &mut RoomRuntime) {
    runtime.phase = Phase::Idle;
    runtime.current_offset = 0.0;
    runtime.boost_started_at = None;
}

/// Room-local climates for the active tier and direction: cumulative
/// union, weather-filtered, shared units excluded.
fn eligible_climates(
    room: &RoomConfig,
    direction: Direction,
    category: Category,
    weather_ok: bool,
) -> Vec<String> {
    let merged = merge_categories(room.category_lists(direction), category);
    let filtered = filter_weather_sensitive(merged, &room.weather_sensitive_climates, weather_ok);
    filtered
        .into_iter()
        .filter(|id| !room.shared_climates.contains(id))
        .collect()
}

/// Turn off everything this room controls that the current selection does
/// not cover, so tier downgrades and direction flips leave no stale
/// devices running. Shared units are never touched here.
fn deactivate_non_active(
    room: &RoomConfig,
    active_climates: &[String],
    active_dumb: &[&DumbDeviceConfig],
    queue: &mut CommandQueue<'_>,
) {
    let mut all_climates: Vec<&String> = Vec::new();
    for direction in [Direction::Heat, Direction::Cool] {
        for list in room.category_lists(direction) {
            for entity in list {
                if !all_climates.contains(&entity) {
                    all_climates.push(entity);
                }
            }
        }
    }
    for entity in all_climates {
        if room.shared_climates.contains(entity) || active_climates.contains(entity) {
            continue;
        }
        queue.turn_off_climate(entity);
    }

    let active_on: Vec<&str> = active_dumb.iter().map(|d| d.on_script.as_str()).collect();
    let shielded_off: Vec<&str> = active_dumb.iter().map(|d| d.off_script.as_str()).collect();
    for dumb in &room.dumb_devices {
        if dumb.participation == Participation::Off {
            continue;
        }
        if active_on.contains(&dumb.on_script.as_str()) {
            continue;
        }
        if shielded_off.contains(&dumb.off_script.as_str()) {
            continue;
        }
        queue.run_script(&dumb.off_script);
    }
}

fn local_climates(room: &RoomConfig) -> Vec<&String> {
    let mut climates: Vec<&String> = Vec::new();
    for direction in [Direction::Heat, Direction::Cool] {
        for list in room.category_lists(direction) {
            for entity in list {
                if !room.shared_climates.contains(entity) && !climates.contains(&entity) {
                    climates.push(entity);
                }
            }
        }
    }
    climates
}

fn apply_after_reach(
    room: &RoomConfig,
    settings: &SettingsStack,
    queue: &mut CommandQueue<'_>,
    target: f64,
) {
    use crate::types::{AfterReachDumb, AfterReachSmart};

    match settings.data.after_reach_smart {
        AfterReachSmart::KeepOn => {}
        AfterReachSmart::SetTarget => {
            for climate in local_climates(room) {
                // Plain target, no boost offset, no mode flip, no
                // extreme limit-push.
                queue.set_climate(climate, target, Direction::Heat, Profile::Normal, 0.0, true);
            }
        }
        AfterReachSmart::TurnOff => {
            for climate in local_climates(room) {
                queue.turn_off_climate(climate);
            }
        }
    }

    for dumb in &room.dumb_devices {
        let fire = match dumb.participation {
            Participation::Off => false,
            Participation::UntilReachTarget => true,
            Participation::AlwaysOn => settings.data.after_reach_dumb == AfterReachDumb::TurnOff,
        };
        if fire {
            queue.run_script(&dumb.off_script);
        }
    }
}

fn resolve_priority_room(rooms: &[RoomConfig], value: Option<&str>) -> Option<RoomId> {
    let value = value?;
    rooms
        .iter()
        .find(|room| room.room_id.as_str() == value)
        .or_else(|| rooms.iter().find(|room| room.name == value))
        .map(|room| room.room_id.clone())
}

fn max_demand(demands: &[&SharedDemand]) -> Option<(Option<RoomId>, Direction, f64)> {
    demands
        .iter()
        .max_by(|a, b| {
            a.diff
                .partial_cmp(&b.diff)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|demand| (Some(demand.room.clone()), demand.direction, demand.diff))
}

fn average_request(demands: &[&SharedDemand]) -> Option<(Option<RoomId>, Direction, f64)> {
    if demands.is_empty() {
        return None;
    }
    let heat: Vec<f64> = demands
        .iter()
        .filter(|d| d.direction == Direction::Heat)
        .map(|d| d.diff)
        .collect();
    let cool: Vec<f64> = demands
        .iter()
        .filter(|d| d.direction == Direction::Cool)
        .map(|d| d.diff)
        .collect();

    let (direction, group) = if heat.len() >= cool.len() {
        (Direction::Heat, heat)
    } else {
        (Direction::Cool, cool)
    };
    let mean = group.iter().sum::<f64>() / group.len() as f64;
    Some((None, direction, mean))
}

fn apply_shared(
    shared_map: &BTreeMap<String, Vec<RoomId>>,
    demands: &BTreeMap<String, Vec<SharedDemand>>,
    rooms: &[RoomConfig],
    runtime: &HashMap<RoomId, RoomRuntime>,
    settings: &SettingsStack,
    queue: &mut CommandQueue<'_>,
) -> BTreeMap<String, SharedReport> {
    let mut reports = BTreeMap::new();
    if settings.mode() == ControlMode::Off {
        return reports;
    }

    let strategy = settings.data.shared_arbitration;
    let priority = resolve_priority_room(rooms, settings.data.priority_room.as_deref());
    let profile = settings.profile();

    for (device, listed_rooms) in shared_map {
        let involved: Vec<&RoomId> = listed_rooms
            .iter()
            .filter(|id| settings.room_enabled(id))
            .filter(|id| {
                runtime
                    .get(*id)
                    .and_then(|room| room.current_temp)
                    .is_some()
            })
            .collect();
        // Nobody can speak for this unit: leave it untouched.
        if involved.is_empty() {
            continue;
        }

        let device_demands: Vec<&SharedDemand> = demands
            .get(device)
            .map(|all| {
                all.iter()
                    .filter(|demand| involved.iter().any(|id| **id == demand.room))
                    .collect()
            })
            .unwrap_or_default();

        let selected = match strategy {
            ArbitrationStrategy::PriorityRoom => {
                match priority
                    .as_ref()
                    .filter(|room| involved.iter().any(|id| *id == *room))
                {
                    Some(priority_room) => {
                        match device_demands.iter().find(|d| &d.room == priority_room) {
                            Some(demand) => {
                                Some((Some(demand.room.clone()), demand.direction, demand.diff))
                            }
                            // Priority room is satisfied: hold the unit
                            // at its plain target.
                            None => Some((Some(priority_room.clone()), Direction::Heat, 0.0)),
                        }
                    }
                    None => max_demand(&device_demands),
                }
            }
            ArbitrationStrategy::MaxDemand => max_demand(&device_demands),
            ArbitrationStrategy::AverageRequest => average_request(&device_demands),
        };
        let Some((winner, direction, diff)) = selected else {
            continue;
        };

        let targets = involved.iter().map(|id| settings.room_target(id));
        let target = match direction {
            Direction::Heat => targets.fold(f64::NEG_INFINITY, f64::max),
            Direction::Cool => targets.fold(f64::INFINITY, f64::min),
        };

        if diff.abs() < f64::EPSILON {
            queue.set_climate(device, target, direction, Profile::Normal, 0.0, true);
        } else {
            queue.set_climate(
                device,
                target,
                direction,
                profile,
                settings.data.step_offset,
                false,
            );
        }
        reports.insert(
            device.clone(),
            SharedReport {
                winner,
                direction,
                target,
            },
        );
    }
    reports
}

fn room_report(
    room: &RoomConfig,
    runtime: &RoomRuntime,
    reason: Option<PhaseReason>,
    demand: Option<DemandReport>,
) -> RoomReport {
    RoomReport {
        name: room.name.clone(),
        enabled: runtime.enabled,
        current_temp: runtime.current_temp,
        target_temp: runtime.target_temp,
        tolerance: runtime.tolerance,
        phase: runtime.phase,
        reason,
        offset: runtime.current_offset,
        demand,
        active_category_heat: runtime.active_category_heat,
        active_category_cool: runtime.active_category_cool,
        active_devices: runtime.active_devices.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClimateConfig, ControlSettings, DumbDeviceConfig, RoomConfig};
    use crate::snapshot::ClimateDeviceState;
    use crate::types::{AfterReachSmart, AggregationMethod, OutdoorPolicy};

    const MINUTE_MS: u64 = 60_000;

    fn settings_on() -> ControlSettings {
        ControlSettings {
            mode: ControlMode::PerRoom,
            global_target: 22.0,
            global_tolerance: 0.3,
            min_action_interval_secs: 0,
            ..ControlSettings::default()
        }
    }

    fn climate_device() -> ClimateDeviceState {
        ClimateDeviceState {
            hvac_modes: vec![HvacMode::Heat, HvacMode::Cool, HvacMode::Off],
            hvac_mode: Some(HvacMode::Off),
            setpoint: None,
            min_temp: Some(7.0),
            max_temp: Some(30.0),
        }
    }

    fn snapshot_for(sensors: &[(&str, f64)], devices: &[&str]) -> Snapshot {
        let mut snapshot = Snapshot::default();
        for (id, value) in sensors {
            snapshot.sensors.insert(id.to_string(), *value);
        }
        for id in devices {
            snapshot.devices.insert(id.to_string(), climate_device());
        }
        snapshot
    }

    fn single_room_config(settings: ControlSettings) -> ClimateConfig {
        let mut room = RoomConfig::new("living", "Living Room");
        room.temp_sensors = vec!["sensor.living".to_string()];
        room.heat_category_1 = vec!["climate.living_radiator".to_string()];
        ClimateConfig {
            settings,
            rooms: vec![room],
            ..ClimateConfig::default()
        }
    }

    fn coordinator_with(config: &ClimateConfig) -> Coordinator {
        Coordinator::new(config, SettingsOverlay::default())
    }

    fn set_temp_commands(commands: &[DeviceCommand]) -> Vec<(&str, f64)> {
        commands
            .iter()
            .filter_map(|cmd| match cmd {
                DeviceCommand::SetTemperature { device, setpoint } => {
                    Some((device.as_str(), *setpoint))
                }
                _ => None,
            })
            .collect()
    }

    fn hvac_commands(commands: &[DeviceCommand]) -> Vec<(&str, HvacMode)> {
        commands
            .iter()
            .filter_map(|cmd| match cmd {
                DeviceCommand::SetHvacMode { device, mode } => Some((device.as_str(), *mode)),
                _ => None,
            })
            .collect()
    }

    fn script_commands(commands: &[DeviceCommand]) -> Vec<&str> {
        commands
            .iter()
            .filter_map(|cmd| match cmd {
                DeviceCommand::RunScript { script } => Some(script.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn mode_off_leaves_everything_idle() {
        let config = single_room_config(ControlSettings {
            mode: ControlMode::Off,
            ..settings_on()
        });
        let mut coordinator = coordinator_with(&config);
        let snapshot = snapshot_for(&[("sensor.living", 18.0)], &["climate.living_radiator"]);

        let outcome = coordinator.run_cycle(&snapshot, 0);

        assert!(outcome.commands.is_empty());
        let room = &outcome.report.rooms[&RoomId::from("living")];
        assert_eq!(room.phase, Phase::Idle);
        assert_eq!(room.reason, Some(PhaseReason::ModeOff));
    }

    #[test]
    fn room_without_valid_sensor_is_excluded_not_zeroed() {
        let config = single_room_config(settings_on());
        let mut coordinator = coordinator_with(&config);
        let snapshot = snapshot_for(&[], &["climate.living_radiator"]);

        let outcome = coordinator.run_cycle(&snapshot, 0);

        assert!(outcome.commands.is_empty());
        let room = &outcome.report.rooms[&RoomId::from("living")];
        assert_eq!(room.current_temp, None);
        assert_eq!(room.reason, Some(PhaseReason::NoTemperature));
    }

    #[test]
    fn disabled_room_is_skipped() {
        let config = single_room_config(settings_on());
        let mut coordinator = coordinator_with(&config);
        coordinator
            .settings
            .overrides
            .room_enabled
            .insert(RoomId::from("living"), false);
        let snapshot = snapshot_for(&[("sensor.living", 18.0)], &["climate.living_radiator"]);

        let outcome = coordinator.run_cycle(&snapshot, 0);

        assert!(outcome.commands.is_empty());
        let room = &outcome.report.rooms[&RoomId::from("living")];
        assert_eq!(room.reason, Some(PhaseReason::RoomDisabled));
    }

    #[test]
    fn cold_room_boosts_and_drives_its_radiator() {
        let config = single_room_config(settings_on());
        let mut coordinator = coordinator_with(&config);
        let snapshot = snapshot_for(&[("sensor.living", 21.6)], &["climate.living_radiator"]);

        let outcome = coordinator.run_cycle(&snapshot, 0);

        let room = &outcome.report.rooms[&RoomId::from("living")];
        assert_eq!(room.phase, Phase::Boost);
        assert_eq!(room.offset, 0.5);
        assert_eq!(room.active_category_heat, Some(Category::One));
        assert_eq!(
            room.active_devices,
            vec!["climate.living_radiator".to_string()]
        );
        assert!(hvac_commands(&outcome.commands)
            .contains(&("climate.living_radiator", HvacMode::Heat)));
        assert_eq!(
            set_temp_commands(&outcome.commands),
            vec![("climate.living_radiator", 22.5)]
        );
    }

    #[test]
    fn normal_profile_ramps_offset_after_t_time() {
        let config = single_room_config(settings_on());
        let mut coordinator = coordinator_with(&config);
        let snapshot = snapshot_for(&[("sensor.living", 20.0)], &["climate.living_radiator"]);

        let first = coordinator.run_cycle(&snapshot, 0);
        assert_eq!(first.report.rooms[&RoomId::from("living")].offset, 0.5);

        // One minute later: below t_time, no ramp.
        let second = coordinator.run_cycle(&snapshot, MINUTE_MS);
        assert_eq!(second.report.rooms[&RoomId::from("living")].offset, 0.5);

        let third = coordinator.run_cycle(&snapshot, 5 * MINUTE_MS);
        assert_eq!(third.report.rooms[&RoomId::from("living")].offset, 1.0);
        assert_eq!(
            set_temp_commands(&third.commands),
            vec![("climate.living_radiator", 23.0)]
        );

        // Target reached: hold with zero offset.
        let warm = snapshot_for(&[("sensor.living", 22.1)], &["climate.living_radiator"]);
        let fourth = coordinator.run_cycle(&warm, 6 * MINUTE_MS);
        let room = &fourth.report.rooms[&RoomId::from("living")];
        assert_eq!(room.phase, Phase::Hold);
        assert_eq!(room.offset, 0.0);
    }

    #[test]
    fn fast_profile_jumps_straight_to_max_offset() {
        let config = single_room_config(ControlSettings {
            profile: Profile::Fast,
            ..settings_on()
        });
        let mut coordinator = coordinator_with(&config);
        let snapshot = snapshot_for(&[("sensor.living", 20.0)], &["climate.living_radiator"]);

        let outcome = coordinator.run_cycle(&snapshot, 0);

        assert_eq!(outcome.report.rooms[&RoomId::from("living")].offset, 2.0);
        assert_eq!(
            set_temp_commands(&outcome.commands),
            vec![("climate.living_radiator", 24.0)]
        );
    }

    #[test]
    fn extreme_profile_pushes_device_to_its_limit() {
        let config = single_room_config(ControlSettings {
            profile: Profile::Extreme,
            ..settings_on()
        });
        let mut coordinator = coordinator_with(&config);
        let snapshot = snapshot_for(&[("sensor.living", 20.0)], &["climate.living_radiator"]);

        let outcome = coordinator.run_cycle(&snapshot, 0);

        assert_eq!(
            set_temp_commands(&outcome.commands),
            vec![("climate.living_radiator", 30.0)]
        );
    }

    #[test]
    fn hold_reentry_waits_for_drift_past_delta() {
        let config = single_room_config(settings_on());
        let mut coordinator = coordinator_with(&config);

        let warm = snapshot_for(&[("sensor.living", 22.0)], &["climate.living_radiator"]);
        coordinator.run_cycle(&warm, 0);

        // Outside tolerance but inside the re-entry margin: keep holding.
        let slight_drift = snapshot_for(&[("sensor.living", 21.6)], &["climate.living_radiator"]);
        let held = coordinator.run_cycle(&slight_drift, MINUTE_MS);
        let room = &held.report.rooms[&RoomId::from("living")];
        assert_eq!(room.phase, Phase::Hold);
        assert!(held.commands.is_empty());

        let real_drift = snapshot_for(&[("sensor.living", 21.1)], &["climate.living_radiator"]);
        let boosted = coordinator.run_cycle(&real_drift, 2 * MINUTE_MS);
        let room = &boosted.report.rooms[&RoomId::from("living")];
        assert_eq!(room.phase, Phase::Boost);
        assert_eq!(room.offset, 0.5);
    }

    #[test]
    fn anti_flapping_suppresses_rapid_recommands() {
        let config = single_room_config(ControlSettings {
            min_action_interval_secs: 120,
            ..settings_on()
        });
        let mut coordinator = coordinator_with(&config);
        let snapshot = snapshot_for(&[("sensor.living", 20.0)], &["climate.living_radiator"]);

        let first = coordinator.run_cycle(&snapshot, 0);
        assert!(!first.commands.is_empty());

        let second = coordinator.run_cycle(&snapshot, 30_000);
        assert!(second.commands.is_empty());
        assert_eq!(
            second.report.rooms[&RoomId::from("living")].reason,
            Some(PhaseReason::NoDevicesActivated)
        );

        let third = coordinator.run_cycle(&snapshot, 121_000);
        assert!(!third.commands.is_empty());
    }

    #[test]
    fn escalation_adds_higher_tiers_and_dumb_devices() {
        let mut room = RoomConfig::new("attic", "Attic");
        room.temp_sensors = vec!["sensor.attic".to_string()];
        room.heat_category_1 = vec!["climate.attic_radiator".to_string()];
        room.heat_category_3 = vec!["climate.attic_ac".to_string()];
        room.dumb_devices = vec![DumbDeviceConfig {
            on_script: "script.attic_heater_on".to_string(),
            off_script: "script.attic_heater_off".to_string(),
            device_type: Direction::Heat,
            participation: Participation::UntilReachTarget,
            category: Category::Two,
        }];
        let config = ClimateConfig {
            settings: settings_on(),
            rooms: vec![room],
            ..ClimateConfig::default()
        };
        let mut coordinator = coordinator_with(&config);

        // Small deficit: tier 1 only, the category-2 heater stays off.
        let mild = snapshot_for(
            &[("sensor.attic", 21.6)],
            &["climate.attic_radiator", "climate.attic_ac"],
        );
        let outcome = coordinator.run_cycle(&mild, 0);
        let scripts = script_commands(&outcome.commands);
        assert!(scripts.contains(&"script.attic_heater_off"));
        assert!(!scripts.contains(&"script.attic_heater_on"));

        // Deep deficit: tier 3 pulls in every tier below it.
        let freezing = snapshot_for(
            &[("sensor.attic", 19.0)],
            &["climate.attic_radiator", "climate.attic_ac"],
        );
        let outcome = coordinator.run_cycle(&freezing, 10 * MINUTE_MS);
        let room = &outcome.report.rooms[&RoomId::from("attic")];
        assert_eq!(room.active_category_heat, Some(Category::Three));
        assert!(room
            .active_devices
            .contains(&"climate.attic_radiator".to_string()));
        assert!(room.active_devices.contains(&"climate.attic_ac".to_string()));
        assert!(script_commands(&outcome.commands).contains(&"script.attic_heater_on"));
    }

    #[test]
    fn missing_outdoor_with_block_policy_never_runs_weather_sensitive() {
        let mut room = RoomConfig::new("study", "Study");
        room.temp_sensors = vec!["sensor.study".to_string()];
        room.heat_category_1 = vec!["climate.study_radiator".to_string()];
        room.heat_category_3 = vec!["climate.study_heatpump".to_string()];
        room.weather_sensitive_climates = vec!["climate.study_heatpump".to_string()];
        let config = ClimateConfig {
            settings: ControlSettings {
                ac_missing_outdoor_policy: OutdoorPolicy::Block,
                ..settings_on()
            },
            rooms: vec![room],
            ..ClimateConfig::default()
        };
        let mut coordinator = coordinator_with(&config);

        // Huge deficit, but no outdoor reading: tier degrades to 2 and
        // the heat pump must not be commanded on.
        let snapshot = snapshot_for(
            &[("sensor.study", 17.0)],
            &["climate.study_radiator", "climate.study_heatpump"],
        );
        let outcome = coordinator.run_cycle(&snapshot, 0);

        let room = &outcome.report.rooms[&RoomId::from("study")];
        assert_eq!(room.active_category_heat, Some(Category::Two));
        assert!(!room
            .active_devices
            .contains(&"climate.study_heatpump".to_string()));
        assert!(!hvac_commands(&outcome.commands)
            .contains(&("climate.study_heatpump", HvacMode::Heat)));
    }

    #[test]
    fn direction_flip_turns_off_cross_mode_and_higher_tier_climates() {
        let mut room = RoomConfig::new("room", "Room");
        room.temp_sensors = vec!["sensor.room".to_string()];
        room.heat_category_1 = vec!["climate.heat1".to_string()];
        room.heat_category_2 = vec!["climate.dual".to_string()];
        room.cool_category_1 = vec!["climate.cool1".to_string()];
        room.cool_category_2 = vec!["climate.dual".to_string()];
        let config = ClimateConfig {
            settings: settings_on(),
            rooms: vec![room],
            ..ClimateConfig::default()
        };
        let mut coordinator = coordinator_with(&config);

        let mut snapshot = snapshot_for(
            &[("sensor.room", 21.6)],
            &["climate.heat1", "climate.dual", "climate.cool1"],
        );
        for device in ["climate.dual", "climate.cool1"] {
            snapshot.devices.get_mut(device).unwrap().hvac_mode = Some(HvacMode::Cool);
        }

        let outcome = coordinator.run_cycle(&snapshot, 0);
        let offs = hvac_commands(&outcome.commands);
        assert!(offs.contains(&("climate.cool1", HvacMode::Off)));
        assert!(offs.contains(&("climate.dual", HvacMode::Off)));
        assert!(!offs.contains(&("climate.heat1", HvacMode::Off)));
    }

    #[test]
    fn deactivation_spares_shared_units_and_active_dual_scripts() {
        let mut room = RoomConfig::new("room", "Room");
        room.temp_sensors = vec!["sensor.room".to_string()];
        room.heat_category_1 = vec![
            "climate.local_heat".to_string(),
            "climate.shared_unit".to_string(),
        ];
        room.cool_category_1 = vec![
            "climate.local_cool".to_string(),
            "climate.shared_unit".to_string(),
        ];
        room.shared_climates = vec!["climate.shared_unit".to_string()];
        room.dumb_devices = vec![
            DumbDeviceConfig {
                on_script: "script.dual_on".to_string(),
                off_script: "script.dual_off".to_string(),
                device_type: Direction::Heat,
                participation: Participation::UntilReachTarget,
                category: Category::One,
            },
            DumbDeviceConfig {
                on_script: "script.dual_on".to_string(),
                off_script: "script.dual_off".to_string(),
                device_type: Direction::Cool,
                participation: Participation::UntilReachTarget,
                category: Category::One,
            },
            DumbDeviceConfig {
                on_script: "script.cool_only_on".to_string(),
                off_script: "script.cool_only_off".to_string(),
                device_type: Direction::Cool,
                participation: Participation::UntilReachTarget,
                category: Category::One,
            },
        ];
        let config = ClimateConfig {
            settings: settings_on(),
            rooms: vec![room],
            ..ClimateConfig::default()
        };
        let mut coordinator = coordinator_with(&config);

        let mut snapshot = snapshot_for(
            &[("sensor.room", 21.6)],
            &[
                "climate.local_heat",
                "climate.local_cool",
                "climate.shared_unit",
            ],
        );
        snapshot.devices.get_mut("climate.local_cool").unwrap().hvac_mode = Some(HvacMode::Cool);

        let outcome = coordinator.run_cycle(&snapshot, 0);

        let offs = hvac_commands(&outcome.commands);
        assert!(!offs.contains(&("climate.shared_unit", HvacMode::Off)));
        assert!(offs.contains(&("climate.local_cool", HvacMode::Off)));

        let scripts = script_commands(&outcome.commands);
        assert!(scripts.contains(&"script.dual_on"));
        assert!(!scripts.contains(&"script.dual_off"));
        assert!(scripts.contains(&"script.cool_only_off"));
    }

    fn shared_floor_config(strategy: ArbitrationStrategy) -> ClimateConfig {
        let mut rooms = Vec::new();
        for (id, sensor) in [
            ("room2", "sensor.room2"),
            ("room3", "sensor.room3"),
            ("room4", "sensor.room4"),
        ] {
            let mut room = RoomConfig::new(id, id.to_uppercase());
            room.temp_sensors = vec![sensor.to_string()];
            room.heat_category_1 = vec!["climate.floor_shared".to_string()];
            room.shared_climates = vec!["climate.floor_shared".to_string()];
            rooms.push(room);
        }
        ClimateConfig {
            settings: ControlSettings {
                shared_arbitration: strategy,
                ..settings_on()
            },
            rooms,
            ..ClimateConfig::default()
        }
    }

    #[test]
    fn shared_unit_follows_the_largest_demand() {
        let config = shared_floor_config(ArbitrationStrategy::MaxDemand);
        let mut coordinator = coordinator_with(&config);
        coordinator
            .settings
            .overrides
            .room_targets
            .insert(RoomId::from("room4"), 23.0);

        let snapshot = snapshot_for(
            &[
                ("sensor.room2", 21.2),
                ("sensor.room3", 20.9),
                ("sensor.room4", 19.6),
            ],
            &["climate.floor_shared"],
        );
        let outcome = coordinator.run_cycle(&snapshot, 0);

        let shared = &outcome.report.shared["climate.floor_shared"];
        assert_eq!(shared.winner, Some(RoomId::from("room4")));
        assert_eq!(shared.direction, Direction::Heat);
        // Heating aggregate target is the max across involved rooms.
        assert_eq!(shared.target, 23.0);
        assert_eq!(
            set_temp_commands(&outcome.commands),
            vec![("climate.floor_shared", 23.5)]
        );
    }

    #[test]
    fn shared_unit_hears_only_enabled_rooms() {
        let config = shared_floor_config(ArbitrationStrategy::MaxDemand);
        let mut coordinator = coordinator_with(&config);
        coordinator
            .settings
            .overrides
            .room_enabled
            .insert(RoomId::from("room2"), false);
        coordinator
            .settings
            .overrides
            .room_enabled
            .insert(RoomId::from("room4"), false);

        let snapshot = snapshot_for(
            &[
                ("sensor.room2", 18.0),
                ("sensor.room3", 21.0),
                ("sensor.room4", 17.0),
            ],
            &["climate.floor_shared"],
        );
        let outcome = coordinator.run_cycle(&snapshot, 0);

        let shared = &outcome.report.shared["climate.floor_shared"];
        assert_eq!(shared.winner, Some(RoomId::from("room3")));
    }

    #[test]
    fn shared_unit_untouched_when_every_room_is_disabled() {
        let config = shared_floor_config(ArbitrationStrategy::MaxDemand);
        let mut coordinator = coordinator_with(&config);
        for id in ["room2", "room3", "room4"] {
            coordinator
                .settings
                .overrides
                .room_enabled
                .insert(RoomId::from(id), false);
        }

        let snapshot = snapshot_for(
            &[
                ("sensor.room2", 18.0),
                ("sensor.room3", 18.0),
                ("sensor.room4", 18.0),
            ],
            &["climate.floor_shared"],
        );
        let outcome = coordinator.run_cycle(&snapshot, 0);

        assert!(outcome.report.shared.is_empty());
        assert!(outcome.commands.is_empty());
    }

    #[test]
    fn satisfied_priority_room_holds_the_shared_unit_steady() {
        let mut config = shared_floor_config(ArbitrationStrategy::PriorityRoom);
        config.settings.priority_room = Some("room3".to_string());
        config.settings.profile = Profile::Extreme;
        let mut coordinator = coordinator_with(&config);
        coordinator
            .settings
            .overrides
            .room_enabled
            .insert(RoomId::from("room2"), false);
        coordinator
            .settings
            .overrides
            .room_enabled
            .insert(RoomId::from("room4"), false);

        // Priority room already within tolerance; unit previously pushed.
        let mut snapshot = snapshot_for(&[("sensor.room3", 22.0)], &["climate.floor_shared"]);
        snapshot
            .devices
            .get_mut("climate.floor_shared")
            .unwrap()
            .setpoint = Some(27.0);

        let outcome = coordinator.run_cycle(&snapshot, 0);

        // Plain target, no mode strike, no extreme limit-push.
        assert_eq!(
            set_temp_commands(&outcome.commands),
            vec![("climate.floor_shared", 22.0)]
        );
        assert!(hvac_commands(&outcome.commands).is_empty());
        let shared = &outcome.report.shared["climate.floor_shared"];
        assert_eq!(shared.winner, Some(RoomId::from("room3")));
    }

    #[test]
    fn mode_off_never_commands_shared_units_either() {
        let mut config = shared_floor_config(ArbitrationStrategy::PriorityRoom);
        config.settings.mode = ControlMode::Off;
        config.settings.priority_room = Some("room3".to_string());
        let mut coordinator = coordinator_with(&config);

        let snapshot = snapshot_for(&[("sensor.room3", 22.0)], &["climate.floor_shared"]);
        let outcome = coordinator.run_cycle(&snapshot, 0);

        assert!(outcome.report.shared.is_empty());
        assert!(outcome.commands.is_empty());
    }

    #[test]
    fn priority_room_resolves_by_display_name_too() {
        let mut config = shared_floor_config(ArbitrationStrategy::PriorityRoom);
        config.settings.priority_room = Some("ROOM2".to_string());
        let mut coordinator = coordinator_with(&config);

        let snapshot = snapshot_for(
            &[
                ("sensor.room2", 21.2),
                ("sensor.room3", 19.0),
                ("sensor.room4", 19.0),
            ],
            &["climate.floor_shared"],
        );
        let outcome = coordinator.run_cycle(&snapshot, 0);

        let shared = &outcome.report.shared["climate.floor_shared"];
        assert_eq!(shared.winner, Some(RoomId::from("room2")));
    }

    #[test]
    fn average_request_uses_the_larger_direction_group() {
        let config = shared_floor_config(ArbitrationStrategy::AverageRequest);
        let mut coordinator = coordinator_with(&config);

        // Two heating rooms, one cooling room.
        let snapshot = snapshot_for(
            &[
                ("sensor.room2", 21.0),
                ("sensor.room3", 20.0),
                ("sensor.room4", 24.0),
            ],
            &["climate.floor_shared"],
        );
        let outcome = coordinator.run_cycle(&snapshot, 0);

        let shared = &outcome.report.shared["climate.floor_shared"];
        assert_eq!(shared.winner, None);
        assert_eq!(shared.direction, Direction::Heat);
    }

    #[test]
    fn after_reach_turns_off_until_target_dumb_devices() {
        let mut room = RoomConfig::new("bed", "Bedroom");
        room.temp_sensors = vec!["sensor.bed".to_string()];
        room.heat_category_1 = vec!["climate.bed_radiator".to_string()];
        room.dumb_devices = vec![DumbDeviceConfig {
            on_script: "script.bed_heater_on".to_string(),
            off_script: "script.bed_heater_off".to_string(),
            device_type: Direction::Heat,
            participation: Participation::UntilReachTarget,
            category: Category::One,
        }];
        let config = ClimateConfig {
            settings: ControlSettings {
                after_reach_smart: AfterReachSmart::SetTarget,
                ..settings_on()
            },
            rooms: vec![room],
            ..ClimateConfig::default()
        };
        let mut coordinator = coordinator_with(&config);

        let cold = snapshot_for(&[("sensor.bed", 21.0)], &["climate.bed_radiator"]);
        let heating = coordinator.run_cycle(&cold, 0);
        assert!(script_commands(&heating.commands).contains(&"script.bed_heater_on"));

        let warm = snapshot_for(&[("sensor.bed", 22.0)], &["climate.bed_radiator"]);
        let reached = coordinator.run_cycle(&warm, MINUTE_MS);
        let room = &reached.report.rooms[&RoomId::from("bed")];
        assert_eq!(room.phase, Phase::Hold);
        assert!(script_commands(&reached.commands).contains(&"script.bed_heater_off"));
        // Smart devices settle on the plain target without a mode strike.
        assert_eq!(
            set_temp_commands(&reached.commands),
            vec![("climate.bed_radiator", 22.0)]
        );
        assert!(hvac_commands(&reached.commands).is_empty());
    }

    #[test]
    fn aggregation_method_is_honored_per_room() {
        let mut config = single_room_config(ControlSettings {
            aggregation: AggregationMethod::Median,
            ..settings_on()
        });
        config.rooms[0].temp_sensors = vec![
            "sensor.a".to_string(),
            "sensor.b".to_string(),
            "sensor.c".to_string(),
        ];
        let mut coordinator = coordinator_with(&config);

        let snapshot = snapshot_for(
            &[("sensor.a", 18.0), ("sensor.b", 20.0), ("sensor.c", 22.0)],
            &["climate.living_radiator"],
        );
        let outcome = coordinator.run_cycle(&snapshot, 0);

        let room = &outcome.report.rooms[&RoomId::from("living")];
        assert_eq!(room.current_temp, Some(20.0));
    }

    #[test]
    fn reconfiguration_keeps_surviving_rooms_and_drops_the_rest() {
        let config = single_room_config(settings_on());
        let mut coordinator = coordinator_with(&config);
        let snapshot = snapshot_for(&[("sensor.living", 20.0)], &["climate.living_radiator"]);
        coordinator.run_cycle(&snapshot, 0);

        let mut new_room = RoomConfig::new("kitchen", "Kitchen");
        new_room.temp_sensors = vec!["sensor.kitchen".to_string()];
        coordinator.apply_rooms(vec![config.rooms[0].clone(), new_room]);

        let snapshot = snapshot_for(
            &[("sensor.living", 20.0), ("sensor.kitchen", 21.0)],
            &["climate.living_radiator"],
        );
        let outcome = coordinator.run_cycle(&snapshot, MINUTE_MS);

        // Living kept its boost state from before the reconfiguration.
        assert_eq!(
            outcome.report.rooms[&RoomId::from("living")].phase,
            Phase::Boost
        );
        assert!(outcome.report.rooms.contains_key(&RoomId::from("kitchen")));
    }
}
