use crate::types::{
    AggregationMethod, Category, Direction, HvacMode, OutdoorPolicy, Participation, Phase,
    Profile,
};

/// Minimum setpoint change worth sending to a device.
pub const SETPOINT_EPSILON: f64 = 0.05;

/// Diff thresholds for escalating to category 2 and 3.
/// Invariant: `category2_diff < category3_diff` (enforced at config load).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub category2_diff: f64,
    pub category3_diff: f64,
}

/// Combine valid sensor readings into one room temperature.
/// An empty slice means "no usable sensor" and yields `None`, never 0.
pub fn aggregate_temperature(values: &[f64], method: AggregationMethod) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let value = match method {
        AggregationMethod::Average => values.iter().sum::<f64>() / values.len() as f64,
        AggregationMethod::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        AggregationMethod::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        AggregationMethod::Median => median(values),
        AggregationMethod::First => values[0],
    };
    Some(value)
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub fn within_target(current: f64, target: f64, tolerance: f64) -> bool {
    (current - target).abs() <= tolerance
}

/// Boost re-entry hysteresis: while holding, drift must exceed the
/// tolerance edge by `delta` before boost restarts.
pub fn should_reenter_boost(
    current: f64,
    target: f64,
    tolerance: f64,
    delta: f64,
    direction: Direction,
) -> bool {
    match direction {
        Direction::Heat => current <= (target - tolerance) - delta,
        Direction::Cool => current >= (target + tolerance) + delta,
    }
}

/// Phase transition. Reaching target always wins and resets the offset;
/// entering boost starts at one step (normal) or jumps to the maximum
/// (fast/extreme); a normal boost ramps one step per elapsed `t_time`.
pub fn next_phase_and_offset(
    profile: Profile,
    phase: Phase,
    reached_target: bool,
    current_offset: f64,
    step_offset: f64,
    max_offset: f64,
    elapsed_boost_ms: u64,
    t_time_ms: u64,
) -> (Phase, f64) {
    if reached_target {
        return (Phase::Hold, 0.0);
    }

    match phase {
        Phase::Idle | Phase::Hold => match profile {
            Profile::Normal => (Phase::Boost, step_offset.min(max_offset)),
            Profile::Fast | Profile::Extreme => (Phase::Boost, max_offset),
        },
        Phase::Boost => match profile {
            Profile::Normal if elapsed_boost_ms >= t_time_ms => {
                (Phase::Boost, (current_offset + step_offset).min(max_offset))
            }
            // Re-clamp so a shrunken max_offset takes effect mid-boost.
            Profile::Normal => (Phase::Boost, current_offset.min(max_offset)),
            Profile::Fast | Profile::Extreme => (Phase::Boost, max_offset),
        },
    }
}

/// Category by diff; the top tier degrades to 2 when outdoor policy
/// forbids compressor-class devices.
pub fn select_category(diff: f64, thresholds: &Thresholds, ac_allowed: bool) -> Category {
    let category = if diff < thresholds.category2_diff {
        Category::One
    } else if diff < thresholds.category3_diff {
        Category::Two
    } else {
        Category::Three
    };

    if category == Category::Three && !ac_allowed {
        return Category::Two;
    }
    category
}

/// Setpoint for a climate device. Extreme pushes to the known hard limit
/// in the favorable direction; otherwise target ± offset, clamped to the
/// known device limits.
pub fn compute_setpoint(
    target: f64,
    direction: Direction,
    profile: Profile,
    offset: f64,
    device_min: Option<f64>,
    device_max: Option<f64>,
) -> f64 {
    if profile == Profile::Extreme {
        match direction {
            Direction::Heat => {
                if let Some(max) = device_max {
                    return max;
                }
            }
            Direction::Cool => {
                if let Some(min) = device_min {
                    return min;
                }
            }
        }
    }

    let mut raw = match direction {
        Direction::Heat => target + offset,
        Direction::Cool => target - offset,
    };
    if let Some(min) = device_min {
        raw = raw.max(min);
    }
    if let Some(max) = device_max {
        raw = raw.min(max);
    }
    raw
}

pub fn hvac_mode_for(direction: Direction) -> HvacMode {
    match direction {
        Direction::Heat => HvacMode::Heat,
        Direction::Cool => HvacMode::Cool,
    }
}

/// Cumulative device set for a tier: union of lists 1..=N, de-duplicated,
/// first-seen order preserved.
pub fn merge_categories(lists: [&[String]; 3], category: Category) -> Vec<String> {
    let mut selected: Vec<String> = Vec::new();
    for list in lists.iter().take(category.rank() as usize) {
        for entity in *list {
            if !selected.contains(entity) {
                selected.push(entity.clone());
            }
        }
    }
    selected
}

pub fn is_climate_entity(entity_id: &str) -> bool {
    entity_id.starts_with("climate.")
}

/// Drop weather-sensitive climates when outdoor policy blocks them.
pub fn filter_weather_sensitive(
    entity_ids: Vec<String>,
    weather_sensitive: &[String],
    outdoor_allowed: bool,
) -> Vec<String> {
    if outdoor_allowed {
        return entity_ids;
    }
    entity_ids
        .into_iter()
        .filter(|id| !(is_climate_entity(id) && weather_sensitive.contains(id)))
        .collect()
}

pub fn should_activate_dumb_device(
    room_category: Category,
    device_category: Category,
    room_direction: Direction,
    device_type: Direction,
    participation: Participation,
) -> bool {
    device_category <= room_category
        && device_type == room_direction
        && participation != Participation::Off
}

/// Outdoor-temperature policy knobs, resolved once per cycle.
#[derive(Debug, Clone, Copy)]
pub struct OutdoorGate {
    pub missing_policy: OutdoorPolicy,
    pub min_outdoor_for_heatpump: f64,
    pub max_outdoor_for_cool: f64,
    pub window_min: f64,
    pub window_max: f64,
    pub heat_target_delta: f64,
    pub cool_target_delta: f64,
}

impl OutdoorGate {
    /// Whether compressor-class (category 3) escalation is permitted.
    pub fn ac_allowed(&self, outdoor: Option<f64>, direction: Direction) -> bool {
        let Some(outdoor) = outdoor else {
            return self.missing_policy != OutdoorPolicy::Block;
        };
        match direction {
            Direction::Heat => outdoor >= self.min_outdoor_for_heatpump,
            Direction::Cool => outdoor <= self.max_outdoor_for_cool,
        }
    }

    /// Whether weather-sensitive devices may run at all. Outdoor must lie
    /// inside the global window; under the normal profile the device is
    /// also skipped when outdoor is already favorable relative to target.
    pub fn weather_sensitive_allowed(
        &self,
        outdoor: Option<f64>,
        target: f64,
        direction: Direction,
        profile: Profile,
    ) -> bool {
        let Some(outdoor) = outdoor else {
            return self.missing_policy != OutdoorPolicy::Block;
        };
        if outdoor < self.window_min || outdoor > self.window_max {
            return false;
        }
        if profile != Profile::Normal {
            return true;
        }
        match direction {
            Direction::Heat => outdoor < target - self.heat_target_delta,
            Direction::Cool => outdoor > target + self.cool_target_delta,
        }
    }
}
