//! Machine configuration parameters
//!
//! All tunable parameters for the LaserRoom station, grouped by subsystem.
//! Values are read through a [`ConfigPort`] as dotted `section.field` keys
//! and overlaid on [`MachineConfig::default()`], so a store only needs to
//! hold the keys an installer actually changed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::app::ports::{ConfigError, ConfigPort};

/// Which DeviceLink backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Try hardware, fall back to simulation unless `force_hardware`.
    #[default]
    Auto,
    Hardware,
    Simulated,
}

/// Coprocessor / GPIO link settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub backend: BackendKind,
    /// Fail startup instead of falling back to simulation.
    pub force_hardware: bool,
    pub serial_port: String,
    pub baud_rate: u32,
    /// Wait for a reply to one request (milliseconds)
    pub reply_timeout_ms: u64,
    /// Upper bound for a blocking coprocessor move (milliseconds)
    pub move_timeout_ms: u64,
    /// Local GPIO character device for relays, buttons and table switches
    pub gpio_chip: String,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            force_hardware: false,
            serial_port: "/dev/ttyUSB0".into(),
            baud_rate: 115_200,
            reply_timeout_ms: 1000,
            move_timeout_ms: 10_000,
            gpio_chip: "/dev/gpiochip4".into(),
        }
    }
}

/// Cleaning-head stepper axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisConfig {
    pub axis_id: u8,
    // --- Coprocessor pins ---
    pub step_pin: u32,
    pub dir_pin: u32,
    pub enable_pin: u32,
    pub limit_a_pin: u32,
    pub limit_b_pin: u32,
    pub home_pin: u32,
    /// Driver enable input is active-low (LOW = energised)
    pub enable_active_low: bool,

    // --- Travel ---
    pub min_position: i64,
    pub max_position: i64,
    /// Steps per indexed move
    pub index_distance: u32,
    /// Steps per jog when the caller does not specify
    pub jog_step_size: u32,

    // --- Speeds (steps/sec) ---
    /// Indexed / absolute move speed
    pub speed: u32,
    pub jog_speed: u32,
    /// Homing speed; `None` means a third of `speed`
    pub home_speed: Option<u32>,

    // --- Homing ---
    /// Steps per homing increment
    pub home_increment: u32,
    /// Step budget before homing gives up
    pub home_max_steps: u32,

    // --- Timing ---
    /// Extra allowance on top of the computed travel time (milliseconds)
    pub move_timeout_ms: u64,
    /// Driver stays energised this long after a soft disable (milliseconds)
    pub hold_ms: u64,
    /// Limit/home poll interval (milliseconds)
    pub poll_interval_ms: u64,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            axis_id: 0,
            // Pins
            step_pin: 25,
            dir_pin: 26,
            enable_pin: 27,
            limit_a_pin: 18,
            limit_b_pin: 19,
            home_pin: 21,
            enable_active_low: true,

            // Travel
            min_position: -500,
            max_position: 500,
            index_distance: 50,
            jog_step_size: 10,

            // Speeds
            speed: 1000,
            jog_speed: 500,
            home_speed: None,

            // Homing
            home_increment: 10,
            home_max_steps: 2000,

            // Timing
            move_timeout_ms: 10_000,
            hold_ms: 500,
            poll_interval_ms: 100,
        }
    }
}

impl AxisConfig {
    /// Effective homing speed (about 33% of the indexed-move speed).
    pub fn effective_home_speed(&self) -> u32 {
        self.home_speed.unwrap_or(self.speed / 3).max(1)
    }
}

/// Trigger servo and firing statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FireConfig {
    pub servo_pin: u32,
    /// Normal (rest) angle in degrees
    pub position_a: u16,
    /// Fire angle in degrees
    pub position_b: u16,
    pub min_angle: u16,
    pub max_angle: u16,
    /// Swap which angle is treated as rest vs fire
    pub inverted: bool,
    /// Delay between fiber pattern steps (milliseconds)
    pub sequence_delay_ms: u64,
    /// Shortest firing that counts toward the fire statistics (milliseconds)
    pub fire_threshold_ms: u64,
    pub fire_toggle_debounce_ms: u64,
    pub fiber_toggle_debounce_ms: u64,
    /// Toggle-off before this hold time is ignored (milliseconds)
    pub min_hold_ms: u64,
    /// Bounded join when stopping the fiber worker (milliseconds)
    pub stop_join_timeout_ms: u64,
}

impl Default for FireConfig {
    fn default() -> Self {
        Self {
            servo_pin: 12,
            position_a: 0,
            position_b: 90,
            min_angle: 0,
            max_angle: 180,
            inverted: false,
            sequence_delay_ms: 500,
            fire_threshold_ms: 2000,
            fire_toggle_debounce_ms: 250,
            fiber_toggle_debounce_ms: 1000,
            min_hold_ms: 200,
            stop_join_timeout_ms: 2000,
        }
    }
}

/// Whether `update()` drives an output automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    #[default]
    Auto,
    Manual,
}

/// Relay outputs and table end switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub fan_pin: u32,
    pub red_lights_pin: u32,
    pub table_forward_pin: u32,
    pub table_backward_pin: u32,
    pub table_front_switch_pin: u32,
    pub table_back_switch_pin: u32,
    /// End switches pull the line low when triggered
    pub switches_active_low: bool,
    pub fan_mode: OutputMode,
    pub lights_mode: OutputMode,
    pub fan_off_delay_ms: u64,
    pub lights_off_delay_ms: u64,
    /// Limit / auto-off poll interval (milliseconds)
    pub poll_interval_ms: u64,
    /// Longest table run toward an end switch (milliseconds)
    pub table_run_timeout_ms: u64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            fan_pin: 26,
            red_lights_pin: 16,
            table_forward_pin: 13,
            table_backward_pin: 6,
            table_front_switch_pin: 21,
            table_back_switch_pin: 20,
            switches_active_low: true,
            fan_mode: OutputMode::Auto,
            lights_mode: OutputMode::Auto,
            fan_off_delay_ms: 600_000, // 10 min
            lights_off_delay_ms: 60_000, // 1 min
            poll_interval_ms: 100,
            table_run_timeout_ms: 30_000,
        }
    }
}

/// Physical operator buttons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub enabled: bool,
    pub button_in_pin: u32,
    pub button_out_pin: u32,
    pub fire_button_pin: u32,
    pub invert_switch_pin: u32,
    pub active_low: bool,
    pub poll_interval_ms: u64,
    pub debounce_ms: u64,
    pub long_press_ms: u64,
    pub double_press_ms: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            button_in_pin: 5,
            button_out_pin: 25,
            fire_button_pin: 22,
            invert_switch_pin: 12,
            active_low: true,
            poll_interval_ms: 20,
            debounce_ms: 50,
            long_press_ms: 1000,
            double_press_ms: 400,
        }
    }
}

/// Sequence engine timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Stop / pause / input poll slice (milliseconds)
    pub poll_interval_ms: u64,
    /// Bounded worker join on stop (milliseconds)
    pub stop_join_timeout_ms: u64,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            stop_join_timeout_ms: 2000,
        }
    }
}

/// Manual-operation gate fed by the access-control collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AccessConfig {
    /// Manual commands require a grant
    pub required: bool,
}

/// Core machine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MachineConfig {
    pub link: LinkConfig,
    pub axis: AxisConfig,
    pub fire: FireConfig,
    pub outputs: OutputConfig,
    pub inputs: InputConfig,
    pub sequence: SequenceConfig,
    pub access: AccessConfig,
}

impl MachineConfig {
    /// Read every known `section.field` key from `port`, falling back to the
    /// default for keys the store does not hold, then validate.
    pub fn load(port: &dyn ConfigPort) -> Result<Self, ConfigError> {
        let defaults = serde_json::to_value(Self::default()).map_err(|_| ConfigError::Corrupted)?;
        let Value::Object(sections) = defaults else {
            return Err(ConfigError::Corrupted);
        };

        let mut merged = Map::new();
        let mut overridden = 0usize;
        for (section, fields) in sections {
            let Value::Object(fields) = fields else {
                merged.insert(section, fields);
                continue;
            };
            let mut out = Map::new();
            for (field, default) in fields {
                let key = format!("{section}.{field}");
                match port.get(&key) {
                    Some(v) => {
                        overridden += 1;
                        out.insert(field, v);
                    }
                    None => {
                        out.insert(field, default);
                    }
                }
            }
            merged.insert(section, Value::Object(out));
        }

        let cfg: Self =
            serde_json::from_value(Value::Object(merged)).map_err(|_| ConfigError::Corrupted)?;
        cfg.validate()?;
        log::info!("Config loaded ({overridden} stored keys)");
        Ok(cfg)
    }

    /// Write every field back as `section.field` keys.
    pub fn store(&self, port: &dyn ConfigPort) -> Result<(), ConfigError> {
        self.validate()?;
        let Value::Object(sections) = serde_json::to_value(self).map_err(|_| ConfigError::IoError)?
        else {
            return Err(ConfigError::IoError);
        };
        for (section, fields) in sections {
            if let Value::Object(fields) = fields {
                for (field, value) in fields {
                    port.set(&format!("{section}.{field}"), value)?;
                }
            }
        }
        Ok(())
    }

    /// Reject values that would make the machine unsafe or unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let a = &self.axis;
        if a.min_position >= a.max_position {
            return Err(ConfigError::ValidationFailed(
                "axis.min_position must be < axis.max_position",
            ));
        }
        if a.min_position > 0 || a.max_position < 0 {
            return Err(ConfigError::ValidationFailed(
                "axis travel must include the home position 0",
            ));
        }
        if a.speed == 0 || a.jog_speed == 0 || a.home_speed == Some(0) {
            return Err(ConfigError::ValidationFailed("axis speeds must be > 0"));
        }
        if a.index_distance == 0 || a.home_increment == 0 {
            return Err(ConfigError::ValidationFailed(
                "axis.index_distance and axis.home_increment must be > 0",
            ));
        }
        if a.home_max_steps < a.home_increment {
            return Err(ConfigError::ValidationFailed(
                "axis.home_max_steps must cover at least one increment",
            ));
        }
        if a.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationFailed("axis.poll_interval_ms must be > 0"));
        }

        let f = &self.fire;
        if f.min_angle >= f.max_angle || f.max_angle > 180 {
            return Err(ConfigError::ValidationFailed(
                "fire angles must satisfy min_angle < max_angle <= 180",
            ));
        }
        for angle in [f.position_a, f.position_b] {
            if angle < f.min_angle || angle > f.max_angle {
                return Err(ConfigError::ValidationFailed(
                    "fire.position_a/b must lie within [min_angle, max_angle]",
                ));
            }
        }
        if f.position_a == f.position_b {
            return Err(ConfigError::ValidationFailed(
                "fire.position_a and fire.position_b must differ",
            ));
        }

        let o = &self.outputs;
        if o.table_forward_pin == o.table_backward_pin {
            return Err(ConfigError::ValidationFailed(
                "table forward and backward relays need distinct pins",
            ));
        }
        if o.poll_interval_ms == 0 || self.inputs.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationFailed("poll intervals must be > 0"));
        }
        if self.sequence.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "sequence.poll_interval_ms must be > 0",
            ));
        }
        Ok(())
    }
}
