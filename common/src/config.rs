use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Timing and threshold constants for the four scheduler sub-machines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub vpd_pump_duration_ms: u64,
    pub vpd_initial_interval_ms: u64,
    pub vpd_high_kpa: f32,
    pub vpd_low_kpa: f32,
    pub vpd_fast_interval_ms: u64,
    pub vpd_normal_interval_ms: u64,
    pub vpd_slow_interval_ms: u64,

    pub ph_check_interval_ms: u64,
    pub ph_wait_interval_ms: u64,
    pub ph_lower_limit: f32,
    pub ph_upper_limit: f32,
    pub mix_pause_ms: u64,
    /// Fraction of reservoir volume dosed per liter, folded into ms by the
    /// reservoir sampler.
    pub dosage_rate: f32,

    /// Compared against the millisecond clock like every other interval.
    pub reservoir_check_interval_ms: u64,

    pub rotation_interval_ms: u64,
    pub steps_per_revolution: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            vpd_pump_duration_ms: 5_000,
            vpd_initial_interval_ms: 120,
            vpd_high_kpa: 1.5,
            vpd_low_kpa: 0.8,
            vpd_fast_interval_ms: 6_000,
            vpd_normal_interval_ms: 12_000,
            vpd_slow_interval_ms: 18_000,
            ph_check_interval_ms: 30_000,
            ph_wait_interval_ms: 18_000,
            ph_lower_limit: 5.5,
            ph_upper_limit: 6.5,
            mix_pause_ms: 1_000,
            dosage_rate: 0.000_25,
            reservoir_check_interval_ms: 3_600,
            rotation_interval_ms: 5_000,
            steps_per_revolution: 200,
        }
    }
}

impl SchedulerConfig {
    pub fn quarter_turn_steps(&self) -> i32 {
        (self.steps_per_revolution / 4) as i32
    }
}

/// Cylindrical reservoir and HC-SR04 conversion constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReservoirConfig {
    pub radius_cm: f32,
    pub height_cm: f32,
    pub speed_of_sound_cm_per_us: f32,
    pub echo_timeout_us: u32,
}

impl Default for ReservoirConfig {
    fn default() -> Self {
        Self {
            radius_cm: 20.0,
            height_cm: 35.0,
            speed_of_sound_cm_per_us: 0.034,
            echo_timeout_us: 25_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepperConfig {
    /// steps per second
    pub max_speed: f32,
    /// steps per second squared
    pub acceleration: f32,
}

impl Default for StepperConfig {
    fn default() -> Self {
        Self {
            max_speed: 1_000.0,
            acceleration: 500.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub data_min_interval_ms: u64,
    pub control_min_interval_ms: u64,
    pub dashboard_max_age_s: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            data_min_interval_ms: 1_000,
            control_min_interval_ms: 100,
            dashboard_max_age_s: 31_536_000,
        }
    }
}

/// The two externally adjustable values. Never range-checked.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Setpoints {
    #[serde(rename = "lightThreshold")]
    pub light_threshold: i32,
    #[serde(rename = "pHTarget")]
    pub ph_target: f32,
}

impl Default for Setpoints {
    fn default() -> Self {
        Self {
            light_threshold: 500,
            ph_target: 6.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    /// Empty disables telemetry.
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub telemetry_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: String::new(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            telemetry_interval_ms: 10_000,
        }
    }
}

impl NetworkConfig {
    pub fn mqtt_enabled(&self) -> bool {
        !self.mqtt_host.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    pub reservoir: ReservoirConfig,
    pub stepper: StepperConfig,
    pub http: HttpConfig,
    pub setpoints: Setpoints,
    pub network: NetworkConfig,
    pub control_loop_period_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            reservoir: ReservoirConfig::default(),
            stepper: StepperConfig::default(),
            http: HttpConfig::default(),
            setpoints: Setpoints::default(),
            network: NetworkConfig::default(),
            control_loop_period_ms: 20,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_slice(raw: &[u8]) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_slice(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let scheduler = &self.scheduler;
        if scheduler.steps_per_revolution < 4 {
            return Err(ConfigError::StepsPerRevolution(
                scheduler.steps_per_revolution,
            ));
        }
        if scheduler.ph_lower_limit > scheduler.ph_upper_limit {
            return Err(ConfigError::InvertedPhBand {
                lower: scheduler.ph_lower_limit,
                upper: scheduler.ph_upper_limit,
            });
        }
        if scheduler.vpd_low_kpa > scheduler.vpd_high_kpa {
            return Err(ConfigError::InvertedVpdBands {
                low: scheduler.vpd_low_kpa,
                high: scheduler.vpd_high_kpa,
            });
        }

        if !(self.reservoir.radius_cm > 0.0) {
            return Err(ConfigError::ReservoirGeometry("radius"));
        }
        if !(self.reservoir.height_cm > 0.0) {
            return Err(ConfigError::ReservoirGeometry("height"));
        }
        if !(self.reservoir.speed_of_sound_cm_per_us > 0.0) {
            return Err(ConfigError::ReservoirGeometry("speed of sound"));
        }

        if !(self.stepper.max_speed > 0.0) {
            return Err(ConfigError::StepperMotion("max speed"));
        }
        if !(self.stepper.acceleration > 0.0) {
            return Err(ConfigError::StepperMotion("acceleration"));
        }

        if self.control_loop_period_ms == 0 {
            return Err(ConfigError::LoopPeriod);
        }
        if self.network.telemetry_interval_ms == 0 {
            return Err(ConfigError::TelemetryInterval);
        }

        Ok(())
    }
}
