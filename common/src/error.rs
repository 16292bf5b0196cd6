use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    #[error("probe returned not-a-number")]
    NotANumber,
    #[error("echo pulse timed out after {0}us")]
    EchoTimeout(u32),
    #[error("crc mismatch (expected {expected:#04x}, got {actual:#04x})")]
    Crc { expected: u8, actual: u8 },
    #[error("bus error: {0}")]
    Bus(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("empty request body")]
    EmptyBody,
    #[error("Invalid JSON")]
    InvalidJson,
    #[error("no recognized setpoint in request")]
    NoSetpoint,
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("steps_per_revolution must be at least 4, got {0}")]
    StepsPerRevolution(u32),
    #[error("pH band is inverted: lower {lower} > upper {upper}")]
    InvertedPhBand { lower: f32, upper: f32 },
    #[error("VPD bands are inverted: low {low} > high {high}")]
    InvertedVpdBands { low: f32, high: f32 },
    #[error("reservoir {0} must be positive")]
    ReservoirGeometry(&'static str),
    #[error("stepper {0} must be positive")]
    StepperMotion(&'static str),
    #[error("control loop period must be non-zero")]
    LoopPeriod,
    #[error("telemetry interval must be non-zero")]
    TelemetryInterval,
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}
