pub mod config;
pub mod derived;
pub mod error;
pub mod facade;
pub mod scheduler;
pub mod sensors;
pub mod stepper;
pub mod topics;
pub mod types;

pub use config::{
    HttpConfig, NetworkConfig, ReservoirConfig, RuntimeConfig, SchedulerConfig, Setpoints,
    StepperConfig,
};
pub use error::{ConfigError, ControlError, SensorError};
pub use facade::{ControlResponse, DataResponse, HttpFacade, RateGate};
pub use scheduler::{ActuationScheduler, SchedulerAction, SetpointUpdate};
pub use sensors::{ClimateReading, Probes, SensorReader, SensorReadings};
pub use stepper::{StepDirection, StepGenerator};
pub use topics::*;
pub use types::{ControllerStatus, DataPayload, PhPhase, Relay, SensorSnapshot};
