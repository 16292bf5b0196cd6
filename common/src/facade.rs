//! Request decisions for the HTTP surface, independent of the server that
//! carries them. Both the host (axum) and device (esp-idf) routers delegate
//! here so rate limiting and setpoint parsing behave the same everywhere.

use serde_json::Value;

use crate::{
    config::HttpConfig,
    error::ControlError,
    scheduler::{ActuationScheduler, SetpointUpdate},
    types::DataPayload,
};

/// Minimum spacing between accepted calls. Never-passed gates are open.
#[derive(Debug, Clone)]
pub struct RateGate {
    min_interval_ms: u64,
    last_pass_ms: Option<u64>,
}

impl RateGate {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval_ms,
            last_pass_ms: None,
        }
    }

    pub fn is_open(&self, now_ms: u64) -> bool {
        match self.last_pass_ms {
            Some(last) => now_ms.saturating_sub(last) >= self.min_interval_ms,
            None => true,
        }
    }

    pub fn record(&mut self, now_ms: u64) {
        self.last_pass_ms = Some(now_ms);
    }
}

impl SetpointUpdate {
    /// Parses a `/control` body. `lightThreshold` wins when both keys are
    /// present; numeric strings are accepted for either key.
    pub fn from_json(body: &[u8]) -> Result<Self, ControlError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(ControlError::EmptyBody);
        }

        let value: Value = serde_json::from_slice(body).map_err(|_| ControlError::InvalidJson)?;
        let object = value.as_object().ok_or(ControlError::NoSetpoint)?;

        if let Some(raw) = object.get("lightThreshold") {
            return light_threshold(raw)
                .map(Self::LightThreshold)
                .ok_or(ControlError::InvalidValue("lightThreshold"));
        }

        if let Some(raw) = object.get("pHTarget") {
            return ph_target(raw)
                .map(Self::PhTarget)
                .ok_or(ControlError::InvalidValue("pHTarget"));
        }

        Err(ControlError::NoSetpoint)
    }

    /// Parses a plain numeric MQTT command payload for `key`.
    pub fn from_payload(key: &str, payload: &[u8]) -> Result<Self, ControlError> {
        let text = std::str::from_utf8(payload).map_err(|_| ControlError::InvalidJson)?;
        let value = Value::String(text.trim().to_string());

        match key {
            "lightThreshold" => light_threshold(&value)
                .map(Self::LightThreshold)
                .ok_or(ControlError::InvalidValue("lightThreshold")),
            "pHTarget" => ph_target(&value)
                .map(Self::PhTarget)
                .ok_or(ControlError::InvalidValue("pHTarget")),
            _ => Err(ControlError::NoSetpoint),
        }
    }
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn light_threshold(value: &Value) -> Option<i32> {
    if let Some(integer) = value.as_i64() {
        return Some(integer.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32);
    }
    // float-to-int casts truncate and saturate
    number(value).map(|n| n as i32)
}

fn ph_target(value: &Value) -> Option<f32> {
    number(value).map(|n| n as f32)
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataResponse {
    NotModified,
    Fresh(DataPayload),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub status: u16,
    pub message: String,
}

impl ControlResponse {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFacade {
    config: HttpConfig,
    data_gate: RateGate,
    control_gate: RateGate,
}

impl HttpFacade {
    pub fn new(config: HttpConfig) -> Self {
        Self {
            data_gate: RateGate::new(config.data_min_interval_ms),
            control_gate: RateGate::new(config.control_min_interval_ms),
            config,
        }
    }

    pub fn dashboard_cache_control(&self) -> String {
        format!("max-age={}", self.config.dashboard_max_age_s)
    }

    pub fn data_cache_control(&self) -> String {
        format!("max-age={}", self.config.data_min_interval_ms / 1000)
    }

    pub fn data(&mut self, now_ms: u64, scheduler: &ActuationScheduler) -> DataResponse {
        if !self.data_gate.is_open(now_ms) {
            return DataResponse::NotModified;
        }
        self.data_gate.record(now_ms);
        DataResponse::Fresh(DataPayload::from(&scheduler.snapshot()))
    }

    /// Rate limit, parse, then apply. Only an applied update touches the
    /// scheduler. Well-formed JSON without a recognized key is accepted with
    /// an empty message and changes nothing.
    pub fn control(
        &mut self,
        now_ms: u64,
        body: &[u8],
        scheduler: &mut ActuationScheduler,
    ) -> ControlResponse {
        if !self.control_gate.is_open(now_ms) {
            return ControlResponse::new(429, "Too Many Requests");
        }

        let update = match SetpointUpdate::from_json(body) {
            Ok(update) => update,
            Err(ControlError::EmptyBody) => {
                return ControlResponse::new(400, ControlError::EmptyBody.to_string());
            }
            Err(ControlError::NoSetpoint) => {
                self.control_gate.record(now_ms);
                return ControlResponse::new(200, "");
            }
            Err(err) => {
                self.control_gate.record(now_ms);
                return ControlResponse::new(400, err.to_string());
            }
        };
        self.control_gate.record(now_ms);

        ControlResponse::new(200, scheduler.apply_setpoint(update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ReservoirConfig, SchedulerConfig, Setpoints},
        sensors::{ClimateReading, SensorReadings},
    };
    use pretty_assertions::assert_eq;

    fn scheduler() -> ActuationScheduler {
        let mut scheduler = ActuationScheduler::new(
            SchedulerConfig::default(),
            ReservoirConfig::default(),
            Setpoints::default(),
        );
        scheduler.update_readings(&SensorReadings {
            climate: Some(ClimateReading {
                temperature_c: 23.4,
                humidity_pct: 55.0,
            }),
            ph: Some(6.0),
            distance_cm: Some(15.0),
            light: Some(1_234),
        });
        scheduler
    }

    fn facade() -> HttpFacade {
        HttpFacade::new(HttpConfig::default())
    }

    #[test]
    fn data_is_fresh_then_not_modified_within_a_second() {
        let mut facade = facade();
        let mut scheduler = scheduler();

        let DataResponse::Fresh(payload) = facade.data(10_000, &scheduler) else {
            panic!("first call should be fresh");
        };
        assert_eq!(payload.temperature, "23.4 °C");
        assert_eq!(payload.water_level, "20.0 cm");
        assert_eq!(payload.light_intensity, "1234");

        assert_eq!(facade.data(10_999, &scheduler), DataResponse::NotModified);

        scheduler.update_readings(&SensorReadings {
            climate: Some(ClimateReading {
                temperature_c: 25.0,
                humidity_pct: 60.0,
            }),
            ph: Some(6.5),
            distance_cm: Some(25.0),
            light: Some(2_048),
        });

        let DataResponse::Fresh(payload) = facade.data(11_000, &scheduler) else {
            panic!("call after the window should be fresh");
        };
        assert_eq!(payload.temperature, "25.0 °C");
        assert_eq!(payload.humidity, "60.0 %");
        assert_eq!(payload.ph, "6.50");
        assert_eq!(payload.water_level, "10.0 cm");
        assert_eq!(payload.light_intensity, "2048");
    }

    #[test]
    fn not_modified_does_not_restart_the_window() {
        let mut facade = facade();
        let scheduler = scheduler();

        facade.data(0, &scheduler);
        assert_eq!(facade.data(900, &scheduler), DataResponse::NotModified);
        assert!(matches!(
            facade.data(1_000, &scheduler),
            DataResponse::Fresh(_)
        ));
    }

    #[test]
    fn ph_target_update_leaves_light_threshold() {
        let mut facade = facade();
        let mut scheduler = scheduler();

        let response = facade.control(0, br#"{"pHTarget": 6.2}"#, &mut scheduler);

        assert_eq!(response, ControlResponse::new(200, "pH target set to: 6.20"));
        assert_eq!(scheduler.setpoints().ph_target, 6.2);
        assert_eq!(scheduler.setpoints().light_threshold, 500);
    }

    #[test]
    fn second_control_within_window_is_rejected_without_mutation() {
        let mut facade = facade();
        let mut scheduler = scheduler();

        let first = facade.control(1_000, br#"{"lightThreshold": 800}"#, &mut scheduler);
        assert_eq!(first, ControlResponse::new(200, "Light threshold set to: 800"));

        let second = facade.control(1_050, br#"{"lightThreshold": 100}"#, &mut scheduler);
        assert_eq!(second.status, 429);
        assert_eq!(second.message, "Too Many Requests");
        assert_eq!(scheduler.setpoints().light_threshold, 800);

        let third = facade.control(1_100, br#"{"lightThreshold": 100}"#, &mut scheduler);
        assert_eq!(third.status, 200);
        assert_eq!(scheduler.setpoints().light_threshold, 100);
    }

    #[test]
    fn malformed_or_empty_bodies_are_client_errors() {
        let mut facade = facade();
        let mut scheduler = scheduler();
        let before = scheduler.setpoints();

        let response = facade.control(0, b"{not json", &mut scheduler);
        assert_eq!(response, ControlResponse::new(400, "Invalid JSON"));

        let response = facade.control(1_000, b"", &mut scheduler);
        assert_eq!(response.status, 400);

        assert_eq!(scheduler.setpoints(), before);
    }

    #[test]
    fn unknown_keys_are_accepted_without_mutation() {
        let mut facade = facade();
        let mut scheduler = scheduler();
        let before = scheduler.setpoints();

        let response = facade.control(0, br#"{"target": 3}"#, &mut scheduler);
        assert_eq!(response, ControlResponse::new(200, ""));

        let response = facade.control(1_000, b"[1,2]", &mut scheduler);
        assert_eq!(response, ControlResponse::new(200, ""));

        // the accepted no-op still consumes the rate window
        let response = facade.control(1_050, br#"{"pHTarget": 5.0}"#, &mut scheduler);
        assert_eq!(response.status, 429);

        assert_eq!(scheduler.setpoints(), before);
    }

    #[test]
    fn light_threshold_wins_over_ph_target() {
        assert_eq!(
            SetpointUpdate::from_json(br#"{"pHTarget": 7.0, "lightThreshold": 10}"#),
            Ok(SetpointUpdate::LightThreshold(10))
        );
    }

    #[test]
    fn numeric_strings_are_accepted() {
        assert_eq!(
            SetpointUpdate::from_json(br#"{"lightThreshold": "1500"}"#),
            Ok(SetpointUpdate::LightThreshold(1_500))
        );
        assert_eq!(
            SetpointUpdate::from_json(br#"{"pHTarget": "5.8"}"#),
            Ok(SetpointUpdate::PhTarget(5.8))
        );
        assert_eq!(
            SetpointUpdate::from_json(br#"{"lightThreshold": 12.9}"#),
            Ok(SetpointUpdate::LightThreshold(12))
        );
        assert_eq!(
            SetpointUpdate::from_json(br#"{"pHTarget": "acid"}"#),
            Err(ControlError::InvalidValue("pHTarget"))
        );
    }

    #[test]
    fn mqtt_payloads_parse_as_plain_numbers() {
        assert_eq!(
            SetpointUpdate::from_payload("pHTarget", b" 6.5\n"),
            Ok(SetpointUpdate::PhTarget(6.5))
        );
        assert_eq!(
            SetpointUpdate::from_payload("lightThreshold", b"-20"),
            Ok(SetpointUpdate::LightThreshold(-20))
        );
        assert_eq!(
            SetpointUpdate::from_payload("lightThreshold", b"bright"),
            Err(ControlError::InvalidValue("lightThreshold"))
        );
    }

    #[test]
    fn cache_headers_follow_config() {
        let facade = facade();
        assert_eq!(facade.dashboard_cache_control(), "max-age=31536000");
        assert_eq!(facade.data_cache_control(), "max-age=1");
    }
}
