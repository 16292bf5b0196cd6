use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Relay {
    VpdPump,
    AcidPump,
    BasePump,
    MixPump,
}

impl Relay {
    pub const ALL: [Relay; 4] = [Self::VpdPump, Self::AcidPump, Self::BasePump, Self::MixPump];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::VpdPump => "VPD_PUMP",
            Self::AcidPump => "ACID_PUMP",
            Self::BasePump => "BASE_PUMP",
            Self::MixPump => "MIX_PUMP",
        }
    }

    /// Output level at power-up. The recirculation pump runs by default.
    pub fn initial_state(self) -> bool {
        matches!(self, Self::MixPump)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhPhase {
    Idle,
    Dosing,
    Settling,
    Waiting,
}

impl PhPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Dosing => "DOSING",
            Self::Settling => "SETTLING",
            Self::Waiting => "WAITING",
        }
    }
}

/// Last sampled value of every measured and derived quantity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct SensorSnapshot {
    pub temperature: f32,
    pub humidity: f32,
    pub vpd: f32,
    #[serde(rename = "pH")]
    pub ph: f32,
    #[serde(rename = "waterLevel")]
    pub water_level: f32,
    #[serde(rename = "reservoirVolume")]
    pub reservoir_volume: f32,
    #[serde(rename = "lightIntensity")]
    pub light_intensity: i32,
}

/// Body of `GET /data`: every value pre-formatted with its unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPayload {
    #[serde(rename = "Temperature")]
    pub temperature: String,
    #[serde(rename = "Humidity")]
    pub humidity: String,
    #[serde(rename = "VPD")]
    pub vpd: String,
    #[serde(rename = "pH")]
    pub ph: String,
    #[serde(rename = "WaterLevel")]
    pub water_level: String,
    #[serde(rename = "ReservoirVolume")]
    pub reservoir_volume: String,
    #[serde(rename = "LightIntensity")]
    pub light_intensity: String,
}

impl From<&SensorSnapshot> for DataPayload {
    fn from(snapshot: &SensorSnapshot) -> Self {
        Self {
            temperature: format!("{:.1} °C", snapshot.temperature),
            humidity: format!("{:.1} %", snapshot.humidity),
            vpd: format!("{:.2} kPa", snapshot.vpd),
            ph: format!("{:.2}", snapshot.ph),
            water_level: format!("{:.1} cm", snapshot.water_level),
            reservoir_volume: format!("{:.1} L", snapshot.reservoir_volume),
            light_intensity: snapshot.light_intensity.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    #[serde(flatten)]
    pub snapshot: SensorSnapshot,
    #[serde(rename = "lightThreshold")]
    pub light_threshold: i32,
    #[serde(rename = "pHTarget")]
    pub ph_target: f32,
    #[serde(rename = "vpdPumping")]
    pub vpd_pumping: bool,
    #[serde(rename = "vpdCycleIntervalMs")]
    pub vpd_cycle_interval_ms: u64,
    #[serde(rename = "phPhase")]
    pub ph_phase: &'static str,
    #[serde(rename = "phAdjusting")]
    pub ph_adjusting: bool,
    #[serde(rename = "phDoseDurationMs")]
    pub ph_dose_duration_ms: u64,
    pub rotating: bool,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn data_payload_embeds_units() {
        let snapshot = SensorSnapshot {
            temperature: 23.44,
            humidity: 55.0,
            vpd: 1.2345,
            ph: 6.0,
            water_level: 20.06,
            reservoir_volume: 25.13,
            light_intensity: 1234,
        };

        let payload = DataPayload::from(&snapshot);

        assert_eq!(payload.temperature, "23.4 °C");
        assert_eq!(payload.humidity, "55.0 %");
        assert_eq!(payload.vpd, "1.23 kPa");
        assert_eq!(payload.ph, "6.00");
        assert_eq!(payload.water_level, "20.1 cm");
        assert_eq!(payload.reservoir_volume, "25.1 L");
        assert_eq!(payload.light_intensity, "1234");
    }

    #[test]
    fn data_payload_uses_dashboard_field_names() {
        let payload = DataPayload::from(&SensorSnapshot::default());
        let json = serde_json::to_value(&payload).unwrap();

        for key in [
            "Temperature",
            "Humidity",
            "VPD",
            "pH",
            "WaterLevel",
            "ReservoirVolume",
            "LightIntensity",
        ] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }

    #[test]
    fn only_mix_pump_starts_energized() {
        let energized: Vec<Relay> = Relay::ALL
            .into_iter()
            .filter(|relay| relay.initial_state())
            .collect();
        assert_eq!(energized, vec![Relay::MixPump]);
    }
}
