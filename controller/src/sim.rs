//! Bench-top stand-in for the grow chamber when running off-device.
//!
//! Relay outputs feed back into the simulated climate, pH and reservoir so
//! the scheduler sees plausible responses to its own actions.

use aeroponic_common::{ClimateReading, Probes, Relay, ReservoirConfig, SensorError};

const DAY_LENGTH_MS: f32 = 120_000.0;

pub struct SimulatedRig {
    reservoir: ReservoirConfig,
    relays: [bool; 4],
    temperature_c: f32,
    humidity_pct: f32,
    ph: f32,
    water_level_cm: f32,
    light_raw: u16,
    last_ms: Option<u64>,
}

impl SimulatedRig {
    pub fn new(reservoir: ReservoirConfig) -> Self {
        Self {
            reservoir,
            relays: Relay::ALL.map(Relay::initial_state),
            temperature_c: 24.0,
            humidity_pct: 55.0,
            ph: 6.8,
            water_level_cm: 20.0,
            light_raw: 300,
            last_ms: None,
        }
    }

    fn slot(relay: Relay) -> usize {
        match relay {
            Relay::VpdPump => 0,
            Relay::AcidPump => 1,
            Relay::BasePump => 2,
            Relay::MixPump => 3,
        }
    }

    pub fn set_relay(&mut self, relay: Relay, on: bool) {
        self.relays[Self::slot(relay)] = on;
    }

    pub fn relay(&self, relay: Relay) -> bool {
        self.relays[Self::slot(relay)]
    }

    /// Integrates the chamber from the previous call up to `now_ms`.
    pub fn advance(&mut self, now_ms: u64) {
        let dt_s = match self.last_ms {
            Some(last) => now_ms.saturating_sub(last) as f32 / 1000.0,
            None => 0.0,
        };
        self.last_ms = Some(now_ms);

        let misting = self.relay(Relay::VpdPump);
        let humidity_rate = if misting { 2.0 } else { -0.25 };
        self.humidity_pct = (self.humidity_pct + humidity_rate * dt_s).clamp(20.0, 95.0);

        let mut ph_rate = 0.000_5;
        if self.relay(Relay::AcidPump) {
            ph_rate -= 0.05;
        }
        if self.relay(Relay::BasePump) {
            ph_rate += 0.05;
        }
        self.ph = (self.ph + ph_rate * dt_s).clamp(0.0, 14.0);

        if misting {
            self.water_level_cm = (self.water_level_cm - 0.002 * dt_s).max(0.0);
        }

        let phase = (now_ms as f32 % DAY_LENGTH_MS) / DAY_LENGTH_MS;
        let daylight = (phase * core::f32::consts::TAU).sin().max(0.0);
        self.light_raw = (100.0 + 3_800.0 * daylight) as u16;
        self.temperature_c = 21.0 + 6.0 * daylight;
    }
}

impl Probes for SimulatedRig {
    fn read_climate(&mut self) -> Result<ClimateReading, SensorError> {
        Ok(ClimateReading {
            temperature_c: self.temperature_c,
            humidity_pct: self.humidity_pct,
        })
    }

    fn read_ph_raw(&mut self) -> Result<u16, SensorError> {
        Ok((self.ph * 4095.0 / 14.0).round() as u16)
    }

    fn measure_echo_us(&mut self) -> Result<u32, SensorError> {
        let distance_cm = self.reservoir.height_cm - self.water_level_cm;
        let echo_us = (distance_cm * 2.0 / self.reservoir.speed_of_sound_cm_per_us) as u32;
        if echo_us > self.reservoir.echo_timeout_us {
            return Err(SensorError::EchoTimeout(self.reservoir.echo_timeout_us));
        }
        Ok(echo_us)
    }

    fn read_light_raw(&mut self) -> Result<u16, SensorError> {
        Ok(self.light_raw)
    }
}
