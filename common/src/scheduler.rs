use log::{debug, info, warn};

use crate::{
    config::{ReservoirConfig, SchedulerConfig, Setpoints},
    derived,
    sensors::SensorReadings,
    types::{ControllerStatus, PhPhase, Relay, SensorSnapshot},
};

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerAction {
    RelayOn(Relay),
    RelayOff(Relay),
    /// Relative move of the rotating platform, in steps.
    Rotate { steps: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetpointUpdate {
    LightThreshold(i32),
    PhTarget(f32),
}

#[derive(Debug, Clone)]
struct VpdCycle {
    last_cycle_ms: u64,
    interval_ms: u64,
    pumping: bool,
}

impl VpdCycle {
    fn new(config: &SchedulerConfig) -> Self {
        Self {
            last_cycle_ms: 0,
            interval_ms: config.vpd_initial_interval_ms,
            pumping: false,
        }
    }

    fn tick(
        &mut self,
        now_ms: u64,
        snapshot: &SensorSnapshot,
        config: &SchedulerConfig,
        actions: &mut Vec<SchedulerAction>,
    ) {
        if now_ms.saturating_sub(self.last_cycle_ms) >= self.interval_ms {
            self.last_cycle_ms = now_ms;

            if snapshot.temperature.is_nan() || snapshot.humidity.is_nan() {
                warn!("climate reading unavailable; keeping {}ms mist interval", self.interval_ms);
            } else {
                let vpd =
                    derived::vapor_pressure_deficit(snapshot.temperature, snapshot.humidity);
                self.interval_ms = derived::vpd_cycle_interval_ms(vpd, config);
                info!(
                    "humidity {:.1}%, temperature {:.1}C, VPD {:.2} kPa; next mist in {}s",
                    snapshot.humidity,
                    snapshot.temperature,
                    vpd,
                    self.interval_ms / 1000
                );
            }

            actions.push(SchedulerAction::RelayOn(Relay::VpdPump));
            self.pumping = true;
            info!("VPD pump activated");
        }

        if self.pumping && now_ms.saturating_sub(self.last_cycle_ms) >= config.vpd_pump_duration_ms
        {
            actions.push(SchedulerAction::RelayOff(Relay::VpdPump));
            self.pumping = false;
            info!("VPD pump deactivated");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum PhState {
    Idle,
    Dosing { pump: Relay },
    Settling { until_ms: u64 },
    Waiting,
}

#[derive(Debug, Clone)]
struct PhDosing {
    state: PhState,
    last_check_ms: u64,
    dose_duration_ms: u64,
}

impl PhDosing {
    fn new() -> Self {
        Self {
            state: PhState::Idle,
            last_check_ms: 0,
            dose_duration_ms: 0,
        }
    }

    fn phase(&self) -> PhPhase {
        match self.state {
            PhState::Idle => PhPhase::Idle,
            PhState::Dosing { .. } => PhPhase::Dosing,
            PhState::Settling { .. } => PhPhase::Settling,
            PhState::Waiting => PhPhase::Waiting,
        }
    }

    fn tick(
        &mut self,
        now_ms: u64,
        ph: f32,
        setpoints: &Setpoints,
        config: &SchedulerConfig,
        actions: &mut Vec<SchedulerAction>,
    ) {
        let since_check = now_ms.saturating_sub(self.last_check_ms);

        if self.state == PhState::Idle && since_check >= config.ph_check_interval_ms {
            self.check(now_ms, ph, setpoints, config, actions);
        }

        if self.state == PhState::Waiting && since_check >= config.ph_wait_interval_ms {
            self.state = PhState::Idle;
            self.check(now_ms, ph, setpoints, config, actions);
        }

        if let PhState::Dosing { pump } = self.state {
            if now_ms.saturating_sub(self.last_check_ms) >= self.dose_duration_ms {
                actions.push(SchedulerAction::RelayOff(Relay::AcidPump));
                actions.push(SchedulerAction::RelayOff(Relay::BasePump));
                actions.push(SchedulerAction::RelayOff(Relay::MixPump));
                self.state = PhState::Settling {
                    until_ms: now_ms.saturating_add(config.mix_pause_ms),
                };
                debug!("{} dose finished, pausing recirculation", pump.as_str());
            }
        }

        if let PhState::Settling { until_ms } = self.state {
            if now_ms >= until_ms {
                actions.push(SchedulerAction::RelayOn(Relay::MixPump));
                self.state = PhState::Waiting;
                info!("pH adjustment cycle completed, waiting before rechecking");
            }
        }
    }

    fn check(
        &mut self,
        now_ms: u64,
        ph: f32,
        setpoints: &Setpoints,
        config: &SchedulerConfig,
        actions: &mut Vec<SchedulerAction>,
    ) {
        self.last_check_ms = now_ms;
        info!("current pH: {ph:.2}");

        if ph < config.ph_lower_limit || ph > config.ph_upper_limit {
            let pump = if ph < setpoints.ph_target {
                info!("pH too low, activating base pump");
                Relay::BasePump
            } else {
                info!("pH too high, activating acid pump");
                Relay::AcidPump
            };
            actions.push(SchedulerAction::RelayOn(pump));
            self.state = PhState::Dosing { pump };
            info!(
                "dosing for {} ms based on current reservoir volume",
                self.dose_duration_ms
            );
        } else {
            info!("pH within acceptable range");
        }
    }
}

#[derive(Debug, Clone)]
struct ReservoirSampler {
    last_check_ms: u64,
}

impl ReservoirSampler {
    /// Returns a fresh dosing duration when a sample is due.
    fn tick(
        &mut self,
        now_ms: u64,
        snapshot: &SensorSnapshot,
        config: &SchedulerConfig,
    ) -> Option<u64> {
        if now_ms.saturating_sub(self.last_check_ms) < config.reservoir_check_interval_ms {
            return None;
        }
        self.last_check_ms = now_ms;

        let duration = derived::dosing_duration_ms(snapshot.reservoir_volume, config.dosage_rate);
        debug!(
            "volume: {:.1} liters, dose duration {} ms",
            snapshot.reservoir_volume, duration
        );
        Some(duration)
    }
}

#[derive(Debug, Clone)]
struct RotationCheck {
    last_rotation_ms: u64,
    rotating: bool,
}

impl RotationCheck {
    fn tick(
        &mut self,
        now_ms: u64,
        light: i32,
        setpoints: &Setpoints,
        config: &SchedulerConfig,
        actions: &mut Vec<SchedulerAction>,
    ) {
        if now_ms.saturating_sub(self.last_rotation_ms) < config.rotation_interval_ms {
            return;
        }
        self.last_rotation_ms = now_ms;
        debug!("light intensity: {light}");

        if self.rotating {
            warn!("previous rotation still running, skipping this check");
        } else if light > setpoints.light_threshold {
            actions.push(SchedulerAction::Rotate {
                steps: config.quarter_turn_steps(),
            });
            self.rotating = true;
        } else {
            debug!("insufficient light, not rotating");
        }
    }
}

/// Owns every piece of controller state and advances the four timer-gated
/// sub-machines (mist, pH dosing, reservoir sampling, rotation) once per
/// loop pass. Hardware effects are returned as [`SchedulerAction`]s.
#[derive(Debug, Clone)]
pub struct ActuationScheduler {
    pub config: SchedulerConfig,
    reservoir: ReservoirConfig,
    setpoints: Setpoints,
    snapshot: SensorSnapshot,

    vpd: VpdCycle,
    ph: PhDosing,
    reservoir_sampler: ReservoirSampler,
    rotation: RotationCheck,
}

impl ActuationScheduler {
    pub fn new(config: SchedulerConfig, reservoir: ReservoirConfig, setpoints: Setpoints) -> Self {
        Self {
            vpd: VpdCycle::new(&config),
            ph: PhDosing::new(),
            reservoir_sampler: ReservoirSampler { last_check_ms: 0 },
            rotation: RotationCheck {
                last_rotation_ms: 0,
                rotating: false,
            },
            config,
            reservoir,
            setpoints,
            snapshot: SensorSnapshot::default(),
        }
    }

    /// Relay levels to drive before the first tick.
    pub fn initial_actions(&self) -> Vec<SchedulerAction> {
        Relay::ALL
            .into_iter()
            .map(|relay| {
                if relay.initial_state() {
                    SchedulerAction::RelayOn(relay)
                } else {
                    SchedulerAction::RelayOff(relay)
                }
            })
            .collect()
    }

    /// Overwrites the snapshot. A failed climate read is recorded as NaN;
    /// other failed reads keep the previous value.
    pub fn update_readings(&mut self, readings: &SensorReadings) {
        let snapshot = &mut self.snapshot;

        match readings.climate {
            Some(climate) => {
                snapshot.temperature = climate.temperature_c;
                snapshot.humidity = climate.humidity_pct;
            }
            None => {
                snapshot.temperature = f32::NAN;
                snapshot.humidity = f32::NAN;
            }
        }
        snapshot.vpd = derived::vapor_pressure_deficit(snapshot.temperature, snapshot.humidity);

        if let Some(ph) = readings.ph {
            snapshot.ph = ph;
        }

        if let Some(distance_cm) = readings.distance_cm {
            snapshot.water_level = derived::water_level_cm(distance_cm, &self.reservoir);
            snapshot.reservoir_volume =
                derived::reservoir_volume_liters(snapshot.water_level, &self.reservoir);
        }

        if let Some(light) = readings.light {
            snapshot.light_intensity = light;
        }
    }

    /// Reports the step generator's remaining distance; a finished move
    /// releases the rotation sub-machine.
    pub fn update_stepper(&mut self, distance_to_go: i64) {
        if self.rotation.rotating && distance_to_go == 0 {
            self.rotation.rotating = false;
            info!("rotated 90 degrees");
        }
    }

    pub fn tick(&mut self, now_ms: u64) -> Vec<SchedulerAction> {
        let mut actions = Vec::new();

        self.vpd
            .tick(now_ms, &self.snapshot, &self.config, &mut actions);
        self.ph.tick(
            now_ms,
            self.snapshot.ph,
            &self.setpoints,
            &self.config,
            &mut actions,
        );
        if let Some(duration) = self
            .reservoir_sampler
            .tick(now_ms, &self.snapshot, &self.config)
        {
            self.ph.dose_duration_ms = duration;
        }
        self.rotation.tick(
            now_ms,
            self.snapshot.light_intensity,
            &self.setpoints,
            &self.config,
            &mut actions,
        );

        actions
    }

    pub fn apply_setpoint(&mut self, update: SetpointUpdate) -> String {
        match update {
            SetpointUpdate::LightThreshold(value) => {
                self.setpoints.light_threshold = value;
                format!("Light threshold set to: {value}")
            }
            SetpointUpdate::PhTarget(value) => {
                self.setpoints.ph_target = value;
                format!("pH target set to: {value:.2}")
            }
        }
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        self.snapshot
    }

    pub fn setpoints(&self) -> Setpoints {
        self.setpoints
    }

    pub fn is_vpd_pumping(&self) -> bool {
        self.vpd.pumping
    }

    pub fn vpd_cycle_interval_ms(&self) -> u64 {
        self.vpd.interval_ms
    }

    pub fn ph_phase(&self) -> PhPhase {
        self.ph.phase()
    }

    /// Dosing and the mix pause that follows it both count as adjusting.
    pub fn is_ph_adjusting(&self) -> bool {
        matches!(self.ph.state, PhState::Dosing { .. } | PhState::Settling { .. })
    }

    pub fn is_ph_waiting(&self) -> bool {
        self.ph.state == PhState::Waiting
    }

    pub fn ph_dose_duration_ms(&self) -> u64 {
        self.ph.dose_duration_ms
    }

    pub fn is_rotating(&self) -> bool {
        self.rotation.rotating
    }

    pub fn status(&self, now_ms: u64) -> ControllerStatus {
        ControllerStatus {
            snapshot: self.snapshot,
            light_threshold: self.setpoints.light_threshold,
            ph_target: self.setpoints.ph_target,
            vpd_pumping: self.is_vpd_pumping(),
            vpd_cycle_interval_ms: self.vpd_cycle_interval_ms(),
            ph_phase: self.ph_phase().as_str(),
            ph_adjusting: self.is_ph_adjusting(),
            ph_dose_duration_ms: self.ph_dose_duration_ms(),
            rotating: self.is_rotating(),
            uptime_ms: now_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensors::ClimateReading;
    use pretty_assertions::assert_eq;

    fn scheduler() -> ActuationScheduler {
        ActuationScheduler::new(
            SchedulerConfig::default(),
            ReservoirConfig::default(),
            Setpoints::default(),
        )
    }

    fn readings(temperature_c: f32, humidity_pct: f32, ph: f32, light: i32) -> SensorReadings {
        SensorReadings {
            climate: Some(ClimateReading {
                temperature_c,
                humidity_pct,
            }),
            ph: Some(ph),
            // 20cm of water below a 35cm lid
            distance_cm: Some(15.0),
            light: Some(light),
        }
    }

    fn dosing_relay(actions: &[SchedulerAction]) -> Option<Relay> {
        actions.iter().find_map(|action| match action {
            SchedulerAction::RelayOn(relay @ (Relay::AcidPump | Relay::BasePump)) => Some(*relay),
            _ => None,
        })
    }

    #[test]
    fn initial_actions_energize_only_mix_pump() {
        assert_eq!(
            scheduler().initial_actions(),
            vec![
                SchedulerAction::RelayOff(Relay::VpdPump),
                SchedulerAction::RelayOff(Relay::AcidPump),
                SchedulerAction::RelayOff(Relay::BasePump),
                SchedulerAction::RelayOn(Relay::MixPump),
            ]
        );
    }

    #[test]
    fn first_mist_cycle_starts_after_initial_interval() {
        let mut scheduler = scheduler();
        scheduler.update_readings(&readings(25.0, 60.0, 6.0, 0));

        assert!(scheduler.tick(119).is_empty());

        let actions = scheduler.tick(120);
        assert!(actions.contains(&SchedulerAction::RelayOn(Relay::VpdPump)));
        assert!(scheduler.is_vpd_pumping());
        // 25C / 60% is ~1.27 kPa
        assert_eq!(scheduler.vpd_cycle_interval_ms(), 12_000);
    }

    #[test]
    fn mist_interval_follows_vpd_band() {
        let mut dry = scheduler();
        dry.update_readings(&readings(30.0, 20.0, 6.0, 0));
        dry.tick(120);
        assert_eq!(dry.vpd_cycle_interval_ms(), 6_000);

        let mut humid = scheduler();
        humid.update_readings(&readings(20.0, 90.0, 6.0, 0));
        humid.tick(120);
        assert_eq!(humid.vpd_cycle_interval_ms(), 18_000);
    }

    #[test]
    fn mist_pump_runs_for_fixed_duration() {
        let mut scheduler = scheduler();
        scheduler.update_readings(&readings(30.0, 20.0, 6.0, 0));
        scheduler.tick(1_000);

        assert!(!scheduler
            .tick(5_999)
            .contains(&SchedulerAction::RelayOff(Relay::VpdPump)));
        assert!(scheduler.is_vpd_pumping());

        let actions = scheduler.tick(6_000);
        assert!(actions.contains(&SchedulerAction::RelayOff(Relay::VpdPump)));
        assert!(!scheduler.is_vpd_pumping());

        // next cycle 6s after the previous one started
        assert!(scheduler
            .tick(7_000)
            .contains(&SchedulerAction::RelayOn(Relay::VpdPump)));
    }

    #[test]
    fn nan_climate_still_fires_pump_without_new_interval() {
        let mut scheduler = scheduler();
        scheduler.update_readings(&SensorReadings::default());

        let actions = scheduler.tick(500);

        assert!(actions.contains(&SchedulerAction::RelayOn(Relay::VpdPump)));
        assert_eq!(scheduler.vpd_cycle_interval_ms(), 120);
        assert!(scheduler.snapshot().vpd.is_nan());
    }

    #[test]
    fn high_ph_doses_acid() {
        let mut scheduler = scheduler();
        scheduler.update_readings(&readings(25.0, 60.0, 7.0, 0));
        scheduler.tick(3_600);

        let actions = scheduler.tick(30_000);

        assert_eq!(dosing_relay(&actions), Some(Relay::AcidPump));
        assert_eq!(scheduler.ph_phase(), PhPhase::Dosing);
    }

    #[test]
    fn low_ph_doses_base() {
        let mut scheduler = scheduler();
        scheduler.update_readings(&readings(25.0, 60.0, 5.0, 0));

        let actions = scheduler.tick(30_000);

        assert_eq!(dosing_relay(&actions), Some(Relay::BasePump));
    }

    #[test]
    fn ph_in_band_stays_idle_and_restarts_check_timer() {
        let mut scheduler = scheduler();
        scheduler.update_readings(&readings(25.0, 60.0, 6.0, 0));

        assert_eq!(dosing_relay(&scheduler.tick(30_000)), None);
        assert_eq!(scheduler.ph_phase(), PhPhase::Idle);

        scheduler.update_readings(&readings(25.0, 60.0, 8.0, 0));
        assert_eq!(dosing_relay(&scheduler.tick(59_999)), None);
        assert_eq!(
            dosing_relay(&scheduler.tick(60_000)),
            Some(Relay::AcidPump)
        );
    }

    #[test]
    fn target_decides_direction_outside_band() {
        let mut scheduler = scheduler();
        scheduler.apply_setpoint(SetpointUpdate::PhTarget(7.5));
        scheduler.update_readings(&readings(25.0, 60.0, 7.0, 0));

        assert_eq!(
            dosing_relay(&scheduler.tick(30_000)),
            Some(Relay::BasePump)
        );
    }

    #[test]
    fn no_fresh_check_while_adjusting() {
        let mut scheduler = scheduler();
        scheduler.config.reservoir_check_interval_ms = u64::MAX;
        scheduler.ph.dose_duration_ms = u64::MAX;
        scheduler.update_readings(&readings(25.0, 60.0, 7.0, 0));
        scheduler.tick(30_000);
        assert!(scheduler.is_ph_adjusting());

        scheduler.update_readings(&readings(25.0, 60.0, 4.0, 0));
        for now in (60_000..=600_000).step_by(30_000) {
            let actions = scheduler.tick(now);
            assert_eq!(dosing_relay(&actions), None, "fresh check at {now}");
            assert!(scheduler.is_ph_adjusting());
        }
    }

    #[test]
    fn dosing_cycle_settles_waits_and_rechecks() {
        let mut scheduler = scheduler();
        scheduler.update_readings(&readings(25.0, 60.0, 7.0, 0));

        // reservoir sample at 3.6s: 20cm of water, ~25.1L, ~6283ms dose
        scheduler.tick(3_600);
        assert_eq!(scheduler.ph_dose_duration_ms(), 6_283);

        scheduler.tick(30_000);
        assert_eq!(scheduler.ph_phase(), PhPhase::Dosing);

        let actions = scheduler.tick(36_283);
        assert!(actions.contains(&SchedulerAction::RelayOff(Relay::AcidPump)));
        assert!(actions.contains(&SchedulerAction::RelayOff(Relay::BasePump)));
        assert!(actions.contains(&SchedulerAction::RelayOff(Relay::MixPump)));
        assert_eq!(scheduler.ph_phase(), PhPhase::Settling);
        assert!(scheduler.is_ph_adjusting());

        assert!(!scheduler
            .tick(37_282)
            .contains(&SchedulerAction::RelayOn(Relay::MixPump)));

        let actions = scheduler.tick(37_283);
        assert!(actions.contains(&SchedulerAction::RelayOn(Relay::MixPump)));
        assert!(scheduler.is_ph_waiting());

        scheduler.update_readings(&readings(25.0, 60.0, 5.0, 0));
        assert_eq!(dosing_relay(&scheduler.tick(47_999)), None);
        assert_eq!(
            dosing_relay(&scheduler.tick(48_000)),
            Some(Relay::BasePump)
        );
    }

    #[test]
    fn zero_dose_completes_in_the_same_tick() {
        let mut scheduler = scheduler();
        scheduler.update_readings(&readings(25.0, 60.0, 9.0, 0));

        let actions = scheduler.tick(30_000);

        assert_eq!(
            actions
                .iter()
                .filter(|action| matches!(action, SchedulerAction::RelayOn(Relay::AcidPump)))
                .count(),
            1
        );
        assert!(actions.contains(&SchedulerAction::RelayOff(Relay::AcidPump)));
        assert_eq!(scheduler.ph_phase(), PhPhase::Settling);
    }

    #[test]
    fn reservoir_sample_clamps_negative_volume() {
        let mut scheduler = scheduler();
        scheduler.update_readings(&SensorReadings {
            distance_cm: Some(50.0),
            ..readings(25.0, 60.0, 6.0, 0)
        });

        scheduler.tick(3_600);

        assert!(scheduler.snapshot().reservoir_volume < 0.0);
        assert_eq!(scheduler.ph_dose_duration_ms(), 0);
    }

    #[test]
    fn bright_light_rotates_a_quarter_turn() {
        let mut scheduler = scheduler();
        scheduler.update_readings(&readings(25.0, 60.0, 6.0, 501));

        assert!(!scheduler
            .tick(4_999)
            .iter()
            .any(|action| matches!(action, SchedulerAction::Rotate { .. })));

        let actions = scheduler.tick(5_000);
        assert!(actions.contains(&SchedulerAction::Rotate { steps: 50 }));
        assert!(scheduler.is_rotating());

        // still moving at the next check: skipped
        scheduler.update_stepper(20);
        let actions = scheduler.tick(10_000);
        assert!(!actions
            .iter()
            .any(|action| matches!(action, SchedulerAction::Rotate { .. })));
        assert!(scheduler.is_rotating());

        scheduler.update_stepper(0);
        assert!(!scheduler.is_rotating());
        assert!(scheduler
            .tick(15_000)
            .contains(&SchedulerAction::Rotate { steps: 50 }));
    }

    #[test]
    fn dim_light_does_not_rotate_but_resets_timer() {
        let mut scheduler = scheduler();
        scheduler.update_readings(&readings(25.0, 60.0, 6.0, 500));

        assert!(!scheduler
            .tick(5_000)
            .iter()
            .any(|action| matches!(action, SchedulerAction::Rotate { .. })));

        scheduler.update_readings(&readings(25.0, 60.0, 6.0, 3_000));
        assert!(!scheduler
            .tick(9_999)
            .iter()
            .any(|action| matches!(action, SchedulerAction::Rotate { .. })));
        assert!(scheduler
            .tick(10_000)
            .contains(&SchedulerAction::Rotate { steps: 50 }));
    }

    #[test]
    fn failed_reads_keep_previous_values_except_climate() {
        let mut scheduler = scheduler();
        scheduler.update_readings(&readings(25.0, 60.0, 6.3, 1_000));
        let before = scheduler.snapshot();

        scheduler.update_readings(&SensorReadings::default());
        let after = scheduler.snapshot();

        assert!(after.temperature.is_nan());
        assert!(after.humidity.is_nan());
        assert_eq!(after.ph, before.ph);
        assert_eq!(after.water_level, before.water_level);
        assert_eq!(after.reservoir_volume, before.reservoir_volume);
        assert_eq!(after.light_intensity, 1_000);
    }

    #[test]
    fn setpoint_updates_touch_only_their_field() {
        let mut scheduler = scheduler();

        let message = scheduler.apply_setpoint(SetpointUpdate::PhTarget(6.2));
        assert_eq!(message, "pH target set to: 6.20");
        assert_eq!(scheduler.setpoints().light_threshold, 500);
        assert_eq!(scheduler.setpoints().ph_target, 6.2);

        let message = scheduler.apply_setpoint(SetpointUpdate::LightThreshold(-40));
        assert_eq!(message, "Light threshold set to: -40");
        assert_eq!(scheduler.setpoints().ph_target, 6.2);
    }
}
