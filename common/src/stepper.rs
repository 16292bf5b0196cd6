//! Acceleration-limited step pulse generator for a STEP/DIR driver.
//!
//! The generator is polled with a microsecond timestamp and answers whether a
//! step pulse is due. Speed ramps up from rest at the configured acceleration,
//! is capped at the configured maximum, and ramps down so the move ends at
//! rest on the target position.

use crate::config::StepperConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDirection {
    Forward,
    Reverse,
}

#[derive(Debug, Clone)]
pub struct StepGenerator {
    max_speed: f32,
    acceleration: f32,
    position: i64,
    target: i64,
    steps_in_move: u64,
    last_step_us: Option<u64>,
}

impl StepGenerator {
    pub fn new(config: &StepperConfig) -> Self {
        Self {
            max_speed: config.max_speed,
            acceleration: config.acceleration,
            position: 0,
            target: 0,
            steps_in_move: 0,
            last_step_us: None,
        }
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn target(&self) -> i64 {
        self.target
    }

    pub fn distance_to_go(&self) -> i64 {
        self.target - self.position
    }

    pub fn is_idle(&self) -> bool {
        self.distance_to_go() == 0
    }

    /// Retargets relative to the current position.
    pub fn move_by(&mut self, steps: i64) {
        self.move_to(self.position.saturating_add(steps));
    }

    pub fn move_to(&mut self, target: i64) {
        if self.is_idle() {
            self.steps_in_move = 0;
            self.last_step_us = None;
        }
        self.target = target;
    }

    /// Returns the direction of a step pulse to emit now, if one is due.
    pub fn poll(&mut self, now_us: u64) -> Option<StepDirection> {
        let distance = self.distance_to_go();
        if distance == 0 {
            self.steps_in_move = 0;
            self.last_step_us = None;
            return None;
        }

        if let Some(last) = self.last_step_us {
            if now_us.saturating_sub(last) < self.next_interval_us() {
                return None;
            }
        }

        let direction = if distance > 0 {
            self.position += 1;
            StepDirection::Forward
        } else {
            self.position -= 1;
            StepDirection::Reverse
        };
        self.steps_in_move = self.steps_in_move.saturating_add(1);
        self.last_step_us = Some(now_us);

        Some(direction)
    }

    /// Wait between the previous pulse and the next one.
    pub fn next_interval_us(&self) -> u64 {
        let ramp_up = (2.0 * self.acceleration * (self.steps_in_move as f32 + 1.0)).sqrt();
        let ramp_down = (2.0 * self.acceleration * self.distance_to_go().unsigned_abs() as f32).sqrt();
        let speed = self.max_speed.min(ramp_up).min(ramp_down).max(1.0);
        (1_000_000.0 / speed) as u64
    }
}
