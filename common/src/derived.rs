//! Quantities derived from raw probe readings.

use core::f32::consts::PI;

use crate::config::{ReservoirConfig, SchedulerConfig};

/// Saturation vapor pressure in kPa (Tetens form).
pub fn saturation_vapor_pressure(temperature_c: f32) -> f32 {
    0.6108 * (17.27 * temperature_c / (temperature_c + 237.3)).exp()
}

/// Vapor-pressure deficit in kPa. Propagates NaN inputs.
pub fn vapor_pressure_deficit(temperature_c: f32, humidity_pct: f32) -> f32 {
    let svp = saturation_vapor_pressure(temperature_c);
    let avp = (humidity_pct / 100.0) * svp;
    svp - avp
}

/// Three-band mist cycle interval. Band edges fall into the normal band.
pub fn vpd_cycle_interval_ms(vpd_kpa: f32, config: &SchedulerConfig) -> u64 {
    if vpd_kpa > config.vpd_high_kpa {
        config.vpd_fast_interval_ms
    } else if vpd_kpa < config.vpd_low_kpa {
        config.vpd_slow_interval_ms
    } else {
        config.vpd_normal_interval_ms
    }
}

/// One-way distance for a round-trip echo time.
pub fn echo_to_distance_cm(echo_us: u32, reservoir: &ReservoirConfig) -> f32 {
    echo_us as f32 * reservoir.speed_of_sound_cm_per_us / 2.0
}

pub fn water_level_cm(distance_cm: f32, reservoir: &ReservoirConfig) -> f32 {
    reservoir.height_cm - distance_cm
}

pub fn reservoir_volume_liters(water_level_cm: f32, reservoir: &ReservoirConfig) -> f32 {
    PI * reservoir.radius_cm * reservoir.radius_cm * water_level_cm / 1000.0
}

/// Dosing time keyed only to reservoir volume. Non-positive or NaN volumes
/// dose for zero milliseconds.
pub fn dosing_duration_ms(volume_liters: f32, dosage_rate: f32) -> u64 {
    let duration = volume_liters * dosage_rate * 1_000_000.0;
    if duration.is_finite() && duration > 0.0 {
        duration as u64
    } else {
        0
    }
}

/// Maps a 12-bit ADC sample onto the 0-14 pH scale.
///
/// Intentionally a float mapping rather than Arduino-style integer `map()`,
/// which would quantize readings to whole pH units and make the 5.5-6.5
/// dosing band unreachable.
pub fn ph_from_adc(raw: u16) -> f32 {
    f32::from(raw.min(4095)) * 14.0 / 4095.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpd_decreases_with_humidity_and_stays_non_negative() {
        for temp in [5.0_f32, 15.0, 22.5, 30.0, 40.0] {
            let mut previous = f32::INFINITY;
            for humidity in (0..=100).step_by(5) {
                let vpd = vapor_pressure_deficit(temp, humidity as f32);
                assert!(vpd >= 0.0, "negative vpd {vpd} at {temp}C/{humidity}%");
                assert!(vpd < previous, "not decreasing at {temp}C/{humidity}%");
                previous = vpd;
            }
        }
    }

    #[test]
    fn vpd_at_reference_point() {
        // 25C / 50% is a common reference: SVP ~3.17 kPa.
        let vpd = vapor_pressure_deficit(25.0, 50.0);
        assert!((vpd - 1.584).abs() < 0.01, "vpd was {vpd}");
    }

    #[test]
    fn vpd_propagates_nan() {
        assert!(vapor_pressure_deficit(f32::NAN, 50.0).is_nan());
        assert!(vapor_pressure_deficit(20.0, f32::NAN).is_nan());
    }

    #[test]
    fn cycle_interval_bands() {
        let config = SchedulerConfig::default();
        assert_eq!(vpd_cycle_interval_ms(2.0, &config), 6_000);
        assert_eq!(vpd_cycle_interval_ms(0.5, &config), 18_000);
        assert_eq!(vpd_cycle_interval_ms(1.0, &config), 12_000);
        assert_eq!(vpd_cycle_interval_ms(1.5, &config), 12_000);
        assert_eq!(vpd_cycle_interval_ms(0.8, &config), 12_000);
        assert_eq!(vpd_cycle_interval_ms(1.5001, &config), 6_000);
        assert_eq!(vpd_cycle_interval_ms(0.7999, &config), 18_000);
    }

    #[test]
    fn volume_is_linear_in_level_and_zero_at_empty() {
        let reservoir = ReservoirConfig::default();
        assert_eq!(reservoir_volume_liters(0.0, &reservoir), 0.0);

        let one = reservoir_volume_liters(1.0, &reservoir);
        for level in [2.0_f32, 7.5, 20.0, 35.0] {
            let volume = reservoir_volume_liters(level, &reservoir);
            assert!((volume - one * level).abs() < 1e-3);
        }

        // full 35cm tank of radius 20cm holds ~44 liters
        assert!((reservoir_volume_liters(35.0, &reservoir) - 43.98).abs() < 0.01);
    }

    #[test]
    fn echo_time_converts_to_level() {
        let reservoir = ReservoirConfig::default();
        let distance = echo_to_distance_cm(1_000, &reservoir);
        assert!((distance - 17.0).abs() < 1e-4);
        assert!((water_level_cm(distance, &reservoir) - 18.0).abs() < 1e-4);
    }

    #[test]
    fn dosing_duration_follows_volume() {
        assert_eq!(dosing_duration_ms(40.0, 0.000_25), 10_000);
        assert_eq!(dosing_duration_ms(0.0, 0.000_25), 0);
        assert_eq!(dosing_duration_ms(-3.0, 0.000_25), 0);
        assert_eq!(dosing_duration_ms(f32::NAN, 0.000_25), 0);
    }

    #[test]
    fn ph_adc_scale() {
        assert_eq!(ph_from_adc(0), 0.0);
        assert_eq!(ph_from_adc(4095), 14.0);
        assert_eq!(ph_from_adc(u16::MAX), 14.0);
        assert!((ph_from_adc(2048) - 7.0).abs() < 0.01);
    }

    #[test]
    fn ph_adc_keeps_fractional_resolution() {
        // 1755 and 1843 sit either side of 6.0 inside the 5.5-6.5 band
        let below = ph_from_adc(1_755);
        let above = ph_from_adc(1_843);
        assert!((below - 6.0).abs() < 0.01, "below was {below}");
        assert!(above > 6.2 && above < 6.4, "above was {above}");
        assert_ne!(ph_from_adc(1_843).fract(), 0.0);
    }
}
