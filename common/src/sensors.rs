//! Probe abstraction and one-pass sampling of every sensor.

use log::warn;

use crate::{
    config::ReservoirConfig,
    derived,
    error::SensorError,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateReading {
    pub temperature_c: f32,
    pub humidity_pct: f32,
}

/// Raw access to the four probes. Implementations do no caching.
pub trait Probes {
    fn read_climate(&mut self) -> Result<ClimateReading, SensorError>;
    /// 12-bit ADC sample from the pH amplifier.
    fn read_ph_raw(&mut self) -> Result<u16, SensorError>;
    /// Round-trip echo time of one ultrasonic ping.
    fn measure_echo_us(&mut self) -> Result<u32, SensorError>;
    /// 12-bit ADC sample from the light-dependent resistor divider.
    fn read_light_raw(&mut self) -> Result<u16, SensorError>;
}

/// One pass over every probe. `None` marks a failed read.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorReadings {
    pub climate: Option<ClimateReading>,
    pub ph: Option<f32>,
    pub distance_cm: Option<f32>,
    pub light: Option<i32>,
}

pub struct SensorReader {
    reservoir: ReservoirConfig,
}

impl SensorReader {
    pub fn new(reservoir: ReservoirConfig) -> Self {
        Self { reservoir }
    }

    pub fn sample<P: Probes>(&self, probes: &mut P) -> SensorReadings {
        let climate = match probes.read_climate() {
            Ok(reading)
                if reading.temperature_c.is_nan() || reading.humidity_pct.is_nan() =>
            {
                warn!("failed to read climate probe: {}", SensorError::NotANumber);
                None
            }
            Ok(reading) => Some(reading),
            Err(err) => {
                warn!("failed to read climate probe: {err}");
                None
            }
        };

        let ph = probes
            .read_ph_raw()
            .map(derived::ph_from_adc)
            .map_err(|err| warn!("failed to read pH probe: {err}"))
            .ok();

        let distance_cm = probes
            .measure_echo_us()
            .map(|echo_us| derived::echo_to_distance_cm(echo_us, &self.reservoir))
            .map_err(|err| warn!("failed to measure water level: {err}"))
            .ok();

        let light = probes
            .read_light_raw()
            .map(i32::from)
            .map_err(|err| warn!("failed to read light probe: {err}"))
            .ok();

        SensorReadings {
            climate,
            ph,
            distance_cm,
            light,
        }
    }
}

pub mod sht31 {
    //! Frame handling for the Sensirion SHT31 single-shot measurement.

    use super::ClimateReading;
    use crate::error::SensorError;

    pub const DEFAULT_ADDRESS: u8 = 0x44;
    /// High repeatability, clock stretching disabled.
    pub const CMD_MEASURE_HIGH: [u8; 2] = [0x24, 0x00];
    pub const CMD_SOFT_RESET: [u8; 2] = [0x30, 0xA2];
    pub const CMD_READ_STATUS: [u8; 2] = [0xF3, 0x2D];
    pub const MEASUREMENT_DELAY_MS: u32 = 20;

    pub fn crc8(data: &[u8]) -> u8 {
        let mut crc = 0xFF_u8;
        for byte in data {
            crc ^= byte;
            for _ in 0..8 {
                crc = if crc & 0x80 != 0 {
                    (crc << 1) ^ 0x31
                } else {
                    crc << 1
                };
            }
        }
        crc
    }

    fn checked_word(chunk: &[u8]) -> Result<u16, SensorError> {
        let expected = crc8(&chunk[..2]);
        if expected != chunk[2] {
            return Err(SensorError::Crc {
                expected,
                actual: chunk[2],
            });
        }
        Ok(u16::from_be_bytes([chunk[0], chunk[1]]))
    }

    pub fn decode_status(frame: &[u8; 3]) -> Result<u16, SensorError> {
        checked_word(frame)
    }

    pub fn decode_measurement(frame: &[u8; 6]) -> Result<ClimateReading, SensorError> {
        let raw_temp = checked_word(&frame[..3])?;
        let raw_humidity = checked_word(&frame[3..])?;

        Ok(ClimateReading {
            temperature_c: -45.0 + 175.0 * f32::from(raw_temp) / 65_535.0,
            humidity_pct: 100.0 * f32::from(raw_humidity) / 65_535.0,
        })
    }
}
