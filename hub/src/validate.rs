use crate::errors::{Error, Result};
use crate::model::SensorData;

const TEMP_MIN: f64 = -100.0;
const TEMP_MAX: f64 = 150.0;
const PERCENT_MIN: f64 = 0.0;
const PERCENT_MAX: f64 = 100.0;
const LATITUDE_MIN: f64 = -90.0;
const LATITUDE_MAX: f64 = 90.0;
const LONGITUDE_MIN: f64 = -180.0;
const LONGITUDE_MAX: f64 = 180.0;

pub const IDENTIFIER_MAX_LEN: usize = 128;

fn check_range(name: &str, value: Option<f64>, min: f64, max: f64) -> Result<()> {
    match value {
        Some(v) if !v.is_finite() => Err(Error::Validation(format!("{} is not a finite number", name))),
        Some(v) if v < min || v > max => Err(Error::Validation(format!(
            "{} {} out of range [{}, {}]",
            name, v, min, max
        ))),
        _ => Ok(()),
    }
}

fn check_non_negative(name: &str, value: Option<f64>) -> Result<()> {
    check_range(name, value, 0.0, f64::MAX)
}

/// Validates a sensor snapshot
pub fn validate_sensor_data(data: &SensorData) -> Result<()> {
    check_range("Temperature", data.temperature, TEMP_MIN, TEMP_MAX)?;
    check_range("Battery level", data.battery_level, PERCENT_MIN, PERCENT_MAX)?;
    check_range("Signal strength", data.signal_strength, PERCENT_MIN, PERCENT_MAX)?;
    check_range("CPU usage", data.cpu_usage, PERCENT_MIN, PERCENT_MAX)?;
    check_range("Memory usage", data.memory_usage, PERCENT_MIN, PERCENT_MAX)?;
    check_range("Latitude", data.latitude, LATITUDE_MIN, LATITUDE_MAX)?;
    check_range("Longitude", data.longitude, LONGITUDE_MIN, LONGITUDE_MAX)?;
    check_non_negative("Speed", data.speed)?;
    check_non_negative("Distance traveled", data.distance_traveled)?;

    if let Some(pos) = &data.current_position {
        if !(pos.x.is_finite() && pos.y.is_finite() && pos.z.is_finite()) {
            return Err(Error::Validation(
                "Current position has non-finite coordinates".to_string(),
            ));
        }
    }

    Ok(())
}

/// Validates the identifier a rover presents on CONNECT
pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.trim().is_empty() {
        return Err(Error::Validation("Identifier cannot be empty".to_string()));
    }

    if identifier.len() > IDENTIFIER_MAX_LEN {
        return Err(Error::Validation(format!(
            "Identifier longer than {} bytes",
            IDENTIFIER_MAX_LEN
        )));
    }

    if identifier.chars().any(|c| c.is_control()) {
        return Err(Error::Validation(
            "Identifier contains control characters".to_string(),
        ));
    }

    Ok(())
}
