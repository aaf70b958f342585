use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type RoverId = i64;
pub type CustomerId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoverStatus {
    Registered,
    Active,
    Offline,
    Error,
}

impl RoverStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoverStatus::Registered => "REGISTERED",
            RoverStatus::Active => "ACTIVE",
            RoverStatus::Offline => "OFFLINE",
            RoverStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "REGISTERED" => Some(RoverStatus::Registered),
            "ACTIVE" => Some(RoverStatus::Active),
            "OFFLINE" => Some(RoverStatus::Offline),
            "ERROR" => Some(RoverStatus::Error),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, RoverStatus::Registered | RoverStatus::Active)
    }

    /// Status after `trigger`, or `None` if the transition is not allowed
    pub fn on(self, trigger: Trigger) -> Option<RoverStatus> {
        match (self, trigger) {
            (_, Trigger::Accepted) => Some(RoverStatus::Active),
            (_, Trigger::DeviceFault) | (_, Trigger::RepeatedDecodeFailure) => {
                Some(RoverStatus::Error)
            }
            (RoverStatus::Registered | RoverStatus::Active, Trigger::LivenessLapsed) => {
                Some(RoverStatus::Offline)
            }
            (RoverStatus::Offline | RoverStatus::Error, Trigger::LivenessLapsed) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Accepted,
    DeviceFault,
    RepeatedDecodeFailure,
    LivenessLapsed,
}

impl fmt::Display for RoverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

/// Sensor snapshot reported by a rover; unknown keys land in `extra`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance_traveled: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trips: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_position: Option<Position>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rover {
    pub id: RoverId,
    pub name: String,
    pub identifier: String,
    pub customer_id: CustomerId,
    pub status: RoverStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub ip_address: Option<String>,
    pub telemetry: Option<SensorData>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rover {
    pub fn new(
        id: RoverId,
        customer_id: CustomerId,
        identifier: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let identifier = identifier.into();
        Self {
            id,
            name: identifier.clone(),
            identifier,
            customer_id,
            status: RoverStatus::Registered,
            last_seen: None,
            ip_address: None,
            telemetry: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Time the liveness sweep measures idleness from
    pub fn liveness_reference(&self) -> DateTime<Utc> {
        self.last_seen.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "rover", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoverEvent {
    Registered(Rover),
    StatusChanged(Rover),
    Telemetry(Rover),
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensor_data_keeps_unknown_fields() {
        let raw = r#"{"temperature":21.5,"batteryLevel":90.0,"wheelSlip":0.1}"#;
        let data: SensorData = serde_json::from_str(raw).unwrap();

        assert_eq!(data.temperature, Some(21.5));
        assert_eq!(data.battery_level, Some(90.0));
        assert_eq!(data.extra.get("wheelSlip"), Some(&serde_json::json!(0.1)));

        let back = serde_json::to_value(&data).unwrap();
        assert_eq!(back["wheelSlip"], serde_json::json!(0.1));
        assert!(back.get("speed").is_none());
    }

    #[test]
    fn test_rover_serializes_null_last_seen() {
        let rover = Rover::new(1, 7, "R_TEST", Utc::now());
        let json = serde_json::to_value(&rover).unwrap();

        assert_eq!(json["status"], "REGISTERED");
        assert!(json["last_seen"].is_null());
        assert_eq!(json["customer_id"], 7);
        assert_eq!(json["name"], "R_TEST");
    }

    #[test]
    fn test_status_parse_round_trip() {
        for status in [
            RoverStatus::Registered,
            RoverStatus::Active,
            RoverStatus::Offline,
            RoverStatus::Error,
        ] {
            assert_eq!(RoverStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RoverStatus::parse("active"), None);
    }

    #[test]
    fn test_status_transitions() {
        use RoverStatus::*;

        assert_eq!(Registered.on(Trigger::Accepted), Some(Active));
        assert_eq!(Active.on(Trigger::Accepted), Some(Active));
        assert_eq!(Offline.on(Trigger::Accepted), Some(Active));
        assert_eq!(Error.on(Trigger::Accepted), Some(Active));

        assert_eq!(Registered.on(Trigger::LivenessLapsed), Some(Offline));
        assert_eq!(Active.on(Trigger::LivenessLapsed), Some(Offline));
        assert_eq!(Offline.on(Trigger::LivenessLapsed), None);
        assert_eq!(Error.on(Trigger::LivenessLapsed), None);

        for status in [Registered, Active, Offline, Error] {
            assert_eq!(status.on(Trigger::DeviceFault), Some(Error));
            assert_eq!(status.on(Trigger::RepeatedDecodeFailure), Some(Error));
        }
    }
}
