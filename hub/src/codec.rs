//! Wire codec for the rover protocol.
//!
//! Every frame is one JSON envelope: `{"type": ..., "roverId": ..., "payload": {...}}`.
//! Decoding is two-staged: the envelope shell first (syntax and type tag), then the
//! payload for that type, then sensor validation for telemetry.

use crate::model::{CustomerId, RoverId, SensorData};
use crate::validate::{validate_identifier, validate_sensor_data};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Connect,
    Telemetry,
    StatusUpdate,
    Error,
    Ack,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Connect => "CONNECT",
            MessageType::Telemetry => "TELEMETRY",
            MessageType::StatusUpdate => "STATUS_UPDATE",
            MessageType::Error => "ERROR",
            MessageType::Ack => "ACK",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CONNECT" => Some(MessageType::Connect),
            "TELEMETRY" => Some(MessageType::Telemetry),
            "STATUS_UPDATE" => Some(MessageType::StatusUpdate),
            "ERROR" => Some(MessageType::Error),
            "ACK" => Some(MessageType::Ack),
            _ => None,
        }
    }
}

/// Machine-readable code carried in outbound ERROR envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MalformedMessage,
    UnknownMessageType,
    InvalidPayload,
    UnboundMessage,
    AlreadyBound,
    RoverIdMismatch,
    IllegalStatus,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::MalformedMessage => "MALFORMED_MESSAGE",
            ErrorCode::UnknownMessageType => "UNKNOWN_MESSAGE_TYPE",
            ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            ErrorCode::UnboundMessage => "UNBOUND_MESSAGE",
            ErrorCode::AlreadyBound => "ALREADY_BOUND",
            ErrorCode::RoverIdMismatch => "ROVER_ID_MISMATCH",
            ErrorCode::IllegalStatus => "ILLEGAL_STATUS",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl DecodeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DecodeError::Malformed(_) => ErrorCode::MalformedMessage,
            DecodeError::UnknownMessageType(_) => ErrorCode::UnknownMessageType,
            DecodeError::InvalidPayload(_) => ErrorCode::InvalidPayload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectPayload {
    #[serde(rename = "type")]
    pub client_type: String,
    pub identifier: String,
    #[serde(default, rename = "customerId", skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<CustomerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    #[serde(rename = "sensorData")]
    pub sensor_data: SensorData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Connect(ConnectPayload),
    Telemetry(TelemetryPayload),
    StatusUpdate(StatusPayload),
    Error(ErrorPayload),
    Ack(Value),
}

/// One protocol message
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub rover_id: Option<RoverId>,
    pub payload: Payload,
}

impl Envelope {
    pub fn message_type(&self) -> MessageType {
        match self.payload {
            Payload::Connect(_) => MessageType::Connect,
            Payload::Telemetry(_) => MessageType::Telemetry,
            Payload::StatusUpdate(_) => MessageType::StatusUpdate,
            Payload::Error(_) => MessageType::Error,
            Payload::Ack(_) => MessageType::Ack,
        }
    }

    pub fn connect(identifier: impl Into<String>, customer_id: Option<CustomerId>) -> Self {
        Self {
            rover_id: None,
            payload: Payload::Connect(ConnectPayload {
                client_type: "rover".to_string(),
                identifier: identifier.into(),
                customer_id,
            }),
        }
    }

    pub fn telemetry(rover_id: RoverId, sensor_data: SensorData) -> Self {
        Self {
            rover_id: Some(rover_id),
            payload: Payload::Telemetry(TelemetryPayload { sensor_data }),
        }
    }

    pub fn status_update(rover_id: RoverId, status: impl Into<String>) -> Self {
        Self {
            rover_id: Some(rover_id),
            payload: Payload::StatusUpdate(StatusPayload {
                status: status.into(),
            }),
        }
    }

    pub fn ack(rover_id: Option<RoverId>, payload: Value) -> Self {
        Self {
            rover_id,
            payload: Payload::Ack(payload),
        }
    }

    pub fn error(rover_id: Option<RoverId>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            rover_id,
            payload: Payload::Error(ErrorPayload {
                code: code.as_str().to_string(),
                message: message.into(),
            }),
        }
    }

    fn payload_value(&self) -> Value {
        let value = match &self.payload {
            Payload::Connect(p) => serde_json::to_value(p),
            Payload::Telemetry(p) => serde_json::to_value(p),
            Payload::StatusUpdate(p) => serde_json::to_value(p),
            Payload::Error(p) => serde_json::to_value(p),
            Payload::Ack(v) => Ok(v.clone()),
        };
        value.unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, rename = "roverId")]
    rover_id: Option<RoverId>,
    #[serde(default)]
    payload: Value,
}

fn payload_from<T: for<'de> Deserialize<'de>>(kind: MessageType, value: Value) -> Result<T, DecodeError> {
    serde_json::from_value(value)
        .map_err(|e| DecodeError::Malformed(format!("{} payload: {}", kind.as_str(), e)))
}

/// Decodes one raw frame into an envelope
pub fn decode(raw: &[u8]) -> Result<Envelope, DecodeError> {
    let raw: RawEnvelope = serde_json::from_slice(raw)
        .map_err(|e| DecodeError::Malformed(format!("JSON parse error: {}", e)))?;

    let kind = MessageType::parse(&raw.kind)
        .ok_or_else(|| DecodeError::UnknownMessageType(raw.kind.clone()))?;

    let payload = match kind {
        MessageType::Connect => {
            let p: ConnectPayload = payload_from(kind, raw.payload)?;
            if p.client_type != "rover" {
                return Err(DecodeError::InvalidPayload(format!(
                    "Unsupported client type '{}'",
                    p.client_type
                )));
            }
            validate_identifier(&p.identifier)
                .map_err(|e| DecodeError::InvalidPayload(e.to_string()))?;
            Payload::Connect(p)
        }
        MessageType::Telemetry => {
            let p: TelemetryPayload = payload_from(kind, raw.payload)?;
            validate_sensor_data(&p.sensor_data)
                .map_err(|e| DecodeError::InvalidPayload(e.to_string()))?;
            Payload::Telemetry(p)
        }
        MessageType::StatusUpdate => Payload::StatusUpdate(payload_from(kind, raw.payload)?),
        MessageType::Error => Payload::Error(payload_from(kind, raw.payload)?),
        MessageType::Ack => Payload::Ack(raw.payload),
    };

    Ok(Envelope {
        rover_id: raw.rover_id,
        payload,
    })
}

/// Encodes an envelope as a JSON text frame
pub fn encode_text(envelope: &Envelope) -> String {
    let mut obj = serde_json::Map::new();
    obj.insert("type".to_string(), json!(envelope.message_type().as_str()));
    if let Some(id) = envelope.rover_id {
        obj.insert("roverId".to_string(), json!(id));
    }
    obj.insert("payload".to_string(), envelope.payload_value());
    Value::Object(obj).to_string()
}

pub fn encode(envelope: &Envelope) -> Vec<u8> {
    encode_text(envelope).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_connect() {
        let raw = br#"{"type":"CONNECT","payload":{"type":"rover","identifier":"R_TEST"}}"#;
        let env = decode(raw).unwrap();

        assert_eq!(env.message_type(), MessageType::Connect);
        assert_eq!(env.rover_id, None);
        match env.payload {
            Payload::Connect(p) => {
                assert_eq!(p.identifier, "R_TEST");
                assert_eq!(p.customer_id, None);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_decode_telemetry() {
        let raw = br#"{"type":"TELEMETRY","roverId":1,"payload":{"sensorData":{
            "temperature":22.1,"speed":0.42,"latitude":34.05221,"longitude":-118.24371,
            "batteryLevel":90.5,"signalStrength":80.0,"cpuUsage":41.0,"memoryUsage":52.3,
            "distanceTraveled":12.0,"trips":3,"currentPosition":{"x":1.5,"y":2.5,"z":0.1}}}}"#;
        let env = decode(raw).unwrap();

        assert_eq!(env.rover_id, Some(1));
        match env.payload {
            Payload::Telemetry(p) => {
                assert_eq!(p.sensor_data.trips, Some(3));
                assert_eq!(p.sensor_data.current_position.unwrap().y, 2.5);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_decode_status_update() {
        let raw = br#"{"type":"STATUS_UPDATE","roverId":1,"payload":{"status":"active"}}"#;
        let env = decode(raw).unwrap();
        assert_eq!(
            env.payload,
            Payload::StatusUpdate(StatusPayload {
                status: "active".to_string()
            })
        );
    }

    #[test]
    fn test_unknown_type() {
        let raw = br#"{"type":"BOGUS","payload":{}}"#;
        assert_eq!(
            decode(raw),
            Err(DecodeError::UnknownMessageType("BOGUS".to_string()))
        );
    }

    #[test]
    fn test_invalid_json() {
        let err = decode(b"not json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedMessage);
    }

    #[test]
    fn test_missing_type_is_malformed() {
        let err = decode(br#"{"payload":{}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_telemetry_without_sensor_data_is_malformed() {
        let err = decode(br#"{"type":"TELEMETRY","roverId":1,"payload":{}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_out_of_range_telemetry_is_invalid() {
        let raw = br#"{"type":"TELEMETRY","roverId":1,"payload":{"sensorData":{"batteryLevel":140}}}"#;
        let err = decode(raw).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPayload);
    }

    #[test]
    fn test_connect_from_non_rover_is_invalid() {
        let raw = br#"{"type":"CONNECT","payload":{"type":"dashboard","identifier":"D1"}}"#;
        assert!(matches!(decode(raw), Err(DecodeError::InvalidPayload(_))));
    }

    #[test]
    fn test_encode_error_envelope() {
        let env = Envelope::error(None, ErrorCode::UnknownMessageType, "Unknown message type: BOGUS");
        let value: Value = serde_json::from_str(&encode_text(&env)).unwrap();

        assert_eq!(value["type"], "ERROR");
        assert!(value.get("roverId").is_none());
        assert_eq!(value["payload"]["code"], "UNKNOWN_MESSAGE_TYPE");
    }

    #[test]
    fn test_encoded_telemetry_decodes() {
        let data = SensorData {
            battery_level: Some(77.0),
            ..Default::default()
        };
        let env = Envelope::telemetry(4, data);
        assert_eq!(decode(&encode(&env)).unwrap(), env);
    }
}
