//! Per-connection protocol state.
//!
//! A `Session` turns raw frames into registry calls and decides what to send
//! back. It knows nothing about sockets or timers; the dispatcher owns those.

use crate::codec::{self, DecodeError, Envelope, ErrorCode, Payload};
use crate::config::SessionConfig;
use crate::errors::Error;
use crate::metrics::{MESSAGES_TOTAL, REJECTED_MESSAGES_TOTAL};
use crate::model::RoverId;
use crate::registry::{Applied, SharedRegistry};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingConnect,
    Bound(RoverId),
    Closed,
}

pub struct Session {
    id: Uuid,
    peer: Option<String>,
    state: SessionState,
    registry: SharedRegistry,
    config: SessionConfig,
    decode_failures: u32,
    last_stamp: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(registry: SharedRegistry, config: SessionConfig, peer: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            state: SessionState::AwaitingConnect,
            registry,
            config,
            decode_failures: 0,
            last_stamp: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn rover_id(&self) -> Option<RoverId> {
        match self.state {
            SessionState::Bound(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.rover_id().is_some()
    }

    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            info!("Session {} closed (rover={:?})", self.id, self.rover_id());
            self.state = SessionState::Closed;
        }
    }

    /// Handles one inbound frame and returns the envelope to send back, if any
    pub async fn handle_frame(&mut self, raw: &[u8]) -> Option<Envelope> {
        if self.state == SessionState::Closed {
            return None;
        }
        MESSAGES_TOTAL.inc();

        match codec::decode(raw) {
            Ok(envelope) => self.handle_envelope(envelope).await,
            Err(e) => Some(self.decode_failed(e).await),
        }
    }

    async fn decode_failed(&mut self, err: DecodeError) -> Envelope {
        warn!("Session {} sent undecodable frame: {}", self.id, err);
        let rover_id = self.rover_id();

        if let Some(id) = rover_id {
            self.decode_failures += 1;
            if self.decode_failures >= self.config.max_decode_failures {
                warn!(
                    "Rover {} sent {} consecutive bad frames, escalating to ERROR",
                    id, self.decode_failures
                );
                self.decode_failures = 0;
                if let Err(e) = self.registry.escalate_error(id).await {
                    warn!("Failed to escalate rover {}: {}", id, e);
                }
            }
        }

        self.reject(rover_id, err.code(), err.to_string())
    }

    async fn handle_envelope(&mut self, envelope: Envelope) -> Option<Envelope> {
        self.decode_failures = 0;
        let message_type = envelope.message_type();

        let (id, payload) = match (self.state, envelope.payload) {
            (SessionState::AwaitingConnect, Payload::Connect(connect)) => {
                let customer_id = connect.customer_id.unwrap_or(self.config.default_customer_id);
                return Some(self.bind(&connect.identifier, customer_id).await);
            }
            (SessionState::AwaitingConnect, _) => {
                return Some(self.reject(
                    None,
                    ErrorCode::UnboundMessage,
                    format!("{} received before CONNECT", message_type.as_str()),
                ));
            }
            (SessionState::Bound(id), Payload::Connect(_)) => {
                return Some(self.reject(
                    Some(id),
                    ErrorCode::AlreadyBound,
                    format!("Connection already bound to rover {}", id),
                ));
            }
            (SessionState::Bound(_), Payload::Ack(_)) => {
                debug!("Session {} got ACK from rover", self.id);
                return None;
            }
            (SessionState::Bound(id), payload) => {
                if let Some(claimed) = envelope.rover_id.filter(|claimed| *claimed != id) {
                    return Some(self.reject(
                        Some(id),
                        ErrorCode::RoverIdMismatch,
                        format!("roverId {} does not match bound rover {}", claimed, id),
                    ));
                }
                (id, payload)
            }
            (SessionState::Closed, _) => return None,
        };

        let observed_at = self.stamp();
        let result = match payload {
            Payload::Telemetry(t) => self.registry.record_telemetry(id, t.sensor_data, observed_at).await,
            Payload::StatusUpdate(s) => {
                match self.registry.record_status(id, &s.status, observed_at).await {
                    Ok(Applied::Rejected) => {
                        return Some(self.reject(
                            Some(id),
                            ErrorCode::IllegalStatus,
                            format!("Status '{}' is not a legal device status", s.status),
                        ));
                    }
                    other => other,
                }
            }
            Payload::Error(e) => {
                warn!("Rover {} reported fault {}: {}", id, e.code, e.message);
                self.registry.record_device_error(id, observed_at).await
            }
            Payload::Connect(_) | Payload::Ack(_) => return None,
        };

        match result {
            Ok(applied) => Some(Envelope::ack(
                Some(id),
                json!({ "applied": applied.is_applied() }),
            )),
            Err(e) => Some(self.internal_error(Some(id), e)),
        }
    }

    async fn bind(&mut self, identifier: &str, customer_id: i64) -> Envelope {
        let id = match self.registry.resolve_or_create(identifier, customer_id).await {
            Ok(id) => id,
            Err(e) => return self.internal_error(None, e),
        };

        if let Some(peer) = &self.peer {
            if let Err(e) = self.registry.record_address(id, peer.clone()).await {
                warn!("Failed to record address for rover {}: {}", id, e);
            }
        }

        self.state = SessionState::Bound(id);
        info!(
            "Session {} bound to rover {} (identifier={}, customer={})",
            self.id, id, identifier, customer_id
        );

        let status = self
            .registry
            .get(id)
            .await
            .map(|r| r.status.as_str())
            .unwrap_or("REGISTERED");
        Envelope::ack(Some(id), json!({ "roverId": id, "status": status }))
    }

    /// Receipt timestamp, strictly increasing within this session
    fn stamp(&mut self) -> DateTime<Utc> {
        let mut now = self.registry.clock().now();
        if let Some(last) = self.last_stamp {
            if now <= last {
                // Postgres keeps microseconds
                now = last + Duration::microseconds(1);
            }
        }
        self.last_stamp = Some(now);
        now
    }

    fn reject(&self, rover_id: Option<RoverId>, code: ErrorCode, message: String) -> Envelope {
        REJECTED_MESSAGES_TOTAL.inc();
        debug!("Session {} rejecting frame: {} {}", self.id, code.as_str(), message);
        Envelope::error(rover_id, code, message)
    }

    fn internal_error(&self, rover_id: Option<RoverId>, err: Error) -> Envelope {
        tracing::error!("Session {} failed to apply message: {}", self.id, err);
        self.reject(rover_id, ErrorCode::Internal, err.to_string())
    }
}
