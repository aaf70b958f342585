//! Authoritative in-memory rover directory.
//!
//! Each rover lives behind its own mutex so writes to different rovers never
//! contend, while writes to the same rover are applied one at a time. The maps
//! themselves are only write-locked when a rover is first created.

use crate::clock::Clock;
use crate::errors::{Error, Result};
use crate::metrics::{PERSIST_QUEUE_FULL_TOTAL, ROVERS_ERROR_TOTAL, ROVERS_OFFLINE_TOTAL, STALE_WRITES_TOTAL};
use crate::model::{CustomerId, Rover, RoverEvent, RoverId, RoverStatus, SensorData, Trigger};
use crate::store::RoverStore;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

pub const EVENT_CAPACITY: usize = 1024;

pub type SharedRegistry = Arc<RoverRegistry>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Applied,
    Duplicate,
    Stale,
    Rejected,
}

impl Applied {
    pub fn is_applied(&self) -> bool {
        matches!(self, Applied::Applied)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredStatus {
    Active,
    Error,
}

impl DeclaredStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" | "online" | "ok" | "idle" | "running" => Some(DeclaredStatus::Active),
            "error" | "fault" | "failed" => Some(DeclaredStatus::Error),
            _ => None,
        }
    }

    fn trigger(&self) -> Trigger {
        match self {
            DeclaredStatus::Active => Trigger::Accepted,
            DeclaredStatus::Error => Trigger::DeviceFault,
        }
    }
}

pub struct RoverRegistry {
    store: Arc<dyn RoverStore>,
    clock: Arc<dyn Clock>,
    rovers: RwLock<HashMap<RoverId, Arc<Mutex<Rover>>>>,
    index: RwLock<HashMap<(CustomerId, String), RoverId>>,
    creating: Mutex<()>,
    events: broadcast::Sender<RoverEvent>,
    persist_tx: Option<mpsc::Sender<Rover>>,
}

impl RoverRegistry {
    pub fn new(store: Arc<dyn RoverStore>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            clock,
            rovers: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            creating: Mutex::new(()),
            events,
            persist_tx: None,
        }
    }

    pub fn with_persistence(mut self, tx: mpsc::Sender<Rover>) -> Self {
        self.persist_tx = Some(tx);
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoverEvent> {
        self.events.subscribe()
    }

    pub async fn hydrate(&self) -> Result<usize> {
        let stored = self.store.load_all().await?;
        let count = stored.len();

        let mut rovers = self.rovers.write().await;
        let mut index = self.index.write().await;
        for rover in stored {
            index.insert((rover.customer_id, rover.identifier.clone()), rover.id);
            rovers.insert(rover.id, Arc::new(Mutex::new(rover)));
        }

        info!("Registry hydrated with {} rovers", count);
        Ok(count)
    }

    /// Returns the id bound to `(customer_id, identifier)`, creating a
    /// REGISTERED record on first sight.
    pub async fn resolve_or_create(&self, identifier: &str, customer_id: CustomerId) -> Result<RoverId> {
        let key = (customer_id, identifier.to_string());
        if let Some(id) = self.index.read().await.get(&key) {
            return Ok(*id);
        }

        let _guard = self.creating.lock().await;
        if let Some(id) = self.index.read().await.get(&key) {
            return Ok(*id);
        }

        let rover = self
            .store
            .create_or_get(customer_id, identifier, self.clock.now())
            .await?;
        let id = rover.id;

        info!(
            "Registered rover {} (identifier={}, customer={})",
            id, rover.identifier, rover.customer_id
        );
        self.rovers
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(rover.clone())));
        self.index.write().await.insert(key, id);
        let _ = self.events.send(RoverEvent::Registered(rover));

        Ok(id)
    }

    async fn entry(&self, id: RoverId) -> Result<Arc<Mutex<Rover>>> {
        self.rovers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownRover(id))
    }

    pub async fn get(&self, id: RoverId) -> Option<Rover> {
        let entry = self.entry(id).await.ok()?;
        let rover = entry.lock().await;
        Some(rover.clone())
    }

    pub async fn list_by_customer(&self, customer_id: Option<CustomerId>) -> Vec<Rover> {
        let mut entries: Vec<(RoverId, Arc<Mutex<Rover>>)> = self
            .rovers
            .read()
            .await
            .iter()
            .map(|(id, entry)| (*id, entry.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);

        let mut out = Vec::with_capacity(entries.len());
        for (_, entry) in entries {
            let rover = entry.lock().await;
            if customer_id.map_or(true, |c| rover.customer_id == c) {
                out.push(rover.clone());
            }
        }
        out
    }

    pub async fn record_address(&self, id: RoverId, ip_address: String) -> Result<()> {
        let entry = self.entry(id).await?;
        let mut rover = entry.lock().await;
        if rover.ip_address.as_deref() != Some(ip_address.as_str()) {
            rover.ip_address = Some(ip_address);
            self.touch(&mut rover);
            self.enqueue(&rover);
        }
        Ok(())
    }

    pub async fn record_telemetry(
        &self,
        id: RoverId,
        snapshot: SensorData,
        observed_at: DateTime<Utc>,
    ) -> Result<Applied> {
        let entry = self.entry(id).await?;
        let mut rover = entry.lock().await;

        if let Some(outcome) = check_fresh(&rover, observed_at) {
            return Ok(outcome);
        }

        rover.telemetry = Some(snapshot);
        rover.last_seen = Some(observed_at);
        let changed = self.transition(&mut rover, Trigger::Accepted);
        self.touch(&mut rover);

        debug!("Telemetry applied for rover {} at {}", id, observed_at);
        if changed {
            let _ = self.events.send(RoverEvent::StatusChanged(rover.clone()));
        }
        let _ = self.events.send(RoverEvent::Telemetry(rover.clone()));
        self.enqueue(&rover);

        Ok(Applied::Applied)
    }

    pub async fn record_status(
        &self,
        id: RoverId,
        declared: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<Applied> {
        let Some(declared) = DeclaredStatus::parse(declared) else {
            warn!("Rover {} declared unknown status '{}'", id, declared);
            return Ok(Applied::Rejected);
        };

        self.apply_message(id, declared.trigger(), observed_at).await
    }

    pub async fn record_device_error(&self, id: RoverId, observed_at: DateTime<Utc>) -> Result<Applied> {
        self.apply_message(id, Trigger::DeviceFault, observed_at).await
    }

    async fn apply_message(
        &self,
        id: RoverId,
        trigger: Trigger,
        observed_at: DateTime<Utc>,
    ) -> Result<Applied> {
        let entry = self.entry(id).await?;
        let mut rover = entry.lock().await;

        if let Some(outcome) = check_fresh(&rover, observed_at) {
            return Ok(outcome);
        }

        rover.last_seen = Some(observed_at);
        let changed = self.transition(&mut rover, trigger);
        self.touch(&mut rover);

        if changed {
            let _ = self.events.send(RoverEvent::StatusChanged(rover.clone()));
        }
        self.enqueue(&rover);

        Ok(Applied::Applied)
    }

    /// Moves a rover to ERROR after repeated decode failures on its connection.
    /// Does not count as activity, so `last_seen` is left alone.
    pub async fn escalate_error(&self, id: RoverId) -> Result<bool> {
        let entry = self.entry(id).await?;
        let mut rover = entry.lock().await;

        let changed = self.transition(&mut rover, Trigger::RepeatedDecodeFailure);
        if changed {
            self.touch(&mut rover);
            let _ = self.events.send(RoverEvent::StatusChanged(rover.clone()));
            self.enqueue(&rover);
        }
        Ok(changed)
    }

    /// Demotes a rover to OFFLINE if it is still live and has been idle for
    /// longer than `threshold` as of `at`. Only the liveness monitor calls this.
    pub async fn mark_offline(&self, id: RoverId, at: DateTime<Utc>, threshold: Duration) -> Result<bool> {
        let entry = self.entry(id).await?;
        let mut rover = entry.lock().await;

        // Re-checked under the lock: a message may have landed since the sweep looked
        if at - rover.liveness_reference() <= threshold {
            return Ok(false);
        }

        let changed = self.transition(&mut rover, Trigger::LivenessLapsed);
        if changed {
            self.touch(&mut rover);
            let _ = self.events.send(RoverEvent::StatusChanged(rover.clone()));
            self.enqueue(&rover);
        }
        Ok(changed)
    }

    fn transition(&self, rover: &mut Rover, trigger: Trigger) -> bool {
        let Some(next) = rover.status.on(trigger) else {
            return false;
        };
        if next == rover.status {
            return false;
        }

        info!("Rover {} status {} -> {}", rover.id, rover.status, next);
        match next {
            RoverStatus::Offline => ROVERS_OFFLINE_TOTAL.inc(),
            RoverStatus::Error => ROVERS_ERROR_TOTAL.inc(),
            _ => {}
        }
        rover.status = next;
        true
    }

    fn touch(&self, rover: &mut Rover) {
        rover.updated_at = rover.updated_at.max(self.clock.now());
    }

    fn enqueue(&self, rover: &Rover) {
        let Some(tx) = &self.persist_tx else {
            return;
        };

        match tx.try_send(rover.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                // A later snapshot of the same rover supersedes this one
                PERSIST_QUEUE_FULL_TOTAL.inc();
                debug!("Persist queue full, dropping snapshot for rover {}", rover.id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Persist queue closed, rover {} will not be saved", rover.id);
            }
        }
    }
}

fn check_fresh(rover: &Rover, observed_at: DateTime<Utc>) -> Option<Applied> {
    let last_seen = rover.last_seen?;
    if observed_at < last_seen {
        warn!(
            "Dropping stale write for rover {}: {} is older than {}",
            rover.id, observed_at, last_seen
        );
        STALE_WRITES_TOTAL.inc();
        Some(Applied::Stale)
    } else if observed_at == last_seen {
        debug!("Ignoring retransmission for rover {} at {}", rover.id, observed_at);
        Some(Applied::Duplicate)
    } else {
        None
    }
}
