//! Durable storage seam for rover identity and last known state.

use crate::errors::Result;
use crate::model::{CustomerId, Rover, RoverId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[async_trait]
pub trait RoverStore: Send + Sync {
    /// All known rovers, used to hydrate the registry at startup
    async fn load_all(&self) -> Result<Vec<Rover>>;

    /// Returns the record for `(customer_id, identifier)`, creating it if absent.
    /// The store assigns the id.
    async fn create_or_get(
        &self,
        customer_id: CustomerId,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<Rover>;

    /// Persists the mutable fields of each snapshot
    async fn save_states(&self, rovers: &[Rover]) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: RoverId,
    rovers: HashMap<RoverId, Rover>,
}

/// In-process store, used when no database is configured
#[derive(Debug, Default)]
pub struct MemoryRoverStore {
    state: Mutex<MemoryState>,
}

impl MemoryRoverStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: RoverId) -> Option<Rover> {
        self.state.lock().await.rovers.get(&id).cloned()
    }
}

#[async_trait]
impl RoverStore for MemoryRoverStore {
    async fn load_all(&self) -> Result<Vec<Rover>> {
        let state = self.state.lock().await;
        let mut rovers: Vec<Rover> = state.rovers.values().cloned().collect();
        rovers.sort_by_key(|r| r.id);
        Ok(rovers)
    }

    async fn create_or_get(
        &self,
        customer_id: CustomerId,
        identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<Rover> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .rovers
            .values()
            .find(|r| r.customer_id == customer_id && r.identifier == identifier)
        {
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let rover = Rover::new(state.next_id, customer_id, identifier, now);
        state.rovers.insert(rover.id, rover.clone());
        Ok(rover)
    }

    async fn save_states(&self, rovers: &[Rover]) -> Result<()> {
        let mut state = self.state.lock().await;
        for rover in rovers {
            state.rovers.insert(rover.id, rover.clone());
        }
        Ok(())
    }
}
