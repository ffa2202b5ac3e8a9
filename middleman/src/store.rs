// Copyright (c) Middleman Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory deal registry.
//!
//! The store maps ticket identity to a mutex-wrapped `Deal`. Holding that
//! per-deal mutex for a whole read-check-mutate-notify sequence is the
//! serialization boundary: concurrent button presses, monitor ticks and
//! timeouts on the same deal apply in some serial order, while different
//! deals proceed independently.

use crate::error::{MiddlemanError, MiddlemanResult};
use crate::types::{Deal, TicketId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

pub type DealHandle = Arc<Mutex<Deal>>;

pub struct DealStore {
    deals: RwLock<HashMap<TicketId, DealHandle>>,
}

impl Default for DealStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DealStore {
    pub fn new() -> Self {
        Self {
            deals: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new deal. Fails if the ticket already has one.
    pub async fn create(&self, deal: Deal) -> MiddlemanResult<DealHandle> {
        let id = deal.id;
        let mut deals = self.deals.write().await;
        if deals.contains_key(&id) {
            return Err(MiddlemanError::DealExists(id));
        }
        let handle = Arc::new(Mutex::new(deal));
        deals.insert(id, handle.clone());
        debug!("[DealStore] created deal for ticket {}", id);
        Ok(handle)
    }

    pub async fn get(&self, id: TicketId) -> Option<DealHandle> {
        self.deals.read().await.get(&id).cloned()
    }

    /// Fetch a handle or fail with `DealNotFound`.
    pub async fn require(&self, id: TicketId) -> MiddlemanResult<DealHandle> {
        self.get(id).await.ok_or(MiddlemanError::DealNotFound(id))
    }

    pub async fn remove(&self, id: TicketId) -> Option<DealHandle> {
        let removed = self.deals.write().await.remove(&id);
        if removed.is_some() {
            info!("[DealStore] removed deal for ticket {}", id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.deals.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.deals.read().await.is_empty()
    }

    /// Snapshot of all ticket ids, for the monitor loops. Holders must
    /// re-check the stage under the deal mutex: a deal can move or be
    /// removed between the snapshot and the lock.
    pub async fn tickets(&self) -> Vec<TicketId> {
        self.deals.read().await.keys().copied().collect()
    }

    /// Remove a terminal deal after the grace delay.
    ///
    /// The caller marks `teardown_scheduled` under the deal mutex before
    /// calling, so each deal is scheduled exactly once. The removal
    /// re-checks that the deal is still terminal; a non-terminal deal is
    /// left in place (should not happen, indicates a caller bug).
    pub fn schedule_teardown(self: &Arc<Self>, id: TicketId, grace: Duration) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(handle) = store.get(id).await else {
                return;
            };
            let terminal = handle.lock().await.stage.is_terminal();
            if terminal {
                store.remove(id).await;
            } else {
                warn!(
                    "[DealStore] skipping teardown of ticket {}: deal is not terminal",
                    id
                );
            }
        });
    }
}
