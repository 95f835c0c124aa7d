//! Named run leases so two sync runs never spend the same day's quota.

use std::sync::Arc;

use chrono::Duration;
use kidsync_core::{Clock, RunLease};
use kidsync_storage::{Filter, RecordStore, StoreError};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::SyncError;

pub const DAILY_SYNC_LEASE: &str = "daily-sync";

pub struct RunLeases<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl<S: RecordStore> RunLeases<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { store, clock, ttl }
    }

    /// Take the lease, clearing an expired holder first. The unique `name`
    /// makes the create the point of mutual exclusion.
    pub async fn acquire(&self, name: &str) -> Result<RunLease, SyncError> {
        let now = self.clock.now();
        let expired = self
            .store
            .delete_many::<RunLease>(Filter::eq("name", name).and(Filter::lte("expires_at", now)))
            .await?;
        if expired > 0 {
            warn!(name, "cleared an expired run lease");
        }

        let lease = RunLease {
            name: name.to_string(),
            owner: Uuid::new_v4(),
            acquired_at: now,
            expires_at: now + self.ttl,
        };
        match self.store.create(&lease).await {
            Ok(()) => {
                info!(name, owner = %lease.owner, expires_at = %lease.expires_at, "run lease acquired");
                Ok(lease)
            }
            Err(StoreError::Conflict { .. }) => {
                let holder = self
                    .store
                    .find_unique::<RunLease>(Filter::eq("name", name))
                    .await?;
                Err(SyncError::RunInProgress {
                    name: name.to_string(),
                    expires_at: holder.map(|l| l.expires_at).unwrap_or(lease.expires_at),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns false when the lease was already gone (expired and taken over).
    pub async fn release(&self, lease: &RunLease) -> Result<bool, StoreError> {
        let removed = self
            .store
            .delete_many::<RunLease>(
                Filter::eq("name", lease.name.as_str()).and(Filter::eq("owner", lease.owner)),
            )
            .await?;
        debug!(name = %lease.name, removed, "run lease released");
        Ok(removed > 0)
    }
}
