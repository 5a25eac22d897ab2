// Expiry sweep
//
// A single long-lived task that converges stored state with reality:
// anything past its expiry gets revoked. The loop is a cancellable timer
// around a deterministic `tick`, so tests drive one sweep directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::Result;
use crate::store::EntitlementStore;
use crate::subscription::SubscriptionManager;

pub struct ExpiryReaper {
    store: EntitlementStore,
    subscriptions: Arc<SubscriptionManager>,
    interval: Duration,
}

impl ExpiryReaper {
    pub fn new(
        store: EntitlementStore,
        subscriptions: Arc<SubscriptionManager>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            subscriptions,
            interval,
        }
    }

    /// Sweep once. Each expired token is revoked independently; a failure is
    /// logged and retried on the next tick, never aborting the rest of the
    /// sweep. Returns how many tokens were revoked.
    pub async fn tick(&self) -> Result<usize> {
        let expired = self
            .store
            .expired_subscriptions(Utc::now().timestamp())
            .await?;
        let mut revoked = 0;
        for sub in expired {
            match self.subscriptions.revoke(&sub.token).await {
                Ok(()) => revoked += 1,
                Err(e) => {
                    error!(user_id = %sub.user_id, client_id = %sub.client_id, "failed to revoke expired subscription: {e}");
                }
            }
        }
        if revoked > 0 {
            info!(revoked, "expiry sweep revoked subscriptions");
        }
        Ok(revoked)
    }

    /// Run the sweep on a fixed interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("expiry reaper stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("expiry sweep failed: {e}");
                    }
                }
            }
        }
    }
}
