//! Store tier health.
//!
//! Each check pings every tier through the fallback router and reports
//! latency, breaker state and the tier's answer.

mod check;

pub use check::*;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::store::{FallbackStore, TierStatus};

pub struct HealthService {
    store: Arc<FallbackStore>,
    started_at: Instant,
}

impl HealthService {
    pub fn new(store: Arc<FallbackStore>) -> Self {
        Self {
            store,
            started_at: Instant::now(),
        }
    }

    /// Probe all tiers concurrently; each probe is bounded by the store
    /// operation timeout.
    pub async fn check_health(&self) -> HealthReport {
        let components = self
            .store
            .probe()
            .await
            .into_iter()
            .map(component_from_tier)
            .collect();

        HealthReport::from_tiers(components).with_uptime(self.uptime())
    }

    pub async fn is_ready(&self) -> bool {
        self.check_health().await.is_operational()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

fn component_from_tier(tier: TierStatus) -> ComponentHealth {
    let component = if tier.reachable {
        ComponentHealth::healthy(tier.name).with_message("Reachable")
    } else {
        ComponentHealth::unhealthy(tier.name)
            .with_error(tier.error.unwrap_or_else(|| "Unreachable".to_string()))
    };
    component
        .with_latency(Duration::from_millis(tier.latency_ms))
        .with_metadata("position", tier.position)
        .with_metadata("circuit", tier.circuit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::{JobStore, MemoryStore};

    #[tokio::test]
    async fn test_memory_only_is_healthy() {
        let stores: Vec<Arc<dyn JobStore>> = vec![Arc::new(MemoryStore::new())];
        let store = Arc::new(FallbackStore::new(stores, &StoreConfig::default()));
        let service = HealthService::new(store);

        let report = service.check_health().await;
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.components.len(), 1);
        assert_eq!(report.components[0].name, "memory");
        assert!(service.is_ready().await);
    }
}
