//! Admission control for runs
//!
//! Bounds the number of runs executing at once, globally and per tenant.
//! Slots are acquired global-first, tenant-second, and released in the
//! reverse order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::error::{Result, RunnerError};

/// Gate limits. Zero means unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateConfig {
    pub max_concurrent_runs: usize,
    pub max_runs_per_tenant: usize,
}

/// Lazily created per-tenant semaphores, cached for the process lifetime
#[derive(Debug)]
struct TenantLimiters {
    limit: usize,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl TenantLimiters {
    /// Find or create the tenant's semaphore. The lock covers only the
    /// lookup; acquiring the semaphore happens outside it.
    fn limiter(&self, tenant_id: &str) -> Arc<Semaphore> {
        let mut semaphores = self
            .semaphores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            semaphores
                .entry(tenant_id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.limit))),
        )
    }

    fn len(&self) -> usize {
        self.semaphores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Concurrency gate shared by every run in the process
#[derive(Debug)]
pub struct ConcurrencyGate {
    global: Option<Arc<Semaphore>>,
    tenants: Option<TenantLimiters>,
}

impl ConcurrencyGate {
    pub fn new(config: GateConfig) -> Self {
        let global = (config.max_concurrent_runs > 0)
            .then(|| Arc::new(Semaphore::new(config.max_concurrent_runs)));
        let tenants = (config.max_runs_per_tenant > 0).then(|| TenantLimiters {
            limit: config.max_runs_per_tenant,
            semaphores: Mutex::new(HashMap::new()),
        });
        Self { global, tenants }
    }

    /// A gate with no limits; acquire and release are no-ops
    pub fn unbounded() -> Self {
        Self::new(GateConfig::default())
    }

    pub fn is_unbounded(&self) -> bool {
        self.global.is_none() && self.tenants.is_none()
    }

    /// Reserve a slot for a run. Waits until capacity is available.
    pub async fn acquire(&self, tenant_id: Option<&str>) -> Result<ConcurrencySlot> {
        let global = match &self.global {
            Some(semaphore) => Some(
                Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| RunnerError::GateClosed)?,
            ),
            None => None,
        };

        // If this await fails or is cancelled, `global` is dropped here and
        // the global permit goes back with it.
        let tenant = match (&self.tenants, tenant_id) {
            (Some(tenants), Some(tenant_id)) => Some(
                tenants
                    .limiter(tenant_id)
                    .acquire_owned()
                    .await
                    .map_err(|_| RunnerError::GateClosed)?,
            ),
            _ => None,
        };

        debug!(
            tenant = tenant_id.unwrap_or("-"),
            global = global.is_some(),
            per_tenant = tenant.is_some(),
            "Acquired concurrency slot"
        );

        Ok(ConcurrencySlot { tenant, global })
    }

    /// Return a slot. Equivalent to dropping it.
    pub fn release(&self, slot: ConcurrencySlot) {
        slot.release();
    }

    /// Free global capacity, if a global limit is configured
    pub fn available_global(&self) -> Option<usize> {
        self.global.as_ref().map(|s| s.available_permits())
    }

    /// Number of tenants that have a cached limiter
    pub fn tracked_tenants(&self) -> usize {
        self.tenants.as_ref().map(TenantLimiters::len).unwrap_or(0)
    }
}

/// A held reservation. Dropping it releases tenant capacity first, then
/// global capacity.
#[derive(Debug)]
#[must_use = "dropping the slot releases it immediately"]
pub struct ConcurrencySlot {
    // Declaration order is drop order: tenant before global.
    tenant: Option<OwnedSemaphorePermit>,
    global: Option<OwnedSemaphorePermit>,
}

impl ConcurrencySlot {
    pub fn release(mut self) {
        drop(self.tenant.take());
        drop(self.global.take());
    }

    /// Whether the slot holds no capacity at all
    pub fn is_noop(&self) -> bool {
        self.tenant.is_none() && self.global.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Tracker {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Tracker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            })
        }

        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
        }

        fn leave(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn run_many(gate: Arc<ConcurrencyGate>, tenants: Vec<&'static str>, tracker: Arc<Tracker>) {
        let mut handles = Vec::new();
        for tenant in tenants {
            let gate = Arc::clone(&gate);
            let tracker = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                let slot = gate.acquire(Some(tenant)).await.unwrap();
                tracker.enter();
                tokio::time::sleep(Duration::from_millis(20)).await;
                tracker.leave();
                gate.release(slot);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_unbounded_gate_has_no_bookkeeping() {
        let gate = ConcurrencyGate::unbounded();
        let slot = gate.acquire(Some("tenant-a")).await.unwrap();

        assert!(gate.is_unbounded());
        assert!(slot.is_noop());
        assert_eq!(gate.tracked_tenants(), 0);
        assert_eq!(gate.available_global(), None);
    }

    #[tokio::test]
    async fn test_global_limit_bounds_concurrency() {
        let gate = Arc::new(ConcurrencyGate::new(GateConfig {
            max_concurrent_runs: 2,
            max_runs_per_tenant: 0,
        }));
        let tracker = Tracker::new();

        run_many(Arc::clone(&gate), vec!["a", "b", "c"], Arc::clone(&tracker)).await;

        assert_eq!(tracker.peak.load(Ordering::SeqCst), 2);
        assert_eq!(gate.available_global(), Some(2));
    }

    #[tokio::test]
    async fn test_tenant_limit_applies_despite_global_headroom() {
        let gate = Arc::new(ConcurrencyGate::new(GateConfig {
            max_concurrent_runs: 5,
            max_runs_per_tenant: 2,
        }));
        let tracker = Tracker::new();

        run_many(Arc::clone(&gate), vec!["a", "a", "a"], Arc::clone(&tracker)).await;

        assert_eq!(tracker.peak.load(Ordering::SeqCst), 2);
        assert_eq!(gate.tracked_tenants(), 1);
    }

    #[tokio::test]
    async fn test_release_returns_both_permits() {
        let gate = ConcurrencyGate::new(GateConfig {
            max_concurrent_runs: 1,
            max_runs_per_tenant: 1,
        });

        let slot = gate.acquire(Some("tenant")).await.unwrap();
        assert_eq!(gate.available_global(), Some(0));
        gate.release(slot);
        assert_eq!(gate.available_global(), Some(1));

        let again = tokio::time::timeout(Duration::from_secs(1), gate.acquire(Some("tenant"))).await;
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_tenant_wait_returns_global_permit() {
        let gate = Arc::new(ConcurrencyGate::new(GateConfig {
            max_concurrent_runs: 3,
            max_runs_per_tenant: 1,
        }));
        let held = gate.acquire(Some("busy")).await.unwrap();
        assert_eq!(gate.available_global(), Some(2));

        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.acquire(Some("busy")).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.available_global(), Some(1));

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(gate.available_global(), Some(2));
        drop(held);
        assert_eq!(gate.available_global(), Some(3));
    }

    #[tokio::test]
    async fn test_unknown_tenant_only_takes_global_capacity() {
        let gate = ConcurrencyGate::new(GateConfig {
            max_concurrent_runs: 1,
            max_runs_per_tenant: 1,
        });
        let slot = gate.acquire(None).await.unwrap();

        assert!(!slot.is_noop());
        assert_eq!(gate.tracked_tenants(), 0);
    }
}
