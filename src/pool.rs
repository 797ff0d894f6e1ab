use async_trait::async_trait;
use log::{debug, info, warn};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SyncError};

/// Builds, checks and tears down the pooled resource
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    async fn create(&self) -> Result<Self::Resource>;

    /// Cheap liveness check run before every hand-out
    async fn is_alive(&self, resource: &Self::Resource) -> bool;

    async fn shutdown(&self, resource: &Self::Resource);
}

struct Slot<R> {
    resource: Option<Arc<R>>,
    checked_out: bool,
    /// Bumped on every checkout and every forced reclaim
    generation: u64,
    last_released_at: Option<Instant>,
}

struct PoolInner<F: ResourceFactory> {
    factory: F,
    permits: Arc<Semaphore>,
    slot: Mutex<Slot<F::Resource>>,
    wait_timeout: Duration,
    idle_timeout: Duration,
}

impl<F: ResourceFactory> PoolInner<F> {
    fn lock_slot(&self) -> MutexGuard<'_, Slot<F::Resource>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_in(&self, generation: u64, permit: OwnedSemaphorePermit) {
        let mut slot = self.lock_slot();
        if slot.checked_out && slot.generation == generation {
            slot.checked_out = false;
            slot.last_released_at = Some(Instant::now());
            drop(permit);
            debug!("Pooled resource released (generation {})", generation);
        } else {
            // The slot was reclaimed from under this lease and already has
            // a replacement permit.
            warn!(
                "Late release of reclaimed lease (generation {}, current {})",
                generation, slot.generation
            );
            permit.forget();
        }
    }

    fn force_reclaim(&self, observed_generation: u64) {
        let mut slot = self.lock_slot();
        if slot.checked_out && slot.generation == observed_generation {
            slot.generation += 1;
            slot.checked_out = false;
            slot.last_released_at = Some(Instant::now());
            self.permits.add_permits(1);
            warn!(
                "Force-reclaimed pooled resource held past {:?} (generation {})",
                self.wait_timeout, observed_generation
            );
        }
    }
}

/// Checks the slot back in when dropped, even if acquisition is abandoned
struct Checkout<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
    permit: Option<OwnedSemaphorePermit>,
    generation: u64,
}

impl<F: ResourceFactory> Drop for Checkout<F> {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.inner.check_in(self.generation, permit);
        }
    }
}

/// Exclusive use of the pooled resource; released on drop
pub struct PoolLease<F: ResourceFactory> {
    resource: Arc<F::Resource>,
    _checkout: Checkout<F>,
}

impl<F: ResourceFactory> PoolLease<F> {
    pub fn release(self) {}

    pub fn handle(&self) -> &Arc<F::Resource> {
        &self.resource
    }
}

impl<F: ResourceFactory> Deref for PoolLease<F> {
    type Target = F::Resource;

    fn deref(&self) -> &Self::Target {
        &self.resource
    }
}

pub struct ResourcePool<F: ResourceFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ResourceFactory> Clone for ResourcePool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ResourceFactory> ResourcePool<F> {
    pub fn new(factory: F, wait_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                permits: Arc::new(Semaphore::new(1)),
                slot: Mutex::new(Slot {
                    resource: None,
                    checked_out: false,
                    generation: 0,
                    last_released_at: None,
                }),
                wait_timeout,
                idle_timeout,
            }),
        }
    }

    pub async fn acquire(&self) -> Result<PoolLease<F>> {
        let inner = &self.inner;
        let observed = inner.lock_slot().generation;

        let permit = match tokio::time::timeout(
            inner.wait_timeout,
            Arc::clone(&inner.permits).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(SyncError::unavailable("resource pool is closed")),
            Err(_) => {
                inner.force_reclaim(observed);
                return Err(SyncError::unavailable(format!(
                    "timed out after {:?} waiting for the pooled resource",
                    inner.wait_timeout
                )));
            }
        };

        let (generation, existing) = {
            let mut slot = inner.lock_slot();
            slot.generation += 1;
            slot.checked_out = true;
            (slot.generation, slot.resource.clone())
        };
        let checkout = Checkout {
            inner: Arc::clone(inner),
            permit: Some(permit),
            generation,
        };

        if let Some(resource) = existing {
            if inner.factory.is_alive(&resource).await {
                debug!("Reusing pooled resource (generation {})", generation);
                return Ok(PoolLease {
                    resource,
                    _checkout: checkout,
                });
            }
            warn!("Pooled resource failed its liveness check; replacing it");
            inner.lock_slot().resource = None;
            inner.factory.shutdown(&resource).await;
        }

        let fresh = Arc::new(inner.factory.create().await?);
        inner.lock_slot().resource = Some(Arc::clone(&fresh));
        info!("Created pooled resource (generation {})", generation);
        Ok(PoolLease {
            resource: fresh,
            _checkout: checkout,
        })
    }

    /// Destroys the resource if it sat idle past the idle timeout
    pub async fn sweep_idle(&self) -> bool {
        let inner = &self.inner;
        let Ok(_permit) = Arc::clone(&inner.permits).try_acquire_owned() else {
            return false;
        };

        let expired = {
            let mut slot = inner.lock_slot();
            let idle_too_long = !slot.checked_out
                && slot
                    .last_released_at
                    .is_some_and(|at| at.elapsed() >= inner.idle_timeout);
            if idle_too_long {
                slot.resource.take()
            } else {
                None
            }
        };

        match expired {
            Some(resource) => {
                info!(
                    "Destroying pooled resource idle for more than {:?}",
                    inner.idle_timeout
                );
                inner.factory.shutdown(&resource).await;
                true
            }
            None => false,
        }
    }

    /// Runs `sweep_idle` every `every` until `cancel` fires
    pub fn spawn_reaper(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.sweep_idle().await;
                    }
                }
            }
            debug!("Resource pool reaper stopped");
        })
    }

    /// Refuses new acquisitions and tears the resource down
    pub async fn close(&self) {
        self.inner.permits.close();
        let resource = self.inner.lock_slot().resource.take();
        if let Some(resource) = resource {
            self.inner.factory.shutdown(&resource).await;
        }
    }

    pub fn is_checked_out(&self) -> bool {
        self.inner.lock_slot().checked_out
    }

    pub fn has_resource(&self) -> bool {
        self.inner.lock_slot().resource.is_some()
    }
}
