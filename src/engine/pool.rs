use std::{
    collections::VecDeque,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Context;
use tokio::sync::{Semaphore, TryAcquireError};

use crate::engine::{
    error::{EngineError, EngineResult},
    metrics::MetricsRegistry,
    sandbox::{BoxOwner, BoxState, SandboxBox},
};

/// Fixed set of boxes handed out one caller at a time.
///
/// Waiters queue on a fair semaphore, so boxes go to the longest waiter
/// first. Permits always equal the number of boxes on the free list.
pub struct SandboxPool {
    slots: Mutex<VecDeque<SandboxBox>>,
    permits: Semaphore,
    capacity: usize,
    acquire_timeout: Option<Duration>,
    metrics: Arc<MetricsRegistry>,
}

impl SandboxPool {
    pub async fn new(
        root: &Path,
        size: usize,
        acquire_timeout: Option<Duration>,
        metrics: Arc<MetricsRegistry>,
    ) -> anyhow::Result<Arc<Self>> {
        Self::with_uid_base(root, size, None, acquire_timeout, metrics).await
    }

    /// Like `new`, but box `n` belongs to uid `uid_base + n` when a base is given.
    pub async fn with_uid_base(
        root: &Path,
        size: usize,
        uid_base: Option<u32>,
        acquire_timeout: Option<Duration>,
        metrics: Arc<MetricsRegistry>,
    ) -> anyhow::Result<Arc<Self>> {
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("failed to create workspace root {}", root.display()))?;
        let mut slots = VecDeque::with_capacity(size);
        for id in 0..size {
            let owner = uid_base.map(|base| BoxOwner::for_box(base, id)).transpose()?;
            slots.push_back(SandboxBox::create(root, id, owner).await?);
        }
        tracing::info!(size, root = %root.display(), ?uid_base, "sandbox pool ready");
        Ok(Arc::new(Self {
            slots: Mutex::new(slots),
            permits: Semaphore::new(size),
            capacity: size,
            acquire_timeout,
            metrics,
        }))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        self.lock_slots().len()
    }

    /// Waits for a free box. With a configured timeout, gives up with
    /// `PoolExhausted` instead of queueing forever.
    pub async fn acquire(&self) -> EngineResult<SandboxBox> {
        let closed = || EngineError::Infrastructure("sandbox pool is closed".into());
        let permit = match self.permits.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(closed()),
            Err(TryAcquireError::NoPermits) => {
                let _waiting = WaiterGauge::enter(&self.metrics);
                let permit = match self.acquire_timeout {
                    Some(limit) => tokio::time::timeout(limit, self.permits.acquire())
                        .await
                        .map_err(|_| EngineError::PoolExhausted)?,
                    None => self.permits.acquire().await,
                };
                permit.map_err(|_| closed())?
            }
        };

        let Some(sandbox) = self.lock_slots().pop_front() else {
            return Err(EngineError::Infrastructure(
                "free list empty despite an available permit".into(),
            ));
        };
        // From here the box travels with the lease until handed out.
        permit.forget();
        let mut lease = Lease::new(self, sandbox);

        if let Some(sandbox) = lease.sandbox.as_mut()
            && sandbox.needs_reset()
        {
            tracing::info!(box_id = sandbox.id(), "resetting dirty box before reuse");
            sandbox.reset().await?;
        }

        let Some(mut sandbox) = lease.sandbox.take() else {
            return Err(EngineError::Infrastructure("lease lost its box".into()));
        };
        sandbox.set_state(BoxState::Acquired);
        self.metrics.box_acquired();
        tracing::debug!(box_id = sandbox.id(), "box acquired");
        Ok(sandbox)
    }

    /// Wipes the box and returns it to the free list. The box goes back even
    /// if the wipe fails; it is then reset again before its next use.
    pub async fn release(&self, sandbox: SandboxBox) -> EngineResult<()> {
        self.metrics.box_released();
        let box_id = sandbox.id();
        let mut lease = Lease::new(self, sandbox);
        let outcome = match lease.sandbox.as_mut() {
            Some(sandbox) => sandbox.reset().await,
            None => Ok(()),
        };
        // A failed reset already flagged the box, so it goes back as is.
        if let Some(sandbox) = lease.sandbox.take() {
            self.put_back(sandbox);
        }
        tracing::debug!(box_id, "box released");
        outcome.map_err(|err| {
            tracing::warn!(box_id, error = %format!("{err:#}"), "box reset failed on release");
            EngineError::Cleanup(format!("{err:#}"))
        })
    }

    /// Returns a box without wiping it, for callers that cannot await.
    /// The box is reset before its next use.
    pub fn reclaim(&self, mut sandbox: SandboxBox) {
        self.metrics.box_released();
        sandbox.mark_dirty();
        self.put_back(sandbox);
    }

    fn put_back(&self, mut sandbox: SandboxBox) {
        sandbox.set_state(BoxState::Free);
        self.lock_slots().push_back(sandbox);
        self.permits.add_permits(1);
    }

    fn lock_slots(&self) -> MutexGuard<'_, VecDeque<SandboxBox>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A box between the free list and its holder. Dropping the lease, including
/// through cancellation, returns the box flagged for reset.
struct Lease<'a> {
    pool: &'a SandboxPool,
    sandbox: Option<SandboxBox>,
}

impl<'a> Lease<'a> {
    fn new(pool: &'a SandboxPool, sandbox: SandboxBox) -> Self {
        Self {
            pool,
            sandbox: Some(sandbox),
        }
    }
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(mut sandbox) = self.sandbox.take() {
            sandbox.mark_dirty();
            self.pool.put_back(sandbox);
        }
    }
}

struct WaiterGauge<'a>(&'a MetricsRegistry);

impl<'a> WaiterGauge<'a> {
    fn enter(metrics: &'a MetricsRegistry) -> Self {
        metrics.waiter_enqueued();
        Self(metrics)
    }
}

impl Drop for WaiterGauge<'_> {
    fn drop(&mut self) {
        self.0.waiter_dequeued();
    }
}
