//! Monotonic GPU completion counters.
//!
//! A [`Fence`] wraps a timeline semaphore. Every submission on a queue signals
//! the queue's fence with a strictly larger value, so "is submission N done?"
//! becomes a single integer comparison against the counter.

use crate::driver::DriverRef;
use crate::error::{GpuError, Result};
use ash::vk;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Timeline-semaphore backed completion counter.
///
/// `last_seen <= driver value <= last_submitted` holds at all times and
/// neither cached counter ever decreases.
pub struct Fence {
    driver: DriverRef,
    semaphore: vk::Semaphore,
    last_submitted: AtomicU64,
    last_seen: AtomicU64,
    // Held while a value is picked and signaled, by submissions and host signals alike.
    signaling: Mutex<()>,
}

impl Fence {
    /// Create a fence whose counter starts at zero.
    pub fn new(driver: DriverRef) -> Result<Self> {
        let semaphore = driver.create_timeline(0)?;
        Ok(Self {
            driver,
            semaphore,
            last_submitted: AtomicU64::new(0),
            last_seen: AtomicU64::new(0),
            signaling: Mutex::new(()),
        })
    }

    /// The underlying timeline semaphore.
    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Largest value handed out for a submission or host signal.
    pub fn last_submitted_value(&self) -> u64 {
        self.last_submitted.load(Ordering::Acquire)
    }

    /// Largest value known to have completed, without asking the driver.
    pub fn last_seen_value(&self) -> u64 {
        self.last_seen.load(Ordering::Acquire)
    }

    /// Serialize value assignment with other submissions and host signals.
    pub(crate) fn lock_signaling(&self) -> MutexGuard<'_, ()> {
        self.signaling.lock()
    }

    /// Reserve the next value for a submission.
    pub fn advance(&self) -> u64 {
        self.last_submitted.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Raise the submitted value to at least `value`, returning the result.
    pub fn advance_to(&self, value: u64) -> u64 {
        self.last_submitted
            .fetch_max(value, Ordering::AcqRel)
            .max(value)
    }

    /// Query the driver for the completed value and refresh the cache.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn current_value(&self) -> Result<u64> {
        let submitted = self.last_submitted_value();
        let observed = self.driver.timeline_value(self.semaphore)?.min(submitted);
        Ok(self.observe(observed))
    }

    /// Whether `value` has completed.
    pub fn check(&self, value: u64) -> Result<bool> {
        if value <= self.last_seen_value() {
            return Ok(true);
        }
        Ok(self.current_value()? >= value)
    }

    /// Block until `value` completes. `None` waits for the last submitted value.
    ///
    /// Waiting for a value that was never submitted is an error, because
    /// nothing would ever signal it.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait(&self, value: Option<u64>) -> Result<()> {
        if self.wait_timeout(value, None)? {
            Ok(())
        } else {
            Err(GpuError::vulkan("vkWaitSemaphores", vk::Result::TIMEOUT))
        }
    }

    /// Like [`Self::wait`] with a deadline. Returns `false` on timeout.
    pub fn wait_timeout(&self, value: Option<u64>, timeout: Option<Duration>) -> Result<bool> {
        let submitted = self.last_submitted_value();
        let target = value.unwrap_or(submitted);
        if target <= self.last_seen_value() {
            return Ok(true);
        }
        if target > submitted {
            return Err(GpuError::InvalidState(format!(
                "wait for fence value {target} but only {submitted} was submitted"
            )));
        }

        let timeout_ns = timeout.map_or(u64::MAX, |t| {
            u64::try_from(t.as_nanos()).unwrap_or(u64::MAX)
        });
        if !self
            .driver
            .wait_timeline(self.semaphore, target, timeout_ns)?
        {
            return Ok(false);
        }
        self.observe(target);
        Ok(true)
    }

    /// Advance the counter from the host.
    ///
    /// Values at or below the completed value are ignored. Submitted work
    /// must have completed first, otherwise this fails with `InvalidState`.
    pub fn signal(&self, value: u64) -> Result<()> {
        let _signaling = self.signaling.lock();
        if value <= self.last_seen_value() {
            return Ok(());
        }
        let completed = self.current_value()?;
        if value <= completed {
            return Ok(());
        }
        let submitted = self.last_submitted_value();
        if submitted > completed {
            return Err(GpuError::InvalidState(format!(
                "host signal {value} while fence value {submitted} is pending (completed {completed})"
            )));
        }
        self.driver.signal_timeline(self.semaphore, value)?;
        self.advance_to(value);
        self.observe(value);
        Ok(())
    }

    fn observe(&self, value: u64) -> u64 {
        self.last_seen.fetch_max(value, Ordering::AcqRel).max(value)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        self.driver.destroy_semaphore(self.semaphore);
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("semaphore", &self.semaphore)
            .field("last_submitted", &self.last_submitted_value())
            .field("last_seen", &self.last_seen_value())
            .finish()
    }
}

/// A point on a fence's timeline, returned by a submission.
#[derive(Debug, Clone)]
pub struct SyncPoint {
    fence: Arc<Fence>,
    value: u64,
}

impl SyncPoint {
    pub fn new(fence: Arc<Fence>, value: u64) -> Self {
        Self { fence, value }
    }

    pub fn fence(&self) -> &Arc<Fence> {
        &self.fence
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn is_complete(&self) -> Result<bool> {
        self.fence.check(self.value)
    }

    pub fn wait(&self) -> Result<()> {
        self.fence.wait(Some(self.value))
    }
}
