//! Hardware queues and submission.
//!
//! Each [`Queue`] owns one timeline [`Fence`] and a set of command pools.
//! Submitted command lists wait in a FIFO tagged with the fence value that
//! retires them; they are recycled once the fence passes that value.

use crate::command::{CommandList, CommandPool, ListState};
use crate::descriptors::DescriptorHeap;
use crate::driver::{DriverRef, SubmitBatch, TimelineWait};
use crate::error::{GpuError, Result};
use crate::fence::{Fence, SyncPoint};
use crate::pipeline::PipelineCache;
use ash::vk;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// Command buffers allocated per pool before another pool is created.
pub const DEFAULT_POOL_CAPACITY: u32 = 16;

/// Role a queue plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueueKind {
    Graphics,
    AsyncCompute,
    Transfer,
}

impl QueueKind {
    /// Pipeline bind points the heap is bound to when recording starts.
    pub fn bind_points(self) -> &'static [vk::PipelineBindPoint] {
        match self {
            Self::Graphics => &[vk::PipelineBindPoint::GRAPHICS, vk::PipelineBindPoint::COMPUTE],
            Self::AsyncCompute => &[vk::PipelineBindPoint::COMPUTE],
            Self::Transfer => &[],
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Graphics => "graphics",
            Self::AsyncCompute => "async-compute",
            Self::Transfer => "transfer",
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Extra synchronization for [`Queue::submit`].
#[derive(Debug, Clone, Default)]
pub struct SubmitInfo {
    /// Timeline points that must complete before the lists execute.
    pub waits: Vec<SyncPoint>,
    /// Explicit fence value to signal; must exceed every earlier value.
    pub signal_value: Option<u64>,
    /// Binary semaphores to wait on, e.g. swapchain acquisition.
    pub binary_waits: Vec<(vk::Semaphore, vk::PipelineStageFlags2)>,
    /// Binary semaphores to signal, e.g. for presentation.
    pub binary_signals: Vec<vk::Semaphore>,
}

/// Queue bookkeeping snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pools: usize,
    pub free_pools: usize,
    pub pending_lists: usize,
    pub last_submitted: u64,
    pub last_seen: u64,
}

pub(crate) struct PendingList {
    pool: Arc<CommandPool>,
    buffer: vk::CommandBuffer,
    value: u64,
}

#[derive(Default)]
struct QueueState {
    pools: Vec<Arc<CommandPool>>,
    free_pools: Vec<Arc<CommandPool>>,
    pending: VecDeque<PendingList>,
}

pub(crate) struct QueueShared {
    pub(crate) driver: DriverRef,
    pub(crate) kind: QueueKind,
    family: u32,
    index: u32,
    raw: vk::Queue,
    fence: Arc<Fence>,
    pub(crate) heap: Arc<DescriptorHeap>,
    pub(crate) pipelines: Arc<PipelineCache>,
    pool_capacity: u32,
    state: Mutex<QueueState>,
}

impl QueueShared {
    /// Put a pool back on the free list once its recording list has ended.
    pub(crate) fn return_pool(&self, pool: Arc<CommandPool>) {
        self.state.lock().free_pools.push(pool);
    }
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        if let Err(err) = self.driver.queue_wait_idle(self.raw) {
            tracing::warn!("{} queue: wait idle on teardown failed: {err}", self.kind);
        }
        let state = self.state.get_mut();
        state.pending.clear();
        state.free_pools.clear();
        for pool in state.pools.drain(..) {
            self.driver.destroy_command_pool(pool.raw());
        }
    }
}

/// A hardware queue with its completion fence.
#[derive(Clone)]
pub struct Queue(pub(crate) Arc<QueueShared>);

impl Queue {
    pub(crate) fn new(
        driver: DriverRef,
        kind: QueueKind,
        family: u32,
        index: u32,
        heap: Arc<DescriptorHeap>,
        pipelines: Arc<PipelineCache>,
        pool_capacity: u32,
    ) -> Result<Self> {
        let raw = driver.queue(family, index);
        let fence = Arc::new(Fence::new(driver.clone())?);
        tracing::debug!("Created {kind} queue {index} on family {family}");
        Ok(Self(Arc::new(QueueShared {
            driver,
            kind,
            family,
            index,
            raw,
            fence,
            heap,
            pipelines,
            pool_capacity: pool_capacity.max(1),
            state: Mutex::new(QueueState::default()),
        })))
    }

    pub fn kind(&self) -> QueueKind {
        self.0.kind
    }

    pub fn family(&self) -> u32 {
        self.0.family
    }

    pub fn index(&self) -> u32 {
        self.0.index
    }

    pub fn raw(&self) -> vk::Queue {
        self.0.raw
    }

    pub fn fence(&self) -> &Arc<Fence> {
        &self.0.fence
    }

    /// Run `f` on the raw queue, serialized with submissions.
    pub(crate) fn with_raw<R>(&self, f: impl FnOnce(vk::Queue) -> R) -> R {
        let _submit = self.0.fence.lock_signaling();
        f(self.0.raw)
    }

    /// Start recording a command list.
    ///
    /// Completed lists are reclaimed first. The descriptor heap is bound to
    /// every bind point this queue supports before the list is returned.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn begin(&self) -> Result<CommandList> {
        self.clear_pending_command_lists()?;
        let (pool, cmd) = self.checkout()?;

        if let Err(err) = self.0.driver.begin_command_buffer(cmd) {
            pool.set_state(cmd, ListState::Available);
            self.0.return_pool(pool);
            return Err(err);
        }
        for bind_point in self.0.kind.bind_points() {
            self.0.heap.bind_raw(cmd, *bind_point);
        }
        Ok(CommandList::new(self.0.clone(), pool, cmd))
    }

    /// Take a free pool with an available buffer, creating a pool if needed.
    fn checkout(&self) -> Result<(Arc<CommandPool>, vk::CommandBuffer)> {
        let mut state = self.0.state.lock();
        let mut full = Vec::new();
        let mut found = None;
        while let Some(pool) = state.free_pools.pop() {
            match pool.checkout(&self.0.driver) {
                Ok(Some(cmd)) => {
                    found = Some((pool, cmd));
                    break;
                }
                Ok(None) => full.push(pool),
                Err(err) => {
                    full.push(pool);
                    state.free_pools.append(&mut full);
                    return Err(err);
                }
            }
        }
        state.free_pools.append(&mut full);
        if let Some(found) = found {
            return Ok(found);
        }

        let pool = Arc::new(CommandPool::new(
            &self.0.driver,
            self.0.family,
            self.0.pool_capacity,
        )?);
        state.pools.push(pool.clone());
        tracing::debug!(
            "{} queue: command pool {} created",
            self.0.kind,
            state.pools.len()
        );
        match pool.checkout(&self.0.driver)? {
            Some(cmd) => Ok((pool, cmd)),
            None => Err(GpuError::InvalidState(
                "fresh command pool has no buffers".to_string(),
            )),
        }
    }

    /// Submit `lists` in order, returning the point that marks their completion.
    ///
    /// Lists still recording are ended first. On failure the lists are
    /// returned to their pools and nothing is signaled.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn submit(&self, lists: Vec<CommandList>, info: SubmitInfo) -> Result<SyncPoint> {
        let mut lists = lists;
        for list in &lists {
            if !Arc::ptr_eq(&list.queue, &self.0) {
                return Err(GpuError::InvalidState(format!(
                    "command list from the {} queue submitted to the {} queue",
                    list.queue.kind, self.0.kind
                )));
            }
        }
        for list in &mut lists {
            list.end()?;
        }

        let fence = &self.0.fence;
        let _submit = fence.lock_signaling();
        let last = fence.last_submitted_value();
        let value = match info.signal_value {
            Some(value) if value <= last => {
                return Err(GpuError::InvalidState(format!(
                    "signal value {value} does not exceed submitted value {last}"
                )));
            }
            Some(value) => value,
            None => last + 1,
        };

        let buffers: Vec<vk::CommandBuffer> = lists.iter().map(|list| list.raw()).collect();
        let waits: Vec<TimelineWait> = info
            .waits
            .iter()
            .filter(|point| point.value() > point.fence().last_seen_value())
            .map(|point| TimelineWait {
                semaphore: point.fence().semaphore(),
                value: point.value(),
                stages: vk::PipelineStageFlags2::ALL_COMMANDS,
            })
            .collect();

        let result = self.0.driver.submit(
            self.0.raw,
            &SubmitBatch {
                command_buffers: &buffers,
                waits: &waits,
                binary_waits: &info.binary_waits,
                signal: fence.semaphore(),
                signal_value: value,
                binary_signals: &info.binary_signals,
            },
        );
        if let Err(err) = result {
            tracing::error!("{} queue: submission of {} lists failed: {err}", self.0.kind, lists.len());
            for list in lists {
                list.discard();
            }
            return Err(err);
        }
        fence.advance_to(value);

        let mut state = self.0.state.lock();
        for list in lists {
            let (pool, buffer) = list.into_submitted();
            pool.set_state(buffer, ListState::Pending);
            state.pending.push_back(PendingList { pool, buffer, value });
        }
        tracing::trace!("{} queue: submitted value {value}", self.0.kind);
        Ok(SyncPoint::new(fence.clone(), value))
    }

    /// Recycle every submitted list whose fence value has completed.
    ///
    /// Returns the number of lists reclaimed.
    pub fn clear_pending_command_lists(&self) -> Result<usize> {
        let completed = self.0.fence.current_value()?;
        let mut state = self.0.state.lock();
        let mut reclaimed = 0;
        while state
            .pending
            .front()
            .is_some_and(|pending| pending.value <= completed)
        {
            if let Some(pending) = state.pending.pop_front() {
                pending.pool.set_state(pending.buffer, ListState::Available);
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            tracing::trace!(
                "{} queue: reclaimed {reclaimed} lists through value {completed}",
                self.0.kind
            );
        }
        Ok(reclaimed)
    }

    /// Block until everything submitted so far has completed.
    pub fn wait_idle(&self) -> Result<()> {
        self.0.fence.wait(None)?;
        self.clear_pending_command_lists()?;
        Ok(())
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.0.state.lock();
        QueueStats {
            pools: state.pools.len(),
            free_pools: state.free_pools.len(),
            pending_lists: state.pending.len(),
            last_submitted: self.0.fence.last_submitted_value(),
            last_seen: self.0.fence.last_seen_value(),
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("kind", &self.0.kind)
            .field("family", &self.0.family)
            .field("index", &self.0.index)
            .field("fence", &self.0.fence)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capabilities::RuntimeCaps;
    use crate::descriptors::HeapConfig;
    use crate::driver::simulated::{
        CompletionMode, RecordedCommand, SimulatedAdapter, SimulatedDriver,
    };
    use crate::driver::DeviceDriver;

    pub(crate) struct Rig {
        pub sim: Arc<SimulatedDriver>,
        pub heap: Arc<DescriptorHeap>,
        pub pipelines: Arc<PipelineCache>,
    }

    impl Rig {
        pub fn new(caps: RuntimeCaps, mode: CompletionMode) -> Self {
            let sim = Arc::new(SimulatedDriver::new(
                SimulatedAdapter::discrete("sim").build(),
                caps,
                mode,
            ));
            let heap = Arc::new(DescriptorHeap::new(sim.clone(), &HeapConfig::default()).unwrap());
            let pipelines = Arc::new(PipelineCache::new(sim.clone(), heap.pipeline_layout(), caps));
            Self {
                sim,
                heap,
                pipelines,
            }
        }

        pub fn queue(&self, kind: QueueKind, pool_capacity: u32) -> Queue {
            Queue::new(
                self.sim.clone(),
                kind,
                0,
                0,
                self.heap.clone(),
                self.pipelines.clone(),
                pool_capacity,
            )
            .unwrap()
        }
    }

    fn manual() -> Rig {
        Rig::new(RuntimeCaps::default(), CompletionMode::Manual)
    }

    #[test]
    fn begin_binds_heap_per_bind_point() {
        let rig = manual();
        let graphics = rig.queue(QueueKind::Graphics, 4);
        let list = graphics.begin().unwrap();
        assert_eq!(
            rig.sim.recorded(list.raw()),
            vec![
                RecordedCommand::BindDescriptorHeap(vk::PipelineBindPoint::GRAPHICS),
                RecordedCommand::BindDescriptorHeap(vk::PipelineBindPoint::COMPUTE),
            ]
        );
        list.discard();

        let transfer = rig.queue(QueueKind::Transfer, 4);
        let list = transfer.begin().unwrap();
        assert!(rig.sim.recorded(list.raw()).is_empty());
        list.discard();
    }

    #[test]
    fn submit_assigns_increasing_values() {
        let rig = manual();
        let queue = rig.queue(QueueKind::Graphics, 4);
        let a = queue.submit(vec![queue.begin().unwrap()], SubmitInfo::default()).unwrap();
        let b = queue.submit(vec![queue.begin().unwrap()], SubmitInfo::default()).unwrap();
        assert_eq!((a.value(), b.value()), (1, 2));
        assert_eq!(queue.fence().last_submitted_value(), 2);
        assert_eq!(queue.stats().pending_lists, 2);
    }

    #[test]
    fn pending_lists_are_not_reused_until_complete() {
        let rig = manual();
        let queue = rig.queue(QueueKind::Graphics, 1);

        let first = queue.begin().unwrap();
        let first_raw = first.raw();
        let point = queue.submit(vec![first], SubmitInfo::default()).unwrap();

        // The only buffer of the first pool is pending, so a second pool appears.
        let second = queue.begin().unwrap();
        assert_ne!(second.raw(), first_raw);
        assert_eq!(queue.stats().pools, 2);
        second.discard();

        rig.sim.complete_through(queue.fence().semaphore(), point.value());
        let third = queue.begin().unwrap();
        let fourth = queue.begin().unwrap();
        assert_eq!(queue.stats().pending_lists, 0);
        // Both buffers are recycled instead of growing a third pool.
        assert!([third.raw(), fourth.raw()].contains(&first_raw));
        third.discard();
        fourth.discard();
        assert_eq!(queue.stats().pools, 2);
        assert!(rig.sim.violations().is_empty(), "{:?}", rig.sim.violations());
    }

    #[test]
    fn reclamation_is_fifo_by_fence_value() {
        let rig = manual();
        let queue = rig.queue(QueueKind::Graphics, 8);
        let points: Vec<SyncPoint> = (0..3)
            .map(|_| queue.submit(vec![queue.begin().unwrap()], SubmitInfo::default()).unwrap())
            .collect();

        rig.sim.complete_through(queue.fence().semaphore(), points[1].value());
        assert_eq!(queue.clear_pending_command_lists().unwrap(), 2);
        assert_eq!(queue.stats().pending_lists, 1);

        rig.sim.complete_all();
        queue.wait_idle().unwrap();
        assert_eq!(queue.stats().pending_lists, 0);
    }

    #[test]
    fn explicit_signal_value_must_increase() {
        let rig = manual();
        let queue = rig.queue(QueueKind::Graphics, 4);
        let info = SubmitInfo {
            signal_value: Some(10),
            ..Default::default()
        };
        let point = queue.submit(vec![queue.begin().unwrap()], info).unwrap();
        assert_eq!(point.value(), 10);

        let stale = SubmitInfo {
            signal_value: Some(10),
            ..Default::default()
        };
        assert!(matches!(
            queue.submit(vec![queue.begin().unwrap()], stale),
            Err(GpuError::InvalidState(_))
        ));
        assert_eq!(queue.fence().last_submitted_value(), 10);
    }

    #[test]
    fn failed_submission_returns_lists() {
        let rig = manual();
        let queue = rig.queue(QueueKind::Graphics, 1);
        rig.sim.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        let err = queue
            .submit(vec![queue.begin().unwrap()], SubmitInfo::default())
            .unwrap_err();
        assert_eq!(err.vk_result(), Some(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(queue.fence().last_submitted_value(), 0);
        assert_eq!(queue.stats().pending_lists, 0);

        // The single buffer is available again, so no new pool is needed.
        queue.begin().unwrap().discard();
        assert_eq!(queue.stats().pools, 1);
    }

    #[test]
    fn cross_queue_waits_are_forwarded() {
        let rig = manual();
        let compute = rig.queue(QueueKind::AsyncCompute, 4);
        let graphics = rig.queue(QueueKind::Graphics, 4);

        let produced = compute
            .submit(vec![compute.begin().unwrap()], SubmitInfo::default())
            .unwrap();
        graphics
            .submit(
                vec![graphics.begin().unwrap()],
                SubmitInfo {
                    waits: vec![produced.clone()],
                    ..Default::default()
                },
            )
            .unwrap();

        let submissions = rig.sim.submissions();
        assert_eq!(
            submissions[1].waits,
            vec![(compute.fence().semaphore(), produced.value())]
        );
    }

    #[test]
    fn foreign_lists_are_rejected() {
        let rig = manual();
        let a = rig.queue(QueueKind::Graphics, 4);
        let b = rig.queue(QueueKind::Graphics, 4);
        let list = a.begin().unwrap();
        assert!(b.submit(vec![list], SubmitInfo::default()).is_err());
    }

    #[test]
    fn concurrent_submissions_get_unique_values() {
        let rig = Rig::new(RuntimeCaps::default(), CompletionMode::Immediate);
        let queue = rig.queue(QueueKind::Graphics, 4);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| {
                            let list = queue.begin().unwrap();
                            queue.submit(vec![list], SubmitInfo::default()).unwrap().value()
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut values: Vec<u64> = threads
            .into_iter()
            .flat_map(|thread| thread.join().unwrap())
            .collect();
        values.sort_unstable();
        values.dedup();
        assert_eq!(values.len(), 200);
        assert_eq!(queue.fence().last_submitted_value(), 200);
        assert!(rig.sim.violations().is_empty(), "{:?}", rig.sim.violations());
    }

    #[test]
    fn drop_destroys_pools_and_fence() {
        let rig = manual();
        let queue = rig.queue(QueueKind::Graphics, 2);
        queue.begin().unwrap().discard();
        assert_eq!(rig.sim.live_objects("command pool"), 1);
        drop(queue);
        assert_eq!(rig.sim.live_objects("command pool"), 0);
        assert_eq!(rig.sim.live_objects("command buffer"), 0);
        assert_eq!(rig.sim.live_objects("semaphore"), 0);
    }

    #[test]
    fn host_signal_cannot_reclaim_running_lists() {
        let rig = manual();
        let queue = rig.queue(QueueKind::Graphics, 4);
        let point = queue
            .submit(vec![queue.begin().unwrap()], SubmitInfo::default())
            .unwrap();

        assert!(queue.fence().signal(5).is_err());
        assert_eq!(queue.clear_pending_command_lists().unwrap(), 0);
        assert_eq!(queue.stats().pending_lists, 1);

        rig.sim.complete_through(queue.fence().semaphore(), point.value());
        queue.fence().signal(5).unwrap();
        assert_eq!(queue.clear_pending_command_lists().unwrap(), 1);

        // Submissions continue above the host value.
        let next = queue
            .submit(vec![queue.begin().unwrap()], SubmitInfo::default())
            .unwrap();
        assert_eq!(next.value(), 6);
        assert!(rig.sim.violations().is_empty(), "{:?}", rig.sim.violations());
    }
}
