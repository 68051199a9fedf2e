//! Fence-reaping worker of a processing unit
//!
//! Each unit owns one worker thread. The frame-submission thread queues two
//! kinds of work and never blocks on prior-frame completion itself:
//!
//! - hardware-state requests: completion fences of submitted jobs, and
//!   requests to go idle once every earlier fence has signaled;
//! - buffers pending free, each gated by the fence of its last reader.
//!
//! Waits are bounded. A fence that does not signal within the timeout is
//! logged and the work proceeds anyway.

use super::{HwState, MppStats};
use crate::buffer::{BufferAllocator, BufferHandle};
use crate::fence::Fence;
use crate::image::ExynosImage;
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One slot of a unit's destination ring
#[derive(Debug, Default)]
pub(crate) struct DstBuf {
    pub buffer: Option<BufferHandle>,
    /// Signals when the last reader (display scan-out) is done
    pub release_fence: Option<Fence>,
}

/// Sources and output of the last executed job
#[derive(Debug, Clone)]
pub(crate) struct PrevFrame {
    pub sources: Vec<(ExynosImage, ExynosImage)>,
    pub dst: ExynosImage,
    pub slot: usize,
}

/// State shared between a unit and its worker
#[derive(Debug)]
pub(crate) struct HwShared {
    pub state: HwState,
    /// Bumped on every transition to running; stale idle requests carry an
    /// older value and are ignored
    pub generation: u64,
    pub dst_bufs: Vec<DstBuf>,
    pub prev_frame: Option<PrevFrame>,
    /// Keep destination buffers across idle transitions
    pub retain_buffers: bool,
    pub stats: MppStats,
}

#[derive(Debug)]
pub(crate) enum HwRequest {
    Fence(Fence),
    Idle { generation: u64 },
}

#[derive(Debug)]
pub(crate) struct PendingFree {
    pub buffer: BufferHandle,
    pub fence: Option<Fence>,
}

#[derive(Debug, Default)]
struct Queues {
    hw: VecDeque<HwRequest>,
    free: VecDeque<PendingFree>,
    /// Worker is between taking work and finishing it
    busy: bool,
    exit: bool,
}

#[derive(Debug)]
pub(crate) struct MppShared {
    pub name: String,
    queues: Mutex<Queues>,
    cv: Condvar,
    /// Notified whenever the worker runs out of work
    idle_cv: Condvar,
    pub hw: Mutex<HwShared>,
    pub allocator: Option<Arc<dyn BufferAllocator>>,
    timeout: Duration,
}

impl MppShared {
    pub fn new(
        name: String,
        dst_buffer_count: usize,
        allocator: Option<Arc<dyn BufferAllocator>>,
        timeout: Duration,
    ) -> Self {
        let dst_bufs = if allocator.is_some() {
            (0..dst_buffer_count).map(|_| DstBuf::default()).collect()
        } else {
            Vec::new()
        };
        Self {
            name,
            queues: Mutex::new(Queues::default()),
            cv: Condvar::new(),
            idle_cv: Condvar::new(),
            hw: Mutex::new(HwShared {
                state: HwState::Idle,
                generation: 0,
                dst_bufs,
                prev_frame: None,
                retain_buffers: false,
                stats: MppStats::default(),
            }),
            allocator,
            timeout,
        }
    }

    pub fn push_hw(&self, request: HwRequest) {
        let mut queues = self.queues.lock();
        queues.hw.push_back(request);
        self.cv.notify_one();
    }

    pub fn push_free(&self, pending: PendingFree) {
        let mut queues = self.queues.lock();
        queues.free.push_back(pending);
        self.cv.notify_one();
    }

    /// Blocks until the worker has drained both queues or `timeout` passed.
    /// Returns whether the queues are empty.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut queues = self.queues.lock();
        while queues.busy || !queues.hw.is_empty() || !queues.free.is_empty() {
            if self.idle_cv.wait_until(&mut queues, deadline).timed_out() {
                return !queues.busy && queues.hw.is_empty() && queues.free.is_empty();
            }
        }
        true
    }

    fn free_buffer(&self, buffer: BufferHandle) {
        debug!("{}: freeing {}", self.name, buffer.id);
        if let Some(allocator) = &self.allocator {
            allocator.free(buffer);
        }
        self.hw.lock().stats.buffers_freed += 1;
    }

    fn wait_fence(&self, fence: &Fence, what: &str) {
        if !fence.wait(self.timeout) {
            error!(
                "{}: {} fence {} did not signal within {:?}",
                self.name,
                what,
                fence.fd(),
                self.timeout
            );
            self.hw.lock().stats.fence_timeouts += 1;
        }
    }

    fn process_free(&self, pending: PendingFree, waiting: bool) {
        let PendingFree { buffer, fence } = pending;
        if let Some(fence) = fence {
            if waiting {
                self.wait_fence(&fence, "buffer release");
            }
            fence.close();
        }
        self.free_buffer(buffer);
    }

    fn process_hw(&self, request: HwRequest, waiting: bool) {
        match request {
            HwRequest::Fence(fence) => {
                if waiting {
                    self.wait_fence(&fence, "hardware state");
                }
                fence.close();
            }
            HwRequest::Idle { generation } => self.go_idle(generation, waiting),
        }
    }

    /// Flips to idle unless the unit was started again after the request.
    /// Destination buffers are freed only after their last reader is done.
    fn go_idle(&self, generation: u64, waiting: bool) {
        let mut to_free = Vec::new();
        {
            let mut hw = self.hw.lock();
            if hw.generation != generation {
                debug!("{}: stale idle request ignored", self.name);
                return;
            }
            if hw.state == HwState::Idle {
                return;
            }
            hw.state = HwState::Idle;
            hw.stats.idle_transitions += 1;
            hw.prev_frame = None;
            if !hw.retain_buffers {
                for slot in hw.dst_bufs.iter_mut() {
                    let fence = slot.release_fence.take();
                    match slot.buffer.take() {
                        Some(buffer) => to_free.push(PendingFree { buffer, fence }),
                        None => {
                            if let Some(fence) = fence {
                                fence.close();
                            }
                        }
                    }
                }
            }
        }
        debug!("{}: idle, releasing {} buffers", self.name, to_free.len());
        for pending in to_free {
            self.process_free(pending, waiting);
        }
    }
}

/// Handle of a running worker thread. Dropping it stops the worker.
#[derive(Debug)]
pub(crate) struct Reaper {
    shared: Arc<MppShared>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    pub fn spawn(shared: Arc<MppShared>) -> Self {
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("reaper-{}", shared.name))
            .spawn(move || run(worker));
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                // Work is processed inline by `flush` when no worker runs
                warn!("{}: failed to spawn reaper thread: {}", shared.name, err);
                None
            }
        };
        Self { shared, handle }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Processes queued work on the calling thread. Used when the worker
    /// could not be started.
    pub fn flush(&self) {
        let (hw, free) = {
            let mut queues = self.shared.queues.lock();
            (
                std::mem::take(&mut queues.hw),
                std::mem::take(&mut queues.free),
            )
        };
        for pending in free {
            self.shared.process_free(pending, true);
        }
        for request in hw {
            self.shared.process_hw(request, true);
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        {
            let mut queues = self.shared.queues.lock();
            queues.exit = true;
            self.shared.cv.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("{}: reaper thread panicked", self.shared.name);
            }
        }
    }
}

fn run(shared: Arc<MppShared>) {
    debug!("{}: reaper started", shared.name);
    loop {
        let (hw, free, exiting) = {
            let mut queues = shared.queues.lock();
            while queues.hw.is_empty() && queues.free.is_empty() && !queues.exit {
                queues.busy = false;
                shared.idle_cv.notify_all();
                shared.cv.wait(&mut queues);
            }
            queues.busy = true;
            (
                std::mem::take(&mut queues.hw),
                std::mem::take(&mut queues.free),
                queues.exit,
            )
        };

        // On shutdown nothing waits: fences are closed and buffers freed
        let waiting = !exiting;
        for pending in free {
            shared.process_free(pending, waiting);
        }
        for request in hw {
            shared.process_hw(request, waiting);
        }

        if exiting {
            let mut queues = shared.queues.lock();
            if queues.hw.is_empty() && queues.free.is_empty() {
                queues.busy = false;
                shared.idle_cv.notify_all();
                break;
            }
        }
    }
    debug!("{}: reaper stopped", shared.name);
}
