//! Destination-buffer reallocation worker
//!
//! When the panel switches resolution at runtime, the scratch buffers of
//! resolution-pinned units have to be reallocated. That happens on a
//! dedicated thread, off the frame path. A tri-state flag tells the frame
//! thread whether a reallocation is pending so it can leave those units
//! alone for the frame instead of racing the buffer swap.

use crate::buffer::BufferDescriptor;
use crate::mpp::DstRing;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReallocState {
    Done = 0,
    /// Requested, worker has not picked it up yet
    Start = 1,
    InProgress = 2,
}

impl ReallocState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ReallocState::Start,
            2 => ReallocState::InProgress,
            _ => ReallocState::Done,
        }
    }
}

#[derive(Debug)]
struct ReallocJob {
    rings: Vec<DstRing>,
    desc: BufferDescriptor,
}

#[derive(Debug)]
pub struct ReallocWorker {
    state: Arc<AtomicU8>,
    sender: Option<Sender<ReallocJob>>,
    handle: Option<JoinHandle<()>>,
}

impl ReallocWorker {
    pub fn spawn() -> Self {
        let state = Arc::new(AtomicU8::new(ReallocState::Done as u8));
        let (sender, receiver) = mpsc::channel::<ReallocJob>();
        let worker_state = Arc::clone(&state);
        let handle = thread::Builder::new()
            .name("dst-realloc".into())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    worker_state.store(ReallocState::InProgress as u8, Ordering::SeqCst);
                    run_job(&job);
                    // A request queued meanwhile has set Start again
                    let _ = worker_state.compare_exchange(
                        ReallocState::InProgress as u8,
                        ReallocState::Done as u8,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
                debug!("reallocation worker stopped");
            });

        match handle {
            Ok(handle) => Self {
                state,
                sender: Some(sender),
                handle: Some(handle),
            },
            Err(err) => {
                warn!("failed to spawn reallocation worker: {}", err);
                Self {
                    state,
                    sender: None,
                    handle: None,
                }
            }
        }
    }

    pub fn state(&self) -> ReallocState {
        ReallocState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_in_progress(&self) -> bool {
        self.state() != ReallocState::Done
    }

    /// Queues a reallocation of `rings` to buffers matching `desc`. Without
    /// a worker thread the job runs inline.
    pub fn request(&self, rings: Vec<DstRing>, desc: BufferDescriptor) {
        if rings.is_empty() {
            return;
        }
        info!(
            "reallocating {} destination rings to {}x{} {}",
            rings.len(),
            desc.width,
            desc.height,
            desc.format
        );
        let job = ReallocJob { rings, desc };
        self.state.store(ReallocState::Start as u8, Ordering::SeqCst);
        let job = match &self.sender {
            Some(sender) => match sender.send(job) {
                Ok(()) => return,
                Err(mpsc::SendError(job)) => job,
            },
            None => job,
        };
        run_job(&job);
        self.state.store(ReallocState::Done as u8, Ordering::SeqCst);
    }

    /// Polls until the flag reads done or `timeout` passes
    pub fn wait_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_in_progress() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl Drop for ReallocWorker {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("reallocation worker panicked");
            }
        }
    }
}

fn run_job(job: &ReallocJob) {
    for ring in &job.rings {
        match ring.reallocate(&job.desc) {
            Ok(count) => debug!("{}: reallocated {} buffers", ring.unit(), count),
            Err(err) => error!("{}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [ReallocState::Done, ReallocState::Start, ReallocState::InProgress] {
            assert_eq!(ReallocState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_empty_request_is_ignored() {
        let worker = ReallocWorker::spawn();
        worker.request(
            Vec::new(),
            BufferDescriptor {
                width: 1,
                height: 1,
                format: crate::image::PixelFormat::Rgba8888,
                usage: crate::buffer::BufferUsage::empty(),
            },
        );
        assert_eq!(worker.state(), ReallocState::Done);
        assert!(worker.wait_done(Duration::from_millis(10)));
    }
}
