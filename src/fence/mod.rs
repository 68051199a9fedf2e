//! Synchronization fences and descriptor bookkeeping
//!
//! A [`Fence`] is an owned handle on a [`SyncPoint`]: a one-shot completion
//! flag that some hardware (or the GPU) signals once it is done with a
//! buffer. Handles are not `Clone`; the only way to get a second handle on
//! the same point is [`Fence::dup`], the only way to get rid of one is
//! [`Fence::close`] (or dropping it), and the only way to give one away is
//! to move it. That makes double-close unrepresentable.
//!
//! Every handle is registered with a [`FenceTracker`] that keeps the
//! from/to/dup/close history of each open descriptor. At the end of every
//! frame the tracker reports descriptors that are still held by a display
//! without a pending exemption: those are leaks.

use crate::display::DisplayId;
use crate::layer::LayerId;
use log::{debug, error};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Number of transitions remembered per descriptor
const HISTORY_DEPTH: usize = 8;

/// Number of closed descriptors kept for dumps
const CLOSED_HISTORY_DEPTH: usize = 32;

/// First synthetic descriptor number
const FIRST_FD: i32 = 100;

/// Descriptor number of an open fence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FenceFd(pub i32);

impl fmt::Display for FenceFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd{}", self.0)
    }
}

/// What a fence gates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FenceKind {
    /// Buffer content is ready to be read
    Acquire,
    /// Buffer may be reused by its producer
    Release,
    /// Frame has been retired by the display controller
    Retire,
    /// Output of a memory-to-memory unit is ready
    MppOutput,
    /// Hardware of a processing unit has finished its job
    HwState,
}

/// Holder of a descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum FenceOwner {
    /// The display server, outside this process' bookkeeping
    Caller,
    Layer(DisplayId, LayerId),
    ClientTarget(DisplayId),
    ExynosTarget(DisplayId),
    Display(DisplayId),
    Mpp(String),
    Reaper(String),
    /// Display-controller or engine driver
    Driver,
}

impl FenceOwner {
    /// Display whose frame this holder belongs to
    pub fn display(&self) -> Option<DisplayId> {
        match self {
            FenceOwner::Layer(d, _)
            | FenceOwner::ClientTarget(d)
            | FenceOwner::ExynosTarget(d)
            | FenceOwner::Display(d) => Some(*d),
            _ => None,
        }
    }
}

impl fmt::Display for FenceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FenceOwner::Caller => f.write_str("caller"),
            FenceOwner::Layer(d, l) => write!(f, "{}/{}", d, l),
            FenceOwner::ClientTarget(d) => write!(f, "{}/client-target", d),
            FenceOwner::ExynosTarget(d) => write!(f, "{}/exynos-target", d),
            FenceOwner::Display(d) => write!(f, "{}", d),
            FenceOwner::Mpp(name) => write!(f, "mpp:{}", name),
            FenceOwner::Reaper(name) => write!(f, "reaper:{}", name),
            FenceOwner::Driver => f.write_str("driver"),
        }
    }
}

/// One step in the life of a descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Transition {
    /// Created or received from `FenceOwner`
    From(FenceOwner),
    /// Moved to `FenceOwner`
    To(FenceOwner),
    /// Duplicated into the given descriptor
    Dup(FenceFd),
    Close,
    /// Closed by going out of scope instead of an explicit close
    Dropped,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::From(o) => write!(f, "from {}", o),
            Transition::To(o) => write!(f, "to {}", o),
            Transition::Dup(fd) => write!(f, "dup->{}", fd),
            Transition::Close => f.write_str("close"),
            Transition::Dropped => f.write_str("dropped"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FenceEvent {
    pub frame: u64,
    pub transition: Transition,
}

/// Bookkeeping of one open descriptor
#[derive(Debug, Clone, Serialize)]
pub struct FenceRecord {
    pub fd: FenceFd,
    pub kind: FenceKind,
    pub owner: FenceOwner,
    /// Allowed to stay open across the end of a frame
    pub pending_allowed: bool,
    pub history: VecDeque<FenceEvent>,
}

impl FenceRecord {
    fn push(&mut self, frame: u64, transition: Transition) {
        if self.history.len() == HISTORY_DEPTH {
            self.history.pop_front();
        }
        self.history.push_back(FenceEvent { frame, transition });
    }

    fn history_string(&self) -> String {
        let mut out = String::new();
        for (i, event) in self.history.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "[{}] {}", event.frame, event.transition);
        }
        out
    }
}

/// Descriptor still open at the end of a frame
#[derive(Debug, Clone, Serialize)]
pub struct FenceLeak {
    pub display: DisplayId,
    pub record: FenceRecord,
}

/// Lifetime counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FenceStats {
    pub created: u64,
    pub duplicated: u64,
    pub closed: u64,
    pub dropped: u64,
    pub leaks_reported: u64,
}

impl FenceStats {
    /// Descriptors currently open
    pub fn open(&self) -> u64 {
        (self.created + self.duplicated).saturating_sub(self.closed + self.dropped)
    }
}

#[derive(Debug)]
struct TrackerState {
    next_fd: i32,
    frame: u64,
    open: HashMap<FenceFd, FenceRecord>,
    recently_closed: VecDeque<FenceRecord>,
    stats: FenceStats,
}

/// Process-wide registry of open fence descriptors
#[derive(Debug)]
pub struct FenceTracker {
    state: Mutex<TrackerState>,
    debug: AtomicBool,
}

impl Default for FenceTracker {
    fn default() -> Self {
        Self {
            state: Mutex::new(TrackerState {
                next_fd: FIRST_FD,
                frame: 0,
                open: HashMap::new(),
                recently_closed: VecDeque::with_capacity(CLOSED_HISTORY_DEPTH),
                stats: FenceStats::default(),
            }),
            debug: AtomicBool::new(false),
        }
    }
}

impl FenceTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Log every transition at debug level
    pub fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
    }

    fn trace(&self, fd: FenceFd, transition: &Transition) {
        if self.debug.load(Ordering::Relaxed) {
            debug!("fence {}: {}", fd, transition);
        }
    }

    fn register(&self, kind: FenceKind, owner: FenceOwner, from: Transition) -> FenceFd {
        let mut state = self.state.lock();
        let fd = FenceFd(state.next_fd);
        state.next_fd = state.next_fd.wrapping_add(1).max(FIRST_FD);
        let frame = state.frame;
        let mut record = FenceRecord {
            fd,
            kind,
            owner,
            pending_allowed: false,
            history: VecDeque::with_capacity(HISTORY_DEPTH),
        };
        record.push(frame, from.clone());
        state.open.insert(fd, record);
        drop(state);
        self.trace(fd, &from);
        fd
    }

    /// Create a fence on a fresh, unsignaled sync point
    pub fn create(self: &Arc<Self>, kind: FenceKind, owner: FenceOwner) -> Fence {
        self.create_on(Arc::new(SyncPoint::new()), kind, owner)
    }

    /// Create an already signaled fence
    pub fn create_signaled(self: &Arc<Self>, kind: FenceKind, owner: FenceOwner) -> Fence {
        let point = Arc::new(SyncPoint::new());
        point.signal();
        self.create_on(point, kind, owner)
    }

    /// Create a fence on an existing sync point (driver side)
    pub fn create_on(
        self: &Arc<Self>,
        point: Arc<SyncPoint>,
        kind: FenceKind,
        owner: FenceOwner,
    ) -> Fence {
        let fd = self.register(kind, owner.clone(), Transition::From(owner));
        self.state.lock().stats.created += 1;
        Fence {
            fd,
            point,
            tracker: Arc::clone(self),
            closed: false,
        }
    }

    fn record_dup(&self, src: FenceFd, kind: FenceKind, owner: FenceOwner) -> FenceFd {
        let fd = self.register(kind, owner.clone(), Transition::From(owner));
        let mut state = self.state.lock();
        let frame = state.frame;
        state.stats.duplicated += 1;
        if let Some(record) = state.open.get_mut(&src) {
            record.push(frame, Transition::Dup(fd));
        }
        drop(state);
        self.trace(src, &Transition::Dup(fd));
        fd
    }

    fn record_move(&self, fd: FenceFd, owner: FenceOwner) {
        let transition = Transition::To(owner.clone());
        let mut state = self.state.lock();
        let frame = state.frame;
        if let Some(record) = state.open.get_mut(&fd) {
            record.owner = owner;
            record.push(frame, transition.clone());
        }
        drop(state);
        self.trace(fd, &transition);
    }

    fn record_close(&self, fd: FenceFd, transition: Transition) {
        let mut state = self.state.lock();
        let frame = state.frame;
        match transition {
            Transition::Dropped => state.stats.dropped += 1,
            _ => state.stats.closed += 1,
        }
        if let Some(mut record) = state.open.remove(&fd) {
            record.push(frame, transition.clone());
            if state.recently_closed.len() == CLOSED_HISTORY_DEPTH {
                state.recently_closed.pop_front();
            }
            state.recently_closed.push_back(record);
        }
        drop(state);
        self.trace(fd, &transition);
    }

    /// Exempt (or stop exempting) an open descriptor from leak reports
    pub fn set_pending_allowed(&self, fd: FenceFd, allowed: bool) {
        if let Some(record) = self.state.lock().open.get_mut(&fd) {
            record.pending_allowed = allowed;
        }
    }

    /// Current frame counter
    pub fn frame(&self) -> u64 {
        self.state.lock().frame
    }

    /// End-of-frame check for `display`: every descriptor still held by
    /// that display without a pending exemption is reported and logged
    /// with its history. Advances the frame counter.
    pub fn frame_end(&self, display: DisplayId) -> Vec<FenceLeak> {
        let mut state = self.state.lock();
        let mut leaks: Vec<FenceLeak> = state
            .open
            .values()
            .filter(|r| !r.pending_allowed && r.owner.display() == Some(display))
            .map(|r| FenceLeak {
                display,
                record: r.clone(),
            })
            .collect();
        leaks.sort_by_key(|l| l.record.fd);
        state.stats.leaks_reported += leaks.len() as u64;
        state.frame += 1;
        drop(state);

        for leak in &leaks {
            error!(
                "{}: fence {} ({:?}) leaked, held by {}: {}",
                display,
                leak.record.fd,
                leak.record.kind,
                leak.record.owner,
                leak.record.history_string()
            );
        }
        leaks
    }

    pub fn stats(&self) -> FenceStats {
        self.state.lock().stats
    }

    /// Snapshot of every open descriptor, ordered by number
    pub fn open_records(&self) -> Vec<FenceRecord> {
        let state = self.state.lock();
        let mut records: Vec<FenceRecord> = state.open.values().cloned().collect();
        records.sort_by_key(|r| r.fd);
        records
    }

    pub fn is_open(&self, fd: FenceFd) -> bool {
        self.state.lock().open.contains_key(&fd)
    }

    /// Full history of a descriptor, open or recently closed
    pub fn history(&self, fd: FenceFd) -> Option<Vec<Transition>> {
        let state = self.state.lock();
        state
            .open
            .get(&fd)
            .or_else(|| state.recently_closed.iter().rev().find(|r| r.fd == fd))
            .map(|r| r.history.iter().map(|e| e.transition.clone()).collect())
    }

    /// Human readable state for diagnostic dumps
    pub fn dump(&self) -> String {
        let state = self.state.lock();
        let mut out = String::new();
        let stats = state.stats;
        let _ = writeln!(
            out,
            "fences: frame {} open {} created {} dup {} closed {} dropped {} leaks {}",
            state.frame,
            state.open.len(),
            stats.created,
            stats.duplicated,
            stats.closed,
            stats.dropped,
            stats.leaks_reported
        );
        let mut open: Vec<&FenceRecord> = state.open.values().collect();
        open.sort_by_key(|r| r.fd);
        for record in open {
            let _ = writeln!(
                out,
                "  {} {:?} owner={}{} {}",
                record.fd,
                record.kind,
                record.owner,
                if record.pending_allowed { " pending" } else { "" },
                record.history_string()
            );
        }
        for record in state.recently_closed.iter().rev().take(8) {
            let _ = writeln!(out, "  closed {} {:?} {}", record.fd, record.kind, record.history_string());
        }
        out
    }
}

/// One-shot completion flag shared by every descriptor on it
#[derive(Debug, Default)]
pub struct SyncPoint {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl SyncPoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cv.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }

    /// Waits up to `timeout`, returns whether the point signaled
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cv.wait_until(&mut signaled, deadline).timed_out() {
                return *signaled;
            }
        }
        true
    }
}

/// Owned fence descriptor
#[derive(Debug)]
pub struct Fence {
    fd: FenceFd,
    point: Arc<SyncPoint>,
    tracker: Arc<FenceTracker>,
    closed: bool,
}

impl Fence {
    pub fn fd(&self) -> FenceFd {
        self.fd
    }

    pub fn kind(&self) -> Option<FenceKind> {
        self.tracker.state.lock().open.get(&self.fd).map(|r| r.kind)
    }

    /// Second descriptor on the same sync point, held by `owner`
    pub fn dup(&self, kind: FenceKind, owner: FenceOwner) -> Fence {
        let fd = self.tracker.record_dup(self.fd, kind, owner);
        Fence {
            fd,
            point: Arc::clone(&self.point),
            tracker: Arc::clone(&self.tracker),
            closed: false,
        }
    }

    /// Record a change of holder
    pub fn move_to(&mut self, owner: FenceOwner) {
        self.tracker.record_move(self.fd, owner);
    }

    /// Builder form of [`Fence::move_to`]
    pub fn moved_to(mut self, owner: FenceOwner) -> Fence {
        self.move_to(owner);
        self
    }

    /// Allow this descriptor to stay open across frame ends
    pub fn allow_pending(&self) {
        self.tracker.set_pending_allowed(self.fd, true);
    }

    pub fn close(mut self) {
        self.closed = true;
        self.tracker.record_close(self.fd, Transition::Close);
    }

    pub fn is_signaled(&self) -> bool {
        self.point.is_signaled()
    }

    pub fn wait(&self, timeout: Duration) -> bool {
        self.point.wait(timeout)
    }

    /// Signals the underlying point. Only drivers and simulated hardware
    /// do this.
    pub fn signal(&self) {
        self.point.signal();
    }

    pub fn sync_point(&self) -> Arc<SyncPoint> {
        Arc::clone(&self.point)
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        if !self.closed {
            self.tracker.record_close(self.fd, Transition::Dropped);
        }
    }
}

/// Closes an optional fence in place
pub fn close_opt(fence: &mut Option<Fence>) {
    if let Some(fence) = fence.take() {
        fence.close();
    }
}

/// Fences gathered while a frame is built, one optional fence per slot.
/// Whatever is still inside when the set is dropped gets closed, so an
/// early return on an error path leaks nothing.
#[derive(Debug, Default)]
pub struct FenceSet {
    slots: Vec<Option<Fence>>,
}

impl FenceSet {
    pub fn with_slots(count: usize) -> Self {
        Self {
            slots: (0..count).map(|_| None).collect(),
        }
    }

    /// Puts `fence` in `slot`, closing whatever was there
    pub fn put(&mut self, slot: usize, fence: Option<Fence>) {
        if slot >= self.slots.len() {
            self.slots.resize_with(slot + 1, || None);
        }
        close_opt(&mut self.slots[slot]);
        self.slots[slot] = fence;
    }

    pub fn take(&mut self, slot: usize) -> Option<Fence> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Hands every slot over, leaving the set empty
    pub fn into_slots(mut self) -> Vec<Option<Fence>> {
        std::mem::take(&mut self.slots)
    }

    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            close_opt(slot);
        }
    }
}

impl Drop for FenceSet {
    fn drop(&mut self) {
        self.close_all();
    }
}
