use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use serde::Serialize;
use tracing::warn;
use video_ingest::{CaptureHandle, Frame, Playback};

use crate::queue::DropOldestQueue;

/// Lifecycle of a source: `Opened → Capturing → Removing → Released`, with
/// `Ended` between capturing and removal when the source stops by itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Opened,
    Capturing,
    Ended,
    Removing,
    Released,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Opened,
            1 => SessionState::Capturing,
            2 => SessionState::Ended,
            3 => SessionState::Removing,
            _ => SessionState::Released,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            SessionState::Opened => 0,
            SessionState::Capturing => 1,
            SessionState::Ended => 2,
            SessionState::Removing => 3,
            SessionState::Released => 4,
        }
    }
}

/// Flags shared between a session and its worker threads.
#[derive(Debug)]
pub(crate) struct SessionFlags {
    active: AtomicBool,
    state: AtomicU8,
}

impl SessionFlags {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            state: AtomicU8::new(SessionState::Opened.as_u8()),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Move `Opened` to `Capturing`; later states are left alone.
    pub(crate) fn mark_capturing(&self) {
        let _ = self.state.compare_exchange(
            SessionState::Opened.as_u8(),
            SessionState::Capturing.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// The source stopped on its own: deactivate and mark it `Ended` unless
    /// removal has already started.
    pub(crate) fn end(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match SessionState::from_u8(current) {
                    SessionState::Opened | SessionState::Capturing => {
                        Some(SessionState::Ended.as_u8())
                    }
                    _ => None,
                }
            });
        self.deactivate();
    }
}

/// The three frame queues of a source.
#[derive(Clone)]
pub struct SessionQueues {
    pub raw_display: DropOldestQueue<Arc<Frame>>,
    pub raw_inference: DropOldestQueue<Arc<Frame>>,
    pub annotated: DropOldestQueue<Arc<Frame>>,
}

impl SessionQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            raw_display: DropOldestQueue::new("raw_display", capacity),
            raw_inference: DropOldestQueue::new("raw_inference", capacity),
            annotated: DropOldestQueue::new("annotated", capacity),
        }
    }

    pub fn drain_all(&self) -> usize {
        self.raw_display.drain() + self.raw_inference.drain() + self.annotated.drain()
    }
}

/// Summary of a running source.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub name: String,
    pub uri: String,
    pub live: bool,
    pub active: bool,
    pub state: SessionState,
    pub frame_period_ms: Option<f64>,
}

/// One opened source with its worker threads.
pub struct SourceSession {
    pub(crate) id: String,
    pub(crate) display_name: String,
    pub(crate) uri: String,
    pub(crate) playback: Playback,
    pub(crate) frame_period: Option<Duration>,
    pub(crate) flags: Arc<SessionFlags>,
    pub(crate) handle: Arc<Mutex<CaptureHandle>>,
    pub(crate) queues: SessionQueues,
    pub(crate) capture: Option<thread::JoinHandle<()>>,
    pub(crate) inference: Option<thread::JoinHandle<()>>,
}

impl SourceSession {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn is_active(&self) -> bool {
        self.flags.is_active()
    }

    pub fn state(&self) -> SessionState {
        self.flags.state()
    }

    pub fn queues(&self) -> &SessionQueues {
        &self.queues
    }

    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            id: self.id.clone(),
            name: self.display_name.clone(),
            uri: self.uri.clone(),
            live: self.playback == Playback::Live,
            active: self.is_active(),
            state: self.state(),
            frame_period_ms: self.frame_period.map(|p| p.as_secs_f64() * 1000.0),
        }
    }

    /// Deactivate, join both workers within `timeout`, release the capture
    /// handle and drain the queues. Never blocks longer than `timeout` on the
    /// workers.
    pub(crate) fn stop(&mut self, timeout: Duration) {
        self.flags.set_state(SessionState::Removing);
        self.flags.deactivate();

        let deadline = Instant::now() + timeout;
        for (stage, handle) in [("capture", self.capture.take()), ("inference", self.inference.take())] {
            if let Some(handle) = handle {
                if !join_until(handle, deadline) {
                    warn!(source = %self.id, "{stage} thread did not stop in {timeout:?}; detaching");
                }
            }
        }

        // A capture thread stuck in a blocking read still holds the lock; it
        // releases the handle itself when the read returns.
        match self.handle.try_lock() {
            Ok(mut handle) => handle.release(),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner().release(),
            Err(std::sync::TryLockError::WouldBlock) => {
                warn!(source = %self.id, "capture handle busy; release deferred to capture thread")
            }
        }
        self.queues.drain_all();
        self.flags.set_state(SessionState::Released);
    }
}

/// Join `handle` if it finishes before `deadline`. Returns `false` when the
/// thread was left running.
pub(crate) fn join_until(handle: thread::JoinHandle<()>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    if handle.join().is_err() {
        warn!("worker thread panicked");
    }
    true
}

pub(crate) fn lock_handle(handle: &Mutex<CaptureHandle>) -> std::sync::MutexGuard<'_, CaptureHandle> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}
