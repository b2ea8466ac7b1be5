//! Process-wide time-service bindings.
//!
//! Everything outside this crate that needs "what time is it" or "call me
//! in N milliseconds" goes through the [`TimeSource`] capability set
//! instead of reaching for the host primitives directly. The bindings
//! default to [`SystemTimeSource`]; installing a
//! [`FakeClock`](crate::FakeClock) swaps them for scheduler-backed ones and
//! restoring puts the captured originals back. This explicit indirection is
//! the whole trick: no caller code changes between real and virtual time.
//!
//! The binding slot is a single registration point. Nesting is not
//! supported; a second install while one is active is a lifecycle error,
//! enforced by the clock's constructor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::error::ClockError;
use crate::queue::{TimerCallback, TimerId};

/// The ambient time capabilities the host environment consumes: a
/// current-time query, one-shot and repeating scheduling with their
/// cancellations, and a cancellation token that self-cancels after a delay.
pub trait TimeSource: Send + Sync {
    /// Current time in milliseconds since the source's epoch.
    fn now_ms(&self) -> u64;
    /// Invokes `callback` once after `delay_ms`.
    fn schedule_once(&self, delay_ms: u64, callback: TimerCallback) -> TimerId;
    /// Cancels a one-shot schedule. Unknown ids are ignored.
    fn cancel_once(&self, id: TimerId);
    /// Invokes `callback` every `delay_ms`.
    fn schedule_repeating(&self, delay_ms: u64, callback: TimerCallback) -> TimerId;
    /// Cancels a repeating schedule. Unknown ids are ignored.
    fn cancel_repeating(&self, id: TimerId);
    /// A token that cancels itself after `delay_ms`.
    fn token_after(&self, delay_ms: u64) -> CancellationToken;
}

static BINDING: RwLock<Option<Arc<dyn TimeSource>>> = RwLock::new(None);
static INSTALLED: AtomicBool = AtomicBool::new(false);

fn system_source() -> &'static Arc<dyn TimeSource> {
    static SYSTEM: OnceLock<Arc<dyn TimeSource>> = OnceLock::new();
    SYSTEM.get_or_init(|| Arc::new(SystemTimeSource::new()))
}

/// The currently bound time source.
pub fn time_source() -> Arc<dyn TimeSource> {
    let binding = BINDING.read().unwrap();
    binding
        .as_ref()
        .cloned()
        .unwrap_or_else(|| system_source().clone())
}

/// Current ambient time in milliseconds.
pub fn now_ms() -> u64 {
    time_source().now_ms()
}

/// Schedules `callback` once after `delay_ms` through the ambient binding.
pub fn schedule_once(delay_ms: u64, callback: impl FnMut() + Send + 'static) -> TimerId {
    time_source().schedule_once(delay_ms, Box::new(callback))
}

pub fn cancel_once(id: TimerId) {
    time_source().cancel_once(id);
}

/// Schedules `callback` every `delay_ms` through the ambient binding.
pub fn schedule_repeating(delay_ms: u64, callback: impl FnMut() + Send + 'static) -> TimerId {
    time_source().schedule_repeating(delay_ms, Box::new(callback))
}

pub fn cancel_repeating(id: TimerId) {
    time_source().cancel_repeating(id);
}

/// A token that self-cancels after `delay_ms` of ambient time.
pub fn token_after(delay_ms: u64) -> CancellationToken {
    time_source().token_after(delay_ms)
}

/// The previously bound source, held by the installed clock and handed
/// back verbatim on restore.
pub(crate) struct CapturedBinding {
    previous: Option<Arc<dyn TimeSource>>,
}

/// Claims the single installed slot and rebinds the ambient source.
pub(crate) fn install(source: Arc<dyn TimeSource>) -> Result<CapturedBinding, ClockError> {
    if INSTALLED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Err(ClockError::AlreadyInstalled);
    }
    let previous = BINDING.write().unwrap().replace(source);
    tracing::debug!("virtual time source installed");
    Ok(CapturedBinding { previous })
}

/// Reinstates the captured binding and releases the installed slot.
pub(crate) fn restore(captured: CapturedBinding) {
    *BINDING.write().unwrap() = captured.previous;
    INSTALLED.store(false, Ordering::SeqCst);
    tracing::debug!("ambient time source restored");
}

/// The real time source: wall-clock queries plus tokio-backed timers.
///
/// The scheduling capabilities spawn tasks and therefore need a running
/// tokio runtime; the current-time query works anywhere.
pub struct SystemTimeSource {
    inner: Arc<SystemInner>,
}

struct SystemInner {
    next_id: AtomicU64,
    pending: Mutex<HashMap<TimerId, CancellationToken>>,
}

impl SystemTimeSource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SystemInner {
                next_id: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn spawn_timer(&self, delay_ms: u64, mut callback: TimerCallback, repeat: bool) -> TimerId {
        let id = TimerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let stop = CancellationToken::new();
        self.inner.pending.lock().unwrap().insert(id, stop.clone());

        let inner: Weak<SystemInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => callback(),
                }
                if !repeat {
                    break;
                }
            }
            if let Some(inner) = inner.upgrade() {
                inner.pending.lock().unwrap().remove(&id);
            }
        });
        id
    }

    fn cancel(&self, id: TimerId) {
        if let Some(stop) = self.inner.pending.lock().unwrap().remove(&id) {
            stop.cancel();
        }
    }
}

impl Default for SystemTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for SystemTimeSource {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_millis() as u64
    }

    fn schedule_once(&self, delay_ms: u64, callback: TimerCallback) -> TimerId {
        self.spawn_timer(delay_ms, callback, false)
    }

    fn cancel_once(&self, id: TimerId) {
        self.cancel(id);
    }

    fn schedule_repeating(&self, delay_ms: u64, callback: TimerCallback) -> TimerId {
        self.spawn_timer(delay_ms.max(1), callback, true)
    }

    fn cancel_repeating(&self, id: TimerId) {
        self.cancel(id);
    }

    fn token_after(&self, delay_ms: u64) -> CancellationToken {
        let token = CancellationToken::new();
        let armed = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            armed.cancel();
        });
        token
    }
}
