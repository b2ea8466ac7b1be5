//! The virtual clock and its time-advance machinery.
//!
//! A [`FakeClock`] owns the current simulated time, the due-time index, and
//! the monotonic id source. Constructing one installs it as the process's
//! ambient time source (at most one may be installed at a time); restoring
//! it puts the captured bindings back. Time only moves when a caller asks
//! it to, via `set_now`/`tick`/`next`/`run_all`, and every due callback
//! runs synchronously inside that call, in (due timestamp, schedule order)
//! order.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::ambient::{self, TimeSource};
use crate::error::{ClockError, Result};
use crate::queue::{TimerCallback, TimerId, TimerQueue};

/// Start time accepted by [`FakeClockOptions`].
#[derive(Debug, Clone, Copy)]
pub enum StartTime {
    /// Milliseconds since the Unix epoch.
    Millis(u64),
    /// A wall-clock instant; must not predate the Unix epoch.
    System(SystemTime),
}

impl From<u64> for StartTime {
    fn from(ms: u64) -> Self {
        StartTime::Millis(ms)
    }
}

impl From<SystemTime> for StartTime {
    fn from(time: SystemTime) -> Self {
        StartTime::System(time)
    }
}

/// Construction options for [`FakeClock`].
#[derive(Debug, Clone, Copy)]
pub struct FakeClockOptions {
    /// Initial virtual time. Defaults to the real time at construction.
    pub start: Option<StartTime>,
    /// Virtual milliseconds gained per real millisecond while installed.
    /// Zero (the default) disables auto-advance; a non-zero rate needs a
    /// running tokio runtime to host the advance task.
    pub advance_rate: f64,
    /// How often, in real milliseconds, the auto-advance task wakes.
    pub advance_frequency_ms: u64,
}

impl Default for FakeClockOptions {
    fn default() -> Self {
        Self {
            start: None,
            advance_rate: 0.0,
            advance_frequency_ms: 10,
        }
    }
}

pub(crate) struct ClockCore {
    start: u64,
    now: u64,
    queue: TimerQueue,
    next_id: u64,
    installed: bool,
    captured: Option<ambient::CapturedBinding>,
    auto_advance: Option<tokio::task::JoinHandle<()>>,
}

/// The installed virtual clock.
///
/// The handle is the owner of the installed state: it is not cloneable, and
/// dropping it restores the ambient bindings if [`restore`](Self::restore)
/// was not called explicitly. Callbacks and other consumers reach the
/// installed clock through the [`ambient`] capability set instead of
/// holding a reference to this handle.
pub struct FakeClock {
    core: Arc<Mutex<ClockCore>>,
}

impl FakeClock {
    /// Installs a virtual clock starting at the current real time.
    pub fn install() -> Result<Self> {
        Self::with_options(FakeClockOptions::default())
    }

    /// Installs a virtual clock starting at `start_ms` since the Unix
    /// epoch.
    pub fn starting_at(start_ms: u64) -> Result<Self> {
        Self::with_options(FakeClockOptions {
            start: Some(StartTime::Millis(start_ms)),
            ..FakeClockOptions::default()
        })
    }

    pub fn with_options(options: FakeClockOptions) -> Result<Self> {
        if !options.advance_rate.is_finite() || options.advance_rate < 0.0 {
            return Err(ClockError::InvalidOptions(
                "advance rate must be finite and non-negative",
            ));
        }
        let auto_advance = options.advance_rate > 0.0;
        let step_ms = (options.advance_rate * options.advance_frequency_ms as f64).round() as u64;
        if auto_advance && options.advance_frequency_ms == 0 {
            return Err(ClockError::InvalidOptions(
                "advance frequency must be at least one millisecond",
            ));
        }
        if auto_advance && step_ms == 0 {
            return Err(ClockError::InvalidOptions(
                "auto-advance step rounds to zero milliseconds",
            ));
        }

        let start = match options.start {
            None => system_now_ms()?,
            Some(StartTime::Millis(ms)) => ms,
            Some(StartTime::System(time)) => time
                .duration_since(UNIX_EPOCH)
                .map_err(|_| ClockError::InvalidStart)?
                .as_millis() as u64,
        };

        let core = Arc::new(Mutex::new(ClockCore {
            start,
            now: start,
            queue: TimerQueue::new(),
            next_id: 1,
            installed: true,
            captured: None,
            auto_advance: None,
        }));

        let source: Arc<dyn TimeSource> = Arc::new(VirtualTimeSource {
            core: Arc::clone(&core),
        });
        let captured = ambient::install(source)?;
        core.lock().unwrap().captured = Some(captured);

        let clock = FakeClock { core };
        if auto_advance {
            clock.spawn_auto_advance(step_ms, options.advance_frequency_ms);
        }
        tracing::debug!(start, "virtual clock installed");
        Ok(clock)
    }

    /// The virtual time captured at construction.
    pub fn start(&self) -> u64 {
        self.core.lock().unwrap().start
    }

    /// Current virtual time in milliseconds.
    pub fn now(&self) -> u64 {
        self.core.lock().unwrap().now
    }

    /// Live (scheduled, not yet fired or cancelled) timer count.
    pub fn pending(&self) -> usize {
        self.core.lock().unwrap().queue.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.core.lock().unwrap().queue.is_empty()
    }

    /// Moves virtual time forward to `value`, firing every due timer on
    /// the way.
    ///
    /// Timers fire in ascending due order, FIFO among equal dues; each
    /// callback observes `now()` equal to its own due timestamp, and
    /// timers it schedules join the live index, firing within this same
    /// call if they come due by `value`. A panicking callback propagates
    /// immediately: time stays at the panicking timer's due and the
    /// remaining due timers wait for the next advance call.
    pub fn set_now(&self, value: u64) -> Result<()> {
        advance_to(&self.core, value)
    }

    /// Advances virtual time by `ms`.
    ///
    /// # Panics
    ///
    /// Panics if advancing would overflow `u64` milliseconds.
    pub fn tick(&self, ms: u64) -> Result<()> {
        let target = {
            let core = self.core.lock().unwrap();
            if !core.installed {
                return Err(ClockError::NotInstalled);
            }
            core.now
                .checked_add(ms)
                .expect("virtual clock overflowed u64::MAX")
        };
        advance_to(&self.core, target)
    }

    /// Yields once to the async executor, letting already-queued task
    /// wakeups run, then advances by `ms`.
    pub async fn tick_async(&self, ms: u64) -> Result<()> {
        tokio::task::yield_now().await;
        self.tick(ms)
    }

    /// Jumps to the next pending due timestamp, firing everything due at
    /// that instant. Returns `false`, leaving time unchanged, when no
    /// timer is pending.
    pub fn next(&self) -> Result<bool> {
        let target = {
            let mut core = self.core.lock().unwrap();
            if !core.installed {
                return Err(ClockError::NotInstalled);
            }
            match core.queue.peek_min_due() {
                Some(due) => due.max(core.now),
                None => return Ok(false),
            }
        };
        advance_to(&self.core, target)?;
        Ok(true)
    }

    /// Yields once to the async executor, then [`next`](Self::next).
    pub async fn next_async(&self) -> Result<bool> {
        tokio::task::yield_now().await;
        self.next()
    }

    /// Fires pending timers in due order until none remain.
    ///
    /// A repeating timer re-arms itself forever, so this never returns
    /// while one is armed; cancel repeating timers first.
    pub fn run_all(&self) -> Result<()> {
        while self.next()? {}
        Ok(())
    }

    /// [`run_all`](Self::run_all) with a yield to the async executor
    /// between rounds. The same repeating-timer obligation applies.
    pub async fn run_all_async(&self) -> Result<()> {
        loop {
            tokio::task::yield_now().await;
            if !self.next()? {
                return Ok(());
            }
        }
    }

    /// Schedules `callback` to fire once, `delay_ms` of virtual time from
    /// now.
    pub fn schedule_once(
        &self,
        delay_ms: u64,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerId> {
        self.require_installed()?;
        Ok(schedule_timer(&self.core, delay_ms, false, Box::new(callback)))
    }

    /// Schedules `callback` to fire every `delay_ms` of virtual time. The
    /// delay is clamped to at least one millisecond so a repeating timer
    /// never fires twice at the same instant.
    pub fn schedule_repeating(
        &self,
        delay_ms: u64,
        callback: impl FnMut() + Send + 'static,
    ) -> Result<TimerId> {
        self.require_installed()?;
        Ok(schedule_timer(&self.core, delay_ms, true, Box::new(callback)))
    }

    /// Cancels a pending timer. Unknown, already-fired, and
    /// already-cancelled ids are a silent no-op.
    pub fn cancel(&self, id: TimerId) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if !core.installed {
            return Err(ClockError::NotInstalled);
        }
        if core.queue.cancel(id) {
            tracing::debug!(id = id.as_u64(), "timer cancelled");
        }
        Ok(())
    }

    /// Reinstates the ambient time bindings captured at construction and
    /// stops the auto-advance task. The clock refuses all further
    /// scheduling and time-advance operations.
    pub fn restore(&self) -> Result<()> {
        let (captured, task) = {
            let mut core = self.core.lock().unwrap();
            if !core.installed {
                return Err(ClockError::AlreadyRestored);
            }
            core.installed = false;
            (core.captured.take(), core.auto_advance.take())
        };
        if let Some(task) = task {
            task.abort();
        }
        if let Some(captured) = captured {
            ambient::restore(captured);
        }
        tracing::debug!("virtual clock restored");
        Ok(())
    }

    fn require_installed(&self) -> Result<()> {
        if self.core.lock().unwrap().installed {
            Ok(())
        } else {
            Err(ClockError::NotInstalled)
        }
    }

    fn spawn_auto_advance(&self, step_ms: u64, frequency_ms: u64) {
        let weak = Arc::downgrade(&self.core);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(frequency_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(core) = weak.upgrade() else { break };
                let target = {
                    let core = core.lock().unwrap();
                    if !core.installed {
                        break;
                    }
                    core.now.saturating_add(step_ms)
                };
                if advance_to(&core, target).is_err() {
                    break;
                }
            }
        });
        self.core.lock().unwrap().auto_advance = Some(task);
    }
}

impl Drop for FakeClock {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}

fn system_now_ms() -> Result<u64> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| ClockError::InvalidStart)?
        .as_millis() as u64)
}

fn schedule_timer(
    core: &Mutex<ClockCore>,
    delay_ms: u64,
    repeat: bool,
    callback: TimerCallback,
) -> TimerId {
    let mut core = core.lock().unwrap();
    let delay = if repeat { delay_ms.max(1) } else { delay_ms };
    let id = TimerId(core.next_id);
    core.next_id += 1;
    let due = core
        .now
        .checked_add(delay)
        .expect("timer due overflowed u64::MAX");
    core.queue.schedule(id, due, delay, repeat, callback);
    tracing::debug!(id = id.as_u64(), due, delay, repeat, "timer scheduled");
    id
}

/// The core advance loop shared by `set_now`, `tick`, `next`, and the
/// auto-advance task.
///
/// The lock is dropped for the duration of every callback invocation, so
/// callbacks are free to schedule, cancel, and even advance further
/// through the ambient bindings. `now` never moves backward: each fire
/// sets it to at least the fired timer's due, and the final write to
/// `target` is skipped if a nested advance already overshot it.
fn advance_to(core: &Mutex<ClockCore>, target: u64) -> Result<()> {
    {
        let core = core.lock().unwrap();
        if !core.installed {
            return Err(ClockError::NotInstalled);
        }
        if target < core.now {
            return Err(ClockError::TimeMovedBack {
                now: core.now,
                requested: target,
            });
        }
    }

    loop {
        let fired = {
            let mut core = core.lock().unwrap();
            if !core.installed {
                // A callback restored the clock mid-advance.
                return Err(ClockError::NotInstalled);
            }
            match core.queue.pop_due_at_or_before(target) {
                Some(fired) => {
                    core.now = core.now.max(fired.due);
                    Some(fired)
                }
                None => {
                    core.now = core.now.max(target);
                    None
                }
            }
        };

        let Some(fired) = fired else { return Ok(()) };
        tracing::trace!(id = fired.id.as_u64(), due = fired.due, "firing timer");
        if fired.repeat {
            let mut lent = LentCallback {
                core,
                id: fired.id,
                callback: Some(fired.callback),
            };
            lent.invoke();
        } else {
            let mut callback = fired.callback;
            callback();
        }
    }
}

/// Returns a repeating timer's callback to the registry when the
/// invocation ends, panic or not, so the next occurrence can fire.
struct LentCallback<'a> {
    core: &'a Mutex<ClockCore>,
    id: TimerId,
    callback: Option<TimerCallback>,
}

impl LentCallback<'_> {
    fn invoke(&mut self) {
        if let Some(callback) = self.callback.as_mut() {
            callback();
        }
    }
}

impl Drop for LentCallback<'_> {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            if let Ok(mut core) = self.core.lock() {
                core.queue.restore_callback(self.id, callback);
            }
        }
    }
}

/// Scheduler-backed implementation of the ambient capability set,
/// installed for the clock's lifetime.
struct VirtualTimeSource {
    core: Arc<Mutex<ClockCore>>,
}

impl TimeSource for VirtualTimeSource {
    fn now_ms(&self) -> u64 {
        self.core.lock().unwrap().now
    }

    fn schedule_once(&self, delay_ms: u64, callback: TimerCallback) -> TimerId {
        schedule_timer(&self.core, delay_ms, false, callback)
    }

    fn cancel_once(&self, id: TimerId) {
        self.core.lock().unwrap().queue.cancel(id);
    }

    fn schedule_repeating(&self, delay_ms: u64, callback: TimerCallback) -> TimerId {
        schedule_timer(&self.core, delay_ms, true, callback)
    }

    fn cancel_repeating(&self, id: TimerId) {
        self.core.lock().unwrap().queue.cancel(id);
    }

    fn token_after(&self, delay_ms: u64) -> CancellationToken {
        let token = CancellationToken::new();
        let armed = token.clone();
        schedule_timer(&self.core, delay_ms, false, Box::new(move || armed.cancel()));
        token
    }
}
