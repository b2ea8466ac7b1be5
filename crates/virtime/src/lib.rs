//! Deterministic virtual time: a fake clock, a due-time timer scheduler,
//! and the ambient time-service bindings they virtualize.
//!
//! # Design
//!
//! The [`FakeClock`] decouples simulated time from real elapsed time. Time
//! moves only when a caller advances it (`tick`, `set_now`, `next`,
//! `run_all`), and every timer due along the way fires synchronously
//! inside that call: ascending by due timestamp, FIFO among timers sharing
//! one, with each callback observing the virtual time it fired at.
//!
//! Consumers never talk to the clock directly. They call the [`ambient`]
//! capability set (current time, one-shot and repeating schedules, their
//! cancellations, delay-armed cancellation tokens), which is backed by the
//! real host primitives until a `FakeClock` installs itself and after it
//! restores. At most one clock is installed at a time; the handle restores
//! on drop if not restored explicitly.
//!
//! The `*_async` advance variants yield once to the executor before
//! advancing, so task wakeups queued by earlier callbacks run in between
//! virtual-time jumps, deterministically. [`delay`] waits in *real* time
//! for the cases where a test has to meet the world as it is.

pub mod ambient;
mod clock;
mod delay;
mod error;
mod queue;

pub use ambient::{SystemTimeSource, TimeSource};
pub use clock::{FakeClock, FakeClockOptions, StartTime};
pub use delay::delay;
pub use error::{ClockError, DelayError, Result};
pub use queue::{TimerCallback, TimerId};
pub use tokio_util::sync::CancellationToken;
