//! Monotonic-tick timers and the retry backoff policy.

use std::rc::Weak;

use crate::runtime::slab::Handle;
use crate::runtime::Runtime;

/// A timer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(pub(crate) Handle);

impl TimerId {
	pub const NULL: TimerId = TimerId(Handle::NULL);
}

impl Default for TimerId {
	fn default() -> Self {
		TimerId::NULL
	}
}

pub(crate) struct TimerEntry {
	/// Absolute expiry time in microseconds, or `None` while disarmed.
	pub expires: Option<u64>,
	/// Owner, held weakly: a timer must never fire on a freed object.
	pub owner: Weak<std::cell::RefCell<dyn crate::xfer::Object>>,
}

pub const MICROS_PER_SEC: u64 = 1_000_000;

/// Default initial retry interval.
const RETRY_MIN_TIMEOUT: u64 = MICROS_PER_SEC / 4;
/// Default backoff ceiling.
const RETRY_MAX_TIMEOUT: u64 = 10 * MICROS_PER_SEC;

/// Exponential-backoff policy wrapped around a single-shot timer.
///
/// The owner decides what expiry means; `expired()` only advances the
/// backoff state and reports whether the retry budget is exhausted.
#[derive(Debug)]
pub struct RetryTimer {
	id: TimerId,
	min_timeout: u64,
	max_timeout: u64,
	timeout: u64,
	count: u32,
	max_retries: u32,
}

impl RetryTimer {
	pub fn new(id: TimerId, max_retries: u32) -> Self {
		RetryTimer {
			id,
			min_timeout: RETRY_MIN_TIMEOUT,
			max_timeout: RETRY_MAX_TIMEOUT,
			timeout: RETRY_MIN_TIMEOUT,
			count: 0,
			max_retries,
		}
	}

	pub fn id(&self) -> TimerId {
		self.id
	}

	/// Whether `timer` is this timer.
	pub fn is(&self, timer: TimerId) -> bool {
		self.id == timer
	}

	pub fn running(&self, rt: &Runtime) -> bool {
		rt.timer_running(self.id)
	}

	/// (Re)arm with the current backoff interval.
	pub fn start(&mut self, rt: &mut Runtime) {
		rt.timer_arm(self.id, self.timeout);
	}

	/// Arm with an explicit interval, bypassing the backoff ladder.
	pub fn start_fixed(&mut self, rt: &mut Runtime, timeout: u64) {
		self.timeout = timeout;
		rt.timer_arm(self.id, timeout);
	}

	pub fn stop(&mut self, rt: &mut Runtime) {
		rt.timer_disarm(self.id);
	}

	/// Restore the initial interval and retry budget.
	pub fn reset(&mut self) {
		self.timeout = self.min_timeout;
		self.count = 0;
	}

	/// Advance the backoff state after an expiry.
	///
	/// Returns `true` once the retry budget is exhausted ("failure"
	/// expiry); the owner chooses between retrying and giving up.
	pub fn expired(&mut self) -> bool {
		self.count += 1;
		self.timeout = (self.timeout * 2).min(self.max_timeout);
		self.count > self.max_retries
	}
}
