//! Timed-alarm queue with microsecond resolution.
//!
//! Alarms are keyed by absolute fire time on the scheduler's monotonic
//! clock. Alarms sharing a fire time go off in insertion order, and every
//! alarm is removed from the queue before its callback runs, so a callback
//! may freely schedule new alarms.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Callback run when an alarm fires. The typed replacement for a
/// function-pointer-plus-context pair: captures travel with the closure.
pub type AlarmFn = Box<dyn FnOnce()>;

/// Opaque handle to a scheduled alarm, used to cancel it before it fires.
///
/// Tokens are non-zero, allocated from a monotone counter, and unique among
/// live alarms. A token becomes invalid once its alarm fires or is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskToken(u64);

impl TaskToken {
    /// Raw counter value, mainly useful for diagnostics.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Queue position: fire time first, then insertion order for ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct AlarmKey {
    fire_at_us: u64,
    seq: u64,
}

struct Alarm {
    token: TaskToken,
    callback: AlarmFn,
}

pub(crate) struct DelayQueue {
    epoch: Instant,
    alarms: BTreeMap<AlarmKey, Alarm>,
    index: HashMap<TaskToken, AlarmKey>,
    token_counter: u64,
    seq_counter: u64,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            alarms: BTreeMap::new(),
            index: HashMap::new(),
            token_counter: 0,
            seq_counter: 0,
        }
    }

    /// Microseconds elapsed on the queue's clock.
    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Fresh non-zero token. The counter wraps around zero rather than
    /// through it.
    fn next_token(&mut self) -> TaskToken {
        self.token_counter = self.token_counter.wrapping_add(1);
        if self.token_counter == 0 {
            self.token_counter = 1;
        }
        TaskToken(self.token_counter)
    }

    /// Schedules `callback` to fire `delay` from now and returns its token.
    pub fn add(&mut self, delay: Duration, callback: AlarmFn) -> TaskToken {
        let now_us = self.now_us();
        self.add_at(now_us.saturating_add(delay.as_micros() as u64), callback)
    }

    fn add_at(&mut self, fire_at_us: u64, callback: AlarmFn) -> TaskToken {
        let token = self.next_token();
        self.seq_counter += 1;
        let key = AlarmKey {
            fire_at_us,
            seq: self.seq_counter,
        };
        self.alarms.insert(key, Alarm { token, callback });
        self.index.insert(token, key);
        token
    }

    /// Removes the alarm identified by `token`, returning its callback so
    /// the caller controls when captured state is released. Unknown tokens
    /// (never issued, already fired, already removed) are a silent no-op.
    pub fn remove(&mut self, token: TaskToken) -> Option<AlarmFn> {
        let key = self.index.remove(&token)?;
        self.alarms.remove(&key).map(|alarm| alarm.callback)
    }

    /// Time until the earliest alarm: zero if one is overdue, `None` if the
    /// queue is empty.
    pub fn time_to_next_alarm(&self, now_us: u64) -> Option<Duration> {
        let (key, _) = self.alarms.first_key_value()?;
        Some(Duration::from_micros(key.fire_at_us.saturating_sub(now_us)))
    }

    /// Removes and returns the earliest alarm if it is due at `now_us`.
    ///
    /// The event loop drains due alarms by calling this in a loop with a
    /// freshly read clock each iteration, so alarms that come due while an
    /// earlier callback runs still fire in the same sweep. The alarm is out
    /// of the queue before the caller invokes it.
    pub fn pop_due(&mut self, now_us: u64) -> Option<AlarmFn> {
        let (key, _) = self.alarms.first_key_value()?;
        if key.fire_at_us > now_us {
            return None;
        }
        let key = *key;
        let alarm = self.alarms.remove(&key)?;
        self.index.remove(&alarm.token);
        Some(alarm.callback)
    }

    #[cfg(test)]
    fn set_token_counter(&mut self, value: u64) {
        self.token_counter = value;
    }
}
