//! Millisecond interval timers with deferred add/remove.
//!
//! The scheduler is generic over the context handed to callbacks, so the
//! reactor can give its timers `&mut Reactor` while unit tests use a plain
//! counter.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};
use once_cell::sync::Lazy;
use pollnet_config::{log_timer_debug, log_timer_trace};

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);
static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic milliseconds since the first call in this process.
pub fn now_millis() -> u64 {
    EPOCH.elapsed().as_millis() as u64
}

/// Process-unique, monotonically increasing timer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Passed to a timer callback on each fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTick {
    pub id: TimerId,
    /// Fires so far, including this one.
    pub fires: u64,
    /// Repeat limit; negative repeats forever.
    pub max_repeats: i64,
    pub now_ms: u64,
}

/// Return `false` to stop the timer.
pub type TimerCallback<C> = Box<dyn FnMut(&mut C, &TimerTick) -> bool>;

struct Timer<C> {
    interval_ms: u64,
    anchor: Option<u64>,
    max_repeats: i64,
    fires: u64,
    callback: TimerCallback<C>,
}

impl<C> Timer<C> {
    fn exhausted(&self) -> bool {
        self.max_repeats >= 0 && self.fires >= self.max_repeats as u64
    }
}

pub struct TimerScheduler<C> {
    pending_add: IndexMap<TimerId, Timer<C>>,
    active: IndexMap<TimerId, Timer<C>>,
    pending_remove: IndexSet<TimerId>,
}

impl<C> Default for TimerScheduler<C> {
    fn default() -> Self {
        Self {
            pending_add: IndexMap::new(),
            active: IndexMap::new(),
            pending_remove: IndexSet::new(),
        }
    }
}

impl<C> fmt::Debug for TimerScheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerScheduler")
            .field("pending_add", &self.pending_add.len())
            .field("active", &self.active.len())
            .field("pending_remove", &self.pending_remove.len())
            .finish()
    }
}

impl<C> TimerScheduler<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a timer; it starts counting on the first tick after this call.
    pub fn add<F>(&mut self, interval: Duration, max_repeats: i64, callback: F) -> TimerId
    where
        F: FnMut(&mut C, &TimerTick) -> bool + 'static,
    {
        let id = TimerId(NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed));
        self.pending_add.insert(
            id,
            Timer {
                interval_ms: interval.as_millis() as u64,
                anchor: None,
                max_repeats,
                fires: 0,
                callback: Box::new(callback),
            },
        );
        log_timer_debug!(
            id = id.0,
            interval_ms = interval.as_millis() as u64,
            max_repeats,
            "Timer added"
        );
        id
    }

    /// Stage a timer for removal. Unknown ids are ignored.
    pub fn remove(&mut self, id: TimerId) {
        if self.pending_add.shift_remove(&id).is_some() {
            return;
        }
        self.pending_remove.insert(id);
    }

    /// True if the timer is staged or active and not staged for removal.
    pub fn contains(&self, id: TimerId) -> bool {
        self.pending_add.contains_key(&id)
            || (self.active.contains_key(&id) && !self.pending_remove.contains(&id))
    }

    pub fn len(&self) -> usize {
        self.active.len() + self.pending_add.len()
            - self
                .pending_remove
                .iter()
                .filter(|id| self.active.contains_key(*id))
                .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn commit(&mut self) {
        for (id, timer) in self.pending_add.drain(..) {
            self.active.insert(id, timer);
        }
        for id in self.pending_remove.drain(..) {
            if self.active.shift_remove(&id).is_some() {
                log_timer_debug!(id = id.0, "Timer removed");
            }
        }
    }

    /// Commit staged changes and take the active timers out for firing.
    ///
    /// Callbacks run against the returned set while `self` stays free for
    /// the context to stage new adds and removes.
    pub fn detach(&mut self) -> DueTimers<C> {
        self.commit();
        DueTimers {
            timers: std::mem::take(&mut self.active),
            stopped: Vec::new(),
        }
    }

    /// Put fired timers back and stage the ones that stopped.
    pub fn attach(&mut self, due: DueTimers<C>) {
        let DueTimers { timers, stopped } = due;
        let added_meanwhile = std::mem::replace(&mut self.active, timers);
        self.active.extend(added_meanwhile);
        for id in stopped {
            self.remove(id);
        }
    }

    /// Commit, then fire every due timer against `ctx`.
    pub fn tick(&mut self, now_ms: u64, ctx: &mut C) {
        let mut due = self.detach();
        due.fire(now_ms, ctx);
        self.attach(due);
    }
}

/// Active timers detached from their scheduler for one tick.
pub struct DueTimers<C> {
    timers: IndexMap<TimerId, Timer<C>>,
    stopped: Vec<TimerId>,
}

impl<C> DueTimers<C> {
    /// Fire every timer whose interval has elapsed since its anchor.
    pub fn fire(&mut self, now_ms: u64, ctx: &mut C) {
        for (&id, timer) in self.timers.iter_mut() {
            let anchor = match timer.anchor {
                Some(anchor) if anchor <= now_ms => anchor,
                _ => {
                    timer.anchor = Some(now_ms);
                    now_ms
                }
            };
            if now_ms - anchor < timer.interval_ms {
                continue;
            }
            timer.anchor = Some(now_ms);

            if timer.exhausted() {
                self.stopped.push(id);
                continue;
            }
            timer.fires += 1;
            let tick = TimerTick {
                id,
                fires: timer.fires,
                max_repeats: timer.max_repeats,
                now_ms,
            };
            log_timer_trace!(id = id.0, fires = timer.fires, "Timer fired");
            let keep = (timer.callback)(ctx, &tick);
            if !keep || timer.exhausted() {
                self.stopped.push(id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Log {
        fired: Vec<(TimerId, u64)>,
    }

    fn recorder(keep: bool) -> impl FnMut(&mut Log, &TimerTick) -> bool {
        move |log: &mut Log, tick: &TimerTick| {
            log.fired.push((tick.id, tick.now_ms));
            keep
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut sched: TimerScheduler<Log> = TimerScheduler::new();
        let a = sched.add(Duration::from_millis(10), -1, recorder(true));
        let b = sched.add(Duration::from_millis(10), -1, recorder(true));
        assert!(b > a);
    }

    #[test]
    fn test_first_interval_measured_from_first_tick() {
        let mut sched = TimerScheduler::new();
        let mut log = Log::default();
        let id = sched.add(Duration::from_millis(100), -1, recorder(true));

        sched.tick(5_000, &mut log);
        assert!(log.fired.is_empty());
        sched.tick(5_099, &mut log);
        assert!(log.fired.is_empty());
        sched.tick(5_100, &mut log);
        assert_eq!(log.fired, vec![(id, 5_100)]);

        // Anchor moved to the fire time
        sched.tick(5_150, &mut log);
        assert_eq!(log.fired.len(), 1);
        sched.tick(5_200, &mut log);
        assert_eq!(log.fired.len(), 2);
    }

    #[test]
    fn test_max_repeats_then_removed() {
        let mut sched = TimerScheduler::new();
        let mut log = Log::default();
        let id = sched.add(Duration::from_millis(10), 3, recorder(true));

        let mut now = 0;
        for _ in 0..10 {
            sched.tick(now, &mut log);
            now += 10;
        }
        assert_eq!(log.fired.len(), 3);
        assert!(!sched.contains(id));

        sched.tick(now + 1_000, &mut log);
        assert_eq!(log.fired.len(), 3);
        assert!(sched.is_empty());
    }

    #[test]
    fn test_zero_repeats_never_fires() {
        let mut sched = TimerScheduler::new();
        let mut log = Log::default();
        sched.add(Duration::ZERO, 0, recorder(true));
        sched.tick(0, &mut log);
        sched.tick(1, &mut log);
        assert!(log.fired.is_empty());
        assert!(sched.is_empty());
    }

    #[test]
    fn test_callback_false_stops() {
        let mut sched = TimerScheduler::new();
        let mut log = Log::default();
        let id = sched.add(Duration::from_millis(1), -1, recorder(false));
        sched.tick(0, &mut log);
        sched.tick(1, &mut log);
        sched.tick(2, &mut log);
        sched.tick(3, &mut log);
        assert_eq!(log.fired, vec![(id, 1)]);
        assert!(!sched.contains(id));
    }

    #[test]
    fn test_remove_before_commit() {
        let mut sched = TimerScheduler::new();
        let mut log = Log::default();
        let id = sched.add(Duration::ZERO, -1, recorder(true));
        sched.remove(id);
        sched.tick(0, &mut log);
        assert!(log.fired.is_empty());
        assert!(sched.is_empty());
    }

    #[test]
    fn test_remove_active_takes_effect_next_tick() {
        let mut sched = TimerScheduler::new();
        let mut log = Log::default();
        let id = sched.add(Duration::ZERO, -1, recorder(true));
        sched.tick(0, &mut log);
        assert_eq!(log.fired.len(), 1);

        sched.remove(id);
        assert!(!sched.contains(id));
        sched.tick(1, &mut log);
        assert_eq!(log.fired.len(), 1);
    }

    #[test]
    fn test_clock_going_backwards_reanchors() {
        let mut sched = TimerScheduler::new();
        let mut log = Log::default();
        sched.add(Duration::from_millis(50), -1, recorder(true));
        sched.tick(1_000, &mut log);
        sched.tick(10, &mut log);
        sched.tick(59, &mut log);
        assert!(log.fired.is_empty());
        sched.tick(60, &mut log);
        assert_eq!(log.fired.len(), 1);
    }

    #[test]
    fn test_detach_keeps_staging_available() {
        let mut sched: TimerScheduler<Log> = TimerScheduler::new();
        let mut log = Log::default();
        let first = sched.add(Duration::ZERO, 1, recorder(true));

        let mut due = sched.detach();
        assert_eq!(due.len(), 1);
        // Added while the active set is detached: staged, not fired this tick
        let second = sched.add(Duration::ZERO, -1, recorder(true));
        due.fire(0, &mut log);
        sched.attach(due);

        assert_eq!(log.fired, vec![(first, 0)]);
        assert!(sched.contains(second));
        assert!(!sched.contains(first));

        sched.tick(1, &mut log);
        assert_eq!(log.fired, vec![(first, 0), (second, 1)]);
    }

    #[test]
    fn test_now_millis_is_monotonic() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
    }
}
